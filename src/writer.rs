//! Module writer.
//!
//! The linked module is handed to an external binary serializer; this
//! writer emits the interchange form that serializer consumes.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::ir::Module;

/// Write the linked module to disk.
pub fn write_module(output_path: &Path, module: &Module) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(module).context("failed to serialize module")?;
    fs::write(output_path, &bytes)
        .with_context(|| format!("failed to write {}", output_path.display()))?;
    tracing::info!(
        path = %output_path.display(),
        bytes = bytes.len(),
        "module written"
    );
    Ok(())
}
