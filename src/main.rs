//! Entry point for the wld linker.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap`.
//! 2. Map each input fragment file into memory and deserialize it.
//! 3. Run the link: merge, canonicalize, resolve, pool, synthesize,
//!    group, assemble.
//! 4. Write the linked module.
//!
//! Error handling is done via `anyhow`.

use anyhow::{Context, Result};
use clap::Parser;
use memmap2::Mmap;
use std::fs::File;

use wld::config::Config;
use wld::fragment::Fragment;
use wld::linker;
use wld::writer;

fn main() -> Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    // Map input files into memory; fragment order is the input order and
    // is observable in the output.
    let mut fragments = Vec::with_capacity(config.inputs.len());
    for path in &config.inputs {
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file)? };
        let fragment: Fragment = serde_json::from_slice(&mmap)
            .with_context(|| format!("failed to parse fragment {}", path.display()))?;
        tracing::debug!(path = %path.display(), name = %fragment.name, "loaded fragment");
        fragments.push(fragment);
    }

    let count = fragments.len();
    let module = linker::link(fragments, config.link_options())
        .context("linking failed")?;

    writer::write_module(&config.output, &module)?;

    println!("Linked {} fragments to {}", count, config.output.display());
    Ok(())
}
