//! Configuration module.
//!
//! This module defines the command-line interface (CLI) for the linker
//! using `clap`, including the host-configuration flags that shape the
//! synthesized service objects.

use clap::Parser;
use std::path::PathBuf;

use crate::linker::LinkOptions;

/// A cross-fragment linker for compiled Wasm-GC style modules.
///
/// Combines the per-file fragments produced by the lowering stage into a
/// single module: symbols are resolved, literal pools merged, recursive
/// type groups computed, and the module's service code synthesized.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Input fragment files, in link order
    #[arg(required = true, num_args = 1..)]
    pub inputs: Vec<PathBuf>,

    /// Output file
    #[arg(short, long, default_value = "module.json", help = "Path to the linked module")]
    pub output: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", help = "Set the logging level")]
    pub log_level: String,

    /// Model exceptions as traps and synthesize no exception tag
    #[arg(long)]
    pub trap_exceptions: bool,

    /// Target a JS-like host (imports the foreign exception tag)
    #[arg(long)]
    pub js_host: bool,

    /// Import memory from the given module instead of defining it
    #[arg(long, value_name = "MODULE")]
    pub import_memory: Option<String>,

    /// Skip singleton initialization in `_initialize`
    #[arg(long)]
    pub no_singleton_init: bool,
}

impl Config {
    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            trap_exceptions: self.trap_exceptions,
            js_host: self.js_host,
            import_memory: self.import_memory.clone(),
            init_singletons: !self.no_singleton_init,
        }
    }
}
