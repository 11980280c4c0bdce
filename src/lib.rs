//! Cross-fragment module linker.
//!
//! This library provides the core components for the `wld` linker.
//! It is organized into several modules:
//! - `config`: CLI configuration.
//! - `fragment`: the per-file compiled fragment input format.
//! - `ir`: the linkable intermediate representation.
//! - `symbol`: symbol identities and resolution cells.
//! - `linker`: the main linking orchestration.
//! - `writer`: linked-module output.

pub mod config;
pub mod error;
pub mod fragment;
pub mod ir;
pub mod linker;
pub mod symbol;
pub mod writer;

mod canon;
mod groups;
mod pool;
mod service;
