//! Linking errors.
//!
//! Every error here is fatal: linking is deterministic, so retrying the
//! same fragment set cannot succeed where it just failed. The linker
//! aborts on the first error and produces no partial module.

use thiserror::Error;

use crate::symbol::SymbolId;

pub type LinkResult<T> = Result<T, LinkError>;

#[derive(Debug, Error)]
pub enum LinkError {
    /// Two fragments define the same identifier. Indicates a bug in the
    /// lowering stage, not in user code.
    #[error("duplicate definition of symbol {0}")]
    DuplicateDefinition(SymbolId),

    /// A fragment references an identifier no fragment defines.
    #[error("unresolved symbol {0}")]
    UnresolvedSymbol(SymbolId),

    /// A well-known runtime entity (normally supplied by the standard
    /// library fragment) is absent, so service code cannot be synthesized.
    #[error("required runtime entity `{0}` was not defined by any fragment")]
    MissingRuntimeEntity(&'static str),

    /// The target supports at most one exception tag.
    #[error("more than one exception tag surfaced during linking")]
    TooManyExceptionTags,

    /// A should-be-unreachable internal state, e.g. a type that landed in
    /// no recursion group or a resolution cell bound twice.
    #[error("internal linker inconsistency: {0}")]
    Inconsistency(String),
}

impl LinkError {
    pub fn inconsistency(message: impl Into<String>) -> Self {
        LinkError::Inconsistency(message.into())
    }
}
