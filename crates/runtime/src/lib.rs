//! WASM execution layer for wasqlite.
//!
//! This crate provides the narrow runtime capability the bridge needs on top
//! of wasmtime:
//!
//! - Compiling guest modules once and caching them by content hash
//!   ([`ModuleCache`]).
//! - Invoking exported guest functions through a uniform integer calling
//!   convention ([`call::invoke`]).
//! - Reading and writing the guest's linear memory at explicit byte offsets
//!   ([`memory`]).
//!
//! Everything SQLite-specific (arenas, handles, the virtual-table protocol)
//! lives in the `wasqlite` crate; this layer knows nothing about the guest
//! beyond "a module with exports and a linear memory".

pub mod call;
pub mod memory;
pub mod module;

pub use call::{exported_func, exported_memory, invoke};
pub use module::{CompiledModule, ModuleCache};

use thiserror::Error;

/// Errors that can occur in the WASM execution layer.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Failed to compile WASM module: {0}")]
    Compilation(String),

    #[error("Failed to instantiate WASM module: {0}")]
    Instantiation(String),

    #[error("Failed to call WASM function {name}: {message}")]
    Execution { name: String, message: String },

    #[error("WASM function not found: {0}")]
    FunctionNotFound(String),

    #[error("Memory export not found")]
    MissingMemory,

    #[error("Memory access out of bounds: offset {offset}, len {len}")]
    OutOfBounds { offset: u64, len: u64 },

    #[error("Unterminated string at offset {offset} within {max} bytes")]
    UnterminatedString { offset: u32, max: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<anyhow::Error> for RuntimeError {
    fn from(e: anyhow::Error) -> Self {
        RuntimeError::Execution {
            name: String::new(),
            message: e.to_string(),
        }
    }
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
