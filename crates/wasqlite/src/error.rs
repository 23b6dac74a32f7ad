//! Error taxonomy and result-code translation.
//!
//! Every failure that crosses the guest boundary is translated into
//! [`Error`]; nothing is passed through opaquely. Engine failures keep the
//! exact code, extended code and message text the engine produced, so
//! callers see the diagnostic the engine intended.

use thiserror::Error;
use wasqlite_runtime::RuntimeError;

/// Engine result codes.
///
/// Values are fixed by the engine's public ABI.
pub mod codes {
    pub const OK: u32 = 0;
    pub const ERROR: u32 = 1;
    pub const INTERNAL: u32 = 2;
    pub const PERM: u32 = 3;
    pub const ABORT: u32 = 4;
    pub const BUSY: u32 = 5;
    pub const LOCKED: u32 = 6;
    pub const NOMEM: u32 = 7;
    pub const READONLY: u32 = 8;
    pub const INTERRUPT: u32 = 9;
    pub const IOERR: u32 = 10;
    pub const CORRUPT: u32 = 11;
    pub const NOTFOUND: u32 = 12;
    pub const FULL: u32 = 13;
    pub const CANTOPEN: u32 = 14;
    pub const PROTOCOL: u32 = 15;
    pub const EMPTY: u32 = 16;
    pub const SCHEMA: u32 = 17;
    pub const TOOBIG: u32 = 18;
    pub const CONSTRAINT: u32 = 19;
    pub const MISMATCH: u32 = 20;
    pub const MISUSE: u32 = 21;
    pub const NOLFS: u32 = 22;
    pub const AUTH: u32 = 23;
    pub const FORMAT: u32 = 24;
    pub const RANGE: u32 = 25;
    pub const NOTADB: u32 = 26;
    pub const NOTICE: u32 = 27;
    pub const WARNING: u32 = 28;
    pub const ROW: u32 = 100;
    pub const DONE: u32 = 101;
}

/// Errors surfaced by the bridge.
#[derive(Debug, Error)]
pub enum Error {
    /// A non-success engine result, with its message text preserved.
    #[error("engine error {code}: {message}")]
    Engine {
        code: u32,
        extended_code: u32,
        message: String,
    },

    /// A handle-table miss. Programming-error class: the guest presented an
    /// integer that maps to no live host object.
    #[error("unknown handle {0}")]
    UnknownHandle(u32),

    /// Guest allocation exhaustion (arena backing or persistent allocator).
    #[error("guest allocation failed")]
    OutOfMemory,

    /// A struct-layout assumption violated. Internal-only; caught by layout
    /// tests, never expected at runtime.
    #[error("struct layout mismatch: {0}")]
    LayoutMismatch(&'static str),

    /// An internal-consistency failure, e.g. a callback dispatched for a
    /// capability that was never advertised.
    #[error("internal consistency failure: {0}")]
    Internal(&'static str),

    /// A failure in the WASM execution layer.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl Error {
    /// Construct an engine error with matching primary and extended codes.
    pub fn engine(code: u32, message: impl Into<String>) -> Self {
        Error::Engine {
            code,
            extended_code: code,
            message: message.into(),
        }
    }

    /// The primary result code, as used in the callback return convention.
    pub(crate) fn primary_code(&self) -> u32 {
        match self {
            Error::Engine { code, .. } => code & 0xff,
            Error::OutOfMemory => codes::NOMEM,
            _ => codes::ERROR,
        }
    }

    /// The message text written to engine-visible error-string slots.
    ///
    /// Engine errors surface their original message; everything else uses
    /// the display form.
    pub(crate) fn callback_message(&self) -> String {
        match self {
            Error::Engine { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, Error>;
