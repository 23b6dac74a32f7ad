//! SQLite embedded as a sandboxed WASM module.
//!
//! The engine runs as a memory-isolated guest; the host cannot dereference
//! guest pointers, and every interaction crosses the boundary by copying
//! bytes at explicit offsets and invoking exported functions with integer
//! arguments. This crate is that bridge.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Conn                                │
//! │  ┌────────────┐ ┌────────────┐ ┌─────────────┐               │
//! │  │   Arena    │ │   Handle   │ │    Error    │               │
//! │  │ (scratch)  │ │   Table    │ │ Translator  │               │
//! │  └────────────┘ └────────────┘ └─────────────┘               │
//! │        │              │               │                       │
//! │  ──────┴── call dispatch + memory codec ──────                │
//! │        │                              │                       │
//! │  exported guest functions      callback table                 │
//! │  (open/prepare/step/bind/…)    (vtab ops, functions,          │
//! │                                 collations, destructors)      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each connection owns its own guest instance; calls on one connection
//! are strictly sequential, and callbacks always nest inside an
//! in-progress call. See [`vtab`] for the virtual-table protocol.

mod arena;
mod config;
mod conn;
mod error;
mod func;
mod guest;
mod handle;
mod linker;
mod stmt;
mod value;

pub mod vtab;

#[cfg(test)]
mod testing;

pub use config::{
    Config, OPEN_CREATE, OPEN_MEMORY, OPEN_READONLY, OPEN_READWRITE, OPEN_URI,
};
pub use conn::{Conn, InterruptHandle, Sqlite};
pub use error::{codes, Error, Result};
pub use func::{
    AggregateFunction, ScalarFunction, WindowFunction, DETERMINISTIC, DIRECTONLY, INNOCUOUS,
};
pub use stmt::Stmt;
pub use value::{DataType, Value};
