//! Prepared statements.

use crate::arena;
use crate::conn::Conn;
use crate::error::{codes, Result};
use crate::guest::{self, api, with_arena};
use crate::value::{DataType, Value, TRANSIENT};
use std::cell::Cell;
use tracing::warn;
use wasqlite_runtime::memory;

/// A compiled statement, finalized on drop.
pub struct Stmt<'conn> {
    conn: &'conn Conn,
    raw: u32,
    finalized: Cell<bool>,
}

impl<'conn> Stmt<'conn> {
    pub(crate) fn new(conn: &'conn Conn, raw: u32) -> Self {
        Self {
            conn,
            raw,
            finalized: Cell::new(false),
        }
    }

    /// Evaluate up to the next row. `true` means a row is available for
    /// column reads; `false` means the statement ran to completion.
    pub fn step(&mut self) -> Result<bool> {
        let raw = self.raw;
        self.conn.with_ctx(|ctx| {
            let rc = guest::call(ctx, api::STEP, &[raw as u64])? as u32;
            match rc {
                codes::ROW => Ok(true),
                codes::DONE => Ok(false),
                rc => Err(guest::db_error(ctx, rc)),
            }
        })
    }

    /// Rewind the statement so it can be re-evaluated. Bindings keep their
    /// values.
    pub fn reset(&mut self) -> Result<()> {
        let raw = self.raw;
        self.conn.with_ctx(|ctx| {
            let rc = guest::call(ctx, api::RESET, &[raw as u64])?;
            guest::check(ctx, rc)
        })
    }

    /// Clear all parameter bindings back to null.
    pub fn clear_bindings(&mut self) -> Result<()> {
        let raw = self.raw;
        self.conn.with_ctx(|ctx| {
            let rc = guest::call(ctx, api::CLEAR_BINDINGS, &[raw as u64])?;
            guest::check(ctx, rc)
        })
    }

    /// Bind null to the 1-based parameter `index`.
    pub fn bind_null(&mut self, index: usize) -> Result<()> {
        let raw = self.raw;
        self.conn.with_ctx(|ctx| {
            let rc = guest::call(ctx, api::BIND_NULL, &[raw as u64, index as u64])?;
            guest::check(ctx, rc)
        })
    }

    pub fn bind_i64(&mut self, index: usize, value: i64) -> Result<()> {
        let raw = self.raw;
        self.conn.with_ctx(|ctx| {
            let rc = guest::call(
                ctx,
                api::BIND_INT64,
                &[raw as u64, index as u64, value as u64],
            )?;
            guest::check(ctx, rc)
        })
    }

    pub fn bind_f64(&mut self, index: usize, value: f64) -> Result<()> {
        let raw = self.raw;
        self.conn.with_ctx(|ctx| {
            let rc = guest::call(
                ctx,
                api::BIND_DOUBLE,
                &[raw as u64, index as u64, value.to_bits()],
            )?;
            guest::check(ctx, rc)
        })
    }

    /// Bind text. The engine copies the bytes during the call; no guest
    /// allocation outlives it.
    pub fn bind_text(&mut self, index: usize, value: &str) -> Result<()> {
        let raw = self.raw;
        self.conn.with_ctx(|ctx| {
            with_arena(ctx, |ctx| {
                let ptr = arena::bytes(ctx, value.as_bytes())?;
                let rc = guest::call(
                    ctx,
                    api::BIND_TEXT,
                    &[
                        raw as u64,
                        index as u64,
                        ptr as u64,
                        value.len() as u64,
                        TRANSIENT,
                    ],
                )?;
                guest::check(ctx, rc)
            })
        })
    }

    pub fn bind_blob(&mut self, index: usize, value: &[u8]) -> Result<()> {
        let raw = self.raw;
        self.conn.with_ctx(|ctx| {
            with_arena(ctx, |ctx| {
                let ptr = arena::bytes(ctx, value)?;
                let rc = guest::call(
                    ctx,
                    api::BIND_BLOB,
                    &[
                        raw as u64,
                        index as u64,
                        ptr as u64,
                        value.len() as u64,
                        TRANSIENT,
                    ],
                )?;
                guest::check(ctx, rc)
            })
        })
    }

    /// Bind a zero-filled blob of `len` bytes.
    pub fn bind_zeroblob(&mut self, index: usize, len: u64) -> Result<()> {
        let raw = self.raw;
        self.conn.with_ctx(|ctx| {
            let rc = guest::call(ctx, api::BIND_ZEROBLOB, &[raw as u64, index as u64, len])?;
            guest::check(ctx, rc)
        })
    }

    /// Bind any host value.
    pub fn bind_value(&mut self, index: usize, value: &Value) -> Result<()> {
        match value {
            Value::Null => self.bind_null(index),
            Value::Integer(v) => self.bind_i64(index, *v),
            Value::Real(v) => self.bind_f64(index, *v),
            Value::Text(s) => self.bind_text(index, s),
            Value::Blob(b) => self.bind_blob(index, b),
        }
    }

    /// Number of result columns.
    pub fn column_count(&self) -> Result<usize> {
        let raw = self.raw;
        self.conn
            .with_ctx(|ctx| Ok(guest::call(ctx, api::COLUMN_COUNT, &[raw as u64])? as usize))
    }

    /// Name of the 0-based result column `index`.
    pub fn column_name(&self, index: usize) -> Result<String> {
        let raw = self.raw;
        self.conn.with_ctx(|ctx| {
            let ptr = guest::call(ctx, api::COLUMN_NAME, &[raw as u64, index as u64])? as u32;
            if ptr == 0 {
                return Err(crate::error::Error::OutOfMemory);
            }
            guest::read_string(ctx, ptr)
        })
    }

    /// Storage class of column `index` in the current row.
    pub fn column_type(&self, index: usize) -> Result<DataType> {
        let raw = self.raw;
        self.conn.with_ctx(|ctx| {
            Ok(DataType::from(
                guest::call(ctx, api::COLUMN_TYPE, &[raw as u64, index as u64])? as u32,
            ))
        })
    }

    pub fn column_i64(&self, index: usize) -> Result<i64> {
        let raw = self.raw;
        self.conn.with_ctx(|ctx| {
            Ok(guest::call(ctx, api::COLUMN_INT64, &[raw as u64, index as u64])? as i64)
        })
    }

    pub fn column_f64(&self, index: usize) -> Result<f64> {
        let raw = self.raw;
        self.conn.with_ctx(|ctx| {
            Ok(f64::from_bits(guest::call(
                ctx,
                api::COLUMN_DOUBLE,
                &[raw as u64, index as u64],
            )?))
        })
    }

    pub fn column_text(&self, index: usize) -> Result<String> {
        let raw = self.raw;
        self.conn.with_ctx(|ctx| {
            let ptr = guest::call(ctx, api::COLUMN_TEXT, &[raw as u64, index as u64])? as u32;
            let len = guest::call(ctx, api::COLUMN_BYTES, &[raw as u64, index as u64])? as u32;
            let bytes = guest::read_bytes_owned(ctx, ptr, len)?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        })
    }

    pub fn column_blob(&self, index: usize) -> Result<Vec<u8>> {
        let raw = self.raw;
        self.conn.with_ctx(|ctx| {
            let ptr = guest::call(ctx, api::COLUMN_BLOB, &[raw as u64, index as u64])? as u32;
            let len = guest::call(ctx, api::COLUMN_BYTES, &[raw as u64, index as u64])? as u32;
            guest::read_bytes_owned(ctx, ptr, len)
        })
    }

    /// Column `index` as a host value, copied out of the current row.
    pub fn column_value(&self, index: usize) -> Result<Value> {
        Ok(match self.column_type(index)? {
            DataType::Null => Value::Null,
            DataType::Integer => Value::Integer(self.column_i64(index)?),
            DataType::Float => Value::Real(self.column_f64(index)?),
            DataType::Text => Value::Text(self.column_text(index)?),
            DataType::Blob => Value::Blob(self.column_blob(index)?),
        })
    }

    fn finalize_inner(&self) -> Result<()> {
        if self.finalized.replace(true) {
            return Ok(());
        }
        let raw = self.raw;
        self.conn.with_ctx(|ctx| {
            let rc = guest::call(ctx, api::FINALIZE, &[raw as u64])?;
            guest::check(ctx, rc)
        })
    }

    /// Finalize the statement, surfacing the engine's last evaluation
    /// error if there was one.
    pub fn close(self) -> Result<()> {
        self.finalize_inner()
    }
}

impl Drop for Stmt<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.finalize_inner() {
            warn!(error = %e, "failed to finalize statement");
        }
    }
}
