//! Host-native SQL values and their boundary marshaling.
//!
//! Engine-resident values are only valid for the duration of the call that
//! produced them, so trampolines materialize them into [`Value`] before any
//! host callback runs; nothing borrowed from guest memory reaches user code.

use crate::arena;
use crate::error::{Error, Result};
use crate::guest::{self, api, with_arena, ConnState};
use wasmtime::StoreContextMut;

/// Declared storage class of an engine value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataType {
    Integer = 1,
    Float = 2,
    Text = 3,
    Blob = 4,
    Null = 5,
}

impl From<u32> for DataType {
    fn from(v: u32) -> Self {
        match v {
            1 => DataType::Integer,
            2 => DataType::Float,
            3 => DataType::Text,
            4 => DataType::Blob,
            _ => DataType::Null,
        }
    }
}

/// One SQL value, copied to host memory.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    /// The storage class this value carries.
    pub fn datatype(&self) -> DataType {
        match self {
            Value::Null => DataType::Null,
            Value::Integer(_) => DataType::Integer,
            Value::Real(_) => DataType::Float,
            Value::Text(_) => DataType::Text,
            Value::Blob(_) => DataType::Blob,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<Option<Value>> for Value {
    fn from(v: Option<Value>) -> Self {
        v.unwrap_or(Value::Null)
    }
}

/// Destructor sentinel telling the engine to copy text/blob data
/// immediately (the C ABI's transient destructor).
pub(crate) const TRANSIENT: u64 = 0xffff_ffff;

/// Materialize one engine value into host memory.
pub(crate) fn read_value(ctx: &mut StoreContextMut<'_, ConnState>, val: u32) -> Result<Value> {
    let v = val as u64;
    let datatype = DataType::from(guest::call(ctx, api::VALUE_TYPE, &[v])? as u32);
    Ok(match datatype {
        DataType::Null => Value::Null,
        DataType::Integer => Value::Integer(guest::call(ctx, api::VALUE_INT64, &[v])? as i64),
        DataType::Float => Value::Real(f64::from_bits(guest::call(
            ctx,
            api::VALUE_DOUBLE,
            &[v],
        )?)),
        DataType::Text => {
            let ptr = guest::call(ctx, api::VALUE_TEXT, &[v])? as u32;
            let len = guest::call(ctx, api::VALUE_BYTES, &[v])? as u32;
            let bytes = guest::read_bytes_owned(ctx, ptr, len)?;
            Value::Text(String::from_utf8_lossy(&bytes).into_owned())
        }
        DataType::Blob => {
            let ptr = guest::call(ctx, api::VALUE_BLOB, &[v])? as u32;
            let len = guest::call(ctx, api::VALUE_BYTES, &[v])? as u32;
            Value::Blob(guest::read_bytes_owned(ctx, ptr, len)?)
        }
    })
}

/// Materialize an `argc`/`argv` array of engine values.
pub(crate) fn read_values(
    ctx: &mut StoreContextMut<'_, ConnState>,
    argc: u32,
    argv: u32,
) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(argc as usize);
    for i in 0..argc {
        let ptr = {
            let m = guest::mem(ctx)?;
            wasqlite_runtime::memory::read_u32(m, argv + i * 4)?
        };
        values.push(read_value(ctx, ptr)?);
    }
    Ok(values)
}

/// Write a host value as the result of a function or column callback.
///
/// Text and blob payloads go through arena scratch with the transient
/// destructor, so the engine copies them before this call returns.
pub(crate) fn write_result(
    ctx: &mut StoreContextMut<'_, ConnState>,
    res_ctx: u32,
    value: &Value,
) -> Result<()> {
    let c = res_ctx as u64;
    match value {
        Value::Null => {
            guest::call(ctx, api::RESULT_NULL, &[c])?;
        }
        Value::Integer(v) => {
            guest::call(ctx, api::RESULT_INT64, &[c, *v as u64])?;
        }
        Value::Real(v) => {
            guest::call(ctx, api::RESULT_DOUBLE, &[c, v.to_bits()])?;
        }
        Value::Text(s) => {
            with_arena(ctx, |ctx| {
                let ptr = arena::bytes(ctx, s.as_bytes())?;
                guest::call(
                    ctx,
                    api::RESULT_TEXT,
                    &[c, ptr as u64, s.len() as u64, TRANSIENT],
                )?;
                Ok(())
            })?;
        }
        Value::Blob(b) => {
            with_arena(ctx, |ctx| {
                let ptr = arena::bytes(ctx, b)?;
                guest::call(
                    ctx,
                    api::RESULT_BLOB,
                    &[c, ptr as u64, b.len() as u64, TRANSIENT],
                )?;
                Ok(())
            })?;
        }
    }
    Ok(())
}

/// Report a callback failure through the engine's result-error channel.
pub(crate) fn write_error_result(
    ctx: &mut StoreContextMut<'_, ConnState>,
    res_ctx: u32,
    err: &Error,
) {
    let c = res_ctx as u64;
    let message = err.callback_message();
    let write = with_arena(ctx, |ctx| {
        let ptr = arena::bytes(ctx, message.as_bytes())?;
        guest::call(ctx, api::RESULT_ERROR, &[c, ptr as u64, message.len() as u64])?;
        Ok(())
    })
    .and_then(|()| {
        guest::call(ctx, api::RESULT_ERROR_CODE, &[c, err.primary_code() as u64])?;
        Ok(())
    });
    if let Err(e) = write {
        tracing::error!(error = %e, "failed to report callback error to engine");
    }
}
