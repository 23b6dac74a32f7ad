//! Invocation of exported guest functions.
//!
//! Guest exports are called through a uniform convention: every argument is
//! carried as a `u64` and converted to the export's actual parameter type
//! (i32 takes the low 32 bits, i64 the full value, floats their bit
//! pattern), and the single result is widened back to `u64`. This keeps the
//! caller side free of per-export signatures.

use crate::{Result, RuntimeError};
use tracing::trace;
use wasmtime::{AsContextMut, Func, Instance, Memory, Val, ValType};

/// Resolve an exported function by name.
pub fn exported_func(
    mut store: impl AsContextMut,
    instance: Instance,
    name: &str,
) -> Result<Func> {
    instance
        .get_func(&mut store, name)
        .ok_or_else(|| RuntimeError::FunctionNotFound(name.to_string()))
}

/// Resolve the exported linear memory.
pub fn exported_memory(mut store: impl AsContextMut, instance: Instance) -> Result<Memory> {
    instance
        .get_memory(&mut store, "memory")
        .ok_or(RuntimeError::MissingMemory)
}

/// Invoke a guest function with `u64`-carried arguments.
///
/// The argument count must match the export's parameter count exactly; the
/// result is the first return value widened to `u64`, or 0 for a void
/// export.
pub fn invoke(mut store: impl AsContextMut, func: Func, args: &[u64]) -> Result<u64> {
    invoke_named(&mut store, func, "", args)
}

/// As [`invoke`], carrying the export name for diagnostics.
pub fn invoke_named(
    mut store: impl AsContextMut,
    func: Func,
    name: &str,
    args: &[u64],
) -> Result<u64> {
    let ty = func.ty(&store.as_context_mut());

    if ty.params().len() != args.len() {
        return Err(RuntimeError::Execution {
            name: name.to_string(),
            message: format!(
                "expected {} arguments, got {}",
                ty.params().len(),
                args.len()
            ),
        });
    }

    let mut params = Vec::with_capacity(args.len());
    for (param_ty, &arg) in ty.params().zip(args.iter()) {
        params.push(match param_ty {
            ValType::I32 => Val::I32(arg as u32 as i32),
            ValType::I64 => Val::I64(arg as i64),
            ValType::F32 => Val::F32(arg as u32),
            ValType::F64 => Val::F64(arg),
            other => {
                return Err(RuntimeError::Execution {
                    name: name.to_string(),
                    message: format!("unsupported parameter type {other}"),
                })
            }
        });
    }

    trace!(function = name, args = args.len(), "invoking guest export");

    let mut results = vec![Val::I32(0); ty.results().len()];
    func.call(&mut store, &params, &mut results)
        .map_err(|e| RuntimeError::Execution {
            name: name.to_string(),
            message: e.to_string(),
        })?;

    match results.first() {
        None => Ok(0),
        Some(Val::I32(v)) => Ok(*v as u32 as u64),
        Some(Val::I64(v)) => Ok(*v as u64),
        Some(Val::F32(bits)) => Ok(*bits as u64),
        Some(Val::F64(bits)) => Ok(*bits),
        Some(other) => Err(RuntimeError::Execution {
            name: name.to_string(),
            message: format!("unsupported result type {:?}", other.ty(&store.as_context_mut())),
        }),
    }
}
