//! Per-connection guest state and the helpers that drive it.
//!
//! Every connection owns one guest instance; its bridge-side state lives in
//! the wasmtime store as [`ConnState`]. All operations that touch the guest
//! (calling exports, reading/writing linear memory, allocating scratch) go
//! through the free functions here, which take a `StoreContextMut` so the
//! same code path serves both host-initiated calls (from `Conn`, which owns
//! the store) and guest-initiated callbacks (from trampolines, which hold a
//! `Caller`).

use crate::arena::Arena;
use crate::config::Config;
use crate::error::{codes, Error, Result};
use crate::handle::HandleTable;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::error;
use wasmtime::{Func, Instance, Memory, StoreContextMut, StoreLimits, StoreLimitsBuilder};
use wasmtime_wasi::preview1::WasiP1Ctx;
use wasmtime_wasi::WasiCtxBuilder;
use wasqlite_runtime as runtime;

/// Exported guest function names.
///
/// These are the stable symbols of the engine build; the registration shims
/// (`*_host`) are the engine-side wrappers that accept a host handle in
/// place of a function pointer.
pub(crate) mod api {
    pub(crate) const MALLOC: &str = "sqlite3_malloc";
    pub(crate) const FREE: &str = "sqlite3_free";
    pub(crate) const OPEN: &str = "sqlite3_open_v2";
    pub(crate) const CLOSE: &str = "sqlite3_close";
    pub(crate) const EXEC: &str = "sqlite3_exec";
    pub(crate) const PREPARE: &str = "sqlite3_prepare_v3";
    pub(crate) const FINALIZE: &str = "sqlite3_finalize";
    pub(crate) const RESET: &str = "sqlite3_reset";
    pub(crate) const CLEAR_BINDINGS: &str = "sqlite3_clear_bindings";
    pub(crate) const STEP: &str = "sqlite3_step";
    pub(crate) const BIND_NULL: &str = "sqlite3_bind_null";
    pub(crate) const BIND_INT64: &str = "sqlite3_bind_int64";
    pub(crate) const BIND_DOUBLE: &str = "sqlite3_bind_double";
    pub(crate) const BIND_TEXT: &str = "sqlite3_bind_text";
    pub(crate) const BIND_BLOB: &str = "sqlite3_bind_blob";
    pub(crate) const BIND_ZEROBLOB: &str = "sqlite3_bind_zeroblob64";
    pub(crate) const COLUMN_COUNT: &str = "sqlite3_column_count";
    pub(crate) const COLUMN_NAME: &str = "sqlite3_column_name";
    pub(crate) const COLUMN_TYPE: &str = "sqlite3_column_type";
    pub(crate) const COLUMN_INT64: &str = "sqlite3_column_int64";
    pub(crate) const COLUMN_DOUBLE: &str = "sqlite3_column_double";
    pub(crate) const COLUMN_TEXT: &str = "sqlite3_column_text";
    pub(crate) const COLUMN_BYTES: &str = "sqlite3_column_bytes";
    pub(crate) const COLUMN_BLOB: &str = "sqlite3_column_blob";
    pub(crate) const CHANGES: &str = "sqlite3_changes64";
    pub(crate) const LAST_INSERT_ROWID: &str = "sqlite3_last_insert_rowid";
    pub(crate) const EXTENDED_ERRCODE: &str = "sqlite3_extended_errcode";
    pub(crate) const ERRMSG: &str = "sqlite3_errmsg";
    pub(crate) const ERRSTR: &str = "sqlite3_errstr";
    pub(crate) const VALUE_TYPE: &str = "sqlite3_value_type";
    pub(crate) const VALUE_INT64: &str = "sqlite3_value_int64";
    pub(crate) const VALUE_DOUBLE: &str = "sqlite3_value_double";
    pub(crate) const VALUE_TEXT: &str = "sqlite3_value_text";
    pub(crate) const VALUE_BYTES: &str = "sqlite3_value_bytes";
    pub(crate) const VALUE_BLOB: &str = "sqlite3_value_blob";
    pub(crate) const RESULT_NULL: &str = "sqlite3_result_null";
    pub(crate) const RESULT_INT64: &str = "sqlite3_result_int64";
    pub(crate) const RESULT_DOUBLE: &str = "sqlite3_result_double";
    pub(crate) const RESULT_TEXT: &str = "sqlite3_result_text";
    pub(crate) const RESULT_BLOB: &str = "sqlite3_result_blob";
    pub(crate) const RESULT_ERROR: &str = "sqlite3_result_error";
    pub(crate) const RESULT_ERROR_CODE: &str = "sqlite3_result_error_code";
    pub(crate) const DECLARE_VTAB: &str = "sqlite3_declare_vtab";
    pub(crate) const CREATE_MODULE: &str = "sqlite3_create_module_host";
    pub(crate) const CREATE_FUNCTION: &str = "sqlite3_create_function_host";
    pub(crate) const CREATE_AGGREGATE: &str = "sqlite3_create_aggregate_host";
    pub(crate) const CREATE_WINDOW: &str = "sqlite3_create_window_host";
    pub(crate) const CREATE_COLLATION: &str = "sqlite3_create_collation_host";
    pub(crate) const VTAB_RHS_VALUE: &str = "sqlite3_vtab_rhs_value_host";
}

/// Bridge-side state stored in a connection's wasmtime store.
pub(crate) struct ConnState {
    pub(crate) wasi: WasiP1Ctx,
    pub(crate) limits: StoreLimits,
    pub(crate) instance: Option<Instance>,
    pub(crate) memory: Option<Memory>,
    funcs: HashMap<&'static str, Func>,
    pub(crate) arena: Arena,
    pub(crate) handles: HandleTable,
    pub(crate) config: Config,
    pub(crate) interrupted: Arc<AtomicBool>,
    /// Guest pointer of the open database, 0 until the connection opens.
    pub(crate) db: u32,
}

impl ConnState {
    pub(crate) fn new(config: Config, interrupted: Arc<AtomicBool>) -> Self {
        let wasi = WasiCtxBuilder::new().inherit_stderr().build_p1();
        let limits = StoreLimitsBuilder::new()
            .memory_size(config.max_memory)
            .build();
        Self {
            wasi,
            limits,
            instance: None,
            memory: None,
            funcs: HashMap::new(),
            arena: Arena::unset(),
            handles: HandleTable::new(),
            config,
            interrupted,
            db: 0,
        }
    }
}

/// Resolve an exported guest function, caching the resolution.
pub(crate) fn func(ctx: &mut StoreContextMut<'_, ConnState>, name: &'static str) -> Result<Func> {
    if let Some(f) = ctx.data().funcs.get(name) {
        return Ok(*f);
    }
    let instance = ctx
        .data()
        .instance
        .ok_or(Error::Internal("guest instance not initialized"))?;
    let f = runtime::exported_func(&mut *ctx, instance, name)?;
    ctx.data_mut().funcs.insert(name, f);
    Ok(f)
}

/// Call an exported guest function.
///
/// An abort caused by a pending interrupt is translated to the engine's
/// `INTERRUPT` error here, so callers see the standard taxonomy.
pub(crate) fn call(
    ctx: &mut StoreContextMut<'_, ConnState>,
    name: &'static str,
    args: &[u64],
) -> Result<u64> {
    let f = func(ctx, name)?;
    match runtime::call::invoke_named(&mut *ctx, f, name, args) {
        Ok(v) => Ok(v),
        Err(e) => {
            if ctx.data().interrupted.swap(false, Ordering::SeqCst) {
                return Err(Error::engine(codes::INTERRUPT, "interrupted"));
            }
            Err(e.into())
        }
    }
}

fn memory(ctx: &mut StoreContextMut<'_, ConnState>) -> Result<Memory> {
    ctx.data()
        .memory
        .ok_or(Error::Internal("guest memory not initialized"))
}

/// Mutable view of the guest's linear memory.
pub(crate) fn mem_mut<'a>(
    ctx: &'a mut StoreContextMut<'_, ConnState>,
) -> Result<&'a mut [u8]> {
    let m = memory(ctx)?;
    Ok(m.data_mut(&mut *ctx))
}

/// Shared view of the guest's linear memory.
pub(crate) fn mem<'a>(ctx: &'a mut StoreContextMut<'_, ConnState>) -> Result<&'a [u8]> {
    let m = memory(ctx)?;
    Ok(m.data(&*ctx))
}

/// Allocate through the guest's persistent allocator.
pub(crate) fn malloc(ctx: &mut StoreContextMut<'_, ConnState>, len: u32) -> Result<u32> {
    let ptr = call(ctx, api::MALLOC, &[len as u64])? as u32;
    if ptr == 0 && len > 0 {
        return Err(Error::OutOfMemory);
    }
    Ok(ptr)
}

/// Free a persistent guest allocation.
pub(crate) fn free(ctx: &mut StoreContextMut<'_, ConnState>, ptr: u32) -> Result<()> {
    if ptr != 0 {
        call(ctx, api::FREE, &[ptr as u64])?;
    }
    Ok(())
}

/// Copy a NUL-terminated string into a persistent guest allocation.
///
/// Used for data that must outlive the current call's arena (error messages
/// handed to the engine, the chosen plan string); the engine frees it
/// through its own allocator.
pub(crate) fn new_string(ctx: &mut StoreContextMut<'_, ConnState>, s: &str) -> Result<u32> {
    let ptr = malloc(ctx, s.len() as u32 + 1)?;
    let m = mem_mut(ctx)?;
    runtime::memory::write_bytes(m, ptr, s.as_bytes()).map_err(Error::from)?;
    runtime::memory::write_u8(m, ptr + s.len() as u32, 0).map_err(Error::from)?;
    Ok(ptr)
}

/// Read a NUL-terminated guest string, bounded by the configured limit.
pub(crate) fn read_string(ctx: &mut StoreContextMut<'_, ConnState>, ptr: u32) -> Result<String> {
    let max = ctx.data().config.max_string;
    let m = mem(ctx)?;
    Ok(runtime::memory::read_string(m, ptr, max)?)
}

/// Read an exact-length guest byte range into host memory.
pub(crate) fn read_bytes_owned(
    ctx: &mut StoreContextMut<'_, ConnState>,
    ptr: u32,
    len: u32,
) -> Result<Vec<u8>> {
    if len > ctx.data().config.max_string {
        return Err(Error::engine(
            codes::TOOBIG,
            "guest data exceeds configured maximum length",
        ));
    }
    let m = mem(ctx)?;
    Ok(runtime::memory::read_bytes(m, ptr, len)?.to_vec())
}

/// Run `f` inside an arena frame: the cursor is marked on entry and reset
/// on exit, releasing every scratch allocation the frame made.
pub(crate) fn with_arena<R>(
    ctx: &mut StoreContextMut<'_, ConnState>,
    f: impl FnOnce(&mut StoreContextMut<'_, ConnState>) -> Result<R>,
) -> Result<R> {
    let mark = crate::arena::mark(ctx);
    let result = f(ctx);
    let reset = crate::arena::reset(ctx, mark);
    match (result, reset) {
        (Ok(v), Ok(())) => Ok(v),
        (Err(e), _) => Err(e),
        (Ok(_), Err(e)) => Err(e),
    }
}

/// Translate a non-success result code into an engine error, reading the
/// message and extended code from the guest.
pub(crate) fn db_error(ctx: &mut StoreContextMut<'_, ConnState>, rc: u32) -> Error {
    let db = ctx.data().db;
    let (message, extended) = if db != 0 {
        let msg = call(ctx, api::ERRMSG, &[db as u64])
            .and_then(|ptr| read_string(ctx, ptr as u32))
            .unwrap_or_default();
        let ext = call(ctx, api::EXTENDED_ERRCODE, &[db as u64]).unwrap_or(0) as u32;
        (msg, ext)
    } else {
        let msg = call(ctx, api::ERRSTR, &[rc as u64])
            .and_then(|ptr| read_string(ctx, ptr as u32))
            .unwrap_or_default();
        (msg, rc)
    };
    Error::Engine {
        code: rc & 0xff,
        extended_code: if extended != 0 { extended } else { rc },
        message,
    }
}

/// Check a guest result code, translating non-success into an error.
pub(crate) fn check(ctx: &mut StoreContextMut<'_, ConnState>, rc: u64) -> Result<()> {
    if rc as u32 == codes::OK {
        Ok(())
    } else {
        Err(db_error(ctx, rc as u32))
    }
}

/// Run a host callback, containing panics at the boundary.
///
/// A panic in host-implemented logic must never unwind into guest
/// execution; it is converted to an engine error here.
pub(crate) fn catch_callback<R>(f: impl FnOnce() -> Result<R>) -> Result<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                *s
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.as_str()
            } else {
                "unknown panic"
            };
            error!(panic = msg, "host callback panicked");
            Err(Error::engine(
                codes::ERROR,
                format!("host callback panicked: {msg}"),
            ))
        }
    }
}
