//! User-defined functions and collations.
//!
//! Registration hands the engine a handle in place of a function pointer;
//! evaluation comes back through the fixed callback table and is dispatched
//! here. Aggregate groups get one host object each, keyed through a 4-byte
//! slot the engine-side shim reserves per group.

use crate::arena;
use crate::error::{Error, Result};
use crate::guest::{self, api, catch_callback, with_arena, ConnState};
use crate::handle::HostObject;
use crate::value::{self, Value};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, error, trace};
use wasmtime::{AsContextMut, Caller, Linker, StoreContextMut};
use wasqlite_runtime::memory;

/// The function gives the same output for the same inputs.
pub const DETERMINISTIC: u32 = 0x0000_0800;
/// The function may only be invoked from top-level SQL.
pub const DIRECTONLY: u32 = 0x0008_0000;
/// The function is unlikely to cause problems even if misused.
pub const INNOCUOUS: u32 = 0x0020_0000;

/// A scalar SQL function implemented by the host.
pub type ScalarFunction = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// An aggregate SQL function. One instance accumulates one group.
pub trait AggregateFunction: Send {
    fn step(&mut self, args: &[Value]) -> Result<()>;
    fn finalize(&mut self) -> Result<Value>;
}

/// A window SQL function: an aggregate that can also report the current
/// value mid-group and remove rows from the window.
pub trait WindowFunction: AggregateFunction {
    fn value(&self) -> Result<Value>;
    fn inverse(&mut self, args: &[Value]) -> Result<()>;
}

pub(crate) struct ScalarDef {
    pub(crate) func: ScalarFunction,
}

pub(crate) struct CollationDef {
    pub(crate) cmp: Box<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>,
}

/// Object-safe aggregate dispatch. The window entry points are only reached
/// when the registration advertised them; hitting a default is a
/// registration bug, not a user error.
pub(crate) trait ErasedAggregate: Send {
    fn step(&mut self, args: &[Value]) -> Result<()>;
    fn finalize(&mut self) -> Result<Value>;
    fn value(&self) -> Result<Value> {
        Err(Error::Internal("value dispatched to a plain aggregate"))
    }
    fn inverse(&mut self, _args: &[Value]) -> Result<()> {
        Err(Error::Internal("inverse dispatched to a plain aggregate"))
    }
}

struct AggAdapter<A>(A);

impl<A: AggregateFunction> ErasedAggregate for AggAdapter<A> {
    fn step(&mut self, args: &[Value]) -> Result<()> {
        self.0.step(args)
    }
    fn finalize(&mut self) -> Result<Value> {
        self.0.finalize()
    }
}

struct WindowAdapter<A>(A);

impl<A: WindowFunction> ErasedAggregate for WindowAdapter<A> {
    fn step(&mut self, args: &[Value]) -> Result<()> {
        self.0.step(args)
    }
    fn finalize(&mut self) -> Result<Value> {
        self.0.finalize()
    }
    fn value(&self) -> Result<Value> {
        self.0.value()
    }
    fn inverse(&mut self, args: &[Value]) -> Result<()> {
        self.0.inverse(args)
    }
}

pub(crate) struct AggregateDef {
    factory: Box<dyn Fn() -> Box<dyn ErasedAggregate + Send> + Send + Sync>,
}

// ---------------------------------------------------------------------------
// Registration (host → guest)
// ---------------------------------------------------------------------------

fn register(
    ctx: &mut StoreContextMut<'_, ConnState>,
    export: &'static str,
    name: &str,
    extra: &[u64],
    object: HostObject,
) -> Result<()> {
    let db = ctx.data().db;
    let handle = ctx.data_mut().handles.add(object);
    let result = with_arena(ctx, |ctx| {
        let name_ptr = arena::string(ctx, name)?;
        let mut args = vec![db as u64, name_ptr as u64];
        args.extend_from_slice(extra);
        args.push(handle as u64);
        let rc = guest::call(ctx, export, &args)?;
        guest::check(ctx, rc)
    });
    if result.is_err() {
        let _ = ctx.data_mut().handles.remove(handle);
    } else {
        debug!(name, handle, export, "registered host callback");
    }
    result
}

pub(crate) fn register_scalar(
    ctx: &mut StoreContextMut<'_, ConnState>,
    name: &str,
    n_arg: i32,
    flags: u32,
    func: ScalarFunction,
) -> Result<()> {
    register(
        ctx,
        api::CREATE_FUNCTION,
        name,
        &[n_arg as u32 as u64, flags as u64],
        HostObject::Scalar(Arc::new(ScalarDef { func })),
    )
}

pub(crate) fn register_aggregate<A: AggregateFunction + 'static>(
    ctx: &mut StoreContextMut<'_, ConnState>,
    name: &str,
    n_arg: i32,
    flags: u32,
    factory: impl Fn() -> A + Send + Sync + 'static,
) -> Result<()> {
    register(
        ctx,
        api::CREATE_AGGREGATE,
        name,
        &[n_arg as u32 as u64, flags as u64],
        HostObject::Aggregate(Arc::new(AggregateDef {
            factory: Box::new(move || Box::new(AggAdapter(factory()))),
        })),
    )
}

pub(crate) fn register_window<A: WindowFunction + 'static>(
    ctx: &mut StoreContextMut<'_, ConnState>,
    name: &str,
    n_arg: i32,
    flags: u32,
    factory: impl Fn() -> A + Send + Sync + 'static,
) -> Result<()> {
    register(
        ctx,
        api::CREATE_WINDOW,
        name,
        &[n_arg as u32 as u64, flags as u64],
        HostObject::Aggregate(Arc::new(AggregateDef {
            factory: Box::new(move || Box::new(WindowAdapter(factory()))),
        })),
    )
}

pub(crate) fn register_collation(
    ctx: &mut StoreContextMut<'_, ConnState>,
    name: &str,
    cmp: impl Fn(&[u8], &[u8]) -> Ordering + Send + Sync + 'static,
) -> Result<()> {
    register(
        ctx,
        api::CREATE_COLLATION,
        name,
        &[],
        HostObject::Collation(Arc::new(CollationDef { cmp: Box::new(cmp) })),
    )
}

// ---------------------------------------------------------------------------
// Trampolines (guest → host)
// ---------------------------------------------------------------------------

fn scalar_def(ctx: &mut StoreContextMut<'_, ConnState>, handle: u32) -> Result<Arc<ScalarDef>> {
    match ctx.data_mut().handles.get(handle)? {
        HostObject::Scalar(def) => Ok(def.clone()),
        other => {
            error!(handle, kind = other.kind(), "handle is not a scalar function");
            Err(Error::Internal("handle is not a scalar function"))
        }
    }
}

fn aggregate_def(
    ctx: &mut StoreContextMut<'_, ConnState>,
    handle: u32,
) -> Result<Arc<AggregateDef>> {
    match ctx.data_mut().handles.get(handle)? {
        HostObject::Aggregate(def) => Ok(def.clone()),
        other => {
            error!(handle, kind = other.kind(), "handle is not an aggregate");
            Err(Error::Internal("handle is not an aggregate"))
        }
    }
}

/// Resolve the live aggregation group for `p_agg`, creating it on first
/// touch. The engine-side shim zeroes the slot when a new group begins.
fn group_handle(
    ctx: &mut StoreContextMut<'_, ConnState>,
    p_app: u32,
    p_agg: u32,
) -> Result<u32> {
    let existing = memory::read_u32(guest::mem(ctx)?, p_agg)?;
    if existing != 0 {
        return Ok(existing);
    }
    let def = aggregate_def(ctx, p_app)?;
    let state = (def.factory)();
    let handle = ctx.data_mut().handles.add(HostObject::AggregateState(state));
    memory::write_u32(guest::mem_mut(ctx)?, p_agg, handle)?;
    trace!(handle, "new aggregation group");
    Ok(handle)
}

pub(crate) fn scalar_callback(
    ctx: &mut StoreContextMut<'_, ConnState>,
    p_app: u32,
    p_ctx: u32,
    argc: u32,
    argv: u32,
) {
    let result = (|| {
        let def = scalar_def(ctx, p_app)?;
        let args = value::read_values(ctx, argc, argv)?;
        let out = catch_callback(|| (def.func)(&args))?;
        value::write_result(ctx, p_ctx, &out)
    })();
    if let Err(e) = result {
        value::write_error_result(ctx, p_ctx, &e);
    }
}

pub(crate) fn step_callback(
    ctx: &mut StoreContextMut<'_, ConnState>,
    p_app: u32,
    p_ctx: u32,
    p_agg: u32,
    argc: u32,
    argv: u32,
) {
    let result = (|| {
        let args = value::read_values(ctx, argc, argv)?;
        let handle = group_handle(ctx, p_app, p_agg)?;
        match ctx.data_mut().handles.get_mut(handle)? {
            HostObject::AggregateState(state) => {
                catch_callback(|| state.step(&args))
            }
            _ => Err(Error::Internal("group slot does not hold aggregate state")),
        }
    })();
    if let Err(e) = result {
        value::write_error_result(ctx, p_ctx, &e);
    }
}

pub(crate) fn inverse_callback(
    ctx: &mut StoreContextMut<'_, ConnState>,
    p_app: u32,
    p_ctx: u32,
    p_agg: u32,
    argc: u32,
    argv: u32,
) {
    let result = (|| {
        let args = value::read_values(ctx, argc, argv)?;
        let existing = memory::read_u32(guest::mem(ctx)?, p_agg)?;
        if existing == 0 {
            return Err(Error::Internal("inverse before any step"));
        }
        match ctx.data_mut().handles.get_mut(existing)? {
            HostObject::AggregateState(state) => {
                catch_callback(|| state.inverse(&args))
            }
            _ => Err(Error::Internal("group slot does not hold aggregate state")),
        }
    })();
    if let Err(e) = result {
        value::write_error_result(ctx, p_ctx, &e);
    }
}

pub(crate) fn value_callback(
    ctx: &mut StoreContextMut<'_, ConnState>,
    p_app: u32,
    p_ctx: u32,
    p_agg: u32,
) {
    let result = (|| {
        let handle = group_handle(ctx, p_app, p_agg)?;
        let out = match ctx.data_mut().handles.get_mut(handle)? {
            HostObject::AggregateState(state) => catch_callback(|| state.value())?,
            _ => return Err(Error::Internal("group slot does not hold aggregate state")),
        };
        value::write_result(ctx, p_ctx, &out)
    })();
    if let Err(e) = result {
        value::write_error_result(ctx, p_ctx, &e);
    }
}

pub(crate) fn final_callback(
    ctx: &mut StoreContextMut<'_, ConnState>,
    p_app: u32,
    p_ctx: u32,
    p_agg: u32,
) {
    let result = (|| {
        // Finalize may be the first and only callback for an empty group.
        let handle = group_handle(ctx, p_app, p_agg)?;
        let mut state = match ctx.data_mut().handles.remove(handle)? {
            HostObject::AggregateState(state) => state,
            _ => return Err(Error::Internal("group slot does not hold aggregate state")),
        };
        memory::write_u32(guest::mem_mut(ctx)?, p_agg, 0)?;
        let out = catch_callback(|| state.finalize())?;
        value::write_result(ctx, p_ctx, &out)
    })();
    if let Err(e) = result {
        value::write_error_result(ctx, p_ctx, &e);
    }
}

pub(crate) fn collation_callback(
    ctx: &mut StoreContextMut<'_, ConnState>,
    p_app: u32,
    n_a: u32,
    p_a: u32,
    n_b: u32,
    p_b: u32,
) -> i32 {
    let result = (|| {
        let def = match ctx.data_mut().handles.get(p_app)? {
            HostObject::Collation(def) => def.clone(),
            other => {
                error!(handle = p_app, kind = other.kind(), "handle is not a collation");
                return Err(Error::Internal("handle is not a collation"));
            }
        };
        let a = guest::read_bytes_owned(ctx, p_a, n_a)?;
        let b = guest::read_bytes_owned(ctx, p_b, n_b)?;
        catch_callback(|| Ok((def.cmp)(&a, &b)))
    })();
    match result {
        Ok(Ordering::Less) => -1,
        Ok(Ordering::Equal) => 0,
        Ok(Ordering::Greater) => 1,
        Err(e) => {
            // A comparison has no error channel; report equality and log.
            error!(error = %e, "collation comparison failed");
            0
        }
    }
}

/// The engine dropped its reference to a registration handle.
pub(crate) fn destroy_callback(ctx: &mut StoreContextMut<'_, ConnState>, p_app: u32) {
    match ctx.data_mut().handles.remove(p_app) {
        Ok(obj) => trace!(handle = p_app, kind = obj.kind(), "guest released handle"),
        Err(_) => error!(handle = p_app, "guest released an unknown handle"),
    }
}

// ---------------------------------------------------------------------------
// Linker wiring
// ---------------------------------------------------------------------------

/// Register the function/collation callback table under the `host`
/// namespace.
pub(crate) fn add_to_linker(linker: &mut Linker<ConnState>) -> Result<()> {
    let wrap = |e: wasmtime::Error| {
        Error::Runtime(wasqlite_runtime::RuntimeError::Instantiation(e.to_string()))
    };

    linker
        .func_wrap(
            "host",
            "func_call",
            |mut caller: Caller<'_, ConnState>, p_app: i32, p_ctx: i32, argc: i32, argv: i32| {
                let mut ctx = caller.as_context_mut();
                scalar_callback(&mut ctx, p_app as u32, p_ctx as u32, argc as u32, argv as u32);
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "host",
            "func_step",
            |mut caller: Caller<'_, ConnState>,
             p_app: i32,
             p_ctx: i32,
             p_agg: i32,
             argc: i32,
             argv: i32| {
                let mut ctx = caller.as_context_mut();
                step_callback(
                    &mut ctx,
                    p_app as u32,
                    p_ctx as u32,
                    p_agg as u32,
                    argc as u32,
                    argv as u32,
                );
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "host",
            "func_inverse",
            |mut caller: Caller<'_, ConnState>,
             p_app: i32,
             p_ctx: i32,
             p_agg: i32,
             argc: i32,
             argv: i32| {
                let mut ctx = caller.as_context_mut();
                inverse_callback(
                    &mut ctx,
                    p_app as u32,
                    p_ctx as u32,
                    p_agg as u32,
                    argc as u32,
                    argv as u32,
                );
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "host",
            "func_value",
            |mut caller: Caller<'_, ConnState>, p_app: i32, p_ctx: i32, p_agg: i32| {
                let mut ctx = caller.as_context_mut();
                value_callback(&mut ctx, p_app as u32, p_ctx as u32, p_agg as u32);
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "host",
            "func_final",
            |mut caller: Caller<'_, ConnState>, p_app: i32, p_ctx: i32, p_agg: i32| {
                let mut ctx = caller.as_context_mut();
                final_callback(&mut ctx, p_app as u32, p_ctx as u32, p_agg as u32);
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "host",
            "collation_compare",
            |mut caller: Caller<'_, ConnState>,
             p_app: i32,
             n_a: i32,
             p_a: i32,
             n_b: i32,
             p_b: i32|
             -> i32 {
                let mut ctx = caller.as_context_mut();
                collation_callback(
                    &mut ctx,
                    p_app as u32,
                    n_a as u32,
                    p_a as u32,
                    n_b as u32,
                    p_b as u32,
                )
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "host",
            "handle_destroy",
            |mut caller: Caller<'_, ConnState>, p_app: i32| {
                let mut ctx = caller.as_context_mut();
                destroy_callback(&mut ctx, p_app as u32);
            },
        )
        .map_err(wrap)?;

    Ok(())
}
