//! The virtual-table protocol.
//!
//! Host-defined tables are opaque to the engine: it holds integer handles
//! and drives the table through the fixed callback table. This module
//! implements the full contract — module registration with capability
//! negotiation, per-table lifecycle, planning negotiation through the
//! fixed-layout descriptor, cursor iteration, mutation and the optional
//! transaction/rename/integrity extensions.
//!
//! Capabilities are declared explicitly when a [`Module`] is built
//! (`with_update`, `with_rename`, …); registration advertises exactly that
//! set to the engine, which will only dispatch advertised callbacks. If a
//! non-advertised callback resolves anyway, dispatch fails as an
//! internal-consistency error: that is a registration bug, not a
//! recoverable condition.

mod index_info;

pub use index_info::{
    ConstraintOp, IndexConstraint, IndexConstraintUsage, IndexInfo, IndexOrderBy,
    INDEX_SCAN_UNIQUE,
};

#[cfg(test)]
pub(crate) use index_info::verify_layout;

use crate::arena;
use crate::error::{codes, Error, Result};
use crate::func::{ScalarDef, ScalarFunction};
use crate::guest::{self, api, catch_callback, with_arena, ConnState};
use crate::handle::HostObject;
use crate::value::{self, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tracing::{debug, error, trace, warn};
use wasmtime::{AsContextMut, Caller, Linker, StoreContextMut};
use wasqlite_runtime::memory;

// Capability bits advertised at registration. Values are part of the
// engine-side shim's ABI.
pub(crate) const CREATOR: u32 = 0x01;
pub(crate) const DESTROYER: u32 = 0x02;
pub(crate) const UPDATER: u32 = 0x04;
pub(crate) const RENAMER: u32 = 0x08;
pub(crate) const OVERLOADER: u32 = 0x10;
pub(crate) const CHECKER: u32 = 0x20;
pub(crate) const TX: u32 = 0x40;
pub(crate) const SAVEPOINTER: u32 = 0x80;

/// A virtual-table instance.
pub trait VTab: Send + 'static {
    type Cursor: VTabCursor + Send + 'static;

    /// Negotiate a query plan. May run many times per statement; must be
    /// side-effect-free apart from populating the descriptor outputs.
    fn best_index(&mut self, info: &mut IndexInfo) -> Result<()>;

    /// Open a new cursor over this table.
    fn open(&mut self) -> Result<Self::Cursor>;
}

/// A cursor looping over a virtual table.
pub trait VTabCursor {
    /// Begin a scan described by the plan `best_index` chose.
    fn filter(&mut self, idx_num: i32, idx_str: Option<&str>, args: Vec<Value>) -> Result<()>;
    /// Advance to the next row.
    fn next(&mut self) -> Result<()>;
    /// Whether the scan is exhausted.
    fn eof(&mut self) -> bool;
    /// Produce the value of column `idx` for the current row.
    fn column(&mut self, idx: usize) -> Result<Value>;
    /// The rowid of the current row.
    fn rowid(&mut self) -> Result<i64>;
}

/// Capability: INSERT/UPDATE/DELETE support.
///
/// `args` arrive as the engine delivers them: `args[0]` is the old rowid
/// (null for an insert), `args[1]` the new rowid, followed by one value per
/// declared column.
pub trait UpdateVTab: VTab {
    fn update(&mut self, args: Vec<Value>) -> Result<i64>;
}

/// Capability: ALTER TABLE ... RENAME support.
pub trait RenameVTab: VTab {
    fn rename(&mut self, new_name: &str) -> Result<()>;
}

/// Capability: dropping persistent backing state on DROP TABLE.
pub trait DestroyVTab: VTab {
    fn destroy(&mut self) -> Result<()>;
}

/// Capability: integrity checking.
///
/// `Ok(None)` means the content is sound; `Ok(Some(msg))` reports a content
/// problem without failing the check; `Err` means the checker itself could
/// not evaluate the table.
pub trait CheckVTab: VTab {
    fn integrity(&mut self, schema: &str, table: &str, flags: usize) -> Result<Option<String>>;
}

/// Capability: overloading SQL functions applied to this table.
pub trait OverloadVTab: VTab {
    fn find_function(&mut self, n_arg: i32, name: &str) -> Option<(ScalarFunction, ConstraintOp)>;
}

/// Capability: two-phase-commit transactions.
pub trait TxVTab: VTab {
    fn begin(&mut self) -> Result<()>;
    fn sync(&mut self) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
    fn rollback(&mut self) -> Result<()>;
}

/// Capability: nested transactions.
pub trait SavepointVTab: TxVTab {
    fn savepoint(&mut self, id: i32) -> Result<()>;
    fn release(&mut self, id: i32) -> Result<()>;
    fn rollback_to(&mut self, id: i32) -> Result<()>;
}

/// Connection context handed to table constructors.
pub struct VTabConnection<'a, 'b> {
    ctx: &'a mut StoreContextMut<'b, ConnState>,
}

impl VTabConnection<'_, '_> {
    /// Declare the table's schema to the engine. Constructors must call
    /// this before returning.
    pub fn declare(&mut self, sql: &str) -> Result<()> {
        let db = self.ctx.data().db;
        with_arena(&mut *self.ctx, |ctx| {
            let sql_ptr = arena::string(ctx, sql)?;
            let rc = guest::call(ctx, api::DECLARE_VTAB, &[db as u64, sql_ptr as u64])?;
            guest::check(ctx, rc)
        })
    }
}

type Ctor<T> = Arc<dyn Fn(&mut VTabConnection<'_, '_>, &[String]) -> Result<T> + Send + Sync>;

/// The optional-operation dispatch table, populated from trait impls at
/// declaration time. Plain function pointers, so the set is explicit and
/// copyable into each table instance.
pub(crate) struct Hooks<T> {
    update: Option<fn(&mut T, Vec<Value>) -> Result<i64>>,
    rename: Option<fn(&mut T, &str) -> Result<()>>,
    destroy: Option<fn(&mut T) -> Result<()>>,
    integrity: Option<fn(&mut T, &str, &str, usize) -> Result<Option<String>>>,
    find_function: Option<fn(&mut T, i32, &str) -> Option<(ScalarFunction, ConstraintOp)>>,
    begin: Option<fn(&mut T) -> Result<()>>,
    sync: Option<fn(&mut T) -> Result<()>>,
    commit: Option<fn(&mut T) -> Result<()>>,
    rollback: Option<fn(&mut T) -> Result<()>>,
    savepoint: Option<fn(&mut T, i32) -> Result<()>>,
    release: Option<fn(&mut T, i32) -> Result<()>>,
    rollback_to: Option<fn(&mut T, i32) -> Result<()>>,
}

impl<T> Hooks<T> {
    const fn none() -> Self {
        Self {
            update: None,
            rename: None,
            destroy: None,
            integrity: None,
            find_function: None,
            begin: None,
            sync: None,
            commit: None,
            rollback: None,
            savepoint: None,
            release: None,
            rollback_to: None,
        }
    }
}

impl<T> Clone for Hooks<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Hooks<T> {}

/// A virtual-table module declaration: constructors plus the declared
/// capability set.
pub struct Module<T: VTab> {
    connect: Ctor<T>,
    create: Option<Ctor<T>>,
    eponymous: bool,
    hooks: Hooks<T>,
}

impl<T: VTab> Module<T> {
    /// An ordinary table module: the same constructor backs CREATE VIRTUAL
    /// TABLE and reconnection.
    pub fn new(
        connect: impl Fn(&mut VTabConnection<'_, '_>, &[String]) -> Result<T>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            connect: Arc::new(connect),
            create: None,
            eponymous: false,
            hooks: Hooks::none(),
        }
    }

    /// An eponymous module: usable directly in FROM clauses, with no
    /// CREATE VIRTUAL TABLE step.
    pub fn eponymous(
        connect: impl Fn(&mut VTabConnection<'_, '_>, &[String]) -> Result<T>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            connect: Arc::new(connect),
            create: None,
            eponymous: true,
            hooks: Hooks::none(),
        }
    }

    /// Use a distinct constructor for CREATE VIRTUAL TABLE.
    pub fn with_create(
        mut self,
        create: impl Fn(&mut VTabConnection<'_, '_>, &[String]) -> Result<T>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.create = Some(Arc::new(create));
        self.eponymous = false;
        self
    }

    /// Advertise INSERT/UPDATE/DELETE support.
    pub fn with_update(mut self) -> Self
    where
        T: UpdateVTab,
    {
        self.hooks.update = Some(T::update);
        self
    }

    /// Advertise rename support.
    pub fn with_rename(mut self) -> Self
    where
        T: RenameVTab,
    {
        self.hooks.rename = Some(T::rename);
        self
    }

    /// Advertise persistent-state destruction on DROP TABLE.
    pub fn with_destroy(mut self) -> Self
    where
        T: DestroyVTab,
    {
        self.hooks.destroy = Some(T::destroy);
        self
    }

    /// Advertise integrity checking.
    pub fn with_integrity_check(mut self) -> Self
    where
        T: CheckVTab,
    {
        self.hooks.integrity = Some(T::integrity);
        self
    }

    /// Advertise function overloading.
    pub fn with_overload(mut self) -> Self
    where
        T: OverloadVTab,
    {
        self.hooks.find_function = Some(T::find_function);
        self
    }

    /// Advertise two-phase-commit transaction support.
    pub fn with_transactions(mut self) -> Self
    where
        T: TxVTab,
    {
        self.hooks.begin = Some(T::begin);
        self.hooks.sync = Some(T::sync);
        self.hooks.commit = Some(T::commit);
        self.hooks.rollback = Some(T::rollback);
        self
    }

    /// Advertise nested-transaction support (implies transactions).
    pub fn with_savepoints(mut self) -> Self
    where
        T: SavepointVTab,
    {
        self = self.with_transactions();
        self.hooks.savepoint = Some(T::savepoint);
        self.hooks.release = Some(T::release);
        self.hooks.rollback_to = Some(T::rollback_to);
        self
    }

    fn caps(&self) -> u32 {
        let mut caps = 0;
        if !self.eponymous {
            caps |= CREATOR;
        }
        if self.hooks.destroy.is_some() {
            caps |= DESTROYER;
        }
        if self.hooks.update.is_some() {
            caps |= UPDATER;
        }
        if self.hooks.rename.is_some() {
            caps |= RENAMER;
        }
        if self.hooks.find_function.is_some() {
            caps |= OVERLOADER;
        }
        if self.hooks.integrity.is_some() {
            caps |= CHECKER;
        }
        if self.hooks.begin.is_some() {
            caps |= TX;
        }
        if self.hooks.savepoint.is_some() {
            caps |= SAVEPOINTER;
        }
        caps
    }
}

/// Object-safe module dispatch stored in handle tables and the global
/// registry.
pub(crate) trait ErasedModule: Send + Sync {
    fn capabilities(&self) -> u32;
    fn instantiate(
        &self,
        create: bool,
        conn: &mut VTabConnection<'_, '_>,
        args: &[String],
    ) -> Result<Box<dyn ErasedVTab + Send>>;
}

impl<T: VTab> ErasedModule for Module<T> {
    fn capabilities(&self) -> u32 {
        self.caps()
    }

    fn instantiate(
        &self,
        create: bool,
        conn: &mut VTabConnection<'_, '_>,
        args: &[String],
    ) -> Result<Box<dyn ErasedVTab + Send>> {
        let ctor = if create {
            if self.eponymous {
                return Err(Error::Internal("create dispatched to an eponymous module"));
            }
            self.create.as_ref().unwrap_or(&self.connect)
        } else {
            &self.connect
        };
        let table = ctor(conn, args)?;
        Ok(Box::new(TableAdapter {
            table,
            hooks: self.hooks,
        }))
    }
}

/// Object-safe table dispatch. Optional operations land on the hook table;
/// a missing hook means the callback was dispatched without its capability
/// having been advertised.
pub(crate) trait ErasedVTab: Send {
    fn best_index(&mut self, info: &mut IndexInfo) -> Result<()>;
    fn open(&mut self) -> Result<Box<dyn VTabCursor + Send>>;
    fn update(&mut self, args: Vec<Value>) -> Result<i64>;
    fn rename(&mut self, new_name: &str) -> Result<()>;
    fn destroy(&mut self) -> Result<()>;
    fn integrity(&mut self, schema: &str, table: &str, flags: usize) -> Result<Option<String>>;
    fn find_function(&mut self, n_arg: i32, name: &str)
        -> Result<Option<(ScalarFunction, ConstraintOp)>>;
    fn begin(&mut self) -> Result<()>;
    fn sync(&mut self) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
    fn rollback(&mut self) -> Result<()>;
    fn savepoint(&mut self, id: i32) -> Result<()>;
    fn release(&mut self, id: i32) -> Result<()>;
    fn rollback_to(&mut self, id: i32) -> Result<()>;
}

const NOT_ADVERTISED: Error =
    Error::Internal("optional callback dispatched without advertised capability");

struct TableAdapter<T: VTab> {
    table: T,
    hooks: Hooks<T>,
}

impl<T: VTab> ErasedVTab for TableAdapter<T> {
    fn best_index(&mut self, info: &mut IndexInfo) -> Result<()> {
        self.table.best_index(info)
    }

    fn open(&mut self) -> Result<Box<dyn VTabCursor + Send>> {
        Ok(Box::new(self.table.open()?))
    }

    fn update(&mut self, args: Vec<Value>) -> Result<i64> {
        match self.hooks.update {
            Some(f) => f(&mut self.table, args),
            None => Err(NOT_ADVERTISED),
        }
    }

    fn rename(&mut self, new_name: &str) -> Result<()> {
        match self.hooks.rename {
            Some(f) => f(&mut self.table, new_name),
            None => Err(NOT_ADVERTISED),
        }
    }

    fn destroy(&mut self) -> Result<()> {
        match self.hooks.destroy {
            Some(f) => f(&mut self.table),
            None => Err(NOT_ADVERTISED),
        }
    }

    fn integrity(&mut self, schema: &str, table: &str, flags: usize) -> Result<Option<String>> {
        match self.hooks.integrity {
            Some(f) => f(&mut self.table, schema, table, flags),
            None => Err(NOT_ADVERTISED),
        }
    }

    fn find_function(
        &mut self,
        n_arg: i32,
        name: &str,
    ) -> Result<Option<(ScalarFunction, ConstraintOp)>> {
        match self.hooks.find_function {
            Some(f) => Ok(f(&mut self.table, n_arg, name)),
            None => Err(NOT_ADVERTISED),
        }
    }

    fn begin(&mut self) -> Result<()> {
        match self.hooks.begin {
            Some(f) => f(&mut self.table),
            None => Err(NOT_ADVERTISED),
        }
    }

    fn sync(&mut self) -> Result<()> {
        match self.hooks.sync {
            Some(f) => f(&mut self.table),
            None => Err(NOT_ADVERTISED),
        }
    }

    fn commit(&mut self) -> Result<()> {
        match self.hooks.commit {
            Some(f) => f(&mut self.table),
            None => Err(NOT_ADVERTISED),
        }
    }

    fn rollback(&mut self) -> Result<()> {
        match self.hooks.rollback {
            Some(f) => f(&mut self.table),
            None => Err(NOT_ADVERTISED),
        }
    }

    fn savepoint(&mut self, id: i32) -> Result<()> {
        match self.hooks.savepoint {
            Some(f) => f(&mut self.table, id),
            None => Err(NOT_ADVERTISED),
        }
    }

    fn release(&mut self, id: i32) -> Result<()> {
        match self.hooks.release {
            Some(f) => f(&mut self.table, id),
            None => Err(NOT_ADVERTISED),
        }
    }

    fn rollback_to(&mut self, id: i32) -> Result<()> {
        match self.hooks.rollback_to {
            Some(f) => f(&mut self.table, id),
            None => Err(NOT_ADVERTISED),
        }
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Modules registered for every connection opened after registration.
/// Callbacks can originate from engine internals on any caller's thread, so
/// access is lock-guarded; the lock is never held across a guest call.
static REGISTRY: LazyLock<Mutex<HashMap<String, Arc<dyn ErasedModule>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Register a module process-wide. Every connection opened afterwards gets
/// it automatically.
pub fn register<T: VTab>(name: impl Into<String>, module: Module<T>) {
    REGISTRY.lock().insert(name.into(), Arc::new(module));
}

/// Remove a process-wide module registration.
pub fn unregister(name: &str) {
    REGISTRY.lock().remove(name);
}

pub(crate) fn registered_modules() -> Vec<(String, Arc<dyn ErasedModule>)> {
    REGISTRY
        .lock()
        .iter()
        .map(|(name, module)| (name.clone(), module.clone()))
        .collect()
}

/// Register a module on one connection.
pub(crate) fn create_module(
    ctx: &mut StoreContextMut<'_, ConnState>,
    name: &str,
    module: Arc<dyn ErasedModule>,
) -> Result<()> {
    let caps = module.capabilities();
    let db = ctx.data().db;
    let handle = ctx.data_mut().handles.add(HostObject::Module(module));
    let result = with_arena(ctx, |ctx| {
        let name_ptr = arena::string(ctx, name)?;
        let rc = guest::call(
            ctx,
            api::CREATE_MODULE,
            &[db as u64, name_ptr as u64, caps as u64, handle as u64],
        )?;
        guest::check(ctx, rc)
    });
    if result.is_err() {
        let _ = ctx.data_mut().handles.remove(handle);
    } else {
        debug!(name, capabilities = caps, handle, "registered virtual-table module");
    }
    result
}

// ---------------------------------------------------------------------------
// Trampolines
// ---------------------------------------------------------------------------

/// The engine-side shim stores the host handle in the 4 bytes immediately
/// before each object pointer it hands to callbacks.
const HANDLE_OFFSET: u32 = 4;

fn handle_slot(ptr: u32) -> Result<u32> {
    ptr.checked_sub(HANDLE_OFFSET)
        .ok_or(Error::Internal("object pointer below handle slot"))
}

fn handle_at(ctx: &mut StoreContextMut<'_, ConnState>, ptr: u32) -> Result<u32> {
    let slot = handle_slot(ptr)?;
    Ok(memory::read_u32(guest::mem(ctx)?, slot)?)
}

/// Register `handle` for the object the guest allocated at `*pptr`.
fn put_handle(ctx: &mut StoreContextMut<'_, ConnState>, pptr: u32, handle: u32) -> Result<()> {
    let m = guest::mem_mut(ctx)?;
    let ptr = memory::read_u32(m, pptr)?;
    let slot = handle_slot(ptr)?;
    Ok(memory::write_u32(m, slot, handle)?)
}

fn del_handle(ctx: &mut StoreContextMut<'_, ConnState>, ptr: u32) -> Result<HostObject> {
    let handle = handle_at(ctx, ptr)?;
    ctx.data_mut().handles.remove(handle)
}

/// Where a callback failure writes its engine-allocated message string.
enum ErrorSink {
    /// Nothing to write, only the code is reported.
    Discard,
    /// Write the string pointer directly at this address.
    Out(u32),
    /// Write into the table object's error slot.
    Table(u32),
    /// Write into the error slot of the cursor's owning table.
    Cursor(u32),
}

/// The table object's error-string slot sits at +8.
const ERRMSG_OFFSET: u32 = 8;

/// Convert a callback result into the shared numeric convention: 0 for
/// success, an engine result code otherwise, with the message promoted to a
/// persistent guest string the engine frees.
fn report(
    ctx: &mut StoreContextMut<'_, ConnState>,
    sink: ErrorSink,
    result: Result<()>,
) -> u32 {
    let err = match result {
        Ok(()) => return codes::OK,
        Err(err) => err,
    };
    let code = err.primary_code();
    let message = err.callback_message();
    warn!(code, message = %message, "virtual-table callback failed");

    if !message.is_empty() {
        let target = match sink {
            ErrorSink::Discard => 0,
            ErrorSink::Out(ptr) => ptr,
            ErrorSink::Table(ptr) => ptr + ERRMSG_OFFSET,
            ErrorSink::Cursor(ptr) => {
                match guest::mem(ctx).and_then(|m| Ok(memory::read_u32(m, ptr)?)) {
                    Ok(table_ptr) => table_ptr + ERRMSG_OFFSET,
                    Err(_) => 0,
                }
            }
        };
        if target != 0 {
            let write = guest::new_string(ctx, &message).and_then(|s| {
                Ok(memory::write_u32(guest::mem_mut(ctx)?, target, s)?)
            });
            if let Err(e) = write {
                error!(error = %e, "failed to surface callback error message");
            }
        }
    }
    code
}

fn table_object<'a>(
    ctx: &'a mut StoreContextMut<'_, ConnState>,
    handle: u32,
) -> Result<&'a mut Box<dyn ErasedVTab + Send>> {
    match ctx.data_mut().handles.get_mut(handle)? {
        HostObject::Table(table) => Ok(table),
        other => {
            error!(handle, kind = other.kind(), "handle is not a table");
            Err(Error::Internal("handle is not a table"))
        }
    }
}

fn cursor_object<'a>(
    ctx: &'a mut StoreContextMut<'_, ConnState>,
    handle: u32,
) -> Result<&'a mut Box<dyn VTabCursor + Send>> {
    match ctx.data_mut().handles.get_mut(handle)? {
        HostObject::Cursor(cursor) => Ok(cursor),
        other => {
            error!(handle, kind = other.kind(), "handle is not a cursor");
            Err(Error::Internal("handle is not a cursor"))
        }
    }
}

fn read_ctor_args(
    ctx: &mut StoreContextMut<'_, ConnState>,
    argc: u32,
    argv: u32,
) -> Result<Vec<String>> {
    let mut ptrs = Vec::with_capacity(argc as usize);
    {
        let m = guest::mem(ctx)?;
        for i in 0..argc {
            ptrs.push(memory::read_u32(m, argv + i * 4)?);
        }
    }
    let mut args = Vec::with_capacity(ptrs.len());
    for ptr in ptrs {
        args.push(guest::read_string(ctx, ptr)?);
    }
    Ok(args)
}

pub(crate) fn constructor_callback(
    ctx: &mut StoreContextMut<'_, ConnState>,
    create: bool,
    p_mod: u32,
    argc: u32,
    argv: u32,
    pp_vtab: u32,
    pz_err: u32,
) -> u32 {
    let result = (|| {
        let args = read_ctor_args(ctx, argc, argv)?;
        let handle = handle_at(ctx, p_mod)?;
        let module = match ctx.data_mut().handles.get(handle)? {
            HostObject::Module(module) => module.clone(),
            other => {
                error!(handle, kind = other.kind(), "handle is not a module");
                return Err(Error::Internal("handle is not a module"));
            }
        };
        let table = catch_callback(|| {
            module.instantiate(create, &mut VTabConnection { ctx: &mut *ctx }, &args)
        })?;
        let table_handle = ctx.data_mut().handles.add(HostObject::Table(table));
        put_handle(ctx, pp_vtab, table_handle)?;
        trace!(handle = table_handle, create, "virtual table instantiated");
        Ok(())
    })();
    report(ctx, ErrorSink::Out(pz_err), result)
}

pub(crate) fn disconnect_callback(ctx: &mut StoreContextMut<'_, ConnState>, p_vtab: u32) -> u32 {
    let result = del_handle(ctx, p_vtab).map(|_| {
        trace!("virtual table disconnected");
    });
    report(ctx, ErrorSink::Discard, result)
}

pub(crate) fn destroy_callback(ctx: &mut StoreContextMut<'_, ConnState>, p_vtab: u32) -> u32 {
    let result = (|| {
        let handle = handle_at(ctx, p_vtab)?;
        let hook_result = {
            let table = table_object(ctx, handle)?;
            catch_callback(|| table.destroy())
        };
        // The instance is released even if the destroy hook failed.
        let removed = ctx.data_mut().handles.remove(handle).map(|_| ());
        hook_result.and(removed)
    })();
    report(ctx, ErrorSink::Discard, result)
}

pub(crate) fn best_index_callback(
    ctx: &mut StoreContextMut<'_, ConnState>,
    p_vtab: u32,
    p_info: u32,
) -> u32 {
    let result = (|| {
        let mut info = index_info::load(ctx, p_info)?;
        let handle = handle_at(ctx, p_vtab)?;
        {
            let table = table_object(ctx, handle)?;
            catch_callback(|| table.best_index(&mut info))?;
        }
        index_info::save(ctx, p_info, &info)
    })();
    report(ctx, ErrorSink::Table(p_vtab), result)
}

pub(crate) fn open_callback(
    ctx: &mut StoreContextMut<'_, ConnState>,
    p_vtab: u32,
    pp_cur: u32,
) -> u32 {
    let result = (|| {
        let handle = handle_at(ctx, p_vtab)?;
        let cursor = {
            let table = table_object(ctx, handle)?;
            catch_callback(|| table.open())?
        };
        let cursor_handle = ctx.data_mut().handles.add(HostObject::Cursor(cursor));
        put_handle(ctx, pp_cur, cursor_handle)?;
        trace!(handle = cursor_handle, "cursor opened");
        Ok(())
    })();
    report(ctx, ErrorSink::Table(p_vtab), result)
}

pub(crate) fn close_callback(ctx: &mut StoreContextMut<'_, ConnState>, p_cur: u32) -> u32 {
    let result = del_handle(ctx, p_cur).map(|_| {
        trace!("cursor closed");
    });
    report(ctx, ErrorSink::Discard, result)
}

pub(crate) fn filter_callback(
    ctx: &mut StoreContextMut<'_, ConnState>,
    p_cur: u32,
    idx_num: u32,
    idx_str: u32,
    argc: u32,
    argv: u32,
) -> u32 {
    let result = (|| {
        let args = value::read_values(ctx, argc, argv)?;
        let idx_name = if idx_str != 0 {
            Some(guest::read_string(ctx, idx_str)?)
        } else {
            None
        };
        let handle = handle_at(ctx, p_cur)?;
        let cursor = cursor_object(ctx, handle)?;
        catch_callback(move || cursor.filter(idx_num as i32, idx_name.as_deref(), args))
    })();
    report(ctx, ErrorSink::Cursor(p_cur), result)
}

pub(crate) fn next_callback(ctx: &mut StoreContextMut<'_, ConnState>, p_cur: u32) -> u32 {
    let result = (|| {
        let handle = handle_at(ctx, p_cur)?;
        let cursor = cursor_object(ctx, handle)?;
        catch_callback(|| cursor.next())
    })();
    report(ctx, ErrorSink::Cursor(p_cur), result)
}

pub(crate) fn eof_callback(ctx: &mut StoreContextMut<'_, ConnState>, p_cur: u32) -> u32 {
    let result = (|| {
        let handle = handle_at(ctx, p_cur)?;
        let cursor = cursor_object(ctx, handle)?;
        catch_callback(|| Ok(cursor.eof()))
    })();
    match result {
        Ok(false) => 0,
        Ok(true) => 1,
        Err(e) => {
            // No error channel here; report exhaustion so the scan stops.
            error!(error = %e, "eof callback failed");
            1
        }
    }
}

pub(crate) fn column_callback(
    ctx: &mut StoreContextMut<'_, ConnState>,
    p_cur: u32,
    p_res_ctx: u32,
    n: u32,
) -> u32 {
    let result = (|| {
        let handle = handle_at(ctx, p_cur)?;
        let column = {
            let cursor = cursor_object(ctx, handle)?;
            catch_callback(|| cursor.column(n as usize))?
        };
        value::write_result(ctx, p_res_ctx, &column)
    })();
    report(ctx, ErrorSink::Cursor(p_cur), result)
}

pub(crate) fn rowid_callback(
    ctx: &mut StoreContextMut<'_, ConnState>,
    p_cur: u32,
    p_rowid: u32,
) -> u32 {
    let result = (|| {
        let handle = handle_at(ctx, p_cur)?;
        let rowid = {
            let cursor = cursor_object(ctx, handle)?;
            catch_callback(|| cursor.rowid())?
        };
        Ok(memory::write_i64(guest::mem_mut(ctx)?, p_rowid, rowid)?)
    })();
    report(ctx, ErrorSink::Cursor(p_cur), result)
}

pub(crate) fn update_callback(
    ctx: &mut StoreContextMut<'_, ConnState>,
    p_vtab: u32,
    argc: u32,
    argv: u32,
    p_rowid: u32,
) -> u32 {
    let result = (|| {
        let args = value::read_values(ctx, argc, argv)?;
        let handle = handle_at(ctx, p_vtab)?;
        let rowid = {
            let table = table_object(ctx, handle)?;
            catch_callback(move || table.update(args))?
        };
        Ok(memory::write_i64(guest::mem_mut(ctx)?, p_rowid, rowid)?)
    })();
    report(ctx, ErrorSink::Table(p_vtab), result)
}

pub(crate) fn rename_callback(
    ctx: &mut StoreContextMut<'_, ConnState>,
    p_vtab: u32,
    z_new: u32,
) -> u32 {
    let result = (|| {
        let new_name = guest::read_string(ctx, z_new)?;
        let handle = handle_at(ctx, p_vtab)?;
        let table = table_object(ctx, handle)?;
        catch_callback(move || table.rename(&new_name))
    })();
    report(ctx, ErrorSink::Table(p_vtab), result)
}

pub(crate) fn find_function_callback(
    ctx: &mut StoreContextMut<'_, ConnState>,
    p_vtab: u32,
    n_arg: u32,
    z_name: u32,
    px_func: u32,
) -> u32 {
    let result: Result<u32> = (|| {
        let name = guest::read_string(ctx, z_name)?;
        let handle = handle_at(ctx, p_vtab)?;
        let found = {
            let table = table_object(ctx, handle)?;
            catch_callback(move || table.find_function(n_arg as i32, &name))?
        };
        match found {
            Some((func, op)) => {
                let func_handle = ctx
                    .data_mut()
                    .handles
                    .add(HostObject::Scalar(Arc::new(ScalarDef { func })));
                memory::write_u32(guest::mem_mut(ctx)?, px_func, func_handle)?;
                // Zero means "not overloaded"; a plain overload reports 1.
                Ok(if op.0 == 0 { 1 } else { op.0 as u32 })
            }
            None => Ok(0),
        }
    })();
    match result {
        Ok(op) => op,
        Err(e) => {
            error!(error = %e, "find-function callback failed");
            0
        }
    }
}

pub(crate) fn integrity_callback(
    ctx: &mut StoreContextMut<'_, ConnState>,
    p_vtab: u32,
    z_schema: u32,
    z_table: u32,
    m_flags: u32,
    pz_err: u32,
) -> u32 {
    let result = (|| {
        let schema = guest::read_string(ctx, z_schema)?;
        let table_name = guest::read_string(ctx, z_table)?;
        let handle = handle_at(ctx, p_vtab)?;
        let table = table_object(ctx, handle)?;
        catch_callback(move || table.integrity(&schema, &table_name, m_flags as usize))
    })();
    match result {
        // Content problems are reported through the message slot with a
        // success code; only a failed evaluation returns non-success.
        Ok(None) => codes::OK,
        Ok(Some(finding)) => {
            let _ = report(
                ctx,
                ErrorSink::Out(pz_err),
                Err(Error::engine(codes::OK, finding)),
            );
            codes::OK
        }
        Err(err) => report(ctx, ErrorSink::Out(pz_err), Err(err)),
    }
}

macro_rules! tx_callback {
    ($name:ident, $method:ident) => {
        pub(crate) fn $name(ctx: &mut StoreContextMut<'_, ConnState>, p_vtab: u32) -> u32 {
            let result = (|| {
                let handle = handle_at(ctx, p_vtab)?;
                let table = table_object(ctx, handle)?;
                catch_callback(|| table.$method())
            })();
            report(ctx, ErrorSink::Table(p_vtab), result)
        }
    };
}

tx_callback!(begin_callback, begin);
tx_callback!(sync_callback, sync);
tx_callback!(commit_callback, commit);
tx_callback!(rollback_callback, rollback);

macro_rules! savepoint_op {
    ($name:ident, $method:ident) => {
        pub(crate) fn $name(
            ctx: &mut StoreContextMut<'_, ConnState>,
            p_vtab: u32,
            id: u32,
        ) -> u32 {
            let result = (|| {
                let handle = handle_at(ctx, p_vtab)?;
                let table = table_object(ctx, handle)?;
                catch_callback(|| table.$method(id as i32))
            })();
            report(ctx, ErrorSink::Table(p_vtab), result)
        }
    };
}

savepoint_op!(savepoint_callback, savepoint);
savepoint_op!(release_callback, release);
savepoint_op!(rollback_to_callback, rollback_to);

// ---------------------------------------------------------------------------
// Linker wiring
// ---------------------------------------------------------------------------

/// Register the virtual-table callback table under the `host` namespace.
pub(crate) fn add_to_linker(linker: &mut Linker<ConnState>) -> Result<()> {
    let wrap = |e: wasmtime::Error| {
        Error::Runtime(wasqlite_runtime::RuntimeError::Instantiation(e.to_string()))
    };

    linker
        .func_wrap(
            "host",
            "vtab_create",
            |mut caller: Caller<'_, ConnState>,
             p_mod: i32,
             argc: i32,
             argv: i32,
             pp_vtab: i32,
             pz_err: i32|
             -> i32 {
                let mut ctx = caller.as_context_mut();
                constructor_callback(
                    &mut ctx,
                    true,
                    p_mod as u32,
                    argc as u32,
                    argv as u32,
                    pp_vtab as u32,
                    pz_err as u32,
                ) as i32
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "host",
            "vtab_connect",
            |mut caller: Caller<'_, ConnState>,
             p_mod: i32,
             argc: i32,
             argv: i32,
             pp_vtab: i32,
             pz_err: i32|
             -> i32 {
                let mut ctx = caller.as_context_mut();
                constructor_callback(
                    &mut ctx,
                    false,
                    p_mod as u32,
                    argc as u32,
                    argv as u32,
                    pp_vtab as u32,
                    pz_err as u32,
                ) as i32
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "host",
            "vtab_disconnect",
            |mut caller: Caller<'_, ConnState>, p_vtab: i32| -> i32 {
                disconnect_callback(&mut caller.as_context_mut(), p_vtab as u32) as i32
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "host",
            "vtab_destroy",
            |mut caller: Caller<'_, ConnState>, p_vtab: i32| -> i32 {
                destroy_callback(&mut caller.as_context_mut(), p_vtab as u32) as i32
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "host",
            "vtab_best_index",
            |mut caller: Caller<'_, ConnState>, p_vtab: i32, p_info: i32| -> i32 {
                best_index_callback(&mut caller.as_context_mut(), p_vtab as u32, p_info as u32)
                    as i32
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "host",
            "vtab_open",
            |mut caller: Caller<'_, ConnState>, p_vtab: i32, pp_cur: i32| -> i32 {
                open_callback(&mut caller.as_context_mut(), p_vtab as u32, pp_cur as u32) as i32
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "host",
            "vtab_close",
            |mut caller: Caller<'_, ConnState>, p_cur: i32| -> i32 {
                close_callback(&mut caller.as_context_mut(), p_cur as u32) as i32
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "host",
            "vtab_filter",
            |mut caller: Caller<'_, ConnState>,
             p_cur: i32,
             idx_num: i32,
             idx_str: i32,
             argc: i32,
             argv: i32|
             -> i32 {
                let mut ctx = caller.as_context_mut();
                filter_callback(
                    &mut ctx,
                    p_cur as u32,
                    idx_num as u32,
                    idx_str as u32,
                    argc as u32,
                    argv as u32,
                ) as i32
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "host",
            "vtab_next",
            |mut caller: Caller<'_, ConnState>, p_cur: i32| -> i32 {
                next_callback(&mut caller.as_context_mut(), p_cur as u32) as i32
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "host",
            "vtab_eof",
            |mut caller: Caller<'_, ConnState>, p_cur: i32| -> i32 {
                eof_callback(&mut caller.as_context_mut(), p_cur as u32) as i32
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "host",
            "vtab_column",
            |mut caller: Caller<'_, ConnState>, p_cur: i32, p_ctx: i32, n: i32| -> i32 {
                column_callback(
                    &mut caller.as_context_mut(),
                    p_cur as u32,
                    p_ctx as u32,
                    n as u32,
                ) as i32
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "host",
            "vtab_rowid",
            |mut caller: Caller<'_, ConnState>, p_cur: i32, p_rowid: i32| -> i32 {
                rowid_callback(&mut caller.as_context_mut(), p_cur as u32, p_rowid as u32) as i32
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "host",
            "vtab_update",
            |mut caller: Caller<'_, ConnState>,
             p_vtab: i32,
             argc: i32,
             argv: i32,
             p_rowid: i32|
             -> i32 {
                let mut ctx = caller.as_context_mut();
                update_callback(
                    &mut ctx,
                    p_vtab as u32,
                    argc as u32,
                    argv as u32,
                    p_rowid as u32,
                ) as i32
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "host",
            "vtab_rename",
            |mut caller: Caller<'_, ConnState>, p_vtab: i32, z_new: i32| -> i32 {
                rename_callback(&mut caller.as_context_mut(), p_vtab as u32, z_new as u32) as i32
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "host",
            "vtab_find_function",
            |mut caller: Caller<'_, ConnState>,
             p_vtab: i32,
             n_arg: i32,
             z_name: i32,
             px_func: i32|
             -> i32 {
                let mut ctx = caller.as_context_mut();
                find_function_callback(
                    &mut ctx,
                    p_vtab as u32,
                    n_arg as u32,
                    z_name as u32,
                    px_func as u32,
                ) as i32
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "host",
            "vtab_integrity",
            |mut caller: Caller<'_, ConnState>,
             p_vtab: i32,
             z_schema: i32,
             z_table: i32,
             m_flags: i32,
             pz_err: i32|
             -> i32 {
                let mut ctx = caller.as_context_mut();
                integrity_callback(
                    &mut ctx,
                    p_vtab as u32,
                    z_schema as u32,
                    z_table as u32,
                    m_flags as u32,
                    pz_err as u32,
                ) as i32
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "host",
            "vtab_begin",
            |mut caller: Caller<'_, ConnState>, p_vtab: i32| -> i32 {
                begin_callback(&mut caller.as_context_mut(), p_vtab as u32) as i32
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "host",
            "vtab_sync",
            |mut caller: Caller<'_, ConnState>, p_vtab: i32| -> i32 {
                sync_callback(&mut caller.as_context_mut(), p_vtab as u32) as i32
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "host",
            "vtab_commit",
            |mut caller: Caller<'_, ConnState>, p_vtab: i32| -> i32 {
                commit_callback(&mut caller.as_context_mut(), p_vtab as u32) as i32
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "host",
            "vtab_rollback",
            |mut caller: Caller<'_, ConnState>, p_vtab: i32| -> i32 {
                rollback_callback(&mut caller.as_context_mut(), p_vtab as u32) as i32
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "host",
            "vtab_savepoint",
            |mut caller: Caller<'_, ConnState>, p_vtab: i32, id: i32| -> i32 {
                savepoint_callback(&mut caller.as_context_mut(), p_vtab as u32, id as u32) as i32
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "host",
            "vtab_release",
            |mut caller: Caller<'_, ConnState>, p_vtab: i32, id: i32| -> i32 {
                release_callback(&mut caller.as_context_mut(), p_vtab as u32, id as u32) as i32
            },
        )
        .map_err(wrap)?;

    linker
        .func_wrap(
            "host",
            "vtab_rollback_to",
            |mut caller: Caller<'_, ConnState>, p_vtab: i32, id: i32| -> i32 {
                rollback_to_callback(&mut caller.as_context_mut(), p_vtab as u32, id as u32)
                    as i32
            },
        )
        .map_err(wrap)?;

    Ok(())
}
