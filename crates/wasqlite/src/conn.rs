//! Engine images and connections.
//!
//! A [`Sqlite`] is one compiled engine binary; [`Sqlite::connect`] gives
//! each connection its own guest instance, so connections are fully
//! isolated and never share mutable guest state. Within a connection all
//! calls are strictly sequential: the store sits behind a `RefCell`, and a
//! connection is deliberately not `Sync`.

use crate::arena;
use crate::config::Config;
use crate::error::{codes, Error, Result};
use crate::func::{AggregateFunction, WindowFunction};
use crate::guest::{self, api, with_arena, ConnState};
use crate::linker::create_linker;
use crate::stmt::Stmt;
use crate::value::Value;
use crate::vtab;
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use wasmtime::{AsContextMut, Engine, Store, StoreContextMut, UpdateDeadline};
use wasqlite_runtime::{memory, ModuleCache, RuntimeError};

/// A compiled engine binary, ready to open connections.
pub struct Sqlite {
    cache: Arc<ModuleCache>,
    module: Arc<wasqlite_runtime::CompiledModule>,
}

impl Sqlite {
    /// Compile an engine binary (or fetch it from the cache).
    pub fn new(wasm_bytes: &[u8]) -> Result<Self> {
        let mut wasm_config = wasmtime::Config::new();
        wasm_config.epoch_interruption(true);
        let engine = Engine::new(&wasm_config)
            .map_err(|e| RuntimeError::Instantiation(e.to_string()))?;
        let cache = Arc::new(ModuleCache::with_engine(engine));
        let module = cache.get_or_compile(wasm_bytes)?;
        Ok(Self { cache, module })
    }

    /// Load an engine binary from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref()).map_err(RuntimeError::from)?;
        Self::new(&bytes)
    }

    /// Open a connection with default configuration.
    pub fn connect(&self, path: &str) -> Result<Conn> {
        self.connect_with(path, Config::default())
    }

    /// Open a connection.
    ///
    /// Instantiates a fresh guest instance for this connection, allocates
    /// its scratch arena, opens the database, and applies every
    /// process-globally registered virtual-table module.
    pub fn connect_with(&self, path: &str, config: Config) -> Result<Conn> {
        let engine = self.cache.engine().clone();
        let interrupted = Arc::new(AtomicBool::new(false));

        let mut store = Store::new(&engine, ConnState::new(config.clone(), interrupted.clone()));
        store.limiter(|state| &mut state.limits);
        store.set_epoch_deadline(1);
        store.epoch_deadline_callback(|ctx| {
            if ctx.data().interrupted.load(AtomicOrdering::SeqCst) {
                Err(wasmtime::Error::msg("interrupted"))
            } else {
                Ok(UpdateDeadline::Continue(1))
            }
        });

        let linker = create_linker(&engine)?;
        let instance = linker
            .instantiate(&mut store, self.module.module())
            .map_err(|e| RuntimeError::Instantiation(e.to_string()))?;
        let memory_export = instance
            .get_memory(&mut store, "memory")
            .ok_or(RuntimeError::MissingMemory)?;
        {
            let state = store.data_mut();
            state.instance = Some(instance);
            state.memory = Some(memory_export);
        }

        // Reactor-style WASI builds export _initialize.
        if let Some(init) = instance.get_func(&mut store, "_initialize") {
            init.call(&mut store, &[], &mut [])
                .map_err(|e| RuntimeError::Instantiation(e.to_string()))?;
        }

        let db = {
            let mut ctx = store.as_context_mut();
            arena::init(&mut ctx, config.arena_size)?;
            with_arena(&mut ctx, |ctx| {
                let path_ptr = arena::string(ctx, path)?;
                let pp_db = arena::alloc(ctx, 4)?;
                let rc = guest::call(
                    ctx,
                    api::OPEN,
                    &[
                        path_ptr as u64,
                        pp_db as u64,
                        config.open_flags as u64,
                        0,
                    ],
                )?;
                let db = memory::read_u32(guest::mem(ctx)?, pp_db)?;
                ctx.data_mut().db = db;
                if rc as u32 != codes::OK {
                    let err = guest::db_error(ctx, rc as u32);
                    if db != 0 {
                        let _ = guest::call(ctx, api::CLOSE, &[db as u64]);
                        ctx.data_mut().db = 0;
                    }
                    return Err(err);
                }
                Ok(db)
            })?
        };
        debug!(path, db, "connection opened");

        let conn = Conn {
            store: RefCell::new(store),
            db,
            engine,
            interrupted,
            closed: Cell::new(false),
        };

        for (name, module) in vtab::registered_modules() {
            conn.with_ctx(|ctx| vtab::create_module(ctx, &name, module))?;
        }

        Ok(conn)
    }
}

/// One open connection, backed by its own guest instance.
///
/// At most one call is in flight at a time; the guest instance is not
/// reentrant-safe, so the store is guarded and `Conn` is not `Sync`.
/// Callbacks nest inside an in-progress call on the guest's stack, which is
/// the one sanctioned form of nesting.
pub struct Conn {
    store: RefCell<Store<ConnState>>,
    pub(crate) db: u32,
    engine: Engine,
    interrupted: Arc<AtomicBool>,
    closed: Cell<bool>,
}

/// Requests cooperative cancellation of a connection's in-flight call.
///
/// Cloneable and usable from any thread. The abort surfaces at the call
/// site as the engine's `INTERRUPT` error.
#[derive(Clone)]
pub struct InterruptHandle {
    engine: Engine,
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.flag.store(true, AtomicOrdering::SeqCst);
        self.engine.increment_epoch();
    }
}

impl Conn {
    pub(crate) fn with_ctx<R>(
        &self,
        f: impl FnOnce(&mut StoreContextMut<'_, ConnState>) -> Result<R>,
    ) -> Result<R> {
        let mut store = self.store.borrow_mut();
        let mut ctx = store.as_context_mut();
        f(&mut ctx)
    }

    /// Get a handle for interrupting this connection's in-flight call.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            engine: self.engine.clone(),
            flag: self.interrupted.clone(),
        }
    }

    /// Execute SQL, stopping at the first error.
    pub fn exec(&self, sql: &str) -> Result<()> {
        let db = self.db;
        trace!(sql, "exec");
        self.with_ctx(|ctx| {
            with_arena(ctx, |ctx| {
                let sql_ptr = arena::string(ctx, sql)?;
                let pz_err = arena::alloc(ctx, 4)?;
                let rc = guest::call(
                    ctx,
                    api::EXEC,
                    &[db as u64, sql_ptr as u64, 0, 0, pz_err as u64],
                )?;
                if rc as u32 == codes::OK {
                    return Ok(());
                }
                // The engine allocated the message through its own
                // allocator; read it, then hand it back to be freed.
                let err_ptr = memory::read_u32(guest::mem(ctx)?, pz_err)?;
                let mut err = guest::db_error(ctx, rc as u32);
                if err_ptr != 0 {
                    if let Ok(msg) = guest::read_string(ctx, err_ptr) {
                        if let Error::Engine { message, .. } = &mut err {
                            *message = msg;
                        }
                    }
                    guest::free(ctx, err_ptr)?;
                }
                Err(err)
            })
        })
    }

    /// Compile the first statement in `sql`.
    ///
    /// Returns the compiled statement (`None` for empty input or a bare
    /// comment) and the byte offset of the unconsumed tail.
    pub fn prepare(&self, sql: &str) -> Result<(Option<Stmt<'_>>, usize)> {
        let db = self.db;
        let (raw, consumed) = self.with_ctx(|ctx| {
            with_arena(ctx, |ctx| {
                let sql_ptr = arena::string(ctx, sql)?;
                let pp_stmt = arena::alloc(ctx, 4)?;
                let pz_tail = arena::alloc(ctx, 4)?;
                let rc = guest::call(
                    ctx,
                    api::PREPARE,
                    &[
                        db as u64,
                        sql_ptr as u64,
                        sql.len() as u64 + 1,
                        0,
                        pp_stmt as u64,
                        pz_tail as u64,
                    ],
                )?;
                let (raw, tail_ptr) = {
                    let m = guest::mem(ctx)?;
                    (
                        memory::read_u32(m, pp_stmt)?,
                        memory::read_u32(m, pz_tail)?,
                    )
                };
                guest::check(ctx, rc)?;
                let consumed = if tail_ptr >= sql_ptr {
                    ((tail_ptr - sql_ptr) as usize).min(sql.len())
                } else {
                    sql.len()
                };
                Ok((raw, consumed))
            })
        })?;
        trace!(sql, raw, consumed, "prepared");
        Ok((
            (raw != 0).then(|| Stmt::new(self, raw)),
            consumed,
        ))
    }

    /// Rows changed by the most recent mutation.
    pub fn changes(&self) -> Result<i64> {
        let db = self.db;
        self.with_ctx(|ctx| Ok(guest::call(ctx, api::CHANGES, &[db as u64])? as i64))
    }

    /// Rowid of the most recent successful insert.
    pub fn last_insert_rowid(&self) -> Result<i64> {
        let db = self.db;
        self.with_ctx(|ctx| {
            Ok(guest::call(ctx, api::LAST_INSERT_ROWID, &[db as u64])? as i64)
        })
    }

    /// Register a scalar SQL function.
    pub fn create_function(
        &self,
        name: &str,
        n_arg: i32,
        flags: u32,
        f: impl Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    ) -> Result<()> {
        self.with_ctx(|ctx| crate::func::register_scalar(ctx, name, n_arg, flags, Arc::new(f)))
    }

    /// Register an aggregate SQL function.
    pub fn create_aggregate<A: AggregateFunction + 'static>(
        &self,
        name: &str,
        n_arg: i32,
        flags: u32,
        factory: impl Fn() -> A + Send + Sync + 'static,
    ) -> Result<()> {
        self.with_ctx(|ctx| crate::func::register_aggregate(ctx, name, n_arg, flags, factory))
    }

    /// Register a window SQL function.
    pub fn create_window<A: WindowFunction + 'static>(
        &self,
        name: &str,
        n_arg: i32,
        flags: u32,
        factory: impl Fn() -> A + Send + Sync + 'static,
    ) -> Result<()> {
        self.with_ctx(|ctx| crate::func::register_window(ctx, name, n_arg, flags, factory))
    }

    /// Register a collation.
    pub fn create_collation(
        &self,
        name: &str,
        cmp: impl Fn(&[u8], &[u8]) -> Ordering + Send + Sync + 'static,
    ) -> Result<()> {
        self.with_ctx(|ctx| crate::func::register_collation(ctx, name, cmp))
    }

    /// Register a virtual-table module on this connection.
    pub fn create_module<T: vtab::VTab>(&self, name: &str, module: vtab::Module<T>) -> Result<()> {
        self.with_ctx(|ctx| vtab::create_module(ctx, name, Arc::new(module)))
    }

    fn close_inner(&self) -> Result<()> {
        if self.closed.replace(true) {
            return Ok(());
        }
        let db = self.db;
        self.with_ctx(|ctx| {
            let rc = guest::call(ctx, api::CLOSE, &[db as u64])?;
            guest::check(ctx, rc)
        })
    }

    /// Close the connection, surfacing any engine error.
    pub fn close(self) -> Result<()> {
        self.close_inner()
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        if let Err(e) = self.close_inner() {
            warn!(error = %e, "failed to close connection");
        }
    }
}
