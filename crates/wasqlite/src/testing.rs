//! Test fixtures: a WAT-assembled stub engine.
//!
//! The stub exports the guest surface the bridge drives (allocator, open,
//! exec, prepare/step/bind/column, value/result accessors, registration
//! shims) with recording behavior controlled through exported mutable
//! globals, so tests can script engine responses and observe exactly what
//! crossed the boundary. It also imports two host callbacks, proving the
//! linker's callback table resolves.

use crate::config::Config;
use crate::error::Result;
use crate::guest::ConnState;
use crate::linker::create_linker;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use wasmtime::{AsContextMut, Engine, Instance, Module, Store, StoreContextMut, Val};

const STUB_WAT: &str = r#"
(module
  (import "host" "collation_compare" (func $host_collation (param i32 i32 i32 i32 i32) (result i32)))
  (import "host" "vtab_eof" (func $host_eof (param i32) (result i32)))

  (memory (export "memory") 4)

  (data (i32.const 16) "boom\00")
  (data (i32.const 32) "exec failed\00")
  (data (i32.const 48) "generic engine error\00")

  (global $heap (export "heap") (mut i32) (i32.const 65536))
  (global $malloc_fail (export "malloc_fail") (mut i32) (i32.const 0))
  (global $free_count (export "free_count") (mut i32) (i32.const 0))
  (global $rc_open (export "rc_open") (mut i32) (i32.const 0))
  (global $open_flags (export "open_flags") (mut i32) (i32.const 0))
  (global $rc_exec (export "rc_exec") (mut i32) (i32.const 0))
  (global $exec_fail (export "exec_fail") (mut i32) (i32.const 0))
  (global $exec_sql (export "exec_sql") (mut i32) (i32.const 0))
  (global $rc_prepare (export "rc_prepare") (mut i32) (i32.const 0))
  (global $prepare_null (export "prepare_null") (mut i32) (i32.const 0))
  (global $prepare_sql (export "prepare_sql") (mut i32) (i32.const 0))
  (global $finalize_count (export "finalize_count") (mut i32) (i32.const 0))
  (global $rc_step (export "rc_step") (mut i32) (i32.const 101))
  (global $rows_remaining (export "rows_remaining") (mut i32) (i32.const 0))
  (global $rc_bind (export "rc_bind") (mut i32) (i32.const 0))
  (global $bind_kind (export "bind_kind") (mut i32) (i32.const 0))
  (global $bind_idx (export "bind_idx") (mut i32) (i32.const 0))
  (global $bind_ptr (export "bind_ptr") (mut i32) (i32.const 0))
  (global $bind_len (export "bind_len") (mut i32) (i32.const 0))
  (global $bind_int (export "bind_int") (mut i64) (i64.const 0))
  (global $bind_f64 (export "bind_f64") (mut f64) (f64.const 0))
  (global $col_count (export "col_count") (mut i32) (i32.const 0))
  (global $col_type (export "col_type") (mut i32) (i32.const 5))
  (global $col_ptr (export "col_ptr") (mut i32) (i32.const 0))
  (global $col_len (export "col_len") (mut i32) (i32.const 0))
  (global $col_int (export "col_int") (mut i64) (i64.const 0))
  (global $col_f64 (export "col_f64") (mut f64) (f64.const 0))
  (global $res_kind (export "res_kind") (mut i32) (i32.const 0))
  (global $res_ptr (export "res_ptr") (mut i32) (i32.const 0))
  (global $res_len (export "res_len") (mut i32) (i32.const 0))
  (global $res_code (export "res_code") (mut i32) (i32.const 0))
  (global $res_int (export "res_int") (mut i64) (i64.const 0))
  (global $res_f64 (export "res_f64") (mut f64) (f64.const 0))
  (global $rc_declare (export "rc_declare") (mut i32) (i32.const 0))
  (global $declare_count (export "declare_count") (mut i32) (i32.const 0))
  (global $declare_sql (export "declare_sql") (mut i32) (i32.const 0))
  (global $rc_register (export "rc_register") (mut i32) (i32.const 0))
  (global $reg_flags (export "reg_flags") (mut i32) (i32.const 0))
  (global $reg_handle (export "reg_handle") (mut i32) (i32.const 0))
  (global $reg_count (export "reg_count") (mut i32) (i32.const 0))
  (global $errcode (export "errcode") (mut i32) (i32.const 0))
  (global $changes (export "changes") (mut i64) (i64.const 0))
  (global $last_rowid (export "last_rowid") (mut i64) (i64.const 0))
  (global $rhs_col (export "rhs_col") (mut i32) (i32.const -1))
  (global $rhs_ptr (export "rhs_ptr") (mut i32) (i32.const 0))

  (func $malloc (export "sqlite3_malloc") (param $n i32) (result i32)
    (local $ptr i32)
    global.get $malloc_fail
    if (result i32)
      i32.const 0
    else
      global.get $heap
      i32.const 7
      i32.add
      i32.const -8
      i32.and
      local.tee $ptr
      local.get $n
      i32.add
      global.set $heap
      local.get $ptr
    end)

  (func (export "sqlite3_free") (param $ptr i32)
    global.get $free_count
    i32.const 1
    i32.add
    global.set $free_count)

  (func (export "sqlite3_open_v2") (param $path i32) (param $ppdb i32) (param $flags i32) (param $vfs i32) (result i32)
    local.get $flags
    global.set $open_flags
    local.get $ppdb
    i32.const 4096
    i32.store
    global.get $rc_open)

  (func (export "sqlite3_close") (param $db i32) (result i32)
    i32.const 0)

  (func (export "sqlite3_exec") (param $db i32) (param $sql i32) (param $cb i32) (param $arg i32) (param $pzerr i32) (result i32)
    (local $ptr i32)
    local.get $sql
    global.set $exec_sql
    global.get $exec_fail
    i32.eqz
    if (result i32)
      i32.const 0
    else
      i32.const 12
      call $malloc
      local.set $ptr
      local.get $ptr
      i32.const 32
      i32.const 12
      memory.copy
      local.get $pzerr
      local.get $ptr
      i32.store
      global.get $rc_exec
    end)

  (func (export "sqlite3_errmsg") (param $db i32) (result i32)
    i32.const 16)

  (func (export "sqlite3_errstr") (param $rc i32) (result i32)
    i32.const 48)

  (func (export "sqlite3_extended_errcode") (param $db i32) (result i32)
    global.get $errcode)

  (func (export "sqlite3_prepare_v3") (param $db i32) (param $sql i32) (param $nbyte i32) (param $flags i32) (param $ppstmt i32) (param $pztail i32) (result i32)
    local.get $sql
    global.set $prepare_sql
    local.get $ppstmt
    global.get $prepare_null
    if (result i32)
      i32.const 0
    else
      i32.const 8192
    end
    i32.store
    local.get $pztail
    local.get $sql
    local.get $nbyte
    i32.add
    i32.const 1
    i32.sub
    i32.store
    global.get $rc_prepare)

  (func (export "sqlite3_finalize") (param $stmt i32) (result i32)
    global.get $finalize_count
    i32.const 1
    i32.add
    global.set $finalize_count
    i32.const 0)

  (func (export "sqlite3_reset") (param $stmt i32) (result i32)
    i32.const 0)

  (func (export "sqlite3_clear_bindings") (param $stmt i32) (result i32)
    i32.const 0)

  (func (export "sqlite3_step") (param $stmt i32) (result i32)
    global.get $rows_remaining
    i32.const 0
    i32.gt_s
    if (result i32)
      global.get $rows_remaining
      i32.const 1
      i32.sub
      global.set $rows_remaining
      i32.const 100
    else
      global.get $rc_step
    end)

  (func (export "sqlite3_bind_null") (param $stmt i32) (param $idx i32) (result i32)
    i32.const 1
    global.set $bind_kind
    local.get $idx
    global.set $bind_idx
    global.get $rc_bind)

  (func (export "sqlite3_bind_int64") (param $stmt i32) (param $idx i32) (param $v i64) (result i32)
    i32.const 2
    global.set $bind_kind
    local.get $idx
    global.set $bind_idx
    local.get $v
    global.set $bind_int
    global.get $rc_bind)

  (func (export "sqlite3_bind_double") (param $stmt i32) (param $idx i32) (param $v f64) (result i32)
    i32.const 3
    global.set $bind_kind
    local.get $idx
    global.set $bind_idx
    local.get $v
    global.set $bind_f64
    global.get $rc_bind)

  (func (export "sqlite3_bind_text") (param $stmt i32) (param $idx i32) (param $ptr i32) (param $len i32) (param $destr i32) (result i32)
    i32.const 4
    global.set $bind_kind
    local.get $idx
    global.set $bind_idx
    local.get $ptr
    global.set $bind_ptr
    local.get $len
    global.set $bind_len
    global.get $rc_bind)

  (func (export "sqlite3_bind_blob") (param $stmt i32) (param $idx i32) (param $ptr i32) (param $len i32) (param $destr i32) (result i32)
    i32.const 5
    global.set $bind_kind
    local.get $idx
    global.set $bind_idx
    local.get $ptr
    global.set $bind_ptr
    local.get $len
    global.set $bind_len
    global.get $rc_bind)

  (func (export "sqlite3_bind_zeroblob64") (param $stmt i32) (param $idx i32) (param $n i64) (result i32)
    i32.const 6
    global.set $bind_kind
    local.get $idx
    global.set $bind_idx
    local.get $n
    global.set $bind_int
    global.get $rc_bind)

  (func (export "sqlite3_column_count") (param $stmt i32) (result i32)
    global.get $col_count)

  (func (export "sqlite3_column_name") (param $stmt i32) (param $idx i32) (result i32)
    global.get $col_ptr)

  (func (export "sqlite3_column_type") (param $stmt i32) (param $idx i32) (result i32)
    global.get $col_type)

  (func (export "sqlite3_column_int64") (param $stmt i32) (param $idx i32) (result i64)
    global.get $col_int)

  (func (export "sqlite3_column_double") (param $stmt i32) (param $idx i32) (result f64)
    global.get $col_f64)

  (func (export "sqlite3_column_text") (param $stmt i32) (param $idx i32) (result i32)
    global.get $col_ptr)

  (func (export "sqlite3_column_bytes") (param $stmt i32) (param $idx i32) (result i32)
    global.get $col_len)

  (func (export "sqlite3_column_blob") (param $stmt i32) (param $idx i32) (result i32)
    global.get $col_ptr)

  (func (export "sqlite3_changes64") (param $db i32) (result i64)
    global.get $changes)

  (func (export "sqlite3_last_insert_rowid") (param $db i32) (result i64)
    global.get $last_rowid)

  ;; Test-fabricated value records: type @0, numeric @8, len @16, ptr @20.
  (func (export "sqlite3_value_type") (param $v i32) (result i32)
    local.get $v
    i32.load)

  (func (export "sqlite3_value_int64") (param $v i32) (result i64)
    local.get $v
    i64.load offset=8)

  (func (export "sqlite3_value_double") (param $v i32) (result f64)
    local.get $v
    f64.load offset=8)

  (func (export "sqlite3_value_bytes") (param $v i32) (result i32)
    local.get $v
    i32.load offset=16)

  (func (export "sqlite3_value_text") (param $v i32) (result i32)
    local.get $v
    i32.load offset=20)

  (func (export "sqlite3_value_blob") (param $v i32) (result i32)
    local.get $v
    i32.load offset=20)

  (func (export "sqlite3_result_null") (param $ctx i32)
    i32.const 5
    global.set $res_kind)

  (func (export "sqlite3_result_int64") (param $ctx i32) (param $v i64)
    i32.const 1
    global.set $res_kind
    local.get $v
    global.set $res_int)

  (func (export "sqlite3_result_double") (param $ctx i32) (param $v f64)
    i32.const 2
    global.set $res_kind
    local.get $v
    global.set $res_f64)

  (func (export "sqlite3_result_text") (param $ctx i32) (param $ptr i32) (param $len i32) (param $destr i32)
    i32.const 3
    global.set $res_kind
    local.get $ptr
    global.set $res_ptr
    local.get $len
    global.set $res_len)

  (func (export "sqlite3_result_blob") (param $ctx i32) (param $ptr i32) (param $len i32) (param $destr i32)
    i32.const 4
    global.set $res_kind
    local.get $ptr
    global.set $res_ptr
    local.get $len
    global.set $res_len)

  (func (export "sqlite3_result_error") (param $ctx i32) (param $ptr i32) (param $len i32)
    i32.const 9
    global.set $res_kind
    local.get $ptr
    global.set $res_ptr
    local.get $len
    global.set $res_len)

  (func (export "sqlite3_result_error_code") (param $ctx i32) (param $code i32)
    local.get $code
    global.set $res_code)

  (func (export "sqlite3_declare_vtab") (param $db i32) (param $sql i32) (result i32)
    global.get $declare_count
    i32.const 1
    i32.add
    global.set $declare_count
    local.get $sql
    global.set $declare_sql
    global.get $rc_declare)

  (func (export "sqlite3_create_module_host") (param $db i32) (param $name i32) (param $flags i32) (param $handle i32) (result i32)
    local.get $flags
    global.set $reg_flags
    local.get $handle
    global.set $reg_handle
    global.get $reg_count
    i32.const 1
    i32.add
    global.set $reg_count
    global.get $rc_register)

  (func (export "sqlite3_create_function_host") (param $db i32) (param $name i32) (param $narg i32) (param $flags i32) (param $handle i32) (result i32)
    local.get $flags
    global.set $reg_flags
    local.get $handle
    global.set $reg_handle
    global.get $reg_count
    i32.const 1
    i32.add
    global.set $reg_count
    global.get $rc_register)

  (func (export "sqlite3_create_aggregate_host") (param $db i32) (param $name i32) (param $narg i32) (param $flags i32) (param $handle i32) (result i32)
    local.get $flags
    global.set $reg_flags
    local.get $handle
    global.set $reg_handle
    global.get $reg_count
    i32.const 1
    i32.add
    global.set $reg_count
    global.get $rc_register)

  (func (export "sqlite3_create_window_host") (param $db i32) (param $name i32) (param $narg i32) (param $flags i32) (param $handle i32) (result i32)
    local.get $flags
    global.set $reg_flags
    local.get $handle
    global.set $reg_handle
    global.get $reg_count
    i32.const 1
    i32.add
    global.set $reg_count
    global.get $rc_register)

  (func (export "sqlite3_create_collation_host") (param $db i32) (param $name i32) (param $handle i32) (result i32)
    local.get $handle
    global.set $reg_handle
    global.get $reg_count
    i32.const 1
    i32.add
    global.set $reg_count
    global.get $rc_register)

  (func (export "sqlite3_vtab_rhs_value_host") (param $pinfo i32) (param $col i32) (param $ppval i32) (result i32)
    local.get $col
    global.get $rhs_col
    i32.eq
    if (result i32)
      local.get $ppval
      global.get $rhs_ptr
      i32.store
      i32.const 0
    else
      i32.const 12
    end)

  (func (export "trap")
    unreachable)

  ;; Forwarders proving the host callback table is linked.
  (func (export "call_collation") (param i32 i32 i32 i32 i32) (result i32)
    local.get 0
    local.get 1
    local.get 2
    local.get 3
    local.get 4
    call $host_collation)

  (func (export "call_eof") (param i32) (result i32)
    local.get 0
    call $host_eof)
)
"#;

/// A store wired to the stub engine, mimicking an open connection.
pub(crate) struct Fixture {
    pub(crate) store: Store<ConnState>,
    pub(crate) instance: Instance,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        Self::with_config(Config::new())
    }

    pub(crate) fn with_config(config: Config) -> Self {
        let engine = Engine::default();
        let wasm = wat::parse_str(STUB_WAT).expect("stub assembles");
        let module = Module::new(&engine, &wasm).expect("stub compiles");
        let linker = create_linker(&engine).expect("linker builds");

        let arena_size = config.arena_size;
        let interrupted = Arc::new(AtomicBool::new(false));
        let mut store = Store::new(&engine, ConnState::new(config, interrupted));
        let instance = linker
            .instantiate(&mut store, &module)
            .expect("stub instantiates against the callback table");
        let memory = instance
            .get_memory(&mut store, "memory")
            .expect("stub exports memory");
        {
            let state = store.data_mut();
            state.instance = Some(instance);
            state.memory = Some(memory);
            state.db = 0x1000;
        }
        {
            let mut ctx = store.as_context_mut();
            crate::arena::init(&mut ctx, arena_size).expect("arena init");
        }

        Self { store, instance }
    }

    /// Borrow the store context, as `Conn::with_ctx` does.
    pub(crate) fn conn_op<R>(
        &mut self,
        f: impl FnOnce(&mut StoreContextMut<'_, ConnState>) -> Result<R>,
    ) -> Result<R> {
        let mut ctx = self.store.as_context_mut();
        f(&mut ctx)
    }

    pub(crate) fn ctx(&mut self) -> StoreContextMut<'_, ConnState> {
        self.store.as_context_mut()
    }

    fn global(&mut self, name: &str) -> Val {
        self.instance
            .get_global(&mut self.store, name)
            .unwrap_or_else(|| panic!("stub global {name}"))
            .get(&mut self.store)
    }

    pub(crate) fn global_i32(&mut self, name: &str) -> i32 {
        match self.global(name) {
            Val::I32(v) => v,
            other => panic!("global {name} is {other:?}, expected i32"),
        }
    }

    pub(crate) fn global_i64(&mut self, name: &str) -> i64 {
        match self.global(name) {
            Val::I64(v) => v,
            other => panic!("global {name} is {other:?}, expected i64"),
        }
    }

    pub(crate) fn set_global_i32(&mut self, name: &str, value: i32) {
        let global = self
            .instance
            .get_global(&mut self.store, name)
            .unwrap_or_else(|| panic!("stub global {name}"));
        global.set(&mut self.store, Val::I32(value)).unwrap();
    }

    pub(crate) fn set_global_i64(&mut self, name: &str, value: i64) {
        let global = self
            .instance
            .get_global(&mut self.store, name)
            .unwrap_or_else(|| panic!("stub global {name}"));
        global.set(&mut self.store, Val::I64(value)).unwrap();
    }

    /// Read a string the bridge wrote into guest memory.
    pub(crate) fn read_guest_string(&mut self, ptr: u32) -> String {
        self.conn_op(|ctx| crate::guest::read_string(ctx, ptr))
            .expect("guest string")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest;
    use crate::handle::HostObject;
    use crate::value::Value;
    use std::sync::Arc;

    #[test]
    fn test_fixture_instantiates_against_callback_table() {
        let mut fx = Fixture::new();
        // The stub imported host.collation_compare and host.vtab_eof and
        // linked; a basic call proves the wiring.
        let rc = fx
            .conn_op(|ctx| guest::call(ctx, "sqlite3_close", &[0x1000]))
            .unwrap();
        assert_eq!(rc, 0);
    }

    #[test]
    fn test_collation_roundtrip_through_guest() {
        let mut fx = Fixture::new();

        // Register a byte-reversing collation and write two operands.
        let handle = fx.store.data_mut().handles.add(HostObject::Collation(Arc::new(
            crate::func::CollationDef {
                cmp: Box::new(|a: &[u8], b: &[u8]| b.cmp(a)),
            },
        )));
        fx.conn_op(|ctx| {
            let m = guest::mem_mut(ctx)?;
            wasqlite_runtime::memory::write_bytes(m, 0x300, b"abc")?;
            wasqlite_runtime::memory::write_bytes(m, 0x310, b"abd")?;
            Ok(())
        })
        .unwrap();

        // Guest code calls back through the imported collation trampoline.
        let rc = fx
            .conn_op(|ctx| {
                guest::call(
                    ctx,
                    "call_collation",
                    &[handle as u64, 3, 0x300, 3, 0x310],
                )
            })
            .unwrap();
        assert_eq!(rc as u32 as i32, 1, "reversed collation orders b > a");
    }

    #[test]
    fn test_eof_roundtrip_reports_exhausted_for_unknown_cursor() {
        let mut fx = Fixture::new();
        // Fabricate a cursor pointer whose handle slot holds garbage; the
        // trampoline reports exhaustion rather than trapping the guest.
        fx.conn_op(|ctx| {
            let m = guest::mem_mut(ctx)?;
            wasqlite_runtime::memory::write_u32(m, 0x400 - 4, 999)?;
            Ok(())
        })
        .unwrap();
        let rc = fx
            .conn_op(|ctx| guest::call(ctx, "call_eof", &[0x400]))
            .unwrap();
        assert_eq!(rc, 1);
    }

    #[test]
    fn test_scripted_result_recording() {
        let mut fx = Fixture::new();
        fx.conn_op(|ctx| crate::value::write_result(ctx, 0x700, &Value::Integer(-7)))
            .unwrap();
        assert_eq!(fx.global_i32("res_kind"), 1);
        assert_eq!(fx.global_i64("res_int"), -7);

        fx.conn_op(|ctx| crate::value::write_result(ctx, 0x700, &Value::from("hi")))
            .unwrap();
        assert_eq!(fx.global_i32("res_kind"), 3);
        assert_eq!(fx.global_i32("res_len"), 2);
        let ptr = fx.global_i32("res_ptr") as u32;
        let bytes = fx
            .conn_op(|ctx| guest::read_bytes_owned(ctx, ptr, 2))
            .unwrap();
        assert_eq!(bytes, b"hi");
    }

    #[test]
    fn test_fabricated_value_records() {
        let mut fx = Fixture::new();
        // Integer value record at 0x500.
        fx.conn_op(|ctx| {
            let m = guest::mem_mut(ctx)?;
            wasqlite_runtime::memory::write_u32(m, 0x500, 1)?;
            wasqlite_runtime::memory::write_i64(m, 0x508, i64::MIN)?;
            Ok(())
        })
        .unwrap();
        let v = fx
            .conn_op(|ctx| crate::value::read_value(ctx, 0x500))
            .unwrap();
        assert_eq!(v, Value::Integer(i64::MIN));

        // Text value record at 0x520 pointing at bytes 0x540.
        fx.conn_op(|ctx| {
            let m = guest::mem_mut(ctx)?;
            wasqlite_runtime::memory::write_bytes(m, 0x540, b"text!")?;
            wasqlite_runtime::memory::write_u32(m, 0x520, 3)?;
            wasqlite_runtime::memory::write_u32(m, 0x520 + 16, 5)?;
            wasqlite_runtime::memory::write_u32(m, 0x520 + 20, 0x540)?;
            Ok(())
        })
        .unwrap();
        let v = fx
            .conn_op(|ctx| crate::value::read_value(ctx, 0x520))
            .unwrap();
        assert_eq!(v, Value::from("text!"));
    }
}
