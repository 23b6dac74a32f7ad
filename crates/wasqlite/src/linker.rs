//! Assembly of a connection's import table.
//!
//! Three layers feed the linker: WASI preview1 (the engine binary is built
//! against wasi-libc), the virtual-table callback table, and the
//! function/collation callback table. Everything the guest may call back
//! into is registered here, before instantiation; the set never changes at
//! runtime.

use crate::error::Result;
use crate::func;
use crate::guest::ConnState;
use crate::vtab;
use wasmtime::{Engine, Linker};
use wasqlite_runtime::RuntimeError;

pub(crate) fn create_linker(engine: &Engine) -> Result<Linker<ConnState>> {
    let mut linker = Linker::new(engine);

    wasmtime_wasi::preview1::add_to_linker_sync(&mut linker, |state: &mut ConnState| {
        &mut state.wasi
    })
    .map_err(|e| RuntimeError::Instantiation(e.to_string()))?;

    vtab::add_to_linker(&mut linker)?;
    func::add_to_linker(&mut linker)?;

    Ok(linker)
}
