//! Guest module loading and caching.

use crate::{Result, RuntimeError};
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use wasmtime::{Engine, Module};

/// A compiled guest module ready for instantiation.
pub struct CompiledModule {
    /// The wasmtime module.
    module: Module,
    /// Content hash of the original bytes.
    hash: String,
}

impl CompiledModule {
    /// Compile a module from WASM bytes (binary or WAT).
    pub fn from_bytes(engine: &Engine, wasm_bytes: &[u8]) -> Result<Self> {
        let module = Module::new(engine, wasm_bytes)
            .map_err(|e| RuntimeError::Compilation(e.to_string()))?;

        Ok(Self {
            module,
            hash: hash_bytes(wasm_bytes),
        })
    }

    /// Load and compile a module from a file.
    pub fn from_file(engine: &Engine, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading guest module from file");

        let wasm_bytes = std::fs::read(path)?;
        Self::from_bytes(engine, &wasm_bytes)
    }

    /// Get the wasmtime module.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Get the content hash.
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

/// Cache for compiled guest modules.
///
/// Modules are cached by their content hash to avoid recompilation when
/// several connections are opened against the same engine binary.
pub struct ModuleCache {
    /// The wasmtime engine (shared across all modules).
    engine: Engine,
    /// Cache of compiled modules by hash.
    cache: DashMap<String, Arc<CompiledModule>>,
}

impl ModuleCache {
    /// Create a new module cache with a default engine.
    pub fn new() -> Self {
        Self::with_engine(Engine::default())
    }

    /// Create a module cache with a custom engine.
    pub fn with_engine(engine: Engine) -> Self {
        Self {
            engine,
            cache: DashMap::new(),
        }
    }

    /// Get the engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Get or compile a module from bytes.
    pub fn get_or_compile(&self, wasm_bytes: &[u8]) -> Result<Arc<CompiledModule>> {
        let hash = hash_bytes(wasm_bytes);

        if let Some(module) = self.cache.get(&hash) {
            debug!(hash = %hash, "Module cache hit");
            return Ok(module.clone());
        }

        debug!(hash = %hash, "Module cache miss, compiling");
        let module = Arc::new(CompiledModule::from_bytes(&self.engine, wasm_bytes)?);
        self.cache.insert(hash, module.clone());

        Ok(module)
    }

    /// Get or load a module from a file.
    pub fn get_or_load(&self, path: impl AsRef<Path>) -> Result<Arc<CompiledModule>> {
        let wasm_bytes = std::fs::read(path.as_ref())?;
        self.get_or_compile(&wasm_bytes)
    }

    /// Remove a module from the cache.
    pub fn remove(&self, wasm_bytes: &[u8]) {
        self.cache.remove(&hash_bytes(wasm_bytes));
    }

    /// Clear all cached modules.
    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Get the number of cached modules.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl Default for ModuleCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash bytes using a simple algorithm.
fn hash_bytes(data: &[u8]) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
