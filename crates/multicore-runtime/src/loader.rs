//! Guest module loading and ABI validation
//!
//! A guest is compiled once per engine and then instantiated in every
//! execution context. Validation happens here, before any context exists, so
//! a module that cannot possibly run fails fast with a precise error instead
//! of trapping inside a pool thread.

use anyhow::{Context, Result};
use std::path::Path;
use wasmtime::{Engine, ExternType, Module, Mutability, ValType};

use crate::config::MemoryLimits;
use crate::error::{RuntimeError, RuntimeResult};

pub const MEMORY_MODULE: &str = "env";
pub const MEMORY_NAME: &str = "memory";

pub const FUNCTION_TABLE: &str = "__indirect_function_table";
pub const STACK_POINTER: &str = "__stack_pointer";
pub const INIT_TLS: &str = "__wasm_init_tls";
pub const TLS_SIZE: &str = "__tls_size";
pub const TLS_ALIGN: &str = "__tls_align";
pub const THREAD_EXIT_CHECK: &str = "thread_exit_check";
pub const FLAGS_PTR: &str = "get_thread_flags_ptr";
pub const FLAGS_LEN: &str = "get_thread_flags_len";
pub const BARRIERS_PTR: &str = "get_barrier_data_ptr";
pub const BARRIERS_LEN: &str = "get_barrier_data_len";
pub const TLS_REGION_PTR: &str = "get_tls_region_ptr";
pub const TLS_REGION_LEN: &str = "get_tls_region_len";

/// Engine settings every context shares: shared memories and atomics on
pub fn engine_config() -> wasmtime::Config {
    let mut config = wasmtime::Config::new();
    config.wasm_threads(true);
    config
}

pub fn new_engine() -> Result<Engine> {
    Engine::new(&engine_config()).context("Failed to create wasmtime engine")
}

/// A compiled, validated guest
#[derive(Clone)]
pub struct GuestModule {
    engine: Engine,
    module: Module,
    memory: MemoryLimits,
    has_tls: bool,
}

impl std::fmt::Debug for GuestModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestModule")
            .field("name", &self.module.name())
            .field("memory", &self.memory)
            .field("has_tls", &self.has_tls)
            .finish()
    }
}

impl GuestModule {
    /// Compile a guest from wasm or wat bytes on a fresh threads-enabled engine
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::with_engine(new_engine()?, bytes)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let engine = new_engine()?;
        let module = Module::from_file(&engine, path)
            .with_context(|| format!("Failed to load guest module {}", path.display()))?;
        Ok(Self::validate(engine, module)?)
    }

    /// Compile on an existing engine; the engine must have threads enabled
    pub fn with_engine(engine: Engine, bytes: &[u8]) -> Result<Self> {
        let module = Module::new(&engine, bytes).context("Failed to compile guest module")?;
        Ok(Self::validate(engine, module)?)
    }

    fn validate(engine: Engine, module: Module) -> RuntimeResult<Self> {
        let memory = shared_memory_import(&module)?;

        expect_table(&module, FUNCTION_TABLE)?;
        expect_mutable_i32_global(&module, STACK_POINTER)?;
        expect_func(&module, THREAD_EXIT_CHECK, &[ValType::I32], &[ValType::I32])?;
        expect_func(&module, FLAGS_PTR, &[], &[ValType::I32])?;
        expect_func(&module, BARRIERS_PTR, &[], &[ValType::I32])?;
        for optional in [FLAGS_LEN, BARRIERS_LEN, TLS_REGION_LEN] {
            if has_export(&module, optional) {
                expect_func(&module, optional, &[], &[ValType::I32])?;
            }
        }

        let has_tls = has_export(&module, INIT_TLS);
        if has_tls {
            expect_func(&module, INIT_TLS, &[ValType::I32], &[])?;
            expect_func(&module, TLS_REGION_PTR, &[], &[ValType::I32])?;
            for global in [TLS_SIZE, TLS_ALIGN] {
                match export_type(&module, global) {
                    Some(ExternType::Global(ty)) if matches!(ty.content(), ValType::I32) => {}
                    Some(_) => {
                        return Err(RuntimeError::InvalidAbi(format!(
                            "export '{}' must be an i32 global",
                            global
                        )))
                    }
                    None => return Err(RuntimeError::MissingExport(global.to_string())),
                }
            }
        }

        log::debug!(
            "Validated guest module (memory {}-{} pages, tls: {})",
            memory.minimum,
            memory.maximum,
            has_tls
        );

        Ok(Self {
            engine,
            module,
            memory,
            has_tls,
        })
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Page limits declared by the guest's memory import
    pub fn memory_limits(&self) -> MemoryLimits {
        self.memory
    }

    /// Whether the guest exports a TLS initializer
    pub fn has_tls(&self) -> bool {
        self.has_tls
    }

    pub fn has_export(&self, name: &str) -> bool {
        has_export(&self.module, name)
    }

    /// Check that `name` is an exported `() -> i32` function
    pub fn expect_entry(&self, name: &str) -> RuntimeResult<()> {
        expect_func(&self.module, name, &[], &[ValType::I32])
    }
}

fn export_type(module: &Module, name: &str) -> Option<ExternType> {
    module
        .exports()
        .find(|export| export.name() == name)
        .map(|export| export.ty())
}

fn has_export(module: &Module, name: &str) -> bool {
    module.exports().any(|export| export.name() == name)
}

fn shared_memory_import(module: &Module) -> RuntimeResult<MemoryLimits> {
    let import = module
        .imports()
        .find(|import| import.module() == MEMORY_MODULE && import.name() == MEMORY_NAME)
        .ok_or_else(|| {
            RuntimeError::InvalidAbi(format!(
                "guest must import its memory as {}.{}",
                MEMORY_MODULE, MEMORY_NAME
            ))
        })?;
    let ty = match import.ty() {
        ExternType::Memory(ty) => ty,
        _ => {
            return Err(RuntimeError::InvalidAbi(format!(
                "{}.{} is not a memory import",
                MEMORY_MODULE, MEMORY_NAME
            )))
        }
    };
    if !ty.is_shared() {
        return Err(RuntimeError::InvalidAbi(
            "memory import must be declared shared".to_string(),
        ));
    }
    if ty.is_64() {
        return Err(RuntimeError::InvalidAbi(
            "64-bit memories are not supported".to_string(),
        ));
    }
    let maximum = ty.maximum().ok_or_else(|| {
        RuntimeError::InvalidAbi("shared memory import has no maximum".to_string())
    })?;
    Ok(MemoryLimits {
        minimum: ty.minimum() as u32,
        maximum: maximum as u32,
    })
}

fn expect_table(module: &Module, name: &str) -> RuntimeResult<()> {
    match export_type(module, name) {
        Some(ExternType::Table(_)) => Ok(()),
        Some(_) => Err(RuntimeError::InvalidAbi(format!("export '{}' must be a table", name))),
        None => Err(RuntimeError::MissingExport(name.to_string())),
    }
}

fn expect_mutable_i32_global(module: &Module, name: &str) -> RuntimeResult<()> {
    match export_type(module, name) {
        Some(ExternType::Global(ty))
            if ty.mutability() == Mutability::Var && matches!(ty.content(), ValType::I32) =>
        {
            Ok(())
        }
        Some(_) => Err(RuntimeError::InvalidAbi(format!(
            "export '{}' must be a mutable i32 global",
            name
        ))),
        None => Err(RuntimeError::MissingExport(name.to_string())),
    }
}

fn same_types(actual: impl ExactSizeIterator<Item = ValType>, expected: &[ValType]) -> bool {
    actual.len() == expected.len()
        && actual
            .zip(expected)
            .all(|(a, e)| matches!((a, e), (ValType::I32, ValType::I32)))
}

fn expect_func(
    module: &Module,
    name: &str,
    params: &[ValType],
    results: &[ValType],
) -> RuntimeResult<()> {
    match export_type(module, name) {
        Some(ExternType::Func(ty)) => {
            if same_types(ty.params(), params) && same_types(ty.results(), results) {
                Ok(())
            } else {
                Err(RuntimeError::InvalidAbi(format!(
                    "export '{}' has the wrong signature, expected ({} i32 params) -> ({} i32 results)",
                    name,
                    params.len(),
                    results.len()
                )))
            }
        }
        Some(_) => Err(RuntimeError::InvalidAbi(format!(
            "export '{}' must be a function",
            name
        ))),
        None => Err(RuntimeError::MissingExport(name.to_string())),
    }
}
