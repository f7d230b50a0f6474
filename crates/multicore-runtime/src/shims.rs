//! Logging and WASI stub imports
//!
//! Guests built for a browser-like host expect a console and a minimal
//! `wasi_snapshot_preview1`. Console output is forwarded to the `log` facade
//! tagged with the context label; the WASI calls are stubbed out.

use anyhow::{anyhow, Result};
use wasmtime::{Caller, Linker};

use crate::arena::SharedArena;
use crate::context::ContextState;
use crate::error::RuntimeError;

const WASI: &str = "wasi_snapshot_preview1";
const ERRNO_SUCCESS: i32 = 0;

fn guest_text(arena: &SharedArena, ptr: i32, len: i32) -> String {
    arena
        .read_string(ptr as u32, len.max(0) as u32)
        .unwrap_or_else(|e| format!("<unreadable guest string: {}>", e))
}

fn source_location(arena: &SharedArena, file_ptr: i32, file_len: i32, line: i32) -> String {
    if file_len <= 0 {
        return String::new();
    }
    format!(" ({}:{})", guest_text(arena, file_ptr, file_len), line)
}

pub fn setup_shim_linker(arena: SharedArena, linker: &mut Linker<ContextState>) -> Result<()> {
    let log_arena = arena.clone();
    linker
        .func_wrap(
            "env",
            "__log",
            move |caller: Caller<'_, ContextState>, ptr: i32, len: i32| {
                log::info!("[{}] {}", caller.data().label(), guest_text(&log_arena, ptr, len));
            },
        )
        .map_err(|e| anyhow!("Failed to wrap __log function: {:?}", e))?;

    for (name, level) in [
        ("__log_info", log::Level::Info),
        ("__log_warn", log::Level::Warn),
        ("__log_error", log::Level::Error),
    ] {
        let level_arena = arena.clone();
        linker
            .func_wrap(
                "env",
                name,
                move |caller: Caller<'_, ContextState>,
                      ptr: i32,
                      len: i32,
                      file_ptr: i32,
                      file_len: i32,
                      line: i32| {
                    log::log!(
                        level,
                        "[{}] {}{}",
                        caller.data().label(),
                        guest_text(&level_arena, ptr, len),
                        source_location(&level_arena, file_ptr, file_len, line)
                    );
                },
            )
            .map_err(|e| anyhow!("Failed to wrap {} function: {:?}", name, e))?;
    }

    // No arguments are ever passed
    let args_arena = arena.clone();
    linker
        .func_wrap(
            WASI,
            "args_sizes_get",
            move |_caller: Caller<'_, ContextState>, argc_ptr: i32, buf_size_ptr: i32| -> Result<i32> {
                args_arena.write_bytes(argc_ptr as u32, &0u32.to_le_bytes())?;
                args_arena.write_bytes(buf_size_ptr as u32, &0u32.to_le_bytes())?;
                Ok(ERRNO_SUCCESS)
            },
        )
        .map_err(|e| anyhow!("Failed to wrap args_sizes_get function: {:?}", e))?;

    linker
        .func_wrap(
            WASI,
            "args_get",
            |_caller: Caller<'_, ContextState>, _argv: i32, _argv_buf: i32| -> i32 { ERRNO_SUCCESS },
        )
        .map_err(|e| anyhow!("Failed to wrap args_get function: {:?}", e))?;

    linker
        .func_wrap(
            WASI,
            "proc_exit",
            |caller: Caller<'_, ContextState>, code: i32| -> Result<()> {
                log::debug!("{} called proc_exit({})", caller.data().label(), code);
                Err(RuntimeError::Exit(code).into())
            },
        )
        .map_err(|e| anyhow!("Failed to wrap proc_exit function: {:?}", e))?;

    linker
        .func_wrap(
            WASI,
            "sched_yield",
            |_caller: Caller<'_, ContextState>| -> i32 {
                std::thread::yield_now();
                ERRNO_SUCCESS
            },
        )
        .map_err(|e| anyhow!("Failed to wrap sched_yield function: {:?}", e))?;

    Ok(())
}
