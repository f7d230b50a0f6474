//! Execution contexts
//!
//! An execution context is one wasmtime `Store` + `Instance` of the guest,
//! pinned to its own OS thread and importing the shared arena as its linear
//! memory. Contexts never share a store; the only state they have in common
//! is the arena and the host call surface.

use anyhow::{anyhow, Context, Result};
use std::sync::{Arc, Weak};
use std::thread;
use tokio::sync::{mpsc, oneshot};
use wasmtime::{
    Instance, Linker, Store, StoreLimits, StoreLimitsBuilder, Val, WasmParams, WasmResults,
};

use crate::arena::SharedArena;
use crate::host::{setup_host_linker, HostCalls, ImportProvider};
use crate::layout::{Completion, CompletionFlag};
use crate::loader::{
    GuestModule, FUNCTION_TABLE, INIT_TLS, MEMORY_MODULE, MEMORY_NAME, STACK_POINTER,
    THREAD_EXIT_CHECK, TLS_ALIGN, TLS_SIZE,
};
use crate::shims::setup_shim_linker;
use crate::tls::worker_slot;

/// Per-store data handed to every host function
pub struct ContextState {
    label: String,
    limits: StoreLimits,
}

impl ContextState {
    pub fn new(label: String) -> Self {
        ContextState {
            label,
            limits: StoreLimitsBuilder::new()
                .memories(usize::MAX)
                .tables(usize::MAX)
                .instances(usize::MAX)
                .build(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// One instantiated copy of the guest
pub struct GuestInstance {
    store: Store<ContextState>,
    instance: Instance,
}

impl GuestInstance {
    /// Instantiate the guest against the shared arena with the full import set
    pub fn instantiate(
        module: &GuestModule,
        arena: &SharedArena,
        host: Weak<HostCalls>,
        providers: &[Arc<dyn ImportProvider>],
        label: String,
    ) -> Result<Self> {
        let engine = module.engine();
        let mut store = Store::new(engine, ContextState::new(label.clone()));
        store.limiter(|state| &mut state.limits);

        let mut linker = Linker::<ContextState>::new(engine);
        linker.allow_shadowing(true);
        linker
            .define(&store, MEMORY_MODULE, MEMORY_NAME, arena.memory().clone())
            .context("Failed to bind shared memory")?;
        setup_host_linker(host, &mut linker).context("Failed to setup host linker")?;
        setup_shim_linker(arena.clone(), &mut linker).context("Failed to setup shim linker")?;
        for provider in providers {
            provider
                .register(&mut linker, arena)
                .with_context(|| format!("Import provider '{}' failed to register", provider.name()))?;
        }
        linker.define_unknown_imports_as_traps(module.module())?;

        let instance = linker
            .instantiate(&mut store, module.module())
            .with_context(|| format!("Failed to instantiate guest for {}", label))?;

        Ok(Self { store, instance })
    }

    pub fn label(&self) -> &str {
        self.store.data().label()
    }

    pub fn set_stack_pointer(&mut self, value: u32) -> Result<()> {
        let global = self
            .instance
            .get_global(&mut self.store, STACK_POINTER)
            .ok_or_else(|| anyhow!("Guest has no {} global", STACK_POINTER))?;
        global.set(&mut self.store, Val::I32(value as i32))
    }

    fn read_i32_global(&mut self, name: &str) -> Option<i32> {
        let global = self.instance.get_global(&mut self.store, name)?;
        global.get(&mut self.store).i32()
    }

    /// `(tls_size, tls_align)` declared by the guest, `(0, 1)` without TLS
    pub fn tls_footprint(&mut self) -> (u32, u32) {
        let size = self.read_i32_global(TLS_SIZE).unwrap_or(0).max(0) as u32;
        let align = self.read_i32_global(TLS_ALIGN).unwrap_or(1).max(1) as u32;
        (size, align)
    }

    pub fn has_func(&mut self, name: &str) -> bool {
        self.instance.get_func(&mut self.store, name).is_some()
    }

    pub fn init_tls(&mut self, base: u32) -> Result<()> {
        self.call::<i32, ()>(INIT_TLS, base as i32)
    }

    /// Call an exported `() -> i32` getter
    pub fn getter(&mut self, name: &str) -> Result<u32> {
        let value = self.call::<(), i32>(name, ())?;
        u32::try_from(value).map_err(|_| anyhow!("Getter {} returned negative value {}", name, value))
    }

    pub fn optional_getter(&mut self, name: &str) -> Result<Option<u32>> {
        if !self.has_func(name) {
            return Ok(None);
        }
        self.getter(name).map(Some)
    }

    /// Call the function at `func_ptr` in the indirect function table
    pub fn call_indirect(&mut self, func_ptr: u32, arg: u32) -> Result<()> {
        let table = self
            .instance
            .get_table(&mut self.store, FUNCTION_TABLE)
            .ok_or_else(|| anyhow!("Guest has no {} table", FUNCTION_TABLE))?;
        let func = match table.get(&mut self.store, func_ptr) {
            Some(Val::FuncRef(Some(func))) => func,
            _ => return Err(anyhow!("No function at table index {}", func_ptr)),
        };
        // Start routines are `void (*)(void*)` or `void* (*)(void*)`
        if func.ty(&self.store).results().len() == 0 {
            func.typed::<i32, ()>(&self.store)?
                .call(&mut self.store, arg as i32)?;
        } else {
            func.typed::<i32, i32>(&self.store)?
                .call(&mut self.store, arg as i32)?;
        }
        Ok(())
    }

    /// Ask the guest whether `thread_id` was detached before it exited
    pub fn exit_check(&mut self, thread_id: u32) -> Result<bool> {
        Ok(self.call::<i32, i32>(THREAD_EXIT_CHECK, thread_id as i32)? != 0)
    }

    pub fn call<P, R>(&mut self, name: &str, params: P) -> Result<R>
    where
        P: WasmParams,
        R: WasmResults,
    {
        let func = self
            .instance
            .get_typed_func::<P, R>(&mut self.store, name)
            .with_context(|| format!("Failed to get guest export {}", name))?;
        func.call(&mut self.store, params)
    }
}

/// Arguments of a spawned thread as passed to `__thread_spawn`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadStart {
    pub func_ptr: u32,
    pub arg_ptr: u32,
    pub stack_top: u32,
    /// Explicit TLS block, or 0 for the context's own slot
    pub tls_base: u32,
}

/// Message telling an idle context to run a thread
#[derive(Debug)]
pub struct RunRequest {
    pub thread_id: u32,
    pub start: ThreadStart,
    pub flag: CompletionFlag,
}

/// Handle to a pool execution context's OS thread
#[derive(Debug)]
pub struct ExecutionContext {
    index: usize,
    sender: Option<mpsc::UnboundedSender<RunRequest>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ExecutionContext {
    /// Start the OS thread for pool slot `index`.
    ///
    /// The returned receiver resolves once the guest is instantiated (or has
    /// failed to instantiate) on the new thread.
    pub fn launch(
        index: usize,
        module: GuestModule,
        arena: SharedArena,
        host: Weak<HostCalls>,
        providers: Vec<Arc<dyn ImportProvider>>,
    ) -> Result<(Self, oneshot::Receiver<Result<()>>)> {
        let (sender, receiver) = mpsc::unbounded_channel::<RunRequest>();
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread = thread::Builder::new()
            .name(format!("multicore-worker-{}", index))
            .spawn(move || {
                let label = format!("worker-{}", index);
                let instance =
                    match GuestInstance::instantiate(&module, &arena, host.clone(), &providers, label) {
                        Ok(instance) => {
                            let _ = ready_tx.send(Ok(()));
                            instance
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                worker_loop(index, instance, receiver, host);
            })
            .with_context(|| format!("Failed to spawn OS thread for worker {}", index))?;

        Ok((
            Self {
                index,
                sender: Some(sender),
                thread: Some(thread),
            },
            ready_rx,
        ))
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn dispatch(&self, request: RunRequest) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("Worker {} is shut down", self.index))?;
        sender
            .send(request)
            .map_err(|e| anyhow!("Worker {} is gone, dropped thread {}", self.index, e.0.thread_id))
    }

    /// Close the command channel; with `join`, also wait for the OS thread
    pub fn close(&mut self, join: bool) {
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            if join {
                if thread.join().is_err() {
                    log::error!("Worker {} panicked", self.index);
                }
            }
        }
    }
}

fn worker_loop(
    index: usize,
    mut instance: GuestInstance,
    mut receiver: mpsc::UnboundedReceiver<RunRequest>,
    host: Weak<HostCalls>,
) {
    log::debug!("Worker {} ready", index);
    while let Some(request) = receiver.blocking_recv() {
        run_thread(index, &mut instance, &host, request);
    }
    log::debug!("Worker {} exiting", index);
}

fn run_thread(index: usize, instance: &mut GuestInstance, host: &Weak<HostCalls>, request: RunRequest) {
    let thread_id = request.thread_id;

    let mut status = match start_thread(index, instance, host, &request) {
        Ok(()) => Completion::Succeeded,
        Err(e) => {
            log::error!("Thread {} failed on {}: {:#}", thread_id, instance.label(), e);
            Completion::Failed
        }
    };

    let detached = match instance.exit_check(thread_id) {
        Ok(detached) => detached,
        Err(e) => {
            log::error!("Thread {} exit check failed: {:#}", thread_id, e);
            status = Completion::Failed;
            false
        }
    };

    // The flag must be published before the slot can be recycled below
    if let Err(e) = request.flag.complete(status) {
        log::error!("Thread {} could not publish completion: {}", thread_id, e);
    }

    if detached {
        match host.upgrade() {
            Some(host) => {
                if let Err(e) = host.detach_cleanup(thread_id) {
                    log::error!("Detach cleanup of thread {} failed: {}", thread_id, e);
                }
            }
            None => log::debug!("Runtime dropped before thread {} cleanup", thread_id),
        }
    }
}

fn start_thread(
    index: usize,
    instance: &mut GuestInstance,
    host: &Weak<HostCalls>,
    request: &RunRequest,
) -> Result<()> {
    let start = request.start;
    instance.set_stack_pointer(start.stack_top)?;

    let tls_base = if start.tls_base != 0 {
        Some(start.tls_base)
    } else {
        let host = host
            .upgrade()
            .ok_or_else(|| anyhow!("Runtime dropped before thread {} started", request.thread_id))?;
        match host.tls() {
            Some(tls) if tls.is_enabled() => Some(tls.slot_base(worker_slot(index))?),
            _ => None,
        }
    };
    if let Some(base) = tls_base {
        if instance.has_func(INIT_TLS) {
            instance.init_tls(base)?;
        }
    }

    instance.call_indirect(start.func_ptr, start.arg_ptr)
}
