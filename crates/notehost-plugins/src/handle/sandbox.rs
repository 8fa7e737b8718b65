//! WASM sandbox execution via wasmtime
//!
//! Modules get no imports at all. Each event runs in a fresh store with fuel,
//! memory, and wall-clock limits; the module must export `memory`,
//! `alloc(len) -> ptr`, and `on_event(ptr, len) -> status`. An optional
//! `init() -> status` export runs once at activation.

use async_trait::async_trait;
use notehost_core::config::RuntimeConfig;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use wasmtime::{
    Config, Engine, Instance, Module, Store, StoreLimits, StoreLimitsBuilder, Trap,
    WasmBacktraceDetails,
};

use super::{FaultReporter, HandleError, PluginHandle};
use crate::events::{EventListener, ListenerError, PluginEvent};
use crate::manifest::RuntimeKind;

const TABLE_ELEMENTS_LIMIT: usize = 1_024;
const INSTANCE_LIMIT: usize = 16;

struct SandboxLimits {
    limits: StoreLimits,
}

/// Wall-clock guard: bumps the engine epoch if the call outlives `timeout`
struct Watchdog {
    cancel: mpsc::Sender<()>,
    thread: thread::JoinHandle<()>,
}

impl Watchdog {
    fn arm(engine: Engine, timeout: Duration) -> Self {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let thread = thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = cancelled.recv_timeout(timeout) {
                engine.increment_epoch();
            }
        });
        Self { cancel, thread }
    }

    fn disarm(self) {
        let _ = self.cancel.send(());
        let _ = self.thread.join();
    }
}

struct Sandbox {
    plugin_id: String,
    engine: Engine,
    module: Module,
    fuel_limit: u64,
    memory_limit_bytes: usize,
    execution_timeout: Duration,
    // One invocation at a time: the epoch is engine-wide
    running: Mutex<()>,
    closed: AtomicBool,
    faults: FaultReporter,
}

impl Sandbox {
    fn store(&self) -> Result<Store<SandboxLimits>, HandleError> {
        let mut store = Store::new(
            &self.engine,
            SandboxLimits {
                limits: StoreLimitsBuilder::new()
                    .memory_size(self.memory_limit_bytes)
                    .table_elements(TABLE_ELEMENTS_LIMIT)
                    .instances(INSTANCE_LIMIT)
                    .trap_on_grow_failure(true)
                    .build(),
            },
        );
        store.limiter(|state| &mut state.limits);
        store.set_epoch_deadline(1);
        store
            .set_fuel(self.fuel_limit)
            .map_err(|e| HandleError::Wasm(format!("Failed to add fuel: {e}")))?;
        Ok(store)
    }

    /// Run `f` against a fresh instance under the time and fuel limits
    fn with_instance<T>(
        &self,
        f: impl FnOnce(&mut Store<SandboxLimits>, &Instance) -> wasmtime::Result<T>,
    ) -> Result<T, HandleError> {
        let _running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        let mut store = self.store()?;

        let watchdog = Watchdog::arm(self.engine.clone(), self.execution_timeout);
        let result = Instance::new(&mut store, &self.module, &[])
            .and_then(|instance| f(&mut store, &instance));
        watchdog.disarm();

        result.map_err(|e| {
            let reason = match e.downcast_ref::<Trap>() {
                Some(Trap::OutOfFuel) => "fuel exhausted".to_string(),
                Some(Trap::Interrupt) => "execution timed out".to_string(),
                Some(trap) => format!("trap: {trap}"),
                None => format!("{e:#}"),
            };
            warn!(plugin_id = %self.plugin_id, %reason, "Plugin code faulted");
            self.faults.report(reason.clone());
            HandleError::Wasm(reason)
        })
    }

    fn init(&self) -> Result<(), HandleError> {
        let status = self.with_instance(|store, instance| {
            match instance.get_typed_func::<(), i32>(&mut *store, "init") {
                Ok(init) => init.call(&mut *store, ()),
                Err(_) => Ok(0),
            }
        })?;
        if status != 0 {
            return Err(HandleError::Load(format!("init returned status {status}")));
        }
        Ok(())
    }

    fn deliver(&self, payload: &[u8]) -> Result<i32, HandleError> {
        let len = i32::try_from(payload.len())
            .map_err(|_| HandleError::Wasm("event payload too large".to_string()))?;
        self.with_instance(|store, instance| {
            let memory = instance
                .get_memory(&mut *store, "memory")
                .ok_or_else(|| wasmtime::Error::msg("module does not export memory"))?;
            let alloc = instance.get_typed_func::<i32, i32>(&mut *store, "alloc")?;
            let on_event = instance.get_typed_func::<(i32, i32), i32>(&mut *store, "on_event")?;

            let ptr = alloc.call(&mut *store, len)?;
            let offset = usize::try_from(ptr)
                .map_err(|_| wasmtime::Error::msg("alloc returned a negative pointer"))?;
            memory.write(&mut *store, offset, payload)?;
            on_event.call(&mut *store, (ptr, len))
        })
    }
}

pub struct WasmHandle {
    sandbox: Arc<Sandbox>,
}

impl WasmHandle {
    /// Compile the module named by `entry` inside the cached archive and run
    /// its `init` export
    pub async fn load(
        plugin_id: &str,
        archive_path: PathBuf,
        entry: String,
        runtime: &RuntimeConfig,
        faults: FaultReporter,
    ) -> Result<Self, HandleError> {
        let max_module_bytes = runtime.max_module_bytes;
        let bytes = tokio::task::spawn_blocking(move || read_entry(&archive_path, &entry, max_module_bytes))
            .await
            .map_err(|e| HandleError::Load(e.to_string()))??;

        let plugin_id_owned = plugin_id.to_string();
        let fuel_limit = runtime.fuel_limit;
        let memory_limit_bytes = runtime.memory_limit_bytes;
        let execution_timeout = Duration::from_millis(runtime.execution_timeout_ms);

        let sandbox = tokio::task::spawn_blocking(move || {
            let sandbox = Sandbox::compile(
                plugin_id_owned,
                &bytes,
                fuel_limit,
                memory_limit_bytes,
                execution_timeout,
                faults,
            )?;
            sandbox.init()?;
            Ok::<_, HandleError>(sandbox)
        })
        .await
        .map_err(|e| HandleError::Load(e.to_string()))??;

        info!(plugin_id, "WASM plugin loaded");
        Ok(Self {
            sandbox: Arc::new(sandbox),
        })
    }
}

impl Sandbox {
    fn compile(
        plugin_id: String,
        wasm: &[u8],
        fuel_limit: u64,
        memory_limit_bytes: usize,
        execution_timeout: Duration,
        faults: FaultReporter,
    ) -> Result<Self, HandleError> {
        if fuel_limit == 0 {
            return Err(HandleError::Load("Fuel limit must be greater than zero".to_string()));
        }

        let mut config = Config::new();
        config.consume_fuel(true);
        config.wasm_threads(false);
        config.async_support(false);
        config.epoch_interruption(true);
        config.wasm_backtrace_details(WasmBacktraceDetails::Disable);

        let engine = Engine::new(&config).map_err(|e| {
            HandleError::Wasm(format!("Failed to initialize wasmtime engine: {e}"))
        })?;

        let module = Module::new(&engine, wasm)
            .map_err(|e| HandleError::Load(format!("Invalid module: {e}")))?;

        if module.imports().next().is_some() {
            return Err(HandleError::Load(
                "Imports are not allowed; plugins run with an empty host environment".to_string(),
            ));
        }
        if module.get_export("on_event").is_none() {
            return Err(HandleError::Load("Module must export on_event".to_string()));
        }

        Ok(Self {
            plugin_id,
            engine,
            module,
            fuel_limit,
            memory_limit_bytes,
            execution_timeout,
            running: Mutex::new(()),
            closed: AtomicBool::new(false),
            faults,
        })
    }
}

fn read_entry(archive_path: &Path, entry: &str, max_bytes: u64) -> Result<Vec<u8>, HandleError> {
    let file = File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| HandleError::Load(e.to_string()))?;
    let module = archive
        .by_name(entry)
        .map_err(|_| HandleError::Load(format!("archive has no entry '{}'", entry)))?;

    let mut bytes = Vec::new();
    module.take(max_bytes + 1).read_to_end(&mut bytes)?;
    if bytes.len() as u64 > max_bytes {
        return Err(HandleError::Load(format!(
            "module '{}' exceeds {} bytes",
            entry, max_bytes
        )));
    }
    Ok(bytes)
}

struct WasmListener {
    sandbox: Arc<Sandbox>,
    name: String,
}

#[async_trait]
impl EventListener for WasmListener {
    async fn on_event(&self, event: &PluginEvent) -> Result<(), ListenerError> {
        if self.sandbox.closed.load(Ordering::Acquire) {
            return Err(ListenerError::new("plugin is not active"));
        }
        let payload = serde_json::to_vec(event).map_err(|e| ListenerError::new(e.to_string()))?;
        let sandbox = Arc::clone(&self.sandbox);
        let status = tokio::task::spawn_blocking(move || sandbox.deliver(&payload))
            .await
            .map_err(|e| ListenerError::new(e.to_string()))?
            .map_err(|e| ListenerError::new(e.to_string()))?;
        if status != 0 {
            return Err(ListenerError::new(format!("on_event returned status {status}")));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl PluginHandle for WasmHandle {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::InProcess
    }

    fn listener(&self, event_type: &str) -> Arc<dyn EventListener> {
        Arc::new(WasmListener {
            sandbox: Arc::clone(&self.sandbox),
            name: format!("{}:{}", self.sandbox.plugin_id, event_type),
        })
    }

    async fn shutdown(&self) {
        self.sandbox.closed.store(true, Ordering::Release);
    }
}
