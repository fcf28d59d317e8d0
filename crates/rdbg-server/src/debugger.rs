//! Embedding facade: the one object a host application holds.
//!
//! ```text
//! let debugger = RemoteDebugger::new(Config::from_env()?, module);
//! debugger.start()?;                              // any thread
//! debugger.install(&mut engine, "main", opts)?;   // engine thread
//! ...
//! debugger.uninstall(&mut engine)?;               // engine thread
//! debugger.stop()?;
//! ```
//!
//! Calls taking an engine must run on that engine's thread.

use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener, ToSocketAddrs};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use rdbg_core::{
    ClientManager, ContextId, DebuggerError, EngineBinding, EngineOptions, EngineSession,
    HostedModule, ObjectHandle, ScriptLoader, SessionRegistry, SharedLoader,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::Config;
use crate::server::{LoopSettings, Multiplexer};
use crate::types::{ControlCommand, ControlTx, TransportError};

struct IoThread {
    control: ControlTx,
    handle: JoinHandle<()>,
    local_addr: SocketAddr,
}

pub struct RemoteDebugger {
    config: Config,
    module: HostedModule,
    clients: Arc<ClientManager>,
    registry: Arc<SessionRegistry>,
    io: Mutex<Option<IoThread>>,
}

impl RemoteDebugger {
    pub fn new(config: Config, module: HostedModule) -> Self {
        Self::build(config, module, SharedLoader::none())
    }

    /// Let the hosted module fetch script sources by name.
    pub fn with_script_loader(
        config: Config,
        module: HostedModule,
        loader: Arc<dyn ScriptLoader>,
    ) -> Self {
        Self::build(config, module, SharedLoader::new(loader))
    }

    fn build(config: Config, module: HostedModule, loader: SharedLoader) -> Self {
        let clients = Arc::new(ClientManager::new(config.max_clients));
        let registry = SessionRegistry::new(Arc::clone(&clients), config.registry_settings(), loader);
        Self {
            config,
            module,
            clients,
            registry,
            io: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn client_manager(&self) -> &Arc<ClientManager> {
        &self.clients
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Network lifecycle
    // ------------------------------------------------------------------

    /// Bind the listener and start the `rdbg-io` thread.
    pub fn start(&self) -> Result<SocketAddr, TransportError> {
        let mut io = self.io();
        if io.is_some() {
            return Err(TransportError::AlreadyStarted);
        }

        let addr = self.config.socket_addr_string();
        let listener = bind(&addr)?;
        let local_addr = listener
            .local_addr()
            .map_err(TransportError::SocketOptions)?;

        let (control, control_rx) = mpsc::unbounded_channel();
        let settings = LoopSettings {
            buffer_size: self.config.tcp_buffer_size,
            client_queue_capacity: self.config.client_queue_capacity,
            shutdown_retries: self.config.shutdown_retries,
        };
        let clients = Arc::clone(&self.clients);
        let registry = Arc::clone(&self.registry);
        let loop_control = control.clone();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), TransportError>>();

        let handle = thread::Builder::new()
            .name("rdbg-io".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(TransportError::Runtime(e)));
                        return;
                    }
                };
                runtime.block_on(async move {
                    let listener = match TcpListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(source) => {
                            let _ = ready_tx.send(Err(TransportError::Listen { addr, source }));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    Multiplexer::new(listener, (loop_control, control_rx), clients, registry, settings)
                        .run()
                        .await;
                });
            })
            .map_err(TransportError::Runtime)?;

        let handle = await_startup(&ready_rx, handle)?;

        info!(addr = %local_addr, "debugger listening");
        *io = Some(IoThread {
            control,
            handle,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Stop the I/O thread and wait for it.
    pub fn stop(&self) -> Result<(), TransportError> {
        let io = self.io().take().ok_or(TransportError::NotStarted)?;
        // A closed channel means the loop has already exited.
        let _ = io.control.send(ControlCommand::Exit);
        if io.handle.join().is_err() {
            error!("I/O thread panicked");
        }
        info!("debugger stopped");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.io().is_some()
    }

    /// Address actually bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.io().as_ref().map(|io| io.local_addr)
    }

    // ------------------------------------------------------------------
    // Sessions (engine thread)
    // ------------------------------------------------------------------

    pub fn install(
        &self,
        engine: &mut dyn EngineBinding,
        name: &str,
        options: EngineOptions,
    ) -> Result<Arc<EngineSession>, DebuggerError> {
        self.registry.install(engine, name, options, &self.module)
    }

    pub fn uninstall(&self, engine: &mut dyn EngineBinding) -> Result<(), DebuggerError> {
        self.registry.uninstall(engine)
    }

    /// Interrupt the session of `engine`, or every session with `None`.
    pub fn interrupt(&self, engine: Option<&dyn EngineBinding>) -> Result<(), DebuggerError> {
        let target: Option<ContextId> = match engine {
            Some(engine) => Some(
                self.registry
                    .session_for(engine)
                    .ok_or(DebuggerError::NotInstalled)?
                    .context_id(),
            ),
            None => None,
        };
        self.registry.interrupt(target);
        Ok(())
    }

    pub fn add_debuggee(
        &self,
        engine: &mut dyn EngineBinding,
        debuggee: ObjectHandle,
    ) -> Result<(), DebuggerError> {
        self.registry.add_debuggee(engine, debuggee)
    }

    pub fn remove_debuggee(
        &self,
        engine: &mut dyn EngineBinding,
        debuggee: ObjectHandle,
    ) -> Result<(), DebuggerError> {
        self.registry.remove_debuggee(engine, debuggee)
    }

    /// Run queued commands for engines without a cooperative callback.
    pub fn handle_pending_commands(&self, engine: &mut dyn EngineBinding) -> Result<(), DebuggerError> {
        self.registry.handle_pending_commands(engine)
    }

    fn io(&self) -> MutexGuard<'_, Option<IoThread>> {
        self.io.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for RemoteDebugger {
    fn drop(&mut self) {
        if self.is_started() {
            let _ = self.stop();
        }
    }
}

impl std::fmt::Debug for RemoteDebugger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteDebugger")
            .field("local_addr", &self.local_addr())
            .field("clients", &self.clients.client_count())
            .field("registry", &self.registry)
            .finish()
    }
}

/// Wait for the I/O thread to report its listener registered. On failure
/// the thread is joined and its error returned.
fn await_startup(
    ready: &std_mpsc::Receiver<Result<(), TransportError>>,
    handle: JoinHandle<()>,
) -> Result<JoinHandle<()>, TransportError> {
    // A dropped sender without a result means the thread died early.
    let started = ready.recv().unwrap_or_else(|_| {
        Err(TransportError::Runtime(io::Error::new(
            io::ErrorKind::Other,
            "I/O thread exited during startup",
        )))
    });
    match started {
        Ok(()) => Ok(handle),
        Err(e) => {
            if handle.join().is_err() {
                error!("I/O thread panicked during startup");
            }
            error!(error = %e, "debugger failed to start");
            Err(e)
        }
    }
}

fn bind(addr: &str) -> Result<StdTcpListener, TransportError> {
    let resolved: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .map_err(|source| TransportError::Resolve {
            addr: addr.to_string(),
            source,
        })?
        .collect();

    let listener = StdTcpListener::bind(&resolved[..]).map_err(|source| TransportError::Bind {
        addr: addr.to_string(),
        source,
    })?;
    listener
        .set_nonblocking(true)
        .map_err(TransportError::SocketOptions)?;
    Ok(listener)
}
