//! The client: one configured runtime wired from gateway to commands.
//!
//! [`Client`] owns the pieces the lower crates leave unconnected. It opens
//! the gateway session, pumps its envelopes through the [`EventRouter`] in
//! arrival order, attaches the command [`Pipeline`] and runs the waiter
//! sweeper. Shutdown reverses all of it and unloads extensions in reverse
//! load order.
//!
//! ```rust,ignore
//! use ferrum_runtime::prelude::*;
//!
//! let client = Client::builder().config(load_config()?).build()?;
//! client.add_command(Command::build("ping").handler(|_ctx: Arc<Context>| async { "pong" }))?;
//! client.run().await?;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ferrum_commands::{Command, CommandBuilder, CommandRegistry, Extension, Pipeline};
use ferrum_core::{
    BoxError, BoxedExecutor, CacheStore, ClientHandle, Envelope, Event, EventRouter, GatewayResult,
    ListenerId, Owner,
};
use ferrum_gateway::{BoxedConnector, ConnectionManager, Credentials, SessionStatus};
use parking_lot::Mutex;
use tokio::signal;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, debug, error, info, span, warn};

use crate::config::{FerrumConfig, validate_config};
use crate::error::{RuntimeError, RuntimeResult};
use crate::logging;
use crate::tasks::Loop;

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Client`].
pub struct ClientBuilder {
    config: FerrumConfig,
    executor: Option<BoxedExecutor>,
    connector: Option<BoxedConnector>,
    init_logging: bool,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            config: FerrumConfig::default(),
            executor: None,
            connector: None,
            init_logging: true,
        }
    }

    pub fn config(mut self, config: FerrumConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the HTTP executor, e.g. with a recording one in tests.
    pub fn executor(mut self, executor: BoxedExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Replaces the WebSocket connector.
    pub fn connector(mut self, connector: BoxedConnector) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Whether `build` installs the global subscriber from `logging` config.
    pub fn init_logging(mut self, enabled: bool) -> Self {
        self.init_logging = enabled;
        self
    }

    /// Validates the configuration and wires every component.
    pub fn build(self) -> RuntimeResult<Client> {
        validate_config(&self.config)?;
        if self.init_logging {
            logging::init_from_config(&self.config.logging);
        }

        let executor = match self.executor {
            Some(executor) => executor,
            None => default_executor(&self.config)?,
        };
        let connector = match self.connector {
            Some(connector) => connector,
            None => default_connector()?,
        };

        let cache = Arc::new(CacheStore::new(self.config.cache.to_policy()));
        let router = Arc::new(EventRouter::new(cache));
        let handle = ClientHandle::new(router, executor);
        let registry = Arc::new(CommandRegistry::new(
            self.config.commands.to_registry_options(),
        ));
        let pipeline = Arc::new(Pipeline::new(
            handle.clone(),
            registry,
            self.config.commands.to_pipeline_config(),
        ));

        debug!(
            prefixes = ?self.config.commands.prefixes,
            intents = self.config.client.intents,
            "Client built"
        );

        Ok(Client {
            config: self.config,
            handle,
            pipeline,
            connector,
            shutdown: CancellationToken::new(),
            starting: AtomicBool::new(false),
            session: Mutex::new(None),
        })
    }
}

#[cfg(feature = "http")]
fn default_executor(config: &FerrumConfig) -> RuntimeResult<BoxedExecutor> {
    let credentials = Credentials::new(&config.client.token);
    let executor = ferrum_gateway::HttpExecutor::new(&config.client.to_http_config(), &credentials)?;
    Ok(Arc::new(executor))
}

#[cfg(not(feature = "http"))]
fn default_executor(_config: &FerrumConfig) -> RuntimeResult<BoxedExecutor> {
    Err(RuntimeError::MissingExecutor)
}

#[cfg(feature = "ws")]
fn default_connector() -> RuntimeResult<BoxedConnector> {
    Ok(Arc::new(ferrum_gateway::WsConnector::new()))
}

#[cfg(not(feature = "ws"))]
fn default_connector() -> RuntimeResult<BoxedConnector> {
    Err(RuntimeError::MissingConnector)
}

// =============================================================================
// Client
// =============================================================================

/// State of a started client.
struct Running {
    session_cancel: CancellationToken,
    tasks_cancel: CancellationToken,
    status: watch::Receiver<SessionStatus>,
    ended: Option<oneshot::Receiver<GatewayResult<()>>>,
    pipeline_listener: ListenerId,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Client {
    config: FerrumConfig,
    handle: ClientHandle,
    pipeline: Arc<Pipeline>,
    connector: BoxedConnector,
    shutdown: CancellationToken,
    /// Claimed by the first `start`; released only if that start fails.
    starting: AtomicBool,
    session: Mutex<Option<Running>>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn handle(&self) -> &ClientHandle {
        &self.handle
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        self.pipeline.registry()
    }

    pub fn config(&self) -> &FerrumConfig {
        &self.config
    }

    /// Session snapshot, or `None` before `start`.
    pub fn status(&self) -> Option<SessionStatus> {
        self.session
            .lock()
            .as_ref()
            .map(|running| running.status.borrow().clone())
    }

    /// Token cancelled when the client shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn add_command(&self, builder: CommandBuilder) -> RuntimeResult<Arc<Command>> {
        Ok(self.registry().add_command(builder)?)
    }

    pub async fn load_extension<E: Extension>(&self, extension: E) -> RuntimeResult<()> {
        Ok(self.pipeline.load_extension(extension).await?)
    }

    /// Starts a periodic task that ends with the client. Returns `false` if
    /// it is already running.
    pub fn start_loop(&self, task: &Loop) -> bool {
        task.start(&self.shutdown)
    }

    /// Registers a client-owned listener for `event`.
    pub fn on<F, Fut>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.handle
            .router()
            .register_listener(event, Owner::Client, listener)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Connects and starts routing events. Returns once the session is READY.
    ///
    /// Fails with [`RuntimeError::AlreadyRunning`] while another start is in
    /// progress or has succeeded, and with [`RuntimeError::ShutDown`] once
    /// the client has been shut down.
    pub async fn start(&self) -> RuntimeResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(RuntimeError::ShutDown);
        }
        if self.starting.swap(true, Ordering::AcqRel) {
            return Err(RuntimeError::AlreadyRunning);
        }

        let result = self.launch().await;
        if result.is_err() {
            self.starting.store(false, Ordering::Release);
        }
        result
    }

    async fn launch(&self) -> RuntimeResult<()> {
        let url = match &self.config.client.gateway_url {
            Some(url) => url.clone(),
            None => self.handle.fetch_gateway_url().await?,
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(
            Arc::clone(&self.connector),
            self.config.to_gateway_config(),
            events_tx,
        );
        let session = manager
            .connect(&url, Credentials::new(&self.config.client.token))
            .await?;

        // Shutdown may have been requested while connecting.
        let mut slot = self.session.lock();
        if self.shutdown.is_cancelled() {
            session.shutdown();
            return Err(RuntimeError::ShutDown);
        }

        self.handle.attach_gateway(session.sender());
        let pipeline_listener = self.pipeline.attach();

        let tasks_cancel = self.shutdown.child_token();
        let dispatch = tokio::spawn(
            dispatch_loop(
                Arc::clone(self.handle.router()),
                events_rx,
                tasks_cancel.clone(),
            )
            .instrument(span!(Level::DEBUG, "dispatch_loop")),
        );
        let sweeper = self
            .handle
            .router()
            .spawn_sweeper(self.config.gateway.sweep_interval(), tasks_cancel.clone());

        let session_cancel = session.cancel_token();
        let status = session.subscribe();
        let (ended_tx, ended_rx) = oneshot::channel();
        let watcher = tokio::spawn(async move {
            let _ = ended_tx.send(session.join().await);
        });

        *slot = Some(Running {
            session_cancel,
            tasks_cancel,
            status,
            ended: Some(ended_rx),
            pipeline_listener,
            tasks: vec![dispatch, sweeper, watcher],
        });

        info!(url = %url, "Client started");
        Ok(())
    }

    /// Starts and runs until Ctrl+C, SIGTERM or session loss.
    pub async fn run(&self) -> RuntimeResult<()> {
        info!("Ferrum client is starting. Press Ctrl+C to stop.");
        self.run_until(wait_for_signal()).await
    }

    /// Starts and runs until `shutdown` completes or the session is lost.
    ///
    /// Returns the terminal gateway error when the session ended on its own.
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        let ended = self
            .session
            .lock()
            .as_mut()
            .and_then(|running| running.ended.take());

        let result = match ended {
            Some(ended) => tokio::select! {
                _ = shutdown => Ok(()),
                _ = self.shutdown.cancelled() => Ok(()),
                outcome = ended => match outcome {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => {
                        error!(error = %e, "Gateway session ended");
                        Err(RuntimeError::Gateway(e))
                    }
                    Err(_) => Ok(()),
                },
            },
            None => {
                shutdown.await;
                Ok(())
            }
        };

        self.shutdown().await;
        result
    }

    /// Stops the session and background tasks and unloads every extension.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let Some(running) = self.session.lock().take() else {
            return;
        };

        running.session_cancel.cancel();
        running.tasks_cancel.cancel();
        self.handle.detach_gateway();
        self.handle.router().remove_listener(running.pipeline_listener);
        self.pipeline.unload_all().await;

        for task in running.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task failed during shutdown");
            }
        }
        info!("Client stopped");
    }
}

/// Feeds envelopes to the router one at a time so listeners observe
/// sequence order.
async fn dispatch_loop(
    router: Arc<EventRouter>,
    mut events: mpsc::UnboundedReceiver<Envelope>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            envelope = events.recv() => match envelope {
                Some(envelope) => router.dispatch(envelope).await,
                None => break,
            },
        }
    }
    debug!("Dispatch loop stopped");
}

/// Waits for Ctrl+C, or SIGTERM on unix.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Could not register SIGTERM handler"),
        }
    }

    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(e) => {
            error!(error = %e, "Could not listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    }
}
