//! Host lifecycle hooks.
//!
//! [`UploadModule`] is the surface a build server calls at fixed points in its
//! command cycle. Each hook either completes or returns an [`AbruptExit`] the
//! host turns into a process exit code. Per-sink problems never surface here;
//! they are reported as warnings on the command's reporter.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{BackendOptions, UploadOptions};
use crate::error::{AbruptExit, UploadError};
use crate::lifecycle::{InvocationContext, UploadLifecycleManager, UploadReport};
use crate::outerr::OutErr;
use crate::reporter::{Message, Reporter};
use crate::sinks::{open_sinks, BackendClient, HttpBackendClient, BACKEND_SINK};
use crate::streamer::EventBus;
use crate::types::{new_build_request_id, new_invocation_id};

/// Creates the client for a remote backend.
pub type BackendConnector =
    Arc<dyn Fn(&BackendOptions) -> anyhow::Result<Arc<dyn BackendClient>> + Send + Sync>;

/// Everything the host knows about the command that is about to run.
#[derive(Clone)]
pub struct CommandEnvironment {
    pub command_name: String,
    pub build_request_id: String,
    pub invocation_id: String,
    pub reporter: Arc<dyn Reporter>,
    pub options: UploadOptions,
}

impl CommandEnvironment {
    pub fn new(
        command_name: impl Into<String>,
        options: UploadOptions,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            command_name: command_name.into(),
            build_request_id: new_build_request_id(),
            invocation_id: new_invocation_id(),
            reporter,
            options,
        }
    }

    pub fn with_build_request_id(mut self, id: impl Into<String>) -> Self {
        self.build_request_id = id.into();
        self
    }
}

struct CommandState {
    context: InvocationContext,
    options: UploadOptions,
    sinks: Vec<String>,
    out_err: OutErr,
}

struct CachedClient {
    options: BackendOptions,
    client: Arc<dyn BackendClient>,
}

pub struct UploadModule {
    manager: UploadLifecycleManager,
    connector: BackendConnector,
    backend: Mutex<Option<CachedClient>>,
    current: Mutex<Option<CommandState>>,
}

impl Default for UploadModule {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadModule {
    pub fn new() -> Self {
        Self {
            manager: UploadLifecycleManager::default(),
            connector: Arc::new(|options: &BackendOptions| {
                let client: Arc<dyn BackendClient> = Arc::new(HttpBackendClient::new(options)?);
                Ok(client)
            }),
            backend: Mutex::new(None),
            current: Mutex::new(None),
        }
    }

    pub fn with_backend_connector(mut self, connector: BackendConnector) -> Self {
        self.connector = connector;
        self
    }

    pub fn manager(&self) -> &UploadLifecycleManager {
        &self.manager
    }

    /// True while a backend client is cached between commands.
    pub fn has_cached_backend_client(&self) -> bool {
        self.backend.lock().is_some()
    }

    /// Reconcile the previous command's uploads, then validate options, open
    /// this command's sinks and start streaming. Returns the event source for
    /// the build engine.
    pub async fn before_command(&self, env: CommandEnvironment) -> Result<EventBus, AbruptExit> {
        self.manager.configure(env.options.lifecycle_config());
        self.manager
            .before_invocation(env.reporter.as_ref())
            .await
            .map_err(UploadError::into_abrupt_exit)?;
        if let Err(err) = env.options.validate() {
            env.reporter.handle(Message::error(err.to_string()));
            self.manager
                .abandon_invocation()
                .map_err(UploadError::into_abrupt_exit)?;
            return Err(UploadError::from(err).into_abrupt_exit());
        }

        let context = InvocationContext::new(
            env.build_request_id.clone(),
            env.invocation_id.clone(),
            env.reporter.clone(),
        );

        let transports = if env.options.allows_command(&env.command_name) {
            let client = match &env.options.backend {
                Some(backend) => self.backend_client(backend, env.reporter.as_ref()),
                None => None,
            };
            open_sinks(&env.options, &context, client).transports
        } else {
            debug!(command = %env.command_name, "command not in allow-list; streaming to no sinks");
            Vec::new()
        };
        let sinks: Vec<String> = transports.iter().map(|t| t.name().to_string()).collect();
        if sinks.iter().any(|s| s == BACKEND_SINK) {
            announce_backend(&env);
        }

        let bus = self
            .manager
            .start_invocation(context.clone(), transports)
            .map_err(UploadError::into_abrupt_exit)?;
        let out_err = OutErr::attach(
            bus.streamer(),
            env.options.outerr_buffer_size,
            env.options.outerr_chunk_size,
        );
        *self.current.lock() = Some(CommandState {
            context,
            options: env.options,
            sinks,
            out_err,
        });
        Ok(bus)
    }

    /// Listener for the running command's stdout/stderr. Anything written to
    /// it is posted into the command's build event stream.
    pub fn output_listener(&self) -> Option<OutErr> {
        self.current.lock().as_ref().map(|state| state.out_err.clone())
    }

    /// Close this command's sinks according to its upload mode.
    pub async fn after_command(&self) -> Result<UploadReport, AbruptExit> {
        let Some(state) = self.current.lock().take() else {
            return Ok(UploadReport::default());
        };
        let result = self.manager.end_invocation(state.options.upload_mode).await;
        if !state.options.keep_backend_connections {
            self.backend.lock().take();
        }
        let report = result.map_err(UploadError::into_abrupt_exit)?;

        let reporter = &state.context.reporter;
        if state.sinks.iter().any(|s| s == BACKEND_SINK) {
            if let Some(prefix) = state
                .options
                .backend
                .as_ref()
                .and_then(|b| b.results_url_prefix.as_ref())
            {
                reporter.handle(Message::info(format!(
                    "Streaming build results to: {}{}",
                    prefix, state.context.invocation_id
                )));
            }
        } else if !state.sinks.is_empty() {
            reporter.handle(Message::info("Build Event Protocol files produced successfully."));
        }
        info!(
            invocation_id = %state.context.invocation_id,
            sinks = state.sinks.len(),
            "after_command finished"
        );
        Ok(report)
    }

    /// Orderly server shutdown.
    pub async fn shutdown(&self) {
        self.current.lock().take();
        self.manager.on_process_shutdown().await;
        self.backend.lock().take();
    }

    /// The server is going down abnormally. Never fails.
    pub async fn shutdown_on_crash(&self) {
        self.current.lock().take();
        self.manager.on_crash().await;
        self.backend.lock().take();
    }

    fn backend_client(
        &self,
        options: &BackendOptions,
        reporter: &dyn Reporter,
    ) -> Option<Arc<dyn BackendClient>> {
        let mut cached = self.backend.lock();
        if let Some(existing) = cached.as_ref() {
            if existing.options == *options {
                debug!(endpoint = %options.endpoint, "reusing build event backend client");
                return Some(existing.client.clone());
            }
        }
        match (self.connector)(options) {
            Ok(client) => {
                *cached = Some(CachedClient {
                    options: options.clone(),
                    client: client.clone(),
                });
                Some(client)
            }
            Err(err) => {
                cached.take();
                reporter.handle(Message::warn(format!(
                    "Unable to connect to '{}'. Omitting build event backend: {:#}",
                    options.endpoint, err
                )));
                None
            }
        }
    }
}

fn announce_backend(env: &CommandEnvironment) {
    let Some(backend) = &env.options.backend else {
        return;
    };
    env.reporter.handle(Message::info(format!(
        "Streaming Build Event Protocol to '{}' with build_request_id: '{}' and invocation_id: '{}'",
        backend.endpoint, env.build_request_id, env.invocation_id
    )));
    if let Some(prefix) = &backend.results_url_prefix {
        env.reporter.handle(Message::info(format!(
            "Streaming build results to: {}{}",
            prefix, env.invocation_id
        )));
    }
    if let Some(prefix) = &backend.request_url_prefix {
        env.reporter.handle(Message::info(format!(
            "See {}{} for more information about your request.",
            prefix, env.build_request_id
        )));
    }
}
