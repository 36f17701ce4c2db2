//! Service lifecycle management.
//!
//! Stages are declared as [`ServiceDefinition`]s and brought up in
//! dependency order: prerequisites must already be ready, the worker is
//! spawned, readiness is polled against the definition's timeout, and an
//! optional health predicate gets the last word. Shutdown runs the
//! registered hooks, then stops services in reverse start order with a
//! bounded wait per service.

use crate::error::{DialogueError, Result};
use crate::state::events::Event;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Readiness poll interval during startup and shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A running service: its readiness flag, exit signal, and worker handle.
pub struct ServiceHandle {
    /// Set by the worker once it can accept work.
    pub ready: Arc<Event>,
    /// Cancelled to ask the worker to exit.
    pub cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl ServiceHandle {
    /// Bundle a spawned worker with its signals.
    pub fn new(ready: Arc<Event>, cancel: CancellationToken, join: JoinHandle<()>) -> Self {
        Self {
            ready,
            cancel,
            join: Some(join),
        }
    }

    /// Whether the worker task is still running.
    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }

    /// Whether the worker has signalled readiness.
    pub fn is_ready(&self) -> bool {
        self.ready.is_set()
    }
}

/// Factory that spawns a service worker and returns its handle.
pub type ServiceFactory = Box<dyn FnOnce() -> Result<ServiceHandle> + Send>;

/// Post-readiness health predicate.
pub type HealthCheck = Box<dyn Fn(&ServiceHandle) -> bool + Send + Sync>;

/// Declarative description of one service.
pub struct ServiceDefinition {
    /// Unique service name.
    pub name: String,
    /// Constructs and spawns the worker.
    pub factory: ServiceFactory,
    /// Names of services that must be ready first.
    pub dependencies: Vec<String>,
    /// Whether a startup failure aborts the whole startup.
    pub required: bool,
    /// How long to wait for readiness.
    pub startup_timeout: Duration,
    /// Optional health predicate run after readiness.
    pub health_check: Option<HealthCheck>,
}

impl ServiceDefinition {
    /// A required service with the default 60s startup timeout.
    pub fn new(name: impl Into<String>, factory: ServiceFactory) -> Self {
        Self {
            name: name.into(),
            factory,
            dependencies: Vec::new(),
            required: true,
            startup_timeout: Duration::from_secs(60),
            health_check: None,
        }
    }

    /// Require `deps` to be ready before this service starts.
    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| (*d).to_owned()).collect();
        self
    }

    /// Override the startup timeout.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Mark the service optional: its failure is recorded, not propagated.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Attach a health predicate.
    pub fn with_health_check(mut self, check: HealthCheck) -> Self {
        self.health_check = Some(check);
        self
    }
}

/// Per-service status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub ready: bool,
}

/// Full manager status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub total_services: usize,
    pub services: HashMap<String, ServiceStatus>,
    pub startup_times_secs: HashMap<String, f64>,
    pub startup_errors: HashMap<String, String>,
}

/// Starts, monitors and stops the pipeline services.
pub struct ServiceManager {
    /// Started services in start order.
    services: Vec<(String, ServiceHandle)>,
    startup_errors: HashMap<String, String>,
    startup_times: HashMap<String, Duration>,
    shutdown_hooks: Vec<Box<dyn FnOnce() + Send + Sync>>,
    shutdown_wait: Duration,
}

impl ServiceManager {
    /// Create a manager with the given per-service shutdown wait.
    pub fn new(shutdown_wait: Duration) -> Self {
        Self {
            services: Vec::new(),
            startup_errors: HashMap::new(),
            startup_times: HashMap::new(),
            shutdown_hooks: Vec::new(),
            shutdown_wait,
        }
    }

    /// Register a hook to run first during shutdown.
    pub fn add_shutdown_hook(&mut self, hook: Box<dyn FnOnce() + Send + Sync>) {
        self.shutdown_hooks.push(hook);
    }

    /// Start one service per its definition.
    ///
    /// Returns `Ok(true)` on success and `Ok(false)` for a failed optional
    /// service.
    ///
    /// # Errors
    ///
    /// Returns a startup error when a required service fails.
    pub async fn start_service(&mut self, definition: ServiceDefinition) -> Result<bool> {
        let name = definition.name.clone();
        let start = Instant::now();
        info!("starting service: {name}");

        match self.try_start(definition).await {
            Ok(handle) => {
                let elapsed = start.elapsed();
                info!("service {name} started in {:.2}s", elapsed.as_secs_f64());
                self.startup_times.insert(name.clone(), elapsed);
                self.services.push((name, handle));
                Ok(true)
            }
            Err((required, e)) => {
                let message = format!("service {name} failed to start: {e}");
                error!("{message}");
                self.startup_errors.insert(name, message.clone());
                if required {
                    Err(DialogueError::Startup(message))
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// Start a batch of services in order; a required failure tears down
    /// everything already started.
    ///
    /// # Errors
    ///
    /// Returns the first required service's startup error.
    pub async fn start_services(&mut self, definitions: Vec<ServiceDefinition>) -> Result<()> {
        for definition in definitions {
            if let Err(e) = self.start_service(definition).await {
                self.stop_all().await;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn try_start(
        &self,
        definition: ServiceDefinition,
    ) -> std::result::Result<ServiceHandle, (bool, DialogueError)> {
        let required = definition.required;

        for dep in &definition.dependencies {
            let ready = self
                .services
                .iter()
                .find(|(name, _)| name == dep)
                .map(|(_, handle)| handle.is_ready());
            match ready {
                Some(true) => {}
                Some(false) => {
                    return Err((
                        required,
                        DialogueError::Startup(format!("dependency {dep} is not ready")),
                    ));
                }
                None => {
                    return Err((
                        required,
                        DialogueError::Startup(format!("dependency {dep} is not started")),
                    ));
                }
            }
        }

        let mut handle = (definition.factory)().map_err(|e| (required, e))?;

        // Poll readiness; bail out early if the worker died.
        let deadline = Instant::now() + definition.startup_timeout;
        loop {
            if handle.is_ready() {
                break;
            }
            if !handle.is_running() {
                return Err((
                    required,
                    DialogueError::Startup("worker exited before becoming ready".into()),
                ));
            }
            if Instant::now() >= deadline {
                self.shutdown_handle(&definition.name, &mut handle).await;
                return Err((
                    required,
                    DialogueError::Startup(format!(
                        "not ready within {:?}",
                        definition.startup_timeout
                    )),
                ));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        if let Some(check) = &definition.health_check
            && !check(&handle)
        {
            self.shutdown_handle(&definition.name, &mut handle).await;
            return Err((required, DialogueError::Startup("health check failed".into())));
        }

        Ok(handle)
    }

    /// Stop one service by name, waiting up to the shutdown timeout.
    pub async fn stop_service(&mut self, name: &str) -> bool {
        let Some(idx) = self.services.iter().position(|(n, _)| n == name) else {
            return false;
        };
        let (name, mut handle) = self.services.remove(idx);
        info!("stopping service: {name}");
        self.shutdown_handle(&name, &mut handle).await;
        true
    }

    /// Run shutdown hooks, then stop every service in reverse start order.
    pub async fn stop_all(&mut self) {
        info!("stopping all services");
        for hook in self.shutdown_hooks.drain(..) {
            hook();
        }
        while let Some((name, mut handle)) = self.services.pop() {
            info!("stopping service: {name}");
            self.shutdown_handle(&name, &mut handle).await;
        }
    }

    async fn shutdown_handle(&self, name: &str, handle: &mut ServiceHandle) {
        handle.cancel.cancel();
        let Some(mut join) = handle.join.take() else {
            return;
        };
        match tokio::time::timeout(self.shutdown_wait, &mut join).await {
            Ok(_) => info!("service {name} stopped"),
            Err(_) => {
                warn!("service {name} did not stop within {:?}", self.shutdown_wait);
                join.abort();
            }
        }
    }

    /// Whether `name` is started and its worker is still running.
    pub fn is_service_running(&self, name: &str) -> bool {
        self.services
            .iter()
            .any(|(n, handle)| n == name && handle.is_running())
    }

    /// Whether `name` is started and ready.
    pub fn is_service_ready(&self, name: &str) -> bool {
        self.services
            .iter()
            .any(|(n, handle)| n == name && handle.is_ready())
    }

    /// Status snapshot for observability.
    pub fn status(&self) -> ManagerStatus {
        ManagerStatus {
            total_services: self.services.len(),
            services: self
                .services
                .iter()
                .map(|(name, handle)| {
                    (
                        name.clone(),
                        ServiceStatus {
                            running: handle.is_running(),
                            ready: handle.is_ready(),
                        },
                    )
                })
                .collect(),
            startup_times_secs: self
                .startup_times
                .iter()
                .map(|(name, d)| (name.clone(), d.as_secs_f64()))
                .collect(),
            startup_errors: self.startup_errors.clone(),
        }
    }
}

/// Spawn a worker future as a service handle with fresh signals.
///
/// The worker receives the readiness event and exit token; it must set
/// the event once it can accept work and return promptly on cancellation.
pub fn spawn_service<F, Fut>(worker: F) -> ServiceHandle
where
    F: FnOnce(Arc<Event>, CancellationToken) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let ready = Arc::new(Event::new());
    let cancel = CancellationToken::new();
    let join = tokio::spawn(worker(Arc::clone(&ready), cancel.clone()));
    ServiceHandle::new(ready, cancel, join)
}
