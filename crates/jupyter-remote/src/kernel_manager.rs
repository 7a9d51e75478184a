//! Kernel lifecycle over the server REST API.
//!
//! The manager keeps a registry of the kernels it knows about. Mutations are
//! applied to the registry optimistically before the REST call and reconciled
//! (or reverted) when the server answers. Lifecycle changes are broadcast as
//! [`LifecycleEvent`]s, which is how kernel connections learn about restarts
//! and shutdowns they did not initiate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use jupyter_protocol::ExecutionState;
use log::{debug, info, warn};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::kernelspec::KernelSpecManager;
use crate::poll::{spawn_poll, PollPolicy};
use crate::server_connection::{expect_status, read_json, ServerConnection};

/// Kernel status as reported by the server or observed on iopub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    Starting,
    Idle,
    Busy,
    Terminating,
    Restarting,
    Autorestarting,
    Dead,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelStatus::Starting => write!(f, "starting"),
            KernelStatus::Idle => write!(f, "idle"),
            KernelStatus::Busy => write!(f, "busy"),
            KernelStatus::Terminating => write!(f, "terminating"),
            KernelStatus::Restarting => write!(f, "restarting"),
            KernelStatus::Autorestarting => write!(f, "autorestarting"),
            KernelStatus::Dead => write!(f, "dead"),
            KernelStatus::Unknown => write!(f, "unknown"),
        }
    }
}

impl KernelStatus {
    /// The kernel process is alive but may be too occupied to answer.
    pub fn is_working(&self) -> bool {
        matches!(
            self,
            KernelStatus::Busy
                | KernelStatus::Starting
                | KernelStatus::Restarting
                | KernelStatus::Autorestarting
        )
    }
}

impl From<&ExecutionState> for KernelStatus {
    fn from(state: &ExecutionState) -> Self {
        match state {
            ExecutionState::Starting => KernelStatus::Starting,
            ExecutionState::Idle => KernelStatus::Idle,
            ExecutionState::Busy => KernelStatus::Busy,
            ExecutionState::Restarting => KernelStatus::Restarting,
            ExecutionState::Terminating => KernelStatus::Terminating,
            ExecutionState::Dead => KernelStatus::Dead,
            _ => KernelStatus::Unknown,
        }
    }
}

/// A running kernel, as modelled by `GET /api/kernels`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kernel {
    pub id: String,
    /// Kernel spec name.
    pub name: String,
    #[serde(rename = "execution_state", default = "unknown_status")]
    pub status: KernelStatus,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default)]
    pub connections: u32,
}

fn unknown_status() -> KernelStatus {
    KernelStatus::Unknown
}

/// Kernel lifecycle changes, broadcast to every interested connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Started { kernel_id: String },
    /// Same kernel id, fresh process. Connections re-handshake.
    Restarted { kernel_id: String },
    /// Shut down through this manager.
    ShutDown { kernel_id: String },
    /// Disappeared from the server without a shutdown request.
    Died { kernel_id: String },
}

impl LifecycleEvent {
    pub fn kernel_id(&self) -> &str {
        match self {
            LifecycleEvent::Started { kernel_id }
            | LifecycleEvent::Restarted { kernel_id }
            | LifecycleEvent::ShutDown { kernel_id }
            | LifecycleEvent::Died { kernel_id } => kernel_id,
        }
    }
}

/// What a kernel connection needs from whoever manages kernel lifecycles.
pub trait KernelLifecycle: Send + Sync + 'static {
    fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent>;

    /// Report a status observed on a kernel's iopub channel.
    fn record_status(&self, kernel_id: &str, status: KernelStatus);

    /// Execution state the server reports for a kernel. `None` once the
    /// server no longer knows it.
    fn server_status<'a>(
        &'a self,
        kernel_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<KernelStatus>>>;
}

pub struct KernelManager {
    server: Arc<ServerConnection>,
    specs: Arc<KernelSpecManager>,
    kernels: StdMutex<HashMap<String, Kernel>>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl KernelManager {
    pub fn new(server: Arc<ServerConnection>, specs: Arc<KernelSpecManager>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            server,
            specs,
            kernels: StdMutex::new(HashMap::new()),
            events,
        }
    }

    pub fn specs(&self) -> &Arc<KernelSpecManager> {
        &self.specs
    }

    pub fn server(&self) -> &Arc<ServerConnection> {
        &self.server
    }

    /// Registry entry for `kernel_id`, without asking the server.
    pub fn kernel(&self, kernel_id: &str) -> Option<Kernel> {
        self.registry().get(kernel_id).cloned()
    }

    /// All registry entries, without asking the server.
    pub fn kernels(&self) -> Vec<Kernel> {
        let mut kernels: Vec<Kernel> = self.registry().values().cloned().collect();
        kernels.sort_by(|a, b| a.id.cmp(&b.id));
        kernels
    }

    /// Start a kernel from `spec_name`, or from the default spec.
    pub async fn start_kernel(&self, spec_name: Option<&str>) -> Result<Kernel> {
        let name = match spec_name {
            Some(name) => name.to_string(),
            None => self.specs.get_default_spec().await?.name,
        };
        info!("[kernel-manager] Starting {} kernel", name);

        let url = self.server.build_url("api/kernels")?;
        let response = self
            .server
            .fetch(Method::POST, url, Some(&json!({ "name": name })))
            .await?;
        let response = expect_status(response, &[StatusCode::CREATED, StatusCode::OK]).await?;
        let kernel: Kernel = read_json(response).await?;

        info!(
            "[kernel-manager] Started kernel {} ({})",
            kernel.id, kernel.name
        );
        self.registry().insert(kernel.id.clone(), kernel.clone());
        self.emit(LifecycleEvent::Started {
            kernel_id: kernel.id.clone(),
        });
        Ok(kernel)
    }

    /// Restart a kernel. The id survives; status goes back to `starting`.
    pub async fn restart_kernel(&self, kernel_id: &str) -> Result<Kernel> {
        let previous = self.set_status(kernel_id, KernelStatus::Restarting);
        info!("[kernel-manager] Restarting kernel {}", kernel_id);

        let result = async {
            let url = self
                .server
                .build_url(&format!("api/kernels/{}/restart", kernel_id))?;
            let response = self.server.fetch::<()>(Method::POST, url, None).await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Err(self.forget(kernel_id));
            }
            let response = expect_status(response, &[StatusCode::OK]).await?;
            read_json::<Kernel>(response).await
        }
        .await;

        let mut kernel = match result {
            Ok(kernel) => kernel,
            Err(e) => {
                if let Some(previous) = previous {
                    self.set_status(kernel_id, previous);
                }
                return Err(e);
            }
        };

        if kernel.id != kernel_id {
            warn!(
                "[kernel-manager] Restart of {} answered with kernel {}",
                kernel_id, kernel.id
            );
            kernel.id = kernel_id.to_string();
        }
        kernel.status = KernelStatus::Starting;
        self.registry().insert(kernel.id.clone(), kernel.clone());
        self.emit(LifecycleEvent::Restarted {
            kernel_id: kernel.id.clone(),
        });
        Ok(kernel)
    }

    pub async fn interrupt_kernel(&self, kernel_id: &str) -> Result<()> {
        info!("[kernel-manager] Interrupting kernel {}", kernel_id);
        let url = self
            .server
            .build_url(&format!("api/kernels/{}/interrupt", kernel_id))?;
        let response = self.server.fetch::<()>(Method::POST, url, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(self.forget(kernel_id));
        }
        expect_status(response, &[StatusCode::NO_CONTENT, StatusCode::OK]).await?;
        Ok(())
    }

    /// Shut a kernel down. Connections bound to it fail all their work with
    /// [`Error::KernelDead`].
    pub async fn shutdown_kernel(&self, kernel_id: &str) -> Result<()> {
        let previous = self.set_status(kernel_id, KernelStatus::Terminating);
        info!("[kernel-manager] Shutting down kernel {}", kernel_id);

        let result = async {
            let url = self
                .server
                .build_url(&format!("api/kernels/{}", kernel_id))?;
            let response = self.server.fetch::<()>(Method::DELETE, url, None).await?;
            if response.status() == StatusCode::NOT_FOUND {
                warn!(
                    "[kernel-manager] Kernel {} was already gone at shutdown",
                    kernel_id
                );
                return Ok(());
            }
            expect_status(response, &[StatusCode::NO_CONTENT, StatusCode::OK]).await?;
            Ok::<_, Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                self.registry().remove(kernel_id);
                self.emit(LifecycleEvent::ShutDown {
                    kernel_id: kernel_id.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                if let Some(previous) = previous {
                    self.set_status(kernel_id, previous);
                }
                Err(e)
            }
        }
    }

    /// Shut down every kernel the server reports.
    pub async fn shutdown_all(&self) -> Result<()> {
        let kernels = self.list_kernels().await?;
        let mut first_error = None;
        for kernel in kernels {
            if let Err(e) = self.shutdown_kernel(&kernel.id).await {
                warn!("[kernel-manager] Failed to shut down {}: {}", kernel.id, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Fetch the server's kernel list and reconcile the registry with it.
    /// Kernels that vanished are reported as [`LifecycleEvent::Died`].
    pub async fn list_kernels(&self) -> Result<Vec<Kernel>> {
        let url = self.server.build_url("api/kernels")?;
        let response = self.server.fetch::<()>(Method::GET, url, None).await?;
        let response = expect_status(response, &[StatusCode::OK]).await?;
        let listed: Vec<Kernel> = read_json(response).await?;

        let vanished: Vec<String> = {
            let mut kernels = self.registry();
            let vanished: Vec<String> = kernels
                .keys()
                .filter(|id| !listed.iter().any(|kernel| &kernel.id == *id))
                .cloned()
                .collect();
            for id in &vanished {
                kernels.remove(id);
            }
            for kernel in &listed {
                kernels.insert(kernel.id.clone(), kernel.clone());
            }
            vanished
        };

        for kernel_id in vanished {
            warn!("[kernel-manager] Kernel {} is no longer running", kernel_id);
            self.emit(LifecycleEvent::Died { kernel_id });
        }
        debug!("[kernel-manager] Server reports {} kernels", listed.len());
        Ok(listed)
    }

    /// Ask the server about one kernel. `None` means it is not running.
    pub async fn get_kernel(&self, kernel_id: &str) -> Result<Option<Kernel>> {
        let url = self
            .server
            .build_url(&format!("api/kernels/{}", kernel_id))?;
        let response = self.server.fetch::<()>(Method::GET, url, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            self.forget(kernel_id);
            return Ok(None);
        }
        let response = expect_status(response, &[StatusCode::OK]).await?;
        let kernel: Kernel = read_json(response).await?;
        self.registry().insert(kernel.id.clone(), kernel.clone());
        Ok(Some(kernel))
    }

    /// Take over a kernel that was started by someone else, such as the
    /// server's session endpoint.
    pub(crate) fn track(&self, kernel: Kernel) {
        let kernel_id = kernel.id.clone();
        if self.registry().insert(kernel_id.clone(), kernel).is_none() {
            debug!("[kernel-manager] Tracking kernel {}", kernel_id);
            self.emit(LifecycleEvent::Started { kernel_id });
        }
    }

    /// Record a shutdown the server performed on its own, e.g. when the
    /// session that owned the kernel was deleted.
    pub(crate) fn mark_shut_down(&self, kernel_id: &str) {
        self.registry().remove(kernel_id);
        info!("[kernel-manager] Kernel {} shut down with its session", kernel_id);
        self.emit(LifecycleEvent::ShutDown {
            kernel_id: kernel_id.to_string(),
        });
    }

    /// Poll the server for kernel statuses in the background, catching
    /// kernels that die out of band.
    pub fn spawn_polling(self: &Arc<Self>, policy: PollPolicy) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        spawn_poll("kernel-manager", policy, move || {
            let manager = Arc::clone(&manager);
            async move { manager.list_kernels().await.map(|_| ()) }
        })
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, Kernel>> {
        // Never held across an await.
        self.kernels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Set a kernel's status, returning the previous one.
    fn set_status(&self, kernel_id: &str, status: KernelStatus) -> Option<KernelStatus> {
        self.registry()
            .get_mut(kernel_id)
            .map(|kernel| std::mem::replace(&mut kernel.status, status))
    }

    /// Drop a kernel the server no longer knows, returning the error to
    /// surface for it.
    fn forget(&self, kernel_id: &str) -> Error {
        if self.registry().remove(kernel_id).is_some() {
            warn!("[kernel-manager] Kernel {} not found on server", kernel_id);
            self.emit(LifecycleEvent::Died {
                kernel_id: kernel_id.to_string(),
            });
        }
        Error::NotFound(format!("kernel {}", kernel_id))
    }

    fn emit(&self, event: LifecycleEvent) {
        // No receivers is fine; nobody is connected to that kernel.
        let _ = self.events.send(event);
    }
}

impl KernelLifecycle for KernelManager {
    fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    fn record_status(&self, kernel_id: &str, status: KernelStatus) {
        let mut kernels = self.registry();
        match kernels.get_mut(kernel_id) {
            Some(kernel) => {
                kernel.status = status;
                kernel.last_activity = Some(Utc::now());
            }
            None => debug!(
                "[kernel-manager] Status {} for untracked kernel {}",
                status, kernel_id
            ),
        }
    }

    fn server_status<'a>(
        &'a self,
        kernel_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<KernelStatus>>> {
        Box::pin(async move {
            Ok(self
                .get_kernel(kernel_id)
                .await?
                .map(|kernel| kernel.status))
        })
    }
}
