//! Document path ↔ kernel bindings, backed by the server's sessions API.
//!
//! Every bound path has a session on the server (`/api/sessions`), so a
//! client that restarts finds the path's kernel again instead of starting a
//! new one. Several paths may share one kernel, and they then share one
//! [`KernelConnection`]. The connection is shut down when the last path
//! bound to its kernel closes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use log::{debug, info, warn};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::kernel_connection::KernelConnection;
use crate::kernel_manager::{Kernel, KernelLifecycle, KernelManager};
use crate::server_connection::{expect_status, read_json};
use crate::transport::SocketConnector;

/// A session as modelled by `GET /api/sessions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionModel {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub name: String,
    /// `notebook`, `file` or `console`.
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub kernel: Option<Kernel>,
}

/// A local binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub path: String,
    pub kernel_id: String,
    /// Server session id. `None` for bindings the server does not know.
    pub id: Option<String>,
}

#[derive(Debug, Clone)]
struct Binding {
    kernel_id: String,
    session_id: Option<String>,
}

#[derive(Default)]
struct Bindings {
    /// path -> binding
    paths: HashMap<String, Binding>,
    /// kernel id -> connection
    connections: HashMap<String, KernelConnection>,
}

impl Bindings {
    fn is_bound(&self, kernel_id: &str) -> bool {
        self.paths
            .values()
            .any(|binding| binding.kernel_id == kernel_id)
    }
}

pub struct SessionManager {
    kernels: Arc<KernelManager>,
    connector: Arc<dyn SocketConnector>,
    config: ConnectionConfig,
    bindings: StdMutex<Bindings>,
    /// Serialises every operation that talks to the server, so two callers
    /// asking for the same path get the same kernel.
    binding_lock: Mutex<()>,
}

impl SessionManager {
    pub fn new(
        kernels: Arc<KernelManager>,
        connector: Arc<dyn SocketConnector>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            kernels,
            connector,
            config,
            bindings: StdMutex::new(Bindings::default()),
            binding_lock: Mutex::new(()),
        }
    }

    /// Connection for `path`.
    ///
    /// Without a live local binding the server is asked for the path's
    /// session. It hands back the existing one, kernel included, or starts
    /// a kernel from `spec_name` (or the default spec).
    pub async fn connect(&self, path: &str, spec_name: Option<&str>) -> Result<KernelConnection> {
        let _guard = self.binding_lock.lock().await;

        if let Some(connection) = self.live_connection(path) {
            debug!(
                "[sessions] Reusing kernel {} for {}",
                connection.kernel_id(),
                path
            );
            return Ok(connection);
        }

        let name = match spec_name {
            Some(name) => name.to_string(),
            None => self.kernels.specs().get_default_spec().await?.name,
        };
        let session = self.start_session(path, json!({ "name": name })).await?;
        let kernel = session_kernel(&session)?;
        self.kernels.track(kernel.clone());

        let connection = self.bind(path, &kernel.id, Some(session.id.clone()));
        info!(
            "[sessions] {} is session {} on kernel {} ({})",
            path, session.id, kernel.id, kernel.name
        );
        Ok(connection)
    }

    /// Bind `path` to a kernel that is already running.
    ///
    /// The server stops the kernel the path's session used before, as it
    /// does for any kernel change on a session.
    pub async fn attach(&self, path: &str, kernel_id: &str) -> Result<KernelConnection> {
        let _guard = self.binding_lock.lock().await;

        if self.kernels.get_kernel(kernel_id).await?.is_none() {
            return Err(Error::NotFound(format!("kernel {}", kernel_id)));
        }
        let previous = self.registry().paths.get(path).cloned();
        let session_id = match previous.as_ref().and_then(|b| b.session_id.clone()) {
            Some(id) => Some(id),
            None => self.find_running(path).await?.map(|session| session.id),
        };
        let session = match session_id {
            Some(id) => {
                self.patch_session(&id, &json!({ "kernel": { "id": kernel_id } }))
                    .await?
            }
            None => self.start_session(path, json!({ "id": kernel_id })).await?,
        };

        let connection = self.bind(path, kernel_id, Some(session.id));
        if let Some(previous) = previous.filter(|b| b.kernel_id != kernel_id) {
            self.release(&previous.kernel_id).await;
        }
        info!("[sessions] Attached {} to kernel {}", path, kernel_id);
        Ok(connection)
    }

    /// The connection bound to `path`, if any.
    pub fn kernel_for(&self, path: &str) -> Option<KernelConnection> {
        let bindings = self.registry();
        let binding = bindings.paths.get(path)?;
        bindings.connections.get(&binding.kernel_id).cloned()
    }

    /// Move a binding to a new path, as when a notebook is renamed. The
    /// server session follows.
    pub async fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        let _guard = self.binding_lock.lock().await;

        let binding = {
            let bindings = self.registry();
            if bindings.paths.contains_key(new_path) {
                return Err(Error::Conflict {
                    path: new_path.to_string(),
                    expected: "no session".to_string(),
                    actual: "an existing session".to_string(),
                });
            }
            bindings
                .paths
                .get(old_path)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("session {}", old_path)))?
        };
        if let Some(session_id) = &binding.session_id {
            self.patch_session(session_id, &json!({ "path": new_path }))
                .await?;
        }

        let mut bindings = self.registry();
        if let Some(binding) = bindings.paths.remove(old_path) {
            debug!(
                "[sessions] {} -> {} (kernel {})",
                old_path, new_path, binding.kernel_id
            );
            bindings.paths.insert(new_path.to_string(), binding);
        }
        Ok(())
    }

    /// Unbind `path`. If it was the kernel's last path, the connection is
    /// shut down, and with `shutdown_kernel` the kernel too, along with the
    /// server session.
    ///
    /// Otherwise the server session stays, so the path finds its kernel
    /// again on the next [`SessionManager::connect`].
    pub async fn close(&self, path: &str, shutdown_kernel: bool) -> Result<()> {
        let _guard = self.binding_lock.lock().await;

        let binding = self
            .registry()
            .paths
            .remove(path)
            .ok_or_else(|| Error::NotFound(format!("session {}", path)))?;
        info!("[sessions] Closed {}", path);

        if !self.release(&binding.kernel_id).await || !shutdown_kernel {
            return Ok(());
        }
        match &binding.session_id {
            // Deleting a session stops its kernel.
            Some(session_id) => {
                self.delete_session(session_id).await?;
                self.kernels.mark_shut_down(&binding.kernel_id);
                Ok(())
            }
            None => self.kernels.shutdown_kernel(&binding.kernel_id).await,
        }
    }

    pub fn sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .registry()
            .paths
            .iter()
            .map(|(path, binding)| Session {
                path: path.clone(),
                kernel_id: binding.kernel_id.clone(),
                id: binding.session_id.clone(),
            })
            .collect();
        sessions.sort_by(|a, b| a.path.cmp(&b.path));
        sessions
    }

    /// Every session the server knows, this client's or not.
    pub async fn list_running(&self) -> Result<Vec<SessionModel>> {
        let url = self.kernels.server().build_url("api/sessions")?;
        let response = self
            .kernels
            .server()
            .fetch::<()>(Method::GET, url, None)
            .await?;
        let response = expect_status(response, &[StatusCode::OK]).await?;
        let sessions: Vec<SessionModel> = read_json(response).await?;
        debug!("[sessions] Server has {} sessions", sessions.len());
        Ok(sessions)
    }

    async fn find_running(&self, path: &str) -> Result<Option<SessionModel>> {
        Ok(self
            .list_running()
            .await?
            .into_iter()
            .find(|session| session.path == path))
    }

    /// `POST /api/sessions`. The server returns the path's existing session
    /// when there is one.
    async fn start_session(&self, path: &str, kernel: Value) -> Result<SessionModel> {
        let name = path.rsplit('/').next().unwrap_or(path);
        let kind = if path.ends_with(".ipynb") {
            "notebook"
        } else {
            "file"
        };
        let body = json!({
            "path": path,
            "name": name,
            "type": kind,
            "kernel": kernel,
        });

        let url = self.kernels.server().build_url("api/sessions")?;
        let response = self
            .kernels
            .server()
            .fetch(Method::POST, url, Some(&body))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("kernel for {}", path)));
        }
        let response = expect_status(response, &[StatusCode::CREATED, StatusCode::OK]).await?;
        read_json(response).await
    }

    async fn patch_session(&self, session_id: &str, body: &Value) -> Result<SessionModel> {
        let url = self
            .kernels
            .server()
            .build_url(&format!("api/sessions/{}", session_id))?;
        let response = self
            .kernels
            .server()
            .fetch(Method::PATCH, url, Some(body))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("session {}", session_id)));
        }
        let response = expect_status(response, &[StatusCode::OK]).await?;
        read_json(response).await
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        let url = self
            .kernels
            .server()
            .build_url(&format!("api/sessions/{}", session_id))?;
        let response = self
            .kernels
            .server()
            .fetch::<()>(Method::DELETE, url, None)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            warn!("[sessions] Session {} was already gone", session_id);
            return Ok(());
        }
        expect_status(response, &[StatusCode::NO_CONTENT, StatusCode::OK]).await?;
        Ok(())
    }

    fn live_connection(&self, path: &str) -> Option<KernelConnection> {
        self.kernel_for(path)
            .filter(|connection| !connection.state().is_closed())
    }

    /// Bind `path` to `kernel_id`, reusing the kernel's connection when it
    /// is still open.
    fn bind(&self, path: &str, kernel_id: &str, session_id: Option<String>) -> KernelConnection {
        let mut bindings = self.registry();
        let connection = match bindings.connections.get(kernel_id) {
            Some(connection) if !connection.state().is_closed() => connection.clone(),
            _ => {
                let lifecycle: Arc<dyn KernelLifecycle> = Arc::clone(&self.kernels) as _;
                let connection = KernelConnection::open(
                    kernel_id,
                    Arc::clone(&self.connector),
                    lifecycle,
                    self.config.clone(),
                );
                bindings
                    .connections
                    .insert(kernel_id.to_string(), connection.clone());
                connection
            }
        };
        bindings.paths.insert(
            path.to_string(),
            Binding {
                kernel_id: kernel_id.to_string(),
                session_id,
            },
        );
        connection
    }

    /// Shut down the connection to `kernel_id` if no path is bound to it.
    /// Returns whether it did.
    async fn release(&self, kernel_id: &str) -> bool {
        let connection = {
            let mut bindings = self.registry();
            if bindings.is_bound(kernel_id) {
                return false;
            }
            bindings.connections.remove(kernel_id)
        };
        match connection {
            Some(connection) => {
                debug!("[sessions] No paths left on kernel {}", kernel_id);
                connection.shutdown().await;
            }
            None => warn!("[sessions] No connection open to kernel {}", kernel_id),
        }
        true
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Bindings> {
        self.bindings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn session_kernel(session: &SessionModel) -> Result<Kernel> {
    session
        .kernel
        .clone()
        .ok_or_else(|| Error::Protocol(format!("session {} has no kernel", session.id)))
}
