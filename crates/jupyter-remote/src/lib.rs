//! jupyter-remote - Client for kernels running on a remote Jupyter server.
//!
//! The server is reached over its REST API (kernel specs, kernels, contents)
//! and each kernel over a WebSocket carrying all four Jupyter channels.
//!
//! [`KernelConnection`] is the core: one actor task per kernel that owns the
//! socket, sends shell requests one at a time in submission order, matches
//! replies and iopub output to the request that caused them, and reconnects
//! with backoff without losing or reordering queued work.
//!
//! ```no_run
//! # async fn run() -> jupyter_remote::Result<()> {
//! use std::sync::Arc;
//! use jupyter_remote::{
//!     ConnectionConfig, KernelManager, KernelSpecManager, ServerConnection, ServerSettings,
//!     SessionManager, WebSocketConnector,
//! };
//!
//! let settings = ServerSettings::new("http://localhost:8888/".parse()?)?.with_token("secret");
//! let server = Arc::new(ServerConnection::new(settings)?);
//! let specs = Arc::new(KernelSpecManager::new(Arc::clone(&server)));
//! let kernels = Arc::new(KernelManager::new(Arc::clone(&server), specs));
//! let connector = Arc::new(WebSocketConnector::new(Arc::clone(&server)));
//! let sessions = SessionManager::new(kernels, connector, ConnectionConfig::default());
//!
//! let kernel = sessions.connect("analysis.ipynb", None).await?;
//! let reply = kernel.execute_code("1 + 1").reply().await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod comm;
pub mod config;
pub mod contents;
pub mod error;
pub mod kernel_connection;
pub mod kernel_manager;
pub mod kernelspec;
pub mod poll;
pub mod sequencer;
pub mod server_connection;
pub mod session;
pub mod transport;

mod pending;

#[cfg(test)]
mod test_support;

pub use backoff::ReconnectPolicy;
pub use comm::{Comm, CommTarget};
pub use config::{ClientConfig, ConnectionConfig, HeartbeatPolicy};
pub use contents::{
    Checkpoint, Content, ContentBody, ContentKind, ContentsChange, ContentsManager, GetOptions,
};
pub use error::{Error, Result};
pub use kernel_connection::{
    Completion, ConnectionState, HistoryItem, KernelConnection, ShellFuture,
};
pub use kernel_manager::{Kernel, KernelLifecycle, KernelManager, KernelStatus, LifecycleEvent};
pub use kernelspec::{KernelSpec, KernelSpecManager, SpecsSnapshot};
pub use poll::PollPolicy;
pub use sequencer::{Sequenced, Sequencer};
pub use server_connection::{ServerConnection, ServerSettings};
pub use session::{Session, SessionManager, SessionModel};
pub use transport::{Frame, KernelSocket, SocketConnector, WebSocketConnector};

pub use jupyter_wire::{Channel, WireMessage};
