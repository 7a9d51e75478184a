//! Comms: long-lived message channels between a frontend object and a
//! kernel object, identified by `comm_id`.
//!
//! Either side may open one. The frontend opens a comm with
//! [`KernelConnection::create_comm`] and [`Comm::open`]; the kernel opens one
//! towards a target name registered with
//! [`KernelConnection::register_comm_target`]. Inbound `comm_msg` and
//! `comm_close` are routed by id to the matching [`Comm`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use jupyter_protocol::{CommClose, CommId, CommMsg, CommOpen, JupyterMessageContent};
use jupyter_wire::WireMessage;
use log::{debug, warn};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::kernel_connection::{KernelConnection, ShellFuture};

/// A comm the kernel opened, on its way to the registered target.
pub(crate) struct Opened {
    comm_id: String,
    open: WireMessage,
    messages: mpsc::UnboundedReceiver<WireMessage>,
}

#[derive(Default)]
struct Comms {
    /// comm id -> receiver of inbound comm_msg / comm_close
    open: HashMap<String, mpsc::UnboundedSender<WireMessage>>,
    /// target name -> receiver of kernel-opened comms
    targets: HashMap<String, mpsc::UnboundedSender<Opened>>,
}

/// Comm routing table shared by a connection's handles and its actor.
#[derive(Clone, Default)]
pub(crate) struct CommRegistry {
    inner: Arc<StdMutex<Comms>>,
}

impl CommRegistry {
    pub(crate) fn open(&self, comm_id: &str) -> mpsc::UnboundedReceiver<WireMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.registry().open.insert(comm_id.to_string(), tx).is_some() {
            warn!("[comms] Replaced comm {}", comm_id);
        }
        rx
    }

    pub(crate) fn add_target(&self, target_name: &str) -> mpsc::UnboundedReceiver<Opened> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry().targets.insert(target_name.to_string(), tx);
        rx
    }

    pub(crate) fn contains(&self, comm_id: &str) -> bool {
        self.registry().open.contains_key(comm_id)
    }

    pub(crate) fn remove(&self, comm_id: &str) {
        if self.registry().open.remove(comm_id).is_some() {
            debug!("[comms] Closed comm {}", comm_id);
        }
    }

    /// Deliver an inbound comm message. Anything else is ignored.
    pub(crate) fn route(&self, message: &WireMessage) {
        let mut comms = self.registry();
        match &message.content {
            JupyterMessageContent::CommOpen(open) => comms.accept(open, message),
            JupyterMessageContent::CommMsg(msg) => comms.deliver(&msg.comm_id.0, message, false),
            JupyterMessageContent::CommClose(close) => {
                comms.deliver(&close.comm_id.0, message, true)
            }
            _ => {}
        }
    }

    /// Drop every comm and target. Their receivers end.
    pub(crate) fn close_all(&self) {
        let mut comms = self.registry();
        if !comms.open.is_empty() {
            debug!("[comms] Closing {} comms", comms.open.len());
        }
        comms.open.clear();
        comms.targets.clear();
    }

    fn registry(&self) -> MutexGuard<'_, Comms> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Comms {
    fn accept(&mut self, open: &CommOpen, message: &WireMessage) {
        let comm_id = open.comm_id.0.clone();
        if self.open.contains_key(&comm_id) {
            warn!("[comms] Kernel reopened comm {}", comm_id);
            return;
        }
        let Some(target) = self.targets.get(&open.target_name) else {
            warn!(
                "[comms] No target {} for comm {}, ignoring it",
                open.target_name, comm_id
            );
            return;
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let opened = Opened {
            comm_id: comm_id.clone(),
            open: message.clone(),
            messages: rx,
        };
        if target.send(opened).is_err() {
            debug!("[comms] Target {} was dropped", open.target_name);
            self.targets.remove(&open.target_name);
            return;
        }
        debug!("[comms] Kernel opened comm {} ({})", comm_id, open.target_name);
        self.open.insert(comm_id, tx);
    }

    fn deliver(&mut self, comm_id: &str, message: &WireMessage, closing: bool) {
        let Some(comm) = self.open.get(comm_id) else {
            debug!("[comms] {} for unknown comm {}", message.msg_type(), comm_id);
            return;
        };
        if comm.send(message.clone()).is_err() || closing {
            self.open.remove(comm_id);
        }
    }
}

/// One end of a comm.
///
/// Dropping it stops routing but sends nothing; use [`Comm::close`] to tell
/// the kernel.
pub struct Comm {
    comm_id: String,
    target_name: String,
    connection: KernelConnection,
    messages: mpsc::UnboundedReceiver<WireMessage>,
}

impl Comm {
    pub(crate) fn new(
        connection: KernelConnection,
        comm_id: String,
        target_name: String,
        messages: mpsc::UnboundedReceiver<WireMessage>,
    ) -> Self {
        Self {
            comm_id,
            target_name,
            connection,
            messages,
        }
    }

    pub fn comm_id(&self) -> &str {
        &self.comm_id
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Send `comm_open`. The returned future resolves once the kernel is
    /// idle again.
    pub fn open(&self, data: Map<String, Value>) -> Result<ShellFuture> {
        self.ensure_open()?;
        let open = CommOpen {
            comm_id: CommId(self.comm_id.clone()),
            target_name: self.target_name.clone(),
            data,
            target_module: None,
        };
        Ok(self.connection.send_shell_request(open, None))
    }

    pub fn send(&self, data: Map<String, Value>) -> Result<ShellFuture> {
        self.ensure_open()?;
        let msg = CommMsg {
            comm_id: CommId(self.comm_id.clone()),
            data,
        };
        Ok(self.connection.send_shell_request(msg, None))
    }

    /// Send `comm_close` and stop routing messages to this comm.
    pub fn close(&mut self, data: Map<String, Value>) -> Result<ShellFuture> {
        self.ensure_open()?;
        self.connection.comms().remove(&self.comm_id);
        let close = CommClose {
            comm_id: CommId(self.comm_id.clone()),
            data,
        };
        Ok(self.connection.send_shell_request(close, None))
    }

    /// Next `comm_msg` or `comm_close` from the kernel. `None` once the comm
    /// was closed by either side or the connection is gone.
    pub async fn next_message(&mut self) -> Option<WireMessage> {
        self.messages.recv().await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.connection.state().is_closed() {
            return Err(self.connection.dead());
        }
        if !self.connection.has_comm(&self.comm_id) {
            return Err(Error::NotFound(format!("comm {}", self.comm_id)));
        }
        Ok(())
    }
}

impl Drop for Comm {
    fn drop(&mut self) {
        self.connection.comms().remove(&self.comm_id);
    }
}

impl std::fmt::Debug for Comm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Comm")
            .field("comm_id", &self.comm_id)
            .field("target_name", &self.target_name)
            .finish()
    }
}

/// Comms the kernel opens towards one target name.
pub struct CommTarget {
    target_name: String,
    connection: KernelConnection,
    opened: mpsc::UnboundedReceiver<Opened>,
}

impl CommTarget {
    pub(crate) fn new(
        connection: KernelConnection,
        target_name: String,
        opened: mpsc::UnboundedReceiver<Opened>,
    ) -> Self {
        Self {
            target_name,
            connection,
            opened,
        }
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// The next comm the kernel opened, with its `comm_open` message.
    /// `None` once the target was registered again or the connection closed.
    pub async fn next_comm(&mut self) -> Option<(Comm, WireMessage)> {
        let Opened {
            comm_id,
            open,
            messages,
        } = self.opened.recv().await?;
        let comm = Comm::new(
            self.connection.clone(),
            comm_id,
            self.target_name.clone(),
            messages,
        );
        Some((comm, open))
    }
}
