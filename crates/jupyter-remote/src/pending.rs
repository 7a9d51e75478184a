//! Requests that are on the wire and waiting for their outcome.
//!
//! Owned by the connection actor; nothing else touches it. Every entry is
//! resolved exactly once: the reply sender is taken out of the entry the
//! first time a reply or a failure is delivered.

use std::collections::HashMap;
use std::time::Duration;

use jupyter_protocol::ExecutionState;
use jupyter_wire::{Channel, WireMessage};
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::kernel_connection::ConnectionState;

pub(crate) type ReplySender = oneshot::Sender<Result<WireMessage>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    /// Sent on shell through the execution queue; holds the queue gate
    /// until the kernel reports idle for it.
    Shell,
    /// Sent on control, outside the queue.
    Control,
}

pub(crate) struct PendingRequest {
    kind: RequestKind,
    /// `None` for messages the kernel never replies to.
    reply_type: Option<String>,
    reply: Option<ReplySender>,
    events: Option<mpsc::UnboundedSender<WireMessage>>,
    gate: Option<oneshot::Sender<()>>,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    /// Dispatched before the socket went away.
    lost: bool,
}

impl PendingRequest {
    pub(crate) fn shell(
        msg_type: &str,
        reply: ReplySender,
        events: mpsc::UnboundedSender<WireMessage>,
        gate: oneshot::Sender<()>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            kind: RequestKind::Shell,
            reply_type: reply_type(msg_type),
            reply: Some(reply),
            events: Some(events),
            gate: Some(gate),
            deadline: timeout.map(|timeout| Instant::now() + timeout),
            timeout,
            lost: false,
        }
    }

    pub(crate) fn control(msg_type: &str, reply: ReplySender, timeout: Duration) -> Self {
        Self {
            kind: RequestKind::Control,
            reply_type: reply_type(msg_type),
            reply: Some(reply),
            events: None,
            gate: None,
            deadline: Some(Instant::now() + timeout),
            timeout: Some(timeout),
            lost: false,
        }
    }

    fn resolve(&mut self, outcome: Result<WireMessage>) -> bool {
        match self.reply.take() {
            Some(reply) => {
                // The caller may have stopped waiting; the entry is still done.
                let _ = reply.send(outcome);
                true
            }
            None => false,
        }
    }

    fn release_gate(&mut self) {
        if let Some(gate) = self.gate.take() {
            let _ = gate.send(());
        }
    }

    fn fail(mut self, error: Error) {
        self.resolve(Err(error));
        self.release_gate();
    }

    fn is_finished(&self) -> bool {
        self.reply.is_none() && self.gate.is_none()
    }
}

/// `execute_request` → `execute_reply`. Comm traffic has no reply; such a
/// request is done when the kernel goes idle for it.
fn reply_type(msg_type: &str) -> Option<String> {
    if matches!(msg_type, "comm_open" | "comm_msg" | "comm_close") {
        return None;
    }
    Some(match msg_type.strip_suffix("_request") {
        Some(stem) => format!("{}_reply", stem),
        None => format!("{}_reply", msg_type),
    })
}

pub(crate) struct PendingTable {
    kernel_id: String,
    entries: HashMap<String, PendingRequest>,
}

impl PendingTable {
    pub(crate) fn new(kernel_id: impl Into<String>) -> Self {
        Self {
            kernel_id: kernel_id.into(),
            entries: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, msg_id: String, request: PendingRequest) {
        if self.entries.insert(msg_id.clone(), request).is_some() {
            // Ids are fresh uuids, so this is a bug upstream.
            warn!("[kernel-connection] Replaced pending request {}", msg_id);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn contains(&self, msg_id: &str) -> bool {
        self.entries.contains_key(msg_id)
    }

    /// Deliver an inbound message to the request it belongs to.
    pub(crate) fn route(&mut self, message: &WireMessage) {
        let Some(parent) = message.parent_msg_id() else {
            return;
        };
        let Some(entry) = self.entries.get_mut(parent) else {
            debug!(
                "[kernel-connection] No pending request for {} (parent {})",
                message.msg_type(),
                parent
            );
            return;
        };

        match message.channel {
            Channel::Shell | Channel::Control
                if entry.reply_type.as_deref() == Some(message.msg_type()) =>
            {
                if !entry.resolve(Ok(message.clone())) {
                    warn!(
                        "[kernel-connection] Dropping duplicate {} for {}",
                        message.msg_type(),
                        parent
                    );
                }
            }
            Channel::IoPub => {
                if let Some(events) = &entry.events {
                    let _ = events.send(message.clone());
                }
                if matches!(message.execution_state(), Some(ExecutionState::Idle)) {
                    if entry.reply_type.is_none() {
                        entry.resolve(Ok(message.clone()));
                    }
                    entry.release_gate();
                }
            }
            _ => {
                if let Some(events) = &entry.events {
                    let _ = events.send(message.clone());
                }
            }
        }

        if entry.is_finished() {
            self.entries.remove(parent);
        }
    }

    /// Earliest deadline among pending requests.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().filter_map(|entry| entry.deadline).min()
    }

    /// Fail every request whose deadline has passed.
    pub(crate) fn expire(&mut self, now: Instant, state: ConnectionState) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline.is_some_and(|deadline| deadline <= now))
            .map(|(msg_id, _)| msg_id.clone())
            .collect();

        for msg_id in expired {
            let Some(entry) = self.entries.remove(&msg_id) else {
                continue;
            };
            let error = if entry.lost {
                Error::ConnectionLost {
                    kernel_id: self.kernel_id.clone(),
                    state,
                }
            } else {
                Error::Timeout {
                    kernel_id: self.kernel_id.clone(),
                    msg_id: msg_id.clone(),
                    after: entry.timeout.unwrap_or_default(),
                }
            };
            warn!("[kernel-connection] {}", error);
            entry.fail(error);
        }
    }

    /// The socket went away. Shell requests stay pending with a bounded
    /// deadline; control requests fail now.
    pub(crate) fn connection_lost(&mut self, grace: Duration, state: ConnectionState) {
        let grace_deadline = Instant::now() + grace;
        let control: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.kind == RequestKind::Control)
            .map(|(msg_id, _)| msg_id.clone())
            .collect();
        for msg_id in control {
            if let Some(entry) = self.entries.remove(&msg_id) {
                entry.fail(Error::ConnectionLost {
                    kernel_id: self.kernel_id.clone(),
                    state,
                });
            }
        }

        for entry in self.entries.values_mut() {
            entry.lost = true;
            entry.deadline = Some(match entry.deadline {
                Some(deadline) => deadline.min(grace_deadline),
                None => grace_deadline,
            });
        }
    }

    /// Settle requests dispatched before a disconnect, once a fresh
    /// kernel_info_reply has arrived. The kernel handles shell messages in
    /// order, so anything sent before that handshake has finished: requests
    /// without a reply by now will never get one.
    pub(crate) fn reconcile(&mut self, state: ConnectionState) {
        let lost: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.lost)
            .map(|(msg_id, _)| msg_id.clone())
            .collect();
        for msg_id in lost {
            let Some(mut entry) = self.entries.remove(&msg_id) else {
                continue;
            };
            if entry.reply.is_some() {
                info!(
                    "[kernel-connection] Outcome of {} was lost with the connection",
                    msg_id
                );
                entry.fail(Error::ConnectionLost {
                    kernel_id: self.kernel_id.clone(),
                    state,
                });
            } else {
                entry.release_gate();
            }
        }
    }

    /// Fail every shell request, e.g. because the kernel restarted under it.
    pub(crate) fn fail_shell(&mut self, error: &Error) {
        let shell: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.kind == RequestKind::Shell)
            .map(|(msg_id, _)| msg_id.clone())
            .collect();
        for msg_id in shell {
            if let Some(entry) = self.entries.remove(&msg_id) {
                entry.fail(error.clone());
            }
        }
    }

    pub(crate) fn fail_all(&mut self, error: &Error) {
        for (_, entry) in self.entries.drain() {
            entry.fail(error.clone());
        }
    }
}
