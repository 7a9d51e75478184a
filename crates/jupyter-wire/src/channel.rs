use std::fmt;

use serde::{Deserialize, Serialize};

/// The kernel channels that are multiplexed over a kernel WebSocket.
///
/// Heartbeat is not listed: servers answer heartbeats themselves and
/// clients rely on WebSocket ping/pong instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Shell,
    Control,
    #[serde(rename = "iopub")]
    IoPub,
    Stdin,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Shell => "shell",
            Channel::Control => "control",
            Channel::IoPub => "iopub",
            Channel::Stdin => "stdin",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
