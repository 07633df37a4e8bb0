//! Branches of the redundant relay topology.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::process::ProcessHandle;
use crate::Error;

/// Which of the two branches an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchSelector {
    Primary,
    Secondary,
}

impl BranchSelector {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

impl std::fmt::Display for BranchSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BranchSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "primary" => Ok(Self::Primary),
            "secondary" => Ok(Self::Secondary),
            other => Err(Error::validation(format!(
                "Invalid branch '{other}', expected 'primary' or 'secondary'"
            ))),
        }
    }
}

/// One leg of a redundant stream.
///
/// The local relay listens on `local_port` and forwards to the remote leg on
/// `remote_port`. Only the remote leg is ever stopped or respawned, and a
/// respawn binds the same `remote_port` so the local relay keeps forwarding.
#[derive(Debug)]
pub struct Branch {
    destination: String,
    remote_port: u16,
    local_port: u16,
    remote: Option<ProcessHandle>,
    relay: ProcessHandle,
}

impl Branch {
    pub fn new(
        destination: impl Into<String>,
        remote_port: u16,
        local_port: u16,
        remote: ProcessHandle,
        relay: ProcessHandle,
    ) -> Self {
        Self {
            destination: destination.into(),
            remote_port,
            local_port,
            remote: Some(remote),
            relay,
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// `false` while the branch is intentionally stopped.
    pub fn is_active(&self) -> bool {
        self.remote.is_some()
    }

    pub fn remote_pid(&self) -> Option<u32> {
        self.remote.as_ref().and_then(ProcessHandle::pid)
    }

    pub fn relay_pid(&self) -> Option<u32> {
        self.relay.pid()
    }

    /// Detach the remote leg, leaving the branch stopped.
    pub fn take_remote(&mut self) -> Option<ProcessHandle> {
        self.remote.take()
    }

    /// Install a freshly spawned remote leg, returning any displaced handle.
    pub fn install_remote(&mut self, handle: ProcessHandle) -> Option<ProcessHandle> {
        self.remote.replace(handle)
    }

    pub(crate) fn process_count(&self) -> usize {
        1 + usize::from(self.remote.is_some())
    }

    pub(crate) fn into_handles(self) -> Vec<ProcessHandle> {
        let mut handles: Vec<ProcessHandle> = self.remote.into_iter().collect();
        handles.push(self.relay);
        handles
    }
}
