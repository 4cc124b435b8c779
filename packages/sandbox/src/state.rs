// ABOUTME: Per-user sandbox lifecycle state machine and the persisted record
// ABOUTME: Transitions are validated here; persistence and locking live in the store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum StateError {
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: SandboxState,
        to: SandboxState,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    /// An operation holds the sandbox; everyone else gets a conflict
    InProgress,
    Ready,
    Disabled,
}

impl SandboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Ready => "ready",
            Self::Disabled => "disabled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, StateError> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "ready" => Ok(Self::Ready),
            "disabled" => Ok(Self::Disabled),
            _ => Err(StateError::InvalidState(s.to_string())),
        }
    }

    /// Only an in-flight operation may finish, and only an idle sandbox may be taken.
    pub fn can_transition_to(&self, next: SandboxState) -> bool {
        matches!(
            (self, next),
            (Self::InProgress, Self::Ready)
                | (Self::InProgress, Self::Disabled)
                | (Self::Ready, Self::InProgress)
                | (Self::Disabled, Self::InProgress)
        )
    }

    pub fn transition(self, next: SandboxState) -> Result<SandboxState, StateError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(StateError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CA certificate and key handed to the VPN gateway.
///
/// Both are PEM bodies without the armour lines, joined into one line so they
/// fit into a container environment variable. The serialized field names are
/// the variable names.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnMaterial {
    #[serde(rename = "CERT")]
    pub certificate: String,
    #[serde(rename = "KEY")]
    pub private_key: String,
}

impl VpnMaterial {
    pub fn env_vars(&self) -> [(&'static str, &str); 2] {
        [("CERT", &self.certificate), ("KEY", &self.private_key)]
    }
}

impl std::fmt::Debug for VpnMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VpnMaterial")
            .field("certificate", &self.certificate)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRecord {
    pub user_id: i64,
    /// Published VPN port, allocated once from the table sequence
    pub port: i64,
    pub chapter: Option<String>,
    pub state: SandboxState,
    #[serde(skip_serializing)]
    pub vpn: Option<VpnMaterial>,
    pub updated_at: DateTime<Utc>,
}

impl SandboxRecord {
    pub fn is_locked(&self) -> bool {
        self.state == SandboxState::InProgress
    }

    /// Apply a transition in memory; the store persists it.
    pub fn transition(&mut self, next: SandboxState) -> Result<(), StateError> {
        self.state = self.state.transition(next)?;
        Ok(())
    }
}
