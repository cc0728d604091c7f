//! Pure connection state management for the AMQP transport
//!
//! Decisions about channel roles, channel setup, and how link events are
//! handled live here as plain functions; the I/O side is in [`super::client`].

use super::broker::{BrokerSession, LinkEvent};
use super::options::ConnectionOptions;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Pipe whose traffic is isolated on the primary channel
pub const KEEPALIVE_PIPE: &str = "keepalives";

/// Which of the two physical connections a channel belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelRole {
    /// Reserved for liveness (keepalive) traffic
    Primary,
    /// Everything else
    Secondary,
}

impl ChannelRole {
    /// Channel used for publishing to or consuming from `pipe`
    pub fn for_pipe(pipe: &str) -> Self {
        if pipe == KEEPALIVE_PIPE {
            ChannelRole::Primary
        } else {
            ChannelRole::Secondary
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelRole::Primary => "primary",
            ChannelRole::Secondary => "secondary",
        }
    }
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of the connection pair
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// No connection attempt in progress
    Disconnected,
    /// Attempt in progress; one or neither connection open
    Connecting,
    /// Both connections and their channels are open
    Connected,
}

/// Flow-control settings applied to each channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSettings {
    pub prefetch: u16,
    pub auto_recovery: bool,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            prefetch: 1,
            auto_recovery: true,
        }
    }
}

impl ChannelSettings {
    /// Prefetch comes from `options.prefetch` when positive, else 1
    pub fn from_options(options: &ConnectionOptions) -> Self {
        let prefetch = match options.prefetch {
            Some(value) if value > 0 => u16::try_from(value).unwrap_or(u16::MAX),
            _ => 1,
        };

        Self {
            prefetch,
            auto_recovery: true,
        }
    }
}

/// What the transport does in response to a [`LinkEvent`]
#[derive(Debug, Clone, PartialEq)]
pub enum LinkAction {
    Reconnect,
    ForwardError(String),
    Ignore,
}

impl LinkEvent {
    /// Decide how to react to this event (pure function)
    pub fn action(&self) -> LinkAction {
        match self {
            LinkEvent::ConnectFailed(_)
            | LinkEvent::Lost(_)
            | LinkEvent::HeartbeatMissed
            | LinkEvent::PossibleAuthenticationFailure { .. } => LinkAction::Reconnect,
            LinkEvent::ChannelError(message) => LinkAction::ForwardError(message.clone()),
            LinkEvent::Closed => LinkAction::Ignore,
        }
    }

    /// Log the event; credentials never appear beyond the username
    pub fn log(&self, role: ChannelRole) {
        match self {
            LinkEvent::ConnectFailed(reason) => {
                warn!(channel = %role, reason = %reason, "TCP connection to broker failed");
            }
            LinkEvent::Lost(reason) => {
                warn!(channel = %role, reason = %reason, "TCP connection to broker lost");
            }
            LinkEvent::HeartbeatMissed => {
                warn!(channel = %role, "Broker heartbeats missed");
            }
            LinkEvent::PossibleAuthenticationFailure { user } => {
                warn!(
                    channel = %role,
                    user = %user,
                    "Possible authentication failure, check broker credentials"
                );
            }
            LinkEvent::ChannelError(message) => {
                warn!(channel = %role, error = %message, "Broker channel error");
            }
            LinkEvent::Closed => {
                debug!(channel = %role, "Broker connection closed");
            }
        }
    }
}

/// The primary and secondary sessions of one connect cycle
#[derive(Default, Clone)]
pub struct ConnectionPair {
    pub primary: Option<Arc<dyn BrokerSession>>,
    pub secondary: Option<Arc<dyn BrokerSession>>,
}

impl ConnectionPair {
    pub fn get(&self, role: ChannelRole) -> Option<&Arc<dyn BrokerSession>> {
        match role {
            ChannelRole::Primary => self.primary.as_ref(),
            ChannelRole::Secondary => self.secondary.as_ref(),
        }
    }

    pub fn set(&mut self, role: ChannelRole, session: Arc<dyn BrokerSession>) {
        match role {
            ChannelRole::Primary => self.primary = Some(session),
            ChannelRole::Secondary => self.secondary = Some(session),
        }
    }

    /// True iff both sessions exist and report open
    pub fn is_established(&self) -> bool {
        matches!(
            (&self.primary, &self.secondary),
            (Some(primary), Some(secondary)) if primary.is_open() && secondary.is_open()
        )
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_established() {
            ConnectionState::Connected
        } else if self.primary.is_some() || self.secondary.is_some() {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Remove both sessions, leaving the pair empty
    pub fn take(&mut self) -> Vec<Arc<dyn BrokerSession>> {
        self.primary
            .take()
            .into_iter()
            .chain(self.secondary.take())
            .collect()
    }
}

/// Log connection state transition
pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
    match (from, to) {
        (ConnectionState::Connecting, ConnectionState::Connected) => {
            info!("Broker connection pair established");
        }
        (ConnectionState::Connected, ConnectionState::Disconnected) => {
            warn!("Broker connection pair torn down");
        }
        _ => {
            debug!("Broker connection state: {:?} -> {:?}", from, to);
        }
    }
}
