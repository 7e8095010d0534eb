//! Lifecycle status of a server instance.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// The status of the server.
///
/// There is exactly one status per server instance and it only moves
/// through the start/stop sequence. A server that fails part-way through
/// starting settles back to [`ServerStatus::Stopped`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum ServerStatus {
    /// The server is stopped.
    #[default]
    Stopped,
    /// The server is running.
    Running,
}

impl ServerStatus {
    /// Whether the server is accepting connections.
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }
}

impl core::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Stopped => f.write_str("stopped"),
            Self::Running => f.write_str("running"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_stopped() {
        assert_eq!(ServerStatus::default(), ServerStatus::Stopped);
        assert!(!ServerStatus::default().is_running());
    }

    #[test]
    fn display_is_lowercase() {
        assert_eq!(ServerStatus::Running.to_string(), "running");
        assert_eq!(ServerStatus::Stopped.to_string(), "stopped");
    }

    #[test]
    fn typescript_binding_matches_wire_names() {
        assert_eq!(ServerStatus::name(), "ServerStatus");
        assert_eq!(ServerStatus::inline(), r#""Stopped" | "Running""#);
        assert_eq!(
            serde_json::to_string(&ServerStatus::Running).ok().as_deref(),
            Some(r#""Running""#)
        );
    }
}
