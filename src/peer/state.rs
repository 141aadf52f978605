//! Connection lifecycle state machine.
//!
//! Transport callbacks never mutate lifecycle state directly; they
//! enqueue [`ConnectionEvent`]s and the manager's dispatch loop applies
//! them here, one at a time. That keeps every transition decision in a
//! single place no matter how many transport threads report at once.

use std::fmt;

use crate::error::{Error, Result};

/// Lifecycle of one peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, no negotiation started
    New,
    /// Offer received, answer in progress or ICE still settling
    Negotiating,
    /// Media is flowing
    Connected,
    /// Transport reported the connection unusable
    Failed,
    /// Torn down; final
    Closed,
}

impl ConnectionState {
    /// Whether this state has no outgoing transitions except cleanup
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }

    /// Whether the machine may move from `self` to `next`
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (New, Negotiating)
                | (New, Closed)
                | (Negotiating, Connected)
                | (Negotiating, Failed)
                | (Negotiating, Closed)
                | (Connected, Failed)
                | (Connected, Closed)
                | (Failed, Closed)
        )
    }

    /// Validated transition; illegal moves are an error, not a panic
    pub fn transition_to(self, next: ConnectionState) -> Result<ConnectionState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::TransportState(format!(
                "Illegal state transition {} -> {}",
                self, next
            )))
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::New => "new",
            ConnectionState::Negotiating => "negotiating",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// Event enqueued by transport callbacks for the manager dispatch loop
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Transport-layer state report for one connection
    StateChanged {
        connection_id: String,
        state: ConnectionState,
    },
    /// Remote peer announced an inbound media track
    TrackAnnounced {
        connection_id: String,
        track_id: String,
        kind: String,
    },
    /// The outbound writer for a connection stopped
    TrackEnded {
        connection_id: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let state = ConnectionState::New;
        let state = state.transition_to(ConnectionState::Negotiating).unwrap();
        let state = state.transition_to(ConnectionState::Connected).unwrap();
        let state = state.transition_to(ConnectionState::Closed).unwrap();
        assert_eq!(state, ConnectionState::Closed);
    }

    #[test]
    fn test_failure_then_cleanup() {
        let state = ConnectionState::Connected
            .transition_to(ConnectionState::Failed)
            .unwrap();
        assert!(state.is_terminal());
        assert_eq!(
            state.transition_to(ConnectionState::Closed).unwrap(),
            ConnectionState::Closed
        );
    }

    #[test]
    fn test_closed_is_final() {
        for next in [
            ConnectionState::New,
            ConnectionState::Negotiating,
            ConnectionState::Connected,
            ConnectionState::Failed,
            ConnectionState::Closed,
        ] {
            assert!(!ConnectionState::Closed.can_transition_to(next));
        }
    }

    #[test]
    fn test_illegal_transitions_are_errors() {
        let err = ConnectionState::New
            .transition_to(ConnectionState::Connected)
            .unwrap_err();
        assert!(matches!(err, Error::TransportState(_)));
        assert!(err
            .to_string()
            .contains("Illegal state transition new -> connected"));

        assert!(ConnectionState::Connected
            .transition_to(ConnectionState::Negotiating)
            .is_err());
        assert!(ConnectionState::Failed
            .transition_to(ConnectionState::Connected)
            .is_err());
    }

    #[test]
    fn test_same_state_is_not_a_transition() {
        assert!(!ConnectionState::Connected.can_transition_to(ConnectionState::Connected));
    }

    #[test]
    fn test_display_names() {
        assert_eq!(ConnectionState::Negotiating.to_string(), "negotiating");
        assert_eq!(ConnectionState::Closed.to_string(), "closed");
    }
}
