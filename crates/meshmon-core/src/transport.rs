//! Connection State Machine
//!
//! Lifecycle of the single link to the radio. States are consumed by
//! `transition`, so a caller can never act on a stale state after an event
//! has been applied. The async connector in the runtime crate drives this
//! machine and performs the I/O; everything here is synchronous and
//! deterministic given the timestamps passed in.

use core::fmt;
use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::TransportConfig;
use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// Connection State Types
// ----------------------------------------------------------------------------

/// Why the connector is not connected and not trying to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    NotStarted,
    Shutdown,
    /// Reconnect attempts exhausted
    GaveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected { reason: DisconnectReason },
    /// Attempting to open the link; `attempt` counts from 1 since the last
    /// established connection
    Connecting { attempt: u32 },
    Connected { since: Timestamp },
    /// Waiting to retry after `failures` consecutive failed attempts
    Reconnecting { failures: u32, retry_at: Timestamp },
}

/// Events that trigger state transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// Operator or service start requested a connection
    Connect,
    /// Link opened successfully
    Established,
    ConnectFailed { reason: String },
    /// Established link dropped
    ConnectionLost { reason: String },
    /// Backoff delay elapsed
    RetryDue,
    Shutdown,
}

impl ConnectionEvent {
    fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::Connect => "Connect",
            ConnectionEvent::Established => "Established",
            ConnectionEvent::ConnectFailed { .. } => "ConnectFailed",
            ConnectionEvent::ConnectionLost { .. } => "ConnectionLost",
            ConnectionEvent::RetryDue => "RetryDue",
            ConnectionEvent::Shutdown => "Shutdown",
        }
    }
}

// ----------------------------------------------------------------------------
// Backoff Policy
// ----------------------------------------------------------------------------

/// Exponential reconnect backoff
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl BackoffPolicy {
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_backoff_ms),
            max: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.backoff_multiplier,
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// Delay before the retry that follows `failures` consecutive failures
    ///
    /// Zero failures (a dropped, previously healthy link) retries after the
    /// initial delay. Never exceeds `max`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(64) as i32;
        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&TransportConfig::default())
    }
}

// ----------------------------------------------------------------------------
// State Transition Results
// ----------------------------------------------------------------------------

/// Result of a state transition
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub new_state: ConnectionState,
    pub audit_entry: AuditEntry,
    /// Set when the new state is `Reconnecting`
    pub retry_delay: Option<Duration>,
}

/// Audit trail entry for state transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: Timestamp,
    pub from_state: String,
    pub to_state: String,
    pub event: String,
}

/// Errors for invalid state transitions
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateTransitionError {
    #[error("Invalid transition from {from_state} on event {event}")]
    InvalidTransition { from_state: String, event: String },
}

// ----------------------------------------------------------------------------
// State Machine Implementation
// ----------------------------------------------------------------------------

impl ConnectionState {
    pub fn initial() -> Self {
        ConnectionState::Disconnected {
            reason: DisconnectReason::NotStarted,
        }
    }

    pub fn state_name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected { .. } => "Disconnected",
            ConnectionState::Connecting { .. } => "Connecting",
            ConnectionState::Connected { .. } => "Connected",
            ConnectionState::Reconnecting { .. } => "Reconnecting",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }

    /// Terminal states from which only an explicit `Connect` resumes
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected {
                reason: DisconnectReason::Shutdown | DisconnectReason::GaveUp
            }
        )
    }

    /// Process an event and transition to a new state (consumes self)
    pub fn transition(
        self,
        event: ConnectionEvent,
        policy: &BackoffPolicy,
        now: Timestamp,
    ) -> Result<StateTransition, StateTransitionError> {
        let from_state = self.state_name().to_string();
        let mut retry_delay = None;

        let new_state = match (self, &event) {
            (ConnectionState::Disconnected { .. }, ConnectionEvent::Connect) => {
                ConnectionState::Connecting { attempt: 1 }
            }

            (ConnectionState::Connecting { .. }, ConnectionEvent::Established) => {
                ConnectionState::Connected { since: now }
            }

            (ConnectionState::Connecting { attempt }, ConnectionEvent::ConnectFailed { .. }) => {
                if policy.exhausted(attempt) {
                    ConnectionState::Disconnected {
                        reason: DisconnectReason::GaveUp,
                    }
                } else {
                    let delay = policy.delay_for(attempt);
                    retry_delay = Some(delay);
                    ConnectionState::Reconnecting {
                        failures: attempt,
                        retry_at: now + delay.as_millis() as u64,
                    }
                }
            }

            (ConnectionState::Connected { .. }, ConnectionEvent::ConnectionLost { .. }) => {
                let delay = policy.delay_for(0);
                retry_delay = Some(delay);
                ConnectionState::Reconnecting {
                    failures: 0,
                    retry_at: now + delay.as_millis() as u64,
                }
            }

            (ConnectionState::Reconnecting { failures, .. }, ConnectionEvent::RetryDue) => {
                ConnectionState::Connecting {
                    attempt: failures + 1,
                }
            }

            (_, ConnectionEvent::Shutdown) => ConnectionState::Disconnected {
                reason: DisconnectReason::Shutdown,
            },

            (state, event) => {
                return Err(StateTransitionError::InvalidTransition {
                    from_state: state.state_name().to_string(),
                    event: event.name().to_string(),
                });
            }
        };

        let audit_entry = AuditEntry {
            timestamp: now,
            from_state,
            to_state: new_state.state_name().to_string(),
            event: event.name().to_string(),
        };

        Ok(StateTransition {
            new_state,
            audit_entry,
            retry_delay,
        })
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::initial()
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected { reason } => write!(f, "Disconnected ({:?})", reason),
            ConnectionState::Connecting { attempt } => write!(f, "Connecting (attempt {})", attempt),
            ConnectionState::Connected { since } => write!(f, "Connected since {}", since.as_millis()),
            ConnectionState::Reconnecting { failures, .. } => {
                write!(f, "Reconnecting after {} failures", failures)
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Status snapshot
// ----------------------------------------------------------------------------

/// Observable connector status, published to subscribers on every change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub endpoint: String,
    pub last_error: Option<String>,
    pub frames_received: u64,
    pub frames_sent: u64,
}

impl ConnectionStatus {
    pub fn new<E: Into<String>>(endpoint: E) -> Self {
        Self {
            state: ConnectionState::initial(),
            endpoint: endpoint.into(),
            last_error: None,
            frames_received: 0,
            frames_sent: 0,
        }
    }

    /// Outbound sends are accepted only while connected
    pub fn can_send(&self) -> bool {
        self.state.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: Option<u32>) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(1_000),
            multiplier: 2.0,
            max_attempts,
        }
    }

    fn failed() -> ConnectionEvent {
        ConnectionEvent::ConnectFailed {
            reason: "refused".into(),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = policy(None);
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(1_000));
    }

    #[test]
    fn test_connect_establish_lose_cycle() {
        let policy = policy(Some(3));
        let now = Timestamp::new(1_000);

        let t = ConnectionState::initial()
            .transition(ConnectionEvent::Connect, &policy, now)
            .unwrap();
        assert_eq!(t.new_state, ConnectionState::Connecting { attempt: 1 });

        let t = t.new_state.transition(ConnectionEvent::Established, &policy, now).unwrap();
        assert!(t.new_state.is_connected());
        assert_eq!(t.audit_entry.from_state, "Connecting");

        let t = t
            .new_state
            .transition(
                ConnectionEvent::ConnectionLost {
                    reason: "eof".into(),
                },
                &policy,
                now,
            )
            .unwrap();
        assert_eq!(
            t.new_state,
            ConnectionState::Reconnecting {
                failures: 0,
                retry_at: Timestamp::new(1_100)
            }
        );
        assert_eq!(t.retry_delay, Some(Duration::from_millis(100)));

        let t = t.new_state.transition(ConnectionEvent::RetryDue, &policy, now).unwrap();
        assert_eq!(t.new_state, ConnectionState::Connecting { attempt: 1 });
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let policy = policy(Some(2));
        let now = Timestamp::new(0);

        let mut state = ConnectionState::initial()
            .transition(ConnectionEvent::Connect, &policy, now)
            .unwrap()
            .new_state;

        state = state.transition(failed(), &policy, now).unwrap().new_state;
        assert!(matches!(state, ConnectionState::Reconnecting { failures: 1, .. }));

        state = state.transition(ConnectionEvent::RetryDue, &policy, now).unwrap().new_state;
        assert_eq!(state, ConnectionState::Connecting { attempt: 2 });

        state = state.transition(failed(), &policy, now).unwrap().new_state;
        assert_eq!(
            state,
            ConnectionState::Disconnected {
                reason: DisconnectReason::GaveUp
            }
        );
        assert!(state.is_terminal());

        // An explicit connect resumes from the first attempt
        let resumed = state.transition(ConnectionEvent::Connect, &policy, now).unwrap();
        assert_eq!(resumed.new_state, ConnectionState::Connecting { attempt: 1 });
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let policy = policy(None);
        let now = Timestamp::new(0);
        let err = ConnectionState::initial()
            .transition(ConnectionEvent::Established, &policy, now)
            .unwrap_err();
        assert_eq!(
            err,
            StateTransitionError::InvalidTransition {
                from_state: "Disconnected".into(),
                event: "Established".into(),
            }
        );

        let connected = ConnectionState::Connected { since: now };
        assert!(connected.transition(ConnectionEvent::RetryDue, &policy, now).is_err());
    }

    #[test]
    fn test_shutdown_from_any_state() {
        let policy = policy(None);
        let now = Timestamp::new(0);
        for state in [
            ConnectionState::Connecting { attempt: 2 },
            ConnectionState::Connected { since: now },
            ConnectionState::Reconnecting {
                failures: 1,
                retry_at: now,
            },
        ] {
            let t = state.transition(ConnectionEvent::Shutdown, &policy, now).unwrap();
            assert_eq!(
                t.new_state,
                ConnectionState::Disconnected {
                    reason: DisconnectReason::Shutdown
                }
            );
        }
    }

    #[test]
    fn test_status_can_send_only_when_connected() {
        let mut status = ConnectionStatus::new("127.0.0.1:4403");
        assert!(!status.can_send());
        status.state = ConnectionState::Connected {
            since: Timestamp::new(0),
        };
        assert!(status.can_send());
    }
}
