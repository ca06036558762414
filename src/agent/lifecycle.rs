//! Agent lifecycle state machine
//!
//! `Created → Initialized → Connected → Disconnected → Destroyed`. Every
//! caller-facing operation is checked against [`AgentState::permits`] before it
//! touches the transport, so an operation invoked out of order fails with
//! `InvalidState` and produces no I/O.

use crate::error::{AgentError, AgentResult};
use std::fmt;

/// Lifecycle state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentState {
    Created,
    Initialized,
    Connected,
    Disconnected,
    Destroyed,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Created => "created",
            AgentState::Initialized => "initialized",
            AgentState::Connected => "connected",
            AgentState::Disconnected => "disconnected",
            AgentState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Caller-facing operations gated by lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Init,
    Connect,
    Disconnect,
    Publish,
    Receive,
    RegisterEvent,
    /// Settings request over the broker connection
    FetchSettings,
    /// Re-read of a local settings file
    LoadSettings,
    ConfigureCrypto,
    SetId,
    SetPubTopic,
    SetTimeout,
    Subscribe,
    EnableRemoteControl,
    /// Timed main loop
    RunLoop,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Init => "init",
            Operation::Connect => "connect",
            Operation::Disconnect => "disconnect",
            Operation::Publish => "publish",
            Operation::Receive => "receive",
            Operation::RegisterEvent => "register event",
            Operation::FetchSettings => "fetch settings",
            Operation::LoadSettings => "load settings",
            Operation::ConfigureCrypto => "configure crypto",
            Operation::SetId => "set id",
            Operation::SetPubTopic => "set publish topic",
            Operation::SetTimeout => "set timeout",
            Operation::Subscribe => "subscribe",
            Operation::EnableRemoteControl => "enable remote control",
            Operation::RunLoop => "run loop",
        };
        f.write_str(name)
    }
}

impl AgentState {
    /// Transition table
    pub fn permits(self, operation: Operation) -> bool {
        use AgentState::*;

        match operation {
            Operation::Init => self == Created,
            Operation::Connect => self == Initialized,
            // No-op unless connected
            Operation::Disconnect => true,
            Operation::Publish
            | Operation::Receive
            | Operation::RegisterEvent
            | Operation::FetchSettings => self == Connected,
            Operation::LoadSettings => matches!(self, Initialized | Connected | Disconnected),
            Operation::ConfigureCrypto | Operation::EnableRemoteControl => {
                matches!(self, Created | Initialized)
            }
            Operation::Subscribe => matches!(self, Created | Initialized | Connected),
            Operation::RunLoop => matches!(self, Initialized | Connected),
            Operation::SetId | Operation::SetPubTopic | Operation::SetTimeout => self != Destroyed,
        }
    }

    /// Fail with `InvalidState` unless `operation` is allowed in this state
    pub fn require(self, operation: Operation) -> AgentResult<()> {
        if self.permits(operation) {
            Ok(())
        } else {
            Err(AgentError::invalid_state(operation, self))
        }
    }

    pub fn is_connected(self) -> bool {
        self == AgentState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const ALL_STATES: [AgentState; 5] = [
        AgentState::Created,
        AgentState::Initialized,
        AgentState::Connected,
        AgentState::Disconnected,
        AgentState::Destroyed,
    ];

    #[test]
    fn test_init_only_from_created() {
        for state in ALL_STATES {
            assert_eq!(
                state.permits(Operation::Init),
                state == AgentState::Created,
                "init from {state}"
            );
        }
    }

    #[test]
    fn test_connect_only_from_initialized() {
        for state in ALL_STATES {
            assert_eq!(
                state.permits(Operation::Connect),
                state == AgentState::Initialized,
                "connect from {state}"
            );
        }
    }

    #[test]
    fn test_messaging_requires_connection() {
        for operation in [
            Operation::Publish,
            Operation::Receive,
            Operation::RegisterEvent,
            Operation::FetchSettings,
        ] {
            for state in ALL_STATES {
                assert_eq!(
                    state.permits(operation),
                    state == AgentState::Connected,
                    "{operation} from {state}"
                );
            }
        }
    }

    #[test]
    fn test_disconnect_always_permitted() {
        assert!(ALL_STATES
            .iter()
            .all(|state| state.permits(Operation::Disconnect)));
    }

    #[test]
    fn test_crypto_setters_rejected_after_connect() {
        assert!(AgentState::Created.permits(Operation::ConfigureCrypto));
        assert!(AgentState::Initialized.permits(Operation::ConfigureCrypto));
        assert!(!AgentState::Connected.permits(Operation::ConfigureCrypto));
        assert!(!AgentState::Disconnected.permits(Operation::ConfigureCrypto));
    }

    #[test]
    fn test_identity_mutable_until_destroyed() {
        for state in ALL_STATES {
            assert_eq!(
                state.permits(Operation::SetId),
                state != AgentState::Destroyed
            );
        }
    }

    #[test]
    fn test_local_settings_need_init() {
        assert!(!AgentState::Created.permits(Operation::LoadSettings));
        assert!(AgentState::Initialized.permits(Operation::LoadSettings));
        assert!(AgentState::Disconnected.permits(Operation::LoadSettings));
        assert!(!AgentState::Destroyed.permits(Operation::LoadSettings));
    }

    #[test]
    fn test_main_loop_needs_init() {
        assert!(!AgentState::Created.permits(Operation::RunLoop));
        assert!(AgentState::Initialized.permits(Operation::RunLoop));
        assert!(AgentState::Connected.permits(Operation::RunLoop));
        assert!(!AgentState::Disconnected.permits(Operation::RunLoop));
        assert!(!AgentState::Destroyed.permits(Operation::RunLoop));
    }

    #[test]
    fn test_require_reports_operation_and_state() {
        let error = AgentState::Disconnected
            .require(Operation::Connect)
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidState);
        assert_eq!(
            error.to_string(),
            "Invalid state: cannot connect while agent is disconnected"
        );
        assert!(AgentState::Connected.require(Operation::Publish).is_ok());
    }
}
