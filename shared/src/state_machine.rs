//! Command State Machine
//!
//! Defines the phases of a single vehicle command attempt and the valid
//! transitions between them.

use std::fmt;

/// Phase of a command attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Idle,
    Initializing,
    Resolving,
    Connecting,
    DiscoveringServices,
    DiscoveringCharacteristics,
    Writing,
    AwaitingAck,
    Completed,
    Failed,
}

impl CommandState {
    /// Completed and Failed have no outgoing transitions
    pub fn is_terminal(self) -> bool {
        matches!(self, CommandState::Completed | CommandState::Failed)
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Events that drive the command state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandEvent {
    /// Command accepted, radio state being checked
    Started,
    /// Radio is powered on and authorized
    RadioReady,
    /// Target peripheral resolved and a connection requested
    PeripheralResolved,
    /// Link established
    Connected,
    /// Command service found, characteristic discovery requested
    ServicesDiscovered,
    /// Command characteristic found and a write is about to be issued
    CommandCharacteristicReady,
    /// Write submitted with response requested
    WriteSubmitted,
    /// Peripheral acknowledged the write
    AckReceived,
    /// Non-writing command reached the command characteristic
    PingSucceeded,
    /// Any failure, including timeouts
    Failed,
}

/// Outcome of feeding one event to the machine
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionResult {
    /// Moved to the contained state
    Success(CommandState),
    /// Event not allowed in `from`; state unchanged
    Invalid { from: CommandState, event: CommandEvent },
}

/// The state machine for one command attempt
#[derive(Debug)]
pub struct CommandStateMachine {
    current_state: CommandState,
}

impl Default for CommandStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandStateMachine {
    /// Machine for a fresh attempt, in `Idle`
    pub fn new() -> Self {
        Self {
            current_state: CommandState::Idle,
        }
    }

    /// Current phase
    pub fn state(&self) -> CommandState {
        self.current_state
    }

    /// Apply `event`, leaving the state alone if the table rejects it
    pub fn process_event(&mut self, event: CommandEvent) -> TransitionResult {
        match self.next_state(event) {
            Some(state) => {
                self.current_state = state;
                TransitionResult::Success(state)
            }
            None => TransitionResult::Invalid {
                from: self.current_state,
                event,
            },
        }
    }

    /// Transition table
    fn next_state(&self, event: CommandEvent) -> Option<CommandState> {
        use CommandEvent::*;
        use CommandState::*;

        match (self.current_state, event) {
            (Idle, Started) => Some(Initializing),
            (Initializing, RadioReady) => Some(Resolving),
            (Resolving, PeripheralResolved) => Some(Connecting),
            (Connecting, CommandEvent::Connected) => Some(DiscoveringServices),
            (DiscoveringServices, CommandEvent::ServicesDiscovered) => {
                Some(DiscoveringCharacteristics)
            }
            (DiscoveringCharacteristics, CommandCharacteristicReady) => Some(Writing),
            (DiscoveringCharacteristics, PingSucceeded) => Some(Completed),
            (Writing, WriteSubmitted) => Some(AwaitingAck),
            (AwaitingAck, AckReceived) => Some(Completed),

            // Any live phase can fail
            (state, CommandEvent::Failed) if !state.is_terminal() => Some(CommandState::Failed),

            _ => None,
        }
    }
}

/// Whether `to` can directly follow `from` for some event
pub fn is_valid_transition(from: CommandState, to: CommandState) -> bool {
    use CommandState::*;

    match (from, to) {
        (Idle, Initializing) => true,
        (Initializing, Resolving) => true,
        (Resolving, Connecting) => true,
        (Connecting, DiscoveringServices) => true,
        (DiscoveringServices, DiscoveringCharacteristics) => true,
        (DiscoveringCharacteristics, Writing) => true,
        (DiscoveringCharacteristics, Completed) => true, // Ping
        (Writing, AwaitingAck) => true,
        (AwaitingAck, Completed) => true,
        (a, Failed) => !a.is_terminal(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_machine_is_idle() {
        let fsm = CommandStateMachine::new();
        assert_eq!(fsm.state(), CommandState::Idle);
    }

    #[test]
    fn test_write_command_flow() {
        let mut fsm = CommandStateMachine::new();

        for (event, expected) in [
            (CommandEvent::Started, CommandState::Initializing),
            (CommandEvent::RadioReady, CommandState::Resolving),
            (CommandEvent::PeripheralResolved, CommandState::Connecting),
            (CommandEvent::Connected, CommandState::DiscoveringServices),
            (CommandEvent::ServicesDiscovered, CommandState::DiscoveringCharacteristics),
            (CommandEvent::CommandCharacteristicReady, CommandState::Writing),
            (CommandEvent::WriteSubmitted, CommandState::AwaitingAck),
            (CommandEvent::AckReceived, CommandState::Completed),
        ] {
            assert_eq!(fsm.process_event(event), TransitionResult::Success(expected));
        }
        assert!(fsm.state().is_terminal());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut fsm = CommandStateMachine::new();
        fsm.process_event(CommandEvent::Started);
        fsm.process_event(CommandEvent::Failed);
        assert_eq!(fsm.state(), CommandState::Failed);

        // A late ack or a second failure changes nothing
        let result = fsm.process_event(CommandEvent::AckReceived);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        let result = fsm.process_event(CommandEvent::Failed);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(fsm.state(), CommandState::Failed);
    }

    #[test]
    fn test_out_of_order_event_is_rejected() {
        let mut fsm = CommandStateMachine::new();

        // Can't connect before the radio is known to be ready
        let result = fsm.process_event(CommandEvent::Connected);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(fsm.state(), CommandState::Idle);
    }

    #[test]
    fn test_transition_table_agrees_with_machine() {
        assert!(is_valid_transition(CommandState::AwaitingAck, CommandState::Completed));
        assert!(is_valid_transition(CommandState::Connecting, CommandState::Failed));
        assert!(!is_valid_transition(CommandState::Completed, CommandState::Failed));
        assert!(!is_valid_transition(CommandState::Resolving, CommandState::Writing));
    }
}
