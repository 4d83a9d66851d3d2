//! Connection state machine.
//!
//! Encoded as a sum type so illegal transitions are compile errors at the
//! call site that tries to construct them directly; [`State::advance`] is
//! the one place transitions are actually performed, and panics are never
//! used for illegal transitions — callers get `None` and are expected to
//! fail the connection with a protocol error instead.

use crate::wire::ClientMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initial,
    Running,
    Exited,
    Finished,
    Error,
    Shutdown,
}

/// The event that moves a connection between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Accept,
    Reject,
    Restart,
    /// `Exit` while I/O logging is active and no relay is attached: wait
    /// for the final commit point.
    ExitAwaitingCommit,
    /// `Exit` otherwise: go straight to `Finished`.
    ExitImmediate,
    /// The commit scheduler delivered the last commit point after `Exit`.
    FinalCommitDelivered,
    ProtocolError,
    Shutdown,
}

impl State {
    /// Whether `msg` is legal to receive while in this state, independent
    /// of field-level validity, which is checked by the dispatch table in
    /// `connection.rs`.
    pub fn accepts(&self, msg: &ClientMessage) -> bool {
        use ClientMessage::*;
        match self {
            State::Initial => matches!(msg, ClientHello { .. } | Accept { .. } | Reject { .. } | Restart { .. }),
            State::Running => matches!(
                msg,
                IoBuffer { .. } | ChangeWindowSize { .. } | CommandSuspend { .. } | Exit { .. } | Alert { .. }
            ),
            State::Exited | State::Finished | State::Error | State::Shutdown => false,
        }
    }

    pub fn advance(self, t: Transition) -> Option<State> {
        use State::*;
        use Transition::*;
        match (self, t) {
            (Initial, Accept) => Some(Running),
            (Initial, Reject) => Some(Finished),
            (Initial, Restart) => Some(Running),
            (Running, ExitAwaitingCommit) => Some(Exited),
            (Running, ExitImmediate) => Some(Finished),
            (Exited, FinalCommitDelivered) => Some(Finished),
            (_, ProtocolError) => Some(Error),
            (_, Transition::Shutdown) => Some(State::Shutdown),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Finished | State::Error | State::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_moves_initial_to_running() {
        assert_eq!(State::Initial.advance(Transition::Accept), Some(State::Running));
    }

    #[test]
    fn reject_moves_initial_to_finished() {
        assert_eq!(State::Initial.advance(Transition::Reject), Some(State::Finished));
    }

    #[test]
    fn exit_with_logging_goes_via_exited() {
        assert_eq!(State::Running.advance(Transition::ExitAwaitingCommit), Some(State::Exited));
        assert_eq!(State::Exited.advance(Transition::FinalCommitDelivered), Some(State::Finished));
    }

    #[test]
    fn exit_without_logging_goes_straight_to_finished() {
        assert_eq!(State::Running.advance(Transition::ExitImmediate), Some(State::Finished));
    }

    #[test]
    fn illegal_transition_is_rejected() {
        assert_eq!(State::Finished.advance(Transition::Accept), None);
        assert_eq!(State::Initial.advance(Transition::FinalCommitDelivered), None);
    }

    #[test]
    fn restart_then_accept_is_out_of_order() {
        // Accept then Restart from Running is illegal.
        assert!(!State::Running.accepts(&ClientMessage::Restart {
            log_id: "x".into(),
            restart_time: crate::wire::TimeSpec::ZERO,
        }));
    }
}
