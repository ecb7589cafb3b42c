//! State machine for a voice session
//!
//! ```text
//!   Idle ──start──▶ Connecting ──ready──▶ Listening ◀──drained/interrupt── Speaking
//!                       │                     │ ──────segment──────────────▶ │
//!                       └──failed──▶ Error ◀──┴──────────failed──────────────┘
//!   stop / remote close ──▶ Ended ──▶ Idle          Error ──reset──▶ Idle
//! ```
//!
//! Transitions are a pure function of (state, event). Side effects live in
//! [`crate::session::SessionManager`].

use std::fmt;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No session; `start()` is accepted
    #[default]
    Idle,
    /// Acquiring devices and opening the transport
    Connecting,
    /// Capture running, nothing audible
    Listening,
    /// Synthesized speech is queued or playing
    Speaking,
    /// Failed; needs an explicit reset
    Error,
    /// Torn down, about to return to idle
    Ended,
}

/// Inputs to the transition function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Start,
    /// Devices acquired and the transport accepted the session
    Ready,
    /// A decoded segment was placed on the timeline
    SegmentScheduled,
    /// The active segment set became empty
    PlaybackDrained,
    /// The service signalled barge-in
    Interrupted,
    Stop,
    /// The remote side closed the channel
    Closed,
    /// Device, transport or codec failure
    Failed,
    /// Teardown after `Ended` finished
    TeardownComplete,
    Reset,
}

impl SessionState {
    /// Next state for `event`, or `None` if the event does not apply here
    pub fn next(self, event: SessionEvent) -> Option<SessionState> {
        use SessionEvent as E;
        use SessionState as S;

        match (self, event) {
            (S::Idle, E::Start) => Some(S::Connecting),

            (S::Connecting, E::Ready) => Some(S::Listening),
            // A close before the service accepted us is a failed connect
            (S::Connecting, E::Closed) => Some(S::Error),

            (S::Listening | S::Speaking, E::SegmentScheduled) => Some(S::Speaking),
            (S::Speaking, E::PlaybackDrained) => Some(S::Listening),
            (S::Listening | S::Speaking, E::Interrupted) => Some(S::Listening),
            (S::Listening | S::Speaking, E::Closed) => Some(S::Ended),

            (S::Connecting | S::Listening | S::Speaking, E::Stop) => Some(S::Ended),
            (S::Connecting | S::Listening | S::Speaking, E::Failed) => Some(S::Error),

            (S::Ended, E::TeardownComplete) => Some(S::Idle),
            (S::Error, E::Reset) => Some(S::Idle),

            _ => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, SessionState::Idle)
    }

    /// Connected and exchanging audio
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Listening | SessionState::Speaking)
    }

    /// A session currently holds devices or a transport
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Listening | SessionState::Speaking
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Listening => "listening",
            SessionState::Speaking => "speaking",
            SessionState::Error => "error",
            SessionState::Ended => "ended",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::SessionEvent as E;
    use super::SessionState as S;

    #[test]
    fn test_new_state_is_idle() {
        assert!(SessionState::default().is_idle());
    }

    #[test]
    fn test_happy_path() {
        let mut state = S::Idle;
        for (event, expected) in [
            (E::Start, S::Connecting),
            (E::Ready, S::Listening),
            (E::SegmentScheduled, S::Speaking),
            (E::SegmentScheduled, S::Speaking),
            (E::PlaybackDrained, S::Listening),
            (E::Stop, S::Ended),
            (E::TeardownComplete, S::Idle),
        ] {
            state = state.next(event).unwrap();
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn test_start_only_from_idle() {
        for state in [S::Connecting, S::Listening, S::Speaking, S::Error, S::Ended] {
            assert_eq!(state.next(E::Start), None, "start accepted in {}", state);
        }
    }

    #[test]
    fn test_interrupt_returns_to_listening() {
        assert_eq!(S::Speaking.next(E::Interrupted), Some(S::Listening));
        assert_eq!(S::Listening.next(E::Interrupted), Some(S::Listening));
        assert_eq!(S::Connecting.next(E::Interrupted), None);
    }

    #[test]
    fn test_failures_are_terminal_until_reset() {
        for state in [S::Connecting, S::Listening, S::Speaking] {
            assert_eq!(state.next(E::Failed), Some(S::Error));
        }
        assert_eq!(S::Error.next(E::Stop), None);
        assert_eq!(S::Error.next(E::Ready), None);
        assert_eq!(S::Error.next(E::Reset), Some(S::Idle));
    }

    #[test]
    fn test_remote_close_policy() {
        assert_eq!(S::Connecting.next(E::Closed), Some(S::Error));
        assert_eq!(S::Listening.next(E::Closed), Some(S::Ended));
        assert_eq!(S::Speaking.next(E::Closed), Some(S::Ended));
    }

    #[test]
    fn test_stop_when_idle_is_ignored() {
        assert_eq!(S::Idle.next(E::Stop), None);
        assert_eq!(S::Idle.next(E::Reset), None);
    }

    #[test]
    fn test_drained_only_while_speaking() {
        assert_eq!(S::Listening.next(E::PlaybackDrained), None);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(format!("{}", S::Listening), "listening");
        assert_eq!(S::Error.to_string(), "error");
    }
}
