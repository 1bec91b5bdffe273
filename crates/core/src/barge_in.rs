//! Barge-in detection.
//!
//! The detector is a small state machine over the control-event stream. It
//! tracks whether the agent is currently speaking and, when the caller starts
//! talking over it, emits a `BargeInCancel` immediately instead of waiting for
//! the agent service to confirm the interruption.

use crate::generic_types::ControlEvent;
use tracing::debug;

#[derive(Debug, Default, Clone)]
pub struct BargeInDetector {
    agent_speaking: bool,
}

impl BargeInDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the agent is speaking as far as this detector knows.
    pub fn agent_speaking(&self) -> bool {
        self.agent_speaking
    }

    /// Feeds one control event through the state machine.
    ///
    /// Returns `Some(ControlEvent::BargeInCancel)` exactly when the caller
    /// starts speaking while the agent is speaking. The agent is then treated
    /// as interrupted locally, so a second `CallerSpeechStarted` before the
    /// next `AgentSpeechStarted` is a no-op.
    pub fn observe(&mut self, event: &ControlEvent) -> Option<ControlEvent> {
        match event {
            ControlEvent::AgentSpeechStarted => {
                self.agent_speaking = true;
                None
            }
            ControlEvent::AgentSpeechStopped => {
                self.agent_speaking = false;
                None
            }
            ControlEvent::CallerSpeechStarted if self.agent_speaking => {
                self.agent_speaking = false;
                debug!("Caller spoke over the agent, cancelling agent playback");
                Some(ControlEvent::BargeInCancel)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_speech_during_agent_speech_cancels() {
        let mut detector = BargeInDetector::new();
        assert_eq!(detector.observe(&ControlEvent::AgentSpeechStarted), None);
        assert!(detector.agent_speaking());

        let out = detector.observe(&ControlEvent::CallerSpeechStarted);
        assert_eq!(out, Some(ControlEvent::BargeInCancel));
        assert!(!detector.agent_speaking());
    }

    #[test]
    fn test_caller_speech_while_agent_silent_is_noop() {
        let mut detector = BargeInDetector::new();
        assert_eq!(detector.observe(&ControlEvent::CallerSpeechStarted), None);

        detector.observe(&ControlEvent::AgentSpeechStarted);
        detector.observe(&ControlEvent::AgentSpeechStopped);
        assert_eq!(detector.observe(&ControlEvent::CallerSpeechStarted), None);
    }

    #[test]
    fn test_cancel_emitted_once_per_agent_turn() {
        let mut detector = BargeInDetector::new();
        detector.observe(&ControlEvent::AgentSpeechStarted);

        assert!(detector.observe(&ControlEvent::CallerSpeechStarted).is_some());
        assert!(detector.observe(&ControlEvent::CallerSpeechStarted).is_none());
        // The late confirmation from the agent service changes nothing.
        assert!(detector.observe(&ControlEvent::AgentSpeechStopped).is_none());
        assert!(!detector.agent_speaking());

        detector.observe(&ControlEvent::AgentSpeechStarted);
        assert!(detector.observe(&ControlEvent::CallerSpeechStarted).is_some());
    }

    #[test]
    fn test_unrelated_events_leave_state_alone() {
        let mut detector = BargeInDetector::new();
        detector.observe(&ControlEvent::AgentSpeechStarted);
        for event in [
            ControlEvent::SessionStarted,
            ControlEvent::CallerSpeechStopped,
            ControlEvent::BargeInCancel,
        ] {
            assert_eq!(detector.observe(&event), None);
        }
        assert!(detector.agent_speaking());
    }
}
