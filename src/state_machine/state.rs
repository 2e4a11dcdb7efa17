use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of one automation run.
///
/// A run flows through: IDLE → PREPARING → GENERATING → {DOWNLOADING →
/// UPLOADING} → COOLDOWN → PREPARING (next item) | COMPLETED, with ERROR and
/// PAUSED reachable from the active states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    #[default]
    Idle,
    Preparing,
    Generating,
    Downloading,
    Uploading,
    Cooldown,
    Completed,
    Error,
    Paused,
}

impl LifecycleState {
    /// States in which a run is doing work and may be paused.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Preparing
                | Self::Generating
                | Self::Downloading
                | Self::Uploading
                | Self::Cooldown
                | Self::Error
        )
    }

    /// States that block on an external collaborator and can hang.
    pub fn is_stuck_prone(&self) -> bool {
        matches!(self, Self::Generating | Self::Downloading | Self::Uploading)
    }

    /// Whether a scheduler may hand out new work in this state.
    pub fn accepts_submissions(&self) -> bool {
        !matches!(self, Self::Idle | Self::Completed | Self::Paused)
    }

    /// Completed and Idle only move again through a fresh `init()`.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Idle | Self::Completed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Idle => write!(f, "IDLE"),
            LifecycleState::Preparing => write!(f, "PREPARING"),
            LifecycleState::Generating => write!(f, "GENERATING"),
            LifecycleState::Downloading => write!(f, "DOWNLOADING"),
            LifecycleState::Uploading => write!(f, "UPLOADING"),
            LifecycleState::Cooldown => write!(f, "COOLDOWN"),
            LifecycleState::Completed => write!(f, "COMPLETED"),
            LifecycleState::Error => write!(f, "ERROR"),
            LifecycleState::Paused => write!(f, "PAUSED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stuck_prone_states() {
        assert!(LifecycleState::Generating.is_stuck_prone());
        assert!(LifecycleState::Downloading.is_stuck_prone());
        assert!(LifecycleState::Uploading.is_stuck_prone());
        assert!(!LifecycleState::Cooldown.is_stuck_prone());
        assert!(!LifecycleState::Paused.is_stuck_prone());
    }

    #[test]
    fn paused_and_finished_states_refuse_submissions() {
        assert!(!LifecycleState::Idle.accepts_submissions());
        assert!(!LifecycleState::Completed.accepts_submissions());
        assert!(!LifecycleState::Paused.accepts_submissions());
        assert!(LifecycleState::Generating.accepts_submissions());
        assert!(LifecycleState::Preparing.accepts_submissions());
    }

    #[test]
    fn only_active_states_are_pausable() {
        assert!(LifecycleState::Generating.is_active());
        assert!(LifecycleState::Error.is_active());
        assert!(!LifecycleState::Idle.is_active());
        assert!(!LifecycleState::Completed.is_active());
        assert!(!LifecycleState::Paused.is_active());
    }

    #[test]
    fn state_display() {
        assert_eq!(LifecycleState::Idle.to_string(), "IDLE");
        assert_eq!(LifecycleState::Generating.to_string(), "GENERATING");
        assert_eq!(LifecycleState::Cooldown.to_string(), "COOLDOWN");
        assert_eq!(LifecycleState::Paused.to_string(), "PAUSED");
    }

    #[test]
    fn serializes_like_display() {
        for state in [LifecycleState::Downloading, LifecycleState::Cooldown] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{state}\""));
        }
        let parsed: LifecycleState = serde_json::from_str(r#""PAUSED""#).unwrap();
        assert_eq!(parsed, LifecycleState::Paused);
    }
}
