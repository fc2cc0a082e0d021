pub mod target;

pub use target::{
    REPO_PLACEHOLDER, TargetId, TargetIdError, TargetKind, TargetLocations, classify, within,
};

/// Lifecycle state of one target as seen by this host instance.
///
/// NOTE: `Stopped` means a registry entry exists but its process has exited
/// without the controller being told. Explicit stops clear the entry and the
/// target goes straight back to `Unmanaged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TargetState {
    Unmanaged,
    Starting,
    Running,
    Stopped,
}

impl TargetState {
    pub fn is_running(self) -> bool {
        matches!(self, TargetState::Running)
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TargetStatus {
    pub id: TargetId,
    pub state: TargetState,
    pub pid: Option<u32>,
}

impl TargetStatus {
    pub fn running(&self) -> bool {
        self.state.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_running_state_counts_as_running() {
        assert!(TargetState::Running.is_running());
        for s in [
            TargetState::Unmanaged,
            TargetState::Starting,
            TargetState::Stopped,
        ] {
            assert!(!s.is_running());
        }
    }

    #[test]
    fn status_serializes_with_plain_identifier() {
        let st = TargetStatus {
            id: TargetId::new("u42|job.py"),
            state: TargetState::Running,
            pid: Some(7),
        };
        let v = serde_json::to_value(&st).unwrap();
        assert_eq!(v["id"], "u42|job.py");
        assert_eq!(v["state"], "Running");
    }
}
