use std::fmt;

/// Lifecycle of a process component.
///
/// `Unstarted → Running → {Succeeded, Failed, Paused}`, `Paused → Running`
/// on resume, and `Succeeded → RolledBack` only during compensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    Unstarted,
    Running,
    Paused,
    Succeeded,
    Failed,
    RolledBack,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessState::Succeeded | ProcessState::Failed | ProcessState::RolledBack
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ProcessState::Running | ProcessState::Paused)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::Unstarted => "unstarted",
            ProcessState::Running => "running",
            ProcessState::Paused => "paused",
            ProcessState::Succeeded => "succeeded",
            ProcessState::Failed => "failed",
            ProcessState::RolledBack => "rolled back",
        };
        f.write_str(name)
    }
}
