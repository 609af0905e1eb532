use serde::Serialize;

/// Where a task stands with respect to its live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    /// Known, never promoted.
    Pending,
    /// Owns the active session record.
    Live,
    /// Lost the record to a newer task; its last frame may be shown.
    CapturedFallback,
    /// Complete or errored. Absorbing.
    Terminal,
}

impl TaskPhase {
    pub fn can_transition_to(self, next: TaskPhase) -> bool {
        use TaskPhase::*;
        match (self, next) {
            (Terminal, next) => next == Terminal,
            (_, Terminal) => true,
            (from, to) if from == to => true,
            (Pending, Live) | (CapturedFallback, Live) => true,
            (Live, CapturedFallback) => true,
            // A live session that was given up on goes back to waiting.
            (Live, Pending) => true,
            _ => false,
        }
    }

    /// Move to `next` when allowed. Returns whether the phase changed.
    pub fn advance(&mut self, next: TaskPhase) -> bool {
        if *self == next || !self.can_transition_to(next) {
            return false;
        }
        *self = next;
        true
    }

    pub fn may_go_live(self) -> bool {
        self.can_transition_to(TaskPhase::Live)
    }
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPhase::Pending => write!(f, "pending"),
            TaskPhase::Live => write!(f, "live"),
            TaskPhase::CapturedFallback => write!(f, "captured_fallback"),
            TaskPhase::Terminal => write!(f, "terminal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_is_absorbing() {
        let mut phase = TaskPhase::Terminal;
        for next in [TaskPhase::Pending, TaskPhase::Live, TaskPhase::CapturedFallback] {
            assert!(!phase.advance(next));
            assert_eq!(phase, TaskPhase::Terminal);
        }
        assert!(!TaskPhase::Terminal.may_go_live());
    }

    #[test]
    fn test_lifecycle() {
        let mut phase = TaskPhase::Pending;
        assert!(phase.advance(TaskPhase::Live));
        assert!(phase.advance(TaskPhase::CapturedFallback));
        assert!(phase.advance(TaskPhase::Live));
        assert!(phase.advance(TaskPhase::Terminal));
        assert_eq!(phase.to_string(), "terminal");
    }

    #[test]
    fn test_pending_cannot_skip_to_fallback() {
        let mut phase = TaskPhase::Pending;
        assert!(!phase.advance(TaskPhase::CapturedFallback));
        assert_eq!(phase, TaskPhase::Pending);
    }
}
