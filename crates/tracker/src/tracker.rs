//! Decides which task's live session is mounted for one protocol family.
//!
//! The tracker is pure bookkeeping: it never opens connections. Callers feed
//! it workflow snapshots through [`SessionActivationTracker::evaluate`] and act
//! on the returned [`Evaluation`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use sessionview_core::{
    ActiveSessionRecord, AutomationTask, CapabilityToken, LastCapturedFrame, ProtocolFamily,
    TaskStatus, Workflow,
};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::phase::TaskPhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearReason {
    /// The owning task completed or errored.
    TaskFinished,
    /// The live client hit a fatal connection error.
    GaveUp,
}

/// What happened to the active session record in one pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Activation {
    Unchanged,
    Activated {
        record: ActiveSessionRecord,
    },
    Replaced {
        previous: ActiveSessionRecord,
        next: ActiveSessionRecord,
    },
    Cleared {
        previous: ActiveSessionRecord,
        reason: ClearReason,
    },
}

/// What the viewer should show for this family.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DisplayDecision {
    Live {
        record: ActiveSessionRecord,
    },
    /// The frame captured at the last teardown; see [`SessionActivationTracker::last_frame`].
    Fallback {
        task_id: String,
        action_label: Option<String>,
        width: u32,
        height: u32,
        captured_at: DateTime<Utc>,
    },
    Screenshot {
        task_id: String,
        index: usize,
        url: String,
    },
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub activation: Activation,
    pub display: DisplayDecision,
}

pub struct SessionActivationTracker {
    family: ProtocolFamily,
    active: Option<ActiveSessionRecord>,
    last_frame: Option<LastCapturedFrame>,
    phases: HashMap<String, TaskPhase>,
    abandoned: HashSet<CapabilityToken>,
}

impl SessionActivationTracker {
    pub fn new(family: ProtocolFamily) -> Self {
        Self {
            family,
            active: None,
            last_frame: None,
            phases: HashMap::new(),
            abandoned: HashSet::new(),
        }
    }

    pub fn family(&self) -> ProtocolFamily {
        self.family
    }

    pub fn active(&self) -> Option<&ActiveSessionRecord> {
        self.active.as_ref()
    }

    pub fn last_frame(&self) -> Option<&LastCapturedFrame> {
        self.last_frame.as_ref()
    }

    pub fn phase(&self, task_id: &str) -> Option<TaskPhase> {
        self.phases.get(task_id).copied()
    }

    pub fn is_abandoned(&self, token: &CapabilityToken) -> bool {
        self.abandoned.contains(token)
    }

    /// Re-run activation over a fresh snapshot of the task list.
    pub fn evaluate(&mut self, workflows: &[Workflow], response_streaming: bool) -> Evaluation {
        let candidates = self.candidates(workflows);
        for task in &candidates {
            let phase = self
                .phases
                .entry(task.id.clone())
                .or_insert(TaskPhase::Pending);
            if task.status.is_terminal() {
                phase.advance(TaskPhase::Terminal);
            }
        }

        let activation = match self.finished_active(workflows) {
            Some(previous) => {
                info!(
                    family = %self.family,
                    task_id = %previous.task_id,
                    token = %previous.token,
                    "Task finished, clearing active session"
                );
                if self
                    .last_frame
                    .as_ref()
                    .is_some_and(|f| f.task_id == previous.task_id)
                {
                    self.last_frame = None;
                }
                Activation::Cleared {
                    previous,
                    reason: ClearReason::TaskFinished,
                }
            }
            None => self.promote(&candidates, workflows, response_streaming),
        };

        self.expire_last_frame(workflows);

        Evaluation {
            activation,
            display: self.display(workflows),
        }
    }

    /// Store the frame captured while tearing down a live session.
    ///
    /// Ignored when the task already went live again.
    pub fn record_last_frame(&mut self, frame: LastCapturedFrame) {
        if self
            .active
            .as_ref()
            .is_some_and(|a| a.task_id == frame.task_id)
        {
            debug!(task_id = %frame.task_id, "Dropping capture for a task that is live again");
            return;
        }
        if let Some(phase) = self.phases.get_mut(&frame.task_id) {
            phase.advance(TaskPhase::CapturedFallback);
        }
        debug!(
            task_id = %frame.task_id,
            width = frame.frame.width,
            height = frame.frame.height,
            "Recorded last captured frame"
        );
        self.last_frame = Some(frame);
    }

    /// The live client for `token` failed fatally.
    ///
    /// Clears the active record when it holds `token` and keeps the token
    /// from being promoted again. The task itself is not marked terminal.
    pub fn give_up(&mut self, token: &CapabilityToken) -> Activation {
        self.abandoned.insert(token.clone());
        if !self.active.as_ref().is_some_and(|a| &a.token == token) {
            return Activation::Unchanged;
        }
        let Some(previous) = self.active.take() else {
            return Activation::Unchanged;
        };
        if let Some(phase) = self.phases.get_mut(&previous.task_id) {
            phase.advance(TaskPhase::Pending);
        }
        info!(
            family = %self.family,
            task_id = %previous.task_id,
            token = %previous.token,
            "Giving up on live session"
        );
        Activation::Cleared {
            previous,
            reason: ClearReason::GaveUp,
        }
    }

    /// Display decision for the current state without re-evaluating.
    pub fn display(&self, workflows: &[Workflow]) -> DisplayDecision {
        if let Some(record) = &self.active {
            return DisplayDecision::Live {
                record: record.clone(),
            };
        }
        if let Some(last) = &self.last_frame {
            return DisplayDecision::Fallback {
                task_id: last.task_id.clone(),
                action_label: last.action_label.clone(),
                width: last.frame.width,
                height: last.frame.height,
                captured_at: last.frame.captured_at,
            };
        }
        all_tasks(workflows)
            .filter(|t| t.is_computer_use_style())
            .filter_map(|t| {
                t.screenshots.last().map(|url| DisplayDecision::Screenshot {
                    task_id: t.id.clone(),
                    index: t.screenshots.len() - 1,
                    url: url.clone(),
                })
            })
            .last()
            .unwrap_or(DisplayDecision::Empty)
    }

    fn candidates<'a>(&self, workflows: &'a [Workflow]) -> Vec<&'a AutomationTask> {
        all_tasks(workflows)
            .filter(|t| t.is_computer_use_style() && t.tokens.get(self.family).is_some())
            .collect()
    }

    /// Takes the active record when its task reached complete/error.
    fn finished_active(&mut self, workflows: &[Workflow]) -> Option<ActiveSessionRecord> {
        let active = self.active.as_ref()?;
        let finished = find_task(workflows, &active.task_id)
            .is_some_and(|t| t.status.is_terminal());
        if finished {
            self.active.take()
        } else {
            None
        }
    }

    fn promote(
        &mut self,
        candidates: &[&AutomationTask],
        workflows: &[Workflow],
        response_streaming: bool,
    ) -> Activation {
        let newest = if response_streaming {
            workflows
                .last()
                .and_then(|w| w.tasks.last())
                .map(|t| t.id.as_str())
        } else {
            None
        };

        let chosen = candidates.iter().rev().find(|task| {
            if task.status.is_terminal() {
                return false;
            }
            let qualifies =
                task.status == TaskStatus::Loading || newest == Some(task.id.as_str());
            let Some(token) = task.tokens.get(self.family) else {
                return false;
            };
            qualifies
                && !self.abandoned.contains(token)
                && self
                    .phases
                    .get(&task.id)
                    .map_or(true, |p| p.may_go_live())
        });

        let Some(task) = chosen else {
            return Activation::Unchanged;
        };
        let Some(token) = task.tokens.get(self.family) else {
            return Activation::Unchanged;
        };
        let next = ActiveSessionRecord {
            token: token.clone(),
            task_id: task.id.clone(),
        };
        if self.active.as_ref() == Some(&next) {
            return Activation::Unchanged;
        }

        if let Some(phase) = self.phases.get_mut(&next.task_id) {
            phase.advance(TaskPhase::Live);
        }
        if self
            .last_frame
            .as_ref()
            .is_some_and(|f| f.task_id == next.task_id)
        {
            self.last_frame = None;
        }

        info!(
            family = %self.family,
            task_id = %next.task_id,
            token = %next.token,
            "Promoting live session"
        );
        match self.active.replace(next.clone()) {
            Some(previous) => {
                if previous.task_id != next.task_id {
                    if let Some(phase) = self.phases.get_mut(&previous.task_id) {
                        phase.advance(TaskPhase::CapturedFallback);
                    }
                }
                Activation::Replaced { previous, next }
            }
            None => Activation::Activated { record: next },
        }
    }

    /// A fallback frame is superseded once its task finished with a
    /// screenshot of its own, took a newer screenshot, or disappeared.
    fn expire_last_frame(&mut self, workflows: &[Workflow]) {
        let Some(last) = &self.last_frame else {
            return;
        };
        let stale = match find_task(workflows, &last.task_id) {
            None => true,
            Some(task) => {
                task.screenshots.len() > last.screenshots_seen
                    || (task.status.is_terminal() && !task.screenshots.is_empty())
            }
        };
        if stale {
            debug!(task_id = %last.task_id, "Clearing superseded last frame");
            self.last_frame = None;
        }
    }
}

fn all_tasks(workflows: &[Workflow]) -> impl Iterator<Item = &AutomationTask> {
    workflows.iter().flat_map(|w| w.tasks.iter())
}

pub(crate) fn find_task<'a>(workflows: &'a [Workflow], task_id: &str) -> Option<&'a AutomationTask> {
    all_tasks(workflows).find(|t| t.id == task_id)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use sessionview_core::{CapturedFrame, SessionTokens, TaskKind};

    pub(crate) fn task(id: &str, status: TaskStatus, token: Option<&str>) -> AutomationTask {
        AutomationTask {
            id: id.to_string(),
            status,
            kind: TaskKind::ComputerUse,
            tokens: SessionTokens {
                screencast: token.map(CapabilityToken::new),
                ..Default::default()
            },
            action_label: Some(format!("working on {}", id)),
            screenshots: Vec::new(),
        }
    }

    pub(crate) fn workflow(id: &str, tasks: Vec<AutomationTask>) -> Workflow {
        Workflow {
            id: id.to_string(),
            tasks,
        }
    }

    pub(crate) fn frame_for(task_id: &str, screenshots_seen: usize) -> LastCapturedFrame {
        LastCapturedFrame {
            task_id: task_id.to_string(),
            frame: CapturedFrame {
                png: vec![0x89, b'P', b'N', b'G'],
                width: 4,
                height: 2,
                captured_at: Utc::now(),
            },
            action_label: None,
            screenshots_seen,
        }
    }

    fn record(token: &str, task_id: &str) -> ActiveSessionRecord {
        ActiveSessionRecord {
            token: CapabilityToken::new(token),
            task_id: task_id.to_string(),
        }
    }

    fn tracker() -> SessionActivationTracker {
        SessionActivationTracker::new(ProtocolFamily::Screencast)
    }

    #[test]
    fn test_loading_task_is_promoted() {
        let mut tracker = tracker();
        let flows = vec![workflow("w1", vec![task("t1", TaskStatus::Loading, Some("abc"))])];
        let eval = tracker.evaluate(&flows, false);
        assert_eq!(
            eval.activation,
            Activation::Activated {
                record: record("abc", "t1")
            }
        );
        assert_eq!(
            eval.display,
            DisplayDecision::Live {
                record: record("abc", "t1")
            }
        );
        assert_eq!(tracker.phase("t1"), Some(TaskPhase::Live));

        let again = tracker.evaluate(&flows, false);
        assert_eq!(again.activation, Activation::Unchanged);
    }

    #[test]
    fn test_completion_clears_without_promotion() {
        let mut tracker = tracker();
        let flows = vec![workflow(
            "w1",
            vec![
                task("t1", TaskStatus::Loading, Some("abc")),
            ],
        )];
        tracker.evaluate(&flows, false);

        // t1 finishes while t2 starts loading; the clear wins this pass.
        let flows = vec![workflow(
            "w1",
            vec![
                task("t1", TaskStatus::Complete, Some("abc")),
                task("t2", TaskStatus::Loading, Some("def")),
            ],
        )];
        let eval = tracker.evaluate(&flows, false);
        assert_eq!(
            eval.activation,
            Activation::Cleared {
                previous: record("abc", "t1"),
                reason: ClearReason::TaskFinished
            }
        );
        assert!(tracker.active().is_none());
        assert_eq!(tracker.phase("t1"), Some(TaskPhase::Terminal));

        let eval = tracker.evaluate(&flows, false);
        assert_eq!(
            eval.activation,
            Activation::Activated {
                record: record("def", "t2")
            }
        );
    }

    #[test]
    fn test_terminal_task_never_goes_live_again() {
        let mut tracker = tracker();
        let done = vec![workflow("w1", vec![task("t1", TaskStatus::Complete, Some("abc"))])];
        tracker.evaluate(&done, true);
        assert!(tracker.active().is_none());

        // Backend flips the status back; the phase stays terminal.
        let flipped = vec![workflow("w1", vec![task("t1", TaskStatus::Loading, Some("abc"))])];
        let eval = tracker.evaluate(&flipped, true);
        assert_eq!(eval.activation, Activation::Unchanged);
        assert_eq!(tracker.phase("t1"), Some(TaskPhase::Terminal));
    }

    #[test]
    fn test_streaming_promotes_newest_task() {
        let mut tracker = tracker();
        let flows = vec![
            workflow("w1", vec![task("t1", TaskStatus::Other, Some("old"))]),
            workflow("w2", vec![task("t2", TaskStatus::Other, Some("new"))]),
        ];
        assert_eq!(tracker.evaluate(&flows, false).activation, Activation::Unchanged);

        let eval = tracker.evaluate(&flows, true);
        assert_eq!(
            eval.activation,
            Activation::Activated {
                record: record("new", "t2")
            }
        );
    }

    #[test]
    fn test_latest_loading_task_replaces_previous() {
        let mut tracker = tracker();
        let first = vec![workflow("w1", vec![task("t1", TaskStatus::Loading, Some("a"))])];
        tracker.evaluate(&first, false);

        let second = vec![workflow(
            "w1",
            vec![
                task("t1", TaskStatus::Loading, Some("a")),
                task("t2", TaskStatus::Loading, Some("b")),
            ],
        )];
        let eval = tracker.evaluate(&second, false);
        assert_eq!(
            eval.activation,
            Activation::Replaced {
                previous: record("a", "t1"),
                next: record("b", "t2")
            }
        );
        assert_eq!(tracker.phase("t1"), Some(TaskPhase::CapturedFallback));
        assert_eq!(tracker.phase("t2"), Some(TaskPhase::Live));
    }

    #[test]
    fn test_no_candidate_retains_record() {
        let mut tracker = tracker();
        tracker.evaluate(
            &[workflow("w1", vec![task("t1", TaskStatus::Loading, Some("a"))])],
            false,
        );
        let idle = vec![workflow("w1", vec![task("t1", TaskStatus::Other, Some("a"))])];
        assert_eq!(tracker.evaluate(&idle, false).activation, Activation::Unchanged);
        assert_eq!(tracker.active(), Some(&record("a", "t1")));
    }

    #[test]
    fn test_other_kinds_and_families_are_ignored() {
        let mut tracker = tracker();
        let mut plain = task("t1", TaskStatus::Loading, Some("a"));
        plain.kind = TaskKind::Other;
        let mut terminal_only = task("t2", TaskStatus::Loading, None);
        terminal_only.tokens.terminal = Some(CapabilityToken::new("tty"));
        let flows = vec![workflow("w1", vec![plain, terminal_only])];
        assert_eq!(tracker.evaluate(&flows, true).activation, Activation::Unchanged);
        assert_eq!(tracker.evaluate(&flows, true).display, DisplayDecision::Empty);
    }

    #[test]
    fn test_give_up_blocks_repromotion() {
        let mut tracker = tracker();
        let flows = vec![workflow("w1", vec![task("t1", TaskStatus::Loading, Some("bad"))])];
        tracker.evaluate(&flows, false);

        let cleared = tracker.give_up(&CapabilityToken::new("bad"));
        assert_eq!(
            cleared,
            Activation::Cleared {
                previous: record("bad", "t1"),
                reason: ClearReason::GaveUp
            }
        );
        assert_eq!(tracker.phase("t1"), Some(TaskPhase::Pending));
        assert!(tracker.is_abandoned(&CapabilityToken::new("bad")));

        assert_eq!(tracker.evaluate(&flows, false).activation, Activation::Unchanged);
        assert!(tracker.active().is_none());

        // Unrelated tokens are not affected.
        assert_eq!(
            tracker.give_up(&CapabilityToken::new("other")),
            Activation::Unchanged
        );
    }

    #[test]
    fn test_fallback_display_and_expiry() {
        let mut tracker = tracker();
        let first = vec![workflow("w1", vec![task("t1", TaskStatus::Loading, Some("a"))])];
        tracker.evaluate(&first, false);
        tracker.give_up(&CapabilityToken::new("a"));
        tracker.record_last_frame(frame_for("t1", 0));

        let eval = tracker.evaluate(&first, false);
        match eval.display {
            DisplayDecision::Fallback { task_id, width, .. } => {
                assert_eq!(task_id, "t1");
                assert_eq!(width, 4);
            }
            other => panic!("expected fallback, got {:?}", other),
        }

        // A newer screenshot supersedes the captured frame.
        let mut t1 = task("t1", TaskStatus::Loading, Some("a"));
        t1.screenshots.push("https://cdn.example/shot-0.png".to_string());
        let eval = tracker.evaluate(&[workflow("w1", vec![t1])], false);
        assert!(tracker.last_frame().is_none());
        assert_eq!(
            eval.display,
            DisplayDecision::Screenshot {
                task_id: "t1".to_string(),
                index: 0,
                url: "https://cdn.example/shot-0.png".to_string()
            }
        );
    }

    #[test]
    fn test_fallback_cleared_when_task_disappears() {
        let mut tracker = tracker();
        tracker.record_last_frame(frame_for("gone", 0));
        let eval = tracker.evaluate(&[], false);
        assert!(tracker.last_frame().is_none());
        assert_eq!(eval.display, DisplayDecision::Empty);
    }

    #[test]
    fn test_capture_for_live_task_is_ignored() {
        let mut tracker = tracker();
        let flows = vec![workflow("w1", vec![task("t1", TaskStatus::Loading, Some("a"))])];
        tracker.evaluate(&flows, false);
        tracker.record_last_frame(frame_for("t1", 0));
        assert!(tracker.last_frame().is_none());
    }

    #[test]
    fn test_evaluation_serializes_tagged() {
        let mut tracker = tracker();
        let flows = vec![workflow("w1", vec![task("t1", TaskStatus::Loading, Some("abc"))])];
        let eval = tracker.evaluate(&flows, false);
        let json = serde_json::to_value(&eval).unwrap();
        assert_eq!(json["activation"]["kind"], "activated");
        assert_eq!(json["activation"]["record"]["taskId"], "t1");
        assert_eq!(json["display"]["kind"], "live");
    }
}
