//! Applies tracker decisions to real protocol clients.

use sessionview_core::{
    ActiveSessionRecord, CapturedFrame, LastCapturedFrame, ProtocolFamily, Workflow,
};
use sessionview_remote::{EventReceiver, RemoteSession, SessionEvent, SessionLauncher};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::tracker::{find_task, Activation, Evaluation, SessionActivationTracker};

struct LiveSession {
    record: ActiveSessionRecord,
    session: Box<dyn RemoteSession>,
    events: EventReceiver,
}

/// Owns at most one mounted client for a protocol family.
pub struct SessionSupervisor {
    tracker: SessionActivationTracker,
    launcher: Arc<dyn SessionLauncher>,
    live: Option<LiveSession>,
    workflows: Vec<Workflow>,
    launches: u64,
}

impl SessionSupervisor {
    pub fn new(family: ProtocolFamily, launcher: Arc<dyn SessionLauncher>) -> Self {
        Self {
            tracker: SessionActivationTracker::new(family),
            launcher,
            live: None,
            workflows: Vec::new(),
            launches: 0,
        }
    }

    pub fn tracker(&self) -> &SessionActivationTracker {
        &self.tracker
    }

    pub fn session(&self) -> Option<&dyn RemoteSession> {
        self.live.as_ref().map(|l| l.session.as_ref())
    }

    /// Number of clients launched so far.
    pub fn launches(&self) -> u64 {
        self.launches
    }

    /// Feed a new task snapshot and mount/unmount clients accordingly.
    pub async fn update(&mut self, workflows: Vec<Workflow>, response_streaming: bool) -> Evaluation {
        self.workflows = workflows;
        let eval = self.tracker.evaluate(&self.workflows, response_streaming);
        if eval.activation == Activation::Unchanged {
            return eval;
        }
        match &eval.activation {
            Activation::Unchanged => {}
            Activation::Activated { record } => self.mount(record.clone()),
            Activation::Replaced { next, .. } => {
                self.unmount().await;
                self.mount(next.clone());
            }
            Activation::Cleared { .. } => self.unmount().await,
        }
        Evaluation {
            activation: eval.activation,
            display: self.tracker.display(&self.workflows),
        }
    }

    /// Wait for the next event from the mounted client.
    ///
    /// Fatal connection errors are turned into the tracker's give-up signal
    /// and the client is unmounted before the event is returned. Returns
    /// `None` when nothing is mounted or the client's stream ended.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        let event = self.live.as_mut()?.events.recv().await?;
        self.observe(&event).await;
        Some(event)
    }

    /// Drain whatever events are already queued.
    pub async fn poll_events(&mut self) -> Vec<SessionEvent> {
        let mut drained = Vec::new();
        while let Some(live) = self.live.as_mut() {
            let Ok(event) = live.events.try_recv() else {
                break;
            };
            self.observe(&event).await;
            drained.push(event);
        }
        drained
    }

    /// Tear down the mounted client, returning its final frame.
    pub async fn shutdown(&mut self) -> Option<CapturedFrame> {
        let live = self.live.take()?;
        info!(token = %live.record.token, "Shutting down live session");
        live.session.disconnect(true).await
    }

    async fn observe(&mut self, event: &SessionEvent) {
        let SessionEvent::ConnectionError {
            fatal: true,
            code,
            reason,
        } = event
        else {
            return;
        };
        let Some(token) = self.live.as_ref().map(|l| l.record.token.clone()) else {
            return;
        };
        warn!(token = %token, code = ?code, reason = %reason, "Live session failed permanently");
        if self.tracker.give_up(&token) != Activation::Unchanged {
            self.unmount().await;
        }
    }

    fn mount(&mut self, record: ActiveSessionRecord) {
        let family = self.tracker.family();
        info!(family = %family, token = %record.token, task_id = %record.task_id, "Mounting live session");
        let (session, events) = self.launcher.launch(family, record.token.clone());
        self.launches += 1;
        self.live = Some(LiveSession {
            record,
            session,
            events,
        });
    }

    async fn unmount(&mut self) {
        let Some(live) = self.live.take() else {
            return;
        };
        debug!(token = %live.record.token, "Unmounting live session");
        let task_id = live.record.task_id.clone();
        let Some(frame) = live.session.disconnect(true).await else {
            return;
        };
        let task = find_task(&self.workflows, &task_id);
        self.tracker.record_last_frame(LastCapturedFrame {
            task_id,
            action_label: task.and_then(|t| t.action_label.clone()),
            screenshots_seen: task.map_or(0, |t| t.screenshots.len()),
            frame,
        });
    }
}
