//! Document request lifecycle.
//!
//! A request moves through five fixed stages. Progress is index based:
//! applying a stage marks it and every earlier stage completed, so reaching
//! `livré` also marks `refusé` completed. [`StatusState::outcome`] gives the
//! terminal reading the UI should show.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::UnixTimeMs;

const STATUS_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    #[serde(rename = "en attente")]
    Pending,
    #[serde(rename = "en cours")]
    InProgress,
    #[serde(rename = "accepté")]
    Accepted,
    #[serde(rename = "refusé")]
    Rejected,
    #[serde(rename = "livré")]
    Delivered,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Pending,
        Stage::InProgress,
        Stage::Accepted,
        Stage::Rejected,
        Stage::Delivered,
    ];

    /// Label used by the backend.
    pub const fn label(self) -> &'static str {
        match self {
            Stage::Pending => "en attente",
            Stage::InProgress => "en cours",
            Stage::Accepted => "accepté",
            Stage::Rejected => "refusé",
            Stage::Delivered => "livré",
        }
    }

    pub const fn index(self) -> usize {
        match self {
            Stage::Pending => 0,
            Stage::InProgress => 1,
            Stage::Accepted => 2,
            Stage::Rejected => 3,
            Stage::Delivered => 4,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Stage::Rejected | Stage::Delivered)
    }

    /// Surrounding whitespace and letter case are ignored; accents are not.
    pub fn from_label(label: &str) -> Option<Self> {
        let normalized = label.trim().to_lowercase();
        Self::ALL.into_iter().find(|s| s.label() == normalized)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEntry {
    pub stage: Stage,
    pub date: Option<UnixTimeMs>,
    pub completed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusOutcome {
    Open(Stage),
    Rejected,
    Delivered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusState {
    pub current: Stage,
    pub history: [StageEntry; 5],
}

impl Default for StatusState {
    fn default() -> Self {
        let mut state = Self {
            current: Stage::Pending,
            history: Stage::ALL.map(|stage| StageEntry {
                stage,
                date: None,
                completed: false,
            }),
        };
        state.history[0].completed = true;
        state
    }
}

impl StatusState {
    pub fn entry(&self, stage: Stage) -> &StageEntry {
        &self.history[stage.index()]
    }

    pub fn completed_count(&self) -> usize {
        self.history.iter().filter(|e| e.completed).count()
    }

    pub fn outcome(&self) -> StatusOutcome {
        match self.current {
            Stage::Rejected => StatusOutcome::Rejected,
            Stage::Delivered => StatusOutcome::Delivered,
            stage => StatusOutcome::Open(stage),
        }
    }

    fn mark(&mut self, stage: Stage, now: UnixTimeMs) {
        let k = stage.index();
        for entry in &mut self.history {
            if entry.stage.index() <= k {
                entry.completed = true;
                entry.date = Some(now);
            } else {
                entry.completed = false;
                entry.date = None;
            }
        }
        self.current = stage;
    }
}

/// Owns one request's [`StatusState`] and fans snapshots out to subscribers.
#[derive(Debug)]
pub struct StatusTracker {
    state: StatusState,
    events: broadcast::Sender<StatusState>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            state: StatusState::default(),
            events,
        }
    }

    /// Returns `false` and leaves everything untouched for unknown labels.
    pub fn apply_status(&mut self, label: &str) -> bool {
        self.apply_status_at(label, UnixTimeMs::now())
    }

    pub fn apply_status_at(&mut self, label: &str, now: UnixTimeMs) -> bool {
        match Stage::from_label(label) {
            Some(stage) => {
                self.apply_stage_at(stage, now);
                true
            }
            None => {
                debug!(label, "ignoring unknown status label");
                false
            }
        }
    }

    pub fn apply_stage(&mut self, stage: Stage) {
        self.apply_stage_at(stage, UnixTimeMs::now());
    }

    pub fn apply_stage_at(&mut self, stage: Stage, now: UnixTimeMs) {
        self.state.mark(stage, now);
        // no receivers is fine
        let _ = self.events.send(self.state.clone());
    }

    pub fn current(&self) -> Stage {
        self.state.current
    }

    pub fn snapshot(&self) -> StatusState {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusState> {
        self.events.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }
}
