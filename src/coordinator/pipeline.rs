//! # Pipeline State
//!
//! One state value per pipeline kind replaces separate busy flags. A pipeline enters
//! `Running` through [`PipelineSlot::try_begin`], which refuses re-entry, and leaves it
//! through the returned [`RunGuard`]. Dropping the guard without finishing resets the slot
//! to `Idle`, so an early return or a cancelled task never leaves a pipeline wedged.

use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::types::TxHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PipelineKind {
    Submit,
    RiskCheck,
    Decrypt,
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineKind::Submit => write!(f, "submit"),
            PipelineKind::RiskCheck => write!(f, "risk-check"),
            PipelineKind::Decrypt => write!(f, "decrypt"),
        }
    }
}

/// Step a running pipeline is in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Encrypting,
    Submitting,
    Confirming,
    Refreshing,
    Signing,
    Decrypting,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub enum PipelineState {
    #[default]
    Idle,
    Running(Stage),
    /// Abandoned because the session changed mid-flight
    Aborted,
    Failed(String),
}

impl PipelineState {
    pub fn is_running(&self) -> bool {
        matches!(self, PipelineState::Running(_))
    }
}

/// Why an invocation did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    /// Same pipeline (or a conflicting one) is already running
    Busy,
    /// Contract, signer, instance or handle missing
    NotReady,
    /// Glucose value must be positive
    InvalidValue,
    /// Cached cleartext already matches the current handle
    AlreadyDecrypted,
}

/// Result of one pipeline invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PipelineOutcome {
    Completed { tx_hash: Option<TxHash> },
    Skipped(SkipReason),
    /// The session changed while running; nothing was applied
    Ignored(String),
    Failed(String),
}

impl PipelineOutcome {
    pub fn completed() -> Self {
        PipelineOutcome::Completed { tx_hash: None }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, PipelineOutcome::Completed { .. })
    }

    pub fn is_ignored(&self) -> bool {
        matches!(self, PipelineOutcome::Ignored(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, PipelineOutcome::Failed(_))
    }

    pub fn tx_hash(&self) -> Option<TxHash> {
        match self {
            PipelineOutcome::Completed { tx_hash } => *tx_hash,
            _ => None,
        }
    }
}

/// State holder for one pipeline kind
#[derive(Debug)]
pub struct PipelineSlot {
    kind: PipelineKind,
    state: Mutex<PipelineState>,
}

impl PipelineSlot {
    pub fn new(kind: PipelineKind) -> Self {
        Self {
            kind,
            state: Mutex::new(PipelineState::Idle),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().is_running()
    }

    /// Enter `Running(stage)` unless already running
    pub fn try_begin(&self, stage: Stage) -> Option<RunGuard<'_>> {
        let mut state = self.state.lock();
        if state.is_running() {
            return None;
        }
        *state = PipelineState::Running(stage);
        debug!("{} pipeline started at {:?}", self.kind, stage);
        Some(RunGuard {
            slot: self,
            finished: false,
        })
    }

    /// Like [`try_begin`](Self::try_begin), but also refuse while `other` is running.
    /// `other` stays locked until this slot is `Running`, so it cannot start in between.
    pub fn try_begin_unless(&self, stage: Stage, other: &PipelineSlot) -> Option<RunGuard<'_>> {
        let other_state = other.state.lock();
        if other_state.is_running() {
            debug!("{} pipeline blocked by running {} pipeline", self.kind, other.kind);
            return None;
        }
        self.try_begin(stage)
    }

    fn set(&self, next: PipelineState) {
        *self.state.lock() = next;
    }
}

/// Exclusive right to drive a pipeline; resets the slot when dropped unfinished
#[derive(Debug)]
pub struct RunGuard<'a> {
    slot: &'a PipelineSlot,
    finished: bool,
}

impl RunGuard<'_> {
    pub fn advance(&self, stage: Stage) {
        debug!("{} pipeline -> {:?}", self.slot.kind, stage);
        self.slot.set(PipelineState::Running(stage));
    }

    pub fn complete(mut self) {
        self.finish(PipelineState::Idle);
    }

    pub fn abort(mut self) {
        self.finish(PipelineState::Aborted);
    }

    pub fn fail(mut self, message: impl Into<String>) {
        self.finish(PipelineState::Failed(message.into()));
    }

    fn finish(&mut self, next: PipelineState) {
        self.slot.set(next);
        self.finished = true;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.slot.set(PipelineState::Idle);
        }
    }
}
