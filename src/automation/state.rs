use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::automation::variant::Variant;

/// Phases of one party quest cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    LookingForGame,
    InMainMenu,
    SelectingQuest,
    ClickingStart,
    InQueue,
    CancelingQueue,
    InPq,
    PqCompleted,
    /// Terminal: recovery budget or collaborator retries exhausted.
    Failed,
}

impl Phase {
    pub const COUNT: usize = 9;

    fn index(self) -> usize {
        self as usize
    }

    /// Where the controller goes after tapping this phase's fallback position.
    pub fn after_fallback(self) -> Phase {
        match self {
            Phase::SelectingQuest | Phase::CancelingQueue => Phase::ClickingStart,
            Phase::PqCompleted => Phase::InMainMenu,
            Phase::Failed => Phase::Failed,
            _ => Phase::LookingForGame,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Phase::LookingForGame => "LOOKING_FOR_GAME",
            Phase::InMainMenu => "IN_MAIN_MENU",
            Phase::SelectingQuest => "SELECTING_QUEST",
            Phase::ClickingStart => "CLICKING_START",
            Phase::InQueue => "IN_QUEUE",
            Phase::CancelingQueue => "CANCELING_QUEUE",
            Phase::InPq => "IN_PQ",
            Phase::PqCompleted => "PQ_COMPLETED",
            Phase::Failed => "FAILED",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Running,
    /// Configured number of runs completed.
    Succeeded,
    /// Stop signal observed at a tick boundary.
    Stopped,
    Failed(String),
}

impl SessionOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionOutcome::Running)
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::Running => f.write_str("Running"),
            SessionOutcome::Succeeded => f.write_str("Succeeded"),
            SessionOutcome::Stopped => f.write_str("Stopped"),
            SessionOutcome::Failed(reason) => write!(f, "Failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub pq_runs: u32,
    pub queue_timeouts: u32,
    pub recoveries: u32,
    pub restarts: u32,
    pub connection_losses: u32,
    pub hard_resets: u32,
}

/// Mutable state of one automation session. Only the controller's tick changes it.
#[derive(Debug, Clone)]
pub struct ActivityState {
    pub phase: Phase,
    pub phase_entered_at: Instant,
    pub variant: Variant,
    /// Consecutive ticks in the current phase without an accepted detection.
    pub misses: u32,
    /// Last transition or forward step; the no-progress watchdog runs off this.
    pub progress_at: Instant,
    pub last_pq_entry_at: Instant,
    /// Index into the escalating hard reset timeouts.
    pub hard_reset_level: usize,
    /// First half of a hard reset done; recent apps are on screen.
    pub clearing_recents: bool,
    recovery_attempts: [u32; Phase::COUNT],
    pub current_stage: Option<usize>,
    pub last_jump_at: Option<Instant>,
    pub next_jump_after: Duration,
    pub consecutive_queue_timeouts: u32,
    /// Set when the device dropped out; the next tick resynchronises.
    pub connection_lost: bool,
    pub outcome: SessionOutcome,
    pub stats: SessionStats,
    pub started_at: Instant,
}

impl ActivityState {
    pub fn new(variant: Variant, now: Instant) -> Self {
        Self {
            phase: Phase::LookingForGame,
            phase_entered_at: now,
            variant,
            misses: 0,
            progress_at: now,
            last_pq_entry_at: now,
            hard_reset_level: 0,
            clearing_recents: false,
            recovery_attempts: [0; Phase::COUNT],
            current_stage: None,
            last_jump_at: None,
            next_jump_after: Duration::ZERO,
            consecutive_queue_timeouts: 0,
            connection_lost: false,
            outcome: SessionOutcome::Running,
            stats: SessionStats::default(),
            started_at: now,
        }
    }

    pub fn time_in_phase(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.phase_entered_at)
    }

    pub fn runtime(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    pub fn since_progress(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.progress_at)
    }

    pub fn mark_progress(&mut self, now: Instant) {
        self.progress_at = now;
    }

    /// Moves every session clock forward by `paused`, so time spent paused
    /// counts towards no timeout.
    pub fn shift_clocks(&mut self, paused: Duration) {
        self.phase_entered_at += paused;
        self.progress_at += paused;
        self.last_pq_entry_at += paused;
        if let Some(at) = self.last_jump_at.as_mut() {
            *at += paused;
        }
    }

    /// Moves to `next`, restarting the phase clock and the miss counter.
    /// Returns false when already in `next`.
    pub fn transition(&mut self, next: Phase, now: Instant) -> bool {
        if self.phase == next {
            return false;
        }
        log::info!("{} -> {}", self.phase, next);
        self.phase = next;
        self.phase_entered_at = now;
        self.progress_at = now;
        self.misses = 0;
        true
    }

    pub fn recovery_attempts(&self, phase: Phase) -> u32 {
        self.recovery_attempts[phase.index()]
    }

    pub fn record_recovery_attempt(&mut self) -> u32 {
        let slot = &mut self.recovery_attempts[self.phase.index()];
        *slot += 1;
        self.stats.recoveries += 1;
        *slot
    }

    /// An accepted detection while in `phase`: that phase is healthy again.
    /// `phase` may already have been left during the same tick.
    pub fn record_detection(&mut self, phase: Phase) {
        if self.phase == phase {
            self.misses = 0;
        }
        self.recovery_attempts[phase.index()] = 0;
    }

    pub fn clear_recovery_attempts(&mut self) {
        self.recovery_attempts = [0; Phase::COUNT];
    }

    pub fn record_miss(&mut self) -> u32 {
        self.misses += 1;
        self.misses
    }

    pub fn fail(&mut self, reason: impl Into<String>, now: Instant) {
        let reason = reason.into();
        log::error!("session failed in {}: {}", self.phase, reason);
        self.transition(Phase::Failed, now);
        self.outcome = SessionOutcome::Failed(reason);
    }

    /// Clears per-run tracking after leaving the quest unexpectedly.
    pub fn reset_run(&mut self) {
        self.current_stage = None;
        self.last_jump_at = None;
    }
}
