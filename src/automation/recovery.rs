use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::automation::state::{ActivityState, Phase};
use crate::device::coords::NormPoint;
use crate::settings::PartyQuestSettings;

/// What the controller should do once a phase is declared stuck.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecoveryAction {
    /// Tap a fixed position, then move to `next`.
    Fallback { position: NormPoint, next: Phase },
    /// No fallback known: go back to working out where we are.
    Resync { next: Phase },
    /// Budget for this phase is spent.
    Abort { attempts: u32 },
}

/// Decides when a session is stuck and how to get it moving again.
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    stall_limit: u32,
    max_attempts: u32,
    quest_fallback: Option<NormPoint>,
    phase_fallbacks: HashMap<Phase, NormPoint>,
    stuck_timeout: Duration,
    pq_stage_timeout: Duration,
    queue_timeout: Duration,
}

impl RecoveryPolicy {
    pub fn new(
        stall_limit: u32,
        max_attempts: u32,
        quest_fallback: Option<NormPoint>,
        phase_fallbacks: HashMap<Phase, NormPoint>,
    ) -> Self {
        Self {
            stall_limit,
            max_attempts,
            quest_fallback,
            phase_fallbacks,
            stuck_timeout: Duration::MAX,
            pq_stage_timeout: Duration::MAX,
            queue_timeout: Duration::ZERO,
        }
    }

    /// Enables the no-progress watchdog. The queue phase gets `queue` on top
    /// of `stuck`, since waiting there is expected.
    pub fn with_progress_timeouts(mut self, stuck: Duration, in_pq: Duration, queue: Duration) -> Self {
        self.stuck_timeout = stuck;
        self.pq_stage_timeout = in_pq;
        self.queue_timeout = queue;
        self
    }

    pub fn from_settings(settings: &PartyQuestSettings) -> Self {
        Self::new(
            settings.stall_limit,
            settings.max_recovery_attempts,
            settings.quest_fallbacks.get(&settings.variant).copied(),
            settings.phase_fallbacks.clone(),
        )
        .with_progress_timeouts(
            settings.stuck_timeout(),
            settings.pq_stage_timeout(),
            settings.queue_timeout(),
        )
    }

    pub fn stall_limit(&self) -> u32 {
        self.stall_limit
    }

    pub fn should_recover(&self, state: &ActivityState) -> bool {
        state.connection_lost || state.misses >= self.stall_limit
    }

    /// True once the current phase has gone too long without progress,
    /// however its ticks were judged.
    pub fn progress_overdue(&self, state: &ActivityState, now: Instant) -> bool {
        let limit = match state.phase {
            Phase::InPq => self.pq_stage_timeout,
            Phase::InQueue => self.stuck_timeout.saturating_add(self.queue_timeout),
            Phase::Failed => return false,
            _ => self.stuck_timeout,
        };
        state.since_progress(now) >= limit
    }

    /// Fixed position configured for `phase`, if any.
    pub fn fallback_for(&self, phase: Phase) -> Option<NormPoint> {
        match phase {
            Phase::SelectingQuest => self.quest_fallback,
            Phase::Failed => None,
            other => self.phase_fallbacks.get(&other).copied(),
        }
    }

    /// Next step for a stuck session. Does not touch the state; the caller
    /// records the attempt before acting on anything but `Abort`.
    pub fn recovery_action(&self, state: &ActivityState) -> RecoveryAction {
        let attempts = state.recovery_attempts(state.phase);
        if attempts >= self.max_attempts {
            return RecoveryAction::Abort { attempts };
        }
        if state.connection_lost {
            return RecoveryAction::Resync {
                next: Phase::LookingForGame,
            };
        }
        match self.fallback_for(state.phase) {
            Some(position) => RecoveryAction::Fallback {
                position,
                next: state.phase.after_fallback(),
            },
            None => RecoveryAction::Resync {
                next: Phase::LookingForGame,
            },
        }
    }
}
