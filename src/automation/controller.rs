use std::path::PathBuf;
use std::time::Instant;

use crate::automation::catalog::{refs, Catalog};
use crate::automation::context::AutomationContext;
use crate::automation::detection::{Detection, MatchVerdict, Matcher};
use crate::automation::recovery::{RecoveryAction, RecoveryPolicy};
use crate::automation::state::{ActivityState, Phase, SessionOutcome};
use crate::automation::variant::VariantDescriptor;
use crate::device::input::{DeviceKey, TouchInput};
use crate::device::screen_capture::{ScreenFrame, ScreenSource};
use crate::error::{ConfigError, DispatchError, TickError};
use crate::settings::PartyQuestSettings;

/// Back presses used to unwind whatever screen the game is stuck on.
const RESTART_BACK_PRESSES: usize = 5;

/// How a phase handler judged the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// The session moved forward.
    Seen,
    /// The phase is confirmed, but nothing moved (queue indicator, same stage).
    Holding,
    /// Nothing useful, but nothing wrong either (loading screens).
    Waiting,
    Missed,
}

/// Why a recovery was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Misses,
    NoProgress,
    ConnectionLost,
}

/// What one tick did, for the session loop and for tests.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub phase_before: Phase,
    pub phase_after: Phase,
    /// Accepted detection that drove the tick, if any.
    pub detection: Option<String>,
    pub tapped: Option<(u32, u32)>,
    pub recovery: Option<RecoveryAction>,
}

impl TickReport {
    fn new(phase: Phase) -> Self {
        Self {
            phase_before: phase,
            phase_after: phase,
            detection: None,
            tapped: None,
            recovery: None,
        }
    }

    pub fn transitioned(&self) -> bool {
        self.phase_before != self.phase_after
    }
}

/// The party quest state machine. Holds only immutable configuration; all
/// session state lives in the [`ActivityState`] threaded through [`Controller::tick`].
pub struct Controller {
    settings: PartyQuestSettings,
    descriptor: &'static VariantDescriptor,
    matcher: Matcher,
    recovery: RecoveryPolicy,
    diagnostics_dir: Option<PathBuf>,
}

impl Controller {
    /// Fails when the settings are invalid or the catalog lacks a reference
    /// the selected variant needs.
    pub fn new(settings: PartyQuestSettings, catalog: Catalog) -> Result<Self, ConfigError> {
        settings.validate()?;
        catalog.require_variant(settings.variant)?;
        Ok(Self {
            descriptor: settings.variant.descriptor(),
            matcher: Matcher::new(catalog, settings.candidates_per_reference),
            recovery: RecoveryPolicy::from_settings(&settings),
            diagnostics_dir: None,
            settings,
        })
    }

    pub fn with_diagnostics(mut self, dir: Option<PathBuf>) -> Self {
        self.diagnostics_dir = dir;
        self
    }

    pub fn settings(&self) -> &PartyQuestSettings {
        &self.settings
    }

    pub fn start_session(&self, now: Instant) -> ActivityState {
        log::info!(
            "Starting {} party quest session (queue timeout {}s)",
            self.settings.variant,
            self.settings.queue_timeout_secs
        );
        ActivityState::new(self.settings.variant, now)
    }

    /// One capture, match, decide, act, transition cycle.
    ///
    /// Issues at most one tap through the translator. Collaborator failures are
    /// returned; routine absence of matches only moves counters.
    pub fn tick<S: ScreenSource, I: TouchInput>(
        &self,
        state: &mut ActivityState,
        ctx: &mut AutomationContext<S, I>,
        now: Instant,
    ) -> Result<TickReport, TickError> {
        let mut report = TickReport::new(state.phase);
        if state.outcome.is_terminal() {
            return Ok(report);
        }

        let frame = ctx.source.capture_frame()?;

        if state.clearing_recents {
            self.finish_hard_reset(state, ctx, &frame, now, &mut report)?;
        } else if state.connection_lost {
            self.recover(state, ctx, &frame, now, &mut report, Trigger::ConnectionLost)?;
        } else if self.hard_reset_due(state, now) {
            self.begin_hard_reset(state, ctx, now)?;
        } else if self.handle_interrupts(state, ctx, &frame, now, &mut report)? {
            // popup dismissed
        } else if self.recovery.progress_overdue(state, now) {
            self.recover(state, ctx, &frame, now, &mut report, Trigger::NoProgress)?;
        } else {
            let phase = state.phase;
            match self.step_phase(state, ctx, &frame, now, &mut report)? {
                Step::Seen => {
                    state.record_detection(phase);
                    state.mark_progress(now);
                }
                Step::Holding => state.misses = 0,
                Step::Waiting => {}
                Step::Missed => {
                    let misses = state.record_miss();
                    log::debug!("Nothing relevant in {} ({} misses)", phase, misses);
                    if self.recovery.should_recover(state) {
                        self.recover(state, ctx, &frame, now, &mut report, Trigger::Misses)?;
                    }
                }
            }
        }

        report.phase_after = state.phase;
        Ok(report)
    }

    fn seen(&self, frame: &ScreenFrame, name: &str) -> Option<Detection> {
        if !self.matcher.catalog().contains(name) {
            return None;
        }
        self.matcher
            .accept(frame, name, self.settings.confidence_threshold)
    }

    fn tap<S, I: TouchInput>(
        &self,
        ctx: &mut AutomationContext<S, I>,
        detection: &Detection,
        report: &mut TickReport,
    ) -> Result<(), DispatchError> {
        let point = ctx.translator.act_upon(&mut ctx.input, detection)?;
        report.tapped = Some(point);
        Ok(())
    }

    /// Popups that can appear over any phase. Returns true when the tick was spent.
    fn handle_interrupts<S, I: TouchInput>(
        &self,
        state: &mut ActivityState,
        ctx: &mut AutomationContext<S, I>,
        frame: &ScreenFrame,
        now: Instant,
        report: &mut TickReport,
    ) -> Result<bool, TickError> {
        if let Some(popup) = self.seen(frame, refs::LOST_CONNECTION) {
            log::warn!("Lost connection popup in {}", state.phase);
            report.detection = Some(popup.reference.clone());
            state.stats.connection_losses += 1;
            if let RecoveryAction::Abort { attempts } = self.recovery.recovery_action(state) {
                state.fail(format!("connection lost {} times in {}", attempts, state.phase), now);
                return Ok(true);
            }
            state.record_recovery_attempt();
            self.tap(ctx, &popup, report)?;
            state.reset_run();
            state.transition(Phase::LookingForGame, now);
            return Ok(true);
        }

        // a popup that never goes away must not hold off stall recovery
        if state.misses >= self.recovery.stall_limit() {
            return Ok(false);
        }
        for name in [refs::EVENT, refs::LEAVE_PARTY, refs::EXIT] {
            if let Some(popup) = self.seen(frame, name) {
                log::info!("Dismissing '{}' popup", name);
                report.detection = Some(popup.reference.clone());
                self.tap(ctx, &popup, report)?;
                state.record_miss();
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn step_phase<S, I: TouchInput>(
        &self,
        state: &mut ActivityState,
        ctx: &mut AutomationContext<S, I>,
        frame: &ScreenFrame,
        now: Instant,
        report: &mut TickReport,
    ) -> Result<Step, DispatchError> {
        match state.phase {
            Phase::LookingForGame => self.looking_for_game(state, ctx, frame, now, report),
            Phase::InMainMenu => self.tap_then(state, ctx, frame, now, report, refs::PQ_BUTTON, Phase::SelectingQuest),
            Phase::SelectingQuest => self.selecting_quest(state, ctx, frame, now, report),
            Phase::ClickingStart => {
                if let Some(queued) = self.seen(frame, self.descriptor.queue_indicator) {
                    report.detection = Some(queued.reference);
                    state.transition(Phase::InQueue, now);
                    return Ok(Step::Seen);
                }
                self.tap_then(state, ctx, frame, now, report, refs::START_QUEUE, Phase::InQueue)
            }
            Phase::InQueue => self.in_queue(state, ctx, frame, now, report),
            Phase::CancelingQueue => {
                if let Some(start) = self.seen(frame, refs::START_QUEUE) {
                    // already out of the queue
                    report.detection = Some(start.reference);
                    state.transition(Phase::ClickingStart, now);
                    return Ok(Step::Seen);
                }
                self.tap_then(state, ctx, frame, now, report, refs::STOP_QUEUE, Phase::ClickingStart)
            }
            Phase::InPq => self.in_pq(state, ctx, frame, now, report),
            Phase::PqCompleted => self.pq_completed(state, ctx, frame, now, report),
            Phase::Failed => Ok(Step::Waiting),
        }
    }

    /// Tap `name` when it is visible and move to `next`.
    #[allow(clippy::too_many_arguments)]
    fn tap_then<S, I: TouchInput>(
        &self,
        state: &mut ActivityState,
        ctx: &mut AutomationContext<S, I>,
        frame: &ScreenFrame,
        now: Instant,
        report: &mut TickReport,
        name: &str,
        next: Phase,
    ) -> Result<Step, DispatchError> {
        match self.seen(frame, name) {
            Some(detection) => {
                self.tap(ctx, &detection, report)?;
                report.detection = Some(detection.reference);
                state.transition(next, now);
                Ok(Step::Seen)
            }
            None => Ok(Step::Missed),
        }
    }

    fn looking_for_game<S, I: TouchInput>(
        &self,
        state: &mut ActivityState,
        ctx: &mut AutomationContext<S, I>,
        frame: &ScreenFrame,
        now: Instant,
        report: &mut TickReport,
    ) -> Result<Step, DispatchError> {
        if let Some((stage, detection)) = self.visible_stage(frame) {
            report.detection = Some(detection.reference);
            state.current_stage = Some(stage);
            self.enter_pq(state, ctx, now);
            return Ok(Step::Seen);
        }
        if let Some(hud) = self.seen(frame, refs::JUMP) {
            log::info!("Quest HUD visible, resuming in {}", Phase::InPq);
            report.detection = Some(hud.reference);
            self.enter_pq(state, ctx, now);
            return Ok(Step::Seen);
        }
        let passive = [
            (self.descriptor.queue_indicator, Phase::InQueue),
            (refs::STOP_QUEUE, Phase::InQueue),
            (refs::START_QUEUE, Phase::ClickingStart),
            (self.descriptor.indicator, Phase::SelectingQuest),
            (refs::PQ_BUTTON, Phase::InMainMenu),
        ];
        for (name, next) in passive {
            if let Some(detection) = self.seen(frame, name) {
                log::info!("Recognised '{}', resuming in {}", name, next);
                report.detection = Some(detection.reference);
                state.transition(next, now);
                return Ok(Step::Seen);
            }
        }
        if self.tap_then(state, ctx, frame, now, report, refs::MAIN_MENU, Phase::InMainMenu)? == Step::Seen {
            return Ok(Step::Seen);
        }
        if let Some(app) = self.seen(frame, refs::APP_BUTTON) {
            log::info!("Opening the game");
            self.tap(ctx, &app, report)?;
            report.detection = Some(app.reference);
            return Ok(Step::Waiting);
        }
        if refs::LOADING_SCREENS.iter().any(|name| self.seen(frame, name).is_some()) {
            log::debug!("Loading screen");
            return Ok(Step::Waiting);
        }
        Ok(Step::Missed)
    }

    fn selecting_quest<S, I: TouchInput>(
        &self,
        state: &mut ActivityState,
        ctx: &mut AutomationContext<S, I>,
        frame: &ScreenFrame,
        now: Instant,
        report: &mut TickReport,
    ) -> Result<Step, DispatchError> {
        let name = self.descriptor.indicator;
        if !self.matcher.catalog().contains(name) {
            return Ok(Step::Missed);
        }
        match self.matcher.verdict(frame, name, self.settings.confidence_threshold) {
            MatchVerdict::Accepted(detection) => {
                self.tap(ctx, &detection, report)?;
                report.detection = Some(detection.reference);
                state.transition(Phase::ClickingStart, now);
                Ok(Step::Seen)
            }
            MatchVerdict::RegionMismatch(outside) => {
                log::debug!(
                    "'{}' matched at {:?} ({:.2}) outside its region, ignoring",
                    name,
                    outside.center,
                    outside.confidence
                );
                Ok(Step::Missed)
            }
            MatchVerdict::NoDetection => Ok(Step::Missed),
        }
    }

    fn in_queue<S, I: TouchInput>(
        &self,
        state: &mut ActivityState,
        ctx: &mut AutomationContext<S, I>,
        frame: &ScreenFrame,
        now: Instant,
        report: &mut TickReport,
    ) -> Result<Step, DispatchError> {
        if let Some((stage, detection)) = self.visible_stage(frame) {
            log::info!("Party found, quest started");
            report.detection = Some(detection.reference);
            state.current_stage = Some(stage);
            self.enter_pq(state, ctx, now);
            return Ok(Step::Seen);
        }

        if state.time_in_phase(now) >= self.settings.queue_timeout() {
            state.stats.queue_timeouts += 1;
            state.consecutive_queue_timeouts += 1;
            let limit = self.settings.max_consecutive_queue_timeouts;
            log::info!(
                "Queue timeout after {}s ({} in a row)",
                self.settings.queue_timeout_secs,
                state.consecutive_queue_timeouts
            );
            if limit > 0 && state.consecutive_queue_timeouts >= limit {
                self.restart_app(state, ctx, now)?;
            } else {
                state.transition(Phase::CancelingQueue, now);
            }
            return Ok(Step::Waiting);
        }

        if let Some(confirm) = self.seen(frame, refs::CONFIRM) {
            log::info!("Party found, confirming");
            self.tap(ctx, &confirm, report)?;
            report.detection = Some(confirm.reference);
            return Ok(Step::Holding);
        }
        for name in [self.descriptor.queue_indicator, refs::STOP_QUEUE] {
            if let Some(queued) = self.seen(frame, name) {
                report.detection = Some(queued.reference);
                return Ok(Step::Holding);
            }
        }
        Ok(Step::Missed)
    }

    fn in_pq<S, I: TouchInput>(
        &self,
        state: &mut ActivityState,
        ctx: &mut AutomationContext<S, I>,
        frame: &ScreenFrame,
        now: Instant,
        report: &mut TickReport,
    ) -> Result<Step, DispatchError> {
        if let Some(clear) = self.seen(frame, refs::CLEAR) {
            state.stats.pq_runs += 1;
            log::info!("Party quest cleared! Total runs: {}", state.stats.pq_runs);
            report.detection = Some(clear.reference);
            state.reset_run();
            state.transition(Phase::PqCompleted, now);
            return Ok(Step::Seen);
        }
        for (name, next) in [(refs::FAILED, Phase::ClickingStart), (refs::START_QUEUE, Phase::InQueue)] {
            if let Some(detection) = self.seen(frame, name) {
                log::info!("Party quest ended without a clear ('{}')", name);
                self.tap(ctx, &detection, report)?;
                report.detection = Some(detection.reference);
                state.reset_run();
                state.transition(next, now);
                return Ok(Step::Seen);
            }
        }

        let mut step = Step::Missed;
        if let Some((stage, detection)) = self.visible_stage(frame) {
            if state.current_stage != Some(stage) {
                log::info!("Stage {} of {}", stage + 1, self.descriptor.stages.len());
                state.current_stage = Some(stage);
                step = Step::Seen;
            } else {
                step = Step::Holding;
            }
            report.detection = Some(detection.reference);
        }

        let Some(jump) = self.seen(frame, refs::JUMP) else {
            return Ok(step);
        };
        let on_final = state.current_stage == Some(self.descriptor.final_stage());
        let alert = on_final && self.seen(frame, refs::RED_ALERT).is_some();
        let due = self.settings.random_jump
            && state
                .last_jump_at
                .map_or(true, |at| now.saturating_duration_since(at) >= state.next_jump_after);
        if alert || due {
            if alert {
                log::info!("Red alert, jumping");
            }
            self.tap(ctx, &jump, report)?;
            state.last_jump_at = Some(now);
            state.next_jump_after = ctx.translator.jittered_interval(self.settings.jump_interval());
        }
        if report.detection.is_none() {
            report.detection = Some(jump.reference);
        }
        Ok(if step == Step::Seen { Step::Seen } else { Step::Holding })
    }

    fn pq_completed<S, I: TouchInput>(
        &self,
        state: &mut ActivityState,
        ctx: &mut AutomationContext<S, I>,
        frame: &ScreenFrame,
        now: Instant,
        report: &mut TickReport,
    ) -> Result<Step, DispatchError> {
        let step = self.tap_then(state, ctx, frame, now, report, refs::CONFIRM, Phase::InMainMenu)?;
        if step == Step::Seen {
            if let Some(max) = self.settings.max_runs {
                if state.stats.pq_runs >= max {
                    log::info!("Completed {} runs, stopping", state.stats.pq_runs);
                    state.outcome = SessionOutcome::Succeeded;
                }
            }
            return Ok(step);
        }
        // results screen still animating
        if self.seen(frame, refs::CLEAR).is_some() {
            return Ok(Step::Waiting);
        }
        Ok(Step::Missed)
    }

    /// Highest visible stage of the variant's sequence.
    fn visible_stage(&self, frame: &ScreenFrame) -> Option<(usize, Detection)> {
        self.descriptor
            .stages
            .iter()
            .enumerate()
            .rev()
            .find_map(|(i, name)| self.seen(frame, name).map(|d| (i, d)))
    }

    fn enter_pq<S, I>(&self, state: &mut ActivityState, ctx: &mut AutomationContext<S, I>, now: Instant) {
        state.consecutive_queue_timeouts = 0;
        state.last_pq_entry_at = now;
        state.last_jump_at = Some(now);
        state.next_jump_after = ctx.translator.jittered_interval(self.settings.jump_interval());
        state.transition(Phase::InPq, now);
    }

    /// Back out of everything and go home; the game is reopened from
    /// LOOKING_FOR_GAME. Counts against the current phase's recovery budget.
    fn restart_app<S, I: TouchInput>(
        &self,
        state: &mut ActivityState,
        ctx: &mut AutomationContext<S, I>,
        now: Instant,
    ) -> Result<(), DispatchError> {
        if let RecoveryAction::Abort { attempts } = self.recovery.recovery_action(state) {
            state.fail(format!("app restarted {} times without progress", attempts), now);
            return Ok(());
        }
        log::warn!("Restarting the game from {}", state.phase);
        state.record_recovery_attempt();
        for _ in 0..RESTART_BACK_PRESSES {
            ctx.input.press_key(DeviceKey::Back)?;
        }
        ctx.input.press_key(DeviceKey::Home)?;
        state.stats.restarts += 1;
        state.consecutive_queue_timeouts = 0;
        state.reset_run();
        state.transition(Phase::LookingForGame, now);
        Ok(())
    }

    fn hard_reset_due(&self, state: &ActivityState, now: Instant) -> bool {
        if state.phase == Phase::InPq {
            return false;
        }
        self.settings
            .hard_reset_timeout(state.hard_reset_level)
            .is_some_and(|limit| now.saturating_duration_since(state.last_pq_entry_at) >= limit)
    }

    /// Leaves the game and opens recent apps. The next tick clears them.
    fn begin_hard_reset<S, I: TouchInput>(
        &self,
        state: &mut ActivityState,
        ctx: &mut AutomationContext<S, I>,
        now: Instant,
    ) -> Result<(), DispatchError> {
        let idle = now.saturating_duration_since(state.last_pq_entry_at);
        if state.stats.hard_resets >= self.settings.max_hard_resets {
            state.fail(
                format!("no party quest for {}s after {} hard resets", idle.as_secs(), state.stats.hard_resets),
                now,
            );
            return Ok(());
        }
        log::warn!("No party quest entered for {}s, hard resetting the game", idle.as_secs());
        ctx.input.press_key(DeviceKey::Home)?;
        ctx.input.press_key(DeviceKey::AppSwitch)?;
        state.clearing_recents = true;
        Ok(())
    }

    /// Clears recent apps, kills the game and starts over from LOOKING_FOR_GAME.
    fn finish_hard_reset<S, I: TouchInput>(
        &self,
        state: &mut ActivityState,
        ctx: &mut AutomationContext<S, I>,
        frame: &ScreenFrame,
        now: Instant,
        report: &mut TickReport,
    ) -> Result<(), DispatchError> {
        match self.seen(frame, refs::CLEAR_ALL) {
            Some(clear_all) => {
                self.tap(ctx, &clear_all, report)?;
                report.detection = Some(clear_all.reference);
            }
            None => {
                log::debug!("'{}' not found, tapping its usual position", refs::CLEAR_ALL);
                report.tapped = Some(
                    ctx.translator
                        .tap_normalized(&mut ctx.input, self.settings.clear_all_fallback)?,
                );
            }
        }
        ctx.input.press_key(DeviceKey::Home)?;
        ctx.input.force_stop(&self.settings.game_package)?;

        state.clearing_recents = false;
        state.stats.hard_resets += 1;
        state.hard_reset_level = (state.hard_reset_level + 1).min(self.settings.hard_reset_timeouts_secs.len());
        state.last_pq_entry_at = now;
        state.consecutive_queue_timeouts = 0;
        state.connection_lost = false;
        state.clear_recovery_attempts();
        state.reset_run();
        state.transition(Phase::LookingForGame, now);
        state.mark_progress(now);
        state.misses = 0;
        log::info!("Hard reset {} done", state.stats.hard_resets);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn recover<S: ScreenSource, I: TouchInput>(
        &self,
        state: &mut ActivityState,
        ctx: &mut AutomationContext<S, I>,
        frame: &ScreenFrame,
        now: Instant,
        report: &mut TickReport,
        trigger: Trigger,
    ) -> Result<(), TickError> {
        let phase = state.phase;
        match trigger {
            Trigger::Misses => {
                log::warn!("Stuck in {} after {} misses", phase, state.misses);
                self.save_diagnostic(state, frame);

                // one more look before falling back; anything but a miss
                // leaves the rest to the no-progress watchdog
                let fresh = ctx.source.capture_frame()?;
                match self.step_phase(state, ctx, &fresh, now, report)? {
                    Step::Seen => {
                        state.record_detection(phase);
                        state.mark_progress(now);
                        return Ok(());
                    }
                    Step::Holding | Step::Waiting => {
                        state.misses = 0;
                        return Ok(());
                    }
                    Step::Missed => {}
                }
            }
            Trigger::NoProgress => {
                log::warn!("No progress in {} for {}s", phase, state.since_progress(now).as_secs());
                self.save_diagnostic(state, frame);
            }
            Trigger::ConnectionLost => log::warn!("Device came back, resynchronising"),
        }

        let action = self.recovery.recovery_action(state);
        report.recovery = Some(action);
        match action {
            RecoveryAction::Abort { attempts } => {
                state.fail(format!("no progress in {} after {} recovery attempts", phase, attempts), now);
            }
            RecoveryAction::Fallback { position, next } => {
                let attempt = state.record_recovery_attempt();
                log::info!("Recovery {}: fallback tap at {:?} in {}", attempt, position, phase);
                report.tapped = Some(ctx.translator.tap_normalized(&mut ctx.input, position)?);
                if phase == Phase::InPq {
                    state.reset_run();
                }
                state.transition(next, now);
                state.mark_progress(now);
                state.misses = 0;
            }
            RecoveryAction::Resync { next } => {
                let attempt = state.record_recovery_attempt();
                log::info!("Recovery {}: resynchronising from {}", attempt, phase);
                state.connection_lost = false;
                state.reset_run();
                state.transition(next, now);
                state.mark_progress(now);
                state.misses = 0;
            }
        }
        Ok(())
    }

    fn save_diagnostic(&self, state: &ActivityState, frame: &ScreenFrame) {
        let Some(dir) = &self.diagnostics_dir else {
            return;
        };
        let path = dir.join(format!(
            "stall_{}_{}.png",
            state.phase.label().to_lowercase(),
            state.stats.recoveries + 1
        ));
        let saved = std::fs::create_dir_all(dir)
            .map_err(|e| e.to_string())
            .and_then(|_| frame.save(&path).map_err(|e| e.to_string()));
        match saved {
            Ok(()) => log::debug!(
                "Saved stall frame to {} (captured {:?} ago)",
                path.display(),
                frame.captured_at().elapsed()
            ),
            Err(e) => log::warn!("Could not save {}: {}", path.display(), e),
        }
    }
}
