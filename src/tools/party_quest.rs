use std::thread;
use std::time::{Duration, Instant};

use crate::automation::catalog::Catalog;
use crate::automation::context::AutomationContext;
use crate::automation::controller::{Controller, TickReport};
use crate::automation::state::{ActivityState, SessionOutcome};
use crate::device::adb::AdbController;
use crate::device::input::TouchInput;
use crate::device::screen_capture::ScreenSource;
use crate::error::{ConfigError, StartError, TickError};
use crate::settings::BotSettings;
use crate::tools::r#trait::Tool;
use crate::tools::worker::{sleep_while_running, SessionStatus, Signals, StatusBoard, Worker};

/// How often a paused session checks whether it may go on.
const PAUSE_POLL: Duration = Duration::from_millis(100);

/// Drives ticks until the session reaches a terminal outcome or is stopped.
///
/// Collaborator failures back off exponentially; more than
/// `collaborator_retry_limit` in a row end the session. While paused no
/// ticks run and no timers advance.
pub fn run_session<S: ScreenSource, I: TouchInput>(
    controller: &Controller,
    ctx: &mut AutomationContext<S, I>,
    signals: &Signals,
    board: &StatusBoard,
) -> ActivityState {
    let settings = controller.settings();
    let mut state = controller.start_session(Instant::now());
    let mut failures = 0u32;

    loop {
        if signals.is_paused() && signals.is_running() {
            board.set_message(&format!("Paused in {}", state.phase));
            let paused_at = Instant::now();
            while signals.is_paused() && signals.is_running() {
                thread::sleep(PAUSE_POLL);
            }
            let paused_for = paused_at.elapsed();
            state.shift_clocks(paused_for);
            log::info!("Resumed after {}s", paused_for.as_secs());
        }
        if !signals.is_running() {
            state.outcome = SessionOutcome::Stopped;
            break;
        }

        let now = Instant::now();
        let pause = match controller.tick(&mut state, ctx, now) {
            Ok(report) => {
                failures = 0;
                board.set_message(&describe(&report));
                if report.tapped.is_some() {
                    settings.tick_interval() + settings.action_settle()
                } else {
                    settings.tick_interval()
                }
            }
            Err(err) => {
                failures += 1;
                if let TickError::Capture(capture) = &err {
                    if capture.is_connection_loss() && !state.connection_lost {
                        state.connection_lost = true;
                        state.stats.connection_losses += 1;
                    }
                }
                log::warn!(
                    "Tick failed ({}/{}): {}",
                    failures,
                    settings.collaborator_retry_limit,
                    err
                );
                if failures > settings.collaborator_retry_limit {
                    state.fail(format!("{} ({} failures in a row)", err, failures), now);
                }
                settings.backoff(failures)
            }
        };

        board.publish(&state, state.runtime(Instant::now()));
        if state.outcome.is_terminal() {
            break;
        }
        sleep_while_running(pause, signals);
    }

    board.publish(&state, state.runtime(Instant::now()));
    board.set_message(&format!("Session ended: {}", state.outcome));
    log::info!(
        "Runs: {}, queue timeouts: {}, recoveries: {}, restarts: {}, hard resets: {}",
        state.stats.pq_runs,
        state.stats.queue_timeouts,
        state.stats.recoveries,
        state.stats.restarts,
        state.stats.hard_resets
    );
    state
}

fn describe(report: &TickReport) -> String {
    if report.transitioned() {
        format!("{} -> {}", report.phase_before, report.phase_after)
    } else if let Some(name) = &report.detection {
        format!("{}: {}", report.phase_after, name)
    } else {
        format!("Waiting in {}", report.phase_after)
    }
}

pub struct PartyQuestTool {
    worker: Worker,
}

impl Default for PartyQuestTool {
    fn default() -> Self {
        Self {
            worker: Worker::new(),
        }
    }
}

impl PartyQuestTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs a session on the worker thread with the given collaborators.
    pub fn start_with<S, I>(
        &mut self,
        controller: Controller,
        mut ctx: AutomationContext<S, I>,
    ) -> Result<(), StartError>
    where
        S: ScreenSource + Send + 'static,
        I: TouchInput + Send + 'static,
    {
        if self.worker.is_running() {
            return Err(StartError::AlreadyRunning);
        }
        self.worker.join();
        self.worker.set_status("Starting...");
        self.worker.start(move |signals, status| {
            run_session(&controller, &mut ctx, &signals, &status);
        });
        Ok(())
    }

    /// Blocks until the session has ended.
    pub fn wait(&mut self) -> SessionStatus {
        self.worker.join();
        self.worker.status()
    }

    pub fn status(&self) -> SessionStatus {
        self.worker.status()
    }
}

impl Tool for PartyQuestTool {
    fn start(&mut self, settings: &BotSettings) -> Result<(), StartError> {
        if self.worker.is_running() {
            return Err(StartError::AlreadyRunning);
        }
        settings.validate()?;
        let catalog = Catalog::load_dir(&settings.templates_dir)?;
        let controller = Controller::new(settings.party_quest.clone(), catalog)?
            .with_diagnostics(settings.diagnostics_dir.clone());

        let adb = AdbController::new(
            settings.adb.adb_path.as_deref(),
            &settings.adb.host,
            settings.adb.port,
            settings.adb.command_timeout(),
        );
        adb.connect()
            .map_err(|e| StartError::Connection(format!("{} ({})", e, adb.address())))?;
        let (width, height) = adb
            .screen_resolution()
            .map_err(|e| StartError::Connection(e.to_string()))?;
        if (width, height) != (settings.screen.width, settings.screen.height) {
            return Err(ConfigError::invalid(
                "screen",
                format!(
                    "device runs at {}x{}, expected {}x{}",
                    width, height, settings.screen.width, settings.screen.height
                ),
            )
            .into());
        }

        let ctx = AutomationContext::over_adb(adb, settings);
        self.start_with(controller, ctx)
    }

    fn stop(&mut self) {
        self.worker.stop();
        self.worker.set_status("Stopping...");
    }

    fn pause(&mut self) {
        if self.worker.is_running() {
            self.worker.pause();
            self.worker.set_status("Pausing...");
        }
    }

    fn resume(&mut self) {
        if self.worker.is_paused() {
            self.worker.resume();
            self.worker.set_status("Resuming...");
        }
    }

    fn is_paused(&self) -> bool {
        self.worker.is_paused()
    }

    fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    fn get_status(&self) -> String {
        let status = self.worker.status();
        let phase = status.phase.map_or("-", |p| p.label());
        format!(
            "{} | Runs: {} | Timeouts: {} | Recoveries: {} | {}s | {}",
            phase,
            status.stats.pq_runs,
            status.stats.queue_timeouts,
            status.stats.recoveries,
            status.runtime.as_secs(),
            status.message
        )
    }

    fn get_name(&self) -> &str {
        "Party Quest"
    }
}
