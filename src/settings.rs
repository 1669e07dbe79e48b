use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::automation::state::Phase;
use crate::automation::variant::Variant;
use crate::device::coords::{is_normalized, NormPoint};
use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotSettings {
    pub log_level: String,
    pub adb: AdbSettings,
    pub templates_dir: PathBuf,
    /// Frames that triggered a recovery are written here when set.
    pub diagnostics_dir: Option<PathBuf>,
    pub screen: ScreenSettings,
    pub party_quest: PartyQuestSettings,
}

impl Default for BotSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            adb: AdbSettings::default(),
            templates_dir: default_templates_dir(),
            diagnostics_dir: None,
            screen: ScreenSettings::default(),
            party_quest: PartyQuestSettings::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_templates_dir() -> PathBuf {
    PathBuf::from("templates/maple_story_idle")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdbSettings {
    pub host: String,
    pub port: u16,
    /// Explicit adb executable; otherwise emulator installs and PATH are searched.
    pub adb_path: Option<PathBuf>,
    pub command_timeout_ms: u64,
}

impl Default for AdbSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5555, // BlueStacks default
            adb_path: None,
            command_timeout_ms: 5000,
        }
    }
}

impl AdbSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Resolution the device is expected to run at. Frames are never rescaled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenSettings {
    pub width: u32,
    pub height: u32,
}

impl Default for ScreenSettings {
    fn default() -> Self {
        Self {
            width: 960,
            height: 540,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartyQuestSettings {
    pub variant: Variant,
    pub queue_timeout_secs: u64,
    pub tick_interval_ms: u64,
    /// Extra pause after any tick that tapped, so the screen can change.
    pub action_settle_ms: u64,
    pub confidence_threshold: f32, // Minimum Confidence (0.0-1.0)
    pub candidates_per_reference: usize,

    pub random_jump: bool,
    pub jump_interval_secs: u64,
    pub max_runs: Option<u32>,

    // Recovery
    pub stall_limit: u32,
    pub max_recovery_attempts: u32,
    pub max_consecutive_queue_timeouts: u32,
    pub collaborator_retry_limit: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Time a phase may go without progress before it is recovered.
    pub stuck_timeout_secs: u64,
    /// Same, inside the quest, where stages legitimately take minutes.
    pub pq_stage_timeout_secs: u64,

    // Hard reset
    /// Time allowed without entering a quest before the n-th hard reset.
    /// The last entry repeats; empty disables hard resets.
    pub hard_reset_timeouts_secs: Vec<u64>,
    pub max_hard_resets: u32,
    /// Tapped when the recent-apps "clear all" button is not found.
    pub clear_all_fallback: NormPoint,

    pub tap_jitter_px: u32,

    /// Known card position per variant, tapped when the card can't be found.
    pub quest_fallbacks: HashMap<Variant, NormPoint>,
    /// Fixed positions for other phases.
    pub phase_fallbacks: HashMap<Phase, NormPoint>,

    pub game_package: String,
}

impl Default for PartyQuestSettings {
    fn default() -> Self {
        Self {
            variant: Variant::default(),
            queue_timeout_secs: 30,
            tick_interval_ms: 200,
            action_settle_ms: 1000,
            confidence_threshold: 0.85,
            candidates_per_reference: 3,
            random_jump: true,
            jump_interval_secs: 30,
            max_runs: None,
            stall_limit: 50,
            max_recovery_attempts: 3,
            max_consecutive_queue_timeouts: 5,
            collaborator_retry_limit: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 8000,
            stuck_timeout_secs: 120,
            pq_stage_timeout_secs: 300,
            hard_reset_timeouts_secs: vec![450, 900],
            max_hard_resets: 5,
            clear_all_fallback: (0.5, 500.0 / 540.0),
            tap_jitter_px: 5,
            quest_fallbacks: default_quest_fallbacks(),
            phase_fallbacks: default_phase_fallbacks(),
            game_package: "com.nexon.maplem.global".to_string(),
        }
    }
}

fn default_quest_fallbacks() -> HashMap<Variant, NormPoint> {
    Variant::ALL
        .into_iter()
        .map(|v| (v, v.descriptor().fallback))
        .collect()
}

// Measured on a 960x540 screen.
fn default_phase_fallbacks() -> HashMap<Phase, NormPoint> {
    HashMap::from([
        (Phase::LookingForGame, (0.5, 0.5)),
        (Phase::InPq, (0.5, 0.5)),
        (Phase::CancelingQueue, (750.0 / 960.0, 480.0 / 540.0)),
        (Phase::PqCompleted, (480.0 / 960.0, 400.0 / 540.0)),
    ])
}

impl PartyQuestSettings {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn action_settle(&self) -> Duration {
        Duration::from_millis(self.action_settle_ms)
    }

    pub fn jump_interval(&self) -> Duration {
        Duration::from_secs(self.jump_interval_secs)
    }

    pub fn stuck_timeout(&self) -> Duration {
        Duration::from_secs(self.stuck_timeout_secs)
    }

    pub fn pq_stage_timeout(&self) -> Duration {
        Duration::from_secs(self.pq_stage_timeout_secs)
    }

    /// No-entry limit before the `level`-th hard reset; the last one repeats.
    pub fn hard_reset_timeout(&self, level: usize) -> Option<Duration> {
        let secs = self
            .hard_reset_timeouts_secs
            .get(level)
            .or(self.hard_reset_timeouts_secs.last())?;
        Some(Duration::from_secs(*secs))
    }

    /// Backoff before retrying after the `failures`-th consecutive collaborator failure.
    pub fn backoff(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(16);
        let ms = self.backoff_base_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(ms.min(self.backoff_max_ms))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = self.confidence_threshold;
        if !(t > 0.0 && t <= 1.0) {
            return Err(ConfigError::invalid(
                "confidence_threshold",
                format!("{} is outside (0, 1]", t),
            ));
        }
        let nonzero = [
            ("tick_interval_ms", self.tick_interval_ms),
            ("queue_timeout_secs", self.queue_timeout_secs),
            ("stall_limit", self.stall_limit as u64),
            ("max_recovery_attempts", self.max_recovery_attempts as u64),
            ("collaborator_retry_limit", self.collaborator_retry_limit as u64),
            ("candidates_per_reference", self.candidates_per_reference as u64),
            ("stuck_timeout_secs", self.stuck_timeout_secs),
            ("pq_stage_timeout_secs", self.pq_stage_timeout_secs),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }
        if self.random_jump && self.jump_interval_secs == 0 {
            return Err(ConfigError::invalid("jump_interval_secs", "must be greater than zero"));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(ConfigError::invalid("backoff_max_ms", "smaller than backoff_base_ms"));
        }
        if self.hard_reset_timeouts_secs.contains(&0) {
            return Err(ConfigError::invalid("hard_reset_timeouts_secs", "entries must be greater than zero"));
        }
        let points = self
            .quest_fallbacks
            .values()
            .chain(self.phase_fallbacks.values())
            .chain(std::iter::once(&self.clear_all_fallback));
        for &(x, y) in points {
            if !is_normalized(x) || !is_normalized(y) {
                return Err(ConfigError::invalid(
                    "fallback position",
                    format!("({}, {}) is outside [0, 1]", x, y),
                ));
            }
        }
        Ok(())
    }
}

impl BotSettings {
    pub const SETTINGS_FILE: &'static str = "maplehelper_settings.json";

    /// Reads settings, failing on unreadable or malformed files.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads settings, writing a default file first when there is none.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let settings = Self::load_from_file(path)?;
            log::info!("Loaded configuration from {}", path.display());
            return Ok(settings);
        }
        log::warn!("Config file not found: {}, writing defaults", path.display());
        let settings = Self::default();
        settings.save(path)?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(io_err)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.log_level.as_str(), "trace" | "debug" | "info" | "warn" | "error") {
            return Err(ConfigError::invalid(
                "log_level",
                format!("'{}' is not one of trace, debug, info, warn, error", self.log_level),
            ));
        }
        if self.screen.width == 0 || self.screen.height == 0 {
            return Err(ConfigError::invalid("screen", "width and height must be non-zero"));
        }
        if self.adb.command_timeout_ms == 0 {
            return Err(ConfigError::invalid("adb.command_timeout_ms", "must be greater than zero"));
        }
        self.party_quest.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        BotSettings::default().validate().unwrap();
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let json = r#"{ "party_quest": { "variant": "orbis" } }"#;
        let settings: BotSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.party_quest.variant, Variant::Orbis);
        assert_eq!(settings.party_quest.queue_timeout_secs, 30);
        assert_eq!(settings.party_quest.stuck_timeout_secs, 120);
        assert_eq!(settings.party_quest.hard_reset_timeouts_secs, vec![450, 900]);
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.adb.port, 5555);
        assert_eq!(settings.screen.width, 960);
        assert!(settings.party_quest.random_jump);
        assert_eq!(
            settings.party_quest.quest_fallbacks[&Variant::Orbis],
            Variant::Orbis.descriptor().fallback
        );
        settings.validate().unwrap();
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut pq = PartyQuestSettings::default();
        pq.confidence_threshold = 0.0;
        assert!(pq.validate().is_err());

        let mut pq = PartyQuestSettings::default();
        pq.tick_interval_ms = 0;
        assert!(matches!(
            pq.validate(),
            Err(ConfigError::InvalidValue { field: "tick_interval_ms", .. })
        ));

        let mut pq = PartyQuestSettings::default();
        pq.phase_fallbacks.insert(Phase::InQueue, (1.5, 0.2));
        assert!(pq.validate().is_err());
    }

    #[test]
    fn hard_reset_timeouts_escalate_then_repeat() {
        let mut pq = PartyQuestSettings::default();
        assert_eq!(pq.hard_reset_timeout(0), Some(Duration::from_secs(450)));
        assert_eq!(pq.hard_reset_timeout(1), Some(Duration::from_secs(900)));
        assert_eq!(pq.hard_reset_timeout(7), Some(Duration::from_secs(900)));
        pq.hard_reset_timeouts_secs.clear();
        assert_eq!(pq.hard_reset_timeout(0), None);
        pq.hard_reset_timeouts_secs = vec![0];
        assert!(pq.validate().is_err());
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let pq = PartyQuestSettings::default();
        assert_eq!(pq.backoff(1), Duration::from_millis(500));
        assert_eq!(pq.backoff(2), Duration::from_millis(1000));
        assert_eq!(pq.backoff(4), Duration::from_millis(4000));
        assert_eq!(pq.backoff(5), Duration::from_millis(8000));
        assert_eq!(pq.backoff(40), Duration::from_millis(8000));
    }
}
