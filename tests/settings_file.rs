use std::fs;

use maplehelper::automation::state::Phase;
use maplehelper::automation::variant::Variant;
use maplehelper::error::ConfigError;
use maplehelper::settings::BotSettings;

#[test]
fn missing_file_is_created_with_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config").join(BotSettings::SETTINGS_FILE);

    let settings = BotSettings::load_or_create(&path).unwrap();
    assert!(path.exists());
    assert_eq!(settings.party_quest.queue_timeout_secs, 30);

    let reloaded = BotSettings::load_from_file(&path).unwrap();
    assert_eq!(reloaded.adb.port, settings.adb.port);
    assert_eq!(reloaded.party_quest.variant, Variant::Sleepywood);
    assert_eq!(
        reloaded.party_quest.phase_fallbacks.get(&Phase::CancelingQueue),
        settings.party_quest.phase_fallbacks.get(&Phase::CancelingQueue)
    );
}

#[test]
fn saved_changes_survive_a_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(BotSettings::SETTINGS_FILE);
    let mut settings = BotSettings::default();
    settings.party_quest.variant = Variant::Ludibrium;
    settings.party_quest.max_runs = Some(20);
    settings.adb.port = 5565;
    settings.save(&path).unwrap();

    let reloaded = BotSettings::load_or_create(&path).unwrap();
    assert_eq!(reloaded.party_quest.variant, Variant::Ludibrium);
    assert_eq!(reloaded.party_quest.max_runs, Some(20));
    assert_eq!(reloaded.adb.port, 5565);
    reloaded.validate().unwrap();
}

#[test]
fn malformed_file_is_reported_not_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(BotSettings::SETTINGS_FILE);
    fs::write(&path, "{ \"adb\": ").unwrap();
    assert!(matches!(BotSettings::load_or_create(&path), Err(ConfigError::Parse { .. })));
    assert_eq!(fs::read_to_string(&path).unwrap(), "{ \"adb\": ");
}

#[test]
fn out_of_range_threshold_fails_validation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(BotSettings::SETTINGS_FILE);
    let mut settings = BotSettings::default();
    settings.party_quest.confidence_threshold = 1.5;
    settings.save(&path).unwrap();
    let loaded = BotSettings::load_from_file(&path).unwrap();
    assert!(matches!(
        loaded.validate(),
        Err(ConfigError::InvalidValue { field: "confidence_threshold", .. })
    ));
}
