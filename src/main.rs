use std::io::BufRead;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::LevelFilter;

use maplehelper::automation::variant::Variant;
use maplehelper::settings::BotSettings;
use maplehelper::tools::party_quest::PartyQuestTool;
use maplehelper::tools::r#trait::Tool;

/// Automates MapleStory Idle party quests on an Android emulator over ADB.
///
/// Set the emulator to 960x540 and enable ADB (Settings > Advanced > Android
/// Debug Bridge) before starting.
#[derive(Parser, Debug)]
#[command(name = "maplehelper", version, about)]
struct Cli {
    /// Settings file; created with defaults when missing.
    #[arg(long, default_value = BotSettings::SETTINGS_FILE)]
    config: PathBuf,

    /// ADB port (BlueStacks uses 5555, 5565, 5575 or 5585).
    #[arg(long)]
    port: Option<u16>,

    /// Party quest to run: sleepywood, ludibrium or orbis.
    #[arg(long)]
    variant: Option<Variant>,

    /// Directory holding the reference images.
    #[arg(long)]
    templates: Option<PathBuf>,

    /// Verbose logging.
    #[arg(long)]
    debug: bool,

    /// Write the settings file and exit.
    #[arg(long)]
    create_config: bool,
}

/// Console commands read from stdin.
enum Command {
    Stop,
    Pause,
    Resume,
}

fn parse_command(line: &str) -> Option<Command> {
    match line.trim() {
        "" | "q" => Some(Command::Stop),
        "p" => Some(Command::Pause),
        "r" => Some(Command::Resume),
        _ => None,
    }
}

/// Forwards console commands until stdin closes. A closed stdin (service,
/// `nohup`, `</dev/null`) leaves the session running.
fn read_commands(tx: mpsc::Sender<Command>) {
    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => {
                log::info!("stdin closed; stop the process to end the session");
                return;
            }
            Ok(_) => match parse_command(&line) {
                Some(command) => {
                    if tx.send(command).is_err() {
                        return;
                    }
                }
                None => log::warn!("Unknown command '{}' (Enter or q: stop, p: pause, r: resume)", line.trim()),
            },
            Err(e) => {
                log::warn!("Could not read stdin: {}", e);
                return;
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The level is only known once settings are loaded; until then RUST_LOG
    // or the command line decides.
    let env_filter = std::env::var_os(env_logger::DEFAULT_FILTER_ENV).is_some();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace"))
        .format_timestamp_secs()
        .init();
    if !env_filter {
        log::set_max_level(if cli.debug { LevelFilter::Debug } else { LevelFilter::Info });
    }

    let mut settings = BotSettings::load_or_create(&cli.config)
        .with_context(|| format!("failed to load settings from {}", cli.config.display()))?;
    if let Some(port) = cli.port {
        settings.adb.port = port;
    }
    if let Some(variant) = cli.variant {
        settings.party_quest.variant = variant;
    }
    if let Some(dir) = cli.templates {
        settings.templates_dir = dir;
    }
    if cli.debug {
        settings.log_level = "debug".to_string();
    }

    settings.validate().context("invalid settings")?;
    if !env_filter {
        if let Ok(level) = settings.log_level.parse::<LevelFilter>() {
            log::set_max_level(level);
        }
    }

    if cli.create_config {
        settings
            .save(&cli.config)
            .with_context(|| format!("failed to write {}", cli.config.display()))?;
        println!("Wrote {}", cli.config.display());
        return Ok(());
    }

    let mut tool = PartyQuestTool::new();
    tool.start(&settings).context("could not start the session")?;
    log::info!(
        "Running {} party quest. Enter or q: stop, p: pause, r: resume.",
        settings.party_quest.variant
    );

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || read_commands(tx));

    while tool.is_running() {
        match rx.try_recv() {
            Ok(Command::Stop) => {
                log::info!("Stopping at the next tick...");
                tool.stop();
            }
            Ok(Command::Pause) => tool.pause(),
            Ok(Command::Resume) => tool.resume(),
            Err(_) => {}
        }
        thread::sleep(Duration::from_millis(200));
    }

    let status = tool.wait();
    println!("{}", tool.get_status());
    println!(
        "Runs: {}  Queue timeouts: {}  Recoveries: {}  Restarts: {}  Hard resets: {}  Connection losses: {}",
        status.stats.pq_runs,
        status.stats.queue_timeouts,
        status.stats.recoveries,
        status.stats.restarts,
        status.stats.hard_resets,
        status.stats.connection_losses
    );
    match status.outcome {
        Some(maplehelper::automation::state::SessionOutcome::Failed(reason)) => {
            anyhow::bail!("session failed: {}", reason)
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_commands() {
        assert!(matches!(parse_command("\n"), Some(Command::Stop)));
        assert!(matches!(parse_command("q\n"), Some(Command::Stop)));
        assert!(matches!(parse_command(" p "), Some(Command::Pause)));
        assert!(matches!(parse_command("r"), Some(Command::Resume)));
        assert!(parse_command("x").is_none());
    }
}
