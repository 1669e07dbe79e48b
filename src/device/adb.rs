use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use regex::Regex;
use wait_timeout::ChildExt;

use crate::error::AdbError;

/// Emulator-bundled adb builds, tried before `adb` on PATH.
const KNOWN_ADB_PATHS: [&str; 4] = [
    r"C:\Program Files\BlueStacks_nxt\HD-Adb.exe",
    r"C:\Program Files (x86)\BlueStacks_nxt\HD-Adb.exe",
    r"C:\Program Files\BlueStacks\HD-Adb.exe",
    r"C:\Program Files (x86)\BlueStacks\HD-Adb.exe",
];

const SCREENCAP_TIMEOUT: Duration = Duration::from_secs(10);

/// Thin wrapper over the adb executable for one device address.
#[derive(Debug, Clone)]
pub struct AdbController {
    adb_path: PathBuf,
    address: String,
    command_timeout: Duration,
}

impl AdbController {
    pub fn new(adb_path: Option<&Path>, host: &str, port: u16, command_timeout: Duration) -> Self {
        Self {
            adb_path: locate_adb(adb_path),
            address: format!("{}:{}", host, port),
            command_timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Starts the adb server and connects to the device. A device that is
    /// already listed as ready is left alone.
    pub fn connect(&self) -> Result<(), AdbError> {
        let _ = self.run(&["start-server"], self.command_timeout);
        if self.is_connected() {
            log::debug!("{} already connected", self.address);
            return Ok(());
        }
        log::info!("Connecting to {}...", self.address);
        let output = self.run(&["connect", &self.address], self.command_timeout)?;
        let text = String::from_utf8_lossy(&output).to_lowercase();
        // adb exits 0 even when the connection was refused
        if text.contains("connected") && !text.contains("cannot") && !text.contains("failed") {
            log::info!("Connected to {}", self.address);
            Ok(())
        } else {
            Err(AdbError::Failed {
                command: "connect".to_string(),
                stderr: text.trim().to_string(),
            })
        }
    }

    fn is_connected(&self) -> bool {
        match self.run(&["devices"], self.command_timeout) {
            Ok(output) => parse_device_list(&String::from_utf8_lossy(&output), &self.address),
            Err(_) => false,
        }
    }

    pub fn screen_resolution(&self) -> Result<(u32, u32), AdbError> {
        let text = self.shell(&["wm", "size"])?;
        parse_wm_size(&text).ok_or(AdbError::Unexpected(text))
    }

    /// Raw PNG bytes of the current screen.
    pub fn screencap(&self) -> Result<Vec<u8>, AdbError> {
        let timeout = self.command_timeout.max(SCREENCAP_TIMEOUT);
        let png = self.device(&["exec-out", "screencap", "-p"], timeout)?;
        if png.is_empty() {
            return Err(AdbError::Unexpected("empty screenshot".to_string()));
        }
        Ok(png)
    }

    pub fn tap(&self, x: u32, y: u32) -> Result<(), AdbError> {
        self.shell(&["input", "tap", &x.to_string(), &y.to_string()])?;
        log::debug!("Tap at ({}, {})", x, y);
        Ok(())
    }

    pub fn key_event(&self, keycode: u32) -> Result<(), AdbError> {
        self.shell(&["input", "keyevent", &keycode.to_string()])?;
        Ok(())
    }

    pub fn shell(&self, args: &[&str]) -> Result<String, AdbError> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        let output = self.device(&full, self.command_timeout)?;
        Ok(String::from_utf8_lossy(&output).trim().to_string())
    }

    pub fn force_stop(&self, package: &str) -> Result<(), AdbError> {
        self.shell(&["am", "force-stop", package])?;
        log::info!("Force-stopped {}", package);
        Ok(())
    }

    fn device(&self, args: &[&str], timeout: Duration) -> Result<Vec<u8>, AdbError> {
        let mut full = vec!["-s", self.address.as_str()];
        full.extend_from_slice(args);
        self.run(&full, timeout)
    }

    fn run(&self, args: &[&str], timeout: Duration) -> Result<Vec<u8>, AdbError> {
        let command = args.join(" ");
        let mut child = Command::new(&self.adb_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| AdbError::Launch {
                program: self.adb_path.display().to_string(),
                source,
            })?;

        // Drain the pipes while waiting; a screenshot overflows the pipe buffer.
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = match child.wait_timeout(timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(AdbError::Timeout { command, timeout });
            }
            Err(source) => {
                let _ = child.kill();
                return Err(AdbError::Launch {
                    program: self.adb_path.display().to_string(),
                    source,
                });
            }
        };

        let out = stdout.and_then(|h| h.join().ok()).unwrap_or_default();
        if status.success() {
            Ok(out)
        } else {
            let err = stderr.and_then(|h| h.join().ok()).unwrap_or_default();
            Err(AdbError::Failed {
                command,
                stderr: String::from_utf8_lossy(&err).trim().to_string(),
            })
        }
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn locate_adb(configured: Option<&Path>) -> PathBuf {
    if let Some(path) = configured {
        return path.to_path_buf();
    }
    KNOWN_ADB_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .unwrap_or_else(|| PathBuf::from("adb"))
}

/// Parses `wm size` output, preferring an override over the physical size.
pub fn parse_wm_size(output: &str) -> Option<(u32, u32)> {
    let re = Regex::new(r"(?m)^\s*(Physical|Override) size:\s*(\d+)x(\d+)").ok()?;
    let mut physical = None;
    for caps in re.captures_iter(output) {
        let size = (caps[2].parse().ok()?, caps[3].parse().ok()?);
        if &caps[1] == "Override" {
            return Some(size);
        }
        physical = Some(size);
    }
    physical
}

fn parse_device_list(output: &str, address: &str) -> bool {
    output
        .lines()
        .skip(1)
        .filter_map(|line| line.split_once('\t'))
        .any(|(serial, state)| serial.trim() == address && state.trim() == "device")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wm_size_prefers_override() {
        assert_eq!(parse_wm_size("Physical size: 960x540\n"), Some((960, 540)));
        assert_eq!(
            parse_wm_size("Physical size: 1920x1080\nOverride size: 960x540\n"),
            Some((960, 540))
        );
        assert_eq!(parse_wm_size("error: no devices"), None);
    }

    #[test]
    fn device_list_requires_ready_state() {
        let out = "List of devices attached\n127.0.0.1:5555\tdevice\n127.0.0.1:5565\toffline\n";
        assert!(parse_device_list(out, "127.0.0.1:5555"));
        assert!(!parse_device_list(out, "127.0.0.1:5565"));
        assert!(!parse_device_list(out, "127.0.0.1:5575"));
    }

    #[test]
    fn configured_path_wins() {
        let path = Path::new("/opt/platform-tools/adb");
        assert_eq!(locate_adb(Some(path)), path);
    }

    #[test]
    fn adb_failures_map_to_collaborator_errors() {
        use crate::error::{CaptureError, DispatchError};
        let timeout = AdbError::Timeout {
            command: "exec-out screencap -p".to_string(),
            timeout: Duration::from_secs(10),
        };
        assert!(CaptureError::from(timeout).is_connection_loss());
        let rejected = AdbError::Failed {
            command: "shell input tap".to_string(),
            stderr: "bad coordinates".to_string(),
        };
        assert!(matches!(DispatchError::from(rejected), DispatchError::Rejected(_)));
    }
}
