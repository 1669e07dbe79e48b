use crate::device::adb::AdbController;
use crate::error::DispatchError;

/// Android hardware keys the bot needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKey {
    Home,
    Back,
    AppSwitch,
}

impl DeviceKey {
    pub fn keycode(self) -> u32 {
        match self {
            DeviceKey::Home => 3,
            DeviceKey::Back => 4,
            DeviceKey::AppSwitch => 187,
        }
    }
}

/// Delivers touches to the device. Coordinates arrive already jittered and clamped.
pub trait TouchInput {
    fn tap(&mut self, x: u32, y: u32) -> Result<(), DispatchError>;
    fn press_key(&mut self, key: DeviceKey) -> Result<(), DispatchError>;
    /// Kills an app package outright; used when backing out is not enough.
    fn force_stop(&mut self, package: &str) -> Result<(), DispatchError>;
}

/// Touch input through `adb shell input`.
pub struct AdbInput {
    adb: AdbController,
}

impl AdbInput {
    pub fn new(adb: AdbController) -> Self {
        Self { adb }
    }
}

impl TouchInput for AdbInput {
    fn tap(&mut self, x: u32, y: u32) -> Result<(), DispatchError> {
        Ok(self.adb.tap(x, y)?)
    }

    fn press_key(&mut self, key: DeviceKey) -> Result<(), DispatchError> {
        log::debug!("Key event {:?}", key);
        Ok(self.adb.key_event(key.keycode())?)
    }

    fn force_stop(&mut self, package: &str) -> Result<(), DispatchError> {
        Ok(self.adb.force_stop(package)?)
    }
}
