use crate::automation::interaction::ActionTranslator;
use crate::device::adb::AdbController;
use crate::device::coords::ScreenSize;
use crate::device::input::{AdbInput, TouchInput};
use crate::device::screen_capture::{AdbScreenCapture, ScreenSource};
use crate::settings::BotSettings;

/// Collaborators one session drives: where frames come from, where taps go,
/// and the translator that turns detections into taps.
pub struct AutomationContext<S, I> {
    pub source: S,
    pub input: I,
    pub translator: ActionTranslator,
}

impl<S: ScreenSource, I: TouchInput> AutomationContext<S, I> {
    pub fn new(source: S, input: I, translator: ActionTranslator) -> Self {
        Self {
            source,
            input,
            translator,
        }
    }
}

impl AutomationContext<AdbScreenCapture, AdbInput> {
    /// Capture and input over one adb connection.
    pub fn over_adb(adb: AdbController, settings: &BotSettings) -> Self {
        let screen = ScreenSize::new(settings.screen.width, settings.screen.height);
        Self::new(
            AdbScreenCapture::new(adb.clone(), screen),
            AdbInput::new(adb),
            ActionTranslator::new(settings.party_quest.tap_jitter_px, screen),
        )
    }
}
