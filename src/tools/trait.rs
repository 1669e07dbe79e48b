// Shared trait for all automation tools
use crate::error::StartError;
use crate::settings::BotSettings;

/// Common interface that all tools must implement
pub trait Tool {
    /// Start the tool with the given settings
    fn start(&mut self, settings: &BotSettings) -> Result<(), StartError>;

    /// Stop the tool at its next tick boundary
    fn stop(&mut self);

    /// Hold the tool between ticks; timers do not run while paused
    fn pause(&mut self);

    /// Continue after [`Tool::pause`]
    fn resume(&mut self);

    /// Check if the tool is currently paused
    fn is_paused(&self) -> bool;

    /// Check if the tool is currently running
    fn is_running(&self) -> bool;

    /// Get current status message
    fn get_status(&self) -> String;

    /// Get tool name for display
    fn get_name(&self) -> &str;
}
