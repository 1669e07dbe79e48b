pub mod adb;
pub mod coords;
pub mod input;
pub mod screen_capture;
