//! MapleStory Idle party quest automation over ADB.
//!
//! A [`Controller`](automation::controller::Controller) runs the party quest
//! state machine one tick at a time: capture a frame, match the references the
//! current phase cares about, tap at most once, then transition. Matching is
//! region-aware so look-alike quest cards in neighbouring columns are never
//! mistaken for each other.

pub mod automation;
pub mod device;
pub mod error;
pub mod settings;
pub mod tools;

#[cfg(test)]
mod test_support;
