pub mod catalog;
pub mod context;
pub mod controller;
pub mod detection;
pub mod interaction;
pub mod recovery;
pub mod state;
pub mod variant;
