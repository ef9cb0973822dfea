pub mod config;
pub mod event;
pub mod sequence;
pub mod tempo;
