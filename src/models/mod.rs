//! Data structures shared across the crate.

pub mod config;
pub mod event;
pub mod secret;
