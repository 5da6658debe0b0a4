//! Snowflake password rotation for AWS Secrets Manager.
//!
//! Runs the four-step rotation protocol (create, set, test, finish) against a
//! secret store and a Snowflake account, either as the packaged function behind
//! the Secrets Manager scheduler or from the command line.
//!
//! ## Modules
//! - `cli`: Command-line handlers
//! - `core`: Rotation, secret stores, Snowflake target, runtime client, audit
//! - `models`: Events, secrets, configuration
//! - `util`: Filesystem and logging helpers

pub mod cli;
pub mod constants;
pub mod core;
pub mod models;
pub mod util;
