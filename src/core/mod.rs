//! Rotation logic and its collaborators.

pub mod audit_log;
pub mod file_lock;
pub mod handler;
pub mod password;
pub mod rotation;
pub mod runtime;
pub mod secret_store;
pub mod settings;
pub mod target;

#[cfg(test)]
pub(crate) mod test_support;
