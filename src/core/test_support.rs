//! In-memory target for unit tests.

use crate::core::target::{SetPasswordOutcome, TargetError, TargetSystem};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct State {
    passwords: HashMap<String, String>,
    history: HashMap<String, Vec<String>>,
    reject_reuse: bool,
    fail_set: bool,
    fail_login: bool,
    lose_set_response: bool,
    set_calls: usize,
}

#[derive(Default)]
pub struct FakeTarget {
    state: Mutex<State>,
}

impl FakeTarget {
    pub fn with_user(username: &str, password: &str) -> Self {
        let target = Self::default();
        {
            let mut state = target.state.lock().unwrap();
            state.passwords.insert(username.into(), password.into());
            state
                .history
                .insert(username.into(), vec![password.to_string()]);
        }
        target
    }

    pub fn password_of(&self, username: &str) -> Option<String> {
        self.state.lock().unwrap().passwords.get(username).cloned()
    }

    pub fn set_calls(&self) -> usize {
        self.state.lock().unwrap().set_calls
    }

    /// Behave like Snowflake's PRIOR USE check.
    pub fn reject_reuse(&self, on: bool) {
        self.state.lock().unwrap().reject_reuse = on;
    }

    pub fn fail_set(&self, on: bool) {
        self.state.lock().unwrap().fail_set = on;
    }

    pub fn fail_login(&self, on: bool) {
        self.state.lock().unwrap().fail_login = on;
    }

    /// Apply the next password change, then answer with a protocol error.
    pub fn lose_next_set_response(&self) {
        self.state.lock().unwrap().lose_set_response = true;
    }
}

#[async_trait]
impl TargetSystem for FakeTarget {
    fn describe(&self) -> String {
        "fake".into()
    }

    async fn set_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<SetPasswordOutcome, TargetError> {
        let mut state = self.state.lock().unwrap();
        state.set_calls += 1;
        if state.fail_set {
            return Err(TargetError::Statement {
                code: Some(2003),
                message: "insufficient privileges".into(),
            });
        }
        let used = state
            .history
            .get(username)
            .is_some_and(|h| h.iter().any(|p| p == password));
        if state.reject_reuse && used {
            return Ok(SetPasswordOutcome::AlreadyUsed);
        }
        state.passwords.insert(username.into(), password.into());
        state
            .history
            .entry(username.into())
            .or_default()
            .push(password.into());
        if std::mem::take(&mut state.lose_set_response) {
            return Err(TargetError::Protocol("connection reset after commit".into()));
        }
        Ok(SetPasswordOutcome::Applied)
    }

    async fn verify_login(&self, username: &str, password: &str) -> Result<(), TargetError> {
        let state = self.state.lock().unwrap();
        if state.fail_login || state.passwords.get(username).map(String::as_str) != Some(password) {
            return Err(TargetError::AuthenticationFailed {
                user: username.into(),
                message: "Incorrect username or password was specified.".into(),
            });
        }
        Ok(())
    }
}
