//! Authentication decisions for the fake SSH server
//!
//! The handshake collaborator asks an [`AuthObserver`] what to do with every
//! attempt. The only implementation here records the attempt and refuses it.

use std::sync::{Arc, Mutex};

use crate::db::CredentialAttempt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Reject,
}

pub trait AuthObserver: Send + Sync {
    /// See one password attempt and decide its outcome.
    fn observe_password(&self, username: &str, password: &str) -> AuthDecision;

    /// Public keys are never recorded.
    fn observe_public_key(&self, _username: &str) -> AuthDecision {
        AuthDecision::Reject
    }
}

/// Keeps every password attempt of one session in arrival order
#[derive(Debug, Clone, Default)]
pub struct CredentialRecorder {
    attempts: Arc<Mutex<Vec<CredentialAttempt>>>,
}

impl CredentialRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far
    pub fn snapshot(&self) -> Vec<CredentialAttempt> {
        match self.attempts.lock() {
            Ok(attempts) => attempts.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self.attempts.lock() {
            Ok(attempts) => attempts.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuthObserver for CredentialRecorder {
    fn observe_password(&self, username: &str, password: &str) -> AuthDecision {
        let attempt = CredentialAttempt::new(username, password);
        match self.attempts.lock() {
            Ok(mut attempts) => attempts.push(attempt),
            Err(poisoned) => poisoned.into_inner().push(attempt),
        }
        AuthDecision::Reject
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_password_is_rejected_and_recorded_in_order() {
        let recorder = CredentialRecorder::new();
        let attempts = [("root", "toor"), ("admin", ""), ("root", "päss\u{0}word"), ("", "x")];

        for (user, pass) in attempts {
            assert_eq!(recorder.observe_password(user, pass), AuthDecision::Reject);
        }

        let recorded = recorder.snapshot();
        assert_eq!(recorded.len(), 4);
        for ((user, pass), attempt) in attempts.iter().zip(&recorded) {
            assert_eq!(attempt.username, *user);
            assert_eq!(attempt.password, *pass);
        }
    }

    #[test]
    fn test_public_keys_are_rejected_without_recording() {
        let recorder = CredentialRecorder::new();
        assert_eq!(recorder.observe_public_key("git"), AuthDecision::Reject);
        assert!(recorder.is_empty());
    }

    #[test]
    fn test_clones_share_one_list() {
        let recorder = CredentialRecorder::new();
        let handle = recorder.clone();
        handle.observe_password("user", "pass");
        assert_eq!(recorder.len(), 1);
    }
}
