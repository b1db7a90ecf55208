//! Dispatch configuration.
//!
//! Everything a dispatch run needs is carried by [`DispatchConfig`], handed to
//! the [`Coordinator`](crate::Coordinator) and passed down to every worker and
//! session. Nothing is read from process-wide state.

use std::fmt;

use serde::Deserialize;

/// Default upper bound on messages held in memory across all workers.
pub const DEFAULT_MEMORY_CEILING: u64 = 10_000;

/// Default number of retry passes driven by
/// [`Coordinator::run_with_retry`](crate::Coordinator::run_with_retry).
pub const DEFAULT_MAX_RETRY_PASSES: u32 = 3;

/// Credentials used to authenticate transport sessions.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// What the coordinator does when a worker hits a store failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreErrorPolicy {
    /// Stop the other workers at their next fetch and fail the run.
    #[default]
    Abort,
    /// Let the other workers drain the queue and report the error.
    FinishOthers,
}

/// Configuration of a dispatch run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub memory_ceiling: u64,
    pub credentials: Credentials,
    pub max_retry_passes: u32,
    pub requeue_failed: bool,
    pub store_error_policy: StoreErrorPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            memory_ceiling: DEFAULT_MEMORY_CEILING,
            credentials: Credentials::default(),
            max_retry_passes: DEFAULT_MAX_RETRY_PASSES,
            requeue_failed: false,
            store_error_policy: StoreErrorPolicy::Abort,
        }
    }
}

impl DispatchConfig {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            ..Self::default()
        }
    }

    /// Bound the number of messages in memory across all workers.
    ///
    /// A ceiling of zero is treated as one.
    pub fn with_memory_ceiling(mut self, ceiling: u64) -> Self {
        self.memory_ceiling = ceiling.max(1);
        self
    }

    pub fn with_max_retry_passes(mut self, passes: u32) -> Self {
        self.max_retry_passes = passes;
        self
    }

    /// Move `Failed` messages back to `Pending` before every retry pass.
    pub fn with_requeue_failed(mut self, requeue: bool) -> Self {
        self.requeue_failed = requeue;
        self
    }

    pub fn with_store_error_policy(mut self, policy: StoreErrorPolicy) -> Self {
        self.store_error_policy = policy;
        self
    }

    pub(crate) fn ceiling(&self) -> u64 {
        self.memory_ceiling.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_debug_hides_password() {
        let credentials = Credentials::new("user", "hunter2");
        let debug = format!("{credentials:?}");

        assert!(debug.contains("user"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn partial_config_falls_back_to_defaults() {
        let config: DispatchConfig = serde_json::from_str(
            r#"{
                "credentials": { "username": "u", "password": "p" },
                "store_error_policy": "finish_others"
            }"#,
        )
        .unwrap();

        assert_eq!(config.memory_ceiling, DEFAULT_MEMORY_CEILING);
        assert_eq!(config.max_retry_passes, DEFAULT_MAX_RETRY_PASSES);
        assert_eq!(config.credentials, Credentials::new("u", "p"));
        assert_eq!(config.store_error_policy, StoreErrorPolicy::FinishOthers);
        assert!(!config.requeue_failed);
    }

    #[test]
    fn zero_ceiling_is_clamped() {
        let config = DispatchConfig::default().with_memory_ceiling(0);
        assert_eq!(config.ceiling(), 1);
    }
}
