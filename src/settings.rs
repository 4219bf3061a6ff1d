use crate::prelude::*;

use crate::execution::Phase;
use std::time::Duration;

/// Called after each committed batch when a progress sink is configured.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub phase: Phase,
    pub batch_index: usize,
    pub resources_done: i64,
    pub total_hint: Option<usize>,
}

pub type ProgressFn = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Engine configuration. Constructed directly or parsed from JSON, where
/// unrecognized keys fail fast.
#[derive(Clone)]
pub struct EngineOptions {
    /// Worker-pool execution. `false` forces one worker with batch size 1,
    /// the only mode that preserves iterator order in the committed graph.
    pub parallel: bool,
    pub workers: usize,
    pub batch_size: usize,
    pub transaction_timeout: Duration,
    pub retry_max: u32,
    pub retry_backoff_ms: u64,
    pub progress: Option<ProgressFn>,
}

impl std::fmt::Debug for EngineOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineOptions")
            .field("parallel", &self.parallel)
            .field("workers", &self.workers)
            .field("batch_size", &self.batch_size)
            .field("transaction_timeout", &self.transaction_timeout)
            .field("retry_max", &self.retry_max)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(2))
        .unwrap_or(1)
        .max(1)
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            parallel: true,
            workers: default_workers(),
            batch_size: 5000,
            transaction_timeout: Duration::from_secs(30),
            retry_max: 5,
            retry_backoff_ms: 100,
            progress: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawOptions {
    parallel: bool,
    workers: usize,
    batch_size: usize,
    transaction_timeout_ms: u64,
    retry_max: u32,
    retry_backoff_ms: u64,
}

impl Default for RawOptions {
    fn default() -> Self {
        let options = EngineOptions::default();
        Self {
            parallel: options.parallel,
            workers: options.workers,
            batch_size: options.batch_size,
            transaction_timeout_ms: options.transaction_timeout.as_millis() as u64,
            retry_max: options.retry_max,
            retry_backoff_ms: options.retry_backoff_ms,
        }
    }
}

impl EngineOptions {
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let raw: RawOptions =
            serde_json::from_value(value).map_err(|e| Error::config(e.to_string()))?;
        let options = Self {
            parallel: raw.parallel,
            workers: raw.workers,
            batch_size: raw.batch_size,
            transaction_timeout: Duration::from_millis(raw.transaction_timeout_ms),
            retry_max: raw.retry_max,
            retry_backoff_ms: raw.retry_backoff_ms,
            progress: None,
        };
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be at least 1"));
        }
        Ok(())
    }

    pub fn effective_workers(&self) -> usize {
        if self.parallel { self.workers } else { 1 }
    }

    pub fn effective_batch_size(&self) -> usize {
        if self.parallel { self.batch_size } else { 1 }
    }

    pub fn retry_options(&self) -> crate::utils::retryable::RetryOptions {
        crate::utils::retryable::RetryOptions {
            max_retries: self.retry_max,
            initial_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_backoff: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_sane() {
        let options = EngineOptions::default();
        assert!(options.parallel);
        assert!(options.workers >= 1);
        assert_eq!(options.batch_size, 5000);
        options.validate().unwrap();
    }

    #[test]
    fn serialized_mode_forces_single_worker() {
        let options = EngineOptions {
            parallel: false,
            workers: 8,
            batch_size: 5000,
            ..Default::default()
        };
        assert_eq!(options.effective_workers(), 1);
        assert_eq!(options.effective_batch_size(), 1);
    }

    #[test]
    fn from_json_accepts_known_keys() {
        let options = EngineOptions::from_json(json!({
            "parallel": false,
            "batch_size": 10,
            "retry_max": 2,
        }))
        .unwrap();
        assert!(!options.parallel);
        assert_eq!(options.batch_size, 10);
        assert_eq!(options.retry_max, 2);
    }

    #[test]
    fn from_json_rejects_unknown_keys() {
        let err = EngineOptions::from_json(json!({"batch_szie": 10})).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = EngineOptions::from_json(json!({"workers": 0})).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = EngineOptions::from_json(json!({"batch_size": 0})).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
