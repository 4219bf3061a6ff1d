pub mod retryable;
