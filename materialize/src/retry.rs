//! Explicit retry policy for chunk-level work.
//!
//! A chunk either runs to completion or is retried as a whole; there is no
//! intra-chunk recovery. The policy returns a typed outcome so the
//! orchestrator can distinguish exhausted retries from permanent failures
//! without unwinding.

use std::{future::Future, time::Duration};

/// Bounded retry with a fixed backoff between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            backoff: Duration::from_secs(3),
        }
    }
}

/// The terminal state of a retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Success(T),
    /// The error was retryable but the attempt budget ran out.
    Exhausted { attempts: u32, error: E },
    /// The error was not worth retrying.
    Fatal(E),
}

impl<T, E> RetryOutcome<T, E> {
    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Success(_))
    }
}

impl RetryPolicy {
    /// Runs `op` until success, a non-retryable error, or attempt exhaustion.
    pub async fn run<T, E, F, Fut>(
        &self,
        mut op: F,
        is_retryable: impl Fn(&E) -> bool,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(value) => return RetryOutcome::Success(value),
                Err(error) if !is_retryable(&error) => return RetryOutcome::Fatal(error),
                Err(error) if attempt >= self.max_attempts => {
                    return RetryOutcome::Exhausted {
                        attempts: attempt,
                        error,
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %error,
                        "Chunk attempt failed. Retrying in {:.1}s",
                        self.backoff.as_secs_f32()
                    );
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        //* Given
        let attempts = AtomicU32::new(0);

        //* When
        let outcome = fast_policy(5)
            .run(
                || async {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("transient")
                    } else {
                        Ok(42)
                    }
                },
                |_| true,
            )
            .await;

        //* Then
        assert!(matches!(outcome, RetryOutcome::Success(42)));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let attempts = AtomicU32::new(0);

        let outcome = fast_policy(3)
            .run(
                || async {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("transient")
                },
                |_| true,
            )
            .await;

        assert!(matches!(
            outcome,
            RetryOutcome::Exhausted {
                attempts: 3,
                error: "transient"
            }
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);

        let outcome = fast_policy(5)
            .run(
                || async {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("fatal")
                },
                |_| false,
            )
            .await;

        assert!(matches!(outcome, RetryOutcome::Fatal("fatal")));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
