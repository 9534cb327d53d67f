// package-restore/src/store/savepoint.rs
//! Retrying a statement inside a savepoint so a failed attempt only discards
//! itself and not the enclosing transaction.

use futures::future::BoxFuture;

use crate::errors::{RestoreError, Result};
use crate::store::PackageStore;

/// Savepoint name derived from a node id. Only identifier-safe characters survive.
pub fn savepoint_name(node_id: &str) -> String {
    let mut name: String = node_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    name.push_str("_svpt");
    name
}

/// Result of a successful guarded attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardedOutcome<T> {
    pub value: T,
    /// The candidate that succeeded.
    pub candidate: String,
    pub attempts: usize,
}

/// Tries candidates one after another under one savepoint. An attempt that
/// fails with a retryable error is rolled back to the savepoint and the next
/// candidate is tried; any other error is returned as is.
pub struct GuardedRetry {
    savepoint: String,
    max_attempts: usize,
    retryable: fn(&RestoreError) -> bool,
}

impl GuardedRetry {
    pub fn new(savepoint: String, max_attempts: usize, retryable: fn(&RestoreError) -> bool) -> Self {
        GuardedRetry {
            savepoint,
            max_attempts,
            retryable,
        }
    }

    pub async fn run<S, C, T, F>(
        &self,
        store: &mut S,
        candidates: C,
        mut attempt: F,
    ) -> Result<GuardedOutcome<T>>
    where
        S: PackageStore + ?Sized,
        C: IntoIterator<Item = String>,
        T: Send,
        F: for<'a> FnMut(&'a mut S, &'a str) -> BoxFuture<'a, Result<T>>,
    {
        store.new_savepoint(&self.savepoint).await?;

        let mut candidates = candidates.into_iter().take(self.max_attempts).peekable();
        let mut attempts = 0;
        while let Some(candidate) = candidates.next() {
            attempts += 1;
            match attempt(&mut *store, &candidate).await {
                Ok(value) => {
                    store.release_savepoint(&self.savepoint).await?;
                    return Ok(GuardedOutcome {
                        value,
                        candidate,
                        attempts,
                    });
                }
                Err(err) if (self.retryable)(&err) && candidates.peek().is_some() => {
                    tracing::debug!(
                        savepoint = %self.savepoint,
                        candidate = %candidate,
                        attempts,
                        "attempt failed, rolling back to savepoint"
                    );
                    store.rollback_to_savepoint(&self.savepoint).await?;
                }
                Err(err) => return Err(err),
            }
        }

        Err(RestoreError::RetriesExhausted {
            operation: format!("savepoint {}", self.savepoint),
            remaining: 0,
            attempts: attempts as u32,
        })
    }
}
