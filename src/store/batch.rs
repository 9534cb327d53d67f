// package-restore/src/store/batch.rs
//! Provider batch calls split at the provider's item limit, with unprocessed
//! items resubmitted after a jittered linear backoff.

use async_trait::async_trait;

use crate::config::RetryConfig;
use crate::errors::{RestoreError, Result};

/// Outcome of one provider request.
#[derive(Debug)]
pub struct BatchAttempt<I, O> {
    pub output: O,
    /// Items the provider accepted but did not get to; they are resubmitted.
    pub unprocessed: Vec<I>,
}

impl<I, O> BatchAttempt<I, O> {
    pub fn done(output: O) -> Self {
        BatchAttempt {
            output,
            unprocessed: Vec::new(),
        }
    }
}

#[async_trait]
pub trait BatchOperation: Send + Sync {
    type Item: Send + 'static;
    type Output: Send + 'static;

    fn name(&self) -> &str;

    /// Maximum number of items per provider request.
    fn limit(&self) -> usize;

    async fn submit(&self, items: Vec<Self::Item>)
    -> Result<BatchAttempt<Self::Item, Self::Output>>;
}

/// Submits `items` in chunks of at most `op.limit()`, one chunk at a time, and
/// collects the output of every request. A request error aborts the whole run.
pub async fn run_chunked<Op>(
    op: &Op,
    mut items: Vec<Op::Item>,
    retry: &RetryConfig,
) -> Result<Vec<Op::Output>>
where
    Op: BatchOperation + ?Sized,
{
    let limit = op.limit().max(1);
    let mut outputs = Vec::new();
    while !items.is_empty() {
        let rest = if items.len() > limit {
            items.split_off(limit)
        } else {
            Vec::new()
        };
        let chunk = std::mem::replace(&mut items, rest);
        outputs.extend(drain_chunk(op, chunk, retry).await?);
    }
    Ok(outputs)
}

async fn drain_chunk<Op>(
    op: &Op,
    mut pending: Vec<Op::Item>,
    retry: &RetryConfig,
) -> Result<Vec<Op::Output>>
where
    Op: BatchOperation + ?Sized,
{
    let mut outputs = Vec::new();
    let mut retry_count: u32 = 0;
    loop {
        let attempt = op.submit(pending).await?;
        outputs.push(attempt.output);
        pending = attempt.unprocessed;
        if pending.is_empty() {
            return Ok(outputs);
        }

        retry_count += 1;
        if retry_count > retry.max_attempts {
            return Err(RestoreError::RetriesExhausted {
                operation: op.name().to_string(),
                remaining: pending.len(),
                attempts: retry.max_attempts,
            });
        }
        let delay = retry.delay(retry_count);
        tracing::warn!(
            operation = op.name(),
            remaining = pending.len(),
            retry_count,
            delay_ms = delay.as_millis() as u64,
            "provider left items unprocessed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
