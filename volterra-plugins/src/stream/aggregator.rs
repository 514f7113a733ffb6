//! Incremental aggregation of a plugin's streamed output

use super::codec::StreamDecodeError;
use super::merge::{merge_chunked_value, strip_arrays};
use crate::common::json_path::lookup_path;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What to collect from each message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationOptions {
    /// Dot-path selecting the part of each message that is data
    pub iterable_key: Option<String>,
    pub collect_data: bool,
    pub collect_metadata: bool,
}

impl Default for AggregationOptions {
    fn default() -> Self {
        Self {
            iterable_key: None,
            collect_data: true,
            collect_metadata: true,
        }
    }
}

impl AggregationOptions {
    pub fn with_iterable_key(mut self, key: impl Into<String>) -> Self {
        self.iterable_key = Some(key.into());
        self
    }

    pub fn data_only(mut self) -> Self {
        self.collect_metadata = false;
        self
    }
}

/// The merged result of a stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationState {
    pub data: Value,
    pub metadata: Value,
    pub count: u64,
}

/// Live counters of an aggregation in progress, readable from other tasks
#[derive(Debug, Default)]
pub struct AggregationProgress {
    chunks: AtomicU64,
    count: AtomicU64,
}

/// Point-in-time copy of [`AggregationProgress`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Messages merged so far
    pub chunks: u64,
    /// Items counted so far
    pub count: u64,
}

impl AggregationProgress {
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            chunks: self.chunks.load(Ordering::Relaxed),
            count: self.count.load(Ordering::Relaxed),
        }
    }

    fn record(&self, chunks: u64, count: u64) {
        self.chunks.store(chunks, Ordering::Relaxed);
        self.count.store(count, Ordering::Relaxed);
    }
}

/// How a call to [`ChunkAggregator::consume`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// The stream ended
    Finished,
    /// The token was cancelled before the stream ended
    Stopped,
}

/// Merges decoded messages into data, metadata and a running count
#[derive(Debug, Default)]
pub struct ChunkAggregator {
    options: AggregationOptions,
    state: AggregationState,
    chunks: u64,
    progress: Option<Arc<AggregationProgress>>,
}

impl ChunkAggregator {
    pub fn new(options: AggregationOptions) -> Self {
        Self {
            options,
            ..Default::default()
        }
    }

    /// Publish counters to `progress` after every message
    pub fn with_progress(mut self, progress: Arc<AggregationProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn chunks(&self) -> u64 {
        self.chunks
    }

    pub fn count(&self) -> u64 {
        self.state.count
    }

    /// Merge one message
    pub fn push(&mut self, message: Value) {
        if self.options.collect_metadata && message.is_object() {
            merge_chunked_value(&mut self.state.metadata, strip_arrays(&message));
        }

        // A message without the iterable path contributes as a whole
        let projected = match &self.options.iterable_key {
            Some(key) => lookup_path(&message, key).cloned().unwrap_or(message),
            None => message,
        };

        match projected {
            Value::Array(items) => {
                self.state.count += items.len() as u64;
                if self.options.collect_data {
                    merge_chunked_value(&mut self.state.data, Value::Array(items));
                }
            }
            Value::Null => {}
            value => {
                self.state.count = self.state.count.max(1);
                if self.options.collect_data {
                    merge_chunked_value(&mut self.state.data, value);
                }
            }
        }

        self.chunks += 1;
        tracing::trace!("Merged chunk {} (count {})", self.chunks, self.state.count);
        if let Some(progress) = &self.progress {
            progress.record(self.chunks, self.state.count);
        }
    }

    /// Merge messages from `stream` until it ends or `stop` is cancelled
    ///
    /// Cancellation is observed between messages, so a merge is never cut
    /// short. A decode error ends consumption; messages merged before it
    /// are kept.
    pub async fn consume<S>(
        &mut self,
        stream: &mut S,
        stop: &CancellationToken,
    ) -> Result<ConsumeOutcome, StreamDecodeError>
    where
        S: Stream<Item = Result<Value, StreamDecodeError>> + Unpin,
    {
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(ConsumeOutcome::Stopped),
                next = stream.next() => match next {
                    Some(Ok(message)) => self.push(message),
                    Some(Err(error)) => return Err(error),
                    None => return Ok(ConsumeOutcome::Finished),
                },
            }
        }
    }

    /// Freeze the result; a final array's length replaces the running count
    pub fn finish(mut self) -> AggregationState {
        if let Value::Array(items) = &self.state.data {
            self.state.count = items.len() as u64;
        }
        if let Some(progress) = &self.progress {
            progress.record(self.chunks, self.state.count);
        }
        self.state
    }
}

/// Aggregate an in-memory sequence of messages
pub fn aggregate<I>(messages: I, options: AggregationOptions) -> AggregationState
where
    I: IntoIterator<Item = Value>,
{
    let mut aggregator = ChunkAggregator::new(options);
    for message in messages {
        aggregator.push(message);
    }
    aggregator.finish()
}
