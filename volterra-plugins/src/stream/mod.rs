//! Decoding and merging of streamed plugin output
//!
//! A plugin's stdout is a sequence of MessagePack values. [`ChunkDecoder`]
//! frames them, [`ChunkAggregator`] merges each one into a data tree and a
//! metadata tree while keeping a running item count.

mod aggregator;
mod codec;
mod merge;

pub use aggregator::{
    aggregate, AggregationOptions, AggregationProgress, AggregationState, ChunkAggregator,
    ConsumeOutcome, ProgressSnapshot,
};
pub use codec::{ChunkDecoder, StreamDecodeError, DEFAULT_MAX_FRAME_BYTES};
pub use merge::{merge_chunked_value, merged, strip_arrays};
