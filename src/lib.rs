//! Continuous in-process call-stack sampling.
//!
//! Application threads open nested [`Scope`]s; a background sampler
//! periodically captures the stacks of every thread with an open scope and
//! appends an interned stack pointer to that scope's run-length encoded log.
//! Ending a scope yields an immutable [`Chunk`] that can be serialized to a
//! compact, versioned binary form and read back with [`ChunkDecoder`].
//!
//! ```ignore
//! let (recorder, _guard) = RecorderBuilder::new()
//!     .stack_source(my_stack_walker)
//!     .build()?;
//!
//! let scope = recorder.start_scope("GET /users");
//! handle_request();
//! let bytes = recorder.end_scope(scope).serialize()?;
//! ```

mod decoder;
mod emit;
mod encoder;
mod error;
mod frame;
mod layer;
mod manager;
mod pool;
mod ratelimit;
mod recorder;
mod registry;
pub mod rle;
mod scheduler;
mod scope;
mod source;

pub use decoder::{
    ChunkDecoder, DecodedChunk, DecodedFrame, DecodedStack, MAX_DECODED_SAMPLES,
};
pub use encoder::{ChunkEncoder, FormatVersion};
pub use error::{DecodeError, EncodeError, PoolError, SampleError};
pub use frame::{
    Frame, FrameElement, FrameId, FrameSequence, ResolvedFrame, StackId, StackPools, StringId,
};
pub use layer::{ScopeLayer, ScopeLayerBuilder};
pub use manager::{ScopeDirectory, ScopeManager};
pub use pool::{ConstantPool, MAX_POOL_INDEX};
pub use ratelimit::RateLimiter;
pub use recorder::{
    current_thread_id, Config, Recorder, RecorderBuilder, RecordingContext, SamplerGuard,
    DEFAULT_LOG_INTERVAL, DEFAULT_MAX_STACK_DEPTH, DEFAULT_SAMPLING_PERIOD,
};
pub use registry::{ThreadId, ThreadRegistry};
pub use rle::StackPointerLog;
pub use scheduler::{SamplingScheduler, TickStats};
pub use scope::{Chunk, Scope};
pub use source::{NoopStackSource, StackAccessGate, StackSource, ThreadStack};
