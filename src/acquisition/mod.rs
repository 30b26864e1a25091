//! Timing-critical acquisition path.
//!
//! ```text
//!  ReadingSource ──read()──▶ Sampler ──seal()──▶ HandoffQueue ──▶ storage worker
//!                              ▲  (dedicated "sampler" thread)
//!                              │ set_rate / pause / resume
//!                        SamplerControl (shared atomics)
//! ```
//!
//! The sampler owns the open [`SecondBucket`]. At every wall-clock second boundary it
//! seals the bucket and moves it into the [`HandoffQueue`]; it never touches it again.
//! Nothing on this path waits on storage or network I/O.

pub mod bucket;
pub mod handoff;
pub mod pacer;
pub mod sampler;

pub use bucket::{SealedBucket, SecondBucket};
pub use handoff::{HandoffQueue, Pop};
pub use pacer::Pacer;
pub use sampler::{Sampler, SamplerControl, SamplerThread};
