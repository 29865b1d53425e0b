//! # imagemill
//!
//! An image-processing engine. Callers submit jobs (convert, crop, compress,
//! palette, upscale) against source images held in a content-addressed blob
//! store; a fixed pool of worker threads runs them and records the outcome
//! in a job table that callers poll or wait on.
//!
//! # Architecture
//!
//! ```text
//! submit ──► JobQueue ──► worker ──► ResultCache ──► Registry ──► imaging / upscale
//!   │        (lanes, caps)              (single-flight)                 │
//!   └──────────── job table ◄──── status / result / error ◄─────────────┘
//! ```
//!
//! - **Queue**: two priority lanes, a per-submitter in-flight cap, and a
//!   bounded depth. Full queues refuse work instead of growing.
//! - **Cache**: results are keyed by a fingerprint of source checksum,
//!   operation kind and canonical parameters. Concurrent identical requests
//!   compute once and share the outcome.
//! - **Registry**: the closed set of operations, validated at submission
//!   and dispatched with an exhaustive match.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`worker`] | `Engine`: job table, worker pool, retries, cancellation |
//! | [`queue`] | Priority lanes with per-submitter caps and a depth bound |
//! | [`cache`] | Single-flight, size-bounded LRU result cache and fingerprints |
//! | [`registry`] | `Operation` parameters, validation, canonical form, dispatch |
//! | [`imaging`] | Codec adapter and the pure-Rust algorithms: crop, compress, convert, palette |
//! | [`upscale`] | Inference-service client with interpolation fallback |
//! | [`blob`] | Content-addressed blob stores (memory and filesystem) |
//! | [`config`] | `imagemill.toml` loading, layering over stock defaults, validation |
//! | [`types`] | Shared serializable types: formats, statuses, metadata |
//! | [`error`] | Processing, submission and cancellation errors |
//! | [`output`] | CLI report formatting |
//!
//! # Design Decisions
//!
//! ## Threads, Not Async
//!
//! Every operation is CPU-bound except the upscaler call, which has its own
//! deadline. Workers are plain OS threads parked on a condvar; the palette
//! pass fans out over rayon.
//!
//! ## Pure-Rust Codecs
//!
//! JPEG, PNG and WebP go through the `image` crate, AVIF through `rav1e`
//! (encode) and `rav1d` (decode), SVG through `resvg`. No system libraries.
//!
//! ## Results Live in the Blob Store
//!
//! A finished job records the checksum of its output, not the bytes. The
//! cache holds the metadata and the encoded image so repeat requests skip
//! both the work and the store write.

pub mod blob;
pub mod cache;
pub mod config;
pub mod error;
pub mod imaging;
pub mod output;
pub mod queue;
pub mod registry;
pub mod types;
pub mod upscale;
pub mod worker;

pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use config::EngineConfig;
pub use error::{CancelError, JobError, ProcessingError, SubmitError};
pub use queue::JobId;
pub use registry::Operation;
pub use types::{ImageFormat, JobStatus, OperationKind, Priority};
pub use upscale::{ServiceError, UpscaleService};
pub use worker::{Engine, JobRequest, JobResult, JobSnapshot};

#[cfg(test)]
pub(crate) mod test_helpers;
