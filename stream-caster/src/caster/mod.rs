//! Stream lifecycle core.
//!
//! - [`job`]: status records, the state machine and process sets
//! - [`store`]: synchronized per-stream state behind [`StreamRepository`]
//! - [`process`], [`command`]: spawning and terminating external binaries
//! - [`branch`], [`ports`]: the redundant relay topology
//! - [`monitor`], [`record_reader`]: diagnostic stream parsing
//! - [`scheduler`]: one-shot deferred actions
//! - [`manager`]: the orchestration façade

pub mod branch;
pub mod command;
pub mod job;
pub mod manager;
pub mod monitor;
pub mod ports;
pub mod process;
pub mod record_reader;
pub mod scheduler;
pub mod store;

pub use branch::{Branch, BranchSelector};
pub use job::{ProcessSet, StreamId, StreamState, StreamStatus, Transition};
pub use manager::{
    ActiveStreamInfo, BranchReport, SourceSelector, StartStreamRequest, StartStreamResponse,
    StreamManager, UploadReceipt,
};
pub use store::{BandwidthTable, InMemoryStreamRepository, StreamRepository};
