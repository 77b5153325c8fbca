//! Camera detection worker.
//!
//! This crate provides:
//! - Task lifecycle manager (start, stop, status, subscribers)
//! - Frame ingestion with bounded reconnect
//! - Processing cycle: inference, tracking, events, live preview
//! - Event pipeline with cooldowns, persistence and push
//! - Scheduler and retention sweeper
//! - Detector cache and remote HTTP detector

pub mod cache;
pub mod cancel;
pub mod config;
pub mod error;
pub mod events;
pub mod fanout;
pub mod ingest;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod processing;
pub mod remote;
pub mod retention;
pub mod retry;
pub mod runtime;
pub mod scheduler;
pub mod sink;
pub mod store;

pub use cache::DetectorCache;
pub use cancel::CancelToken;
pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use fanout::{ChannelSubscriber, Fanout, Subscriber};
pub use logging::TaskLogger;
pub use manager::{StartOutcome, TaskManager};
pub use remote::HttpDetectorFactory;
pub use sink::{LogSink, MemorySink, PushSink};
pub use store::{EventStore, FileStore, MemoryStore, PurgeReport, PurgeScope};
