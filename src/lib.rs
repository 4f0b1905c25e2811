//! Archive discovery and ingestion engine for a performance metrics
//! proxy: watches a directory tree of append-only metrics archives,
//! decodes their versioned binary records, and dispatches callback
//! events to downstream consumers.
//!
//! See `codec` for the wire format, `registry` for the path table,
//! `watcher` for filesystem notification, `reader`/`stream` for the two
//! ingestion paths, and `dispatch` for the consumer fan-out.

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod reader;
pub mod registry;
pub mod stream;
pub mod watcher;

pub use config::Config;
pub use dispatch::{Consumer, ConsumerHandle, EventHeader, LabelsOutcome};
pub use engine::Engine;
pub use error::DiscoverError;
pub use registry::{EntryFlags, SourceIdentity};
