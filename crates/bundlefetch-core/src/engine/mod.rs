//! Download engine
//!
//! - Pluggable transports selected by URL scheme (HTTP via reqwest, file://)
//! - Resumable per-resource downloader with mirror rotation and stall detection
//! - Orchestrator deduplicating downloads per destination path
//! - Batch operation for waiting on many downloads from the scheduler

mod batch;
mod downloader;
mod file;
mod http;
mod orchestrator;
mod transport;

pub use batch::*;
pub use downloader::*;
pub use file::*;
pub use http::*;
pub use orchestrator::*;
pub use transport::*;
