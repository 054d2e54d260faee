//! Mend Queue - durable storage for the pipeline
//!
//! - [`FailureQueue`]: append-only record of parse failures with
//!   monotonically increasing sequence indices and fenced removal
//! - [`FailedBatchLedger`]: append-only record of batches that exhausted
//!   their retries
//!
//! Both stores are JSON lines, one object per line, synced before a write
//! returns. Whole-file rewrites go through a temp file and a rename.
//!
//! # Example
//!
//! ```rust,ignore
//! use mend_core::NewFailure;
//! use mend_queue::FailureQueue;
//!
//! let queue = FailureQueue::open("failure_queue.jsonl")?;
//! queue.append(NewFailure::new("a week from friday"))?;
//!
//! let snapshot = queue.snapshot()?;
//! queue.remove_fenced(&snapshot.indices(), snapshot.fence)?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod error;
mod jsonl;
pub mod ledger;
pub mod queue;

pub use error::{LedgerError, QueueError};
pub use ledger::FailedBatchLedger;
pub use queue::{FailureQueue, RemovalReport};
