//! Worker side: running claimed jobs and delivering their results.
//!
//! # Components
//!
//! - [`ProcessSupervisor`]: spawns a job's process with output captured to
//!   its log file, and polls it without blocking
//! - [`ArtifactTransfer`]: judges success by the output file and ships the
//!   log and output to the store
//! - [`reconnect`]: backoff for re-establishing the queue connection
//! - [`WorkerDaemon`]: the bounded-concurrency control loop tying these
//!   together with a [`JobQueue`](crate::queue::JobQueue)
//!
//! # Execution Flow
//!
//! 1. The daemon claims up to its free slot count from the queue
//! 2. [`ProcessSupervisor::spawn`] starts each job, with no shell
//! 3. Every iteration polls each process
//! 4. On exit, [`ArtifactTransfer::finalize`] checks the output file and
//!    transfers artifacts
//! 5. Successful jobs are acknowledged; a missing output breaks the daemon

pub mod daemon;
pub mod reconnect;
pub mod supervisor;
pub mod transfer;

pub use daemon::{ConnectionState, DaemonOutcome, DaemonState, TickReport, WorkerDaemon};
pub use reconnect::ReconnectConfig;
pub use supervisor::{JobProcess, ProcessState, ProcessSupervisor};
pub use transfer::{store_for, ArtifactStore, ArtifactTransfer, LocalStore, ScpStore, TransferReport};
