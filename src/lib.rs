pub mod config;
pub mod error;
pub mod job;
pub mod logging;
pub mod producer;
pub mod queue;
pub mod shutdown;
pub mod worker;
