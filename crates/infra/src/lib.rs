//! Infrastructure layer: stores, worker client, config and the recovery loop.

pub mod config;
pub mod recovery;
pub mod retry_processor;
pub mod store;
pub mod worker;
