pub mod args;
pub mod checkpoint;
pub mod config;
pub mod delta;
pub mod error;
pub mod event;
pub mod metrics_consts;
pub mod query;
pub mod session;
pub mod source;
pub mod storage;
pub mod test_utils;
