//! A minimal append-only Delta Lake writer over `object_store`.

pub mod actions;
pub mod table;
pub mod writer;

pub use table::{DeltaTable, TableSnapshot};
pub use writer::{AppendOutcome, DeltaSink, ParquetCompression};
