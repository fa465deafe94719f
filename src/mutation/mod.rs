//! Per-row mutation metadata and the optimistic write protocol built on it.

pub mod resolve;
pub mod tx;
pub mod writer;

pub use resolve::{
    RowPatch, SkipReason, SkippedField, WriteMode, WriteOutcome, check_row_version, resolve_write,
};
pub use tx::{MutationMetadata, create_server_tx};
pub use writer::RowWriter;
