//! Durable state for a harvest.
//!
//! ## Layout (defaults)
//!
//! ```text
//! state/
//! ├── records.jsonl         # Append-only record log, one JSON record per line
//! ├── checkpoint.json       # Resume point, overwritten atomically per page
//! ├── last_run.json         # Summary of the most recent run
//! └── failures/             # Raw bodies that failed to parse
//!     └── page-00007.txt
//! ```

pub mod checkpoint;
pub mod local;
pub mod sink;

// Re-export for convenience
pub use checkpoint::CheckpointStore;
pub use local::{DumpWriter, LocalStorage};
pub use sink::{DedupIndex, RecordSink};
