//! Evidence pipeline: async bounded-queue recorder, signed durable records,
//! pluggable storage, and retention pruning.

pub mod record;
pub mod recorder;
pub mod retention;
pub mod storage;

pub use record::{EvidenceSigner, HashInputs};
pub use recorder::{EvidenceRecorder, RecorderConfig, RecorderStats};
pub use retention::{RetentionConfig, RetentionPruner};
pub use storage::{EvidenceFilter, EvidenceStorage};
