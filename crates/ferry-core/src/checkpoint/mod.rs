mod ledger;
mod store;
mod types;

pub use ledger::{BatchId, Ledger, ReservedBatch};
pub use store::{validate_checkpoint_id, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use types::{
    CheckpointState, FailedItem, FileFacts, SyncPolicy, TaskInfo, TransferItem, TransferOptions,
    TransferPhase, TransferStats,
};
