pub mod storage;
pub mod util;

pub use storage::config::StorageConfig;
pub use storage::{
    Record, Storage, StorageError, StorageIterator, StorageRead, StorageResult, StorageSnapshot,
    WriteOptions,
};
pub use util::BytesRange;
