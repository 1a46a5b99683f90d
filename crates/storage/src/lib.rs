pub mod deferred;
pub mod error;
pub mod file_index;
pub mod group_lock;
pub mod master_version;
pub mod records;
pub mod schema;
pub mod sharing;
pub mod store;
pub mod uploads;
pub mod users;

pub use deferred::DeferredUploadRepo;
pub use error::StorageError;
pub use file_index::{DeletionCriteria, FileIndexRepo};
pub use group_lock::GroupLockRepo;
pub use master_version::{MasterVersionRepo, MasterVersionUpdate};
pub use records::*;
pub use sharing::SharingRepo;
pub use store::{SqliteStore, StoreTx, TxMode, open_in_memory};
pub use uploads::{FinalizeOutcome, UploadRepo};
pub use users::{DeviceRepo, UserRepo};
