pub mod endpoints;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod server;
pub mod transaction;
pub mod uploader;

pub use endpoints::*;
pub use envelope::Envelope;
pub use error::{StatusCategory, SyncError};
pub use metrics::{Metrics, MetricsSnapshot};
pub use server::{Services, SyncServer};
pub use transaction::{Endpoint, RequestContext, RequestHeader, RequestTransaction, Stage, UserRequirement};
pub use uploader::{GroupMerge, GroupOutcome, PassReport, PeriodicUploader, Uploader};
