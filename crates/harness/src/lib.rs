pub mod config;
pub mod deployment;
pub mod fakes;

pub use config::TestConfig;
pub use deployment::{RowCounts, TEST_ACCOUNT_TYPE, TestDeployment, TestDevice};
pub use fakes::{FakeAuthenticator, MemoryCloudStorage, RecordingAccountDelegate, RecordingPush};

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Routes `tracing` output through the test writer. Safe to call from every
/// test; only the first call installs the subscriber.
pub fn init_test_logging() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .try_init();
}
