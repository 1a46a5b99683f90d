pub mod config;
pub mod error;
pub mod ids;
pub mod resolver;
pub mod resolvers;
pub mod services;
pub mod time;

pub use config::SyncConfig;
pub use error::CoreError;
pub use ids::*;
pub use resolver::{ChangeResolver, ResolverRegistry};
pub use services::*;
