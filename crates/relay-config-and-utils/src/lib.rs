//! Configuration, paths, and logging setup shared by the outbox relay crates.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{
    Config, DispatcherSettings, ElasticsearchSettings, RetrySettings, DEFAULT_ELASTICSEARCH_URL,
    DEFAULT_INDEX_PREFIX, DEFAULT_LOG_LEVEL,
};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, parse_level, SERVICE_NAME};
pub use paths::Paths;
