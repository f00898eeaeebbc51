pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod registry;
pub mod store_lock;
pub mod traits;

pub use crate::config::{ConfigLoader, RelayConfig};
pub use errors::*;
pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use registry::WorkerRegistry;
pub use store_lock::StoreMutex;
pub use traits::{
    store_key, KeyValueStore, KeyValueStoreExt, TaskBackend, Worker, WorkerOptions,
};
