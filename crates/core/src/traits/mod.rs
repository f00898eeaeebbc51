pub mod kv_store;
pub mod task_backend;
pub mod worker;

pub use kv_store::*;
pub use task_backend::*;
pub use worker::*;
