pub mod in_memory_queue;
pub mod in_memory_store;
pub mod redis_store;

pub use in_memory_queue::{InMemoryQueueConfig, InMemoryTaskQueue, StoredTask};
pub use in_memory_store::InMemoryStore;
pub use redis_store::RedisStore;
