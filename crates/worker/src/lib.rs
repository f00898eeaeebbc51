//! 处理端：执行投递回来的任务请求
pub mod local_delivery;
pub mod processor;

pub use local_delivery::{DeliveryReport, LocalDelivery};
pub use processor::{ExecutionOutcome, Processor};
