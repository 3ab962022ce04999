pub mod delivery;
pub mod ownership;
pub mod processor;
pub mod pruning;
pub mod resolver;
pub mod store;

pub use processor::{JobProcessor, ProcessOutcome, ProcessorOptions};
pub use store::{DeviceStore, JobStore, MemoryStore, PgStore};
