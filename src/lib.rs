pub mod backend;
pub mod error;
pub mod observer;
pub mod payload;
pub mod pool;
pub mod process;
pub mod registry;
pub mod tracing_config;
pub mod worker;

pub use backend::{MemoryBackend, PersistentData, QueueBackend, RedisBackend};
pub use error::{Error, Result};
pub use observer::{NullObserver, Observer, TracingObserver};
pub use pool::{BorrowPool, PoolHandle};
pub use registry::{Job, JobObject, Registry};
pub use worker::{JobStatus, Worker, WorkerConfig};
