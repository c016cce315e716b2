pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod executor;
pub mod models;
pub mod pool;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod selector;
pub mod stats;
pub mod task;
pub mod traits;
pub mod util;
pub mod worker;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use circuit_breaker::{CircuitBreakerConfig, CircuitState};
pub use config::{ConfigSource, EndpointConfig, EnvSource, JsonFileSource, OrchestratorConfig};
pub use error::{AppError, ErrorCategory};
pub use executor::{ExecutionError, ResilientExecutor};
pub use models::{
    EndpointSnapshot, PoolStats, SchedulerStats, ShutdownReport, TaskFailure, TaskReport,
};
pub use pool::{Lease, PoolConfig, SessionPool};
pub use retry::{CategoryPolicy, RetryPolicy};
pub use scheduler::{BatchHandle, Scheduler, SchedulerBuilder};
pub use stats::EndpointRegistry;
pub use task::{Priority, TaskStatus};
pub use traits::{
    AppErrorClassifier, AttemptHook, ErrorClassifier, Extractor, KeywordClassifier, NoopHook,
    SessionFactory,
};
pub use worker::{TracingWorkerReporter, WorkerEvent, WorkerReporter};
