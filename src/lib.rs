//! stackkeeper library
//!
//! Policy-driven backup and retention for the stateful services of a
//! containerized stack: policy resolution, backend adapters, backup
//! execution, age-based cleanup, schedule management and notifications.

pub mod adapters;
pub mod artifact;
pub mod cli;
pub mod clock;
pub mod command;
pub mod commands;
pub mod config;
pub mod cron;
pub mod engine;
pub mod error;
pub mod event_log;
pub mod executor;
pub mod lock;
pub mod notify;
pub mod policy;
pub mod process_guard;
pub mod retention;
pub mod runtime;
pub mod sanity;
pub mod schedule;
pub mod types;

// Re-export main types for convenience
pub use adapters::{Adapter, AdapterRegistry, Target};
pub use artifact::{ArtifactStore, BackupArtifact};
pub use clock::{Clock, FixedClock, SystemClock};
pub use command::AdminCommand;
pub use config::EngineConfig;
pub use engine::{Completed, DryTest, Engine};
pub use error::{BackupError, CleanupError, EngineError, RuntimeError};
pub use executor::{BackupExecutor, BackupReport};
pub use notify::{NotificationDispatcher, NotificationEvent};
pub use policy::{PolicyKey, PolicyResolver, PolicyStore};
pub use process_guard::{CancelFlag, ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use retention::{CleanupReport, RetentionCleaner, RetentionRun};
pub use runtime::{ContainerRuntime, DockerRuntime};
pub use schedule::{ScheduleEntry, SchedulerConfigurator};
pub use types::{BackendKind, BackupType, OperationKind, Severity};
