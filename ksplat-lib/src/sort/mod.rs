//! Off-thread depth sorting: the counting-sort engine, the worker that runs it,
//! the transport between them and the progressive sort scheduler.

pub mod engine;
pub mod scheduler;
pub mod transport;
pub mod worker;

pub use engine::{SortEngine, SortEngineConfig, SortParams, DEFAULT_DEPTH_MAP_RANGE};
pub use scheduler::{SortPlan, SortScheduler, SortSchedulerConfig};
pub use transport::{ArenaLayout, SharedSortArena, SortTransport, SortedIndexes, TransportMode};
pub use worker::{SortOutcome, SortPoll, SortWorker, SortWorkerConfig};
