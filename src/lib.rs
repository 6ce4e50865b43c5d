//! # gridreduce
//!
//! Distributed map/combine/reduce over the entries of a partitioned
//! in-memory cache.
//!
//! ## Modules
//!
//! - `cluster` - Collaborator contracts supplied by the hosting data grid
//! - `config` - Engine settings, loaded from TOML/YAML with env overrides
//! - `error` - Error types and classification
//! - `mapreduce` - Task coordinator, node executor and their wire commands
//! - `testing` - In-process grid and sample jobs

pub mod cluster;
pub mod config;
pub mod error;
pub mod mapreduce;
pub mod testing;

pub use config::EngineSettings;
pub use error::{ErrorKind, MapReduceError, MapReduceResult, Phase};
pub use mapreduce::{
    Collator, Collector, MapReduceTask, MapReduceTaskBuilder, Mapper, NodeExecutor, Reducer,
    TaskFuture, TaskId,
};
