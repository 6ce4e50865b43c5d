//! In-process grid and sample jobs
//!
//! Lets the engine run end to end without a real cluster: every member
//! lives in this process and talks through a marshalling loopback transport.

pub mod cluster;
pub mod word_count;

pub use cluster::{
    ConsistentHash, LocalGrid, LocalGridBuilder, LoopbackRpc, MemoryCache, MemoryCacheManager,
    MemoryIntermediateStore, MemoryPersistentStore, Network, StoreRegistry,
};
pub use word_count::{SumReducer, WordCountMapper};
