//! The iteration scheduler: per-iteration shared state (queues, shuffle,
//! progress), the sample processing pipeline (gather, collate,
//! preprocessor DAG), and the per-rank prefetcher that keeps ready
//! batches ahead of the training loop.

mod state;
pub use state::{ClusterStateOps, IterationState, IterationStateOps};

mod process;
pub use process::{
    decollate, gather_samples, process_next_samples, GatherOutcome, ProcessNextSamplesParams,
    ProcessingError,
};

mod prefetcher;
pub use prefetcher::{
    GetNextError, Prefetcher, PrefetcherConfig, PrefetcherPool, ERROR_PREFIX,
    PROCESSING_ERROR_PREFIX,
};

mod fingerprint;
pub use fingerprint::{
    batch_cache_key, iteration_id_for_fingerprint, set_iteration_id_for_fingerprint,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no more indices to pop")]
    NoMoreIndices,
    #[error("iteration not initialized")]
    NotInitialized,
    #[error("replication pg not found for rank {rank}")]
    RankNotInReplicationGroup { rank: u32 },
    #[error("invalid iteration config: {0}")]
    InvalidConfig(String),
    /// A forwarded state operation failed on or en route to the head.
    #[error("state operation '{op}' failed: {reason}")]
    State { op: String, reason: String },
    #[error(transparent)]
    Store(#[from] cache::Error),
    #[error(transparent)]
    Model(#[from] models::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
