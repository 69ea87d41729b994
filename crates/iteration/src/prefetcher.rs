use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use batch::Batch;
use cache::Store;
use pool::WorkerPool;
use reader::SampleReader;
use registry::{Params, Preprocessor, Registries};
use tokio_util::sync::CancellationToken;

use crate::process::{gather_samples, GatherError, ProcessNextSamplesParams, ProcessingError};
use crate::{Error, IterationStateOps};

/// Cache-value prefix of a processing failure; the remainder is the
/// ProcessingError as JSON.
pub const PROCESSING_ERROR_PREFIX: &[u8] = b"processing_error:";
/// Cache-value prefix of any other failure; the remainder is plain text.
pub const ERROR_PREFIX: &[u8] = b"error:";

/// How long a stopping rank's tasks are given to wind down.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause of the submit loop when the in-flight quota is full.
const QUOTA_PAUSE: Duration = Duration::from_millis(10);
/// Cadence of the head's node-map pruning sync.
const NODE_MAP_SYNC_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct PrefetcherConfig {
    pub max_retry_count: usize,
    pub no_cache: bool,
    pub num_workers: usize,
    pub prefetch_factor: usize,
    pub in_order: bool,
    pub batch_cache_ttl: Duration,
}

impl Default for PrefetcherConfig {
    fn default() -> Self {
        PrefetcherConfig {
            max_retry_count: 0,
            no_cache: false,
            num_workers: 1,
            prefetch_factor: 1,
            in_order: true,
            batch_cache_ttl: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GetNextError {
    /// Transient: the next batch is still being prepared.
    #[error("not prefetched yet")]
    NotFetchedYet,
    /// The iteration delivered everything it ever will for this rank.
    #[error("no more batches")]
    Done,
    #[error("rank {0} was never started on this prefetcher")]
    UnknownRank(u32),
    #[error(transparent)]
    Processing(ProcessingError),
    #[error("{0}")]
    Other(String),
}

struct RankProgress {
    /// Sequences currently in flight, in submission order.
    fetching: Vec<usize>,
    /// Ready sequences and their cache keys.
    fetched: BTreeMap<usize, String>,
    /// Next sequence to deliver in in-order mode.
    current: usize,
}

struct RankBook {
    progress: Mutex<RankProgress>,
    stop: CancellationToken,
    all_submitted: AtomicBool,
    done: AtomicBool,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl RankBook {
    fn new() -> Arc<Self> {
        Arc::new(RankBook {
            progress: Mutex::new(RankProgress {
                fetching: Vec::new(),
                fetched: BTreeMap::new(),
                current: 0,
            }),
            stop: CancellationToken::new(),
            all_submitted: AtomicBool::new(false),
            done: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn in_flight(&self) -> usize {
        let progress = self.progress.lock().unwrap();
        progress.fetching.len() + progress.fetched.len()
    }
}

struct WorkItem {
    rank: u32,
    seq: usize,
    cache_key: String,
    batch: Batch,
    layers: Vec<Vec<(Arc<dyn Preprocessor>, Params)>>,
    group_idx: usize,
    batch_size: usize,
    indices: Vec<usize>,
}

/// One prefetcher per iteration. Per rank it runs one submit task that
/// reserves index batches from the iteration state and gathers their
/// samples, and `num_workers` process tasks that drain a shared work
/// queue of preprocessor groups, storing finished batches in the KV
/// store under their cache keys.
pub struct Prefetcher {
    iteration_id: String,
    state: Arc<dyn IterationStateOps>,
    store: Arc<dyn Store>,
    reader: Arc<SampleReader>,
    registries: Arc<Registries>,
    pool: Arc<WorkerPool>,
    cluster: Option<Arc<cluster::Cluster>>,
    config: PrefetcherConfig,

    books: Mutex<HashMap<u32, Arc<RankBook>>>,
    work_tx: tokio::sync::mpsc::UnboundedSender<WorkItem>,
    work_rx: Arc<tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<WorkItem>>>,
    /// Head-side: rank → node url → sequences prepared by that node.
    node_map: Mutex<HashMap<u32, HashMap<String, Vec<usize>>>>,
    sync_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Prefetcher {
    pub fn new(
        iteration_id: &str,
        state: Arc<dyn IterationStateOps>,
        store: Arc<dyn Store>,
        reader: Arc<SampleReader>,
        registries: Arc<Registries>,
        pool: Arc<WorkerPool>,
        cluster: Option<Arc<cluster::Cluster>>,
        config: PrefetcherConfig,
    ) -> Arc<Self> {
        let (work_tx, work_rx) = tokio::sync::mpsc::unbounded_channel();
        Arc::new(Prefetcher {
            iteration_id: iteration_id.to_string(),
            state,
            store,
            reader,
            registries,
            pool,
            cluster,
            config,
            books: Mutex::new(HashMap::new()),
            work_tx,
            work_rx: Arc::new(tokio::sync::Mutex::new(work_rx)),
            node_map: Mutex::new(HashMap::new()),
            sync_task: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    fn is_head(&self) -> bool {
        self.cluster.as_ref().map(|c| c.is_head()).unwrap_or(false)
    }

    /// Allocate per-rank bookkeeping and spawn the rank's tasks. Calling
    /// start twice for a rank is a no-op.
    pub fn start(self: Arc<Self>, rank: u32) {
        let book = {
            let mut books = self.books.lock().unwrap();
            if books.contains_key(&rank) {
                return;
            }
            let book = RankBook::new();
            books.insert(rank, book.clone());
            book
        };

        let mut tasks = Vec::new();
        {
            let prefetcher = self.clone();
            let book = book.clone();
            tasks.push(tokio::spawn(async move {
                prefetcher.submit_loop(rank, book).await;
            }));
        }
        for _ in 0..self.config.num_workers {
            let prefetcher = self.clone();
            let stop = book.stop.clone();
            tasks.push(tokio::spawn(async move {
                prefetcher.process_loop(stop).await;
            }));
        }
        *book.tasks.lock().unwrap() = tasks;

        if self.is_head() {
            let mut sync_task = self.sync_task.lock().unwrap();
            if sync_task.is_none() {
                let prefetcher = self.clone();
                *sync_task = Some(tokio::spawn(async move {
                    prefetcher.sync_node_map_loop().await;
                }));
            }
        }

        tracing::debug!(iteration_id = self.iteration_id, rank, "prefetcher started");
    }

    pub fn ranks(&self) -> Vec<u32> {
        let mut ranks: Vec<u32> = self.books.lock().unwrap().keys().copied().collect();
        ranks.sort();
        ranks
    }

    /// rank → next in-order sequence, for the head's node-map pruning.
    pub fn currents(&self) -> HashMap<u32, usize> {
        self.books
            .lock()
            .unwrap()
            .iter()
            .map(|(&rank, book)| (rank, book.progress.lock().unwrap().current))
            .collect()
    }

    /// Sequences submitted but not yet delivered for `rank`.
    pub fn upcoming(&self, rank: u32) -> Vec<usize> {
        match self.book(rank) {
            Some(book) => {
                let progress = book.progress.lock().unwrap();
                let mut seqs = progress.fetching.clone();
                seqs.extend(progress.fetched.keys().copied());
                seqs
            }
            None => Vec::new(),
        }
    }

    fn book(&self, rank: u32) -> Option<Arc<RankBook>> {
        self.books.lock().unwrap().get(&rank).cloned()
    }

    async fn submit_loop(self: Arc<Self>, rank: u32, book: Arc<RankBook>) {
        let quota = self.config.prefetch_factor * self.config.num_workers.max(1);

        while !book.stop.is_cancelled() {
            if book.in_flight() >= quota {
                tokio::time::sleep(QUOTA_PAUSE).await;
                continue;
            }

            let (cache_key, params) = match self.state.get_next_samples(rank).await {
                Ok(reserved) => reserved,
                Err(Error::NoMoreIndices) => {
                    tracing::debug!(iteration_id = self.iteration_id, rank, "iteration finished");
                    break;
                }
                Err(err) => {
                    tracing::error!(
                        iteration_id = self.iteration_id,
                        rank,
                        %err,
                        "failed to reserve next samples"
                    );
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let seq = params.current;
            book.progress.lock().unwrap().fetching.push(seq);
            if let Some(cluster) = &self.cluster {
                if cluster.is_head() {
                    self.set_node_map(rank, &cluster.node_url, seq);
                }
            }

            if self.config.no_cache {
                if let Err(err) = self.store.delete(&cache_key).await {
                    tracing::warn!(%err, "failed to drop cached batch");
                }
            }

            match self.store.exists(&cache_key).await {
                Ok(true) => {
                    // Another run already prepared this sequence: refresh
                    // its TTL and serve it as fetched.
                    let _ = self.store.expire(&cache_key, self.config.batch_cache_ttl).await;
                    self.mark_fetched(rank, seq, cache_key);
                }
                Ok(false) | Err(_) => {
                    self.prepare(rank, seq, cache_key, params, &book).await;
                }
            }
        }

        book.all_submitted.store(true, Ordering::SeqCst);

        // Drain: the rank is done once nothing remains in flight.
        loop {
            if book.stop.is_cancelled()
                || book.progress.lock().unwrap().fetching.is_empty()
            {
                break;
            }
            tokio::time::sleep(QUOTA_PAUSE).await;
        }
        book.done.store(true, Ordering::SeqCst);
        tracing::debug!(iteration_id = self.iteration_id, rank, "prefetcher submit finished");
    }

    /// Gather the reserved samples and either store the finished batch
    /// (no preprocessors) or enqueue its first preprocessor group.
    async fn prepare(
        &self,
        rank: u32,
        seq: usize,
        cache_key: String,
        params: ProcessNextSamplesParams,
        book: &Arc<RankBook>,
    ) {
        let indices: Vec<usize> =
            params.global_sample_indices.iter().map(|i| i.index).collect();

        let mut attempt = 0usize;
        let outcome = loop {
            match gather_samples(&self.reader, &self.registries, &params).await {
                Ok(outcome) => break Ok(outcome),
                Err(GatherError::NoSamplesFound) => break Err(anyhow::Error::from(GatherError::NoSamplesFound)),
                Err(err) if attempt < self.config.max_retry_count => {
                    attempt += 1;
                    tracing::warn!(
                        rank,
                        seq,
                        %err,
                        "gather failed, retrying ({attempt}/{})",
                        self.config.max_retry_count
                    );
                }
                Err(err) => break Err(anyhow::Error::from(err)),
            }
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                let processing = ProcessingError::new(&err, seq, indices);
                self.store_value(
                    rank,
                    seq,
                    &cache_key,
                    [PROCESSING_ERROR_PREFIX, processing.to_json().as_bytes()].concat(),
                )
                .await;
                return;
            }
        };

        for &index in &outcome.filtered {
            if let Err(err) = self.state.filtered(index).await {
                tracing::warn!(index, %err, "failed to report filtered index");
            }
        }

        let layers =
            match registry::plan_layers(&params.preprocessors, &self.registries.preprocessors) {
                Ok(layers) => layers,
                Err(err) => {
                    self.store_value(
                        rank,
                        seq,
                        &cache_key,
                        [ERROR_PREFIX, err.to_string().as_bytes()].concat(),
                    )
                    .await;
                    return;
                }
            };

        if layers.is_empty() {
            self.finalize(rank, seq, &cache_key, outcome.batch, params.batch_size)
                .await;
            return;
        }

        let item = WorkItem {
            rank,
            seq,
            cache_key,
            batch: outcome.batch,
            layers,
            group_idx: 0,
            batch_size: params.batch_size,
            indices,
        };
        if self.work_tx.send(item).is_err() {
            tracing::warn!(rank, seq, "work queue closed while submitting");
            book.stop.cancel();
        }
    }

    async fn process_loop(self: Arc<Self>, stop: CancellationToken) {
        loop {
            let item = tokio::select! {
                _ = stop.cancelled() => return,
                item = async {
                    let mut rx = self.work_rx.lock().await;
                    rx.recv().await
                } => match item {
                    Some(item) => item,
                    None => return,
                },
            };
            self.process_item(item).await;
        }
    }

    /// Run one preprocessor group of the item on the worker pool; either
    /// advance it to the next group or finish the batch.
    async fn process_item(&self, item: WorkItem) {
        let WorkItem {
            rank,
            seq,
            cache_key,
            batch,
            layers,
            group_idx,
            batch_size,
            indices,
        } = item;

        let layer = layers[group_idx].clone();

        let mut attempt = 0usize;
        let result = loop {
            let layer = layer.clone();
            let input = batch.clone();
            let result = self
                .pool
                .run(move || crate::process::apply_layer(input, &layer))
                .await;
            match result {
                Ok(batch) => break Ok(batch),
                Err(err) if !err.aborted && attempt < self.config.max_retry_count => {
                    attempt += 1;
                    tracing::warn!(
                        rank,
                        seq,
                        group_idx,
                        %err,
                        "preprocessor group failed, retrying ({attempt}/{})",
                        self.config.max_retry_count
                    );
                }
                Err(err) => break Err(err),
            }
        };

        match result {
            Ok(batch) => {
                if group_idx + 1 < layers.len() {
                    let next = WorkItem {
                        rank,
                        seq,
                        cache_key,
                        batch,
                        layers,
                        group_idx: group_idx + 1,
                        batch_size,
                        indices,
                    };
                    if self.work_tx.send(next).is_err() {
                        tracing::warn!(rank, seq, "work queue closed mid-pipeline");
                    }
                } else {
                    self.finalize(rank, seq, &cache_key, batch, batch_size).await;
                }
            }
            Err(err) => {
                let processing = ProcessingError {
                    message: err.message.clone(),
                    stack: err.stack.clone().unwrap_or_default(),
                    current: seq,
                    indices,
                };
                self.store_value(
                    rank,
                    seq,
                    &cache_key,
                    [PROCESSING_ERROR_PREFIX, processing.to_json().as_bytes()].concat(),
                )
                .await;
            }
        }
    }

    /// Final pipeline stage: decollate single-sample batches, serialize,
    /// and store under the cache key with the configured TTL.
    async fn finalize(&self, rank: u32, seq: usize, cache_key: &str, batch: Batch, batch_size: usize) {
        let batch = if batch_size == 0 {
            crate::process::decollate(batch)
        } else {
            batch
        };
        let content = batch::encode(&batch);
        self.store_value(rank, seq, cache_key, content).await;
    }

    async fn store_value(&self, rank: u32, seq: usize, cache_key: &str, content: Vec<u8>) {
        if let Err(err) = self
            .store
            .set_ex(cache_key, &content, self.config.batch_cache_ttl)
            .await
        {
            tracing::error!(rank, seq, %err, "failed to store batch");
        }
        self.mark_fetched(rank, seq, cache_key.to_string());
    }

    fn mark_fetched(&self, rank: u32, seq: usize, cache_key: String) {
        if let Some(book) = self.book(rank) {
            let mut progress = book.progress.lock().unwrap();
            progress.fetching.retain(|&s| s != seq);
            progress.fetched.insert(seq, cache_key);
        }
        if let Some(cluster) = &self.cluster {
            if cluster.is_head() {
                let node_url = cluster.node_url.clone();
                self.cleanup_node_map(rank, &node_url, seq);
            }
        }
    }

    /// Deliver the next ready batch. In-order mode returns strictly
    /// sequence current, current+1, and so on; out-of-order mode returns any
    /// ready sequence; an explicit `seq` returns that reserved sequence.
    pub async fn get_next(
        &self,
        rank: u32,
        seq: Option<usize>,
    ) -> Result<(usize, Vec<u8>), GetNextError> {
        let book = self.book(rank).ok_or(GetNextError::UnknownRank(rank))?;

        let (current, cache_key) = {
            let mut progress = book.progress.lock().unwrap();
            let popped = match seq {
                Some(seq) => {
                    let popped = progress.fetched.remove(&seq).map(|key| (seq, key));
                    if popped.is_some() {
                        progress.current = seq + 1;
                    }
                    popped
                }
                None if self.config.in_order => {
                    let at = progress.current;
                    let popped = progress.fetched.remove(&at).map(|key| (at, key));
                    if popped.is_some() {
                        progress.current += 1;
                    }
                    popped
                }
                None => progress.fetched.pop_first(),
            };
            match popped {
                Some((seq, key)) => (seq, key),
                None => {
                    if book.done.load(Ordering::SeqCst) && progress.fetched.is_empty() {
                        return Err(GetNextError::Done);
                    }
                    return Err(GetNextError::NotFetchedYet);
                }
            }
        };

        let content = self
            .store
            .get(&cache_key)
            .await
            .map_err(|err| GetNextError::Other(err.to_string()))?
            .ok_or_else(|| GetNextError::Other("batch cache entry expired".to_string()))?;

        if let Some(raw) = content.strip_prefix(PROCESSING_ERROR_PREFIX) {
            return Err(match ProcessingError::from_json(raw) {
                Some(processing) => GetNextError::Processing(processing),
                None => GetNextError::Other("malformed processing error entry".to_string()),
            });
        }
        if let Some(raw) = content.strip_prefix(ERROR_PREFIX) {
            return Err(GetNextError::Other(
                String::from_utf8_lossy(raw).into_owned(),
            ));
        }
        Ok((current, content))
    }

    fn set_node_map(&self, rank: u32, node_url: &str, seq: usize) {
        self.node_map
            .lock()
            .unwrap()
            .entry(rank)
            .or_default()
            .entry(node_url.to_string())
            .or_default()
            .push(seq);
    }

    pub fn get_node_map(&self, rank: u32) -> HashMap<String, Vec<usize>> {
        self.node_map
            .lock()
            .unwrap()
            .get(&rank)
            .cloned()
            .unwrap_or_default()
    }

    fn cleanup_node_map(&self, rank: u32, node_url: &str, below: usize) {
        let mut node_map = self.node_map.lock().unwrap();
        if let Some(nodes) = node_map.get_mut(&rank) {
            if let Some(seqs) = nodes.get_mut(node_url) {
                seqs.retain(|&seq| seq > below);
            }
        }
    }

    /// Head-side loop: poll every node's delivered sequences and prune
    /// node-map entries the nodes have moved past.
    async fn sync_node_map_loop(self: Arc<Self>) {
        let Some(cluster) = self.cluster.clone() else {
            return;
        };
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(NODE_MAP_SYNC_INTERVAL) => (),
            }
            let path = format!("/iterations/{}/prefetcher-current", self.iteration_id);
            let responses = match cluster.broadcast_get(&path).await {
                Ok(responses) => responses,
                Err(err) => {
                    tracing::error!(%err, "node map sync failed");
                    continue;
                }
            };
            for (node_url, currents) in responses {
                let Some(currents) = currents else { continue };
                let Ok(currents) =
                    serde_json::from_value::<HashMap<u32, usize>>(currents)
                else {
                    continue;
                };
                for (rank, current) in currents {
                    self.cleanup_node_map(rank, &node_url, current.saturating_sub(1));
                }
            }
        }
    }

    /// Stop the rank's tasks and join them, logging any task that fails
    /// to wind down within the timeout.
    pub async fn stop(&self, rank: u32) {
        let Some(book) = self.book(rank) else { return };
        tracing::debug!(iteration_id = self.iteration_id, rank, "stopping prefetcher");
        book.stop.cancel();

        let tasks: Vec<_> = book.tasks.lock().unwrap().drain(..).collect();
        for (i, task) in tasks.into_iter().enumerate() {
            let handle = task.abort_handle();
            if tokio::time::timeout(STOP_TIMEOUT, task).await.is_err() {
                tracing::warn!(rank, task = i, "prefetcher task did not stop in time");
                handle.abort();
            }
        }
    }

    pub async fn stop_all(&self) {
        for rank in self.ranks() {
            self.stop(rank).await;
        }
        self.shutdown.cancel();
        if let Some(task) = self.sync_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

/// All live prefetchers of a node, keyed by iteration id.
#[derive(Default)]
pub struct PrefetcherPool {
    prefetchers: Mutex<HashMap<String, Arc<Prefetcher>>>,
}

impl PrefetcherPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, iteration_id: &str) -> Option<Arc<Prefetcher>> {
        self.prefetchers.lock().unwrap().get(iteration_id).cloned()
    }

    /// Return the iteration's prefetcher, creating it on first use.
    pub fn get_or_create(
        &self,
        iteration_id: &str,
        build: impl FnOnce() -> Arc<Prefetcher>,
    ) -> Arc<Prefetcher> {
        self.prefetchers
            .lock()
            .unwrap()
            .entry(iteration_id.to_string())
            .or_insert_with(build)
            .clone()
    }

    pub async fn shutdown(&self) {
        let prefetchers: Vec<Arc<Prefetcher>> = {
            let mut map = self.prefetchers.lock().unwrap();
            map.drain().map(|(_, p)| p).collect()
        };
        for prefetcher in prefetchers {
            prefetcher.stop_all().await;
        }
        tracing::debug!("prefetcher pool shut down");
    }
}
