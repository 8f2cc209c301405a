use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::JoinHandle,
    time::Duration,
};

use anyhow::Context;

use crate::{
    catalog::{CatalogStore, MemoryCatalog, SearchFilters},
    config::{Config, VectorBackend},
    eid::Eid,
    errors::AppError,
    lists::{ListService, ListShareProtocol, ListStore, MemoryListStore, ShareCode, UserList},
    search::{
        Facets, HybridSearchEngine, KeywordStrategy, SearchPage, SearchStrategy, SemanticStrategy,
        Suggestion,
    },
    semantic::{
        Embedder, EmbeddingModel, HashingEmbedder, MemoryVectorIndex, QdrantIndex,
        UnavailableEmbedder, VectorIndex, VectorStorage, HASHING_MODEL,
    },
    storage::{BackendLocal, StorageManager},
    sync::SyncPipeline,
    task_runner::{self, Job, JobHandle, JobSink, QueueDump, Status, Task, TaskDump, TaskQueue},
};

const VECTORS_FILE: &str = "vectors.bin";

/// Everything the daemon, the CLI and the tests talk to.
pub struct App {
    pub config: Arc<Config>,
    pub catalog: Arc<dyn CatalogStore>,
    pub index: Arc<dyn VectorIndex>,
    pub embedder: Arc<dyn Embedder>,
    pub engine: HybridSearchEngine,
    pub pipeline: Arc<SyncPipeline>,
    pub lists: ListService,
    pub share: ListShareProtocol,
    pub queue: Arc<TaskQueue>,

    task_rx: Mutex<Option<mpsc::Receiver<Job>>>,
    task_queue_handle: Mutex<Option<JoinHandle<()>>>,
}

impl App {
    /// Open the stores under the config's base path and load the embedding model.
    pub fn open(config: Config) -> anyhow::Result<Self> {
        let base_path = config.base_path().to_string();
        let storage: Arc<dyn StorageManager> = Arc::new(
            BackendLocal::new(&base_path).context("failed to open data directory")?,
        );

        let catalog = Arc::new(MemoryCatalog::load(storage.clone()).context("failed to load catalog")?);
        let list_store =
            Arc::new(MemoryListStore::load(storage.clone()).context("failed to load lists")?);

        let embedder = load_embedder(&config, Path::new(&base_path));
        let index = open_index(&config, embedder.as_ref(), storage.path(VECTORS_FILE))?;
        if let Err(err) = index.ensure_collection() {
            log::warn!("vector store not ready, search will use keyword matching: {err}");
        }

        Ok(Self::from_parts(config, storage, catalog, list_store, embedder, index))
    }

    pub fn from_parts(
        config: Config,
        storage: Arc<dyn StorageManager>,
        catalog: Arc<dyn CatalogStore>,
        list_store: Arc<dyn ListStore>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
    ) -> Self {
        let semantic_enabled = config.semantic_search.enabled;

        let keyword: Arc<dyn SearchStrategy> = Arc::new(KeywordStrategy::new(catalog.clone()));
        let semantic: Option<Arc<dyn SearchStrategy>> = semantic_enabled.then(|| {
            Arc::new(SemanticStrategy::new(
                embedder.clone(),
                index.clone(),
                catalog.clone(),
            )) as Arc<dyn SearchStrategy>
        });
        let engine = HybridSearchEngine::new(
            semantic,
            keyword,
            catalog.clone(),
            Duration::from_millis(config.semantic_search.query_timeout_ms),
            config.search.max_page_size,
        );

        let pipeline = SyncPipeline::new(catalog.clone(), embedder.clone(), index.clone());
        let pipeline = Arc::new(if semantic_enabled {
            pipeline
        } else {
            pipeline.without_embeddings()
        });

        let (queue, task_rx) = TaskQueue::new(storage);

        Self {
            lists: ListService::new(list_store.clone(), catalog.clone()),
            share: ListShareProtocol::new(
                list_store,
                catalog.clone(),
                config.share.ttl_secs,
                config.share.code_length,
            ),
            config: Arc::new(config),
            catalog,
            index,
            embedder,
            engine,
            pipeline,
            queue,
            task_rx: Mutex::new(Some(task_rx)),
            task_queue_handle: Mutex::new(None),
        }
    }

    /// Start the background workers and redeliver interrupted jobs.
    /// Calling it again is a no-op.
    pub fn run_queue(&self) -> Result<(), AppError> {
        let Some(task_rx) = self.task_rx.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return Ok(());
        };

        self.queue.recover()?;

        let handle = std::thread::spawn({
            let queue = self.queue.clone();
            let pipeline = self.pipeline.clone();
            let config = self.config.clone();
            move || task_runner::start_queue(task_rx, queue, pipeline, config)
        });
        *self.task_queue_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        Ok(())
    }

    /// Let running jobs finish, stop the workers and persist the vector index.
    pub fn shutdown(&self) {
        let handle = self.task_queue_handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            self.queue.shutdown();
            if handle.join().is_err() {
                log::error!("task queue thread panicked");
            }
        }
        if let Err(err) = self.index.flush() {
            log::error!("failed to flush vector index: {err}");
        }
    }

    pub fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        page: Option<usize>,
        page_size: Option<usize>,
    ) -> Result<SearchPage, AppError> {
        self.engine.search(
            query,
            filters,
            page.unwrap_or(1),
            page_size.unwrap_or(self.config.search.default_page_size),
        )
    }

    pub fn suggestions(&self, prefix: &str, limit: usize) -> Result<Vec<Suggestion>, AppError> {
        self.engine.suggestions(prefix, limit)
    }

    pub fn facets(&self, category_id: Option<u64>) -> Result<Facets, AppError> {
        self.engine.filter_facets(category_id)
    }

    fn submit(&self, task: Task) -> Result<JobHandle, AppError> {
        let id = self.queue.enqueue(task)?;
        Ok(JobHandle {
            id,
            status: Status::Pending,
        })
    }

    /// Queue a feed import. The path must exist now; it is parsed by the job.
    pub fn trigger_sync(&self, feed_path: &Path) -> Result<JobHandle, AppError> {
        let path: PathBuf = std::fs::canonicalize(feed_path).map_err(|err| {
            AppError::Validation(format!("cannot read feed {}: {err}", feed_path.display()))
        })?;
        self.submit(Task::ImportFeed { path })
    }

    /// Queue a forced re-embed of one product, or of every active product.
    pub fn trigger_embedding_update(&self, sku: Option<String>) -> Result<JobHandle, AppError> {
        if let Some(sku) = &sku {
            if self.catalog.get(sku)?.is_none() {
                return Err(AppError::NotFound(format!("product {sku}")));
            }
        }
        self.submit(Task::UpdateEmbedding { sku, force: true })
    }

    pub fn trigger_reconciliation(&self) -> Result<JobHandle, AppError> {
        self.submit(Task::Reconcile)
    }

    pub fn job_status(&self, id: &Eid) -> Result<TaskDump, AppError> {
        self.queue
            .get(id)
            .ok_or_else(|| AppError::NotFound(format!("task {id}")))
    }

    pub fn task_queue(&self) -> QueueDump {
        self.queue.read_queue_dump()
    }

    pub fn generate_share_code(&self, list_id: &Eid, session_id: &str) -> Result<ShareCode, AppError> {
        let list = self.lists.get(list_id)?;
        if list.session_id != session_id {
            return Err(AppError::NotFound(format!("list {list_id}")));
        }
        self.share.generate(list_id)
    }

    pub fn sync_from_code(&self, code: &str, session_id: &str) -> Result<UserList, AppError> {
        self.share.sync(code, session_id)
    }
}

/// The configured model, the built-in hashing embedder, or a stand-in that
/// fails every call when the model could not be loaded.
fn load_embedder(config: &Config, base_path: &Path) -> Arc<dyn Embedder> {
    let semantic = &config.semantic_search;
    if !semantic.enabled {
        return Arc::new(UnavailableEmbedder::new(
            &semantic.model,
            semantic.dimensions,
            "semantic search is disabled".to_string(),
        ));
    }

    if semantic.model == HASHING_MODEL {
        return Arc::new(HashingEmbedder::new(semantic.dimensions));
    }

    let timeout = Duration::from_secs(semantic.download_timeout_secs);
    match EmbeddingModel::new(&semantic.model, base_path.to_path_buf(), Some(timeout)) {
        Ok(model) => {
            log::info!("loaded embedding model {}", semantic.model);
            Arc::new(model)
        }
        Err(err) => {
            log::warn!(
                "failed to load embedding model {}: {err}; falling back to keyword search",
                semantic.model
            );
            Arc::new(UnavailableEmbedder::new(
                &semantic.model,
                semantic.dimensions,
                err.to_string(),
            ))
        }
    }
}

fn open_index(
    config: &Config,
    embedder: &dyn Embedder,
    vectors_path: PathBuf,
) -> anyhow::Result<Arc<dyn VectorIndex>> {
    let dimensions = embedder.dimensions();
    Ok(match config.vector_store.backend {
        VectorBackend::Memory => Arc::new(
            MemoryVectorIndex::open(
                VectorStorage::new(vectors_path),
                embedder.model_id_hash(),
                dimensions,
            )
            .context("failed to open vector index")?,
        ),
        VectorBackend::Qdrant => Arc::new(
            QdrantIndex::new(&config.vector_store, dimensions)
                .context("failed to configure qdrant")?,
        ),
    })
}
