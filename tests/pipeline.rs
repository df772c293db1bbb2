//! End-to-end pipeline scenarios against a scratch SQLite database, with
//! in-process fakes for git, the embedding service and the vector store.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use repo_indexer::cache::EmbeddingCache;
use repo_indexer::config::Config;
use repo_indexer::core::chunk::LineChunker;
use repo_indexer::core::embedding::{BatchLimits, EmbeddingProvider};
use repo_indexer::core::models::{content_digest, Repository, RunStatus};
use repo_indexer::core::status::Status;
use repo_indexer::core::store::memory::InMemoryVectorStore;
use repo_indexer::core::store::{VectorFilter, VectorStore};
use repo_indexer::db::Db;
use repo_indexer::error::{IndexError, StorageError};
use repo_indexer::files::FileStore;
use repo_indexer::git::{CheckoutInfo, FetchError, RepoFetcher};
use repo_indexer::migrate;
use repo_indexer::pipeline::{Collaborators, Orchestrator};
use repo_indexer::queue::{Claim, JobQueue};
use repo_indexer::repos::RepoStore;
use repo_indexer::runs::RunStore;
use repo_indexer::worker::WorkerPool;

const DIMS: usize = 8;
const FAIL_MARKER: &str = "EMBED_FAIL";

// ============ Fakes ============

/// "Clones" by copying a local directory into the checkout path.
struct DirFetcher {
    source: PathBuf,
    commit: Mutex<String>,
}

impl DirFetcher {
    fn new(source: &Path) -> Self {
        Self {
            source: source.to_path_buf(),
            commit: Mutex::new("c0ffee01".into()),
        }
    }

    fn set_commit(&self, commit: &str) {
        *self.commit.lock().unwrap() = commit.to_string();
    }
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

#[async_trait]
impl RepoFetcher for DirFetcher {
    async fn fetch(&self, _repo: &Repository, dest: &Path) -> Result<CheckoutInfo, FetchError> {
        if dest.exists() {
            fs::remove_dir_all(dest).map_err(|e| FetchError::Clone(e.to_string()))?;
        }
        copy_dir(&self.source, dest).map_err(|e| FetchError::Clone(e.to_string()))?;
        Ok(CheckoutInfo {
            root: dest.to_path_buf(),
            commit: self.commit.lock().unwrap().clone(),
            branch: "main".into(),
        })
    }
}

struct FailingFetcher;

#[async_trait]
impl RepoFetcher for FailingFetcher {
    async fn fetch(&self, _repo: &Repository, _dest: &Path) -> Result<CheckoutInfo, FetchError> {
        Err(FetchError::Clone(
            "git clone failed: Authentication failed for 'https://github.com/acme/private'".into(),
        ))
    }
}

/// Deterministic embeddings derived from the text digest. Counts calls and
/// embedded texts; fails any batch containing [`FAIL_MARKER`]. Optionally
/// sleeps per call, or fires a cancellation token on its first call.
#[derive(Default)]
struct CountingProvider {
    calls: AtomicUsize,
    texts: AtomicUsize,
    delay: Option<Duration>,
    cancel_on_first_call: Option<CancellationToken>,
}

impl CountingProvider {
    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn cancelling(token: CancellationToken) -> Self {
        Self {
            cancel_on_first_call: Some(token),
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn fake_vector(text: &str) -> Vec<f32> {
    content_digest(text.as_bytes())
        .bytes()
        .take(DIMS)
        .map(|b| b as f32 / 255.0 + 0.01)
        .collect()
}

#[async_trait]
impl EmbeddingProvider for CountingProvider {
    fn model_name(&self) -> &str {
        "test-model"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    fn limits(&self) -> BatchLimits {
        BatchLimits {
            max_items: 4,
            max_item_chars: 4000,
            max_batch_chars: 16_000,
        }
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let (0, Some(token)) = (call, &self.cancel_on_first_call) {
            token.cancel();
        }
        if texts.iter().any(|t| t.contains(FAIL_MARKER)) {
            bail!("embedding service returned 500");
        }
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| fake_vector(t)).collect())
    }
}

// ============ Harness ============

struct Harness {
    tmp: TempDir,
    db: Db,
    config: Config,
    repos: RepoStore,
    queue: JobQueue,
    vectors: Arc<InMemoryVectorStore>,
    provider: Arc<CountingProvider>,
    cache: Arc<EmbeddingCache>,
}

impl Harness {
    async fn new() -> Self {
        Self::with_provider(CountingProvider::default()).await
    }

    async fn with_provider(provider: CountingProvider) -> Self {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::with_db(tmp.path().join("data/rix.sqlite"));
        config.indexing.clone_dir = tmp.path().join("checkouts");
        config.cache.max_entries = 10_000;

        let db = Db::open(&config).await.unwrap();
        migrate::run_migrations(db.pool()).await.unwrap();

        Self {
            repos: RepoStore::new(db.clone()),
            queue: JobQueue::new(db.clone()),
            vectors: Arc::new(InMemoryVectorStore::new()),
            provider: Arc::new(provider),
            cache: Arc::new(EmbeddingCache::new(db.clone(), &config.cache)),
            tmp,
            db,
            config,
        }
    }

    fn source_dir(&self, name: &str) -> PathBuf {
        let dir = self.tmp.path().join("sources").join(name);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn orchestrator(&self, fetcher: Arc<dyn RepoFetcher>) -> Orchestrator {
        let parts = Collaborators {
            fetcher,
            chunker: Arc::new(LineChunker::new(self.config.chunking.max_tokens)),
            provider: self.provider.clone(),
            vectors: self.vectors.clone(),
        };
        Orchestrator::new(self.db.clone(), &self.config, self.cache.clone(), parts).unwrap()
    }

    async fn files(&self, repository_id: i64) -> Vec<(String, String)> {
        FileStore::new(self.db.clone())
            .list_for_repository(repository_id)
            .await
            .unwrap()
            .into_iter()
            .map(|f| (f.path, f.content_hash))
            .collect()
    }

    async fn reindex(&self, id: i64) -> Repository {
        self.queue.request_reindex(id).await.unwrap()
    }

    async fn claim(&self) -> Repository {
        match self.queue.claim().await.unwrap() {
            Claim::Claimed(repo) => repo,
            Claim::NoWork => panic!("expected a pending repository"),
        }
    }

    /// Poll until `id` reaches `status`.
    async fn wait_for_status(&self, id: i64, status: Status) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        while self.repos.get(id).await.unwrap().status != status {
            assert!(
                tokio::time::Instant::now() < deadline,
                "repository {} never reached {}",
                id,
                status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn write(root: &Path, rel: &str, body: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, body).unwrap();
}

/// Ten small source files across a few directories.
fn seed_ten_files(root: &Path) {
    for i in 0..10 {
        let dir = match i % 3 {
            0 => "src",
            1 => "src/util",
            _ => "docs",
        };
        let ext = if dir == "docs" { "md" } else { "rs" };
        write(
            root,
            &format!("{}/file{}.{}", dir, i, ext),
            &format!("// file {}\nfn f{}() -> u32 {{\n    {}\n}}\n", i, i, i),
        );
    }
}

/// `count` one-line modules, one chunk each.
fn seed_modules(root: &Path, count: usize) {
    for i in 0..count {
        write(root, &format!("src/m{}.rs", i), &format!("pub fn m{}() -> usize {{ {} }}\n", i, i));
    }
}

// ============ Scenarios ============

#[tokio::test]
async fn first_run_indexes_every_file() {
    let h = Harness::new().await;
    let source = h.source_dir("api");
    seed_ten_files(&source);
    let orchestrator = h.orchestrator(Arc::new(DirFetcher::new(&source)));

    let repo = h.repos.create(1, "https://github.com/acme/api").await.unwrap();
    let report = orchestrator
        .run(repo.clone(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.stats.files_added, 10);
    assert_eq!(report.stats.files_changed, 0);
    assert_eq!(report.stats.files_deleted, 0);
    assert_eq!(report.stats.files_failed, 0);
    assert_eq!(report.commit, "c0ffee01");

    let stored = h.repos.get(repo.id).await.unwrap();
    assert_eq!(stored.status, Status::Completed);
    assert_eq!(stored.file_count, 10);
    assert_eq!(stored.last_commit_sha.as_deref(), Some("c0ffee01"));
    assert!(stored.error_message.is_none());

    let files = h.files(repo.id).await;
    assert_eq!(files.len(), 10);
    let checkout = h.config.indexing.clone_dir.join(repo.id.to_string());
    for (path, digest) in &files {
        let bytes = fs::read(checkout.join(path)).unwrap();
        assert_eq!(digest, &content_digest(&bytes), "digest mismatch for {}", path);
    }

    let points = h
        .vectors
        .count(&VectorFilter::repository(1, repo.id))
        .await
        .unwrap();
    assert_eq!(points, report.stats.chunks_indexed);
    assert_eq!(stored.chunk_count as u64, report.stats.chunks_indexed);

    let runs = RunStore::new(h.db.clone()).list(repo.id, 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Completed);
    assert_eq!(runs[0].stats.files_added, 10);
    assert_eq!(runs[0].to_commit.as_deref(), Some("c0ffee01"));
}

#[tokio::test]
async fn rerun_after_edit_and_delete() {
    let h = Harness::new().await;
    let source = h.source_dir("api");
    seed_ten_files(&source);
    let fetcher = Arc::new(DirFetcher::new(&source));
    let orchestrator = h.orchestrator(fetcher.clone());

    let repo = h.repos.create(1, "https://github.com/acme/api").await.unwrap();
    orchestrator.run(repo.clone(), &CancellationToken::new()).await.unwrap();

    let removed_id = FileStore::new(h.db.clone())
        .list_for_repository(repo.id)
        .await
        .unwrap()
        .into_iter()
        .find(|f| f.path == "src/file3.rs")
        .unwrap()
        .id;

    write(&source, "src/file0.rs", "// file 0, edited\nfn f0() -> u32 {\n    100\n}\n");
    fs::remove_file(source.join("src/file3.rs")).unwrap();
    fetcher.set_commit("deadbeef");

    let again = h.reindex(repo.id).await;
    let report = orchestrator.run(again, &CancellationToken::new()).await.unwrap();

    assert_eq!(report.stats.files_added, 0);
    assert_eq!(report.stats.files_changed, 1);
    assert_eq!(report.stats.files_deleted, 1);
    assert_eq!(report.stats.files_unchanged, 8);

    let paths = h.vectors.file_paths(&VectorFilter::repository(1, repo.id));
    assert!(!paths.contains(&"src/file3.rs".to_string()));
    assert_eq!(
        h.vectors
            .count(&VectorFilter::file(1, repo.id, removed_id))
            .await
            .unwrap(),
        0
    );
    assert_eq!(paths.len(), 9);

    let files = h.files(repo.id).await;
    assert_eq!(files.len(), 9);
    let edited = files.iter().find(|(p, _)| p == "src/file0.rs").unwrap();
    assert_eq!(
        edited.1,
        content_digest(b"// file 0, edited\nfn f0() -> u32 {\n    100\n}\n")
    );

    let stored = h.repos.get(repo.id).await.unwrap();
    assert_eq!(stored.status, Status::Completed);
    assert_eq!(stored.file_count, 9);
    assert_eq!(stored.last_commit_sha.as_deref(), Some("deadbeef"));

    let runs = RunStore::new(h.db.clone()).list(repo.id, 10).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].from_commit.as_deref(), Some("c0ffee01"));
    assert_eq!(runs[0].to_commit.as_deref(), Some("deadbeef"));
}

#[tokio::test]
async fn unchanged_rerun_makes_no_embedding_calls() {
    let h = Harness::new().await;
    let source = h.source_dir("api");
    seed_ten_files(&source);
    let orchestrator = h.orchestrator(Arc::new(DirFetcher::new(&source)));

    let repo = h.repos.create(1, "https://github.com/acme/api").await.unwrap();
    let first = orchestrator.run(repo.clone(), &CancellationToken::new()).await.unwrap();
    let calls_after_first = h.provider.calls();
    assert!(calls_after_first > 0);
    let vectors_after_first = h.vectors.count(&VectorFilter::workspace(1)).await.unwrap();

    let again = h.reindex(repo.id).await;
    let second = orchestrator.run(again, &CancellationToken::new()).await.unwrap();

    assert_eq!(second.stats.files_added, 0);
    assert_eq!(second.stats.files_changed, 0);
    assert_eq!(second.stats.files_unchanged, 10);
    assert_eq!(second.stats.chunks_indexed, 0);
    assert_eq!(h.provider.calls(), calls_after_first);
    assert_eq!(
        h.vectors.count(&VectorFilter::workspace(1)).await.unwrap(),
        vectors_after_first
    );
    assert_eq!(
        h.repos.get(repo.id).await.unwrap().chunk_count as u64,
        first.stats.chunks_indexed
    );
}

#[tokio::test]
async fn identical_content_is_served_from_cache() {
    let h = Harness::new().await;
    let source = h.source_dir("shared");
    seed_ten_files(&source);
    let orchestrator = h.orchestrator(Arc::new(DirFetcher::new(&source)));

    let a = h.repos.create(1, "https://github.com/acme/one").await.unwrap();
    let first = orchestrator.run(a, &CancellationToken::new()).await.unwrap();
    assert_eq!(first.stats.cache_hits, 0);
    let calls = h.provider.calls();

    // Same files in another workspace: every chunk is a cache hit.
    let b = h.repos.create(2, "https://github.com/acme/two").await.unwrap();
    let second = orchestrator.run(b.clone(), &CancellationToken::new()).await.unwrap();
    assert_eq!(second.stats.files_added, 10);
    assert_eq!(second.stats.cache_misses, 0);
    assert_eq!(second.stats.cache_hits, first.stats.chunks_indexed);
    assert_eq!(h.provider.calls(), calls);
    assert_eq!(
        h.vectors.count(&VectorFilter::workspace(2)).await.unwrap(),
        second.stats.chunks_indexed
    );
}

#[tokio::test]
async fn embedding_failure_skips_file_but_completes() {
    let h = Harness::new().await;
    let source = h.source_dir("api");
    seed_ten_files(&source);
    write(&source, "src/broken.rs", &format!("// {}\nfn broken() {{}}\n", FAIL_MARKER));
    let orchestrator = h.orchestrator(Arc::new(DirFetcher::new(&source)));

    let repo = h.repos.create(1, "https://github.com/acme/api").await.unwrap();
    let report = orchestrator.run(repo.clone(), &CancellationToken::new()).await.unwrap();

    assert_eq!(report.stats.files_failed, 1);
    let stored = h.repos.get(repo.id).await.unwrap();
    assert_eq!(stored.status, Status::Completed);
    assert!(stored.error_message.is_none());
    assert_eq!(stored.file_count, 10);

    let paths = h.vectors.file_paths(&VectorFilter::repository(1, repo.id));
    assert!(!paths.contains(&"src/broken.rs".to_string()));
    assert_eq!(paths.len(), 10);
    assert!(h.files(repo.id).await.iter().all(|(p, _)| p != "src/broken.rs"));

    let runs = RunStore::new(h.db.clone()).list(repo.id, 1).await.unwrap();
    assert_eq!(runs[0].status, RunStatus::Completed);
    assert_eq!(runs[0].stats.files_failed, 1);
    assert_eq!(runs[0].stats.chunks_indexed, stored.chunk_count as u64);
}

#[tokio::test]
async fn clone_failure_marks_repository_failed() {
    let h = Harness::new().await;
    let orchestrator = h.orchestrator(Arc::new(FailingFetcher));

    let repo = h.repos.create(1, "https://github.com/acme/private").await.unwrap();
    let err = orchestrator
        .run(repo.clone(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, IndexError::Clone(_)));

    let stored = h.repos.get(repo.id).await.unwrap();
    assert_eq!(stored.status, Status::Failed);
    let message = stored.error_message.unwrap();
    assert!(message.starts_with("clone failed:"), "got {}", message);
    assert!(h.files(repo.id).await.is_empty());
    assert_eq!(h.provider.calls(), 0);

    let runs = RunStore::new(h.db.clone()).list(repo.id, 1).await.unwrap();
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert!(runs[0].error.as_deref().unwrap_or("").contains("Authentication failed"));

    // A failed repository can be queued again.
    assert_eq!(h.reindex(repo.id).await.status, Status::Pending);
}

#[tokio::test]
async fn empty_and_binary_files() {
    let h = Harness::new().await;
    let source = h.source_dir("odd");
    write(&source, "src/lib.rs", "pub fn ok() {}\n");
    write(&source, "src/empty.rs", "");
    fs::write(source.join("notes.txt"), [0xff, 0xfe, 0x00, 0x41]).unwrap();
    let orchestrator = h.orchestrator(Arc::new(DirFetcher::new(&source)));

    let repo = h.repos.create(1, "https://github.com/acme/odd").await.unwrap();
    let report = orchestrator.run(repo.clone(), &CancellationToken::new()).await.unwrap();
    assert_eq!(report.stats.files_added, 3);
    assert_eq!(report.stats.files_failed, 1);
    assert_eq!(report.stats.chunks_indexed, 1);

    let files = h.files(repo.id).await;
    let paths: Vec<&str> = files.iter().map(|(p, _)| p.as_str()).collect();
    assert_eq!(paths, vec!["src/empty.rs", "src/lib.rs"]);

    // The empty file stays unchanged; the undecodable one is retried.
    let again = h.reindex(repo.id).await;
    let second = orchestrator.run(again, &CancellationToken::new()).await.unwrap();
    assert_eq!(second.stats.files_unchanged, 2);
    assert_eq!(second.stats.files_added, 1);
    assert_eq!(second.stats.files_failed, 1);
}

#[tokio::test]
async fn cancelled_run_leaves_status_untouched() {
    let h = Harness::new().await;
    let source = h.source_dir("api");
    seed_ten_files(&source);
    let orchestrator = h.orchestrator(Arc::new(DirFetcher::new(&source)));

    let repo = h.repos.create(1, "https://github.com/acme/api").await.unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = orchestrator.run(repo.clone(), &cancel).await.unwrap_err();
    assert!(err.is_cancelled());

    let stored = h.repos.get(repo.id).await.unwrap();
    assert_eq!(stored.status, Status::Cloning);
    assert!(stored.error_message.is_none());
    assert!(h.files(repo.id).await.is_empty());

    let runs = RunStore::new(h.db.clone()).list(repo.id, 1).await.unwrap();
    assert_eq!(runs[0].status, RunStatus::Cancelled);

    // Stale recovery returns it to the queue.
    sqlx::query("UPDATE repositories SET updated_at = 0 WHERE id = ?")
        .bind(repo.id)
        .execute(h.db.pool())
        .await
        .unwrap();
    let requeued = h.queue.requeue_stale(Duration::from_secs(60)).await.unwrap();
    assert_eq!(requeued, vec![repo.id]);
}

#[tokio::test]
async fn concurrent_claims_are_exclusive() {
    let h = Harness::new().await;
    let mut expected = HashSet::new();
    for i in 0..20 {
        let repo = h
            .repos
            .create(1, &format!("https://github.com/acme/repo{}", i))
            .await
            .unwrap();
        expected.insert(repo.id);
    }

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let queue = h.queue.clone();
        tasks.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                match queue.claim().await {
                    Ok(Claim::Claimed(repo)) => claimed.push(repo.id),
                    Ok(Claim::NoWork) => break,
                    Err(err) if err.is_transient() => continue,
                    Err(err) => panic!("claim failed: {}", err),
                }
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }
    let unique: HashSet<i64> = all.iter().copied().collect();
    assert_eq!(all.len(), 20, "a repository was claimed twice");
    assert_eq!(unique, expected);
}

#[tokio::test]
async fn worker_pool_drains_queue_and_shuts_down() {
    let h = Harness::new().await;
    let source = h.source_dir("api");
    seed_ten_files(&source);
    let orchestrator = Arc::new(h.orchestrator(Arc::new(DirFetcher::new(&source))));

    let mut ids = Vec::new();
    for i in 0..3 {
        let repo = h
            .repos
            .create(1, &format!("https://github.com/acme/svc{}", i))
            .await
            .unwrap();
        ids.push(repo.id);
    }

    let handle = WorkerPool::new(h.queue.clone(), orchestrator, 2, Duration::from_millis(20)).start();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let mut done = 0;
        for id in &ids {
            if h.repos.get(*id).await.unwrap().status == Status::Completed {
                done += 1;
            }
        }
        if done == ids.len() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "queue was not drained");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    handle.shutdown();
    let summaries = handle.join().await;
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries.iter().map(|s| s.completed).sum::<u64>(), 3);
    assert_eq!(summaries.iter().map(|s| s.failed).sum::<u64>(), 0);
}

#[tokio::test]
async fn changed_file_with_fewer_chunks_replaces_all_vectors() {
    let h = Harness::new().await;
    let source = h.source_dir("big");
    // Thirty blank-line separated blocks, each too large to merge with the next.
    let body: String = (0..30)
        .map(|i| format!("// block {}\n{}", i, "let x = 1;\n".repeat(140)))
        .collect::<Vec<_>>()
        .join("\n");
    write(&source, "src/big.rs", &body);
    let orchestrator = h.orchestrator(Arc::new(DirFetcher::new(&source)));

    let repo = h.repos.create(1, "https://github.com/acme/big").await.unwrap();
    let first = orchestrator.run(repo.clone(), &CancellationToken::new()).await.unwrap();
    assert_eq!(first.stats.chunks_indexed, 30);
    let scope = VectorFilter::repository(1, repo.id);
    assert_eq!(h.vectors.count(&scope).await.unwrap(), 30);

    write(&source, "src/big.rs", "pub fn small() {}\n");
    let again = h.reindex(repo.id).await;
    let second = orchestrator.run(again, &CancellationToken::new()).await.unwrap();

    assert_eq!(second.stats.files_changed, 1);
    assert_eq!(second.stats.chunks_indexed, 1);
    assert_eq!(h.vectors.count(&scope).await.unwrap(), 1);
    assert_eq!(h.repos.get(repo.id).await.unwrap().chunk_count, 1);
}

#[tokio::test]
async fn cancel_between_files_keeps_indexing_status() {
    let cancel = CancellationToken::new();
    let h = Harness::with_provider(CountingProvider::cancelling(cancel.clone())).await;
    let source = h.source_dir("api");
    seed_ten_files(&source);
    let orchestrator = h.orchestrator(Arc::new(DirFetcher::new(&source)));

    let repo = h.repos.create(1, "https://github.com/acme/api").await.unwrap();
    let err = orchestrator.run(repo.clone(), &cancel).await.unwrap_err();
    assert!(err.is_cancelled());

    // The file in flight when the token fired was finished; no others.
    assert_eq!(h.files(repo.id).await.len(), 1);
    assert_eq!(h.provider.calls(), 1);

    let stored = h.repos.get(repo.id).await.unwrap();
    assert_eq!(stored.status, Status::Indexing);
    assert!(stored.error_message.is_none());
    assert_eq!(stored.last_commit_sha.as_deref(), Some("c0ffee01"));

    let runs = RunStore::new(h.db.clone()).list(repo.id, 1).await.unwrap();
    assert_eq!(runs[0].status, RunStatus::Cancelled);
}

#[tokio::test]
async fn running_pipeline_is_not_requeued_as_stale() {
    let h = Harness::with_provider(CountingProvider::slow(Duration::from_millis(100))).await;
    let source = h.source_dir("slow");
    seed_modules(&source, 30);
    let orchestrator = Arc::new(h.orchestrator(Arc::new(DirFetcher::new(&source))));

    let repo = h.repos.create(1, "https://github.com/acme/slow").await.unwrap();
    let claimed = h.claim().await;
    let running = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run(claimed, &CancellationToken::new()).await })
    };

    // Well past the staleness threshold, with the run still going.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(h.repos.get(repo.id).await.unwrap().status, Status::Indexing);
    let requeued = h.queue.requeue_stale(Duration::from_secs(1)).await.unwrap();
    assert!(requeued.is_empty(), "live run requeued: {:?}", requeued);
    assert_eq!(h.queue.claim().await.unwrap(), Claim::NoWork);

    let report = running.await.unwrap().unwrap();
    assert_eq!(report.stats.files_added, 30);
    assert_eq!(report.stats.files_failed, 0);
    assert_eq!(h.repos.get(repo.id).await.unwrap().status, Status::Completed);
}

#[tokio::test]
async fn run_stops_when_repository_is_taken_over() {
    let h = Harness::with_provider(CountingProvider::slow(Duration::from_millis(50))).await;
    let source = h.source_dir("slow");
    seed_modules(&source, 30);
    let orchestrator = Arc::new(h.orchestrator(Arc::new(DirFetcher::new(&source))));

    let repo = h.repos.create(1, "https://github.com/acme/slow").await.unwrap();
    let claimed = h.claim().await;
    let running = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run(claimed, &CancellationToken::new()).await })
    };

    h.wait_for_status(repo.id, Status::Indexing).await;
    sqlx::query("UPDATE repositories SET status = 'pending' WHERE id = ?")
        .bind(repo.id)
        .execute(h.db.pool())
        .await
        .unwrap();

    let err = running.await.unwrap().unwrap_err();
    assert!(
        matches!(err, IndexError::Storage(StorageError::Conflict { .. })),
        "unexpected {:?}",
        err
    );
    // The new owner's status is left alone.
    assert_eq!(h.repos.get(repo.id).await.unwrap().status, Status::Pending);
    assert!(h.files(repo.id).await.len() < 30);
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_run() {
    let h = Harness::with_provider(CountingProvider::slow(Duration::from_millis(100))).await;
    let source = h.source_dir("api");
    seed_ten_files(&source);
    let orchestrator = Arc::new(h.orchestrator(Arc::new(DirFetcher::new(&source))));

    let repo = h.repos.create(1, "https://github.com/acme/api").await.unwrap();
    let queued = h.repos.create(1, "https://github.com/acme/later").await.unwrap();
    let handle = WorkerPool::new(h.queue.clone(), orchestrator, 1, Duration::from_millis(20)).start();

    h.wait_for_status(repo.id, Status::Indexing).await;
    handle.shutdown();
    let summaries = handle.join().await;

    let stored = h.repos.get(repo.id).await.unwrap();
    assert_eq!(stored.status, Status::Completed);
    assert_eq!(stored.file_count, 10);
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].completed, 1);
    assert_eq!(summaries[0].cancelled, 0);
    // No new claims after shutdown.
    assert_eq!(h.repos.get(queued.id).await.unwrap().status, Status::Pending);
}

#[tokio::test]
async fn failed_run_open_marks_repository_failed() {
    let h = Harness::new().await;
    let source = h.source_dir("api");
    seed_ten_files(&source);
    let orchestrator = h.orchestrator(Arc::new(DirFetcher::new(&source)));

    let repo = h.repos.create(1, "https://github.com/acme/api").await.unwrap();
    sqlx::query("DROP TABLE index_runs")
        .execute(h.db.pool())
        .await
        .unwrap();

    let err = orchestrator.run(repo.clone(), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, IndexError::Storage(_)));

    let stored = h.repos.get(repo.id).await.unwrap();
    assert_eq!(stored.status, Status::Failed);
    assert!(stored.error_message.unwrap().contains("index_runs"));
    assert_eq!(h.provider.calls(), 0);
}
