//! Durable draw/jackpot stores, raw response archive and HTTP fetch utilities for lottrack.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, Utc};
use fs4::fs_std::FileExt;
use lottrack_core::{
    Draw, DrawHistory, JackpotSnapshot, LotteryDomain, StoredDraw, ValidationError, VerifiedRecord,
};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lottrack-storage";

pub const JACKPOTS_FILE: &str = "jackpots.json";

/// Write `bytes` to a fresh temp file next to `path`, then rename it into place.
///
/// Readers either see the previous file or the complete new one.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    write_atomic(path, &bytes).await
}

async fn read_json_if_exists<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .with_context(|| format!("parsing {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

/// Exclusive advisory lock on `<path>.lock`, shared with every other process using the store.
///
/// Released when dropped.
#[derive(Debug)]
struct StoreFileLock {
    _file: std::fs::File,
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

async fn lock_store_file(path: &Path) -> anyhow::Result<StoreFileLock> {
    let lock_path = lock_path_for(path);
    if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }

    tokio::task::spawn_blocking(move || -> anyhow::Result<StoreFileLock> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("opening lock file {}", lock_path.display()))?;
        FileExt::lock_exclusive(&file)
            .with_context(|| format!("locking {}", lock_path.display()))?;
        Ok(StoreFileLock { _file: file })
    })
    .await
    .context("store lock task failed")?
}

fn now_local() -> NaiveDateTime {
    Local::now().naive_local()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyHaveDate,
    DuplicateNumbers { existing: NaiveDate },
    Invalid(ValidationError),
}

impl InsertOutcome {
    pub fn inserted(&self) -> bool {
        matches!(self, InsertOutcome::Inserted)
    }

    pub fn reason(&self) -> String {
        match self {
            InsertOutcome::Inserted => "inserted".to_string(),
            InsertOutcome::AlreadyHaveDate => "already have this date".to_string(),
            InsertOutcome::DuplicateNumbers { existing } => {
                format!("duplicate numbers (already stored under {existing})")
            }
            InsertOutcome::Invalid(err) => format!("invalid draw: {err}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchInsertSummary {
    pub inserted: usize,
    pub already_present: usize,
    pub invalid: usize,
}

fn admit(domain: &LotteryDomain, history: &DrawHistory, draw: &Draw) -> InsertOutcome {
    if let Err(err) = domain.validate(draw) {
        return InsertOutcome::Invalid(err);
    }
    if history.contains_date(draw.date) {
        return InsertOutcome::AlreadyHaveDate;
    }
    if let Some(existing) = history.find_numbers(draw) {
        return InsertOutcome::DuplicateNumbers {
            existing: existing.date,
        };
    }
    InsertOutcome::Inserted
}

/// Append-only, newest-first draw history for one game, backed by a JSON file.
///
/// Every mutation is a locked read-merge-write of the whole file. The in-process mutex
/// orders writers sharing a handle; the `.lock` file orders separate handles and processes.
#[derive(Debug)]
pub struct DrawStore {
    path: PathBuf,
    domain: LotteryDomain,
    write_lock: Mutex<()>,
}

impl DrawStore {
    pub fn new(path: impl Into<PathBuf>, domain: LotteryDomain) -> Self {
        Self {
            path: path.into(),
            domain,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn domain(&self) -> &LotteryDomain {
        &self.domain
    }

    /// Current history; a store that was never written is empty.
    pub async fn load(&self) -> anyhow::Result<DrawHistory> {
        Ok(read_json_if_exists(&self.path)
            .await?
            .unwrap_or_else(|| DrawHistory::empty(&self.domain)))
    }

    pub async fn insert_if_new(&self, record: &VerifiedRecord) -> anyhow::Result<InsertOutcome> {
        let _guard = self.write_lock.lock().await;
        let _file_lock = lock_store_file(&self.path).await?;
        let mut history = self.load().await?;

        let outcome = admit(&self.domain, &history, &record.draw);
        if !outcome.inserted() {
            debug!(
                lottery = %self.domain.key,
                date = %record.draw.date,
                reason = %outcome.reason(),
                "draw not inserted"
            );
            return Ok(outcome);
        }

        let index = history.insertion_index(record.draw.date);
        history.draws.insert(index, StoredDraw::from(record));
        history.last_updated = Some(now_local());
        write_json_atomic(&self.path, &history).await?;

        info!(
            lottery = %self.domain.key,
            draw = %record.draw,
            confidence = %record.confidence,
            "stored verified draw"
        );
        Ok(outcome)
    }

    /// Same admission rules as [`DrawStore::insert_if_new`], applied to a batch in one rewrite.
    pub async fn insert_all_if_new(
        &self,
        draws: impl IntoIterator<Item = StoredDraw>,
    ) -> anyhow::Result<BatchInsertSummary> {
        let _guard = self.write_lock.lock().await;
        let _file_lock = lock_store_file(&self.path).await?;
        let mut history = self.load().await?;
        let mut summary = BatchInsertSummary::default();

        for stored in draws {
            match admit(&self.domain, &history, &stored.draw) {
                InsertOutcome::Inserted => {
                    let index = history.insertion_index(stored.draw.date);
                    history.draws.insert(index, stored);
                    summary.inserted += 1;
                }
                InsertOutcome::Invalid(err) => {
                    warn!(lottery = %self.domain.key, error = %err, "rejecting invalid draw");
                    summary.invalid += 1;
                }
                InsertOutcome::AlreadyHaveDate | InsertOutcome::DuplicateNumbers { .. } => {
                    summary.already_present += 1;
                }
            }
        }

        if summary.inserted > 0 {
            history.last_updated = Some(now_local());
            write_json_atomic(&self.path, &history).await?;
        }
        Ok(summary)
    }
}

/// All jackpot snapshots, one entry per game key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JackpotBoard {
    #[serde(default)]
    pub last_updated: Option<NaiveDateTime>,
    #[serde(flatten)]
    pub entries: BTreeMap<String, JackpotSnapshot>,
}

#[derive(Debug)]
pub struct JackpotStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JackpotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> anyhow::Result<JackpotBoard> {
        Ok(read_json_if_exists(&self.path).await?.unwrap_or_default())
    }

    /// Replace the snapshot for `key`, leaving other games untouched.
    pub async fn put(&self, key: &str, snapshot: JackpotSnapshot) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        let _file_lock = lock_store_file(&self.path).await?;
        let mut board = self.load().await?;
        board.entries.insert(key.to_string(), snapshot);
        board.last_updated = Some(now_local());
        write_json_atomic(&self.path, &board).await
    }
}

/// Data directory holding one [`DrawStore`] per game plus the jackpot file.
///
/// Handing out shared store handles keeps a single writer lock per game for the whole process.
#[derive(Debug)]
pub struct DataDir {
    root: PathBuf,
    draw_stores: Mutex<HashMap<String, Arc<DrawStore>>>,
    jackpots: Arc<JackpotStore>,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let jackpots = Arc::new(JackpotStore::new(root.join(JACKPOTS_FILE)));
        Self {
            root,
            draw_stores: Mutex::new(HashMap::new()),
            jackpots,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn draw_store(&self, domain: &LotteryDomain) -> Arc<DrawStore> {
        let mut stores = self.draw_stores.lock().await;
        stores
            .entry(domain.key.clone())
            .or_insert_with(|| {
                Arc::new(DrawStore::new(
                    self.root.join(domain.store_file_name()),
                    domain.clone(),
                ))
            })
            .clone()
    }

    pub fn jackpot_store(&self) -> Arc<JackpotStore> {
        self.jackpots.clone()
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedResponse {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub deduplicated: bool,
}

/// Immutable, hash-addressed archive of raw response bodies.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn relative_path_for(
        fetched_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = match extension.trim_start_matches('.').trim() {
            "" => "bin",
            ext => ext,
        };
        PathBuf::from(fetched_at.format("%Y%m%d_%H%M%S").to_string())
            .join(source_id)
            .join(format!("{content_hash}.{ext}"))
    }

    pub async fn archive(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedResponse> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::relative_path_for(fetched_at, source_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let exists = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?;
        if !exists {
            write_atomic(&absolute_path, bytes).await?;
        }

        Ok(ArchivedResponse {
            content_hash,
            relative_path,
            deduplicated: exists,
        })
    }
}

fn extension_for(content_type: Option<&str>) -> &'static str {
    let content_type = content_type.unwrap_or_default().to_ascii_lowercase();
    if content_type.contains("csv") {
        "csv"
    } else if content_type.contains("xml") || content_type.contains("rss") {
        "xml"
    } else if content_type.contains("html") {
        "html"
    } else if content_type.contains("json") {
        "json"
    } else {
        "bin"
    }
}

pub const MIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            global_concurrency: 8,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
            }
        } else {
            FetchError::Request {
                url: url.to_string(),
                source: err,
            }
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Timeout { .. })
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedResponse {
    /// Body decoded as UTF-8, dropping invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Single-attempt HTTP GET client shared by every adapter.
///
/// No retries happen here; a failed source simply sits out the cycle.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    archive: Option<ArtifactStore>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,text/csv;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));

        let timeout = config.timeout.clamp(MIN_REQUEST_TIMEOUT, MAX_REQUEST_TIMEOUT);
        let user_agent = config
            .user_agent
            .unwrap_or_else(|| BROWSER_USER_AGENT.to_string());

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .user_agent(user_agent)
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            archive: None,
        })
    }

    pub fn with_archive(mut self, archive: ArtifactStore) -> Self {
        self.archive = Some(archive);
        self
    }

    pub async fn fetch(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        async {
            let _permit = self
                .global_limit
                .acquire()
                .await
                .expect("semaphore not closed");

            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|err| FetchError::from_reqwest(url, err))?;

            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = resp
                .bytes()
                .await
                .map_err(|err| FetchError::from_reqwest(url, err))?
                .to_vec();
            debug!(bytes = body.len(), %status, "fetched");

            let fetched = FetchedResponse {
                status,
                final_url,
                content_type,
                body,
                fetched_at: Utc::now(),
            };
            self.archive_response(source_id, &fetched).await;
            Ok::<_, FetchError>(fetched)
        }
        .instrument(span)
        .await
    }

    async fn archive_response(&self, source_id: &str, fetched: &FetchedResponse) {
        let Some(archive) = &self.archive else {
            return;
        };
        let ext = extension_for(fetched.content_type.as_deref());
        if let Err(err) = archive
            .archive(fetched.fetched_at, source_id, ext, &fetched.body)
            .await
        {
            warn!(source_id, error = %err, "failed to archive raw response");
        }
    }
}
