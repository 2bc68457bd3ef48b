//! Update cycle orchestration: registry, cross-source verification, scheduling.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime};
use lottrack_adapters::{
    build_draw_sources, build_jackpot_sources, AdapterContext, DrawSource, DrawSourceSpec,
    JackpotSource, JackpotSourceSpec,
};
use lottrack_core::{
    Confidence, Draw, DrawHistory, DrawResult, JackpotQuote, JackpotSnapshot, LotteryDomain,
    StoredDraw, ValidationError, VerifiedRecord,
};
use lottrack_storage::{ArtifactStore, BatchInsertSummary, DataDir, HttpClientConfig, HttpFetcher};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lottrack-sync";

/// Reason recorded for a game whose fetch work outlived the cycle deadline.
pub const DEADLINE_EXCEEDED: &str = "cycle deadline exceeded";

const BUILTIN_REGISTRY: &str = include_str!("../../../lotteries.yaml");

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub registry_path: PathBuf,
    pub archive_dir: Option<PathBuf>,
    pub interval: Duration,
    pub cooldown: Duration,
    pub cycle_timeout: Duration,
    pub http_timeout_secs: u64,
    pub user_agent: Option<String>,
    pub cron: Vec<String>,
    pub max_iterations: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let secs = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            data_dir: non_empty("LOTTRACK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            registry_path: non_empty("LOTTRACK_REGISTRY")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./lotteries.yaml")),
            archive_dir: non_empty("LOTTRACK_ARCHIVE_DIR").map(PathBuf::from),
            interval: Duration::from_secs(secs("LOTTRACK_INTERVAL_SECS", 1800)),
            cooldown: Duration::from_secs(secs("LOTTRACK_COOLDOWN_SECS", 60)),
            cycle_timeout: Duration::from_secs(secs("LOTTRACK_CYCLE_TIMEOUT_SECS", 300)),
            http_timeout_secs: secs("LOTTRACK_HTTP_TIMEOUT_SECS", 15),
            user_agent: non_empty("LOTTRACK_USER_AGENT"),
            cron: non_empty("LOTTRACK_CRON")
                .map(|v| {
                    v.split(';')
                        .map(str::trim)
                        .filter(|expr| !expr.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            max_iterations: lookup("LOTTRACK_MAX_ITERATIONS").and_then(|v| v.trim().parse().ok()),
        }
    }

    pub fn http_fetcher(&self) -> Result<HttpFetcher> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
            ..Default::default()
        })?;
        Ok(match &self.archive_dir {
            Some(dir) => fetcher.with_archive(ArtifactStore::new(dir.clone())),
            None => fetcher,
        })
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: self.interval,
            cooldown: self.cooldown,
            max_iterations: self.max_iterations,
            cron: self.cron.clone(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// One game in the registry: its domain rules plus the sources polled for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LotteryConfig {
    #[serde(flatten)]
    pub domain: LotteryDomain,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub sources: Vec<DrawSourceSpec>,
    #[serde(default)]
    pub jackpot_sources: Vec<JackpotSourceSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LotteryRegistry {
    pub lotteries: Vec<LotteryConfig>,
}

impl LotteryRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing lottery registry")?;
        registry.check()?;
        Ok(registry)
    }

    /// Registry compiled into the binary from the shipped `lotteries.yaml`.
    pub fn builtin() -> Result<Self> {
        Self::from_yaml_str(BUILTIN_REGISTRY).context("loading built-in registry")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub async fn load_or_builtin(path: &Path) -> Result<Self> {
        let exists = tokio::fs::try_exists(path)
            .await
            .with_context(|| format!("checking registry file {}", path.display()))?;
        if exists {
            Self::load(path).await
        } else {
            info!(path = %path.display(), "registry file not found; using built-in lotteries");
            Self::builtin()
        }
    }

    fn check(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for lottery in &self.lotteries {
            let domain = &lottery.domain;
            if domain.key.trim().is_empty() {
                bail!("lottery {:?} has an empty key", domain.name);
            }
            if !seen.insert(domain.key.to_ascii_uppercase()) {
                bail!("duplicate lottery key {}", domain.key);
            }
            if domain.main_count == 0 || usize::from(domain.main_max) < domain.main_count {
                bail!(
                    "{}: main_max {} cannot hold {} distinct numbers",
                    domain.key,
                    domain.main_max,
                    domain.main_count
                );
            }
            if domain.bonus_max == 0 {
                bail!("{}: bonus_max must be positive", domain.key);
            }
            if domain.draw_weekdays.is_empty() {
                bail!("{}: no draw weekdays configured", domain.key);
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&LotteryConfig> {
        self.lotteries
            .iter()
            .find(|lottery| lottery.domain.key.eq_ignore_ascii_case(key))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &LotteryConfig> {
        self.lotteries.iter().filter(|lottery| lottery.enabled)
    }
}

fn describe_candidates(candidates: &[(&DrawResult, &Draw)]) -> String {
    candidates
        .iter()
        .map(|(result, draw)| format!("{}={}", result.source_id, draw))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Reduce one game's source results to the single record worth storing.
///
/// Failures are ignored. The largest group of sources agreeing on identical numbers
/// wins (ties go to the group holding the most trusted source) and takes its date from
/// its most trusted member. With no agreement the most trusted source wins alone.
pub fn verify(lottery: &str, results: &[DrawResult]) -> Option<VerifiedRecord> {
    let mut candidates: Vec<(&DrawResult, &Draw)> = results
        .iter()
        .filter_map(|result| result.candidate().map(|draw| (result, draw)))
        .collect();
    candidates.sort_by(|a, b| {
        a.0.priority
            .cmp(&b.0.priority)
            .then_with(|| a.0.source_id.cmp(&b.0.source_id))
    });

    let (best, best_draw) = *candidates.first()?;
    if candidates.len() == 1 {
        return Some(VerifiedRecord {
            draw: best_draw.clone(),
            verified_by: vec![best.source_id.clone()],
            confidence: Confidence::Fallback,
        });
    }

    // Ordered by each group's most trusted member.
    let mut groups: Vec<Vec<(&DrawResult, &Draw)>> = Vec::new();
    for &(result, draw) in &candidates {
        match groups.iter_mut().find(|group| group[0].1.same_numbers(draw)) {
            Some(group) => group.push((result, draw)),
            None => groups.push(vec![(result, draw)]),
        }
    }

    let mut winner: Option<&Vec<(&DrawResult, &Draw)>> = None;
    for group in groups.iter().filter(|group| group.len() >= 2) {
        if winner.map_or(true, |current| group.len() > current.len()) {
            winner = Some(group);
        }
    }

    if let Some(group) = winner {
        if group.len() < candidates.len() {
            warn!(
                lottery,
                disagreement = %describe_candidates(&candidates),
                "sources disagree; agreeing majority wins"
            );
        }
        return Some(VerifiedRecord {
            draw: group[0].1.clone(),
            verified_by: group
                .iter()
                .map(|(result, _)| result.source_id.clone())
                .collect(),
            confidence: Confidence::Agreed,
        });
    }

    warn!(
        lottery,
        source = %best.source_id,
        disagreement = %describe_candidates(&candidates),
        "no two sources agree; using highest-priority source"
    );
    Some(VerifiedRecord {
        draw: best_draw.clone(),
        verified_by: vec![best.source_id.clone()],
        confidence: Confidence::Fallback,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrawStatus {
    Inserted(NaiveDate),
    Skipped(String),
    Failed(String),
}

impl fmt::Display for DrawStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrawStatus::Inserted(date) => write!(f, "INSERTED({date})"),
            DrawStatus::Skipped(reason) => write!(f, "SKIPPED({reason})"),
            DrawStatus::Failed(reason) => write!(f, "FAILED({reason})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JackpotStatus {
    Updated(String),
    Failed(String),
}

impl fmt::Display for JackpotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JackpotStatus::Updated(source) => write!(f, "UPDATED({source})"),
            JackpotStatus::Failed(reason) => write!(f, "FAILED({reason})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LotteryOutcome {
    pub key: String,
    pub draw: DrawStatus,
    pub jackpot: JackpotStatus,
    /// What the verifier settled on, whether or not it was stored.
    pub record: Option<VerifiedRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: NaiveDateTime,
    pub finished_at: NaiveDateTime,
    pub outcomes: Vec<LotteryOutcome>,
}

impl CycleReport {
    pub fn inserted_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome.draw, DrawStatus::Inserted(_)))
            .count()
    }

    pub fn outcome(&self, key: &str) -> Option<&LotteryOutcome> {
        self.outcomes
            .iter()
            .find(|outcome| outcome.key.eq_ignore_ascii_case(key))
    }
}

/// Notified after a cycle that stored at least one new draw.
pub trait CycleHook: Send + Sync {
    fn on_new_draws(&self, report: &CycleReport) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct LoggingCycleHook;

impl CycleHook for LoggingCycleHook {
    fn on_new_draws(&self, report: &CycleReport) -> Result<()> {
        for outcome in &report.outcomes {
            if let DrawStatus::Inserted(date) = outcome.draw {
                info!(lottery = %outcome.key, %date, "new draw ready for downstream evaluation");
            }
        }
        Ok(())
    }
}

/// Instantiated adapters for one enabled game.
pub struct LotteryPlan {
    pub domain: LotteryDomain,
    pub draw_sources: Vec<Arc<dyn DrawSource>>,
    pub jackpot_sources: Vec<Arc<dyn JackpotSource>>,
}

impl LotteryPlan {
    pub fn from_config(config: &LotteryConfig) -> Self {
        Self {
            domain: config.domain.clone(),
            draw_sources: build_draw_sources(&config.sources),
            jackpot_sources: build_jackpot_sources(&config.jackpot_sources),
        }
    }
}

pub struct UpdateOrchestrator {
    http: Arc<HttpFetcher>,
    data: Arc<DataDir>,
    plans: Vec<LotteryPlan>,
    cycle_timeout: Duration,
    hook: Arc<dyn CycleHook>,
}

impl UpdateOrchestrator {
    pub fn new(config: &SyncConfig, registry: &LotteryRegistry) -> Result<Self> {
        let http = Arc::new(config.http_fetcher()?);
        let data = Arc::new(DataDir::new(config.data_dir.clone()));
        let plans = registry.enabled().map(LotteryPlan::from_config).collect();
        Ok(Self::from_parts(http, data, plans, config.cycle_timeout))
    }

    pub fn from_parts(
        http: Arc<HttpFetcher>,
        data: Arc<DataDir>,
        plans: Vec<LotteryPlan>,
        cycle_timeout: Duration,
    ) -> Self {
        Self {
            http,
            data,
            plans,
            cycle_timeout,
            hook: Arc::new(LoggingCycleHook),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn CycleHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn data_dir(&self) -> &Arc<DataDir> {
        &self.data
    }

    pub async fn run_cycle(&self) -> CycleReport {
        self.run_cycle_at(Local::now().naive_local()).await
    }

    /// One pass over every game, treating `now` as the local wall-clock time.
    pub async fn run_cycle_at(&self, now: NaiveDateTime) -> CycleReport {
        let run_id = Uuid::new_v4();
        let ctx = AdapterContext::new(run_id, now);
        let started_at = Local::now().naive_local();
        let deadline = Instant::now() + self.cycle_timeout;
        info!(%run_id, lotteries = self.plans.len(), "update cycle started");

        let mut outcomes = Vec::with_capacity(self.plans.len());
        for plan in &self.plans {
            let span = info_span!("lottery", %run_id, key = %plan.domain.key);
            let outcome = self.run_lottery(plan, &ctx, deadline).instrument(span).await;
            info!(
                lottery = %outcome.key,
                draw = %outcome.draw,
                jackpot = %outcome.jackpot,
                "lottery processed"
            );
            outcomes.push(outcome);
        }

        let report = CycleReport {
            run_id,
            started_at,
            finished_at: Local::now().naive_local(),
            outcomes,
        };
        info!(%run_id, inserted = report.inserted_count(), "update cycle finished");

        if report.inserted_count() > 0 {
            if let Err(err) = self.hook.on_new_draws(&report) {
                warn!(%run_id, error = %format!("{err:#}"), "cycle hook failed");
            }
        }
        report
    }

    async fn run_lottery(
        &self,
        plan: &LotteryPlan,
        ctx: &AdapterContext,
        deadline: Instant,
    ) -> LotteryOutcome {
        let domain = &plan.domain;

        let (draw, record) = if plan.draw_sources.is_empty() {
            (DrawStatus::Failed("no draw sources configured".to_string()), None)
        } else {
            let verified = timeout_at(deadline, async {
                let results = self.collect_draws(plan, ctx).await;
                let total = results.len();
                (verify(&domain.key, &results), total)
            })
            .await;
            match verified {
                Err(_) => (DrawStatus::Failed(DEADLINE_EXCEEDED.to_string()), None),
                Ok((None, total)) => (
                    DrawStatus::Failed(format!("no valid draw from {total} sources")),
                    None,
                ),
                Ok((Some(record), _)) => (self.store_draw(domain, &record).await, Some(record)),
            }
        };

        let jackpot = match timeout_at(deadline, self.first_jackpot(plan, ctx)).await {
            Err(_) => JackpotStatus::Failed(DEADLINE_EXCEEDED.to_string()),
            Ok(Err(reason)) => JackpotStatus::Failed(reason),
            Ok(Ok((source, quote))) => self.store_jackpot(domain, ctx.now, source, quote).await,
        };

        LotteryOutcome {
            key: domain.key.clone(),
            draw,
            jackpot,
            record,
        }
    }

    async fn collect_draws(&self, plan: &LotteryPlan, ctx: &AdapterContext) -> Vec<DrawResult> {
        let mut set = JoinSet::new();
        for source in &plan.draw_sources {
            let source = Arc::clone(source);
            let http = Arc::clone(&self.http);
            let ctx = ctx.clone();
            let domain = plan.domain.clone();
            set.spawn(async move { source.fetch(&http, &ctx, &domain).await });
        }

        let mut results = Vec::with_capacity(plan.draw_sources.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => error!(lottery = %plan.domain.key, error = %err, "draw adapter task died"),
            }
        }
        results
    }

    async fn store_draw(&self, domain: &LotteryDomain, record: &VerifiedRecord) -> DrawStatus {
        let store = self.data.draw_store(domain).await;
        match store.insert_if_new(record).await {
            Ok(outcome) if outcome.inserted() => {
                debug!(lottery = %domain.key, verified_by = ?record.verified_by, "draw verified and stored");
                DrawStatus::Inserted(record.draw.date)
            }
            Ok(outcome) => DrawStatus::Skipped(outcome.reason()),
            Err(err) => {
                error!(lottery = %domain.key, error = %format!("{err:#}"), "draw store write failed");
                DrawStatus::Failed(format!("store write failed: {err:#}"))
            }
        }
    }

    /// Try jackpot sources in priority order and keep the first quote.
    async fn first_jackpot(
        &self,
        plan: &LotteryPlan,
        ctx: &AdapterContext,
    ) -> Result<(String, JackpotQuote), String> {
        if plan.jackpot_sources.is_empty() {
            return Err("no jackpot sources configured".to_string());
        }
        let mut failures = Vec::new();
        for source in &plan.jackpot_sources {
            let result = source.fetch(&self.http, ctx).await;
            match result.outcome {
                Ok(quote) => return Ok((result.source_id, quote)),
                Err(failure) => failures.push(format!("{}: {}", result.source_id, failure)),
            }
        }
        Err(format!("all jackpot sources failed ({})", failures.join("; ")))
    }

    async fn store_jackpot(
        &self,
        domain: &LotteryDomain,
        now: NaiveDateTime,
        source: String,
        quote: JackpotQuote,
    ) -> JackpotStatus {
        let snapshot = JackpotSnapshot {
            amount: quote.amount,
            cash_value: quote.cash_value,
            next_draw: domain.next_draw_after(now),
            source: Some(source.clone()),
        };
        match self.data.jackpot_store().put(&domain.key, snapshot).await {
            Ok(()) => JackpotStatus::Updated(source),
            Err(err) => {
                error!(lottery = %domain.key, error = %format!("{err:#}"), "jackpot store write failed");
                JackpotStatus::Failed(format!("store write failed: {err:#}"))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    RunningCycle,
    Sleeping,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    /// Extra pause after a failed or panicked cycle, before the normal `interval` sleep.
    pub cooldown: Duration,
    pub max_iterations: Option<u64>,
    /// Extra cron triggers feeding the same loop.
    pub cron: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerSummary {
    pub cycles: u64,
    pub failed: u64,
    pub inserted: usize,
}

/// Runs cycles back to back: one immediately, then one per interval or cron tick.
pub struct Scheduler {
    config: SchedulerConfig,
    state: watch::Sender<SchedulerState>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self { config, state }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    fn enter(&self, next: SchedulerState) {
        debug!(state = ?next, "scheduler state");
        self.state.send_replace(next);
    }

    /// Drive `cycle` until `shutdown` resolves or the iteration cap is hit.
    ///
    /// Each cycle runs on its own task so a panic is reported as a failed cycle.
    /// Shutdown during a cycle waits for that cycle; shutdown while sleeping exits at once.
    pub async fn run<F, Fut, S>(&self, mut cycle: F, shutdown: S) -> Result<SchedulerSummary>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<CycleReport>> + Send + 'static,
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut shutdown_requested = false;
        let (tick_tx, mut ticks) = mpsc::channel(4);
        let mut cron = self.start_cron(tick_tx).await?;
        let mut summary = SchedulerSummary::default();

        loop {
            self.enter(SchedulerState::RunningCycle);
            let mut handle = tokio::spawn(cycle());
            let joined = tokio::select! {
                joined = &mut handle => joined,
                _ = &mut shutdown, if !shutdown_requested => {
                    shutdown_requested = true;
                    info!("shutdown requested; letting the running cycle finish");
                    handle.await
                }
            };

            summary.cycles += 1;
            let failed = match joined {
                Ok(Ok(report)) => {
                    summary.inserted += report.inserted_count();
                    false
                }
                Ok(Err(err)) => {
                    error!(error = %format!("{err:#}"), "update cycle failed");
                    true
                }
                Err(err) if err.is_panic() => {
                    error!(error = %err, "update cycle panicked");
                    true
                }
                Err(err) => {
                    error!(error = %err, "update cycle task cancelled");
                    true
                }
            };
            if failed {
                summary.failed += 1;
            }

            if shutdown_requested {
                break;
            }
            if self
                .config
                .max_iterations
                .is_some_and(|max| summary.cycles >= max)
            {
                info!(cycles = summary.cycles, "iteration cap reached");
                break;
            }

            self.enter(SchedulerState::Sleeping);
            if failed {
                debug!(cooldown = ?self.config.cooldown, "cooling down after failed cycle");
                tokio::select! {
                    _ = &mut shutdown, if !shutdown_requested => {
                        info!("shutdown requested");
                        break;
                    }
                    _ = tokio::time::sleep(self.config.cooldown) => {}
                }
            }

            // Ticks that fired during the cycle or cooldown are already covered.
            while ticks.try_recv().is_ok() {}

            let pause = self.config.interval;
            debug!(?pause, "sleeping until next cycle");
            tokio::select! {
                _ = &mut shutdown, if !shutdown_requested => {
                    info!("shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(pause) => {}
                Some(()) = ticks.recv() => {
                    info!("cron trigger fired");
                }
            }
        }

        if let Some(sched) = cron.as_mut() {
            if let Err(err) = sched.shutdown().await {
                warn!(error = %err, "stopping cron scheduler");
            }
        }
        self.enter(SchedulerState::Stopped);
        info!(cycles = summary.cycles, failed = summary.failed, "scheduler stopped");
        Ok(summary)
    }

    async fn start_cron(&self, ticks: mpsc::Sender<()>) -> Result<Option<JobScheduler>> {
        if self.config.cron.is_empty() {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating cron scheduler")?;
        for cron in &self.config.cron {
            let ticks = ticks.clone();
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let ticks = ticks.clone();
                Box::pin(async move {
                    if ticks.try_send(()).is_err() {
                        debug!("cron tick dropped; a cycle is already queued");
                    }
                })
            })
            .with_context(|| format!("creating cron job for {cron}"))?;
            sched.add(job).await.context("adding cron job")?;
        }
        sched.start().await.context("starting cron scheduler")?;
        info!(jobs = self.config.cron.len(), "cron triggers armed");
        Ok(Some(sched))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillReport {
    pub key: String,
    pub source: String,
    pub rows: usize,
    pub summary: BatchInsertSummary,
}

/// Merge a game's full CSV history into its store.
pub async fn backfill(
    http: &HttpFetcher,
    data: &DataDir,
    lottery: &LotteryConfig,
) -> Result<BackfillReport> {
    let domain = &lottery.domain;
    let csv = lottery
        .sources
        .iter()
        .find_map(DrawSourceSpec::as_csv)
        .with_context(|| format!("{} has no csv history source", domain.key))?;

    let resp = http
        .fetch(Uuid::new_v4(), &csv.id, &csv.url)
        .await
        .with_context(|| format!("fetching {} history from {}", domain.key, csv.id))?;
    let draws = csv
        .parse_history(&resp.text(), domain)
        .with_context(|| format!("parsing {} history", domain.key))?;
    let rows = draws.len();

    let store = data.draw_store(domain).await;
    let summary = store
        .insert_all_if_new(draws.into_iter().map(StoredDraw::from))
        .await?;
    info!(
        lottery = %domain.key,
        rows,
        inserted = summary.inserted,
        already_present = summary.already_present,
        invalid = summary.invalid,
        "backfill finished"
    );

    Ok(BackfillReport {
        key: domain.key.clone(),
        source: csv.id.clone(),
        rows,
        summary,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditIssue {
    Invalid { date: NaiveDate, error: ValidationError },
    OutOfOrder { date: NaiveDate, previous: NaiveDate },
    DuplicateDate(NaiveDate),
    DuplicateNumbers { date: NaiveDate, first_seen: NaiveDate },
}

impl fmt::Display for AuditIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditIssue::Invalid { date, error } => write!(f, "{date}: {error}"),
            AuditIssue::OutOfOrder { date, previous } => {
                write!(f, "{date} listed after older entry {previous}")
            }
            AuditIssue::DuplicateDate(date) => write!(f, "{date} appears more than once"),
            AuditIssue::DuplicateNumbers { date, first_seen } => {
                write!(f, "{date} repeats the numbers drawn on {first_seen}")
            }
        }
    }
}

/// Every rule violation in a stored history. Never modifies it.
pub fn audit_history(domain: &LotteryDomain, history: &DrawHistory) -> Vec<AuditIssue> {
    let mut issues = Vec::new();
    let mut dates = HashSet::new();
    let mut numbers: HashMap<(&[u8], u8), NaiveDate> = HashMap::new();
    let mut previous: Option<NaiveDate> = None;

    for stored in &history.draws {
        let draw = &stored.draw;
        if let Err(error) = domain.validate(draw) {
            issues.push(AuditIssue::Invalid {
                date: draw.date,
                error,
            });
        }
        if !dates.insert(draw.date) {
            issues.push(AuditIssue::DuplicateDate(draw.date));
        } else if let Some(prev) = previous.filter(|prev| *prev < draw.date) {
            issues.push(AuditIssue::OutOfOrder {
                date: draw.date,
                previous: prev,
            });
        }
        match numbers.get(&(draw.main.as_slice(), draw.bonus)) {
            Some(first_seen) => issues.push(AuditIssue::DuplicateNumbers {
                date: draw.date,
                first_seen: *first_seen,
            }),
            None => {
                numbers.insert((draw.main.as_slice(), draw.bonus), draw.date);
            }
        }
        previous = Some(draw.date);
    }
    issues
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditReport {
    pub key: String,
    pub draws: usize,
    pub latest: Option<NaiveDate>,
    pub issues: Vec<AuditIssue>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Read-only audit of every registered game's store.
pub async fn audit(data: &DataDir, registry: &LotteryRegistry) -> Result<Vec<AuditReport>> {
    let mut reports = Vec::new();
    for lottery in &registry.lotteries {
        let domain = &lottery.domain;
        let store = data.draw_store(domain).await;
        let history = store
            .load()
            .await
            .with_context(|| format!("loading {} history", domain.key))?;
        let issues = audit_history(domain, &history);
        for issue in &issues {
            warn!(lottery = %domain.key, %issue, "audit finding");
        }
        reports.push(AuditReport {
            key: domain.key.clone(),
            draws: history.draws.len(),
            latest: history.latest().map(|draw| draw.date),
            issues,
        });
    }
    Ok(reports)
}
