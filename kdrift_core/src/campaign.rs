//! Campaign lifecycle.
//!
//! Each running campaign owns two named threads: one consuming the engine's
//! log stream through a [`CrashDetector`], and one enforcing the campaign
//! deadline. Minimization of new crashes is handed to the shared
//! [`MinimizationScheduler`] so log consumption never waits on replays.

use crate::config::{CampaignSettings, DetectorSettings, KdriftConfig};
use crate::crash::{
    CrashDetail, CrashInfo, CrashSummary, CrashTable, CrashTableHandle, MinimizationState,
};
use crate::crash_store::{CrashStore, CrashStoreError};
use crate::detector::{CrashDetector, DetectorEvent};
use crate::engine::{
    CorpusHandle, EngineControl, EngineError, EngineExit, FuzzEngine, LogPoll, LogStream,
    parse_stats_line,
};
use crate::minimizer::{CancellationToken, MinimizeError};
use crate::oracle::{CrashOracle, OracleVerdict, ReplayOracle};
use crate::patterns::{CrashSeverity, VulnCategory};
use crate::reproducer::Reproducer;
use crate::scheduler::{MinimizationJob, MinimizationResult, MinimizationScheduler, SchedulerError};
use crate::strategy::{
    FuzzingStrategy, FuzzingTarget, StrategyConstraints, StrategyError, StrategyGenerator,
};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

type StoreHandle = Arc<Mutex<CrashStore>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CampaignId(u64);

impl CampaignId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CampaignId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "campaign-{}", self.0)
    }
}

impl FromStr for CampaignId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix("campaign-").unwrap_or(s).parse().map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CampaignStatus {
    Created,
    Running,
    Completed,
    Stopped,
    Failed,
}

impl CampaignStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CampaignStatus::Completed | CampaignStatus::Stopped | CampaignStatus::Failed
        )
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CampaignStatus::Created => "created",
            CampaignStatus::Running => "running",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Stopped => "stopped",
            CampaignStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Engine progress as last reported on its console.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignCounters {
    pub executions: u64,
    pub coverage: u64,
}

/// The `StartCampaign` request: a target kind plus generator constraints.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct StrategyRequest {
    pub target: FuzzingTarget,
    #[serde(default)]
    pub constraints: StrategyConstraints,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignStatusReport {
    pub id: CampaignId,
    pub strategy: String,
    pub status: CampaignStatus,
    pub counters: CampaignCounters,
    pub crash_count: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub failure: Option<String>,
}

/// Aggregated view of one campaign's findings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub campaign: CampaignStatusReport,
    pub by_severity: BTreeMap<CrashSeverity, usize>,
    pub by_category: BTreeMap<VulnCategory, usize>,
    pub minimized: usize,
    pub ambiguous: usize,
    /// Most severe first.
    pub crashes: Vec<CrashSummary>,
}

#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("campaign {0} not found")]
    NotFound(CampaignId),
    #[error("campaign {id} is {status}")]
    InvalidState { id: CampaignId, status: CampaignStatus },
    #[error("campaign {id} failed to start: {source}")]
    EngineUnavailable {
        id: CampaignId,
        #[source]
        source: EngineError,
    },
    #[error("crash {fingerprint} not found in campaign {id}")]
    CrashNotFound { id: CampaignId, fingerprint: String },
    #[error(transparent)]
    Strategy(#[from] StrategyError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Store(#[from] CrashStoreError),
    #[error("failed to spawn campaign thread: {0}")]
    ThreadSpawn(#[from] io::Error),
}

struct CampaignState {
    status: CampaignStatus,
    counters: CampaignCounters,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    failure: Option<String>,
}

struct CampaignShared {
    id: CampaignId,
    strategy: FuzzingStrategy,
    state: Mutex<CampaignState>,
    finished: Condvar,
    crashes: CrashTableHandle,
    /// Ends log consumption. Set on every terminal transition.
    logs_done: CancellationToken,
    /// Ends in-flight minimization. Set on explicit stop and purge only.
    minimization_cancel: CancellationToken,
    control: Mutex<Option<Box<dyn EngineControl>>>,
    deadline_tx: Mutex<Option<Sender<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl CampaignShared {
    fn new(id: CampaignId, strategy: FuzzingStrategy) -> Self {
        Self {
            id,
            strategy,
            state: Mutex::new(CampaignState {
                status: CampaignStatus::Created,
                counters: CampaignCounters::default(),
                started_at: None,
                ended_at: None,
                failure: None,
            }),
            finished: Condvar::new(),
            crashes: CrashTable::handle(),
            logs_done: CancellationToken::new(),
            minimization_cancel: CancellationToken::new(),
            control: Mutex::new(None),
            deadline_tx: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
        }
    }

    fn status(&self) -> CampaignStatus {
        self.state.lock().status
    }

    /// Moves a running campaign to `status` and tears down its engine.
    /// Returns false when the campaign was not running.
    fn finish(&self, status: CampaignStatus, failure: Option<String>) -> bool {
        {
            let mut state = self.state.lock();
            if state.status != CampaignStatus::Running {
                return false;
            }
            state.status = status;
            state.ended_at = Some(Utc::now());
            state.failure = failure;
        }
        self.logs_done.cancel();
        self.deadline_tx.lock().take();
        if let Some(control) = self.control.lock().as_mut() {
            control.stop();
        }
        self.finished.notify_all();
        match status {
            CampaignStatus::Failed => {
                let reason = self.state.lock().failure.clone();
                tracing::error!(campaign = %self.id, reason = ?reason, "Campaign failed");
            }
            _ => tracing::info!(campaign = %self.id, %status, "Campaign finished"),
        }
        true
    }

    fn status_report(&self) -> CampaignStatusReport {
        let crash_count = self.crashes.lock().len();
        let state = self.state.lock();
        CampaignStatusReport {
            id: self.id,
            strategy: self.strategy.name().to_string(),
            status: state.status,
            counters: state.counters,
            crash_count,
            started_at: state.started_at,
            ended_at: state.ended_at,
            failure: state.failure.clone(),
        }
    }

    fn join_threads(&self) {
        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                tracing::error!(campaign = %self.id, "Campaign thread panicked");
            }
        }
    }
}

/// The top-level facade: starts, observes and retires fuzzing campaigns.
pub struct CampaignManager {
    engine: Arc<dyn FuzzEngine>,
    generator: StrategyGenerator,
    detector: DetectorSettings,
    settings: CampaignSettings,
    scheduler: Arc<MinimizationScheduler>,
    store: Option<StoreHandle>,
    campaigns: RwLock<HashMap<CampaignId, Arc<CampaignShared>>>,
    next_id: AtomicU64,
}

impl CampaignManager {
    pub fn new(engine: Arc<dyn FuzzEngine>, config: &KdriftConfig) -> Result<Self, CampaignError> {
        let store = match &config.campaign.crash_dir {
            Some(dir) => Some(Arc::new(Mutex::new(CrashStore::new(dir.clone())?))),
            None => None,
        };
        Ok(Self {
            engine,
            generator: StrategyGenerator::default(),
            detector: config.detector.clone(),
            settings: config.campaign.clone(),
            scheduler: Arc::new(MinimizationScheduler::new(config.minimizer.clone())?),
            store,
            campaigns: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn with_generator(mut self, generator: StrategyGenerator) -> Self {
        self.generator = generator;
        self
    }

    /// Generates a strategy for `request` and starts a campaign with it.
    pub fn start(&self, request: &StrategyRequest) -> Result<CampaignId, CampaignError> {
        let strategy = self
            .generator
            .generate(request.target, &request.constraints)?;
        self.start_strategy(strategy)
    }

    /// Starts a campaign. Returns once the engine process is spawned.
    ///
    /// When the engine cannot be started the campaign is still registered,
    /// in the `Failed` state, and the error carries its id.
    pub fn start_strategy(&self, strategy: FuzzingStrategy) -> Result<CampaignId, CampaignError> {
        let id = CampaignId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let shared = Arc::new(CampaignShared::new(id, strategy));
        self.campaigns.write().insert(id, Arc::clone(&shared));
        {
            let mut state = shared.state.lock();
            state.status = CampaignStatus::Running;
            state.started_at = Some(Utc::now());
        }
        tracing::info!(campaign = %id, strategy = shared.strategy.name(), "Starting campaign");

        let session = match self.engine.start_campaign(&shared.strategy) {
            Ok(session) => session,
            Err(source) => {
                shared.finish(CampaignStatus::Failed, Some(source.to_string()));
                return Err(CampaignError::EngineUnavailable { id, source });
            }
        };
        *shared.control.lock() = Some(session.control);

        if let Err(e) = self.spawn_campaign_threads(&shared, session.logs, session.corpus) {
            shared.finish(
                CampaignStatus::Failed,
                Some(format!("failed to spawn campaign threads: {e}")),
            );
            return Err(e.into());
        }
        Ok(id)
    }

    fn spawn_campaign_threads(
        &self,
        shared: &Arc<CampaignShared>,
        logs: LogStream,
        corpus: CorpusHandle,
    ) -> io::Result<()> {
        let (deadline_tx, deadline_rx) = mpsc::channel::<()>();
        *shared.deadline_tx.lock() = Some(deadline_tx);
        let max_duration = shared.strategy.max_duration();
        let timer_shared = Arc::clone(shared);
        let timer = thread::Builder::new()
            .name(format!("kdrift-{}-deadline", shared.id))
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = deadline_rx.recv_timeout(max_duration) {
                    tracing::info!(campaign = %timer_shared.id, "Campaign deadline reached");
                    timer_shared.finish(CampaignStatus::Completed, None);
                }
            })?;
        shared.threads.lock().push(timer);

        let consumer = LogConsumer {
            shared: Arc::clone(shared),
            engine: Arc::clone(&self.engine),
            scheduler: Arc::clone(&self.scheduler),
            store: self.store.clone(),
            corpus,
            poll_interval: self.settings.log_poll_interval(),
        };
        let detector = CrashDetector::new(
            self.detector.clone(),
            shared.id.to_string(),
            Arc::clone(&shared.crashes),
        );
        let reader = thread::Builder::new()
            .name(format!("kdrift-{}-logs", shared.id))
            .spawn(move || consumer.run(logs, detector))?;
        shared.threads.lock().push(reader);
        Ok(())
    }

    fn campaign(&self, id: CampaignId) -> Result<Arc<CampaignShared>, CampaignError> {
        self.campaigns
            .read()
            .get(&id)
            .cloned()
            .ok_or(CampaignError::NotFound(id))
    }

    /// Stops a running campaign and cancels its pending minimizations.
    pub fn stop(&self, id: CampaignId) -> Result<(), CampaignError> {
        let shared = self.campaign(id)?;
        if !shared.finish(CampaignStatus::Stopped, None) {
            return Err(CampaignError::InvalidState {
                id,
                status: shared.status(),
            });
        }
        shared.minimization_cancel.cancel();
        Ok(())
    }

    pub fn status(&self, id: CampaignId) -> Result<CampaignStatusReport, CampaignError> {
        Ok(self.campaign(id)?.status_report())
    }

    /// Crash summaries in first-seen order.
    pub fn list_crashes(&self, id: CampaignId) -> Result<Vec<CrashSummary>, CampaignError> {
        let shared = self.campaign(id)?;
        let crashes = shared.crashes.lock();
        Ok(crashes.iter().map(|crash| crash.summary()).collect())
    }

    pub fn get_crash(
        &self,
        id: CampaignId,
        fingerprint: &str,
    ) -> Result<CrashDetail, CampaignError> {
        let shared = self.campaign(id)?;
        let crashes = shared.crashes.lock();
        crashes
            .get(fingerprint)
            .map(|crash| crash.detail())
            .ok_or_else(|| CampaignError::CrashNotFound {
                id,
                fingerprint: fingerprint.to_string(),
            })
    }

    pub fn report(&self, id: CampaignId) -> Result<CampaignReport, CampaignError> {
        let shared = self.campaign(id)?;
        let campaign = shared.status_report();
        let crashes = shared.crashes.lock();
        let mut by_severity = BTreeMap::new();
        let mut by_category = BTreeMap::new();
        let mut minimized = 0;
        let mut ambiguous = 0;
        for crash in crashes.iter() {
            *by_severity.entry(crash.severity).or_insert(0) += 1;
            *by_category.entry(crash.category).or_insert(0) += 1;
            if crash.minimized_reproducer.is_some() {
                minimized += 1;
            }
            if crash.replay_ambiguous {
                ambiguous += 1;
            }
        }
        let mut summaries: Vec<CrashSummary> =
            crashes.iter().map(|crash| crash.summary()).collect();
        summaries.sort_by(|a, b| b.severity.cmp(&a.severity));
        Ok(CampaignReport {
            campaign,
            by_severity,
            by_category,
            minimized,
            ambiguous,
            crashes: summaries,
        })
    }

    /// Crashes whose minimization has not reached a final state yet.
    pub fn pending_minimizations(&self, id: CampaignId) -> Result<usize, CampaignError> {
        let shared = self.campaign(id)?;
        let crashes = shared.crashes.lock();
        Ok(crashes
            .iter()
            .filter(|crash| {
                matches!(
                    crash.minimization,
                    MinimizationState::Pending | MinimizationState::Running
                )
            })
            .count())
    }

    /// Blocks until the campaign is terminal or `timeout` elapses, returning its status.
    pub fn wait_for_terminal(
        &self,
        id: CampaignId,
        timeout: Duration,
    ) -> Result<CampaignStatus, CampaignError> {
        let shared = self.campaign(id)?;
        let deadline = Instant::now() + timeout;
        let mut state = shared.state.lock();
        while !state.status.is_terminal() {
            if shared.finished.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        Ok(state.status)
    }

    /// Forgets a terminal campaign and its crash table.
    pub fn purge(&self, id: CampaignId) -> Result<(), CampaignError> {
        let shared = self.campaign(id)?;
        let status = shared.status();
        if !status.is_terminal() {
            return Err(CampaignError::InvalidState { id, status });
        }
        shared.minimization_cancel.cancel();
        self.campaigns.write().remove(&id);
        shared.join_threads();
        tracing::info!(campaign = %id, "Campaign purged");
        Ok(())
    }

    pub fn campaigns(&self) -> Vec<CampaignId> {
        let mut ids: Vec<CampaignId> = self.campaigns.read().keys().copied().collect();
        ids.sort();
        ids
    }
}

impl Drop for CampaignManager {
    fn drop(&mut self) {
        let campaigns: Vec<Arc<CampaignShared>> =
            self.campaigns.write().drain().map(|(_, shared)| shared).collect();
        for shared in campaigns {
            shared.finish(CampaignStatus::Stopped, None);
            shared.minimization_cancel.cancel();
            shared.join_threads();
        }
    }
}

struct LogConsumer {
    shared: Arc<CampaignShared>,
    engine: Arc<dyn FuzzEngine>,
    scheduler: Arc<MinimizationScheduler>,
    store: Option<StoreHandle>,
    corpus: CorpusHandle,
    poll_interval: Duration,
}

impl LogConsumer {
    fn run(self, logs: LogStream, mut detector: CrashDetector) {
        while !self.shared.logs_done.is_cancelled() {
            match logs.poll(self.poll_interval) {
                LogPoll::Line(line) => {
                    if let Some(stats) = parse_stats_line(&line) {
                        let mut state = self.shared.state.lock();
                        state.counters.executions = state.counters.executions.max(stats.executions);
                        state.counters.coverage = state.counters.coverage.max(stats.coverage);
                    }
                    if let Some(event) = detector.feed(&line) {
                        self.handle_event(event);
                    }
                }
                LogPoll::Idle => {}
                LogPoll::Closed => {
                    if let Some(event) = detector.flush() {
                        self.handle_event(event);
                    }
                    self.stream_ended();
                    return;
                }
            }
        }
        if let Some(event) = detector.flush() {
            self.handle_event(event);
        }
    }

    fn stream_ended(&self) {
        let exit = self
            .shared
            .control
            .lock()
            .as_mut()
            .and_then(|control| control.exit_status());
        match exit {
            Some(EngineExit::Success) => {
                self.shared.finish(CampaignStatus::Completed, None);
            }
            Some(EngineExit::Failure(reason)) => {
                self.shared
                    .finish(CampaignStatus::Failed, Some(format!("engine {reason}")));
            }
            None => {
                self.shared.finish(
                    CampaignStatus::Failed,
                    Some("engine closed its output but kept running".to_string()),
                );
            }
        }
    }

    fn handle_event(&self, event: DetectorEvent) {
        match event {
            DetectorEvent::NewCrash(crash) => {
                let fingerprint = crash.fingerprint().to_string();
                self.schedule_minimization(&crash);
                persist(self.store.as_ref(), &self.shared.crashes, &fingerprint);
            }
            DetectorEvent::ExistingCrashUpdate { fingerprint, .. } => {
                persist(self.store.as_ref(), &self.shared.crashes, &fingerprint);
            }
        }
    }

    fn schedule_minimization(&self, crash: &CrashInfo) {
        let campaign = self.shared.id;
        let crashes = &self.shared.crashes;
        let fingerprint = crash.fingerprint();
        let reproducer = if crash.reproducer.is_empty() {
            match self.corpus.find_reproducer(&crash.title) {
                Some(saved) => {
                    tracing::debug!(
                        campaign = %campaign,
                        fingerprint,
                        "Using reproducer saved by the engine"
                    );
                    if let Some(entry) = crashes.lock().get_mut(fingerprint) {
                        entry.reproducer = saved.clone();
                    }
                    saved
                }
                None => {
                    tracing::info!(
                        campaign = %campaign,
                        fingerprint,
                        "No reproducer captured, skipping minimization"
                    );
                    set_minimization(crashes, fingerprint, MinimizationState::Skipped);
                    return;
                }
            }
        } else {
            crash.reproducer.clone()
        };
        if self.shared.minimization_cancel.is_cancelled() {
            set_minimization(crashes, fingerprint, MinimizationState::Cancelled);
            return;
        }

        let oracle = AmbiguityTracking {
            inner: CrashOracle::for_crash(Arc::clone(&self.engine), crash),
            crashes: Arc::clone(crashes),
            fingerprint: fingerprint.to_string(),
        };
        let started = (Arc::clone(crashes), fingerprint.to_string());
        let completed = (Arc::clone(crashes), fingerprint.to_string(), self.store.clone());
        let job = MinimizationJob::new(
            campaign.to_string(),
            fingerprint,
            reproducer,
            Box::new(oracle),
            move |result| {
                let (crashes, fingerprint, store) = completed;
                record_minimization(&crashes, &fingerprint, result);
                persist(store.as_ref(), &crashes, &fingerprint);
            },
        )
        .on_start(move || {
            let (crashes, fingerprint) = started;
            set_minimization(&crashes, &fingerprint, MinimizationState::Running);
        })
        .with_cancellation(self.shared.minimization_cancel.clone());

        match self.scheduler.schedule(job) {
            Ok(()) => {}
            Err(SchedulerError::AlreadyScheduled { .. }) => {
                tracing::debug!(
                    campaign = %campaign,
                    fingerprint,
                    "Minimization already in flight"
                );
            }
            Err(e) => {
                tracing::warn!(
                    campaign = %campaign,
                    fingerprint,
                    "Could not schedule minimization: {e}"
                );
                set_minimization(crashes, fingerprint, MinimizationState::Skipped);
            }
        }
    }
}

/// Flags the crash as ambiguous whenever one of its replays times out.
struct AmbiguityTracking {
    inner: CrashOracle,
    crashes: CrashTableHandle,
    fingerprint: String,
}

impl ReplayOracle for AmbiguityTracking {
    fn check(&mut self, candidate: &Reproducer) -> OracleVerdict {
        let verdict = self.inner.check(candidate);
        if verdict == OracleVerdict::Timeout {
            let mut crashes = self.crashes.lock();
            if let Some(crash) = crashes.get_mut(&self.fingerprint) {
                crash.replay_ambiguous = true;
            }
        }
        verdict
    }
}

fn set_minimization(crashes: &CrashTableHandle, fingerprint: &str, state: MinimizationState) {
    if let Some(crash) = crashes.lock().get_mut(fingerprint) {
        crash.minimization = state;
    }
}

fn record_minimization(crashes: &CrashTableHandle, fingerprint: &str, result: MinimizationResult) {
    let mut table = crashes.lock();
    let Some(crash) = table.get_mut(fingerprint) else {
        return;
    };
    match result {
        Ok(outcome) => {
            tracing::info!(
                fingerprint,
                from = crash.reproducer.len(),
                to = outcome.reproducer.len(),
                oracle_calls = outcome.oracle_calls,
                "Crash minimized"
            );
            crash.minimized_reproducer = Some(outcome.reproducer);
            crash.minimization = MinimizationState::Minimized;
        }
        Err(MinimizeError::NotReproducible { timed_out }) => {
            tracing::info!(fingerprint, timed_out, "Crash did not reproduce on replay");
            if timed_out {
                crash.replay_ambiguous = true;
            }
            crash.minimization = MinimizationState::Skipped;
        }
        Err(MinimizeError::MinimizationUnstable { fallback }) => {
            tracing::warn!(
                fingerprint,
                ops = fallback.len(),
                "Minimization unstable, keeping last verified candidate"
            );
            crash.minimized_reproducer = Some(fallback);
            crash.minimization = MinimizationState::Unstable;
        }
        Err(MinimizeError::Cancelled { last_verified }) => {
            if last_verified != crash.reproducer {
                crash.minimized_reproducer = Some(last_verified);
            }
            crash.minimization = MinimizationState::Cancelled;
        }
        Err(MinimizeError::Aborted(reason)) => {
            tracing::warn!(fingerprint, "Minimization aborted: {reason}");
            crash.minimization = MinimizationState::Skipped;
        }
    }
}

fn persist(store: Option<&StoreHandle>, crashes: &CrashTableHandle, fingerprint: &str) {
    let Some(store) = store else {
        return;
    };
    let Some(crash) = crashes.lock().get(fingerprint).cloned() else {
        return;
    };
    if let Err(e) = store.lock().save(&crash) {
        tracing::warn!(fingerprint, "Failed to persist crash: {e}");
    }
}
