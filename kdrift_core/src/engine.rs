//! Adapter around an external coverage-guided kernel fuzzer.
//!
//! The engine is driven through two command lines: one long-running manager
//! that receives a generated config file and streams its console output, and
//! a reproducer runner that executes a single program file and exits.

use crate::config::{DetectorSettings, EngineSettings};
use crate::crash::CrashInfo;
use crate::detector::scan_log;
use crate::reproducer::Reproducer;
use crate::strategy::FuzzingStrategy;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::LazyLock;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

const WAIT_POLL: Duration = Duration::from_millis(20);
const EXIT_GRACE: Duration = Duration::from_secs(2);
const OUTPUT_GRACE: Duration = Duration::from_millis(500);

static EXECUTED: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\bexecuted:?\s+(\d+)").ok());
static COVER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\bcover(?:age)?:?\s+(\d+)").ok());

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("fuzzing engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("engine I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("engine config serialization error: {0}")]
    Config(#[from] serde_json::Error),
}

/// Progress counters reported on the engine's console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStats {
    pub executions: u64,
    pub coverage: u64,
}

/// Parses a manager status line such as `VMs 4, executed 1234, cover 5678, crashes 2`.
pub fn parse_stats_line(line: &str) -> Option<EngineStats> {
    let executed = EXECUTED.as_ref()?.captures(line)?;
    let cover = COVER.as_ref()?.captures(line)?;
    Some(EngineStats {
        executions: executed[1].parse().ok()?,
        coverage: cover[1].parse().ok()?,
    })
}

/// Result of replaying one reproducer.
#[derive(Debug, Clone)]
pub struct ReplayOutcome {
    pub reproduced: bool,
    pub timed_out: bool,
    pub log: String,
    pub crashes: Vec<CrashInfo>,
}

impl ReplayOutcome {
    /// Classifies a captured replay log. A replay reproduces when the log
    /// holds at least one crash report.
    pub fn from_log(log: String, timed_out: bool, settings: &DetectorSettings) -> Self {
        let crashes = scan_log(&log, settings);
        Self {
            reproduced: !crashes.is_empty(),
            timed_out,
            log,
            crashes,
        }
    }
}

/// How the engine process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineExit {
    Success,
    Failure(String),
}

impl From<ExitStatus> for EngineExit {
    fn from(status: ExitStatus) -> Self {
        if status.success() {
            return EngineExit::Success;
        }
        if let Some(code) = status.code() {
            return EngineExit::Failure(format!("exited with code {code}"));
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return EngineExit::Failure(format!("terminated by signal {signal}"));
            }
        }
        EngineExit::Failure("exited abnormally".to_string())
    }
}

/// Lifecycle handle for a running engine.
pub trait EngineControl: Send {
    /// Requests termination. Idempotent.
    fn stop(&mut self);
    /// The exit status once the engine has ended, `None` while it still runs.
    fn exit_status(&mut self) -> Option<EngineExit>;
}

/// Result of polling a [`LogStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogPoll {
    Line(String),
    Idle,
    Closed,
}

/// The engine's console output, one line per message.
pub struct LogStream {
    rx: Receiver<String>,
}

impl LogStream {
    pub fn new(rx: Receiver<String>) -> Self {
        Self { rx }
    }

    pub fn poll(&self, timeout: Duration) -> LogPoll {
        match self.rx.recv_timeout(timeout) {
            Ok(line) => LogPoll::Line(line),
            Err(RecvTimeoutError::Timeout) => LogPoll::Idle,
            Err(RecvTimeoutError::Disconnected) => LogPoll::Closed,
        }
    }
}

/// A crash the engine saved into its own working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCrash {
    pub id: String,
    pub description: String,
    pub reproducer: Option<Reproducer>,
}

/// Read access to the engine's crash corpus (`<workdir>/crashes/<id>/`).
#[derive(Debug, Clone)]
pub struct CorpusHandle {
    root: PathBuf,
}

impl CorpusHandle {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Crash entries ordered by id. Entries without a description are skipped.
    pub fn entries(&self) -> Vec<RawCrash> {
        let dir = self.root.join("crashes");
        let Ok(read_dir) = fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut entries: Vec<RawCrash> = read_dir
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                let path = entry.path();
                let description = fs::read_to_string(path.join("description")).ok()?;
                let reproducer = fs::read_to_string(path.join("repro.prog"))
                    .ok()
                    .map(|text| Reproducer::from_program_text(&text))
                    .filter(|repro| !repro.is_empty());
                Some(RawCrash {
                    id: entry.file_name().to_string_lossy().into_owned(),
                    description: description.trim().to_string(),
                    reproducer,
                })
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// The saved reproducer whose description matches a detector title.
    pub fn find_reproducer(&self, title: &str) -> Option<Reproducer> {
        let wanted = comparable_title(title);
        self.entries()
            .into_iter()
            .filter(|entry| comparable_title(&entry.description) == wanted)
            .find_map(|entry| entry.reproducer)
    }
}

fn comparable_title(title: &str) -> &str {
    let title = title.trim();
    title.strip_prefix("BUG: ").unwrap_or(title)
}

/// Everything a started campaign hands back to its owner.
pub struct EngineSession {
    pub logs: LogStream,
    pub corpus: CorpusHandle,
    pub control: Box<dyn EngineControl>,
}

/// A kernel fuzzing engine.
pub trait FuzzEngine: Send + Sync {
    fn start_campaign(&self, strategy: &FuzzingStrategy) -> Result<EngineSession, EngineError>;
    fn replay(&self, reproducer: &Reproducer) -> Result<ReplayOutcome, EngineError>;
}

/// Engine configuration file written for every campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub name: String,
    pub target: String,
    pub workdir: PathBuf,
    pub enable_syscalls: Vec<String>,
    pub targets: Vec<String>,
    pub cover: bool,
    pub comparisons: bool,
    pub fault_injection: bool,
    pub procs: usize,
    pub duration_secs: u64,
}

impl EngineConfig {
    pub fn for_strategy(strategy: &FuzzingStrategy, target: &str, workdir: &Path) -> Self {
        Self {
            name: strategy.name().to_string(),
            target: target.to_string(),
            workdir: workdir.to_path_buf(),
            enable_syscalls: strategy.allow_list().to_vec(),
            targets: strategy.targets().to_vec(),
            cover: strategy.coverage(),
            comparisons: strategy.comparisons(),
            fault_injection: strategy.fault_injection(),
            procs: strategy.parallelism(),
            duration_secs: strategy.max_duration().as_secs(),
        }
    }
}

/// Drives an engine through configured command lines.
pub struct CommandEngine {
    settings: EngineSettings,
    detector: DetectorSettings,
}

impl CommandEngine {
    pub fn new(settings: EngineSettings, detector: DetectorSettings) -> Self {
        Self { settings, detector }
    }

    fn campaign_workdir(&self, strategy: &FuzzingStrategy) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
        self.settings
            .workdir
            .join(format!("{}-{stamp}", strategy.name()))
    }
}

impl FuzzEngine for CommandEngine {
    fn start_campaign(&self, strategy: &FuzzingStrategy) -> Result<EngineSession, EngineError> {
        if self.settings.command.is_empty() {
            return Err(EngineError::EngineUnavailable(
                "no engine command configured".to_string(),
            ));
        }
        let workdir = self.campaign_workdir(strategy);
        fs::create_dir_all(&workdir)?;
        let config_path = workdir.join(format!("{}.cfg", strategy.name()));
        let config = EngineConfig::for_strategy(strategy, &self.settings.target, &workdir);
        fs::write(&config_path, serde_json::to_vec_pretty(&config)?)?;

        let argv: Vec<String> = self
            .settings
            .command
            .iter()
            .map(|arg| {
                arg.replace("{config}", &config_path.to_string_lossy())
                    .replace("{workdir}", &workdir.to_string_lossy())
            })
            .collect();
        tracing::info!(
            strategy = strategy.name(),
            workdir = %workdir.display(),
            "Starting fuzzing engine: {:?}",
            argv
        );

        let (logs, child) = spawn_with_output(&argv)?;
        Ok(EngineSession {
            logs: LogStream::new(logs),
            corpus: CorpusHandle::new(workdir),
            control: Box::new(ChildControl {
                child,
                finished: None,
            }),
        })
    }

    fn replay(&self, reproducer: &Reproducer) -> Result<ReplayOutcome, EngineError> {
        if self.settings.replay_command.is_empty() {
            return Err(EngineError::EngineUnavailable(
                "no replay command configured".to_string(),
            ));
        }
        let mut program = tempfile::Builder::new()
            .prefix("kdrift-repro-")
            .suffix(".prog")
            .tempfile()?;
        program.write_all(reproducer.to_program_text().as_bytes())?;
        program.flush()?;
        let program_path = program.path().to_string_lossy().into_owned();

        let mut argv: Vec<String> = self
            .settings
            .replay_command
            .iter()
            .map(|arg| arg.replace("{program}", &program_path))
            .collect();
        if !self
            .settings
            .replay_command
            .iter()
            .any(|arg| arg.contains("{program}"))
        {
            argv.push(program_path);
        }

        let (output, mut child) = spawn_with_output(&argv)?;
        let timed_out = match wait_with_timeout(&mut child, self.settings.replay_timeout())? {
            Some(status) => {
                tracing::trace!("Replay runner finished: {:?}", EngineExit::from(status));
                false
            }
            None => {
                tracing::debug!(
                    "Replay exceeded {:?}, runner killed",
                    self.settings.replay_timeout()
                );
                true
            }
        };
        let log = drain_output(&output);
        drop(program);
        Ok(ReplayOutcome::from_log(log, timed_out, &self.detector))
    }
}

struct ChildControl {
    child: Child,
    finished: Option<EngineExit>,
}

impl EngineControl for ChildControl {
    fn stop(&mut self) {
        if self.finished.is_some() {
            return;
        }
        if let Err(e) = self.child.kill() {
            tracing::debug!("Engine kill failed (likely already exited): {e}");
        }
        match self.child.wait() {
            Ok(status) => self.finished = Some(EngineExit::from(status)),
            Err(e) => tracing::warn!("Failed to reap engine process: {e}"),
        }
    }

    fn exit_status(&mut self) -> Option<EngineExit> {
        if let Some(exit) = &self.finished {
            return Some(exit.clone());
        }
        let deadline = Instant::now() + EXIT_GRACE;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    let exit = EngineExit::from(status);
                    self.finished = Some(exit.clone());
                    return Some(exit);
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(WAIT_POLL),
                Ok(None) => return None,
                Err(e) => {
                    tracing::warn!("Error waiting for engine process: {e}");
                    return None;
                }
            }
        }
    }
}

impl Drop for ChildControl {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_with_output(argv: &[String]) -> Result<(Receiver<String>, Child), EngineError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(EngineError::EngineUnavailable("empty command line".to_string()));
    };
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| EngineError::EngineUnavailable(format!("failed to spawn {argv:?}: {e}")))?;

    let (tx, rx) = mpsc::channel();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let forwarded = forward(stdout, "kdrift-engine-stdout", tx.clone())
        .and_then(|()| forward(stderr, "kdrift-engine-stderr", tx));
    if let Err(e) = forwarded {
        let _ = child.kill();
        let _ = child.wait();
        return Err(e.into());
    }
    Ok((rx, child))
}

fn forward<R: Read + Send + 'static>(
    pipe: Option<R>,
    name: &str,
    tx: Sender<String>,
) -> io::Result<()> {
    let Some(pipe) = pipe else {
        return Ok(());
    };
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || forward_lines(pipe, tx))
        .map(|_| ())
}

fn forward_lines<R: Read>(pipe: R, tx: Sender<String>) {
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']).to_string();
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("Engine output pipe closed: {e}");
                break;
            }
        }
    }
}

/// Waits for `child`, killing it once `timeout` elapses. `None` means it was killed.
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if start.elapsed() > timeout {
            if let Err(e) = child.kill() {
                tracing::warn!("Failed to kill timed-out replay: {e}");
            }
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(WAIT_POLL);
    }
}

/// Collects forwarded output until the pipes close or go quiet.
fn drain_output(rx: &Receiver<String>) -> String {
    let mut log = String::new();
    while let Ok(line) = rx.recv_timeout(OUTPUT_GRACE) {
        log.push_str(&line);
        log.push('\n');
    }
    log
}
