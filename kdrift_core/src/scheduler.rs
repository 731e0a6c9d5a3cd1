use crate::config::MinimizerSettings;
use crate::minimizer::{CancellationToken, MinimizeError, MinimizeOutcome, Minimizer};
use crate::oracle::ReplayOracle;
use crate::reproducer::Reproducer;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use thiserror::Error;

pub type MinimizationResult = Result<MinimizeOutcome, MinimizeError>;

/// Errors that can occur when handing work to the [`MinimizationScheduler`].
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// A job for the same crash of the same campaign is queued or running.
    #[error("minimization already scheduled for {fingerprint} in {campaign}")]
    AlreadyScheduled {
        campaign: String,
        fingerprint: String,
    },
    /// The worker pool has been shut down and accepts no more jobs.
    #[error("minimization scheduler is shut down")]
    ShutDown,
    /// A worker thread could not be started.
    #[error("failed to spawn minimization worker: {0}")]
    Spawn(#[from] io::Error),
}

type JobKey = (String, String);

/// One reproducer to minimize, with the callbacks that report its progress.
pub struct MinimizationJob {
    campaign: String,
    fingerprint: String,
    reproducer: Reproducer,
    oracle: Box<dyn ReplayOracle>,
    cancel: CancellationToken,
    on_start: Option<Box<dyn FnOnce() + Send>>,
    on_complete: Box<dyn FnOnce(MinimizationResult) + Send>,
}

impl MinimizationJob {
    pub fn new(
        campaign: impl Into<String>,
        fingerprint: impl Into<String>,
        reproducer: Reproducer,
        oracle: Box<dyn ReplayOracle>,
        on_complete: impl FnOnce(MinimizationResult) + Send + 'static,
    ) -> Self {
        Self {
            campaign: campaign.into(),
            fingerprint: fingerprint.into(),
            reproducer,
            oracle,
            cancel: CancellationToken::new(),
            on_start: None,
            on_complete: Box::new(on_complete),
        }
    }

    /// Runs right before the first oracle call.
    pub fn on_start(mut self, on_start: impl FnOnce() + Send + 'static) -> Self {
        self.on_start = Some(Box::new(on_start));
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn key(&self) -> JobKey {
        (self.campaign.clone(), self.fingerprint.clone())
    }
}

/// A fixed pool of worker threads that minimize reproducers off the log path.
///
/// At most one job per `(campaign, fingerprint)` is queued or running at a
/// time. Dropping the scheduler closes the queue, lets workers finish what is
/// already queued and joins them.
pub struct MinimizationScheduler {
    tx: Option<Sender<MinimizationJob>>,
    in_flight: Arc<Mutex<HashSet<JobKey>>>,
    workers: Vec<JoinHandle<()>>,
}

impl MinimizationScheduler {
    pub fn new(settings: MinimizerSettings) -> Result<Self, SchedulerError> {
        let (tx, rx) = mpsc::channel::<MinimizationJob>();
        let rx = Arc::new(Mutex::new(rx));
        let in_flight = Arc::new(Mutex::new(HashSet::new()));
        let mut scheduler = Self {
            tx: Some(tx),
            in_flight: Arc::clone(&in_flight),
            workers: Vec::new(),
        };
        for index in 0..settings.workers.max(1) {
            let rx = Arc::clone(&rx);
            let in_flight = Arc::clone(&in_flight);
            let settings = settings.clone();
            let handle = thread::Builder::new()
                .name(format!("kdrift-minimizer-{index}"))
                .spawn(move || worker_loop(&rx, &in_flight, &settings))?;
            scheduler.workers.push(handle);
        }
        Ok(scheduler)
    }

    pub fn schedule(&self, job: MinimizationJob) -> Result<(), SchedulerError> {
        let Some(tx) = &self.tx else {
            return Err(SchedulerError::ShutDown);
        };
        let key = job.key();
        if !self.in_flight.lock().insert(key.clone()) {
            return Err(SchedulerError::AlreadyScheduled {
                campaign: key.0,
                fingerprint: key.1,
            });
        }
        if tx.send(job).is_err() {
            self.in_flight.lock().remove(&key);
            return Err(SchedulerError::ShutDown);
        }
        tracing::debug!(campaign = %key.0, fingerprint = %key.1, "Minimization queued");
        Ok(())
    }

    pub fn is_scheduled(&self, campaign: &str, fingerprint: &str) -> bool {
        self.in_flight
            .lock()
            .contains(&(campaign.to_string(), fingerprint.to_string()))
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn shutdown(&mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("Minimization worker panicked");
            }
        }
    }
}

impl Drop for MinimizationScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    rx: &Mutex<Receiver<MinimizationJob>>,
    in_flight: &Mutex<HashSet<JobKey>>,
    settings: &MinimizerSettings,
) {
    loop {
        let job = rx.lock().recv();
        let Ok(job) = job else {
            break;
        };
        let key = job.key();
        let on_complete = job.on_complete;
        let result = run_job(
            job.reproducer,
            job.oracle,
            job.cancel,
            job.on_start,
            settings,
        );
        in_flight.lock().remove(&key);
        on_complete(result);
    }
}

fn run_job(
    reproducer: Reproducer,
    mut oracle: Box<dyn ReplayOracle>,
    cancel: CancellationToken,
    on_start: Option<Box<dyn FnOnce() + Send>>,
    settings: &MinimizerSettings,
) -> MinimizationResult {
    if cancel.is_cancelled() {
        return Err(MinimizeError::Cancelled {
            last_verified: reproducer,
        });
    }
    if let Some(on_start) = on_start {
        on_start();
    }
    let minimizer = Minimizer::new(settings.clone()).with_cancellation(cancel);
    let result = catch_unwind(AssertUnwindSafe(|| {
        minimizer.minimize(&reproducer, oracle.as_mut())
    }));
    result.unwrap_or_else(|panic_payload| {
        let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        tracing::error!("Replay oracle panicked during minimization: {msg}");
        Err(MinimizeError::Aborted(msg))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::OracleVerdict;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(10);

    fn needs_b(candidate: &Reproducer) -> OracleVerdict {
        if candidate.ops().iter().any(|op| op == "b()") {
            OracleVerdict::Reproduced
        } else {
            OracleVerdict::NotReproduced
        }
    }

    fn job_reporting_to(
        fingerprint: &str,
        oracle: Box<dyn ReplayOracle>,
        done: Sender<MinimizationResult>,
    ) -> MinimizationJob {
        MinimizationJob::new(
            "campaign-1",
            fingerprint,
            Reproducer::from(vec!["a()", "b()", "c()"]),
            oracle,
            move |result| {
                let _ = done.send(result);
            },
        )
    }

    #[test]
    fn jobs_run_on_workers_and_report_results() {
        let scheduler = MinimizationScheduler::new(MinimizerSettings::default()).unwrap();
        let (done_tx, done_rx) = mpsc::channel();
        let (started_tx, started_rx) = mpsc::channel();
        let job = job_reporting_to("fp1", Box::new(needs_b), done_tx).on_start(move || {
            let _ = started_tx.send(thread::current().name().map(str::to_string));
        });
        scheduler.schedule(job).unwrap();

        let worker = started_rx.recv_timeout(WAIT).unwrap().unwrap();
        assert!(worker.starts_with("kdrift-minimizer-"));
        let outcome = done_rx.recv_timeout(WAIT).unwrap().unwrap();
        assert_eq!(outcome.reproducer.ops(), &["b()"]);
        assert!(!scheduler.is_scheduled("campaign-1", "fp1"));
    }

    #[test]
    fn duplicate_jobs_are_rejected_while_in_flight() {
        let scheduler = MinimizationScheduler::new(MinimizerSettings {
            workers: 1,
            ..MinimizerSettings::default()
        })
        .unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let gated = move |candidate: &Reproducer| {
            let _ = release_rx.recv_timeout(WAIT);
            needs_b(candidate)
        };
        let (done_tx, done_rx) = mpsc::channel();
        scheduler
            .schedule(job_reporting_to("fp1", Box::new(gated), done_tx.clone()))
            .unwrap();
        assert!(scheduler.is_scheduled("campaign-1", "fp1"));

        let duplicate = job_reporting_to("fp1", Box::new(needs_b), done_tx.clone());
        assert!(matches!(
            scheduler.schedule(duplicate),
            Err(SchedulerError::AlreadyScheduled { .. })
        ));
        let other = job_reporting_to("fp2", Box::new(needs_b), done_tx);
        scheduler.schedule(other).unwrap();

        drop(release_tx);
        assert!(done_rx.recv_timeout(WAIT).unwrap().is_ok());
        assert!(done_rx.recv_timeout(WAIT).unwrap().is_ok());
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[test]
    fn cancelled_jobs_report_cancellation() {
        let scheduler = MinimizationScheduler::new(MinimizerSettings::default()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (done_tx, done_rx) = mpsc::channel();
        let job =
            job_reporting_to("fp1", Box::new(needs_b), done_tx).with_cancellation(cancel);
        scheduler.schedule(job).unwrap();
        assert!(matches!(
            done_rx.recv_timeout(WAIT).unwrap(),
            Err(MinimizeError::Cancelled { .. })
        ));
    }

    #[test]
    fn panicking_oracle_aborts_the_job_but_not_the_worker() {
        let scheduler = MinimizationScheduler::new(MinimizerSettings {
            workers: 1,
            ..MinimizerSettings::default()
        })
        .unwrap();
        let (done_tx, done_rx) = mpsc::channel();
        let exploding = |_: &Reproducer| -> OracleVerdict { panic!("replay VM vanished") };
        scheduler
            .schedule(job_reporting_to("fp1", Box::new(exploding), done_tx.clone()))
            .unwrap();
        assert_eq!(
            done_rx.recv_timeout(WAIT).unwrap(),
            Err(MinimizeError::Aborted("replay VM vanished".to_string()))
        );
        scheduler
            .schedule(job_reporting_to("fp2", Box::new(needs_b), done_tx))
            .unwrap();
        assert!(done_rx.recv_timeout(WAIT).unwrap().is_ok());
    }

    #[test]
    fn shut_down_scheduler_rejects_jobs() {
        let mut scheduler = MinimizationScheduler::new(MinimizerSettings::default()).unwrap();
        scheduler.shutdown();
        let (done_tx, _done_rx) = mpsc::channel();
        assert!(matches!(
            scheduler.schedule(job_reporting_to("fp1", Box::new(needs_b), done_tx)),
            Err(SchedulerError::ShutDown)
        ));
    }
}
