//! Reproducer minimization.
//!
//! Two reductions alternate until neither changes the reproducer:
//!
//! 1. Operation removal, delta-debugging style: contiguous chunks are removed,
//!    starting at half the reproducer and halving down to single operations.
//!    A successful removal restarts the scan at the current chunk size.
//! 2. Numeric simplification: every literal is first tried at its lower bound
//!    (zero, or a known minimum for the argument), then binary searched
//!    between that bound and its current value.
//!
//! Each accepted candidate was confirmed by the oracle. Order of the remaining
//! operations is always preserved. The result is checked once more before it
//! is returned, since real replays can be flaky.

use crate::config::MinimizerSettings;
use crate::oracle::{OracleVerdict, ReplayOracle};
use crate::reproducer::Reproducer;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Earlier accepted candidates re-checked when the final verification fails.
const MAX_FALLBACK_CHECKS: usize = 3;

/// Known minimums for call arguments, keyed by base call name and position.
const ARGUMENT_LOWER_BOUNDS: &[(&str, usize, u64)] = &[
    ("mmap", 1, 4096),
    ("munmap", 1, 4096),
    ("mremap", 1, 4096),
    ("mprotect", 1, 4096),
    ("madvise", 1, 4096),
    ("socket", 0, 1),
    ("close", 0, 3),
    ("read", 0, 3),
    ("write", 0, 3),
    ("ioctl", 0, 3),
    ("dup", 0, 3),
    ("fstat", 0, 3),
];

fn lower_bound(operation: &str, arg_index: Option<usize>) -> u64 {
    let Some(arg_index) = arg_index else {
        return 0;
    };
    let base = operation.split('$').next().unwrap_or(operation);
    ARGUMENT_LOWER_BOUNDS
        .iter()
        .find(|(name, index, _)| *name == base && *index == arg_index)
        .map_or(0, |(_, _, bound)| *bound)
}

/// A shared flag that stops a running minimization at its next oracle call.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MinimizeError {
    #[error("original reproducer does not trigger the crash (timed out: {timed_out})")]
    NotReproducible { timed_out: bool },
    #[error("minimized reproducer failed re-verification, falling back")]
    MinimizationUnstable { fallback: Reproducer },
    #[error("minimization cancelled")]
    Cancelled { last_verified: Reproducer },
    /// The oracle panicked; nothing about the crash can be concluded.
    #[error("minimization aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinimizeOutcome {
    pub reproducer: Reproducer,
    pub oracle_calls: usize,
    pub timeouts: usize,
    /// The oracle budget ran out before a fixpoint was reached.
    pub budget_exhausted: bool,
}

enum Halt {
    Cancelled,
    Budget,
}

struct Run<'a> {
    oracle: &'a mut dyn ReplayOracle,
    cancel: &'a CancellationToken,
    budget: usize,
    calls: usize,
    timeouts: usize,
    history: Vec<Reproducer>,
}

impl Run<'_> {
    /// One budgeted reduction attempt.
    fn check(&mut self, candidate: &Reproducer) -> Result<bool, Halt> {
        if self.cancel.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        if self.calls >= self.budget {
            return Err(Halt::Budget);
        }
        Ok(self.verify(candidate).holds())
    }

    fn verify(&mut self, candidate: &Reproducer) -> OracleVerdict {
        self.calls += 1;
        let verdict = self.oracle.check(candidate);
        if verdict == OracleVerdict::Timeout {
            self.timeouts += 1;
        }
        verdict
    }

    fn accept(&mut self, current: &mut Reproducer, candidate: Reproducer) {
        self.history.push(candidate.clone());
        *current = candidate;
    }

    fn reduce_operations(&mut self, current: &mut Reproducer) -> Result<bool, Halt> {
        let mut changed = false;
        let mut chunk = (current.len() / 2).max(1);
        loop {
            let mut start = 0;
            while start < current.len() {
                let end = (start + chunk).min(current.len());
                if end - start == current.len() {
                    break;
                }
                let candidate = current.without_range(start..end);
                if self.check(&candidate)? {
                    self.accept(current, candidate);
                    changed = true;
                    start = 0;
                } else {
                    start = end;
                }
            }
            if chunk == 1 {
                return Ok(changed);
            }
            chunk /= 2;
        }
    }

    fn reduce_values(&mut self, current: &mut Reproducer) -> Result<bool, Halt> {
        let mut changed = false;
        let token_count = current.numeric_tokens().len();
        for index in 0..token_count {
            let Some(token) = current.numeric_tokens().into_iter().nth(index) else {
                break;
            };
            let floor = lower_bound(current.operation_name(token.op_index), token.arg_index);
            if token.value <= floor {
                continue;
            }
            let candidate = current.with_value(&token, floor);
            if self.check(&candidate)? {
                self.accept(current, candidate);
                changed = true;
                continue;
            }
            // `lo` fails, `hi` holds.
            let (mut lo, mut hi) = (floor, token.value);
            let mut best = None;
            while hi - lo > 1 {
                let mid = lo + (hi - lo) / 2;
                let candidate = current.with_value(&token, mid);
                if self.check(&candidate)? {
                    hi = mid;
                    best = Some(candidate);
                } else {
                    lo = mid;
                }
            }
            if let Some(best) = best {
                self.accept(current, best);
                changed = true;
            }
        }
        Ok(changed)
    }
}

/// Shrinks reproducers against a [`ReplayOracle`].
#[derive(Debug, Clone, Default)]
pub struct Minimizer {
    settings: MinimizerSettings,
    cancel: CancellationToken,
}

impl Minimizer {
    pub fn new(settings: MinimizerSettings) -> Self {
        Self {
            settings,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn minimize(
        &self,
        original: &Reproducer,
        oracle: &mut dyn ReplayOracle,
    ) -> Result<MinimizeOutcome, MinimizeError> {
        if self.cancel.is_cancelled() {
            return Err(MinimizeError::Cancelled {
                last_verified: original.clone(),
            });
        }
        let mut run = Run {
            oracle,
            cancel: &self.cancel,
            budget: self.settings.max_oracle_calls,
            calls: 0,
            timeouts: 0,
            history: vec![original.clone()],
        };

        match run.verify(original) {
            OracleVerdict::Reproduced => {}
            verdict => {
                return Err(MinimizeError::NotReproducible {
                    timed_out: verdict == OracleVerdict::Timeout,
                });
            }
        }

        let mut current = original.clone();
        let mut budget_exhausted = false;
        loop {
            let pass = match run.reduce_operations(&mut current) {
                Ok(ops_changed) => run
                    .reduce_values(&mut current)
                    .map(|values_changed| ops_changed || values_changed),
                Err(halt) => Err(halt),
            };
            match pass {
                Ok(true) => {}
                Ok(false) => break,
                Err(Halt::Cancelled) => {
                    tracing::debug!(calls = run.calls, "Minimization cancelled");
                    return Err(MinimizeError::Cancelled {
                        last_verified: current,
                    });
                }
                Err(Halt::Budget) => {
                    tracing::debug!(calls = run.calls, "Oracle budget exhausted");
                    budget_exhausted = true;
                    break;
                }
            }
        }

        if current != *original && !run.verify(&current).holds() {
            tracing::warn!(
                ops = current.len(),
                "Minimized reproducer did not re-verify, walking back"
            );
            let candidates: Vec<Reproducer> = run
                .history
                .iter()
                .rev()
                .skip(1)
                .filter(|candidate| *candidate != original)
                .take(MAX_FALLBACK_CHECKS)
                .cloned()
                .collect();
            let fallback = candidates
                .into_iter()
                .find(|candidate| run.verify(candidate).holds())
                .unwrap_or_else(|| original.clone());
            return Err(MinimizeError::MinimizationUnstable { fallback });
        }

        tracing::debug!(
            from = original.len(),
            to = current.len(),
            calls = run.calls,
            timeouts = run.timeouts,
            "Minimization finished"
        );
        Ok(MinimizeOutcome {
            reproducer: current,
            oracle_calls: run.calls,
            timeouts: run.timeouts,
            budget_exhausted,
        })
    }
}
