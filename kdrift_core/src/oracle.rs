use crate::crash::CrashInfo;
use crate::engine::FuzzEngine;
use crate::patterns::VulnCategory;
use crate::reproducer::Reproducer;
use std::sync::Arc;

/// The answer a replay oracle gives for one candidate reproducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleVerdict {
    /// The candidate triggers the crash under investigation.
    Reproduced,
    /// The candidate ran to completion without the crash.
    NotReproduced,
    /// The replay did not finish in time. Minimization treats this as
    /// "does not hold" but counts it separately.
    Timeout,
}

impl OracleVerdict {
    /// Whether the candidate may replace the current reproducer.
    pub fn holds(self) -> bool {
        self == OracleVerdict::Reproduced
    }
}

/// A `ReplayOracle` decides whether a candidate reproducer still triggers a
/// particular crash.
///
/// Minimization is a pure function of its input and the oracle's answers, so
/// implementations should be deterministic for a given candidate where the
/// target allows it. Closures `FnMut(&Reproducer) -> OracleVerdict` implement
/// this trait, which keeps tests and ad-hoc oracles short.
pub trait ReplayOracle: Send {
    fn check(&mut self, candidate: &Reproducer) -> OracleVerdict;
}

impl<F> ReplayOracle for F
where
    F: FnMut(&Reproducer) -> OracleVerdict + Send,
{
    fn check(&mut self, candidate: &Reproducer) -> OracleVerdict {
        self(candidate)
    }
}

/// Identity of the crash a minimization must keep triggering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashSignature {
    pub category: VulnCategory,
    pub fingerprint: String,
    pub affected_function: Option<String>,
    pub has_frames: bool,
}

impl CrashSignature {
    pub fn of(crash: &CrashInfo) -> Self {
        Self {
            category: crash.category,
            fingerprint: crash.fingerprint().to_string(),
            affected_function: crash.affected_function.clone(),
            has_frames: !crash.stack_trace.is_empty(),
        }
    }

    /// Same fingerprint, or, when either side has no stack trace to compare,
    /// same category and affected function.
    pub fn matches(&self, crash: &CrashInfo) -> bool {
        if crash.category != self.category {
            return false;
        }
        if crash.fingerprint() == self.fingerprint {
            return true;
        }
        let traceless = !self.has_frames || crash.stack_trace.is_empty();
        traceless
            && self.affected_function.is_some()
            && crash.affected_function == self.affected_function
    }
}

/// Replays candidates through a [`FuzzEngine`] and checks for the original crash.
///
/// A replay that crashes somewhere else does not hold, even within the same
/// category: the candidate drifted onto a different bug.
pub struct CrashOracle {
    engine: Arc<dyn FuzzEngine>,
    expected: CrashSignature,
}

impl CrashOracle {
    pub fn new(engine: Arc<dyn FuzzEngine>, expected: CrashSignature) -> Self {
        Self { engine, expected }
    }

    pub fn for_crash(engine: Arc<dyn FuzzEngine>, crash: &CrashInfo) -> Self {
        Self::new(engine, CrashSignature::of(crash))
    }

    pub fn expected(&self) -> &CrashSignature {
        &self.expected
    }
}

impl ReplayOracle for CrashOracle {
    fn check(&mut self, candidate: &Reproducer) -> OracleVerdict {
        let outcome = match self.engine.replay(candidate) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("Replay failed, counting candidate as not reproducing: {e}");
                return OracleVerdict::NotReproduced;
            }
        };
        if outcome.timed_out && !outcome.reproduced {
            return OracleVerdict::Timeout;
        }
        if !outcome.reproduced {
            return OracleVerdict::NotReproduced;
        }
        if outcome
            .crashes
            .iter()
            .any(|crash| self.expected.matches(crash))
        {
            OracleVerdict::Reproduced
        } else {
            tracing::debug!(
                expected = %self.expected.fingerprint,
                category = %self.expected.category,
                "Replay crashed with a different signature"
            );
            OracleVerdict::NotReproduced
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectorSettings;
    use crate::detector::scan_log;
    use crate::engine::{EngineError, EngineSession, ReplayOutcome};
    use crate::minimizer::Minimizer;
    use crate::strategy::FuzzingStrategy;

    struct ScriptedEngine {
        log: &'static str,
        timed_out: bool,
        fail: bool,
    }

    impl FuzzEngine for ScriptedEngine {
        fn start_campaign(&self, _: &FuzzingStrategy) -> Result<EngineSession, EngineError> {
            Err(EngineError::EngineUnavailable("replay only".to_string()))
        }

        fn replay(&self, _: &Reproducer) -> Result<ReplayOutcome, EngineError> {
            if self.fail {
                return Err(EngineError::EngineUnavailable("runner missing".to_string()));
            }
            Ok(ReplayOutcome::from_log(
                self.log.to_string(),
                self.timed_out,
                &DetectorSettings::default(),
            ))
        }
    }

    const UAF_LOG: &str = "BUG: KASAN: use-after-free in f+0x1/0x2\nCall Trace:\n f+0x1/0x2\n\n";
    const UAF_ELSEWHERE_LOG: &str =
        "BUG: KASAN: use-after-free in g+0x1/0x2\nCall Trace:\n g+0x1/0x2\n\n";
    const UAF_NO_TRACE_LOG: &str = "BUG: KASAN: use-after-free in f+0x1/0x2\n\n";
    const NULL_LOG: &str = "BUG: kernel NULL pointer dereference, address: 0000000000000008\n\n";

    fn crash_in(log: &str) -> CrashInfo {
        scan_log(log, &DetectorSettings::default())
            .into_iter()
            .next()
            .unwrap()
    }

    fn oracle(log: &'static str, timed_out: bool, fail: bool) -> CrashOracle {
        CrashOracle::for_crash(
            Arc::new(ScriptedEngine {
                log,
                timed_out,
                fail,
            }),
            &crash_in(UAF_LOG),
        )
    }

    #[test]
    fn original_crash_holds() {
        let candidate = Reproducer::from(vec!["open(f)"]);
        assert_eq!(
            oracle(UAF_LOG, false, false).check(&candidate),
            OracleVerdict::Reproduced
        );
        assert!(OracleVerdict::Reproduced.holds());
        assert!(!OracleVerdict::Timeout.holds());
    }

    #[test]
    fn different_category_or_clean_run_does_not_hold() {
        let candidate = Reproducer::from(vec!["open(f)"]);
        assert_eq!(
            oracle(NULL_LOG, false, false).check(&candidate),
            OracleVerdict::NotReproduced
        );
        assert_eq!(
            oracle("all good\n", false, false).check(&candidate),
            OracleVerdict::NotReproduced
        );
    }

    #[test]
    fn same_category_in_another_function_does_not_hold() {
        let candidate = Reproducer::from(vec!["open(f)"]);
        assert_eq!(
            oracle(UAF_ELSEWHERE_LOG, false, false).check(&candidate),
            OracleVerdict::NotReproduced
        );
    }

    #[test]
    fn traceless_replay_matches_on_affected_function() {
        let candidate = Reproducer::from(vec!["open(f)"]);
        assert_eq!(
            oracle(UAF_NO_TRACE_LOG, false, false).check(&candidate),
            OracleVerdict::Reproduced
        );
        let signature = CrashSignature::of(&crash_in(UAF_LOG));
        let elsewhere = crash_in("BUG: KASAN: use-after-free in g+0x1/0x2\n\n");
        assert!(!signature.matches(&elsewhere));
    }

    #[test]
    fn timeouts_and_replay_errors_are_reported() {
        let candidate = Reproducer::from(vec!["open(f)"]);
        assert_eq!(oracle("", true, false).check(&candidate), OracleVerdict::Timeout);
        assert_eq!(
            oracle(UAF_LOG, true, false).check(&candidate),
            OracleVerdict::Reproduced
        );
        assert_eq!(
            oracle(UAF_LOG, false, true).check(&candidate),
            OracleVerdict::NotReproduced
        );
    }

    /// Crashes in `vuln_func` only with both ops, in `unrelated_func` with `trigger()` alone.
    struct TwoBugEngine;

    impl FuzzEngine for TwoBugEngine {
        fn start_campaign(&self, _: &FuzzingStrategy) -> Result<EngineSession, EngineError> {
            Err(EngineError::EngineUnavailable("replay only".to_string()))
        }

        fn replay(&self, candidate: &Reproducer) -> Result<ReplayOutcome, EngineError> {
            let has = |name: &str| candidate.ops().iter().any(|op| op == name);
            let function = match (has("setup()"), has("trigger()")) {
                (true, true) => Some("vuln_func"),
                (false, true) => Some("unrelated_func"),
                _ => None,
            };
            let log = function.map_or_else(String::new, |function| {
                format!(
                    "BUG: KASAN: use-after-free in {function}+0x10/0x40\n\
                     Call Trace:\n {function}+0x10/0x40\n\n"
                )
            });
            Ok(ReplayOutcome::from_log(log, false, &DetectorSettings::default()))
        }
    }

    #[test]
    fn minimization_keeps_the_original_bug() {
        let engine: Arc<dyn FuzzEngine> = Arc::new(TwoBugEngine);
        let original = Reproducer::from(vec!["noise()", "setup()", "trigger()"]);
        let crash = engine
            .replay(&original)
            .unwrap()
            .crashes
            .into_iter()
            .next()
            .unwrap();
        assert_eq!(crash.affected_function.as_deref(), Some("vuln_func"));

        let mut oracle = CrashOracle::for_crash(Arc::clone(&engine), &crash);
        let outcome = Minimizer::default().minimize(&original, &mut oracle).unwrap();
        assert_eq!(outcome.reproducer.ops(), &["setup()", "trigger()"]);
        let replayed = engine.replay(&outcome.reproducer).unwrap();
        assert_eq!(
            replayed.crashes[0].affected_function.as_deref(),
            Some("vuln_func")
        );
    }

    #[test]
    fn closures_are_oracles() {
        let mut calls = 0;
        let mut oracle = |candidate: &Reproducer| {
            calls += 1;
            if candidate.len() > 1 {
                OracleVerdict::Reproduced
            } else {
                OracleVerdict::NotReproduced
            }
        };
        assert!(oracle.check(&Reproducer::from(vec!["a()", "b()"])).holds());
        assert!(!oracle.check(&Reproducer::from(vec!["a()"])).holds());
        assert_eq!(calls, 2);
    }
}
