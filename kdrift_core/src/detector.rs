//! Streaming kernel log analysis.
//!
//! The detector is a two-state machine. While *idle* it matches every line
//! against the pattern library and remembers the last program the engine
//! announced. A trigger line moves it to *capturing*, where following lines
//! are buffered until a blank line, the capture bound or the next trigger.
//! Closing a capture extracts the stack trace, fingerprints the crash and
//! records it in the campaign's crash table.

use crate::config::DetectorSettings;
use crate::crash::{CrashInfo, CrashTable, CrashTableHandle, frame_symbol};
use crate::patterns::{self, VulnCategory};
use crate::reproducer::Reproducer;
use regex::Regex;
use std::sync::LazyLock;

static TIMESTAMP_PREFIX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\s*\[\s*\d+\.\d+\]\s*(?:\[\s*[TC]\d+\]\s*)?").ok());
static CALL_FRAME: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(\?\s+)?(?:RIP:\s*(?:[0-9a-fA-F]{4}:)?)?([A-Za-z_.$][\w.$]*\+0x[0-9a-fA-F]+(?:/0x[0-9a-fA-F]+)?)(?:\s+\[[^\]]+\])?\s*$",
    )
    .ok()
});
static PROGRAM_HEADER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"executing program \d+:?\s*$").ok());
static PROGRAM_OP: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(?:r\d+\s*=\s*)?[A-Za-z_][\w$]*\(.*\)\s*$").ok());
static TITLE_FUNCTION: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\bin ([A-Za-z_][\w.]*)(?:\+0x|\s|$)").ok());

/// What feeding one line produced.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorEvent {
    NewCrash(CrashInfo),
    ExistingCrashUpdate { fingerprint: String, occurrences: u64 },
}

#[derive(Debug)]
struct Capture {
    category: VulnCategory,
    title: String,
    lines: Vec<String>,
}

#[derive(Debug)]
enum DetectorState {
    Idle,
    Capturing(Capture),
}

pub struct CrashDetector {
    settings: DetectorSettings,
    campaign_id: String,
    crashes: CrashTableHandle,
    state: DetectorState,
    last_program: Vec<String>,
    reading_program: bool,
}

impl CrashDetector {
    /// A detector writing into one campaign's crash table.
    pub fn new(
        settings: DetectorSettings,
        campaign_id: impl Into<String>,
        crashes: CrashTableHandle,
    ) -> Self {
        Self {
            settings,
            campaign_id: campaign_id.into(),
            crashes,
            state: DetectorState::Idle,
            last_program: Vec::new(),
            reading_program: false,
        }
    }

    /// A detector with a private crash table, for one-off log triage.
    pub fn standalone(settings: DetectorSettings) -> Self {
        Self::new(settings, "standalone", CrashTable::handle())
    }

    pub fn crashes(&self) -> &CrashTableHandle {
        &self.crashes
    }

    pub fn is_capturing(&self) -> bool {
        matches!(self.state, DetectorState::Capturing(_))
    }

    pub fn feed(&mut self, raw_line: &str) -> Option<DetectorEvent> {
        let line = normalize_line(raw_line);
        let trigger = patterns::classify(&line);

        match std::mem::replace(&mut self.state, DetectorState::Idle) {
            DetectorState::Idle => {
                match trigger {
                    Some(category) => self.begin_capture(category, line),
                    None => self.track_program(&line),
                }
                None
            }
            DetectorState::Capturing(mut capture) => {
                // A panic right after a report is that report's epilogue.
                if let Some(category) = trigger.filter(|&c| c != VulnCategory::KernelPanic) {
                    let event = self.close_capture(capture);
                    self.begin_capture(category, line);
                    return event;
                }
                if line.trim().is_empty() {
                    return self.close_capture(capture);
                }
                capture.lines.push(line);
                if capture.lines.len() >= self.settings.max_capture_lines {
                    return self.close_capture(capture);
                }
                self.state = DetectorState::Capturing(capture);
                None
            }
        }
    }

    /// Closes a capture left open when the stream ended.
    pub fn flush(&mut self) -> Option<DetectorEvent> {
        match std::mem::replace(&mut self.state, DetectorState::Idle) {
            DetectorState::Idle => None,
            DetectorState::Capturing(capture) => self.close_capture(capture),
        }
    }

    fn begin_capture(&mut self, category: VulnCategory, title: String) {
        self.reading_program = false;
        self.state = DetectorState::Capturing(Capture {
            category,
            title: title.trim().to_string(),
            lines: Vec::new(),
        });
    }

    fn track_program(&mut self, line: &str) {
        let is_header = PROGRAM_HEADER
            .as_ref()
            .is_some_and(|regex| regex.is_match(line));
        if is_header {
            self.last_program.clear();
            self.reading_program = true;
            return;
        }
        if !self.reading_program {
            return;
        }
        let op = line.trim();
        if PROGRAM_OP.as_ref().is_some_and(|regex| regex.is_match(op)) {
            self.last_program.push(op.to_string());
        } else {
            self.reading_program = false;
        }
    }

    fn close_capture(&mut self, capture: Capture) -> Option<DetectorEvent> {
        let stack_trace = extract_frames(&capture.lines, self.settings.max_frames);
        let affected_function = affected_function(&stack_trace, &capture.title);
        let mut raw_log = capture.title.clone();
        for line in &capture.lines {
            raw_log.push('\n');
            raw_log.push_str(line);
        }

        let crash = CrashInfo::new(
            self.campaign_id.clone(),
            capture.category,
            capture.title,
            Reproducer::new(self.last_program.clone()),
            stack_trace,
            affected_function,
            raw_log,
        );

        let mut table = self.crashes.lock();
        if let Some(occurrences) = table.record_occurrence(crash.fingerprint()) {
            tracing::debug!(
                campaign = %self.campaign_id,
                fingerprint = crash.fingerprint(),
                occurrences,
                "duplicate crash"
            );
            return Some(DetectorEvent::ExistingCrashUpdate {
                fingerprint: crash.fingerprint().to_string(),
                occurrences,
            });
        }
        tracing::info!(
            campaign = %self.campaign_id,
            fingerprint = crash.fingerprint(),
            category = %crash.category,
            severity = %crash.severity,
            "new crash: {}",
            crash.title
        );
        table.insert(crash.clone());
        Some(DetectorEvent::NewCrash(crash))
    }
}

/// Runs a fresh standalone detector over a complete log and returns the distinct crashes.
pub fn scan_log(log: &str, settings: &DetectorSettings) -> Vec<CrashInfo> {
    let mut detector = CrashDetector::standalone(settings.clone());
    for line in log.lines() {
        detector.feed(line);
    }
    detector.flush();
    let table = detector.crashes().lock();
    table.iter().cloned().collect()
}

/// Drops the kernel timestamp and caller tag prefixes.
pub fn normalize_line(raw: &str) -> String {
    let line = raw.trim_end_matches(['\r', '\n']);
    match TIMESTAMP_PREFIX.as_ref() {
        Some(regex) => regex.replace(line, "").into_owned(),
        None => line.to_string(),
    }
}

/// Pulls call frames out of captured lines. Starts after a `Call Trace:` marker
/// when present, skips leading non-frame lines, stops at the first non-frame
/// line once frames began. Unreliable `?` frames are dropped.
pub fn extract_frames(lines: &[String], max_frames: usize) -> Vec<String> {
    let Some(frame_regex) = CALL_FRAME.as_ref() else {
        return Vec::new();
    };
    let start = lines
        .iter()
        .position(|line| line.trim_start().starts_with("Call Trace:"))
        .map_or(0, |marker| marker + 1);

    let mut frames = Vec::new();
    let mut started = false;
    for line in &lines[start..] {
        match frame_regex.captures(line) {
            Some(caps) => {
                started = true;
                if caps.get(1).is_some() {
                    continue;
                }
                if let Some(frame) = caps.get(2) {
                    frames.push(frame.as_str().to_string());
                }
                if frames.len() >= max_frames {
                    break;
                }
            }
            None if started => break,
            None => {}
        }
    }
    frames
}

fn affected_function(stack_trace: &[String], title: &str) -> Option<String> {
    let from_trace = stack_trace
        .iter()
        .map(|frame| frame_symbol(frame))
        .find(|symbol| !symbol.is_empty() && !patterns::is_fault_handler(symbol));
    if from_trace.is_some() {
        return from_trace;
    }
    TITLE_FUNCTION
        .as_ref()?
        .captures(title)
        .and_then(|caps| caps.get(1))
        .map(|m| frame_symbol(m.as_str()))
        .filter(|symbol| !patterns::is_fault_handler(symbol))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::CrashSeverity;

    fn feed_all(detector: &mut CrashDetector, lines: &[&str]) -> Vec<DetectorEvent> {
        lines.iter().filter_map(|line| detector.feed(line)).collect()
    }

    #[test]
    fn kasan_report_yields_one_use_after_free_crash() {
        let mut detector = CrashDetector::standalone(DetectorSettings::default());
        let events = feed_all(
            &mut detector,
            &[
                "BUG: KASAN: use-after-free in foo+0x10",
                "Call Trace:",
                "foo+0x10",
                "bar+0x20",
                "",
            ],
        );
        assert_eq!(events.len(), 1);
        let DetectorEvent::NewCrash(crash) = &events[0] else {
            panic!("expected a new crash, got {events:?}");
        };
        assert_eq!(crash.category, VulnCategory::UseAfterFree);
        assert_eq!(crash.severity, CrashSeverity::Critical);
        assert_eq!(crash.affected_function.as_deref(), Some("foo"));
        assert_eq!(crash.stack_trace, vec!["foo+0x10", "bar+0x20"]);
        assert!(!detector.is_capturing());
        assert_eq!(detector.crashes().lock().len(), 1);
    }

    #[test]
    fn trace_length_is_bounded_by_max_frames() {
        for (frames, bound) in [(3usize, 8usize), (8, 8), (20, 8), (1, 1), (5, 1)] {
            let settings = DetectorSettings {
                max_frames: bound,
                ..DetectorSettings::default()
            };
            let mut detector = CrashDetector::standalone(settings);
            let mut lines = vec!["general protection fault: 0000 [#1] SMP".to_string()];
            lines.push("Call Trace:".to_string());
            for i in 0..frames {
                lines.push(format!(" func_{i}+0x{:x}/0x100", i + 1));
            }
            lines.push(String::new());
            let events: Vec<_> = lines.iter().filter_map(|l| detector.feed(l)).collect();
            assert_eq!(events.len(), 1, "frames={frames} bound={bound}");
            let DetectorEvent::NewCrash(crash) = &events[0] else {
                panic!("expected a new crash");
            };
            assert_eq!(crash.stack_trace.len(), frames.min(bound));
        }
    }

    #[test]
    fn duplicate_signature_increments_occurrences() {
        let mut detector = CrashDetector::standalone(DetectorSettings::default());
        let report = [
            "[   10.000001] BUG: KASAN: use-after-free in foo+0x10/0x40",
            "[   10.000002] Call Trace:",
            "[   10.000003]  foo+0x10/0x40",
            "[   10.000004]  bar+0x20/0x80",
            "",
        ];
        let shifted = [
            "[   52.100001] BUG: KASAN: use-after-free in foo+0x14/0x40",
            "[   52.100002] Call Trace:",
            "[   52.100003]  foo+0x14/0x40",
            "[   52.100004]  bar+0x24/0x80",
            "",
        ];
        let first = feed_all(&mut detector, &report);
        let second = feed_all(&mut detector, &shifted);
        let DetectorEvent::NewCrash(crash) = &first[0] else {
            panic!("expected a new crash");
        };
        assert_eq!(
            second,
            vec![DetectorEvent::ExistingCrashUpdate {
                fingerprint: crash.fingerprint().to_string(),
                occurrences: 2,
            }]
        );
        let table = detector.crashes().lock();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(crash.fingerprint()).unwrap().occurrences, 2);
    }

    #[test]
    fn new_trigger_closes_the_open_capture() {
        let mut detector = CrashDetector::standalone(DetectorSettings::default());
        let events = feed_all(
            &mut detector,
            &[
                "WARNING: CPU: 0 PID: 12 at fs/inode.c:99 iput+0x5/0x30",
                "Call Trace:",
                " iput+0x5/0x30",
                " evict+0x7/0x20",
                "BUG: KASAN: double-free in kfree+0x9/0x20",
                "Call Trace:",
                " kasan_report+0x1/0x2",
                " kfree+0x9/0x20",
                " sock_release+0x3/0x10",
            ],
        );
        assert_eq!(events.len(), 1);
        assert!(detector.is_capturing());
        let flushed = detector.flush().expect("pending capture should flush");
        let DetectorEvent::NewCrash(crash) = flushed else {
            panic!("expected a new crash");
        };
        assert_eq!(crash.category, VulnCategory::DoubleFree);
        assert_eq!(crash.affected_function.as_deref(), Some("kfree"));
        assert_eq!(detector.crashes().lock().len(), 2);
    }

    #[test]
    fn frames_skip_headers_and_unreliable_entries() {
        let lines: Vec<String> = [
            "CPU: 1 PID: 4242 Comm: syz-executor Not tainted 6.8.0 #1",
            "Hardware name: QEMU Standard PC",
            "Call Trace:",
            " <TASK>",
            " dump_stack_lvl+0x1/0x2",
            " ? kasan_report+0x3/0x4",
            " tcp_close+0x10/0x80 [tcp]",
            " inet_release+0x11/0x22",
            " </TASK>",
            " sock_close+0x1/0x2",
        ]
        .iter()
        .map(|l| l.to_string())
        .collect();
        let frames = extract_frames(&lines, 32);
        assert_eq!(
            frames,
            vec!["dump_stack_lvl+0x1/0x2", "tcp_close+0x10/0x80", "inet_release+0x11/0x22"]
        );
        assert_eq!(affected_function(&frames, "title").as_deref(), Some("tcp_close"));
    }

    #[test]
    fn affected_function_falls_back_to_title() {
        assert_eq!(
            affected_function(
                &[],
                "BUG: KASAN: slab-out-of-bounds in memcpy_to_page+0x20/0x60",
            )
            .as_deref(),
            Some("memcpy_to_page")
        );
        assert_eq!(affected_function(&[], "Kernel panic - not syncing: Fatal exception"), None);
    }

    #[test]
    fn last_announced_program_becomes_the_reproducer() {
        let mut detector = CrashDetector::standalone(DetectorSettings::default());
        let events = feed_all(
            &mut detector,
            &[
                "2026/01/01 10:00:00 executing program 0:",
                "r0 = openat(0xffffffffffffff9c, &(0x7f0000000000)='./file0\\x00', 0x42, 0x0)",
                "close(r0)",
                "2026/01/01 10:00:01 executing program 1:",
                "r0 = socket$inet_tcp(0x2, 0x1, 0x0)",
                "shutdown(r0, 0x1)",
                "[   33.000000] random: crng init done",
                "[   34.000000] BUG: KASAN: use-after-free in tcp_close+0x10/0x80",
                "[   34.000001] Call Trace:",
                "[   34.000002]  tcp_close+0x10/0x80",
                "",
            ],
        );
        let DetectorEvent::NewCrash(crash) = &events[0] else {
            panic!("expected a new crash");
        };
        assert_eq!(
            crash.reproducer.ops(),
            &["r0 = socket$inet_tcp(0x2, 0x1, 0x0)", "shutdown(r0, 0x1)"]
        );
        assert_eq!(crash.title, "BUG: KASAN: use-after-free in tcp_close+0x10/0x80");
    }

    #[test]
    fn capture_line_bound_closes_the_report() {
        let settings = DetectorSettings {
            max_frames: 32,
            max_capture_lines: 3,
        };
        let mut detector = CrashDetector::standalone(settings);
        let events = feed_all(
            &mut detector,
            &["Kernel panic - not syncing: oops", "a+0x1", "b+0x2", "c+0x3", "d+0x4"],
        );
        assert_eq!(events.len(), 1);
        let DetectorEvent::NewCrash(crash) = &events[0] else {
            panic!("expected a new crash");
        };
        assert_eq!(crash.stack_trace.len(), 3);
        assert!(!detector.is_capturing());
    }

    #[test]
    fn panic_after_an_oops_belongs_to_the_oops() {
        let crashes = scan_log(
            "general protection fault: 0000 [#1] SMP\n\
             Call Trace:\n\
             \x20sock_close+0x12/0x30\n\
             \x20sock_release+0x40/0x90\n\
             Kernel panic - not syncing: Fatal exception\n\
             \n",
            &DetectorSettings::default(),
        );
        assert_eq!(crashes.len(), 1);
        assert_eq!(crashes[0].category, VulnCategory::GeneralProtectionFault);
        assert_eq!(crashes[0].stack_trace.len(), 2);

        let standalone = scan_log(
            "Kernel panic - not syncing: VFS: Unable to mount root fs\n\n",
            &DetectorSettings::default(),
        );
        assert_eq!(standalone.len(), 1);
        assert_eq!(standalone[0].category, VulnCategory::KernelPanic);
    }

    #[test]
    fn scan_log_uses_a_fresh_table_each_time() {
        let log = "BUG: KASAN: use-after-free in foo+0x10\nCall Trace:\nfoo+0x10\n";
        let first = scan_log(log, &DetectorSettings::default());
        let second = scan_log(log, &DetectorSettings::default());
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].fingerprint(), second[0].fingerprint());
        assert!(scan_log("all quiet\n", &DetectorSettings::default()).is_empty());
    }

    #[test]
    fn normalize_line_strips_timestamp_and_caller() {
        assert_eq!(normalize_line("[  12.345678][ T1234] Call Trace:"), "Call Trace:");
        assert_eq!(normalize_line("[  12.345678] BUG: x\r"), "BUG: x");
        assert_eq!(normalize_line("plain"), "plain");
    }
}
