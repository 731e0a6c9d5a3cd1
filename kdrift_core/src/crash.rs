use crate::patterns::{CrashSeverity, VulnCategory};
use crate::reproducer::Reproducer;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

static FRAME_OFFSET: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\+0x[0-9a-fA-F]+(?:/0x[0-9a-fA-F]+)?").ok());
static CLONE_SUFFIX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\.(?:isra|constprop|part|cold|llvm)(?:\.[0-9a-f]+)*").ok());
static HEX_LITERAL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"0x[0-9a-fA-F]+|\b[0-9a-fA-F]{8,16}\b").ok());
static DECIMAL: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"[0-9]+").ok());

/// Progress of the background minimization for one crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MinimizationState {
    #[default]
    Pending,
    Running,
    Minimized,
    /// The original reproducer did not reproduce, or there was none to replay.
    Skipped,
    /// The final candidate failed re-verification; the stored minimized
    /// reproducer is the last candidate that verified again.
    Unstable,
    Cancelled,
}

/// One distinct crash found during a campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashInfo {
    fingerprint: String,
    pub campaign_id: String,
    pub category: VulnCategory,
    pub severity: CrashSeverity,
    /// The trigger line that opened the report.
    pub title: String,
    pub reproducer: Reproducer,
    pub minimized_reproducer: Option<Reproducer>,
    pub minimization: MinimizationState,
    /// Set when any replay of this crash timed out, so a negative result was ambiguous.
    pub replay_ambiguous: bool,
    pub raw_log: String,
    pub stack_trace: Vec<String>,
    pub affected_function: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub occurrences: u64,
}

impl CrashInfo {
    /// Builds a crash record. Severity comes from the category table and the
    /// fingerprint is computed here, once.
    pub fn new(
        campaign_id: impl Into<String>,
        category: VulnCategory,
        title: impl Into<String>,
        reproducer: Reproducer,
        stack_trace: Vec<String>,
        affected_function: Option<String>,
        raw_log: impl Into<String>,
    ) -> Self {
        let title = title.into();
        let fingerprint = fingerprint(category, &stack_trace, &title);
        Self {
            fingerprint,
            campaign_id: campaign_id.into(),
            category,
            severity: category.severity(),
            title,
            reproducer,
            minimized_reproducer: None,
            minimization: MinimizationState::Pending,
            replay_ambiguous: false,
            raw_log: raw_log.into(),
            stack_trace,
            affected_function,
            first_seen: Utc::now(),
            occurrences: 1,
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn summary(&self) -> CrashSummary {
        CrashSummary {
            fingerprint: self.fingerprint.clone(),
            title: self.title.clone(),
            category: self.category,
            severity: self.severity,
            has_minimized: self.minimized_reproducer.is_some(),
            occurrences: self.occurrences,
            affected_function: self.affected_function.clone(),
        }
    }

    pub fn detail(&self) -> CrashDetail {
        CrashDetail {
            fingerprint: self.fingerprint.clone(),
            title: self.title.clone(),
            category: self.category,
            severity: self.severity,
            original_reproducer: self.reproducer.clone(),
            minimized_reproducer: self.minimized_reproducer.clone(),
            minimization: self.minimization,
            replay_ambiguous: self.replay_ambiguous,
            stack_trace: self.stack_trace.clone(),
            affected_function: self.affected_function.clone(),
            raw_log: self.raw_log.clone(),
            occurrences: self.occurrences,
            first_seen: self.first_seen,
        }
    }
}

/// The `ListCrashes` view of a crash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashSummary {
    pub fingerprint: String,
    pub title: String,
    pub category: VulnCategory,
    pub severity: CrashSeverity,
    pub has_minimized: bool,
    pub occurrences: u64,
    pub affected_function: Option<String>,
}

/// The `GetCrash` view of a crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashDetail {
    pub fingerprint: String,
    pub title: String,
    pub category: VulnCategory,
    pub severity: CrashSeverity,
    pub original_reproducer: Reproducer,
    pub minimized_reproducer: Option<Reproducer>,
    pub minimization: MinimizationState,
    pub replay_ambiguous: bool,
    pub stack_trace: Vec<String>,
    pub affected_function: Option<String>,
    pub raw_log: String,
    pub occurrences: u64,
    pub first_seen: DateTime<Utc>,
}

/// Crashes of one campaign keyed by fingerprint, kept in first-seen order.
#[derive(Debug, Default)]
pub struct CrashTable {
    entries: Vec<CrashInfo>,
    index: HashMap<String, usize>,
}

/// Write handle to one campaign's crash table. Every mutation goes through the lock.
pub type CrashTableHandle = Arc<Mutex<CrashTable>>;

impl CrashTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle() -> CrashTableHandle {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Inserts `crash` unless its fingerprint is already known. Returns whether it was inserted.
    pub fn insert(&mut self, crash: CrashInfo) -> bool {
        if self.index.contains_key(crash.fingerprint()) {
            return false;
        }
        self.index
            .insert(crash.fingerprint().to_string(), self.entries.len());
        self.entries.push(crash);
        true
    }

    /// Bumps the occurrence counter of a known crash, returning the new count.
    pub fn record_occurrence(&mut self, fingerprint: &str) -> Option<u64> {
        let crash = self.get_mut(fingerprint)?;
        crash.occurrences += 1;
        Some(crash.occurrences)
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.index.contains_key(fingerprint)
    }

    pub fn get(&self, fingerprint: &str) -> Option<&CrashInfo> {
        self.index.get(fingerprint).map(|&i| &self.entries[i])
    }

    pub fn get_mut(&mut self, fingerprint: &str) -> Option<&mut CrashInfo> {
        match self.index.get(fingerprint) {
            Some(&i) => self.entries.get_mut(i),
            None => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &CrashInfo> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Strips the `+0xOFF/0xSIZE` suffix, module tag and compiler clone suffixes from a frame.
pub fn frame_symbol(frame: &str) -> String {
    let frame = frame.trim().trim_start_matches('?').trim();
    let frame = frame.split_whitespace().next().unwrap_or("");
    let without_offset = match FRAME_OFFSET.as_ref() {
        Some(regex) => regex.replace_all(frame, "").into_owned(),
        None => frame.to_string(),
    };
    match CLONE_SUFFIX.as_ref() {
        Some(regex) => regex.replace_all(&without_offset, "").into_owned(),
        None => without_offset,
    }
}

/// Stable crash identity: md5 over the category and the address-free frame symbols.
/// Reports without frames fall back to the title with addresses and numbers masked.
pub fn fingerprint(category: VulnCategory, stack_trace: &[String], title: &str) -> String {
    let mut material = String::from(category.name());
    if stack_trace.is_empty() {
        material.push('\n');
        material.push_str(&normalize_title(title));
    } else {
        for frame in stack_trace {
            material.push('\n');
            material.push_str(&frame_symbol(frame));
        }
    }
    format!("{:x}", md5::compute(material.as_bytes()))
}

fn normalize_title(title: &str) -> String {
    let masked = match HEX_LITERAL.as_ref() {
        Some(regex) => regex.replace_all(title, "ADDR").into_owned(),
        None => title.to_string(),
    };
    match DECIMAL.as_ref() {
        Some(regex) => regex.replace_all(&masked, "N").into_owned(),
        None => masked,
    }
}
