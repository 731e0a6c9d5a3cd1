use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use thiserror::Error;

/// How bad a crash is. Ordered so that `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CrashSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for CrashSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CrashSeverity::Low => "low",
            CrashSeverity::Medium => "medium",
            CrashSeverity::High => "high",
            CrashSeverity::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// The vulnerability class a crash signature belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VulnCategory {
    UseAfterFree,
    OutOfBounds,
    DoubleFree,
    InvalidFree,
    NullPointerDeref,
    GeneralProtectionFault,
    KernelPanic,
    KernelBug,
    UninitMemory,
    DataRace,
    UndefinedBehavior,
    MemoryLeak,
    Deadlock,
    Hang,
    Warning,
}

impl VulnCategory {
    pub const ALL: [VulnCategory; 15] = [
        VulnCategory::UseAfterFree,
        VulnCategory::OutOfBounds,
        VulnCategory::DoubleFree,
        VulnCategory::InvalidFree,
        VulnCategory::NullPointerDeref,
        VulnCategory::GeneralProtectionFault,
        VulnCategory::KernelPanic,
        VulnCategory::KernelBug,
        VulnCategory::UninitMemory,
        VulnCategory::DataRace,
        VulnCategory::UndefinedBehavior,
        VulnCategory::MemoryLeak,
        VulnCategory::Deadlock,
        VulnCategory::Hang,
        VulnCategory::Warning,
    ];

    /// Fixed category to severity table. Total over every category.
    pub fn severity(self) -> CrashSeverity {
        match self {
            VulnCategory::UseAfterFree
            | VulnCategory::OutOfBounds
            | VulnCategory::DoubleFree
            | VulnCategory::InvalidFree
            | VulnCategory::KernelPanic => CrashSeverity::Critical,
            VulnCategory::GeneralProtectionFault
            | VulnCategory::KernelBug
            | VulnCategory::UninitMemory => CrashSeverity::High,
            VulnCategory::NullPointerDeref
            | VulnCategory::DataRace
            | VulnCategory::UndefinedBehavior
            | VulnCategory::Deadlock
            | VulnCategory::MemoryLeak => CrashSeverity::Medium,
            VulnCategory::Hang | VulnCategory::Warning => CrashSeverity::Low,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            VulnCategory::UseAfterFree => "use-after-free",
            VulnCategory::OutOfBounds => "out-of-bounds",
            VulnCategory::DoubleFree => "double-free",
            VulnCategory::InvalidFree => "invalid-free",
            VulnCategory::NullPointerDeref => "null-pointer-deref",
            VulnCategory::GeneralProtectionFault => "general-protection-fault",
            VulnCategory::KernelPanic => "kernel-panic",
            VulnCategory::KernelBug => "kernel-bug",
            VulnCategory::UninitMemory => "uninit-memory",
            VulnCategory::DataRace => "data-race",
            VulnCategory::UndefinedBehavior => "undefined-behavior",
            VulnCategory::MemoryLeak => "memory-leak",
            VulnCategory::Deadlock => "deadlock",
            VulnCategory::Hang => "hang",
            VulnCategory::Warning => "warning",
        }
    }
}

impl fmt::Display for VulnCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown vulnerability category '{0}'")]
pub struct UnknownCategory(pub String);

impl FromStr for VulnCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        VulnCategory::ALL
            .into_iter()
            .find(|category| category.name() == wanted)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

/// One crash signature: a regex over a normalized log line and the category it reports.
#[derive(Debug, Clone, Copy)]
pub struct CrashPattern {
    pub pattern: &'static str,
    pub category: VulnCategory,
}

/// Trigger patterns, most specific first. The first match wins, so the generic
/// `BUG:` and `WARNING:` catch-alls must stay at the end of their families.
pub const PATTERNS: &[CrashPattern] = &[
    CrashPattern {
        pattern: r"KASAN: [\w-]*use-after-free",
        category: VulnCategory::UseAfterFree,
    },
    CrashPattern {
        pattern: r"KASAN: [\w-]*out-of-bounds",
        category: VulnCategory::OutOfBounds,
    },
    CrashPattern {
        pattern: r"KASAN: double-free",
        category: VulnCategory::DoubleFree,
    },
    CrashPattern {
        pattern: r"KASAN: invalid-free",
        category: VulnCategory::InvalidFree,
    },
    CrashPattern {
        pattern: r"KMSAN: (?:uninit-value|kernel-infoleak|kernel-usb-infoleak)",
        category: VulnCategory::UninitMemory,
    },
    CrashPattern {
        pattern: r"KCSAN: data-race",
        category: VulnCategory::DataRace,
    },
    CrashPattern {
        pattern: r"UBSAN: ",
        category: VulnCategory::UndefinedBehavior,
    },
    CrashPattern {
        pattern: r"(?:BUG: (?:unable to handle )?kernel NULL pointer dereference|KASAN: null-ptr-deref)",
        category: VulnCategory::NullPointerDeref,
    },
    CrashPattern {
        pattern: r"BUG: unable to handle (?:page fault|kernel paging request)",
        category: VulnCategory::GeneralProtectionFault,
    },
    CrashPattern {
        pattern: r"general protection fault",
        category: VulnCategory::GeneralProtectionFault,
    },
    CrashPattern {
        pattern: r"Kernel panic - not syncing",
        category: VulnCategory::KernelPanic,
    },
    CrashPattern {
        pattern: r"BUG: memory leak",
        category: VulnCategory::MemoryLeak,
    },
    CrashPattern {
        pattern: r"(?:BUG: soft lockup|BUG: workqueue lockup|INFO: task .* blocked for more than \d+ seconds|INFO: rcu_\w+ (?:self-)?detected stalls?)",
        category: VulnCategory::Hang,
    },
    CrashPattern {
        pattern: r"(?:possible circular locking dependency|possible recursive locking|possible deadlock|inconsistent lock state)",
        category: VulnCategory::Deadlock,
    },
    CrashPattern {
        pattern: r"(?:^BUG: |kernel BUG at )",
        category: VulnCategory::KernelBug,
    },
    CrashPattern {
        pattern: r"^WARNING: ",
        category: VulnCategory::Warning,
    },
];

static COMPILED: LazyLock<Vec<(Regex, VulnCategory)>> = LazyLock::new(|| {
    PATTERNS
        .iter()
        .filter_map(|entry| match Regex::new(entry.pattern) {
            Ok(regex) => Some((regex, entry.category)),
            Err(e) => {
                tracing::error!(pattern = entry.pattern, "skipping invalid crash pattern: {e}");
                None
            }
        })
        .collect()
});

/// Returns the category of the first trigger pattern matching `line`, if any.
pub fn classify(line: &str) -> Option<VulnCategory> {
    COMPILED
        .iter()
        .find(|(regex, _)| regex.is_match(line))
        .map(|(_, category)| *category)
}

/// Frames that belong to the fault reporting machinery rather than the buggy code.
const FAULT_HANDLER_FRAMES: &[&str] = &[
    "dump_stack",
    "dump_stack_lvl",
    "show_stack",
    "print_report",
    "print_address_description",
    "print_address_description.constprop.0",
    "kasan_report",
    "__kasan_report",
    "kasan_check_range",
    "kasan_report_invalid_free",
    "check_memory_region",
    "panic",
    "__warn",
    "warn_slowpath_fmt",
    "report_bug",
    "handle_bug",
    "exc_invalid_op",
    "asm_exc_invalid_op",
    "do_error_trap",
    "die",
    "die_addr",
    "oops_end",
    "no_context",
    "page_fault_oops",
    "kernelmode_fixup_or_oops",
    "__bad_area_nosemaphore",
    "bad_area_nosemaphore",
    "do_user_addr_fault",
    "exc_page_fault",
    "asm_exc_page_fault",
    "exc_general_protection",
    "asm_exc_general_protection",
    "print_circular_bug",
    "check_noncircular",
    "check_prev_add",
    "validate_chain",
    "__lock_acquire",
    "lock_acquire",
    "watchdog_timer_fn",
    "check_hung_uninterruptible_tasks",
    "watchdog",
];

const FAULT_HANDLER_PREFIXES: &[&str] = &[
    "__asan_",
    "__kasan_",
    "kasan_",
    "__msan_",
    "kmsan_",
    "kcsan_",
    "__tsan_",
    "__ubsan_handle_",
    "ubsan_",
    "lockdep_",
    "__sanitizer_",
];

/// Whether `symbol` is part of the fault reporting path (excluded when picking
/// the affected function).
pub fn is_fault_handler(symbol: &str) -> bool {
    FAULT_HANDLER_FRAMES.contains(&symbol)
        || FAULT_HANDLER_PREFIXES
            .iter()
            .any(|prefix| symbol.starts_with(prefix))
}
