pub mod campaign;
pub mod config;
pub mod crash;
pub mod crash_store;
pub mod detector;
pub mod engine;
pub mod minimizer;
pub mod oracle;
pub mod patterns;
pub mod reproducer;
pub mod scheduler;
pub mod strategy;

pub use campaign::{
    CampaignError, CampaignId, CampaignManager, CampaignReport, CampaignStatus,
    CampaignStatusReport, StrategyRequest,
};
pub use config::KdriftConfig;
pub use crash::{CrashDetail, CrashInfo, CrashSummary, CrashTable, MinimizationState};
pub use crash_store::{CrashStore, CrashStoreError};
pub use detector::{CrashDetector, DetectorEvent, scan_log};
pub use engine::{CommandEngine, EngineError, FuzzEngine, ReplayOutcome};
pub use minimizer::{CancellationToken, MinimizeError, MinimizeOutcome, Minimizer};
pub use oracle::{CrashOracle, OracleVerdict, ReplayOracle};
pub use patterns::{CrashSeverity, VulnCategory};
pub use reproducer::Reproducer;
pub use scheduler::{MinimizationJob, MinimizationScheduler, SchedulerError};
pub use strategy::{FuzzingStrategy, FuzzingTarget, StrategyConstraints, StrategyGenerator};
