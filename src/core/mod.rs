pub mod cache;
pub mod checksum;
pub mod engine;
pub mod executor;
pub mod planner;
pub mod progress;
pub mod reaper;
pub mod remote;
pub mod scanner;
pub mod stats;

pub use cache::{CacheEntry, ChecksumCache};
pub use checksum::{fingerprint, ChecksumError, ChecksumStrategy};
pub use engine::{AutoConfirm, Confirm, Outcome, PlanSummary, SyncEngine, SyncOptions, SyncReport};
pub use executor::Executor;
pub use planner::{classify_file, Classification, Planner, SyncPlan};
pub use progress::{ProgressSender, SyncProgress};
pub use reaper::reap_empty_directories;
pub use remote::{fetch_remote_inventory, ListingPolicy, RemoteInventory};
pub use scanner::{default_excluded_files, ExcludeRules, FileScanner, LocalFile, LocalInventory};
pub use stats::{RunStatistics, StatsSnapshot};
