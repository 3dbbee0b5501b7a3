//! Default configuration values

/// Maximum number of builds holding a slot at the same time
pub const MAX_CONCURRENT_BUILDS: usize = 4;

/// Safety expiration for a held slot (in seconds)
pub const SLOT_TTL_SECS: u64 = 7200; // 2 hours

/// Interval between admission attempts in blocking mode (in milliseconds)
pub const ACQUIRE_POLL_INTERVAL_MS: u64 = 500;

/// How long blocking admission waits before reporting a timeout (in seconds)
pub const ACQUIRE_TIMEOUT_SECS: u64 = 300;

/// Interval between reconciliation monitor passes (in seconds)
pub const MONITOR_INTERVAL_SECS: u64 = 30;

/// Minimum age of a pending unit before the monitor re-dispatches it (in seconds)
pub const PENDING_GRACE_SECS: u64 = 30;

/// Fixed backoff before a transient failure is retried (in seconds)
pub const RETRY_BACKOFF_SECS: u64 = 60;

/// Units without a descriptor re-prepared per monitor pass
pub const MONITOR_PREPARE_LIMIT: usize = 50;

/// Items reported per classified error category
pub const CLASSIFIER_MAX_ITEMS: usize = 10;

/// Items shown per category in the text report
pub const REPORT_PREVIEW_ITEMS: usize = 5;

/// Default build target
pub const DEFAULT_TARGET: &str = "rhel-9";

/// Default architecture
pub const DEFAULT_ARCH: &str = "x86_64";

/// Directory holding mock chroot configurations
pub const MOCK_CONFIG_DIR: &str = "/etc/mock";

/// Time budget for the intermediate (source package) build (in seconds)
pub const INTERMEDIATE_TIMEOUT_SECS: u64 = 600;

/// Time budget for the final (binary package) build (in seconds)
pub const FINAL_TIMEOUT_SECS: u64 = 7200;

/// Chroot builder executable
pub const MOCK_BIN: &str = "mock";

/// Source package builder executable
pub const RPMBUILD_BIN: &str = "rpmbuild";

/// Settings file name
pub const SETTINGS_FILE: &str = "reqpm.toml";

/// Key prefix of job identifiers shared by the gate and the task runner
pub const JOB_PREFIX: &str = "build_";

/// Capacity of the live event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
