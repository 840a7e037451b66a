use std::env;
use std::sync::OnceLock;
use std::time::Duration;

/// Process-wide settings shared by every manager, scheduler and relationship
/// controller in the process. Installed once via [install] or lazily from the
/// environment on first access.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Hard ceiling on relationship graph recursion, regardless of any
    /// per-path depth limit.
    pub relationship_max_depth: usize,
    /// Delay before the scheduler retries after a failed request.
    pub scheduler_retry_delay: Duration,
    /// Gap between a relationship fetch and its graph insertion above which
    /// the debug instrumentation logs a warning.
    pub abnormal_fetch_threshold: Duration,
    /// Enables the relationship controller's timing instrumentation.
    pub relationship_debug: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            relationship_max_depth: 10,
            scheduler_retry_delay: Duration::from_secs(15),
            abnormal_fetch_threshold: Duration::from_millis(500),
            relationship_debug: false,
        }
    }
}

impl CoreConfig {
    /// Reads optional overrides from the environment. Unlike a deployed
    /// service, a library cannot demand env vars, so every setting has a
    /// default.
    pub fn from_env() -> Self {
        let mut conf = Self::default();
        if let Ok(depth) = env::var("STRATA_RELATIONSHIP_MAX_DEPTH") {
            if let Ok(depth) = depth.parse() {
                conf.relationship_max_depth = depth;
            }
        }
        if let Ok(secs) = env::var("STRATA_SCHEDULER_RETRY_SECS") {
            if let Ok(secs) = secs.parse() {
                conf.scheduler_retry_delay = Duration::from_secs(secs);
            }
        }
        conf.relationship_debug = env::var("STRATA_RELATIONSHIP_DEBUG")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        conf
    }
}

static CONFIG: OnceLock<CoreConfig> = OnceLock::new();

/// Installs the process-wide configuration. Returns the given config back, or
/// the previously installed one if [install] or [config] already ran.
pub fn install(conf: CoreConfig) -> &'static CoreConfig {
    CONFIG.get_or_init(|| conf)
}

/// The process-wide configuration, initialized from the environment on first
/// access when [install] was never called.
pub fn config() -> &'static CoreConfig {
    CONFIG.get_or_init(CoreConfig::from_env)
}
