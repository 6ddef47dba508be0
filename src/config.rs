use std::{fmt, sync::Arc, time::Duration};

use crate::{
    clock::{Clock, SystemClock},
    policy::{BatchingConfig, McpConfig},
    store::ConfigStore,
    FlagService,
};

/// Configuration for [`FlagService`].
///
/// # Examples
/// ```
/// # use std::{sync::Arc, time::Duration};
/// # use gateway_flags::{InMemoryConfigStore, ServiceConfig};
/// let service = ServiceConfig::new()
///     .with_environment("production")
///     .with_refresh_interval(Duration::from_secs(30))
///     .to_service(Arc::new(InMemoryConfigStore::new()));
/// ```
#[derive(Clone)]
pub struct ServiceConfig {
    pub(crate) environment: String,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) cache_ttl: Duration,
    pub(crate) max_cache_entries: u64,
    pub(crate) store_timeout: Option<Duration>,
    pub(crate) refresh_interval: Duration,
    pub(crate) refresh_jitter: Duration,
    pub(crate) flag_prefix: String,
    pub(crate) experiment_prefix: String,
}

impl ServiceConfig {
    /// Default value for [`ServiceConfig::with_environment`].
    pub const DEFAULT_ENVIRONMENT: &'static str = "development";
    /// Default value for [`ServiceConfig::with_cache_ttl`].
    pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
    /// Default value for [`ServiceConfig::with_max_cache_entries`].
    pub const DEFAULT_MAX_CACHE_ENTRIES: u64 = 10_000;
    /// Default value for [`ServiceConfig::with_store_timeout`].
    pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(50);
    /// Default value for [`ServiceConfig::with_refresh_interval`].
    pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
    /// Default value for [`ServiceConfig::with_refresh_jitter`].
    pub const DEFAULT_REFRESH_JITTER: Duration = Duration::from_secs(5);
    /// Store key prefix of flag definitions.
    pub const DEFAULT_FLAG_PREFIX: &'static str = "feature-flags/";
    /// Store key prefix of experiment definitions.
    pub const DEFAULT_EXPERIMENT_PREFIX: &'static str = "experiments/";

    /// Create a configuration with default settings.
    pub fn new() -> ServiceConfig {
        ServiceConfig::default()
    }

    /// Environment this process runs in, matched against flag environment allow-lists.
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Time source for schedules and cache staleness.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Age after which a cached definition is re-read from the store on next access.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Upper bound of cached definitions per kind.
    pub fn with_max_cache_entries(mut self, max_entries: u64) -> Self {
        self.max_cache_entries = max_entries;
        self
    }

    /// Bound on a single store read on cache miss. `None` waits as long as the store takes.
    pub fn with_store_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Interval between background reloads of all definitions.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Random amount subtracted from each refresh interval, so that instances started together
    /// do not hit the store together.
    pub fn with_refresh_jitter(mut self, jitter: Duration) -> Self {
        self.refresh_jitter = jitter;
        self
    }

    /// Override the store key prefix of flags.
    pub fn with_flag_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.flag_prefix = prefix.into();
        self
    }

    /// Override the store key prefix of experiments.
    pub fn with_experiment_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.experiment_prefix = prefix.into();
        self
    }

    /// Environment this process runs in.
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Create a new [`FlagService`] reading definitions from `store`.
    pub fn to_service(self, store: Arc<dyn ConfigStore>) -> FlagService {
        FlagService::new(self, store)
    }
}

impl Default for ServiceConfig {
    fn default() -> ServiceConfig {
        ServiceConfig {
            environment: ServiceConfig::DEFAULT_ENVIRONMENT.to_owned(),
            clock: Arc::new(SystemClock),
            cache_ttl: ServiceConfig::DEFAULT_CACHE_TTL,
            max_cache_entries: ServiceConfig::DEFAULT_MAX_CACHE_ENTRIES,
            store_timeout: Some(ServiceConfig::DEFAULT_STORE_TIMEOUT),
            refresh_interval: ServiceConfig::DEFAULT_REFRESH_INTERVAL,
            refresh_jitter: ServiceConfig::DEFAULT_REFRESH_JITTER,
            flag_prefix: ServiceConfig::DEFAULT_FLAG_PREFIX.to_owned(),
            experiment_prefix: ServiceConfig::DEFAULT_EXPERIMENT_PREFIX.to_owned(),
        }
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("environment", &self.environment)
            .field("cache_ttl", &self.cache_ttl)
            .field("max_cache_entries", &self.max_cache_entries)
            .field("store_timeout", &self.store_timeout)
            .field("refresh_interval", &self.refresh_interval)
            .field("refresh_jitter", &self.refresh_jitter)
            .field("flag_prefix", &self.flag_prefix)
            .field("experiment_prefix", &self.experiment_prefix)
            .finish_non_exhaustive()
    }
}

/// A backend model provider and its place in the static priority table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSpec {
    /// Provider name as used in flag and variant names.
    pub name: String,
    /// Lower is preferred.
    pub default_priority: u32,
}

impl ProviderSpec {
    /// Describe a provider with its default priority.
    pub fn new(name: impl Into<String>, default_priority: u32) -> ProviderSpec {
        ProviderSpec {
            name: name.into(),
            default_priority,
        }
    }
}

/// Static defaults of the routing policy adapter, used whenever no flag or experiment decides.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyConfig {
    pub(crate) providers: Vec<ProviderSpec>,
    pub(crate) experimental_providers: Vec<ProviderSpec>,
    pub(crate) fallback_provider: String,
    pub(crate) batching: BatchingConfig,
    pub(crate) cost_threshold: f64,
    pub(crate) mcp: McpConfig,
}

impl PolicyConfig {
    /// Priority of providers missing from the catalog.
    pub const UNKNOWN_PROVIDER_PRIORITY: u32 = 100;
    /// Default value for [`PolicyConfig::with_cost_threshold`].
    pub const DEFAULT_COST_THRESHOLD: f64 = 0.5;

    /// Create a configuration with the default provider catalog.
    pub fn new() -> PolicyConfig {
        PolicyConfig::default()
    }

    /// Providers each gated by their own `provider-{name}-enabled` flag.
    pub fn with_providers(mut self, providers: Vec<ProviderSpec>) -> Self {
        self.providers = providers;
        self
    }

    /// Providers added together when the `experimental-providers` flag is on.
    pub fn with_experimental_providers(mut self, providers: Vec<ProviderSpec>) -> Self {
        self.experimental_providers = providers;
        self
    }

    /// Provider used when no provider is enabled.
    pub fn with_fallback_provider(mut self, provider: impl Into<String>) -> Self {
        self.fallback_provider = provider.into();
        self
    }

    /// Static batching policy used when no flag or experiment decides.
    pub fn with_batching(mut self, batching: BatchingConfig) -> Self {
        self.batching = batching;
        self
    }

    /// Static cost threshold used when no flag or experiment decides.
    pub fn with_cost_threshold(mut self, threshold: f64) -> Self {
        self.cost_threshold = threshold;
        self
    }

    /// Static MCP policy used when no flag or experiment decides.
    pub fn with_mcp(mut self, mcp: McpConfig) -> Self {
        self.mcp = mcp;
        self
    }

    /// Static priority of `provider`.
    pub fn default_priority(&self, provider: &str) -> u32 {
        self.providers
            .iter()
            .chain(&self.experimental_providers)
            .find(|spec| spec.name == provider)
            .map_or(PolicyConfig::UNKNOWN_PROVIDER_PRIORITY, |spec| {
                spec.default_priority
            })
    }
}

impl Default for PolicyConfig {
    fn default() -> PolicyConfig {
        PolicyConfig {
            providers: vec![
                ProviderSpec::new("openai", 1),
                ProviderSpec::new("anthropic", 2),
                ProviderSpec::new("bedrock", 3),
            ],
            experimental_providers: vec![
                ProviderSpec::new("google", 4),
                ProviderSpec::new("mistral", 5),
            ],
            fallback_provider: "openai".to_owned(),
            batching: BatchingConfig::default(),
            cost_threshold: PolicyConfig::DEFAULT_COST_THRESHOLD,
            mcp: McpConfig::default(),
        }
    }
}
