//! Routing policy adapter.
//!
//! Answers the questions the router, the batcher and the context injector ask on every request
//! by combining flag and experiment evaluations. Every answer follows the same precedence:
//!
//! 1. a named experiment, when the caller is in it and the assigned variant is known,
//! 2. the corresponding flag or flag variant,
//! 3. the static default from [`PolicyConfig`].
//!
//! All methods are total. A missing, broken or unreachable definition simply moves the decision
//! one level down.
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    models::{CallerContext, ExperimentAssignment, Metadata},
    FlagService, PolicyConfig,
};

/// Experiment choosing the routing strategy directly.
pub const ROUTING_STRATEGY_EXPERIMENT: &str = "routing-strategy-experiment";
/// Flag switching from priority-based to smart routing.
pub const INTELLIGENT_ROUTING_FLAG: &str = "intelligent-routing";
/// Flag preferring cost over latency when smart routing is on.
pub const COST_OPTIMIZATION_FLAG: &str = "cost-optimization";
/// Flag adding the experimental providers.
pub const EXPERIMENTAL_PROVIDERS_FLAG: &str = "experimental-providers";
/// Experiment carrying a `providerPriority` map in its metadata.
pub const PROVIDER_PRIORITY_EXPERIMENT: &str = "provider-priority-experiment";
/// Experiment choosing a batching preset.
pub const BATCHING_EXPERIMENT: &str = "batching-experiment";
/// Flag whose variant names a batching preset.
pub const BATCHING_FLAG: &str = "request-batching";
/// Experiment choosing a cost threshold preset.
pub const COST_THRESHOLD_EXPERIMENT: &str = "cost-optimization-experiment";
/// Flag whose variant names a cost threshold preset.
pub const COST_THRESHOLD_FLAG: &str = "cost-threshold";
/// Experiment choosing a context injection preset.
pub const MCP_EXPERIMENT: &str = "mcp-context-experiment";
/// Flag whose variant names a context injection preset.
pub const MCP_FLAG: &str = "mcp-context-injection";

const PROVIDER_PRIORITY_KEY: &str = "providerPriority";

/// Name of the flag enabling `provider`.
pub fn provider_enabled_flag(provider: &str) -> String {
    format!("provider-{provider}-enabled")
}

/// Name of the flag whose variant (`high`, `medium`, `low`) sets the priority of `provider`.
pub fn provider_priority_flag(provider: &str) -> String {
    format!("provider-{provider}-priority")
}

/// How the router picks a provider for a request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display,
)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    /// Cheapest provider first.
    #[display("cost-optimized")]
    CostOptimized,
    /// Fastest provider first.
    #[display("latency-optimized")]
    LatencyOptimized,
    /// Rotate over enabled providers.
    #[display("round-robin")]
    RoundRobin,
    /// Lowest priority number first.
    #[display("priority-based")]
    PriorityBased,
}

impl RoutingStrategy {
    /// Parse an experiment variant name.
    pub fn from_variant(variant: &str) -> Option<RoutingStrategy> {
        match variant {
            "cost-optimized" => Some(RoutingStrategy::CostOptimized),
            "latency-optimized" => Some(RoutingStrategy::LatencyOptimized),
            "round-robin" => Some(RoutingStrategy::RoundRobin),
            "priority-based" => Some(RoutingStrategy::PriorityBased),
            _ => None,
        }
    }
}

/// Request batching parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchingConfig {
    /// Whether requests are batched at all.
    pub enabled: bool,
    /// Requests per batch, at least one.
    pub max_batch_size: u32,
    /// How long a partial batch waits for more requests.
    pub batch_timeout: Duration,
    /// Collapse identical requests within a batch.
    pub deduplication: bool,
}

impl BatchingConfig {
    fn from_variant(variant: &str) -> Option<BatchingConfig> {
        match variant {
            "large-batches" => Some(BatchingConfig {
                enabled: true,
                max_batch_size: 10,
                batch_timeout: Duration::from_millis(200),
                deduplication: true,
            }),
            "small-batches" => Some(BatchingConfig {
                enabled: true,
                max_batch_size: 3,
                batch_timeout: Duration::from_millis(50),
                deduplication: true,
            }),
            "no-batching" => Some(BatchingConfig {
                enabled: false,
                max_batch_size: 1,
                batch_timeout: Duration::ZERO,
                deduplication: false,
            }),
            _ => None,
        }
    }

    fn with_overrides(mut self, metadata: &Metadata) -> BatchingConfig {
        if let Some(size) = metadata_u32(metadata, "maxBatchSize") {
            self.max_batch_size = size.max(1);
        }
        if let Some(timeout) = metadata.get("batchTimeoutMs").and_then(|v| v.as_u64()) {
            self.batch_timeout = Duration::from_millis(timeout);
        }
        if let Some(deduplication) = metadata.get("deduplication").and_then(|v| v.as_bool()) {
            self.deduplication = deduplication;
        }
        self
    }
}

impl Default for BatchingConfig {
    fn default() -> BatchingConfig {
        BatchingConfig {
            enabled: true,
            max_batch_size: 5,
            batch_timeout: Duration::from_millis(100),
            deduplication: true,
        }
    }
}

/// Context injection (MCP) parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpConfig {
    /// Whether MCP context is injected into requests.
    pub context_injection: bool,
    /// Upper bound on injected context items.
    pub max_context_items: u32,
    /// Whether product search tools are exposed.
    pub product_search: bool,
}

impl McpConfig {
    fn from_variant(variant: &str) -> Option<McpConfig> {
        match variant {
            "full" => Some(McpConfig {
                context_injection: true,
                max_context_items: 10,
                product_search: true,
            }),
            "minimal" => Some(McpConfig {
                context_injection: true,
                max_context_items: 3,
                product_search: false,
            }),
            "disabled" => Some(McpConfig {
                context_injection: false,
                max_context_items: 0,
                product_search: false,
            }),
            _ => None,
        }
    }

    fn with_overrides(mut self, metadata: &Metadata) -> McpConfig {
        if let Some(items) = metadata_u32(metadata, "maxContextItems") {
            self.max_context_items = items;
        }
        self
    }
}

impl Default for McpConfig {
    fn default() -> McpConfig {
        McpConfig {
            context_injection: true,
            max_context_items: 5,
            product_search: true,
        }
    }
}

fn cost_threshold_from_variant(variant: &str) -> Option<f64> {
    match variant {
        "aggressive" => Some(0.3),
        "balanced" => Some(0.5),
        "conservative" => Some(0.8),
        _ => None,
    }
}

fn priority_from_variant(variant: &str) -> Option<u32> {
    match variant {
        "high" => Some(1),
        "medium" => Some(2),
        "low" => Some(3),
        _ => None,
    }
}

fn metadata_u32(metadata: &Metadata, key: &str) -> Option<u32> {
    metadata
        .get(key)
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok())
}

/// Every policy for one caller, resolved in one call.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicySnapshot {
    /// Routing strategy for the caller.
    pub routing_strategy: RoutingStrategy,
    /// Never empty.
    pub enabled_providers: Vec<String>,
    /// Priority of each enabled provider.
    pub provider_priorities: BTreeMap<String, u32>,
    /// Batching policy for the caller.
    pub batching: BatchingConfig,
    /// Cost threshold for the caller.
    pub cost_threshold: f64,
    /// MCP policy for the caller.
    pub mcp: McpConfig,
}

/// Policy adapter over a shared [`FlagService`].
///
/// # Examples
/// ```
/// # use std::sync::Arc;
/// # use gateway_flags::{CallerContext, InMemoryConfigStore, PolicyConfig, RoutingPolicy,
/// #     RoutingStrategy, ServiceConfig};
/// let service = Arc::new(ServiceConfig::new().to_service(Arc::new(InMemoryConfigStore::new())));
/// let policy = RoutingPolicy::new(service, PolicyConfig::new());
///
/// let context = CallerContext::new("user-1");
/// assert_eq!(policy.routing_strategy(&context), RoutingStrategy::PriorityBased);
/// assert_eq!(policy.enabled_providers(&context), vec!["openai".to_owned()]);
/// ```
pub struct RoutingPolicy {
    service: Arc<FlagService>,
    config: PolicyConfig,
}

impl RoutingPolicy {
    /// Build a policy adapter over `service`.
    pub fn new(service: Arc<FlagService>, config: PolicyConfig) -> RoutingPolicy {
        RoutingPolicy { service, config }
    }

    /// Static defaults and provider catalog.
    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Assignment to `experiment_name`, only if the caller is in it.
    fn assignment(
        &self,
        experiment_name: &str,
        context: &CallerContext,
    ) -> Option<ExperimentAssignment> {
        Some(self.service.get_experiment_assignment(experiment_name, context))
            .filter(|assignment| assignment.in_experiment)
    }

    /// Routing strategy for the caller.
    pub fn routing_strategy(&self, context: &CallerContext) -> RoutingStrategy {
        if let Some(strategy) = self
            .assignment(ROUTING_STRATEGY_EXPERIMENT, context)
            .and_then(|assignment| RoutingStrategy::from_variant(&assignment.variant))
        {
            log::trace!(target: "gateway_flags", strategy:display = strategy; "routing strategy from experiment");
            return strategy;
        }

        if self.service.is_enabled(INTELLIGENT_ROUTING_FLAG, context) {
            if self.service.is_enabled(COST_OPTIMIZATION_FLAG, context) {
                RoutingStrategy::CostOptimized
            } else {
                RoutingStrategy::LatencyOptimized
            }
        } else {
            RoutingStrategy::PriorityBased
        }
    }

    /// Providers the router may use, in catalog order. Never empty.
    pub fn enabled_providers(&self, context: &CallerContext) -> Vec<String> {
        let mut providers: Vec<String> = self
            .config
            .providers
            .iter()
            .filter(|spec| {
                self.service
                    .is_enabled(&provider_enabled_flag(&spec.name), context)
            })
            .map(|spec| spec.name.clone())
            .collect();

        if self.service.is_enabled(EXPERIMENTAL_PROVIDERS_FLAG, context) {
            providers.extend(
                self.config
                    .experimental_providers
                    .iter()
                    .map(|spec| spec.name.clone()),
            );
        }

        if providers.is_empty() {
            log::debug!(target: "gateway_flags",
                        fallback:display = self.config.fallback_provider;
                        "no provider enabled, using fallback provider");
            providers.push(self.config.fallback_provider.clone());
        }
        providers
    }

    /// Priority of `provider`, lower is preferred.
    pub fn provider_priority(&self, provider: &str, context: &CallerContext) -> u32 {
        if let Some(priority) = self
            .assignment(PROVIDER_PRIORITY_EXPERIMENT, context)
            .and_then(|assignment| {
                assignment
                    .metadata
                    .get(PROVIDER_PRIORITY_KEY)
                    .and_then(|priorities| priorities.get(provider))
                    .and_then(|v| v.as_u64())
                    .and_then(|v| u32::try_from(v).ok())
            })
        {
            return priority;
        }

        let variant = self
            .service
            .get_variant(&provider_priority_flag(provider), context);
        priority_from_variant(&variant).unwrap_or_else(|| self.config.default_priority(provider))
    }

    /// Batching policy for the caller.
    pub fn batching_config(&self, context: &CallerContext) -> BatchingConfig {
        let experiment = self
            .assignment(BATCHING_EXPERIMENT, context)
            .and_then(|assignment| {
                BatchingConfig::from_variant(&assignment.variant)
                    .map(|preset| preset.with_overrides(&assignment.metadata))
            });
        if let Some(batching) = experiment {
            return batching;
        }

        BatchingConfig::from_variant(&self.service.get_variant(BATCHING_FLAG, context))
            .unwrap_or_else(|| self.config.batching.clone())
    }

    /// Share of requests cost optimization may apply to, within `0..=1`.
    pub fn cost_optimization_threshold(&self, context: &CallerContext) -> f64 {
        let experiment = self
            .assignment(COST_THRESHOLD_EXPERIMENT, context)
            .and_then(|assignment| {
                let preset = cost_threshold_from_variant(&assignment.variant)?;
                Some(
                    assignment
                        .metadata
                        .get("threshold")
                        .and_then(|v| v.as_f64())
                        .filter(|t| (0.0..=1.0).contains(t))
                        .unwrap_or(preset),
                )
            });
        if let Some(threshold) = experiment {
            return threshold;
        }

        cost_threshold_from_variant(&self.service.get_variant(COST_THRESHOLD_FLAG, context))
            .unwrap_or(self.config.cost_threshold)
    }

    /// MCP policy for the caller.
    pub fn mcp_config(&self, context: &CallerContext) -> McpConfig {
        let experiment = self.assignment(MCP_EXPERIMENT, context).and_then(|assignment| {
            McpConfig::from_variant(&assignment.variant)
                .map(|preset| preset.with_overrides(&assignment.metadata))
        });
        if let Some(mcp) = experiment {
            return mcp;
        }

        McpConfig::from_variant(&self.service.get_variant(MCP_FLAG, context))
            .unwrap_or_else(|| self.config.mcp.clone())
    }

    /// Resolve every policy for `context`.
    pub fn resolve(&self, context: &CallerContext) -> PolicySnapshot {
        let enabled_providers = self.enabled_providers(context);
        let provider_priorities = enabled_providers
            .iter()
            .map(|provider| (provider.clone(), self.provider_priority(provider, context)))
            .collect();
        PolicySnapshot {
            routing_strategy: self.routing_strategy(context),
            enabled_providers,
            provider_priorities,
            batching: self.batching_config(context),
            cost_threshold: self.cost_optimization_threshold(context),
            mcp: self.mcp_config(context),
        }
    }
}
