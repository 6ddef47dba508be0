//! Feature flag and experimentation engine for an AI provider gateway.
//!
//! # Overview
//!
//! The crate revolves around a [`FlagService`] that evaluates feature flags and experiments for
//! callers, where each caller is described by a [`CallerContext`]: an optional identity plus
//! attributes and segments. Flag evaluation is a series of gates (enabled, targeting, rollout,
//! environment, schedule). Rollouts, traffic allocation and variant splits use a deterministic
//! [`bucket()`], so the same identity always lands on the same answer for an unchanged definition.
//!
//! Definitions live in a [`ConfigStore`] under `feature-flags/{name}` and `experiments/{name}`.
//! The service reads them through a bounded, TTL-expiring cache, so steady-state evaluation does
//! no I/O. A [`RefreshThread`] keeps the cache converging with the store when other instances
//! write to it.
//!
//! On top of the service, [`RoutingPolicy`] answers the gateway's routing, batching, cost and
//! context injection questions with a fixed precedence: experiment, then flag, then static
//! default from [`PolicyConfig`].
//!
//! # Error Handling
//!
//! Evaluation never fails. A missing, corrupt or unreachable definition evaluates to the
//! fail-closed answer: `false`, `"control"`, or not in the experiment. Use
//! [`FlagService::evaluate_flag`] to find out why a flag is off.
//!
//! Administrative writes return [`Error`], because a silently lost configuration change is
//! unacceptable.
//!
//! # Logging
//!
//! The crate uses the [`log`](https://docs.rs/log/latest/log/) crate with structured key-values
//! under the `gateway_flags` target. Consider integrating a `log`-compatible logger
//! implementation for better visibility into evaluation and refresh.
//!
//! # Examples
//!
//! ```
//! # use std::sync::Arc;
//! # use gateway_flags::{CallerContext, CreateFlagRequest, InMemoryConfigStore, ServiceConfig};
//! let service = ServiceConfig::new()
//!     .with_environment("production")
//!     .to_service(Arc::new(InMemoryConfigStore::new()));
//!
//! service
//!     .create_flag(CreateFlagRequest {
//!         rollout_percentage: 100.0,
//!         ..CreateFlagRequest::new("intelligent-routing")
//!     })
//!     .unwrap();
//!
//! assert!(service.is_enabled("intelligent-routing", &CallerContext::new("user-1")));
//! ```
//!
//! A runnable gateway demo lives in `demos/gateway`.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod bucket;
mod cache;
mod clock;
mod config;
mod error;
mod eval;
mod models;
mod policy;
mod refresher;
mod service;
mod store;
mod targeting;

pub use bucket::{bucket, within_percentage, BUCKETS};
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::{PolicyConfig, ProviderSpec, ServiceConfig};
pub use error::{Error, EvaluationError, Result};
pub use eval::{EvaluationReason, ExperimentEvaluation, FlagEvaluation};
pub use models::{
    CallerContext, CreateExperimentRequest, CreateFlagRequest, Experiment, ExperimentAssignment,
    FeatureFlag, Metadata, Schedule, Statistics, Targeting, UpdateExperimentRequest,
    UpdateFlagRequest, Variant, ANONYMOUS, CONTROL, TREATMENT,
};
pub use policy::{
    provider_enabled_flag, provider_priority_flag, BatchingConfig, McpConfig, PolicySnapshot,
    RoutingPolicy, RoutingStrategy, BATCHING_EXPERIMENT, BATCHING_FLAG, COST_OPTIMIZATION_FLAG,
    COST_THRESHOLD_EXPERIMENT, COST_THRESHOLD_FLAG, EXPERIMENTAL_PROVIDERS_FLAG,
    INTELLIGENT_ROUTING_FLAG, MCP_EXPERIMENT, MCP_FLAG, PROVIDER_PRIORITY_EXPERIMENT,
    ROUTING_STRATEGY_EXPERIMENT,
};
pub use refresher::{RefreshThread, RefreshThreadConfig};
pub use service::FlagService;
pub use store::{ConfigStore, InMemoryConfigStore, SetOptions, StoreError};
