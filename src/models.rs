//! Flag and experiment definitions as stored in the config store, plus the caller context they
//! are evaluated against.
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{clock::Timestamp, Error, Result};

/// Free-form metadata attached to definitions.
pub type Metadata = HashMap<String, serde_json::Value>;

/// A feature flag definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    /// Unique key of the flag.
    pub name: String,
    /// Master switch. A disabled flag is off for everybody.
    pub enabled: bool,
    /// Free-form text for operators.
    #[serde(default)]
    pub description: String,
    /// Share of eligible identities the flag is on for, in `[0, 100]`.
    #[serde(default = "full_rollout")]
    pub rollout_percentage: f64,
    /// Rules a caller must satisfy before rollout is considered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targeting: Option<Targeting>,
    /// Ordered variants. Order matters for variant selection.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variants: Vec<Variant>,
    /// Environments the flag may be on in. Empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environments: Vec<String>,
    /// Time window outside of which the flag is off.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    /// Opaque key-values for consumers of the flag.
    #[serde(default)]
    pub metadata: Metadata,
    /// When the flag was first created.
    pub created_at: Timestamp,
    /// When the flag was last written.
    pub updated_at: Timestamp,
}

fn full_rollout() -> f64 {
    100.0
}

/// An experiment definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    /// Unique key of the experiment.
    pub name: String,
    /// Master switch. A disabled experiment assigns nobody.
    pub enabled: bool,
    /// Free-form text for operators.
    #[serde(default)]
    pub description: String,
    /// Share of identities considered for the experiment at all, in `[0, 100]`.
    #[serde(default = "full_rollout")]
    pub traffic_allocation: f64,
    /// Ordered variants. Never empty for experiments written through the service.
    pub variants: Vec<Variant>,
    /// Rules a caller must satisfy to enter the experiment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targeting: Option<Targeting>,
    /// Time window outside of which nobody is assigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    /// Handed to callers together with their assignment.
    #[serde(default)]
    pub metadata: Metadata,
    /// When the experiment was first created.
    pub created_at: Timestamp,
    /// When the experiment was last written.
    pub updated_at: Timestamp,
}

/// Rules restricting who is eligible for a flag or experiment.
///
/// All configured rule kinds must match. Within `attributes` every key must match; within
/// `segments` one shared segment is enough.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Targeting {
    /// Explicit allow-list of identities.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_ids: Vec<String>,
    /// Attribute name to the set of allowed values.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, Vec<String>>,
    /// Segments, of which the caller must be in at least one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<String>,
}

impl Targeting {
    /// Return `true` if no rule is configured.
    pub fn is_empty(&self) -> bool {
        self.user_ids.is_empty() && self.attributes.is_empty() && self.segments.is_empty()
    }
}

/// A weighted variant of a flag or an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    /// Variant name returned to callers.
    pub name: String,
    /// Relative weight. Weights of a definition need not sum to 100.
    pub weight: f64,
    /// Optional value handed out with the variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Variant {
    /// Create a variant without payload.
    pub fn new(name: impl Into<String>, weight: f64) -> Variant {
        Variant {
            name: name.into(),
            weight,
            payload: None,
        }
    }
}

/// Time window outside of which a definition is inactive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    /// Inclusive start, open-ended when absent.
    #[serde(default)]
    pub start_date: Option<Timestamp>,
    /// Inclusive end, open-ended when absent.
    #[serde(default)]
    pub end_date: Option<Timestamp>,
}

impl Schedule {
    /// Return `true` if `now` is inside the window. Both ends are inclusive.
    pub fn is_active(&self, now: Timestamp) -> bool {
        let forbidden = matches!(self.start_date, Some(t) if now < t)
            || matches!(self.end_date, Some(t) if now > t);
        !forbidden
    }
}

/// Who is asking. Built by the request handler for every inbound request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerContext {
    /// Stable identity used for bucketing. Absent identities bucket as [`ANONYMOUS`].
    #[serde(default)]
    pub identity: Option<String>,
    /// Every attribute listed here must match exactly.
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    /// At least one of these segments must match.
    #[serde(default)]
    pub segments: Vec<String>,
}

/// Identity used when the caller did not provide one.
pub const ANONYMOUS: &str = "anonymous";

impl CallerContext {
    /// Context for a known identity, without attributes or segments.
    pub fn new(identity: impl Into<String>) -> CallerContext {
        CallerContext {
            identity: Some(identity.into()),
            ..CallerContext::default()
        }
    }

    /// Context without identity.
    pub fn anonymous() -> CallerContext {
        CallerContext::default()
    }

    /// Add an attribute for targeting.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Add a segment for targeting.
    pub fn with_segment(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(segment.into());
        self
    }

    /// Identity to bucket on.
    pub fn identity(&self) -> &str {
        self.identity.as_deref().unwrap_or(ANONYMOUS)
    }
}

/// Result of assigning a caller to an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentAssignment {
    /// Name of the experiment the assignment is for.
    pub experiment_name: String,
    /// Assigned variant, `"control"` when not in the experiment.
    pub variant: String,
    /// Whether the caller passed every gate.
    pub in_experiment: bool,
    /// Experiment metadata, only carried when assigned.
    #[serde(default)]
    pub metadata: Metadata,
}

/// Variant name returned whenever a caller is not in a flag or experiment.
pub const CONTROL: &str = "control";

/// Variant name returned for enabled flags that declare no variants.
pub const TREATMENT: &str = "treatment";

impl ExperimentAssignment {
    /// The fail-closed assignment.
    pub fn not_in_experiment(experiment_name: impl Into<String>) -> ExperimentAssignment {
        ExperimentAssignment {
            experiment_name: experiment_name.into(),
            variant: CONTROL.to_owned(),
            in_experiment: false,
            metadata: Metadata::new(),
        }
    }
}

/// Request to create (or replace) a flag.
///
/// ```
/// # use gateway_flags::CreateFlagRequest;
/// let request = CreateFlagRequest {
///     rollout_percentage: 25.0,
///     ..CreateFlagRequest::new("new-checkout")
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFlagRequest {
    /// Unique key of the flag. Must be non-empty and free of `/`.
    pub name: String,
    /// Master switch, on by default.
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Free-form text for operators.
    #[serde(default)]
    pub description: String,
    /// Share of eligible identities, in `[0, 100]`.
    #[serde(default = "full_rollout")]
    pub rollout_percentage: f64,
    /// Rules a caller must satisfy.
    #[serde(default)]
    pub targeting: Option<Targeting>,
    /// Ordered weighted variants.
    #[serde(default)]
    pub variants: Vec<Variant>,
    /// Environments the flag is on in, all when empty.
    #[serde(default)]
    pub environments: Vec<String>,
    /// Time window the flag is on in.
    #[serde(default)]
    pub schedule: Option<Schedule>,
    /// Opaque key-values for consumers.
    #[serde(default)]
    pub metadata: Metadata,
}

fn enabled_by_default() -> bool {
    true
}

impl CreateFlagRequest {
    /// An enabled flag at full rollout with no rules.
    pub fn new(name: impl Into<String>) -> CreateFlagRequest {
        CreateFlagRequest {
            name: name.into(),
            enabled: true,
            description: String::new(),
            rollout_percentage: 100.0,
            targeting: None,
            variants: Vec::new(),
            environments: Vec::new(),
            schedule: None,
            metadata: Metadata::new(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        validate_percentage("rolloutPercentage", self.rollout_percentage)?;
        validate_variants(&self.variants)?;
        validate_schedule(self.schedule.as_ref())
    }

    pub(crate) fn into_flag(self, created_at: Timestamp, now: Timestamp) -> FeatureFlag {
        FeatureFlag {
            name: self.name,
            enabled: self.enabled,
            description: self.description,
            rollout_percentage: self.rollout_percentage,
            targeting: self.targeting,
            variants: self.variants,
            environments: self.environments,
            schedule: self.schedule,
            metadata: self.metadata,
            created_at,
            updated_at: now,
        }
    }
}

/// Partial update of an existing flag. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFlagRequest {
    /// New master switch.
    pub enabled: Option<bool>,
    /// New description.
    pub description: Option<String>,
    /// New rollout, in `[0, 100]`.
    pub rollout_percentage: Option<f64>,
    /// Replacement targeting rules.
    pub targeting: Option<Targeting>,
    /// Replacement variants.
    pub variants: Option<Vec<Variant>>,
    /// Replacement environment list.
    pub environments: Option<Vec<String>>,
    /// Replacement schedule.
    pub schedule: Option<Schedule>,
    /// Replacement metadata.
    pub metadata: Option<Metadata>,
}

impl UpdateFlagRequest {
    /// Produce the updated copy of `flag`. The stored snapshot is never touched.
    pub(crate) fn apply(self, flag: &FeatureFlag, now: Timestamp) -> Result<FeatureFlag> {
        let mut updated = flag.clone();
        if let Some(enabled) = self.enabled {
            updated.enabled = enabled;
        }
        if let Some(description) = self.description {
            updated.description = description;
        }
        if let Some(rollout_percentage) = self.rollout_percentage {
            validate_percentage("rolloutPercentage", rollout_percentage)?;
            updated.rollout_percentage = rollout_percentage;
        }
        if let Some(targeting) = self.targeting {
            updated.targeting = Some(targeting);
        }
        if let Some(variants) = self.variants {
            validate_variants(&variants)?;
            updated.variants = variants;
        }
        if let Some(environments) = self.environments {
            updated.environments = environments;
        }
        if let Some(schedule) = self.schedule {
            validate_schedule(Some(&schedule))?;
            updated.schedule = Some(schedule);
        }
        if let Some(metadata) = self.metadata {
            updated.metadata = metadata;
        }
        updated.updated_at = now;
        Ok(updated)
    }
}

/// Request to create (or replace) an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateExperimentRequest {
    /// Unique key of the experiment. Must be non-empty and free of `/`.
    pub name: String,
    /// Master switch, on by default.
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Free-form text for operators.
    #[serde(default)]
    pub description: String,
    /// Share of identities considered, in `[0, 100]`.
    #[serde(default = "full_rollout")]
    pub traffic_allocation: f64,
    /// Ordered weighted variants, at least one.
    pub variants: Vec<Variant>,
    /// Rules a caller must satisfy.
    #[serde(default)]
    pub targeting: Option<Targeting>,
    /// Time window the experiment runs in.
    #[serde(default)]
    pub schedule: Option<Schedule>,
    /// Handed to assigned callers.
    #[serde(default)]
    pub metadata: Metadata,
}

impl CreateExperimentRequest {
    /// An enabled experiment with full traffic allocation over `variants`.
    pub fn new(name: impl Into<String>, variants: Vec<Variant>) -> CreateExperimentRequest {
        CreateExperimentRequest {
            name: name.into(),
            enabled: true,
            description: String::new(),
            traffic_allocation: 100.0,
            variants,
            targeting: None,
            schedule: None,
            metadata: Metadata::new(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        validate_percentage("trafficAllocation", self.traffic_allocation)?;
        validate_experiment_variants(&self.variants)?;
        validate_schedule(self.schedule.as_ref())
    }

    pub(crate) fn into_experiment(self, created_at: Timestamp, now: Timestamp) -> Experiment {
        Experiment {
            name: self.name,
            enabled: self.enabled,
            description: self.description,
            traffic_allocation: self.traffic_allocation,
            variants: self.variants,
            targeting: self.targeting,
            schedule: self.schedule,
            metadata: self.metadata,
            created_at,
            updated_at: now,
        }
    }
}

/// Partial update of an existing experiment. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateExperimentRequest {
    /// New master switch.
    pub enabled: Option<bool>,
    /// New description.
    pub description: Option<String>,
    /// New traffic allocation, in `[0, 100]`.
    pub traffic_allocation: Option<f64>,
    /// Replacement variants, at least one.
    pub variants: Option<Vec<Variant>>,
    /// Replacement targeting rules.
    pub targeting: Option<Targeting>,
    /// Replacement schedule.
    pub schedule: Option<Schedule>,
    /// Replacement metadata.
    pub metadata: Option<Metadata>,
}

impl UpdateExperimentRequest {
    pub(crate) fn apply(self, experiment: &Experiment, now: Timestamp) -> Result<Experiment> {
        let mut updated = experiment.clone();
        if let Some(enabled) = self.enabled {
            updated.enabled = enabled;
        }
        if let Some(description) = self.description {
            updated.description = description;
        }
        if let Some(traffic_allocation) = self.traffic_allocation {
            validate_percentage("trafficAllocation", traffic_allocation)?;
            updated.traffic_allocation = traffic_allocation;
        }
        if let Some(variants) = self.variants {
            validate_experiment_variants(&variants)?;
            updated.variants = variants;
        }
        if let Some(targeting) = self.targeting {
            updated.targeting = Some(targeting);
        }
        if let Some(schedule) = self.schedule {
            validate_schedule(Some(&schedule))?;
            updated.schedule = Some(schedule);
        }
        if let Some(metadata) = self.metadata {
            updated.metadata = metadata;
        }
        updated.updated_at = now;
        Ok(updated)
    }
}

/// Aggregate counters over all stored definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    /// Number of stored flags.
    pub total_flags: usize,
    /// Flags with the master switch on.
    pub enabled_flags: usize,
    /// Number of stored experiments.
    pub total_experiments: usize,
    /// Enabled experiments whose schedule is currently open.
    pub active_experiments: usize,
    /// Flags carrying targeting rules.
    pub flags_with_targeting: usize,
    /// Flags with at least one variant.
    pub flags_with_variants: usize,
    /// Mean rollout over all flags, `0` when there are none.
    pub average_rollout_percentage: f64,
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Validation("name must not be empty".to_owned()));
    }
    if name.contains('/') {
        return Err(Error::Validation(format!(
            "name {name:?} must not contain '/'"
        )));
    }
    Ok(())
}

fn validate_percentage(field: &str, value: f64) -> Result<()> {
    if !value.is_finite() || !(0.0..=100.0).contains(&value) {
        return Err(Error::Validation(format!(
            "{field} must be within [0, 100], got {value}"
        )));
    }
    Ok(())
}

fn validate_variants(variants: &[Variant]) -> Result<()> {
    let mut seen = HashSet::new();
    for variant in variants {
        if variant.name.trim().is_empty() {
            return Err(Error::Validation("variant name must not be empty".to_owned()));
        }
        if !variant.weight.is_finite() || variant.weight < 0.0 {
            return Err(Error::Validation(format!(
                "variant {:?} has invalid weight {}",
                variant.name, variant.weight
            )));
        }
        if !seen.insert(variant.name.as_str()) {
            return Err(Error::Validation(format!(
                "duplicate variant {:?}",
                variant.name
            )));
        }
    }
    Ok(())
}

fn validate_experiment_variants(variants: &[Variant]) -> Result<()> {
    if variants.is_empty() {
        return Err(Error::Validation(
            "experiment requires at least one variant".to_owned(),
        ));
    }
    validate_variants(variants)
}

fn validate_schedule(schedule: Option<&Schedule>) -> Result<()> {
    if let Some(Schedule {
        start_date: Some(start),
        end_date: Some(end),
    }) = schedule
    {
        if start > end {
            return Err(Error::Validation(
                "schedule starts after it ends".to_owned(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;

    #[test]
    fn parse_flag_with_defaults() {
        let flag: FeatureFlag = serde_json::from_str(
            r#"
              {
                "name": "intelligent-routing",
                "enabled": true,
                "createdAt": "2024-01-01T00:00:00Z",
                "updatedAt": "2024-01-02T00:00:00Z"
              }
            "#,
        )
        .unwrap();
        assert_eq!(flag.rollout_percentage, 100.0);
        assert!(flag.targeting.is_none());
        assert!(flag.variants.is_empty());
        assert!(flag.environments.is_empty());
    }

    #[test]
    fn parse_full_experiment() {
        let experiment: Experiment = serde_json::from_str(
            r#"
              {
                "name": "routing-strategy-experiment",
                "enabled": true,
                "trafficAllocation": 20,
                "variants": [
                  {"name": "cost-optimized", "weight": 50},
                  {"name": "latency-optimized", "weight": 50, "payload": {"p95": 800}}
                ],
                "targeting": {"attributes": {"tier": ["pro", "enterprise"]}},
                "schedule": {"startDate": "2024-01-01T00:00:00Z"},
                "metadata": {"owner": "routing"},
                "createdAt": "2024-01-01T00:00:00Z",
                "updatedAt": "2024-01-01T00:00:00Z"
              }
            "#,
        )
        .unwrap();
        assert_eq!(experiment.traffic_allocation, 20.0);
        assert_eq!(experiment.variants.len(), 2);
        assert!(experiment.variants[1].payload.is_some());
        assert_eq!(
            experiment.targeting.unwrap().attributes["tier"],
            vec!["pro", "enterprise"]
        );
        assert!(experiment.schedule.unwrap().end_date.is_none());
    }

    #[test]
    fn anonymous_identity() {
        assert_eq!(CallerContext::anonymous().identity(), ANONYMOUS);
        assert_eq!(CallerContext::new("u1").identity(), "u1");
    }

    #[test]
    fn schedule_window_is_inclusive() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = start + Duration::days(1);
        let schedule = Schedule {
            start_date: Some(start),
            end_date: Some(end),
        };
        assert!(!schedule.is_active(start - Duration::seconds(1)));
        assert!(schedule.is_active(start));
        assert!(schedule.is_active(end));
        assert!(!schedule.is_active(end + Duration::seconds(1)));
        assert!(Schedule::default().is_active(start));
    }

    #[test]
    fn rejects_invalid_flags() {
        assert!(CreateFlagRequest::new("").validate().is_err());
        assert!(CreateFlagRequest::new("a/b").validate().is_err());
        assert!(CreateFlagRequest {
            rollout_percentage: 101.0,
            ..CreateFlagRequest::new("x")
        }
        .validate()
        .is_err());
        assert!(CreateFlagRequest {
            variants: vec![Variant::new("a", -1.0)],
            ..CreateFlagRequest::new("x")
        }
        .validate()
        .is_err());
        assert!(CreateFlagRequest {
            variants: vec![Variant::new("a", 1.0), Variant::new("a", 2.0)],
            ..CreateFlagRequest::new("x")
        }
        .validate()
        .is_err());
        assert!(CreateFlagRequest::new("x").validate().is_ok());
    }

    #[test]
    fn rejects_experiment_without_variants() {
        let err = CreateExperimentRequest::new("exp", vec![])
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn rejects_inverted_schedule() {
        let now = Utc::now();
        let request = CreateExperimentRequest {
            schedule: Some(Schedule {
                start_date: Some(now),
                end_date: Some(now - Duration::hours(1)),
            }),
            ..CreateExperimentRequest::new("exp", vec![Variant::new("a", 1.0)])
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn update_leaves_source_untouched() {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let later = created + Duration::hours(1);
        let flag = CreateFlagRequest::new("x").into_flag(created, created);

        let updated = UpdateFlagRequest {
            enabled: Some(false),
            rollout_percentage: Some(10.0),
            ..UpdateFlagRequest::default()
        }
        .apply(&flag, later)
        .unwrap();

        assert!(flag.enabled);
        assert!(!updated.enabled);
        assert_eq!(updated.rollout_percentage, 10.0);
        assert_eq!(updated.created_at, created);
        assert_eq!(updated.updated_at, later);
    }

    #[test]
    fn update_validates_new_values() {
        let now = Utc::now();
        let experiment = CreateExperimentRequest::new("exp", vec![Variant::new("a", 1.0)])
            .into_experiment(now, now);
        let result = UpdateExperimentRequest {
            variants: Some(vec![]),
            ..UpdateExperimentRequest::default()
        }
        .apply(&experiment, now);
        assert!(result.is_err());
    }
}
