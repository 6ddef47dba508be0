//! Pure evaluation of flags and experiments.
//!
//! Functions here only look at a definition snapshot, the caller context, the current time and
//! the running environment. They never touch the store or mutate a definition, which is what
//! makes an evaluation reproducible on any gateway instance holding the same definition.
use serde::Serialize;

use crate::{
    bucket::{bucket, within_percentage},
    clock::Timestamp,
    models::{CallerContext, Experiment, ExperimentAssignment, FeatureFlag, Variant, TREATMENT},
    EvaluationError,
};

/// Why an evaluation ended the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationReason {
    /// No definition with this name.
    NotFound,
    /// The definition is switched off.
    Disabled,
    /// The caller did not satisfy the targeting rules.
    TargetingMismatch,
    /// The caller's bucket is outside the rollout percentage or traffic allocation.
    OutsideRollout,
    /// The running environment is not allowed by the flag.
    EnvironmentExcluded,
    /// The definition is outside its schedule.
    OutsideSchedule,
    /// Every gate passed.
    Matched,
    /// Evaluation failed and the fail-closed answer was returned.
    Error,
}

/// Outcome of a flag evaluation with the reason behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagEvaluation {
    /// Whether the flag is on for the caller.
    pub enabled: bool,
    /// Gate that decided the outcome.
    pub reason: EvaluationReason,
}

impl FlagEvaluation {
    pub(crate) fn off(reason: EvaluationReason) -> FlagEvaluation {
        FlagEvaluation {
            enabled: false,
            reason,
        }
    }
}

/// Outcome of an experiment assignment with the reason behind it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentEvaluation {
    /// Assignment handed to the caller.
    pub assignment: ExperimentAssignment,
    /// Gate that decided the outcome.
    pub reason: EvaluationReason,
}

impl ExperimentEvaluation {
    pub(crate) fn not_in_experiment(name: &str, reason: EvaluationReason) -> ExperimentEvaluation {
        ExperimentEvaluation {
            assignment: ExperimentAssignment::not_in_experiment(name),
            reason,
        }
    }
}

impl FeatureFlag {
    /// Run the flag gates in order: switch, targeting, rollout, environment, schedule.
    pub fn evaluate(
        &self,
        context: &CallerContext,
        environment: &str,
        now: Timestamp,
    ) -> FlagEvaluation {
        if !self.enabled {
            return FlagEvaluation::off(EvaluationReason::Disabled);
        }

        if let Some(targeting) = &self.targeting {
            if !targeting.matches(context) {
                return FlagEvaluation::off(EvaluationReason::TargetingMismatch);
            }
        }

        if !within_percentage(&self.name, context.identity(), self.rollout_percentage) {
            return FlagEvaluation::off(EvaluationReason::OutsideRollout);
        }

        if !self.environments.is_empty() && !self.environments.iter().any(|e| e == environment)
        {
            return FlagEvaluation::off(EvaluationReason::EnvironmentExcluded);
        }

        if matches!(&self.schedule, Some(schedule) if !schedule.is_active(now)) {
            return FlagEvaluation::off(EvaluationReason::OutsideSchedule);
        }

        FlagEvaluation {
            enabled: true,
            reason: EvaluationReason::Matched,
        }
    }

    /// Pick the variant for `identity`, assuming the flag is on for it.
    ///
    /// Flags without variants return `"treatment"`.
    pub fn variant_for(&self, identity: &str) -> &str {
        select_variant(&self.variants, &variant_seed(&self.name), identity)
            .map_or(TREATMENT, |variant| variant.name.as_str())
    }
}

impl Experiment {
    /// Run the experiment gates in order: switch, targeting, traffic allocation, schedule; then
    /// pick a variant.
    ///
    /// An enabled experiment with a negative or non-finite variant weight, or a non-finite traffic
    /// allocation, is rejected with [`EvaluationError::MalformedDefinition`].
    pub fn evaluate(
        &self,
        context: &CallerContext,
        now: Timestamp,
    ) -> Result<ExperimentEvaluation, EvaluationError> {
        if !self.enabled {
            return Ok(ExperimentEvaluation::not_in_experiment(
                &self.name,
                EvaluationReason::Disabled,
            ));
        }

        if !self.traffic_allocation.is_finite()
            || self
                .variants
                .iter()
                .any(|variant| !variant.weight.is_finite() || variant.weight < 0.0)
        {
            return Err(EvaluationError::MalformedDefinition);
        }

        if let Some(targeting) = &self.targeting {
            if !targeting.matches(context) {
                return Ok(ExperimentEvaluation::not_in_experiment(
                    &self.name,
                    EvaluationReason::TargetingMismatch,
                ));
            }
        }

        let identity = context.identity();
        if !within_percentage(&self.name, identity, self.traffic_allocation) {
            return Ok(ExperimentEvaluation::not_in_experiment(
                &self.name,
                EvaluationReason::OutsideRollout,
            ));
        }

        if matches!(&self.schedule, Some(schedule) if !schedule.is_active(now)) {
            return Ok(ExperimentEvaluation::not_in_experiment(
                &self.name,
                EvaluationReason::OutsideSchedule,
            ));
        }

        let variant = select_variant(&self.variants, &variant_seed(&self.name), identity)
            .ok_or(EvaluationError::NoVariants)?;

        Ok(ExperimentEvaluation {
            assignment: ExperimentAssignment {
                experiment_name: self.name.clone(),
                variant: variant.name.clone(),
                in_experiment: true,
                metadata: self.metadata.clone(),
            },
            reason: EvaluationReason::Matched,
        })
    }
}

fn variant_seed(name: &str) -> String {
    format!("{name}_variant")
}

/// Pick a variant by cumulative weight.
///
/// Walks `variants` in declared order and returns the first one whose running weight total
/// reaches the identity's bucket. When the weights sum to less than the bucket, the last variant
/// is returned. Returns `None` only for an empty list.
pub(crate) fn select_variant<'a>(
    variants: &'a [Variant],
    seed: &str,
    identity: &str,
) -> Option<&'a Variant> {
    let target = f64::from(bucket(seed, identity));
    let mut cumulative = 0.0;
    for variant in variants {
        cumulative += variant.weight;
        if cumulative >= target {
            return Some(variant);
        }
    }
    variants.last()
}
