use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use crate::{
    cache::DefinitionCache,
    eval::{EvaluationReason, ExperimentEvaluation, FlagEvaluation},
    models::{
        CallerContext, CreateExperimentRequest, CreateFlagRequest, Experiment,
        ExperimentAssignment, FeatureFlag, Statistics, UpdateExperimentRequest,
        UpdateFlagRequest, CONTROL,
    },
    refresher::{RefreshTarget, RefreshThread, RefreshThreadConfig},
    store::{ConfigStore, SetOptions},
    Error, Result, ServiceConfig,
};

/// The flag and experiment service.
///
/// Construct one per process with [`ServiceConfig::to_service`] and share it (e.g. behind an
/// `Arc`) with every request handler. Evaluation methods take `&self`, are safe to call from
/// many threads at once and never fail: when a definition is missing, broken or unreachable they
/// return the fail-closed answer (`false`, `"control"`, not in experiment).
///
/// Administrative methods (`create_*`, `update_*`, `delete_*`) write to the config store first
/// and only then replace the cached entry, so a failed write leaves the cache untouched and the
/// error is returned to the writer.
///
/// # Examples
/// ```
/// # use std::sync::Arc;
/// # use gateway_flags::{CallerContext, CreateFlagRequest, InMemoryConfigStore, ServiceConfig};
/// let service = ServiceConfig::new().to_service(Arc::new(InMemoryConfigStore::new()));
/// service.create_flag(CreateFlagRequest::new("intelligent-routing")).unwrap();
///
/// assert!(service.is_enabled("intelligent-routing", &CallerContext::new("user-1")));
/// assert!(!service.is_enabled("no-such-flag", &CallerContext::new("user-1")));
/// ```
pub struct FlagService {
    config: ServiceConfig,
    store: Arc<dyn ConfigStore>,
    flags: Arc<DefinitionCache<FeatureFlag>>,
    experiments: Arc<DefinitionCache<Experiment>>,
}

impl FlagService {
    /// Create a new `FlagService` reading definitions from `store`.
    ///
    /// The caches start empty. Call [`FlagService::load_all`] to warm them and
    /// [`FlagService::start_refresh_thread`] to keep them converging with the store.
    pub fn new(config: ServiceConfig, store: Arc<dyn ConfigStore>) -> FlagService {
        let flags = Arc::new(DefinitionCache::new(
            Arc::clone(&store),
            &config.flag_prefix,
            &config,
        ));
        let experiments = Arc::new(DefinitionCache::new(
            Arc::clone(&store),
            &config.experiment_prefix,
            &config,
        ));
        FlagService {
            config,
            store,
            flags,
            experiments,
        }
    }

    /// Configuration the service was built with.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Load every flag and experiment from the store into the caches.
    ///
    /// Failures are logged and otherwise ignored: the caches then start colder and fill lazily.
    /// Returns the number of definitions loaded.
    pub fn load_all(&self) -> usize {
        self.refresh_target().refresh().loaded
    }

    /// Start a thread that reloads all definitions every
    /// [refresh interval](ServiceConfig::with_refresh_interval).
    pub fn start_refresh_thread(&self) -> Result<RefreshThread> {
        let config = RefreshThreadConfig::new()
            .with_interval(self.config.refresh_interval)
            .with_jitter(self.config.refresh_jitter);
        Ok(RefreshThread::start(self.refresh_target(), config)?)
    }

    fn refresh_target(&self) -> RefreshTarget {
        RefreshTarget {
            flags: Arc::clone(&self.flags),
            experiments: Arc::clone(&self.experiments),
        }
    }

    /// Evaluate a flag and report why it is on or off.
    pub fn evaluate_flag(&self, flag_name: &str, context: &CallerContext) -> FlagEvaluation {
        fail_closed(
            flag_name,
            || self.evaluate_flag_inner(flag_name, context).0,
            || FlagEvaluation::off(EvaluationReason::Error),
        )
    }

    /// Return `true` if the flag is on for the caller.
    ///
    /// Use [`CallerContext::anonymous`] when the caller has no identity.
    pub fn is_enabled(&self, flag_name: &str, context: &CallerContext) -> bool {
        self.evaluate_flag(flag_name, context).enabled
    }

    /// Return the flag variant for the caller.
    ///
    /// `"control"` when the flag is off, `"treatment"` when it is on without variants.
    pub fn get_variant(&self, flag_name: &str, context: &CallerContext) -> String {
        fail_closed(
            flag_name,
            || match self.evaluate_flag_inner(flag_name, context) {
                (result, Some(flag)) if result.enabled => {
                    flag.variant_for(context.identity()).to_owned()
                }
                _ => CONTROL.to_owned(),
            },
            || CONTROL.to_owned(),
        )
    }

    fn evaluate_flag_inner(
        &self,
        flag_name: &str,
        context: &CallerContext,
    ) -> (FlagEvaluation, Option<Arc<FeatureFlag>>) {
        let Some(flag) = self.flags.get(flag_name) else {
            log::trace!(target: "gateway_flags", flag_name; "flag not found");
            return (FlagEvaluation::off(EvaluationReason::NotFound), None);
        };

        let result = flag.evaluate(context, &self.config.environment, self.config.clock.now());
        log::trace!(target: "gateway_flags",
                    flag_name,
                    identity = context.identity(),
                    enabled = result.enabled,
                    reason:serde = result.reason;
                    "evaluated a flag");
        (result, Some(flag))
    }

    /// Assign the caller to an experiment and report why.
    pub fn evaluate_experiment(
        &self,
        experiment_name: &str,
        context: &CallerContext,
    ) -> ExperimentEvaluation {
        fail_closed(
            experiment_name,
            || {
                let Some(experiment) = self.experiments.get(experiment_name) else {
                    log::trace!(target: "gateway_flags", experiment_name; "experiment not found");
                    return ExperimentEvaluation::not_in_experiment(
                        experiment_name,
                        EvaluationReason::NotFound,
                    );
                };

                match experiment.evaluate(context, self.config.clock.now()) {
                    Ok(result) => {
                        log::trace!(target: "gateway_flags",
                                    experiment_name,
                                    identity = context.identity(),
                                    variant:display = result.assignment.variant,
                                    reason:serde = result.reason;
                                    "evaluated an experiment");
                        result
                    }
                    Err(err) => {
                        log::warn!(target: "gateway_flags",
                                   experiment_name,
                                   identity = context.identity();
                                   "error occurred while evaluating an experiment: {:?}", err);
                        ExperimentEvaluation::not_in_experiment(
                            experiment_name,
                            EvaluationReason::Error,
                        )
                    }
                }
            },
            || ExperimentEvaluation::not_in_experiment(experiment_name, EvaluationReason::Error),
        )
    }

    /// Assign the caller to an experiment.
    pub fn get_experiment_assignment(
        &self,
        experiment_name: &str,
        context: &CallerContext,
    ) -> ExperimentAssignment {
        self.evaluate_experiment(experiment_name, context).assignment
    }

    /// Create a flag, or replace the flag with the same name keeping its creation time.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if the request is malformed. Nothing is written.
    /// - [`Error::Store`] if the store rejected the write. The cache is left untouched.
    pub fn create_flag(&self, request: CreateFlagRequest) -> Result<Arc<FeatureFlag>> {
        request.validate()?;
        let now = self.config.clock.now();
        let created_at = self
            .flags
            .fetch(&request.name)?
            .map_or(now, |existing| existing.created_at);
        let flag = request.into_flag(created_at, now);
        self.write_flag(flag)
    }

    /// Apply a partial update to an existing flag.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if there is no flag called `flag_name`.
    /// - [`Error::Validation`] if an updated field is malformed.
    /// - [`Error::Store`] if the store failed.
    pub fn update_flag(
        &self,
        flag_name: &str,
        request: UpdateFlagRequest,
    ) -> Result<Arc<FeatureFlag>> {
        let current = self
            .flags
            .fetch(flag_name)?
            .ok_or_else(|| Error::NotFound(flag_name.to_owned()))?;
        let flag = request.apply(&current, self.config.clock.now())?;
        self.write_flag(flag)
    }

    fn write_flag(&self, flag: FeatureFlag) -> Result<Arc<FeatureFlag>> {
        let raw = serde_json::to_string(&flag)?;
        self.store.set(
            &self.flags.key(&flag.name),
            &raw,
            &set_options(&flag.description),
        )?;
        log::info!(target: "gateway_flags",
                   flag_name:display = flag.name,
                   enabled = flag.enabled,
                   rollout_percentage = flag.rollout_percentage;
                   "stored flag");
        let name = flag.name.clone();
        Ok(self.flags.put(&name, flag))
    }

    /// Delete a flag. Deleting a flag that does not exist is not an error.
    ///
    /// # Errors
    ///
    /// - [`Error::Store`] if the store failed. The cache is left untouched.
    pub fn delete_flag(&self, flag_name: &str) -> Result<()> {
        self.store.delete(&self.flags.key(flag_name))?;
        self.flags.remove(flag_name);
        log::info!(target: "gateway_flags", flag_name; "deleted flag");
        Ok(())
    }

    /// Look a flag up through the cache. Store failures read as absent.
    pub fn get_flag(&self, flag_name: &str) -> Option<Arc<FeatureFlag>> {
        self.flags.get(flag_name)
    }

    /// All flags, sorted by name.
    ///
    /// Lists the store and refreshes the cache on the way. If the store cannot be listed, the
    /// flags currently cached are returned instead, which may be a subset once there are more
    /// flags than [cache entries](ServiceConfig::with_max_cache_entries).
    pub fn get_all_flags(&self) -> Vec<Arc<FeatureFlag>> {
        let mut flags = self.flags.load_all().unwrap_or_else(|err| {
            log::warn!(target: "gateway_flags", "failed to list flags, serving cached flags: {}", err);
            self.flags.snapshot()
        });
        flags.sort_by(|a, b| a.name.cmp(&b.name));
        flags
    }

    /// Create an experiment, or replace the experiment with the same name keeping its creation
    /// time.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if the request is malformed, e.g. has no variants. Nothing is
    ///   written.
    /// - [`Error::Store`] if the store rejected the write. The cache is left untouched.
    pub fn create_experiment(&self, request: CreateExperimentRequest) -> Result<Arc<Experiment>> {
        request.validate()?;
        let now = self.config.clock.now();
        let created_at = self
            .experiments
            .fetch(&request.name)?
            .map_or(now, |existing| existing.created_at);
        let experiment = request.into_experiment(created_at, now);
        self.write_experiment(experiment)
    }

    /// Apply a partial update to an existing experiment.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if there is no experiment called `experiment_name`.
    /// - [`Error::Validation`] if an updated field is malformed.
    /// - [`Error::Store`] if the store failed.
    pub fn update_experiment(
        &self,
        experiment_name: &str,
        request: UpdateExperimentRequest,
    ) -> Result<Arc<Experiment>> {
        let current = self
            .experiments
            .fetch(experiment_name)?
            .ok_or_else(|| Error::NotFound(experiment_name.to_owned()))?;
        let experiment = request.apply(&current, self.config.clock.now())?;
        self.write_experiment(experiment)
    }

    fn write_experiment(&self, experiment: Experiment) -> Result<Arc<Experiment>> {
        let raw = serde_json::to_string(&experiment)?;
        self.store.set(
            &self.experiments.key(&experiment.name),
            &raw,
            &set_options(&experiment.description),
        )?;
        log::info!(target: "gateway_flags",
                   experiment_name:display = experiment.name,
                   enabled = experiment.enabled,
                   traffic_allocation = experiment.traffic_allocation;
                   "stored experiment");
        let name = experiment.name.clone();
        Ok(self.experiments.put(&name, experiment))
    }

    /// Delete an experiment. Deleting an experiment that does not exist is not an error.
    ///
    /// # Errors
    ///
    /// - [`Error::Store`] if the store failed. The cache is left untouched.
    pub fn delete_experiment(&self, experiment_name: &str) -> Result<()> {
        self.store
            .delete(&self.experiments.key(experiment_name))?;
        self.experiments.remove(experiment_name);
        log::info!(target: "gateway_flags", experiment_name; "deleted experiment");
        Ok(())
    }

    /// Look an experiment up through the cache. Store failures read as absent.
    pub fn get_experiment(&self, experiment_name: &str) -> Option<Arc<Experiment>> {
        self.experiments.get(experiment_name)
    }

    /// All experiments, sorted by name. Falls back to the cache like
    /// [`FlagService::get_all_flags`].
    pub fn get_all_experiments(&self) -> Vec<Arc<Experiment>> {
        let mut experiments = self.experiments.load_all().unwrap_or_else(|err| {
            log::warn!(target: "gateway_flags", "failed to list experiments, serving cached experiments: {}", err);
            self.experiments.snapshot()
        });
        experiments.sort_by(|a, b| a.name.cmp(&b.name));
        experiments
    }

    /// Aggregate counters over all definitions.
    pub fn get_statistics(&self) -> Statistics {
        let flags = self.get_all_flags();
        let experiments = self.get_all_experiments();
        let now = self.config.clock.now();

        let average_rollout_percentage = if flags.is_empty() {
            0.0
        } else {
            flags.iter().map(|f| f.rollout_percentage).sum::<f64>() / flags.len() as f64
        };

        Statistics {
            total_flags: flags.len(),
            enabled_flags: flags.iter().filter(|f| f.enabled).count(),
            total_experiments: experiments.len(),
            active_experiments: experiments
                .iter()
                .filter(|e| e.enabled && e.schedule.map_or(true, |s| s.is_active(now)))
                .count(),
            flags_with_targeting: flags
                .iter()
                .filter(|f| f.targeting.as_ref().is_some_and(|t| !t.is_empty()))
                .count(),
            flags_with_variants: flags.iter().filter(|f| !f.variants.is_empty()).count(),
            average_rollout_percentage,
        }
    }
}

fn set_options(description: &str) -> SetOptions {
    SetOptions {
        secure: false,
        description: Some(description.to_owned()).filter(|d| !d.is_empty()),
    }
}

/// Run `evaluate`, replacing a panic with `default()`.
fn fail_closed<T>(name: &str, evaluate: impl FnOnce() -> T, default: impl FnOnce() -> T) -> T {
    catch_unwind(AssertUnwindSafe(evaluate)).unwrap_or_else(|_| {
        log::error!(target: "gateway_flags", name; "evaluation panicked, returning fail-closed default");
        default()
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};

    use crate::{
        clock::{Clock, ManualClock},
        eval::EvaluationReason,
        models::{CallerContext, CreateExperimentRequest, CreateFlagRequest, Variant},
        store::{ConfigStore, InMemoryConfigStore, SetOptions},
        Error, FlagService, ServiceConfig, UpdateFlagRequest,
    };

    fn service() -> (Arc<InMemoryConfigStore>, Arc<ManualClock>, FlagService) {
        let store = Arc::new(InMemoryConfigStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let service = ServiceConfig::new()
            .with_environment("production")
            .with_clock(clock.clone())
            .to_service(store.clone());
        (store, clock, service)
    }

    #[test]
    fn create_writes_store_and_cache() {
        let (store, _clock, service) = service();
        service.create_flag(CreateFlagRequest::new("x")).unwrap();

        assert!(store.get("feature-flags/x").unwrap().is_some());
        assert!(service.is_enabled("x", &CallerContext::new("u1")));
    }

    #[test]
    fn recreating_keeps_creation_time() {
        let (_store, clock, service) = service();
        let first = service.create_flag(CreateFlagRequest::new("x")).unwrap();
        clock.advance(Duration::hours(1));

        let second = service
            .create_flag(CreateFlagRequest {
                enabled: false,
                ..CreateFlagRequest::new("x")
            })
            .unwrap();
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.updated_at, first.created_at + Duration::hours(1));
        assert!(!service.is_enabled("x", &CallerContext::new("u1")));
    }

    #[test]
    fn description_is_passed_to_store() {
        let (store, _clock, service) = service();
        service
            .create_flag(CreateFlagRequest {
                description: "Smart provider selection".into(),
                ..CreateFlagRequest::new("x")
            })
            .unwrap();
        assert_eq!(
            store.options("feature-flags/x").unwrap().description.as_deref(),
            Some("Smart provider selection")
        );
    }

    #[test]
    fn update_missing_flag_is_not_found() {
        let (_store, _clock, service) = service();
        let err = service
            .update_flag("nope", UpdateFlagRequest::default())
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(name) if name == "nope"));
    }

    #[test]
    fn update_changes_evaluation() {
        let (_store, _clock, service) = service();
        service.create_flag(CreateFlagRequest::new("x")).unwrap();
        service
            .update_flag(
                "x",
                UpdateFlagRequest {
                    rollout_percentage: Some(0.0),
                    ..UpdateFlagRequest::default()
                },
            )
            .unwrap();
        assert_eq!(
            service.evaluate_flag("x", &CallerContext::new("u1")).reason,
            EvaluationReason::OutsideRollout
        );
    }

    #[test]
    fn writes_from_other_instances_show_up_after_load_all() {
        let (store, _clock, service) = service();
        assert!(!service.is_enabled("x", &CallerContext::new("u1")));

        let other = ServiceConfig::new().to_service(store.clone());
        other.create_flag(CreateFlagRequest::new("x")).unwrap();
        // Still cached as absent here.
        assert!(!service.is_enabled("x", &CallerContext::new("u1")));

        assert_eq!(service.load_all(), 1);
        assert!(service.is_enabled("x", &CallerContext::new("u1")));
    }

    #[test]
    fn corrupt_definitions_fail_closed() {
        let (store, _clock, service) = service();
        store
            .set("feature-flags/broken", "{not json", &SetOptions::default())
            .unwrap();
        store
            .set("experiments/broken", "[]", &SetOptions::default())
            .unwrap();

        let context = CallerContext::new("u1");
        assert!(!service.is_enabled("broken", &context));
        assert_eq!(service.get_variant("broken", &context), "control");
        assert!(!service.get_experiment_assignment("broken", &context).in_experiment);
    }

    #[test]
    fn experiment_stored_without_variants_fails_closed() {
        let (store, _clock, service) = service();
        store
            .set(
                "experiments/empty",
                r#"{"name":"empty","enabled":true,"variants":[],
                    "createdAt":"2024-01-01T00:00:00Z","updatedAt":"2024-01-01T00:00:00Z"}"#,
                &SetOptions::default(),
            )
            .unwrap();

        let result = service.evaluate_experiment("empty", &CallerContext::new("u1"));
        assert_eq!(result.reason, EvaluationReason::Error);
        assert_eq!(result.assignment.variant, "control");
        assert!(!result.assignment.in_experiment);
    }

    #[test]
    fn experiment_stored_with_negative_weight_fails_closed() {
        let (store, _clock, service) = service();
        store
            .set(
                "experiments/skewed",
                r#"{"name":"skewed","enabled":true,
                    "variants":[{"name":"A","weight":105},{"name":"B","weight":-5}],
                    "createdAt":"2024-01-01T00:00:00Z","updatedAt":"2024-01-01T00:00:00Z"}"#,
                &SetOptions::default(),
            )
            .unwrap();

        for i in 0..20 {
            let result =
                service.evaluate_experiment("skewed", &CallerContext::new(format!("user-{i}")));
            assert_eq!(result.reason, EvaluationReason::Error);
            assert_eq!(result.assignment.variant, "control");
            assert!(!result.assignment.in_experiment);
        }
    }

    #[test]
    fn statistics() {
        let (_store, clock, service) = service();
        service
            .create_flag(CreateFlagRequest {
                rollout_percentage: 50.0,
                variants: vec![Variant::new("a", 1.0)],
                ..CreateFlagRequest::new("a")
            })
            .unwrap();
        service
            .create_flag(CreateFlagRequest {
                enabled: false,
                targeting: Some(crate::Targeting {
                    segments: vec!["beta".into()],
                    ..Default::default()
                }),
                ..CreateFlagRequest::new("b")
            })
            .unwrap();
        service
            .create_experiment(CreateExperimentRequest::new(
                "live",
                vec![Variant::new("A", 1.0)],
            ))
            .unwrap();
        service
            .create_experiment(CreateExperimentRequest {
                schedule: Some(crate::Schedule {
                    start_date: Some(clock.now() + Duration::days(1)),
                    end_date: None,
                }),
                ..CreateExperimentRequest::new("upcoming", vec![Variant::new("A", 1.0)])
            })
            .unwrap();

        let stats = service.get_statistics();
        assert_eq!(stats.total_flags, 2);
        assert_eq!(stats.enabled_flags, 1);
        assert_eq!(stats.flags_with_targeting, 1);
        assert_eq!(stats.flags_with_variants, 1);
        assert_eq!(stats.average_rollout_percentage, 75.0);
        assert_eq!(stats.total_experiments, 2);
        assert_eq!(stats.active_experiments, 1);
    }

    #[test]
    fn statistics_without_definitions() {
        let (_store, _clock, service) = service();
        let stats = service.get_statistics();
        assert_eq!(stats.total_flags, 0);
        assert_eq!(stats.average_rollout_percentage, 0.0);
    }

    #[test]
    fn listings_are_not_bounded_by_cache_capacity() {
        let store = Arc::new(InMemoryConfigStore::new());
        let service = ServiceConfig::new()
            .with_max_cache_entries(10)
            .to_service(store.clone());
        for i in 0..50 {
            service
                .create_flag(CreateFlagRequest::new(format!("flag-{i:02}")))
                .unwrap();
        }
        service
            .create_experiment(CreateExperimentRequest::new(
                "only",
                vec![Variant::new("A", 1.0)],
            ))
            .unwrap();

        for _ in 0..3 {
            let flags = service.get_all_flags();
            assert_eq!(flags.len(), 50);
            assert_eq!(flags[0].name, "flag-00");
            assert_eq!(flags[49].name, "flag-49");
            assert_eq!(service.get_statistics().total_flags, 50);
        }
        assert_eq!(service.get_all_experiments().len(), 1);
        assert_eq!(store.len(), 51);
    }
}
