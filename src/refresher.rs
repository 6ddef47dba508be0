//! A background thread that periodically reloads all definitions from the config store so that
//! every instance's cache converges to the store within one refresh interval.
use std::{
    sync::{
        mpsc::{Receiver, RecvTimeoutError, SyncSender},
        Arc, Condvar, Mutex, PoisonError,
    },
    thread::JoinHandle,
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::{
    cache::DefinitionCache,
    models::{Experiment, FeatureFlag},
    store::StoreError,
    Error, Result,
};

/// Configuration for [`RefreshThread`].
#[derive(Debug, Clone)]
pub struct RefreshThreadConfig {
    /// Interval to wait between reloads.
    pub interval: Duration,
    /// Upper bound of a random duration subtracted from each interval.
    pub jitter: Duration,
}

impl RefreshThreadConfig {
    /// Default value for [`RefreshThreadConfig::interval`].
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
    /// Default value for [`RefreshThreadConfig::jitter`].
    pub const DEFAULT_JITTER: Duration = Duration::from_secs(5);

    /// Create a new `RefreshThreadConfig` using default configuration.
    pub fn new() -> RefreshThreadConfig {
        RefreshThreadConfig::default()
    }

    /// Update refresh interval with `interval`.
    pub fn with_interval(mut self, interval: Duration) -> RefreshThreadConfig {
        self.interval = interval;
        self
    }

    /// Update refresh jitter with `jitter`.
    pub fn with_jitter(mut self, jitter: Duration) -> RefreshThreadConfig {
        self.jitter = jitter;
        self
    }

    /// Pause before the next cycle: the interval shortened by a random share of the jitter.
    fn next_pause(&self) -> Duration {
        let jitter = thread_rng().gen_range(Duration::ZERO..=self.jitter);
        self.interval.saturating_sub(jitter)
    }
}

impl Default for RefreshThreadConfig {
    fn default() -> RefreshThreadConfig {
        RefreshThreadConfig {
            interval: RefreshThreadConfig::DEFAULT_INTERVAL,
            jitter: RefreshThreadConfig::DEFAULT_JITTER,
        }
    }
}

/// The caches a refresh cycle reloads.
pub(crate) struct RefreshTarget {
    pub flags: Arc<DefinitionCache<FeatureFlag>>,
    pub experiments: Arc<DefinitionCache<Experiment>>,
}

pub(crate) struct RefreshReport {
    pub loaded: usize,
    /// First failure of the cycle, if any.
    pub error: Option<StoreError>,
}

impl RefreshTarget {
    /// Reload both caches and drop expired entries. A failure of one cache does not stop the
    /// other from loading.
    pub fn refresh(&self) -> RefreshReport {
        let mut report = RefreshReport {
            loaded: 0,
            error: None,
        };
        for (kind, result) in [
            ("flags", self.flags.load_all().map(|loaded| loaded.len())),
            ("experiments", self.experiments.load_all().map(|loaded| loaded.len())),
        ] {
            match result {
                Ok(loaded) => report.loaded += loaded,
                Err(err) => {
                    log::warn!(target: "gateway_flags", kind; "failed to load definitions: {}", err);
                    report.error.get_or_insert(err);
                }
            }
        }
        self.flags.sweep();
        self.experiments.sweep();
        report
    }
}

/// Outcome of the latest refresh cycle, published by the refresh thread.
#[derive(Default)]
struct LatestRefresh {
    /// `None` until the first cycle finished.
    outcome: Mutex<Option<Result<()>>>,
    published: Condvar,
}

impl LatestRefresh {
    fn publish(&self, outcome: Result<()>) {
        *self
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(outcome);
        self.published.notify_all();
    }

    fn wait_for_first(&self) -> Result<()> {
        let outcome = self
            .outcome
            .lock()
            .map_err(|_| Error::RefreshThreadPanicked)?;
        let outcome = self
            .published
            .wait_while(outcome, |outcome| outcome.is_none())
            .map_err(|_| Error::RefreshThreadPanicked)?;
        Option::clone(&outcome).unwrap_or(Err(Error::RefreshThreadPanicked))
    }
}

/// Refresh until told to stop or until the owning [`RefreshThread`] is dropped.
fn run(
    target: &RefreshTarget,
    config: &RefreshThreadConfig,
    latest: &LatestRefresh,
    stop: &Receiver<()>,
) {
    loop {
        log::debug!(target: "gateway_flags", "refreshing definitions");
        let report = target.refresh();
        log::debug!(target: "gateway_flags", loaded = report.loaded; "refreshed definitions");
        latest.publish(report.error.map_or(Ok(()), |err| Err(Error::Store(err))));

        match stop.recv_timeout(config.next_pause()) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) => {
                log::debug!(target: "gateway_flags", "refresh thread stopped");
                return;
            }
            Err(RecvTimeoutError::Disconnected) => {
                log::debug!(target: "gateway_flags", "refresh thread handle dropped, exiting");
                return;
            }
        }
    }
}

/// A definition refresh thread.
///
/// Use [`FlagService::start_refresh_thread`](crate::FlagService::start_refresh_thread) to get an
/// instance of it. Dropping the handle also ends the thread after its current cycle.
pub struct RefreshThread {
    join_handle: JoinHandle<()>,
    /// Buffer of one: a full buffer means a stop is already pending.
    stop_sender: SyncSender<()>,
    latest: Arc<LatestRefresh>,
}

impl RefreshThread {
    pub(crate) fn start(
        target: RefreshTarget,
        config: RefreshThreadConfig,
    ) -> std::io::Result<RefreshThread> {
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel(1);
        let latest = Arc::new(LatestRefresh::default());

        let join_handle = {
            let latest = Arc::clone(&latest);
            std::thread::Builder::new()
                .name("flag-refresher".to_owned())
                .spawn(move || {
                    let body = std::panic::AssertUnwindSafe(|| {
                        run(&target, &config, &latest, &stop_receiver)
                    });
                    if std::panic::catch_unwind(body).is_err() {
                        log::error!(target: "gateway_flags", "refresh thread panicked");
                        latest.publish(Err(Error::RefreshThreadPanicked));
                    }
                })?
        };

        Ok(RefreshThread {
            join_handle,
            stop_sender,
            latest,
        })
    }

    /// Block until the first refresh cycle finished.
    ///
    /// # Errors
    ///
    /// - [`Error::Store`] if the first cycle could not list the store. The caches still serve
    ///   whatever they hold and fill lazily.
    /// - [`Error::RefreshThreadPanicked`]
    pub fn wait_for_first_refresh(&self) -> Result<()> {
        self.latest.wait_for_first()
    }

    /// Ask the refresh thread to stop without waiting for it.
    pub fn stop(&self) {
        // Fails only if the thread is gone or a stop is already queued.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the refresh thread and wait for it to exit.
    ///
    /// # Errors
    ///
    /// - [`Error::RefreshThreadPanicked`] if the thread has panicked.
    pub fn shutdown(self) -> Result<()> {
        self.stop();
        self.join_handle
            .join()
            .map_err(|_| Error::RefreshThreadPanicked)
    }
}
