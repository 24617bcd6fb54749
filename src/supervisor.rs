//! Supervisor owning the collector name to unit map.
//!
//! The supervisor polls the [`ConfigWatcher`], reconciles the resulting diff
//! against live units and, on shutdown, stops every unit before stopping the
//! sender. At most one unit per collector name is ever alive: a replaced or
//! removed unit is joined (or aborted after the stop timeout) before its
//! successor starts.

use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::collector::CollectorRegistry;
use crate::config::{CollectorDefinition, ConfigError, DEFAULT_POLL_INTERVAL, DEFAULT_STOP_TIMEOUT};
use crate::queue::MetricSink;
use crate::scheduler::{CollectorUnit, Scheduler, SchedulerError, UnitState};
use crate::sender::{SenderError, SenderHandle};
use crate::watcher::{ConfigDiff, ConfigWatcher, Definitions};

/// Owns every live [`Scheduler`].
#[derive(Debug)]
pub struct Supervisor {
    watcher: ConfigWatcher,
    definitions: Definitions,
    registry: CollectorRegistry,
    sink: MetricSink,
    units: HashMap<String, Scheduler>,
    poll_interval: Duration,
    stop_timeout: Duration,
    sender: Option<SenderHandle>,
}

impl Supervisor {
    pub fn new(watcher: ConfigWatcher, registry: CollectorRegistry, sink: MetricSink) -> Self {
        Self {
            watcher,
            definitions: Definitions::new(),
            registry,
            sink,
            units: HashMap::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            sender: None,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Bounded wait for each unit to stop before it is aborted.
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Sender stopped as the last step of shutdown.
    pub fn with_sender(mut self, sender: SenderHandle) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Names with a unit entry, sorted. Includes permanently disabled units.
    pub fn unit_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.units.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn unit_state(&self, name: &str) -> Option<UnitState> {
        self.units.get(name).map(Scheduler::state)
    }

    pub fn unit_generation(&self, name: &str) -> Option<u64> {
        self.units.get(name).map(Scheduler::generation)
    }

    /// Units whose task is still running.
    pub fn live_count(&self) -> usize {
        self.units.values().filter(|u| !u.is_finished()).count()
    }

    /// Scan the config directory once and reconcile the diff.
    ///
    /// # Errors
    /// Returns the watcher's error if the directory cannot be listed.
    pub async fn poll(&mut self) -> Result<(), ConfigError> {
        let diff = self.watcher.scan(&mut self.definitions)?;
        if !diff.is_empty() {
            tracing::debug!(
                changed = diff.changed.len(),
                removed = diff.removed.len(),
                generation = self.watcher.generation(),
                "Collector configuration changed"
            );
            self.reconcile(diff).await;
        }
        Ok(())
    }

    /// Apply a config diff to the live units.
    pub async fn reconcile(&mut self, diff: ConfigDiff) {
        for name in diff.removed.into_keys() {
            if let Some(unit) = self.units.remove(&name) {
                tracing::info!(collector = %name, "Collector config removed, stopping");
                self.stop_unit(unit).await;
            }
        }

        for (name, definition) in diff.changed {
            if let Some(unit) = self.units.remove(&name) {
                tracing::info!(collector = %name, "Collector config changed, restarting");
                self.stop_unit(unit).await;
            }

            if !definition.enabled {
                tracing::debug!(collector = %name, "Collector disabled");
                continue;
            }
            self.start_unit(name, definition);
        }
    }

    fn start_unit(&mut self, name: String, definition: CollectorDefinition) {
        let interval = definition.interval;
        let generation = definition.generation;
        match CollectorUnit::build(&self.registry, definition, self.sink.clone()) {
            Ok(unit) => {
                tracing::info!(
                    collector = %name,
                    implementation = %unit.definition().implementation_id(),
                    interval_s = interval.as_secs(),
                    generation,
                    "Collector registered"
                );
                self.units.insert(name, Scheduler::start(unit));
            }
            Err(e) => {
                tracing::error!(collector = %name, error = %e, "Failed to load collector, skipping");
            }
        }
    }

    async fn stop_unit(&self, mut unit: Scheduler) {
        let name = unit.name().to_string();
        log_join(&name, unit.stop(self.stop_timeout).await);
    }

    /// Stop every unit, then the sender.
    ///
    /// Stops are requested on all units first and joined concurrently, so
    /// shutdown takes as long as the slowest unit.
    pub async fn shutdown(&mut self) -> Result<(), SenderError> {
        tracing::info!(units = self.units.len(), "Stopping collectors");
        for unit in self.units.values() {
            unit.request_stop();
        }

        let timeout = self.stop_timeout;
        let joins = self.units.drain().map(|(name, mut unit)| async move {
            let result = unit.join(timeout).await;
            (name, result)
        });
        for (name, result) in futures::future::join_all(joins).await {
            log_join(&name, result);
        }

        match self.sender.take() {
            Some(sender) => {
                tracing::info!("Stopping sender");
                sender.stop().await
            }
            None => Ok(()),
        }
    }

    /// Poll until `shutdown` is cancelled, then shut down.
    ///
    /// Scan failures are logged and retried at the next poll.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), SenderError> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll().await {
                        tracing::warn!(
                            dir = %self.watcher.dir().display(),
                            error = %e,
                            "Failed to scan collector directory"
                        );
                    }
                }
            }
        }

        self.shutdown().await
    }
}

fn log_join(name: &str, result: Result<(), SchedulerError>) {
    match result {
        Ok(()) => tracing::debug!(collector = %name, "Collector unit joined"),
        Err(e @ SchedulerError::StopTimeout { .. }) => {
            tracing::warn!(collector = %name, error = %e, "Collector overran stop timeout, aborted");
        }
        Err(e) => tracing::error!(collector = %name, error = %e, "Collector unit failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{Collector, CollectorContext, CollectorError};
    use crate::queue::DeliveryQueue;
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Tracks how many stub units are inside a pass or alive at once.
    #[derive(Clone, Default)]
    struct Tracker {
        alive: Arc<AtomicUsize>,
        max_alive: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    struct Stub {
        name: String,
        pass: Duration,
        disable: bool,
        tracker: Tracker,
    }

    impl Stub {
        fn new(ctx: &CollectorContext, tracker: Tracker) -> Self {
            let alive = tracker.alive.fetch_add(1, Ordering::SeqCst) + 1;
            tracker.max_alive.fetch_max(alive, Ordering::SeqCst);
            let opt = |key: &str| ctx.definition.options.get(key).cloned();
            Self {
                name: ctx.name().to_string(),
                pass: Duration::from_secs(opt("pass").and_then(|v| v.as_u64()).unwrap_or(0)),
                disable: opt("disable").and_then(|v| v.as_bool()).unwrap_or(false),
                tracker,
            }
        }
    }

    #[async_trait::async_trait]
    impl Collector for Stub {
        fn name(&self) -> &str {
            &self.name
        }

        async fn collect(&mut self) -> Result<(), CollectorError> {
            tokio::time::sleep(self.pass).await;
            if self.disable {
                return Err(CollectorError::PermanentlyDisabled("stub".into()));
            }
            Ok(())
        }

        async fn close(&mut self) {
            self.tracker.alive.fetch_sub(1, Ordering::SeqCst);
            self.tracker.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn supervisor(dir: &Path, tracker: &Tracker) -> Supervisor {
        let tracker = tracker.clone();
        let registry = CollectorRegistry::with_builtins().register("stub", move |ctx| {
            Ok(Box::new(Stub::new(&ctx, tracker.clone())) as Box<dyn Collector>)
        });
        let (sink, _rx) = DeliveryQueue::bounded(64);
        Supervisor::new(ConfigWatcher::new(dir), registry, sink)
            .with_stop_timeout(Duration::from_secs(120))
    }

    fn def(name: &str, enabled: bool, generation: u64) -> CollectorDefinition {
        let mut def = CollectorDefinition::new(name)
            .with_enabled(enabled)
            .with_class("stub")
            .with_interval(Duration::from_secs(1));
        def.generation = generation;
        def
    }

    fn changed(defs: impl IntoIterator<Item = CollectorDefinition>) -> ConfigDiff {
        ConfigDiff {
            changed: defs.into_iter().map(|d| (d.name.clone(), d)).collect(),
            ..ConfigDiff::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_starts_enabled_and_skips_unresolved() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Tracker::default();
        let mut sup = supervisor(dir.path(), &tracker);

        let unresolved = CollectorDefinition::new("mystery").with_enabled(true);
        sup.reconcile(changed([def("a", true, 1), def("b", false, 1), unresolved]))
            .await;

        assert_eq!(sup.unit_names(), vec!["a"]);
        assert_eq!(sup.live_count(), 1);
        sup.shutdown().await.unwrap();
        assert_eq!(tracker.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_two_live_units_per_name() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Tracker::default();
        let mut sup = supervisor(dir.path(), &tracker);

        let slow = |g| def("a", true, g).with_option("pass", 30);
        for generation in 1..=5 {
            sup.reconcile(changed([slow(generation)])).await;
            tokio::time::sleep(Duration::from_secs(2)).await;
            assert_eq!(sup.unit_generation("a"), Some(generation));
        }

        assert_eq!(tracker.max_alive.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.closes.load(Ordering::SeqCst), 4);

        sup.reconcile(changed([def("a", false, 6)])).await;
        assert!(sup.unit_names().is_empty());
        assert_eq!(tracker.alive.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_during_long_pass_stops_before_returning() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Tracker::default();
        let mut sup = supervisor(dir.path(), &tracker);

        let long = def("slow", true, 1).with_option("pass", 60);
        sup.reconcile(changed([long.clone()])).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        let start = tokio::time::Instant::now();
        let diff = ConfigDiff {
            removed: [("slow".to_string(), long)].into(),
            ..ConfigDiff::default()
        };
        sup.reconcile(diff).await;

        assert!(start.elapsed() >= Duration::from_secs(55));
        assert!(sup.unit_names().is_empty());
        assert_eq!(tracker.alive.load(Ordering::SeqCst), 0);
        assert_eq!(tracker.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_bounded_by_slowest_unit() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Tracker::default();
        let mut sup = supervisor(dir.path(), &tracker);

        sup.reconcile(changed(
            ["a", "b", "c"].map(|n| def(n, true, 1).with_option("pass", 10)),
        ))
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let start = tokio::time::Instant::now();
        sup.shutdown().await.unwrap();
        let elapsed = start.elapsed();

        assert!(elapsed < Duration::from_secs(11), "took {elapsed:?}");
        assert_eq!(tracker.closes.load(Ordering::SeqCst), 3);
        assert_eq!(sup.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanently_disabled_kept_until_config_changes() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Tracker::default();
        let mut sup = supervisor(dir.path(), &tracker);

        let path = dir.path().join("quit.conf");
        std::fs::write(
            &path,
            "base:\n  enabled: true\n  interval: 1\n  collectorclass: stub\ndisable: true\n",
        )
        .unwrap();

        sup.poll().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(sup.unit_state("quit"), Some(UnitState::PermanentlyDisabled));
        assert_eq!(sup.live_count(), 0);

        // Unchanged file: no restart.
        sup.poll().await.unwrap();
        assert_eq!(sup.unit_state("quit"), Some(UnitState::PermanentlyDisabled));
        assert_eq!(tracker.closes.load(Ordering::SeqCst), 1);

        std::fs::write(
            &path,
            "base:\n  enabled: true\n  interval: 1\n  collectorclass: stub\n",
        )
        .unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(std::time::SystemTime::now() + Duration::from_secs(10))
            .unwrap();

        sup.poll().await.unwrap();
        assert_eq!(sup.live_count(), 1);
        assert_ne!(sup.unit_state("quit"), Some(UnitState::PermanentlyDisabled));
        sup.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown_token() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.conf"),
            "base:\n  enabled: true\n  interval: 1\n  collectorclass: stub\n",
        )
        .unwrap();
        let tracker = Tracker::default();
        let sup = supervisor(dir.path(), &tracker).with_poll_interval(Duration::from_secs(1));

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(sup.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(tracker.alive.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(tracker.alive.load(Ordering::SeqCst), 0);
    }
}
