//! Per-collector scheduling.
//!
//! Every enabled collector becomes a [`CollectorUnit`] driven by its own
//! [`Scheduler`] task. A pass is never interrupted: a stop request is seen
//! between passes or while sleeping, after which the collector's `close`
//! hook runs once.
//!
//! ```text
//! Loaded -> Running -> Scheduled -> Running -> ... -> StopRequested -> Stopped
//!                  \-> PermanentlyDisabled
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::collector::{Collector, CollectorContext, CollectorError, CollectorRegistry, Schedule};
use crate::config::CollectorDefinition;
use crate::queue::MetricSink;

/// Longest uninterrupted sleep between stop checks.
pub const STOP_POLL_SLICE: Duration = Duration::from_secs(5);

/// Delay before re-running a continuous collector whose pass failed.
pub const CONTINUOUS_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Lifecycle state of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum UnitState {
    Loaded,
    Scheduled,
    Running,
    StopRequested,
    Stopped,
    PermanentlyDisabled,
}

impl UnitState {
    /// The task has ended and will not run another pass.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::PermanentlyDisabled)
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("collector '{name}' did not stop within {timeout:?}")]
    StopTimeout { name: String, timeout: Duration },

    #[error("collector '{name}' task failed: {source}")]
    Join {
        name: String,
        #[source]
        source: JoinError,
    },
}

// =============================================================================
// CollectorUnit
// =============================================================================

/// A definition bound to its instantiated collector.
pub struct CollectorUnit {
    definition: CollectorDefinition,
    collector: Box<dyn Collector>,
    span: tracing::Span,
    stop: CancellationToken,
}

impl std::fmt::Debug for CollectorUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorUnit")
            .field("name", &self.definition.name)
            .field("interval", &self.definition.interval)
            .field("generation", &self.definition.generation)
            .finish_non_exhaustive()
    }
}

impl CollectorUnit {
    /// Wrap an already constructed collector. The unit shares the context's
    /// span and stop token.
    pub fn new(ctx: &CollectorContext, collector: Box<dyn Collector>) -> Self {
        Self {
            definition: ctx.definition.clone(),
            collector,
            span: ctx.span.clone(),
            stop: ctx.stop.clone(),
        }
    }

    /// Resolve the definition's implementation and construct it.
    pub fn build(
        registry: &CollectorRegistry,
        definition: CollectorDefinition,
        sink: MetricSink,
    ) -> Result<Self, CollectorError> {
        let ctx = CollectorContext::new(definition, sink);
        let unit_ctx = ctx.clone();
        let collector = registry.instantiate(ctx)?;
        Ok(Self::new(&unit_ctx, collector))
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &CollectorDefinition {
        &self.definition
    }

    pub fn schedule(&self) -> Schedule {
        Schedule::from_interval(self.definition.interval)
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Handle to a running unit.
#[derive(Debug)]
pub struct Scheduler {
    name: String,
    generation: u64,
    stop: CancellationToken,
    state: Arc<watch::Sender<UnitState>>,
    task: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn the unit's task. Must be called within a Tokio runtime.
    pub fn start(unit: CollectorUnit) -> Self {
        let name = unit.definition.name.clone();
        let generation = unit.definition.generation;
        let stop = unit.stop.clone();
        let state = Arc::new(watch::Sender::new(UnitState::Loaded));
        let task = tokio::spawn(run_unit(unit, Arc::clone(&state)));

        Self {
            name,
            generation,
            stop,
            state,
            task: Some(task),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Watcher generation of the definition this unit was built from.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> UnitState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<UnitState> {
        self.state.subscribe()
    }

    /// Ask the unit to stop after its current pass. Does not wait.
    pub fn request_stop(&self) {
        self.stop.cancel();
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == UnitState::StopRequested {
                false
            } else {
                *state = UnitState::StopRequested;
                true
            }
        });
    }

    /// Returns true once the task has ended (or was never started).
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait up to `timeout` for the task to end.
    ///
    /// On timeout the task is aborted and awaited before returning, so the
    /// unit is guaranteed dead either way.
    pub async fn join(&mut self, timeout: Duration) -> Result<(), SchedulerError> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, &mut *task).await {
            Ok(result) => {
                self.task = None;
                result.map_err(|source| SchedulerError::Join {
                    name: self.name.clone(),
                    source,
                })
            }
            Err(_) => {
                task.abort();
                let _ = task.await;
                self.task = None;
                self.state.send_replace(UnitState::Stopped);
                Err(SchedulerError::StopTimeout {
                    name: self.name.clone(),
                    timeout,
                })
            }
        }
    }

    /// Request stop and wait.
    pub async fn stop(&mut self, timeout: Duration) -> Result<(), SchedulerError> {
        self.request_stop();
        self.join(timeout).await
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.stop.cancel();
        }
    }
}

// =============================================================================
// Task body
// =============================================================================

enum PassOutcome {
    Completed,
    Failed,
    Disabled,
}

async fn run_unit(unit: CollectorUnit, state: Arc<watch::Sender<UnitState>>) {
    let CollectorUnit {
        definition,
        mut collector,
        span,
        stop,
    } = unit;
    let schedule = Schedule::from_interval(definition.interval);

    async move {
        tracing::info!(schedule = %schedule, "Collector started");

        loop {
            if stop.is_cancelled() {
                break;
            }
            advance(&state, UnitState::Running);

            let start = Instant::now();
            let outcome = run_pass(collector.as_mut()).await;
            let elapsed = start.elapsed();

            if let PassOutcome::Disabled = outcome {
                close_collector(collector.as_mut()).await;
                state.send_replace(UnitState::PermanentlyDisabled);
                return;
            }
            if stop.is_cancelled() {
                break;
            }

            let delay = match (schedule, outcome) {
                (Schedule::Interval(interval), _) => interval.saturating_sub(elapsed),
                (Schedule::Continuous, PassOutcome::Failed) => CONTINUOUS_ERROR_BACKOFF,
                (Schedule::Continuous, _) => Duration::ZERO,
            };
            advance(&state, UnitState::Scheduled);
            if !sleep_or_stop(delay, &stop).await {
                break;
            }
        }

        state.send_replace(UnitState::StopRequested);
        close_collector(collector.as_mut()).await;
        state.send_replace(UnitState::Stopped);
        tracing::info!("Collector stopped");
    }
    .instrument(span)
    .await
}

/// Move between `Scheduled` and `Running` without overwriting a concurrent
/// stop request.
fn advance(state: &watch::Sender<UnitState>, next: UnitState) {
    state.send_if_modified(|current| {
        if *current == UnitState::StopRequested || current.is_terminal() || *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}

/// Run one pass, containing errors and panics.
async fn run_pass(collector: &mut dyn Collector) -> PassOutcome {
    let start = Instant::now();
    tracing::debug!("Running collection");

    let result = AssertUnwindSafe(collector.collect()).catch_unwind().await;
    let duration_ms = start.elapsed().as_millis();

    match result {
        Ok(Ok(())) => {
            tracing::debug!(duration_ms, "Collection succeeded");
            PassOutcome::Completed
        }
        Ok(Err(CollectorError::PermanentlyDisabled(reason))) => {
            tracing::warn!(reason = %reason, "Collector permanently disabled");
            PassOutcome::Disabled
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, duration_ms, "Collection failed");
            PassOutcome::Failed
        }
        Err(panic) => {
            tracing::error!(panic = %panic_message(&*panic), duration_ms, "Collection panicked");
            PassOutcome::Failed
        }
    }
}

async fn close_collector(collector: &mut dyn Collector) {
    if let Err(panic) = AssertUnwindSafe(collector.close()).catch_unwind().await {
        tracing::error!(panic = %panic_message(&*panic), "Collector close hook panicked");
    }
}

/// Sleep in slices, returning false as soon as stop is requested.
async fn sleep_or_stop(mut remaining: Duration, stop: &CancellationToken) -> bool {
    if remaining.is_zero() {
        tokio::task::yield_now().await;
        return !stop.is_cancelled();
    }
    while !remaining.is_zero() {
        let slice = remaining.min(STOP_POLL_SLICE);
        tokio::select! {
            _ = stop.cancelled() => return false,
            _ = tokio::time::sleep(slice) => {}
        }
        remaining -= slice;
    }
    !stop.is_cancelled()
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::DeliveryQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        Fail,
        Panic,
        Disable,
        Sleep(Duration),
        IgnoreStop,
    }

    #[derive(Clone, Default)]
    struct Counters {
        passes: Arc<AtomicUsize>,
        completed: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    struct Stub {
        behavior: Behavior,
        counters: Counters,
    }

    #[async_trait::async_trait]
    impl Collector for Stub {
        fn name(&self) -> &str {
            "stub"
        }

        async fn collect(&mut self) -> Result<(), CollectorError> {
            self.counters.passes.fetch_add(1, Ordering::SeqCst);
            let result = match self.behavior {
                Behavior::Succeed => Ok(()),
                Behavior::Fail => Err(CollectorError::Failed("boom".into())),
                Behavior::Panic => panic!("stub panicked"),
                Behavior::Disable => Err(CollectorError::PermanentlyDisabled("done".into())),
                Behavior::Sleep(d) => {
                    tokio::time::sleep(d).await;
                    Ok(())
                }
                Behavior::IgnoreStop => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
            };
            self.counters.completed.fetch_add(1, Ordering::SeqCst);
            result
        }

        async fn close(&mut self) {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn unit(interval: Duration, behavior: Behavior) -> (CollectorUnit, Counters) {
        let (sink, _rx) = DeliveryQueue::bounded(8);
        let def = CollectorDefinition::new("stub")
            .with_enabled(true)
            .with_interval(interval);
        let ctx = CollectorContext::new(def, sink);
        let counters = Counters::default();
        let stub = Stub {
            behavior,
            counters: counters.clone(),
        };
        (CollectorUnit::new(&ctx, Box::new(stub)), counters)
    }

    #[test]
    fn test_unit_state_display() {
        assert_eq!(UnitState::StopRequested.to_string(), "stop_requested");
        assert!(UnitState::PermanentlyDisabled.is_terminal());
        assert!(!UnitState::Scheduled.is_terminal());
    }

    #[test]
    fn test_stop_request_is_never_overwritten() {
        let state = watch::Sender::new(UnitState::Scheduled);
        advance(&state, UnitState::Running);
        assert_eq!(*state.borrow(), UnitState::Running);

        state.send_replace(UnitState::StopRequested);
        advance(&state, UnitState::Running);
        advance(&state, UnitState::Scheduled);
        assert_eq!(*state.borrow(), UnitState::StopRequested);

        state.send_replace(UnitState::Stopped);
        advance(&state, UnitState::Running);
        assert_eq!(*state.borrow(), UnitState::Stopped);
    }

    #[tokio::test]
    async fn test_build_unknown_implementation_fails() {
        let (sink, _rx) = DeliveryQueue::bounded(8);
        let err = CollectorUnit::build(
            &CollectorRegistry::new(),
            CollectorDefinition::new("nope"),
            sink,
        )
        .unwrap_err();
        assert!(matches!(err, CollectorError::UnknownImplementation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_passes_on_interval() {
        let (unit, counters) = unit(Duration::from_secs(10), Behavior::Succeed);
        let mut scheduler = Scheduler::start(unit);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(counters.passes.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.state(), UnitState::Scheduled);

        scheduler.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(scheduler.state(), UnitState::Stopped);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_and_panics_do_not_stop_the_unit() {
        for behavior in [Behavior::Fail, Behavior::Panic] {
            let (unit, counters) = unit(Duration::from_secs(1), behavior);
            let mut scheduler = Scheduler::start(unit);

            tokio::time::sleep(Duration::from_millis(3500)).await;
            assert_eq!(counters.passes.load(Ordering::SeqCst), 4);
            assert!(!scheduler.state().is_terminal());

            scheduler.stop(Duration::from_secs(1)).await.unwrap();
            assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_never_interrupts_a_pass() {
        let (unit, counters) = unit(
            Duration::from_secs(120),
            Behavior::Sleep(Duration::from_secs(60)),
        );
        let mut scheduler = Scheduler::start(unit);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(scheduler.state(), UnitState::Running);

        scheduler.request_stop();
        assert_eq!(scheduler.state(), UnitState::StopRequested);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 0);

        scheduler.join(Duration::from_secs(120)).await.unwrap();
        assert_eq!(counters.completed.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.state(), UnitState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_sleep_is_prompt() {
        let (unit, counters) = unit(Duration::from_secs(3600), Behavior::Succeed);
        let mut scheduler = Scheduler::start(unit);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let start = tokio::time::Instant::now();
        scheduler.stop(Duration::from_secs(10)).await.unwrap();
        assert!(start.elapsed() < STOP_POLL_SLICE);
        assert_eq!(counters.passes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanently_disabled_is_terminal() {
        let (unit, counters) = unit(Duration::from_secs(1), Behavior::Disable);
        let mut scheduler = Scheduler::start(unit);

        let mut state = scheduler.subscribe();
        state
            .wait_for(|s| *s == UnitState::PermanentlyDisabled)
            .await
            .unwrap();

        scheduler.join(Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(counters.passes.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_failure_backs_off() {
        let (unit, counters) = unit(Duration::ZERO, Behavior::Fail);
        let mut scheduler = Scheduler::start(unit);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(counters.passes.load(Ordering::SeqCst), 4);

        scheduler.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_timeout_aborts_task() {
        let (unit, counters) = unit(Duration::from_secs(1), Behavior::IgnoreStop);
        let mut scheduler = Scheduler::start(unit);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = scheduler.stop(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::StopTimeout { .. }));
        assert!(scheduler.is_finished());
        assert_eq!(scheduler.state(), UnitState::Stopped);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 0);
    }
}
