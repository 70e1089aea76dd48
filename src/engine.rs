//! The pulse engine.
//!
//! Three independent drivers touch the same state:
//!
//! | Driver | Period | Effect |
//! |--------|--------|--------|
//! | sample stream | sensor-determined | classify, merge one pulse |
//! | heartbeat | `heartbeat_interval_ms` | merge a synthetic resting pulse while the anchor is held |
//! | flush | `flush_interval_ms` | drain the grid, hand the batch to the uploader |
//!
//! The anchor and the grid live behind one mutex, so a merge lands entirely
//! before or entirely after any drain. The flush driver only holds the lock for
//! the drain itself; the upload runs as a detached task.
//!
//! Lifecycle: `Stopped -> Tracking` on [`Engine::start`], `Tracking -> Stopped` on
//! [`Engine::stop`]. The flush timer is independent of tracking and runs from
//! [`Engine::start_flushing`] (or [`Engine::init`]) until [`Engine::shutdown`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use tokio::task::JoinHandle;

use crate::classifier::{MotionClassifier, StationaryAnchor};
use crate::config::{ConfigChange, ConfigSource, EngineConfig, RemoteConfig};
use crate::grid::{GridAggregator, GridCell};
use crate::scheduler::{Clock, PeriodicTimer, Scheduler, SystemClock, TickFn, TokioScheduler};
use crate::upload::{BatchSink, CircuitBreaker, PendingBatch};
use crate::{GpsPoint, Sample, SensorError};

/// Counters since the engine was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct EngineStats {
    pub samples_accepted: u64,
    pub samples_dropped: u64,
    pub sensor_errors: u64,
    pub pulses_merged: u64,
    pub heartbeat_pulses: u64,
    pub batches_sent: u64,
    pub batches_failed: u64,
    /// Batches drained while no credential was held
    pub batches_discarded_unauthenticated: u64,
    /// Cells waiting for the next flush
    pub pending_cells: u64,
}

#[derive(Debug, Default)]
struct EngineCounters {
    samples_accepted: AtomicU64,
    samples_dropped: AtomicU64,
    sensor_errors: AtomicU64,
    pulses_merged: AtomicU64,
    heartbeat_pulses: AtomicU64,
}

struct EngineState {
    config: EngineConfig,
    classifier: MotionClassifier,
    grid: GridAggregator,
    tracking: bool,
}

#[derive(Default)]
struct Timers {
    heartbeat: Option<PeriodicTimer>,
    flush: Option<PeriodicTimer>,
    subscription: Option<JoinHandle<()>>,
}

struct Inner {
    state: Mutex<EngineState>,
    timers: Mutex<Timers>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    breaker: CircuitBreaker,
    counters: EngineCounters,
}

/// Handle to a pulse engine. Clones share the same engine; the last handle
/// to drop shuts it down.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Create an engine on the wall clock with tokio timers.
    pub fn new(config: EngineConfig, sink: Arc<dyn BatchSink>) -> Self {
        Self::with_timing(config, sink, Arc::new(SystemClock), Arc::new(TokioScheduler))
    }

    /// Create an engine with an explicit clock and scheduler.
    pub fn with_timing(
        config: EngineConfig,
        sink: Arc<dyn BatchSink>,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(EngineState {
                    config,
                    classifier: MotionClassifier::new(),
                    grid: GridAggregator::new(),
                    tracking: false,
                }),
                timers: Mutex::new(Timers::default()),
                clock,
                scheduler,
                breaker: CircuitBreaker::new(sink),
                counters: EngineCounters::default(),
            }),
        }
    }

    /// Start the flush timer and load remote config.
    ///
    /// The timer starts on the current config so flushing never waits on the
    /// network; a changed flush interval restarts it.
    pub async fn init(&self, source: &dyn ConfigSource) -> Option<ConfigChange> {
        self.start_flushing();
        self.load_remote_config(source).await
    }

    /// Fetch and apply remote config. On failure the current values stay.
    pub async fn load_remote_config(&self, source: &dyn ConfigSource) -> Option<ConfigChange> {
        match source.fetch().await {
            Ok(remote) => Some(self.apply_remote_config(&remote)),
            Err(e) => {
                warn!("[Engine] config load failed, keeping defaults: {}", e);
                None
            }
        }
    }

    pub fn apply_remote_config(&self, remote: &RemoteConfig) -> ConfigChange {
        let (change, flush_ms) = {
            let mut state = self.inner.lock_state();
            let change = state.config.apply(remote);
            (change, state.config.flush_interval_ms)
        };

        if change.flush_interval_changed {
            let mut timers = self.inner.lock_timers();
            if let Some(flush) = timers.flush.as_mut() {
                flush.set_period(Duration::from_millis(flush_ms));
                info!("[Engine] flush timer now every {}ms", flush_ms);
            }
        }
        change
    }

    /// Start the flush timer. Idempotent.
    pub fn start_flushing(&self) {
        let period = Duration::from_millis(self.inner.lock_state().config.flush_interval_ms);
        let mut timers = self.inner.lock_timers();
        let inner = &self.inner;
        let flush = timers.flush.get_or_insert_with(|| {
            let tick = tick_fn(inner, |inner| {
                // Fire-and-forget
                let _ = inner.flush();
            });
            PeriodicTimer::new("flush", Arc::clone(&inner.scheduler), period, tick)
        });
        flush.start();
    }

    /// Begin a tracking session fed by `samples`.
    ///
    /// Starts a fresh anchor and the heartbeat timer. Calling `start` while
    /// already tracking replaces the subscription. Must be called inside a
    /// tokio runtime.
    pub fn start<S>(&self, samples: S)
    where
        S: Stream<Item = Result<Sample, SensorError>> + Send + 'static,
    {
        let mut timers = self.inner.lock_timers();
        if let Some(previous) = timers.subscription.take() {
            previous.abort();
        }

        let heartbeat_period = {
            let mut state = self.inner.lock_state();
            state.classifier.reset();
            state.tracking = true;
            Duration::from_millis(state.config.heartbeat_interval_ms)
        };

        let inner = &self.inner;
        let heartbeat = timers.heartbeat.get_or_insert_with(|| {
            let tick = tick_fn(inner, Inner::heartbeat_tick);
            PeriodicTimer::new("heartbeat", Arc::clone(&inner.scheduler), heartbeat_period, tick)
        });
        heartbeat.set_period(heartbeat_period);
        heartbeat.start();

        let weak = Arc::downgrade(&self.inner);
        timers.subscription = Some(tokio::spawn(consume(weak, samples)));
        info!("[Engine] tracking started");
    }

    /// End the tracking session. Safe to call repeatedly or before `start`.
    pub fn stop(&self) {
        let mut timers = self.inner.lock_timers();
        let was_tracking = std::mem::replace(&mut self.inner.lock_state().tracking, false);

        if let Some(subscription) = timers.subscription.take() {
            subscription.abort();
        }
        if let Some(heartbeat) = timers.heartbeat.as_mut() {
            heartbeat.stop();
        }

        if was_tracking {
            info!("[Engine] tracking stopped");
        }
    }

    /// Stop tracking and the flush timer. Cells still in the grid are not flushed.
    pub fn shutdown(&self) {
        self.stop();
        if let Some(flush) = self.inner.lock_timers().flush.as_mut() {
            flush.stop();
        }
        info!("[Engine] shut down");
    }

    /// Feed one sample directly. Ignored unless tracking.
    pub fn ingest(&self, sample: Sample) {
        self.inner.ingest(sample);
    }

    /// Record a failure from the location provider. The engine keeps running.
    pub fn report_sensor_error(&self, error: &SensorError) {
        self.inner.sensor_error(error);
    }

    /// Run one flush tick now.
    ///
    /// Returns the spawned upload task, if an upload was attempted. Must be
    /// called inside a tokio runtime.
    pub fn flush_now(&self) -> Option<JoinHandle<()>> {
        self.inner.flush()
    }

    /// Set or clear the upload credential.
    pub fn set_credential(&self, token: Option<String>) {
        self.inner.breaker.credentials().set(token);
    }

    pub fn is_tracking(&self) -> bool {
        self.inner.lock_state().tracking
    }

    pub fn config(&self) -> EngineConfig {
        self.inner.lock_state().config.clone()
    }

    pub fn anchor(&self) -> Option<StationaryAnchor> {
        self.inner.lock_state().classifier.anchor()
    }

    pub fn last_known_position(&self) -> Option<GpsPoint> {
        self.inner.lock_state().classifier.last_known_position()
    }

    /// Copy of the cells awaiting flush, without draining them.
    pub fn snapshot(&self) -> Vec<GridCell> {
        self.inner.lock_state().grid.cells().to_vec()
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.inner.counters;
        let uploads = self.inner.breaker.counters();
        EngineStats {
            samples_accepted: c.samples_accepted.load(Ordering::Relaxed),
            samples_dropped: c.samples_dropped.load(Ordering::Relaxed),
            sensor_errors: c.sensor_errors.load(Ordering::Relaxed),
            pulses_merged: c.pulses_merged.load(Ordering::Relaxed),
            heartbeat_pulses: c.heartbeat_pulses.load(Ordering::Relaxed),
            batches_sent: uploads.sent.load(Ordering::Relaxed),
            batches_failed: uploads.failed.load(Ordering::Relaxed),
            batches_discarded_unauthenticated: uploads.unauthenticated.load(Ordering::Relaxed),
            pending_cells: self.inner.lock_state().grid.len() as u64,
        }
    }
}

/// Wrap an engine callback for a timer. The timer holds only a weak
/// reference so a dropped engine is not kept alive by its own timers.
fn tick_fn(inner: &Arc<Inner>, f: fn(&Inner)) -> TickFn {
    let weak = Arc::downgrade(inner);
    Arc::new(move || {
        if let Some(inner) = weak.upgrade() {
            f(&inner);
        }
    })
}

async fn consume<S>(weak: Weak<Inner>, samples: S)
where
    S: Stream<Item = Result<Sample, SensorError>> + Send + 'static,
{
    let mut samples = Box::pin(samples);
    while let Some(item) = samples.next().await {
        let Some(inner) = weak.upgrade() else { break };
        match item {
            Ok(sample) => inner.ingest(sample),
            Err(e) => inner.sensor_error(&e),
        }
    }
    debug!("[Engine] sample stream ended");
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_timers(&self) -> MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ingest(&self, sample: Sample) {
        let mut guard = self.lock_state();
        if !guard.tracking {
            debug!("[Engine] not tracking, ignoring sample");
            return;
        }
        let now = self.clock.now_ms();
        let state = &mut *guard;
        match state.classifier.classify(&sample, now, &state.config) {
            Some(pulse) => {
                state.grid.merge(&pulse);
                self.counters.samples_accepted.fetch_add(1, Ordering::Relaxed);
                self.counters.pulses_merged.fetch_add(1, Ordering::Relaxed);
                debug!("[Engine] {} pulse at {:.6},{:.6}", pulse.kind, pulse.latitude, pulse.longitude);
            }
            None => {
                self.counters.samples_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn sensor_error(&self, error: &SensorError) {
        self.counters.sensor_errors.fetch_add(1, Ordering::Relaxed);
        warn!("[Engine] sensor error, sample skipped: {}", error);
    }

    fn heartbeat_tick(&self) {
        let mut guard = self.lock_state();
        if !guard.tracking {
            return;
        }
        let now = self.clock.now_ms();
        let state = &mut *guard;
        if let Some(pulse) = state.classifier.heartbeat(now, &state.config) {
            state.grid.merge(&pulse);
            self.counters.heartbeat_pulses.fetch_add(1, Ordering::Relaxed);
            self.counters.pulses_merged.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn flush(&self) -> Option<JoinHandle<()>> {
        let batch = {
            let mut state = self.lock_state();
            if state.grid.is_empty() {
                return None;
            }
            PendingBatch::new(state.grid.drain(), self.clock.now_ms())
        };
        debug!("[Engine] drained {} cells for upload", batch.len());
        self.breaker.dispatch(batch)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let timers = self.timers.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(subscription) = timers.subscription.take() {
            subscription.abort();
        }
        // PeriodicTimer cancels itself on drop
    }
}
