//! Clocks and periodic timers.
//!
//! The engine never calls `tokio::time` or the system clock directly. It reads
//! time from a [`Clock`] and runs its heartbeat and flush loops through a
//! [`Scheduler`], so both can be replaced by a [`VirtualClock`] that only moves
//! when told to.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::debug;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Callback run on every timer tick
pub type TickFn = Arc<dyn Fn() + Send + Sync>;

/// Source of "now" in Unix epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A running periodic task, stopped by [`ScheduledTask::cancel`].
pub trait ScheduledTask: Send {
    fn cancel(&mut self);
}

/// Runs callbacks on a fixed period.
pub trait Scheduler: Send + Sync {
    /// Run `tick` every `period`, first firing one full period from now.
    fn every(&self, period: Duration, tick: TickFn) -> Box<dyn ScheduledTask>;
}

// ============================================================================
// Tokio
// ============================================================================

/// Scheduler backed by `tokio::time::interval`. Must be used inside a runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

struct TokioTask(JoinHandle<()>);

impl ScheduledTask for TokioTask {
    fn cancel(&mut self) {
        self.0.abort();
    }
}

impl Scheduler for TokioScheduler {
    fn every(&self, period: Duration, tick: TickFn) -> Box<dyn ScheduledTask> {
        // interval() panics on a zero period
        let period = period.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick();
            }
        });
        Box::new(TokioTask(handle))
    }
}

// ============================================================================
// Periodic Timer
// ============================================================================

/// A restartable periodic timer.
///
/// `start` and `stop` are idempotent. Dropping the timer stops it.
pub struct PeriodicTimer {
    name: &'static str,
    scheduler: Arc<dyn Scheduler>,
    period: Duration,
    tick: TickFn,
    task: Option<Box<dyn ScheduledTask>>,
}

impl PeriodicTimer {
    pub fn new(name: &'static str, scheduler: Arc<dyn Scheduler>, period: Duration, tick: TickFn) -> Self {
        Self { name, scheduler, period, tick, task: None }
    }

    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        debug!("[Timer {}] start, period {:?}", self.name, self.period);
        self.task = Some(self.scheduler.every(self.period, Arc::clone(&self.tick)));
    }

    pub fn stop(&mut self) {
        if let Some(mut task) = self.task.take() {
            debug!("[Timer {}] stop", self.name);
            task.cancel();
        }
    }

    /// Change the period. A running timer is restarted so the new period
    /// takes effect immediately.
    pub fn set_period(&mut self, period: Duration) {
        if period == self.period {
            return;
        }
        self.period = period;
        if self.task.is_some() {
            self.stop();
            self.start();
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Virtual Clock
// ============================================================================

/// A manually driven clock that is also a scheduler.
///
/// Time only moves through [`VirtualClock::advance`] / [`VirtualClock::advance_to`],
/// which fire every timer that falls due on the way, in due-time order. Ticks
/// run on the caller's thread with no internal lock held, so a tick may start
/// or cancel timers.
pub struct VirtualClock {
    state: Mutex<VirtualState>,
}

struct VirtualState {
    now_ms: i64,
    next_id: u64,
    timers: Vec<VirtualTimer>,
}

struct VirtualTimer {
    id: u64,
    period_ms: i64,
    next_due: i64,
    tick: TickFn,
    cancelled: Arc<AtomicBool>,
}

struct VirtualTask {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledTask for VirtualTask {
    fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl VirtualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            state: Mutex::new(VirtualState { now_ms: start_ms, next_id: 0, timers: Vec::new() }),
        }
    }

    pub fn advance(&self, by: Duration) {
        let target = self.now_ms() + by.as_millis() as i64;
        self.advance_to(target);
    }

    /// Move time forward to `target_ms`, firing due timers. Never moves backwards.
    pub fn advance_to(&self, target_ms: i64) {
        loop {
            let due = {
                let mut guard = self.lock();
                let state = &mut *guard;
                state.timers.retain(|t| !t.cancelled.load(Ordering::SeqCst));

                let next = state
                    .timers
                    .iter_mut()
                    .filter(|t| t.next_due <= target_ms)
                    .min_by_key(|t| (t.next_due, t.id));

                match next {
                    Some(timer) => {
                        let fire_at = timer.next_due;
                        timer.next_due += timer.period_ms;
                        let fired = (Arc::clone(&timer.tick), Arc::clone(&timer.cancelled));
                        state.now_ms = state.now_ms.max(fire_at);
                        Some(fired)
                    }
                    None => {
                        state.now_ms = state.now_ms.max(target_ms);
                        None
                    }
                }
            };

            match due {
                Some((tick, cancelled)) => {
                    if !cancelled.load(Ordering::SeqCst) {
                        tick();
                    }
                }
                None => break,
            }
        }
    }

    /// Number of timers that have not been cancelled.
    pub fn active_timers(&self) -> usize {
        self.lock()
            .timers
            .iter()
            .filter(|t| !t.cancelled.load(Ordering::SeqCst))
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VirtualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clock for VirtualClock {
    fn now_ms(&self) -> i64 {
        self.lock().now_ms
    }
}

impl Scheduler for VirtualClock {
    fn every(&self, period: Duration, tick: TickFn) -> Box<dyn ScheduledTask> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut state = self.lock();
        let period_ms = (period.as_millis() as i64).max(1);
        let id = state.next_id;
        state.next_id += 1;
        let next_due = state.now_ms + period_ms;
        state.timers.push(VirtualTimer {
            id,
            period_ms,
            next_due,
            tick,
            cancelled: Arc::clone(&cancelled),
        });
        Box::new(VirtualTask { cancelled })
    }
}
