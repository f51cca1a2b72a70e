//! Deadline timers ordered by absolute fire time.
//!
//! A [`TimerManager`] keeps its timers keyed by `(fire_at, id)`, so two
//! timers with the same deadline pop in creation order. Adding a timer
//! that becomes the new earliest deadline fires an installed waker once,
//! until [`TimerManager::next_timeout_ms`] re-reads the heap; the
//! reactor uses that to shorten a sleeping `epoll_wait`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::warn;
use once_cell::sync::OnceCell;

use crate::clock;

/// Shared closure type for timer callbacks; recurring timers fire the
/// same closure repeatedly.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// A realtime clock stepping back further than this flushes the heap.
/// Dead code under a monotonic source, which is what [`crate::clock`]
/// provides.
const ROLLOVER_GAP_MS: u64 = 60 * 60 * 1000;

struct TimerData {
    period_ms: u64,
    recurring: bool,
    cb: TimerCallback,
}

struct TimerQueue {
    /// Keyed by `(fire_at_ms, id)` for stable same-deadline order.
    queue: BTreeMap<(u64, u64), TimerData>,
    /// id to current fire time, for handle operations.
    deadlines: HashMap<u64, u64>,
    previous_now: u64,
    /// Earliest-changed waker armed at most once per front insertion.
    tickled: bool,
}

struct TimerCore {
    inner: Mutex<TimerQueue>,
    waker: OnceCell<Box<dyn Fn() + Send + Sync>>,
}

pub struct TimerManager {
    core: Arc<TimerCore>,
}

impl TimerManager {
    pub fn new() -> TimerManager {
        TimerManager {
            core: Arc::new(TimerCore {
                inner: Mutex::new(TimerQueue {
                    queue: BTreeMap::new(),
                    deadlines: HashMap::new(),
                    previous_now: clock::monotonic_ms(),
                    tickled: false,
                }),
                waker: OnceCell::new(),
            }),
        }
    }

    /// Install the earliest-deadline-changed notification. Effective
    /// once; later calls are ignored.
    pub(crate) fn set_waker(&self, waker: Box<dyn Fn() + Send + Sync>) {
        if self.core.waker.set(waker).is_err() {
            warn!("timer waker already installed");
        }
    }

    /// Queue a timer firing `period` from now. A recurring timer is
    /// re-queued at `now + period` after every fire.
    pub fn add_timer<F>(&self, period: Duration, f: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer_cb(period, Arc::new(f), recurring)
    }

    /// Timer whose callback is skipped if `cond` is gone at fire time.
    /// Lets object lifetime double as cancellation.
    pub fn add_conditional_timer<F, T>(
        &self,
        period: Duration,
        f: F,
        cond: Weak<T>,
        recurring: bool,
    ) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: ?Sized + Send + Sync + 'static,
    {
        self.add_timer(
            period,
            move || {
                if cond.upgrade().is_some() {
                    f()
                }
            },
            recurring,
        )
    }

    fn add_timer_cb(&self, period: Duration, cb: TimerCallback, recurring: bool) -> Timer {
        let id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
        let period_ms = period.as_millis() as u64;
        let fire_at = clock::monotonic_ms() + period_ms;
        let notify = {
            let mut q = self.core.inner.lock().unwrap();
            q.queue.insert(
                (fire_at, id),
                TimerData {
                    period_ms,
                    recurring,
                    cb,
                },
            );
            q.deadlines.insert(id, fire_at);
            let at_front = q.queue.keys().next().map(|k| k.1) == Some(id);
            if at_front && !q.tickled {
                q.tickled = true;
                true
            } else {
                false
            }
        };
        if notify {
            if let Some(waker) = self.core.waker.get() {
                waker();
            }
        }
        Timer {
            id,
            core: Arc::downgrade(&self.core),
        }
    }

    /// Milliseconds until the earliest deadline: 0 if already due,
    /// `u64::MAX` if no timers are queued.
    pub fn next_timeout_ms(&self) -> u64 {
        let mut q = self.core.inner.lock().unwrap();
        q.tickled = false;
        match q.queue.keys().next() {
            None => u64::MAX,
            Some(&(fire_at, _)) => fire_at.saturating_sub(clock::monotonic_ms()),
        }
    }

    /// True if any timer is queued.
    pub fn has_timers(&self) -> bool {
        !self.core.inner.lock().unwrap().queue.is_empty()
    }

    /// Pop every due timer's callback into `out`, re-queueing recurring
    /// timers at `now + period`.
    pub fn collect_expired(&self, out: &mut Vec<TimerCallback>) {
        let now = clock::monotonic_ms();
        let mut q = self.core.inner.lock().unwrap();
        if q.queue.is_empty() {
            q.previous_now = now;
            return;
        }
        let rollover = now < q.previous_now && q.previous_now - now > ROLLOVER_GAP_MS;
        q.previous_now = now;
        if rollover {
            warn!(
                "clock stepped back by over an hour, flushing {} timers",
                q.queue.len()
            );
        }
        loop {
            let key = match q.queue.keys().next() {
                Some(&key) => key,
                None => break,
            };
            if !rollover && key.0 > now {
                break;
            }
            let data = q.queue.remove(&key).expect("key just observed");
            out.push(data.cb.clone());
            if data.recurring {
                let fire_at = now + data.period_ms;
                q.deadlines.insert(key.1, fire_at);
                q.queue.insert((fire_at, key.1), data);
            } else {
                q.deadlines.remove(&key.1);
            }
        }
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a queued timer. Dropping the handle does not cancel the
/// timer.
pub struct Timer {
    id: u64,
    core: Weak<TimerCore>,
}

impl Timer {
    /// Remove the timer and drop its callback. Returns true the first
    /// time; later calls (or a cancel after firing) return false.
    pub fn cancel(&self) -> bool {
        let core = match self.core.upgrade() {
            Some(core) => core,
            None => return false,
        };
        let mut q = core.inner.lock().unwrap();
        let fire_at = match q.deadlines.remove(&self.id) {
            Some(fire_at) => fire_at,
            None => return false,
        };
        q.queue.remove(&(fire_at, self.id)).is_some()
    }

    /// Push the deadline out to `now + period`. Fails once the timer
    /// fired or was cancelled.
    pub fn refresh(&self) -> bool {
        let core = match self.core.upgrade() {
            Some(core) => core,
            None => return false,
        };
        let mut q = core.inner.lock().unwrap();
        let fire_at = match q.deadlines.get(&self.id) {
            Some(&fire_at) => fire_at,
            None => return false,
        };
        let data = match q.queue.remove(&(fire_at, self.id)) {
            Some(data) => data,
            None => return false,
        };
        let new_at = clock::monotonic_ms() + data.period_ms;
        q.deadlines.insert(self.id, new_at);
        q.queue.insert((new_at, self.id), data);
        true
    }

    /// Change the period. With `from_now` the deadline re-bases on the
    /// current instant; otherwise it is recomputed from the original
    /// start point.
    pub fn reset(&self, period: Duration, from_now: bool) -> bool {
        let period_ms = period.as_millis() as u64;
        let core = match self.core.upgrade() {
            Some(core) => core,
            None => return false,
        };
        let notify = {
            let mut q = core.inner.lock().unwrap();
            let fire_at = match q.deadlines.get(&self.id) {
                Some(&fire_at) => fire_at,
                None => return false,
            };
            let mut data = match q.queue.remove(&(fire_at, self.id)) {
                Some(data) => data,
                None => return false,
            };
            if data.period_ms == period_ms && !from_now {
                q.queue.insert((fire_at, self.id), data);
                return true;
            }
            let start = if from_now {
                clock::monotonic_ms()
            } else {
                fire_at - data.period_ms
            };
            data.period_ms = period_ms;
            let new_at = start + period_ms;
            q.deadlines.insert(self.id, new_at);
            q.queue.insert((new_at, self.id), data);
            let at_front = q.queue.keys().next() == Some(&(new_at, self.id));
            if at_front && !q.tickled {
                q.tickled = true;
                true
            } else {
                false
            }
        };
        if notify {
            if let Some(waker) = core.waker.get() {
                waker();
            }
        }
        true
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Timer").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread::sleep;

    fn drain(mgr: &TimerManager) -> usize {
        let mut out = Vec::new();
        mgr.collect_expired(&mut out);
        let n = out.len();
        for cb in out {
            cb();
        }
        n
    }

    #[test]
    fn expires_in_deadline_order() {
        let mgr = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for &(label, period) in [("b", 30u64), ("a", 5)].iter() {
            let order = order.clone();
            mgr.add_timer(
                Duration::from_millis(period),
                move || order.lock().unwrap().push(label),
                false,
            );
        }
        sleep(Duration::from_millis(15));
        assert_eq!(drain(&mgr), 1);
        assert_eq!(*order.lock().unwrap(), vec!["a"]);
        sleep(Duration::from_millis(30));
        assert_eq!(drain(&mgr), 1);
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
        assert!(!mgr.has_timers());
    }

    #[test]
    fn same_deadline_pops_in_creation_order() {
        let mgr = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second", "third"].iter() {
            let order = order.clone();
            let label = *label;
            mgr.add_timer(
                Duration::from_millis(5),
                move || order.lock().unwrap().push(label),
                false,
            );
        }
        sleep(Duration::from_millis(20));
        assert_eq!(drain(&mgr), 3);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn never_pops_a_future_timer() {
        let mgr = TimerManager::new();
        mgr.add_timer(Duration::from_millis(60_000), || {}, false);
        assert_eq!(drain(&mgr), 0);
        assert!(mgr.has_timers());
        let next = mgr.next_timeout_ms();
        assert!(next > 0 && next <= 60_000);
    }

    #[test]
    fn recurring_timer_requeues() {
        let mgr = TimerManager::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = ticks.clone();
        let timer = mgr.add_timer(
            Duration::from_millis(5),
            move || {
                t.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );
        sleep(Duration::from_millis(15));
        assert_eq!(drain(&mgr), 1);
        sleep(Duration::from_millis(15));
        assert_eq!(drain(&mgr), 1);
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        assert!(timer.cancel());
        assert!(!mgr.has_timers());
    }

    #[test]
    fn cancel_is_idempotent() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(Duration::from_millis(60_000), || {}, false);
        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert!(!mgr.has_timers());
    }

    #[test]
    fn cancel_after_fire_returns_false() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(Duration::from_millis(1), || {}, false);
        sleep(Duration::from_millis(10));
        assert_eq!(drain(&mgr), 1);
        assert!(!timer.cancel());
    }

    #[test]
    fn refresh_pushes_the_deadline_out() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(Duration::from_millis(30), || {}, false);
        sleep(Duration::from_millis(20));
        assert!(timer.refresh());
        sleep(Duration::from_millis(15));
        // 35ms in, but refreshed at 20ms for another 30
        assert_eq!(drain(&mgr), 0);
        sleep(Duration::from_millis(25));
        assert_eq!(drain(&mgr), 1);
        assert!(!timer.refresh());
    }

    #[test]
    fn reset_changes_the_period() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(Duration::from_millis(60_000), || {}, false);
        assert!(timer.reset(Duration::from_millis(5), true));
        sleep(Duration::from_millis(20));
        assert_eq!(drain(&mgr), 1);
        assert!(!timer.reset(Duration::from_millis(5), true));
    }

    #[test]
    fn conditional_timer_skips_dropped_condition() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let cond = Arc::new(());
        let f = fired.clone();
        mgr.add_conditional_timer(
            Duration::from_millis(5),
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
            Arc::downgrade(&cond),
            false,
        );
        drop(cond);

        let alive = Arc::new(());
        let f = fired.clone();
        mgr.add_conditional_timer(
            Duration::from_millis(5),
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
            Arc::downgrade(&alive),
            false,
        );

        sleep(Duration::from_millis(20));
        assert_eq!(drain(&mgr), 2);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        drop(alive);
    }

    #[test]
    fn waker_fires_on_new_front_timer() {
        let mgr = TimerManager::new();
        let wakes = Arc::new(AtomicUsize::new(0));
        let w = wakes.clone();
        mgr.set_waker(Box::new(move || {
            w.fetch_add(1, Ordering::SeqCst);
        }));
        mgr.add_timer(Duration::from_millis(60_000), || {}, false);
        assert_eq!(wakes.load(Ordering::SeqCst), 1);
        // not at the front, no wake
        mgr.add_timer(Duration::from_millis(120_000), || {}, false);
        assert_eq!(wakes.load(Ordering::SeqCst), 1);
        // new front, but the latch only re-arms after a timeout read
        mgr.add_timer(Duration::from_millis(30_000), || {}, false);
        assert_eq!(wakes.load(Ordering::SeqCst), 1);
        mgr.next_timeout_ms();
        mgr.add_timer(Duration::from_millis(10_000), || {}, false);
        assert_eq!(wakes.load(Ordering::SeqCst), 2);
    }
}
