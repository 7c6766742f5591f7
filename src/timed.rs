use crate::bag::PartitionedBag;
use crate::cleaner::Cleanable;
use crate::error::{ReclaimError, Result, positive};
use crate::expiry::{ExpiryService, Tracker};
use crate::slot::ArcSlot;
use crate::sync::{AtomicBool, AtomicU64, Ordering};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// An entry the expiry sweep can demote. Implemented by every `TimedEntry<T>`
/// so one tracked bag serves all referent types.
pub(crate) trait Expirable: Send + Sync {
    /// Expiry deadline in milliseconds since the tracker's epoch.
    fn expires_at(&self) -> u64;

    /// Demote an entry the sweep has just removed from `live`.
    ///
    /// An entry touched after it was selected is promoted back and re-added;
    /// returns `true` only when the entry really became weak.
    fn expire(self: Arc<Self>, now: u64, live: &PartitionedBag<dyn Expirable>) -> bool;

    /// Demote unconditionally. The caller has already removed the entry from
    /// the tracked bag.
    fn release(&self);
}

pub(crate) struct TimedEntry<T> {
    weak: Weak<T>,
    /// Populated while the entry is Strong.
    strong: ArcSlot<T>,
    expires_at: AtomicU64,
    delay_millis: u64,
    /// Whether the entry is (about to be) in the tracked bag.
    tracked: AtomicBool,
    tracker: Weak<Tracker>,
    /// Untracks the entry once the referent is gone.
    cleanup: Cleanable,
}

impl<T> Drop for TimedEntry<T> {
    fn drop(&mut self) {
        self.cleanup.cancel();
    }
}

impl<T: Send + Sync + 'static> TimedEntry<T> {
    /// Put this entry in the tracked bag unless it already is.
    fn track(self: &Arc<Self>, live: &PartitionedBag<dyn Expirable>) {
        if !self.tracked.swap(true, Ordering::SeqCst) {
            let entry: Arc<dyn Expirable> = self.clone();
            live.add(entry);
        }
    }

    fn as_expirable(self: &Arc<Self>) -> Arc<dyn Expirable> {
        self.clone()
    }
}

impl<T: Send + Sync + 'static> Expirable for TimedEntry<T> {
    #[inline]
    fn expires_at(&self) -> u64 {
        self.expires_at.load(Ordering::SeqCst)
    }

    fn expire(self: Arc<Self>, now: u64, live: &PartitionedBag<dyn Expirable>) -> bool {
        self.tracked.store(false, Ordering::SeqCst);
        let previous = self.strong.take();
        if self.expires_at.load(Ordering::SeqCst) > now {
            // A `get()` refreshed the deadline after the sweep picked us.
            if let Some(referent) = previous.or_else(|| self.weak.upgrade()) {
                self.strong.put(referent);
            }
            self.track(live);
            return false;
        }
        drop(previous);
        true
    }

    fn release(&self) {
        self.tracked.store(false, Ordering::SeqCst);
        drop(self.strong.take());
    }
}

/// A reference that keeps its referent alive for a sliding time window.
///
/// A `TimedWeakRef` starts **Strong**: it holds the referent in addition to a
/// `Weak`. Every successful `get()` pushes the deadline `delay` into the future.
/// Once the deadline passes without a `get()`, the service's periodic sweep
/// demotes it to **Weak**: only the `Weak` remains and the referent is freed as
/// soon as nothing else holds it. A `get()` on a Weak entry whose referent is
/// still alive promotes it back to Strong.
///
/// Clones share the same entry.
///
/// **Typical Usage**:
/// ```
/// use lockless_reclaim::{ExpiryService, TimedWeakRef};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let service = ExpiryService::new().unwrap();
/// let reference = TimedWeakRef::create(&service, Arc::new(7u32), Duration::from_secs(60)).unwrap();
///
/// // The referent is kept alive by the reference itself.
/// assert_eq!(reference.get().as_deref(), Some(&7));
/// assert!(reference.is_strong());
///
/// reference.discard();
/// assert!(!reference.is_strong());
/// assert!(reference.get().is_none());
/// ```
///
/// 一个在滑动时间窗口内保持被引用对象存活的引用。
///
/// `TimedWeakRef` 初始为**强**状态：除 `Weak` 外还持有被引用对象。
/// 每次成功的 `get()` 都会把截止时间推迟 `delay`。截止时间过去且没有 `get()` 时，
/// 服务的周期性扫描将其降级为**弱**状态：只保留 `Weak`，一旦没有其他持有者，
/// 被引用对象就会被释放。对被引用对象仍然存活的弱条目调用 `get()` 会将其重新提升为强状态。
pub struct TimedWeakRef<T: Send + Sync + 'static> {
    entry: Arc<TimedEntry<T>>,
}

impl<T: Send + Sync + 'static> TimedWeakRef<T> {
    /// Create a Strong reference to `referent`, expiring `delay` after its
    /// last access.
    ///
    /// A zero `delay` is rejected; delays below the service's minimum entry
    /// delay are raised to it. Fails with `ShutDown` after the service has
    /// been shut down.
    ///
    /// 创建对 `referent` 的强引用，在最后一次访问 `delay` 之后过期。
    pub fn create(service: &ExpiryService, referent: Arc<T>, delay: Duration) -> Result<Self> {
        Self::build(service, referent, delay, None)
    }

    /// Like `create`, and runs `on_cleared` on the service's cleaner thread once
    /// the referent has been dropped.
    ///
    /// 与 `create` 相同，并在被引用对象被 drop 后于服务的清理线程上运行 `on_cleared`。
    pub fn create_with_cleanup<F>(
        service: &ExpiryService,
        referent: Arc<T>,
        delay: Duration,
        on_cleared: F,
    ) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(service, referent, delay, Some(Box::new(on_cleared)))
    }

    fn build(
        service: &ExpiryService,
        referent: Arc<T>,
        delay: Duration,
        on_cleared: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<Self> {
        let delay = positive("entry delay", delay)?;
        let tracker = service.tracker();
        if tracker.is_shut_down() {
            return Err(ReclaimError::ShutDown);
        }
        let delay = delay.max(tracker.config.minimum_entry_delay);
        let delay_millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);

        let cleaner = service.cleaner();
        let weak_tracker = Arc::downgrade(tracker);
        let entry = Arc::new_cyclic(|weak_entry: &Weak<TimedEntry<T>>| {
            let weak_entry = weak_entry.clone();
            let cleanup = cleaner.register(&referent, move || {
                if let (Some(entry), Some(tracker)) = (weak_entry.upgrade(), weak_tracker.upgrade())
                {
                    tracker.live.remove(&entry.as_expirable());
                }
                if let Some(on_cleared) = on_cleared {
                    on_cleared();
                }
            });
            TimedEntry {
                weak: Arc::downgrade(&referent),
                strong: ArcSlot::new(referent.clone()),
                expires_at: AtomicU64::new(tracker.now_millis().saturating_add(delay_millis)),
                delay_millis,
                tracked: AtomicBool::new(false),
                tracker: Arc::downgrade(tracker),
                cleanup,
            }
        });
        entry.track(&tracker.live);

        Ok(Self { entry })
    }

    /// The referent, or `None` once it has been dropped.
    ///
    /// Touches the entry: the deadline is refreshed, the entry becomes Strong
    /// and is tracked again if it had been swept. After the service shut down
    /// this is a plain weak upgrade.
    ///
    /// 返回被引用对象，若其已被 drop 则返回 `None`。
    /// 同时"触碰"该条目：刷新截止时间，使其变为强状态，若已被扫描移除则重新跟踪。
    pub fn get(&self) -> Option<Arc<T>> {
        let referent = self.entry.weak.upgrade()?;
        let Some(tracker) = self.entry.tracker.upgrade() else {
            return Some(referent);
        };
        if tracker.is_shut_down() {
            return Some(referent);
        }

        let deadline = tracker.now_millis().saturating_add(self.entry.delay_millis);
        self.entry.expires_at.store(deadline, Ordering::SeqCst);
        if !self.entry.strong.is_some() {
            self.entry.strong.put(referent.clone());
        }
        self.entry.track(&tracker.live);

        // Lost a race with shutdown: don't stay pinned in a drained bag.
        if tracker.is_shut_down() {
            tracker.live.remove(&self.entry.as_expirable());
            self.entry.release();
        }
        Some(referent)
    }

    /// Demote to Weak now and stop tracking, regardless of the deadline.
    ///
    /// A later `get()` still succeeds while something else keeps the referent
    /// alive.
    ///
    /// 立即降级为弱状态并停止跟踪，不考虑截止时间。
    pub fn discard(&self) {
        if let Some(tracker) = self.entry.tracker.upgrade() {
            tracker.live.remove(&self.entry.as_expirable());
        }
        self.entry.release();
    }

    /// Whether the reference currently keeps its referent alive.
    /// 该引用当前是否保持被引用对象存活。
    #[inline]
    pub fn is_strong(&self) -> bool {
        self.entry.strong.is_some()
    }

    /// Whether the entry is in the service's tracked set.
    pub fn is_tracked(&self) -> bool {
        self.entry
            .tracker
            .upgrade()
            .is_some_and(|tracker| tracker.live.contains(&self.entry.as_expirable()))
    }

    /// Effective delay, after clamping to the service minimum.
    #[inline]
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.entry.delay_millis)
    }

    /// Whether both references share the same entry.
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }
}

impl<T: Send + Sync + 'static> Clone for TimedWeakRef<T> {
    fn clone(&self) -> Self {
        Self {
            entry: self.entry.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for TimedWeakRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedWeakRef")
            .field("strong", &self.is_strong())
            .field("delay", &self.delay())
            .field("expires_at", &self.entry.expires_at())
            .finish()
    }
}
