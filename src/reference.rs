use crate::bag::PartitionedBag;
use crate::error::{QueueError, Result};
use crossbeam_channel::{Receiver, Sender, bounded, select, unbounded};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// A referent tracked by a `ReferenceQueue`, with the payload to deliver once
/// the referent has no strong references left.
struct Registration<R> {
    referent: Weak<dyn Any + Send + Sync>,
    payload: R,
}

/// A registration handed back by `ReferenceQueue::register` and delivered by
/// `poll`/`remove` once its referent is gone.
///
/// `ReferenceQueue::register` 返回的注册项，在其被引用对象消失后由
/// `poll`/`remove` 交付。
pub struct Reference<R>(Arc<Registration<R>>);

impl<R> Reference<R> {
    #[inline]
    pub fn payload(&self) -> &R {
        &self.0.payload
    }

    /// Whether the referent has no strong references left.
    /// 被引用对象是否已没有强引用。
    #[inline]
    pub fn is_cleared(&self) -> bool {
        self.0.referent.strong_count() == 0
    }
}

impl<R> Clone for Reference<R> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<R: fmt::Debug> fmt::Debug for Reference<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reference")
            .field("payload", &self.0.payload)
            .field("cleared", &self.is_cleared())
            .finish()
    }
}

/// A notification queue for referents that became unreachable.
///
/// Referents are `Arc`s; the queue keeps only a `Weak` to each of them. A
/// *collection pass* (`collect()`) moves every registration whose referent has
/// no strong references left from the pending set into the ready queue, where
/// `poll()` and `remove()` pick it up. `remove()` runs a pass itself before it
/// waits, so a single consumer blocking on `remove(interval)` observes a dropped
/// referent within roughly one interval.
///
/// Pending registrations live in a `PartitionedBag`, so registering and
/// unregistering never block.
///
/// **Typical Usage**:
/// ```
/// use lockless_reclaim::ReferenceQueue;
/// use std::sync::Arc;
///
/// let queue = ReferenceQueue::new();
/// let owner = Arc::new(42u32);
/// queue.register(&owner, "owner gone");
/// assert!(queue.poll().is_none());
///
/// drop(owner);
/// let cleared = queue.poll().unwrap();
/// assert_eq!(*cleared.payload(), "owner gone");
/// ```
///
/// 不可达引用对象的通知队列。
///
/// 被引用对象是 `Arc`，队列只保留其 `Weak`。一次*回收扫描*（`collect()`）
/// 将所有被引用对象已无强引用的注册项从待处理集合移入就绪队列，
/// 由 `poll()` 和 `remove()` 取出。`remove()` 在等待前会自行执行一次扫描。
pub struct ReferenceQueue<R> {
    pending: PartitionedBag<Registration<R>>,
    ready_tx: Sender<Reference<R>>,
    ready_rx: Receiver<Reference<R>>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl<R: Send + Sync + 'static> ReferenceQueue<R> {
    pub fn new() -> Self {
        Self::from_bag(PartitionedBag::new())
    }

    /// Create a queue whose pending set uses `partitions` partitions.
    pub fn with_partitions(partitions: usize) -> Result<Self> {
        Ok(Self::from_bag(PartitionedBag::with_partitions(partitions)?))
    }

    fn from_bag(pending: PartitionedBag<Registration<R>>) -> Self {
        let (ready_tx, ready_rx) = unbounded();
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            pending,
            ready_tx,
            ready_rx,
            wake_tx,
            wake_rx,
        }
    }

    /// Track `referent`; `payload` is delivered once it becomes unreachable.
    ///
    /// 跟踪 `referent`；当其不可达时交付 `payload`。
    pub fn register<O>(&self, referent: &Arc<O>, payload: R) -> Reference<R>
    where
        O: Send + Sync + 'static,
    {
        let weak: Weak<O> = Arc::downgrade(referent);
        let weak: Weak<dyn Any + Send + Sync> = weak;
        let registration = Arc::new(Registration {
            referent: weak,
            payload,
        });
        self.pending.add(registration.clone());
        Reference(registration)
    }

    /// Stop tracking a registration that has not been delivered yet.
    ///
    /// Returns `false` if it was already moved to the ready queue (or was never
    /// pending), in which case it will still be delivered.
    pub fn unregister(&self, reference: &Reference<R>) -> bool {
        self.pending.remove(&reference.0)
    }

    /// Run a collection pass, returning how many references became ready.
    ///
    /// 执行一次回收扫描，返回变为就绪的引用数量。
    pub fn collect(&self) -> usize {
        let cleared = self
            .pending
            .removing(|registration| registration.referent.strong_count() == 0);
        let count = cleared.len();
        for registration in cleared {
            // Both channel ends live in `self`, so the send cannot fail.
            let _ = self.ready_tx.send(Reference(registration));
        }
        count
    }

    /// Non-blocking: the next ready reference, running a collection pass when
    /// none is queued.
    ///
    /// 非阻塞：返回下一个就绪引用，若队列为空则先执行一次回收扫描。
    pub fn poll(&self) -> Option<Reference<R>> {
        if let Ok(reference) = self.ready_rx.try_recv() {
            return Some(reference);
        }
        if self.collect() == 0 {
            return None;
        }
        self.ready_rx.try_recv().ok()
    }

    /// Non-blocking: the next reference already in the ready queue. Never runs
    /// a collection pass, so it costs the same however many registrations are
    /// pending.
    ///
    /// 非阻塞：返回就绪队列中的下一个引用，不执行回收扫描。
    pub fn poll_ready(&self) -> Option<Reference<R>> {
        self.ready_rx.try_recv().ok()
    }

    /// Blocking: wait up to `timeout` for a ready reference.
    ///
    /// Returns `QueueError::Interrupted` when `interrupt()` is called while
    /// waiting (or was called since the previous wait).
    ///
    /// 阻塞：最多等待 `timeout` 以获取就绪引用。
    /// 等待期间调用 `interrupt()` 时返回 `QueueError::Interrupted`。
    pub fn remove(&self, timeout: Duration) -> std::result::Result<Reference<R>, QueueError> {
        if let Some(reference) = self.poll() {
            return Ok(reference);
        }
        select! {
            recv(self.ready_rx) -> reference => reference.map_err(|_| QueueError::Interrupted),
            recv(self.wake_rx) -> _ => Err(QueueError::Interrupted),
            default(timeout) => Err(QueueError::Timeout),
        }
    }

    /// Wake a thread blocked in `remove()`.
    pub fn interrupt(&self) {
        let _ = self.wake_tx.try_send(());
    }

    /// Drop every pending and ready registration, returning how many there were.
    ///
    /// 丢弃所有待处理和就绪的注册项，返回其数量。
    pub fn clear(&self) -> usize {
        let pending = self.pending.drain().len();
        let ready = self.ready_rx.try_iter().count();
        pending + ready
    }

    /// Snapshot of the registrations still waiting on a live referent.
    pub fn pending(&self) -> Vec<Reference<R>> {
        self.pending.snapshot().into_iter().map(Reference).collect()
    }

    /// Number of pending registrations.
    /// 待处理注册项的数量。
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of references waiting to be polled.
    pub fn ready_len(&self) -> usize {
        self.ready_rx.len()
    }
}

impl<R: Send + Sync + 'static> Default for ReferenceQueue<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> fmt::Debug for ReferenceQueue<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceQueue")
            .field("pending", &self.pending.len())
            .field("ready", &self.ready_rx.len())
            .finish()
    }
}
