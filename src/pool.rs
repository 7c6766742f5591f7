use crate::bag::{DEFAULT_PARTITIONS, PartitionedBag};
use crate::cleaner::join_worker;
use crate::error::{QueueError, ReclaimError, Result, positive};
use crate::reference::{Reference, ReferenceQueue};
use crate::slot::ArcSlot;
use crate::sync::{AtomicBool, AtomicUsize, Mutex, Ordering};
use log::{debug, error, info, trace};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Default bound on pooled instances.
/// 池中实例数量的默认上限。
pub const DEFAULT_MAX_SIZE: usize = 256;

/// Default wait between collection passes of the reclamation thread.
/// 回收线程两次回收扫描之间的默认等待时间。
pub const DEFAULT_RECLAIM_INTERVAL: Duration = Duration::from_millis(100);

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

/// A pooled object tied to an owner. The slot is emptied exactly once, by
/// whichever of the reclamation path and `return_owned` gets there first.
type OwnedHandle<T> = ArcSlot<T>;

// --- 1. Builder ---
// --- 1. 构建器 ---

/// Builder for configuring a `ReclaimingPool`.
///
/// # Example
/// ```
/// use lockless_reclaim::ReclaimingPool;
/// use std::time::Duration;
///
/// let pool = ReclaimingPool::builder(|| Vec::<u8>::with_capacity(1024))
///     .max_size(32)
///     .partitions(8)
///     .reclaim_interval(Duration::from_millis(20))
///     .build()
///     .unwrap();
/// assert_eq!(pool.max_size(), 32);
/// ```
///
/// 用于配置 `ReclaimingPool` 的构建器。
pub struct PoolBuilder<T> {
    factory: Factory<T>,
    max_size: usize,
    partitions: usize,
    reclaim_interval: Duration,
    background: bool,
    thread_name: String,
}

impl<T: Send + Sync + 'static> PoolBuilder<T> {
    fn new(factory: Factory<T>) -> Self {
        Self {
            factory,
            max_size: DEFAULT_MAX_SIZE,
            partitions: DEFAULT_PARTITIONS,
            reclaim_interval: DEFAULT_RECLAIM_INTERVAL,
            background: true,
            thread_name: String::from("reclaim-pool"),
        }
    }

    /// Maximum number of idle instances kept. `0` turns the pool into a plain
    /// factory.
    ///
    /// Default: `256`
    ///
    /// 保留的空闲实例的最大数量。`0` 会使池退化为普通工厂。
    #[inline]
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Partition count of the free list.
    ///
    /// Default: `64`
    #[inline]
    pub fn partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions;
        self
    }

    /// How long the reclamation thread waits between collection passes.
    ///
    /// Default: `100ms`
    ///
    /// 回收线程在两次回收扫描之间等待的时间。
    #[inline]
    pub fn reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    /// Whether to run a background reclamation thread. Without one, owned
    /// objects come back only through `reclaim_available()`, which every take
    /// also runs. With one, takes only drain what the thread already collected.
    ///
    /// Default: `true`
    #[inline]
    pub fn background_reclaim(mut self, enabled: bool) -> Self {
        self.background = enabled;
        self
    }

    /// Name of the reclamation thread.
    #[inline]
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Build the pool, starting its reclamation thread if enabled.
    ///
    /// 构建池，若启用则启动回收线程。
    pub fn build(self) -> Result<ReclaimingPool<T>> {
        let reclaim_interval = positive("reclaim interval", self.reclaim_interval)?;
        let shared = Arc::new(PoolShared {
            factory: self.factory,
            free: PartitionedBag::with_partitions(self.partitions)?,
            owners: ReferenceQueue::with_partitions(self.partitions)?,
            idle: AtomicUsize::new(0),
            max_size: self.max_size,
            background: self.background,
            stopped: AtomicBool::new(false),
            recycled: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            name: self.thread_name,
        });

        let worker = if shared.reclaims_in_background() {
            let worker_shared = shared.clone();
            let name = shared.name.clone();
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_shared.reclaim_loop(reclaim_interval))
                .map_err(|source| ReclaimError::Spawn { name, source })?;
            Some(handle)
        } else {
            None
        };

        Ok(ReclaimingPool {
            shared,
            worker: Mutex::new(worker),
        })
    }
}

// --- 2. Shared state ---
// --- 2. 共享状态 ---

struct PoolShared<T> {
    factory: Factory<T>,
    /// Idle instances ready to be taken.
    free: PartitionedBag<T>,
    /// Owner associations: weak owner -> handle holding the pooled object.
    owners: ReferenceQueue<OwnedHandle<T>>,
    /// Slots reserved in `free`; bumped before an add, never above `max_size`.
    idle: AtomicUsize,
    max_size: usize,
    background: bool,
    stopped: AtomicBool,
    recycled: AtomicUsize,
    created: AtomicUsize,
    name: String,
}

impl<T: Send + Sync + 'static> PoolShared<T> {
    #[inline]
    fn is_pooling(&self) -> bool {
        self.max_size > 0 && !self.stopped.load(Ordering::Acquire)
    }

    #[inline]
    fn reclaims_in_background(&self) -> bool {
        self.background && self.max_size > 0
    }

    fn take(&self) -> Arc<T> {
        if self.is_pooling() {
            // With a reclamation thread the collection pass is its job.
            if self.reclaims_in_background() {
                self.reclaim_ready();
            } else {
                self.reclaim_available();
            }
            if let Some(object) = self.free.remove_one() {
                self.idle.fetch_sub(1, Ordering::AcqRel);
                return object;
            }
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        Arc::new((self.factory)())
    }

    /// Push `object` back if the pool is running and below capacity.
    fn release(&self, object: Arc<T>) -> bool {
        if !self.is_pooling() {
            return false;
        }
        let reserved = self
            .idle
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |idle| {
                (idle < self.max_size).then_some(idle + 1)
            });
        if reserved.is_err() {
            return false;
        }
        self.free.add(object.clone());
        // A concurrent stop() may have drained before the add landed.
        if self.stopped.load(Ordering::Acquire) && self.free.remove(&object) {
            self.idle.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    fn associate<O>(&self, object: &Arc<T>, owner: &Arc<O>)
    where
        O: Send + Sync + 'static,
    {
        if !self.is_pooling() {
            return;
        }
        self.check_unowned(object);
        self.owners.register(owner, ArcSlot::new(object.clone()));
    }

    /// Reclaim the object of a delivered association, unless an explicit
    /// return already took it.
    fn reclaim(&self, reference: &Reference<OwnedHandle<T>>) -> bool {
        let Some(object) = reference.payload().take() else {
            return false;
        };
        if self.release(object) {
            self.recycled.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn reclaim_available(&self) -> usize {
        let mut reclaimed = 0;
        while let Some(reference) = self.owners.poll() {
            if self.reclaim(&reference) {
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Reclaim only what is already in the ready queue.
    fn reclaim_ready(&self) -> usize {
        let mut reclaimed = 0;
        while let Some(reference) = self.owners.poll_ready() {
            if self.reclaim(&reference) {
                reclaimed += 1;
            }
        }
        reclaimed
    }

    fn find_owned(&self, object: &Arc<T>) -> Option<Reference<OwnedHandle<T>>> {
        self.owners
            .pending()
            .into_iter()
            .find(|reference| reference.payload().holds(object))
    }

    /// Linear scan for a live association holding `object`. Only run when
    /// debug assertions or the `ownership-checks` feature are on.
    fn check_unowned(&self, object: &Arc<T>) {
        if cfg!(any(debug_assertions, feature = "ownership-checks")) {
            assert!(
                self.find_owned(object).is_none(),
                "pooled object is still associated with a live owner"
            );
        }
    }

    fn reclaim_loop(&self, interval: Duration) {
        info!("{} reclamation thread started", self.name);
        while !self.stopped.load(Ordering::Acquire) {
            match self.owners.remove(interval) {
                Ok(reference) => {
                    if self.reclaim(&reference) {
                        trace!("{} recycled an object from a dropped owner", self.name);
                    }
                }
                Err(QueueError::Timeout) => {}
                Err(QueueError::Interrupted) => {
                    if self.stopped.load(Ordering::Acquire) {
                        info!("{} reclamation thread interrupted for shutdown", self.name);
                    } else {
                        error!("{} reclamation thread interrupted while running", self.name);
                    }
                }
            }
        }
        info!("{} reclamation thread stopped", self.name);
    }
}

// --- 3. Pool ---
// --- 3. 对象池 ---

/// A bounded pool of recycled `Arc<T>` instances.
///
/// Instances leave the pool in one of three ways:
/// - `take_from_pool()`: the caller must `return_to_pool()` it, otherwise it is
///   simply never recycled.
/// - `take_from_pool_owned(&owner)`: the instance comes back on its own once the
///   owner's last strong reference is dropped and a collection pass notices.
/// - `borrow(f)`: the instance is returned when `f` finishes, even by panicking.
///
/// Idle instances live in a `PartitionedBag`, so taking and returning never
/// block. A dedicated thread waits on the owner queue and recycles instances of
/// dropped owners; `reclaim_available()` does the same on the calling thread.
///
/// **Typical Usage**:
/// ```
/// use lockless_reclaim::ReclaimingPool;
/// use std::sync::Arc;
///
/// let pool = ReclaimingPool::new(4, || String::with_capacity(64)).unwrap();
///
/// let len = pool.borrow(|buffer| buffer.capacity());
/// assert!(len >= 64);
/// assert_eq!(pool.available(), 1);
///
/// let owner = Arc::new(());
/// let _buffer = pool.take_from_pool_owned(&owner);
/// assert_eq!(pool.owned(), 1);
/// ```
///
/// 一个有界的可回收 `Arc<T>` 实例池。
///
/// 实例通过三种方式离开池：
/// - `take_from_pool()`：调用者必须调用 `return_to_pool()`，否则它不会被回收。
/// - `take_from_pool_owned(&owner)`：当所有者的最后一个强引用被 drop
///   并被回收扫描发现后，实例会自动归还。
/// - `borrow(f)`：`f` 结束时（即使发生 panic）归还实例。
pub struct ReclaimingPool<T: Send + Sync + 'static> {
    shared: Arc<PoolShared<T>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + Sync + 'static> ReclaimingPool<T> {
    /// Create a pool with default settings and the given capacity.
    ///
    /// 使用默认设置和给定容量创建池。
    pub fn new<F>(max_size: usize, factory: F) -> Result<Self>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::builder(factory).max_size(max_size).build()
    }

    pub fn builder<F>(factory: F) -> PoolBuilder<T>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        PoolBuilder::new(Box::new(factory))
    }

    /// Take an idle instance, or build one when none is available.
    ///
    /// Owner notifications already delivered are processed first. Without a
    /// reclamation thread this includes a collection pass over every live
    /// association.
    ///
    /// 取出一个空闲实例，若无可用实例则新建一个。会先处理已交付的所有者通知。
    pub fn take_from_pool(&self) -> Arc<T> {
        self.shared.take()
    }

    /// Take an instance that returns to the pool once `owner` is dropped.
    ///
    /// 取出一个实例，当 `owner` 被 drop 后自动归还到池中。
    pub fn take_from_pool_owned<O>(&self, owner: &Arc<O>) -> Arc<T>
    where
        O: Send + Sync + 'static,
    {
        let object = self.shared.take();
        self.shared.associate(&object, owner);
        object
    }

    /// Run `f` with a pooled instance, returning the instance afterwards even
    /// if `f` panics.
    ///
    /// 使用一个池中实例运行 `f`，之后归还该实例，即使 `f` 发生 panic。
    pub fn borrow<R>(&self, f: impl FnOnce(&Arc<T>) -> R) -> R {
        struct ReturnOnDrop<'a, T: Send + Sync + 'static> {
            shared: &'a PoolShared<T>,
            object: Option<Arc<T>>,
        }

        impl<T: Send + Sync + 'static> Drop for ReturnOnDrop<'_, T> {
            fn drop(&mut self) {
                if let Some(object) = self.object.take() {
                    self.shared.release(object);
                }
            }
        }

        let object = self.shared.take();
        let _guard = ReturnOnDrop {
            shared: &self.shared,
            object: Some(object.clone()),
        };
        f(&object)
    }

    /// Take an instance for an owner that does not exist yet.
    ///
    /// `f` receives the instance and an `OwnerBinding`; once the owner has been
    /// built, `binding.bind(&owner)` associates it. If `f` never binds, the
    /// instance is lost to the pool (it stays valid, it is just never recycled).
    ///
    /// 为尚不存在的所有者取出实例。`f` 接收实例和一个 `OwnerBinding`；
    /// 所有者构建完成后调用 `binding.bind(&owner)` 建立关联。
    /// 若 `f` 从未绑定，该实例将不再被池回收。
    pub fn lazy_take_from_pool<R>(&self, f: impl FnOnce(Arc<T>, OwnerBinding<T>) -> R) -> R {
        let object = self.shared.take();
        let binding = OwnerBinding {
            shared: self.shared.clone(),
            object: object.clone(),
        };
        f(object, binding)
    }

    /// Return an instance taken without an owner.
    ///
    /// Returns `false` (and drops the instance) when the pool is full or
    /// stopped. With debug assertions or the `ownership-checks` feature this
    /// panics if the instance is still associated with a live owner.
    ///
    /// 归还一个无所有者取出的实例。池满或已停止时返回 `false` 并丢弃该实例。
    pub fn return_to_pool(&self, object: Arc<T>) -> bool {
        self.shared.check_unowned(&object);
        self.shared.release(object)
    }

    /// Explicitly return an instance that was taken with an owner.
    ///
    /// The association is disarmed first. Returns `false` without pooling
    /// anything when no live association holds `object`: the reclamation path
    /// already took it (or is about to), or it was never owned. Unowned
    /// instances go back through `return_to_pool()`.
    ///
    /// 显式归还一个带所有者取出的实例。若没有存活的关联持有该实例
    /// （已被或即将被回收，或从未绑定所有者），返回 `false` 且不会重复入池。
    pub fn return_owned(&self, object: Arc<T>) -> bool {
        let Some(reference) = self.shared.find_owned(&object) else {
            return false;
        };
        self.shared.owners.unregister(&reference);
        match reference.payload().take() {
            Some(_association_copy) => self.shared.release(object),
            None => false,
        }
    }

    /// Process at most one pending owner notification without blocking.
    ///
    /// Returns `true` if an instance was recycled.
    pub fn reclaim_poll(&self) -> bool {
        match self.shared.owners.poll() {
            Some(reference) => self.shared.reclaim(&reference),
            None => false,
        }
    }

    /// Process every pending owner notification without blocking.
    ///
    /// 非阻塞地处理所有待处理的所有者通知，返回回收的实例数量。
    pub fn reclaim_available(&self) -> usize {
        self.shared.reclaim_available()
    }

    /// Disable the pool: drop every association and idle instance and stop the
    /// reclamation thread. Later takes always build through the factory.
    ///
    /// 禁用池：丢弃所有关联和空闲实例并停止回收线程。之后的获取总是通过工厂新建。
    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.owners.interrupt();
        join_worker(&self.worker, &self.shared.name);
        let associations = self.shared.owners.clear();
        let idle = self.shared.free.drain().len();
        self.shared.idle.fetch_sub(idle, Ordering::AcqRel);
        debug!(
            "{} stopped: dropped {} associations and {} idle instances",
            self.shared.name, associations, idle
        );
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Idle instances ready to be taken.
    /// 可被取出的空闲实例数量。
    #[inline]
    pub fn available(&self) -> usize {
        self.shared.free.len()
    }

    /// Instances recycled after their owner was dropped.
    /// 所有者被 drop 后被回收的实例数量。
    #[inline]
    pub fn recycled(&self) -> usize {
        self.shared.recycled.load(Ordering::Relaxed)
    }

    /// Instances built by the factory.
    #[inline]
    pub fn created(&self) -> usize {
        self.shared.created.load(Ordering::Relaxed)
    }

    /// Live owner associations.
    #[inline]
    pub fn owned(&self) -> usize {
        self.shared.owners.len()
    }

    #[inline]
    pub fn max_size(&self) -> usize {
        self.shared.max_size
    }

    /// Whether `object` is currently associated with a live owner. Linear scan.
    pub fn is_owned(&self, object: &Arc<T>) -> bool {
        self.shared.find_owned(object).is_some()
    }
}

impl<T: Send + Sync + 'static> Drop for ReclaimingPool<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for ReclaimingPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReclaimingPool")
            .field("name", &self.shared.name)
            .field("max_size", &self.shared.max_size)
            .field("available", &self.available())
            .field("owned", &self.owned())
            .field("recycled", &self.recycled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

// --- 4. Late owner binding ---
// --- 4. 延迟绑定所有者 ---

/// Associates an instance from `lazy_take_from_pool` with its owner once the
/// owner exists.
///
/// 当所有者存在后，将 `lazy_take_from_pool` 取出的实例与其关联。
#[must_use = "an unbound instance is never recycled"]
pub struct OwnerBinding<T: Send + Sync + 'static> {
    shared: Arc<PoolShared<T>>,
    object: Arc<T>,
}

impl<T: Send + Sync + 'static> OwnerBinding<T> {
    /// Return the instance to the pool once `owner` is dropped.
    pub fn bind<O>(self, owner: &Arc<O>)
    where
        O: Send + Sync + 'static,
    {
        self.shared.associate(&self.object, owner);
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for OwnerBinding<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnerBinding")
            .field("object", &Arc::as_ptr(&self.object))
            .finish()
    }
}
