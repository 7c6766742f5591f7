//! Lock-free object reclamation primitives.
//!
//! - [`PartitionedBag`]: a lock-free multiset of `Arc<T>` references, spread
//!   over partitions of immutable cells swapped by compare-and-swap.
//! - [`ReclaimingPool`]: a bounded object pool whose instances can be tied to
//!   an owner and come back on their own once that owner is dropped.
//! - [`TimedWeakRef`] and [`ExpiryService`]: references that stay strong for a
//!   sliding time window after their last access, then degrade to weak.
//! - [`ReferenceQueue`] and [`Cleaner`]: notification of dropped referents,
//!   the machinery the two above are built on.
//!
//! Identity, not equality: every collection in this crate compares `Arc`
//! addresses, so two equal but distinct values are two entries.
//!
//! 无锁对象回收原语。
//!
//! - [`PartitionedBag`]：`Arc<T>` 引用的无锁多重集合，分布在由 CAS
//!   交换的不可变节点分区上。
//! - [`ReclaimingPool`]：有界对象池，其实例可以与所有者绑定，
//!   并在所有者被 drop 后自动归还。
//! - [`TimedWeakRef`] 与 [`ExpiryService`]：在最后一次访问后的滑动时间窗口内
//!   保持强引用，之后降级为弱引用。
//! - [`ReferenceQueue`] 与 [`Cleaner`]：被引用对象被 drop 的通知机制。

mod bag;
mod cleaner;
mod error;
mod expiry;
mod pool;
mod reference;
mod slot;
mod sync;
mod timed;

pub use bag::{DEFAULT_PARTITIONS, PartitionedBag};
pub use cleaner::{Cleanable, Cleaner};
pub use error::{QueueError, ReclaimError, Result};
pub use expiry::{
    DEFAULT_CLEANUP_POLL_INTERVAL, DEFAULT_INITIAL_SWEEP_DELAY, DEFAULT_MINIMUM_ENTRY_DELAY,
    DEFAULT_SWEEP_PERIOD, ENV_CLEANUP_POLL, ENV_DEBUG, ENV_INITIAL_SWEEP_DELAY,
    ENV_MINIMUM_ENTRY_DELAY, ENV_SWEEP_PERIOD, ExpiryConfig, ExpiryService, ExpiryServiceBuilder,
};
pub use pool::{
    DEFAULT_MAX_SIZE, DEFAULT_RECLAIM_INTERVAL, OwnerBinding, PoolBuilder, ReclaimingPool,
};
pub use reference::{Reference, ReferenceQueue};
pub use slot::ArcSlot;
pub use timed::TimedWeakRef;

#[cfg(all(test, not(loom)))]
mod tests;
