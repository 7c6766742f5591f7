use crate::error::{ReclaimError, Result};
use arc_swap::{ArcSwapOption, Guard};
use std::collections::HashSet;
use std::fmt;
use std::iter;
use std::sync::Arc;

/// Number of partitions used by `PartitionedBag::new()`.
/// `PartitionedBag::new()` 使用的分区数量。
pub const DEFAULT_PARTITIONS: usize = 64;

// --- 1. Persistent cells ---
// --- 1. 持久化节点 ---

/// Immutable list node. A chain is never mutated in place: every change builds
/// new cells for the affected prefix and shares the untouched suffix.
///
/// 不可变链表节点。链从不原地修改：每次变更都为受影响的前缀构建新节点，
/// 并共享未受影响的后缀。
struct Cell<T: ?Sized> {
    value: Arc<T>,
    /// Length of the chain starting at this cell.
    len: usize,
    next: Chain<T>,
}

type Chain<T> = Option<Arc<Cell<T>>>;

impl<T: ?Sized> Cell<T> {
    #[inline]
    fn push(value: Arc<T>, next: Chain<T>) -> Chain<T> {
        Some(Arc::new(Cell {
            value,
            len: chain_len(&next) + 1,
            next,
        }))
    }
}

impl<T: ?Sized> Drop for Cell<T> {
    // Unlink iteratively so long chains don't overflow the stack.
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(cell) = next {
            match Arc::try_unwrap(cell) {
                Ok(mut cell) => next = cell.next.take(),
                Err(_) => break,
            }
        }
    }
}

#[inline]
fn chain_len<T: ?Sized>(chain: &Chain<T>) -> usize {
    chain.as_ref().map_or(0, |cell| cell.len)
}

#[inline]
fn chain_cells<T: ?Sized>(chain: &Chain<T>) -> impl Iterator<Item = &Arc<Cell<T>>> {
    iter::successors(chain.as_ref(), |cell| cell.next.as_ref())
}

#[inline]
fn chain_values<T: ?Sized>(chain: &Chain<T>) -> impl Iterator<Item = &Arc<T>> {
    chain_cells(chain).map(|cell| &cell.value)
}

#[inline]
fn same_chain<T: ?Sized>(a: &Chain<T>, b: &Chain<T>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

/// Address of the value behind an `Arc`, without pointer metadata.
#[inline]
pub(crate) fn identity<T: ?Sized>(value: &Arc<T>) -> *const () {
    Arc::as_ptr(value) as *const ()
}

/// Rebuild `chain` without the values selected by `remove`.
///
/// Returns `None` when nothing matches so callers can skip the CAS entirely;
/// that path walks the chain once and allocates nothing. `remove` runs exactly
/// once per cell. The suffix after the last removed cell is shared with the
/// original chain.
fn filter_chain<T: ?Sized>(
    chain: &Chain<T>,
    mut remove: impl FnMut(&Arc<T>) -> bool,
) -> Option<(Chain<T>, Vec<Arc<T>>)> {
    let mut hits: Vec<usize> = Vec::new();
    for (index, cell) in chain_cells(chain).enumerate() {
        if remove(&cell.value) {
            hits.push(index);
        }
    }
    let last = *hits.last()?;

    let prefix: Vec<&Arc<Cell<T>>> = chain_cells(chain).take(last + 1).collect();
    let mut rebuilt = prefix[last].next.clone();
    let mut removed = Vec::with_capacity(hits.len());
    let mut pending_hits = hits.iter().rev().peekable();
    for (index, cell) in prefix.iter().enumerate().rev() {
        if pending_hits.next_if(|&&hit| hit == index).is_some() {
            removed.push(cell.value.clone());
        } else {
            rebuilt = Cell::push(cell.value.clone(), rebuilt);
        }
    }
    Some((rebuilt, removed))
}

// --- 2. The bag ---
// --- 2. 袋子 ---

/// A lock-free multiset of `Arc<T>` references spread over a fixed number of
/// partitions.
///
/// Each partition is an atomically swappable root of an immutable chain of
/// cells. Adds go to the least populated partition; removals rebuild the
/// affected prefix and compare-and-swap the root. Membership is decided by
/// reference identity (`Arc` address), never by `PartialEq`, so equal but
/// distinct values are separate entries.
///
/// Operations on a single partition are linearizable. Operations spanning
/// partitions (`len`, `contains`, `snapshot`, `drain`) are best-effort and may
/// observe an intermediate state under concurrent writers.
///
/// **Typical Usage**:
/// ```
/// use lockless_reclaim::PartitionedBag;
/// use std::sync::Arc;
///
/// let bag = PartitionedBag::new();
/// let value = Arc::new(String::from("a"));
/// bag.add(value.clone());
/// assert!(bag.contains(&value));
/// assert!(bag.remove(&value));
/// assert!(bag.is_empty());
/// ```
///
/// 一个分布在固定数量分区上的 `Arc<T>` 引用的无锁多重集合。
///
/// 每个分区是一条不可变节点链的可原子交换的根。添加操作进入元素最少的分区；
/// 移除操作重建受影响的前缀并通过 CAS 替换根。成员关系按引用身份判断，
/// 而不是 `PartialEq`，因此相等但不同的值是不同的条目。
///
/// 单个分区上的操作是可线性化的。跨分区的操作是尽力而为的。
pub struct PartitionedBag<T: ?Sized> {
    partitions: Box<[ArcSwapOption<Cell<T>>]>,
}

impl<T: ?Sized> PartitionedBag<T> {
    /// Create a bag with `DEFAULT_PARTITIONS` partitions.
    /// 创建一个具有 `DEFAULT_PARTITIONS` 个分区的袋子。
    pub fn new() -> Self {
        Self::build(DEFAULT_PARTITIONS)
    }

    /// Create a bag with `partitions` partitions.
    ///
    /// Fails with `InvalidPartitionCount` when `partitions` is zero.
    ///
    /// 创建一个具有 `partitions` 个分区的袋子。分区数为零时失败。
    pub fn with_partitions(partitions: usize) -> Result<Self> {
        if partitions == 0 {
            return Err(ReclaimError::InvalidPartitionCount);
        }
        Ok(Self::build(partitions))
    }

    fn build(partitions: usize) -> Self {
        Self {
            partitions: (0..partitions).map(|_| ArcSwapOption::empty()).collect(),
        }
    }

    #[inline]
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Apply `f` to a partition's chain until the CAS lands.
    ///
    /// `f` returns `None` to leave the partition untouched. It may run several
    /// times; only the output of the attempt that succeeded is returned.
    fn update<X>(
        partition: &ArcSwapOption<Cell<T>>,
        mut f: impl FnMut(&Chain<T>) -> Option<(Chain<T>, X)>,
    ) -> Option<X> {
        let mut current = partition.load_full();
        loop {
            let (next, out) = f(&current)?;
            let prev = partition.compare_and_swap(&current, next);
            if same_chain(&prev, &current) {
                return Some(out);
            }
            current = Guard::into_inner(prev);
        }
    }

    /// Index of the partition with the fewest elements; first found wins ties
    /// and an empty partition ends the scan.
    fn least_populated(&self) -> usize {
        let mut best = 0;
        let mut best_len = usize::MAX;
        for (index, partition) in self.partitions.iter().enumerate() {
            let len = chain_len(&partition.load());
            if len == 0 {
                return index;
            }
            if len < best_len {
                best = index;
                best_len = len;
            }
        }
        best
    }

    /// Add a value, returning the index of the partition it landed in.
    ///
    /// No uniqueness check is made: the same reference may be added twice.
    ///
    /// 添加一个值，返回其所在分区的索引。不做唯一性检查。
    pub fn add(&self, value: Arc<T>) -> usize {
        let index = self.least_populated();
        self.partitions[index].rcu(|head| Cell::push(value.clone(), head.clone()));
        index
    }

    /// Add every value with a single atomic update of one partition.
    ///
    /// Returns `None` for an empty input, otherwise the partition index.
    ///
    /// 通过对单个分区的一次原子更新添加所有值。输入为空时返回 `None`。
    pub fn add_all<I>(&self, values: I) -> Option<usize>
    where
        I: IntoIterator<Item = Arc<T>>,
    {
        let values: Vec<Arc<T>> = values.into_iter().collect();
        if values.is_empty() {
            return None;
        }
        let index = self.least_populated();
        self.partitions[index].rcu(|head| {
            values
                .iter()
                .rev()
                .fold(head.clone(), |chain, value| Cell::push(value.clone(), chain))
        });
        Some(index)
    }

    /// Remove every occurrence of `value` (by identity) from every partition.
    ///
    /// Returns `true` if anything was removed.
    ///
    /// 从所有分区中移除 `value` 的每一次出现（按身份）。
    pub fn remove(&self, value: &Arc<T>) -> bool {
        let target = identity(value);
        let mut removed = false;
        for partition in self.partitions.iter() {
            let hit = Self::update(partition, |chain| {
                filter_chain(chain, |candidate| identity(candidate) == target)
            });
            removed |= hit.is_some();
        }
        removed
    }

    /// Pop the head of the first non-empty partition.
    ///
    /// Any other occurrence of the popped reference is removed as well.
    ///
    /// 弹出第一个非空分区的头部元素，并移除该引用的其他所有出现。
    pub fn remove_one(&self) -> Option<Arc<T>> {
        for partition in self.partitions.iter() {
            let popped = Self::update(partition, |chain| {
                let head = chain.as_ref()?;
                Some((head.next.clone(), head.value.clone()))
            });
            if let Some(value) = popped {
                self.remove(&value);
                return Some(value);
            }
        }
        None
    }

    /// Remove every value matching `predicate`, returning the removed values.
    ///
    /// Partitions are visited in reverse order so that concurrent bulk removals
    /// and `remove_one` scans start at opposite ends.
    ///
    /// 移除所有满足 `predicate` 的值，返回被移除的值。分区按逆序遍历。
    pub fn removing(&self, mut predicate: impl FnMut(&T) -> bool) -> Vec<Arc<T>> {
        let mut removed = Vec::new();
        for partition in self.partitions.iter().rev() {
            let batch = Self::update(partition, |chain| {
                filter_chain(chain, |candidate| predicate(&**candidate))
            });
            if let Some(mut batch) = batch {
                removed.append(&mut batch);
            }
        }
        removed
    }

    /// Empty the bag, returning every value it held.
    ///
    /// Loops until the bag reports empty, so values added concurrently during
    /// the drain are collected too. The result holds each reference once.
    ///
    /// 清空袋子，返回其持有的所有值。结果中每个引用只出现一次。
    pub fn drain(&self) -> Vec<Arc<T>> {
        let mut seen = HashSet::new();
        let mut drained = Vec::new();
        loop {
            for partition in self.partitions.iter() {
                let chain = partition.swap(None);
                for value in chain_values(&chain) {
                    if seen.insert(identity(value)) {
                        drained.push(value.clone());
                    }
                }
            }
            if self.is_empty() {
                return drained;
            }
        }
    }

    /// Whether `value` is present (by identity). Best-effort.
    pub fn contains(&self, value: &Arc<T>) -> bool {
        let target = identity(value);
        self.partitions.iter().any(|partition| {
            chain_values(&partition.load()).any(|candidate| identity(candidate) == target)
        })
    }

    /// Approximate element count.
    /// 近似的元素数量。
    pub fn len(&self) -> usize {
        self.partitions
            .iter()
            .map(|partition| chain_len(&partition.load()))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions
            .iter()
            .all(|partition| partition.load().is_none())
    }

    /// Copy of the current content, partition by partition.
    /// 当前内容的副本，逐分区收集。
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        let mut values = Vec::new();
        for partition in self.partitions.iter() {
            values.extend(chain_values(&partition.load()).cloned());
        }
        values
    }
}

impl<T: ?Sized> Default for PartitionedBag<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> fmt::Debug for PartitionedBag<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionedBag")
            .field("partitions", &self.partitions.len())
            .field("len", &self.len())
            .finish()
    }
}
