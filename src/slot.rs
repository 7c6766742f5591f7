use crate::sync::{AtomicPtr, Ordering};
use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::Arc;

/// A lock-free, atomically swappable `Option<Arc<T>>`.
///
/// The slot owns one strong count of whatever it holds. All transfers go
/// through `swap`, so a value stored in the slot can be moved out by exactly
/// one caller: concurrent `take()` calls race on a single atomic exchange and
/// only the winner receives `Some`.
///
/// The slot never hands out a borrowed view of its content. Reading without
/// taking would require protecting the pointee from a concurrent `swap`, which
/// this type deliberately does not do; `holds()` only compares addresses.
///
/// 一个无锁、可原子交换的 `Option<Arc<T>>`。
///
/// 槽位拥有其所持值的一个强引用计数。所有转移都通过 `swap` 完成，
/// 因此存入槽位的值只能被一个调用者取出：并发的 `take()` 在同一次
/// 原子交换上竞争，只有胜者得到 `Some`。
pub struct ArcSlot<T> {
    ptr: AtomicPtr<T>,
    _owns: PhantomData<Arc<T>>,
}

#[inline]
fn into_raw<T>(value: Option<Arc<T>>) -> *mut T {
    match value {
        Some(arc) => Arc::into_raw(arc) as *mut T,
        None => ptr::null_mut(),
    }
}

/// # Safety
/// `raw` must be null or come from `into_raw` and carry one strong count.
#[inline]
unsafe fn from_raw<T>(raw: *mut T) -> Option<Arc<T>> {
    if raw.is_null() {
        None
    } else {
        // SAFETY: non-null pointers stored in a slot come from `Arc::into_raw`
        // and the strong count they carry is transferred to the caller here.
        Some(unsafe { Arc::from_raw(raw as *const T) })
    }
}

impl<T> ArcSlot<T> {
    /// Create a slot holding `value`.
    /// 创建一个持有 `value` 的槽位。
    #[inline]
    pub fn new(value: Arc<T>) -> Self {
        Self::from_option(Some(value))
    }

    /// Create an empty slot.
    /// 创建一个空槽位。
    #[inline]
    pub fn empty() -> Self {
        Self::from_option(None)
    }

    #[inline]
    fn from_option(value: Option<Arc<T>>) -> Self {
        Self {
            ptr: AtomicPtr::new(into_raw(value)),
            _owns: PhantomData,
        }
    }

    /// Atomically replace the content, returning the previous one.
    ///
    /// 原子地替换内容，返回之前的内容。
    #[inline]
    pub fn swap(&self, value: Option<Arc<T>>) -> Option<Arc<T>> {
        let old = self.ptr.swap(into_raw(value), Ordering::AcqRel);
        // SAFETY: the exchange moved ownership of `old` out of the slot.
        unsafe { from_raw(old) }
    }

    /// Move the content out, leaving the slot empty.
    ///
    /// Exactly one of any number of concurrent callers observes `Some`.
    ///
    /// 取出内容并清空槽位。任意数量的并发调用者中恰好一个得到 `Some`。
    #[inline]
    pub fn take(&self) -> Option<Arc<T>> {
        self.swap(None)
    }

    /// Store `value`, dropping whatever was there.
    #[inline]
    pub fn put(&self, value: Arc<T>) {
        drop(self.swap(Some(value)));
    }

    #[inline]
    pub fn is_some(&self) -> bool {
        !self.ptr.load(Ordering::Acquire).is_null()
    }

    /// Whether the slot currently holds `value` (by identity).
    ///
    /// 槽位当前是否持有 `value`（按身份比较）。
    #[inline]
    pub fn holds(&self, value: &Arc<T>) -> bool {
        ptr::eq(self.ptr.load(Ordering::Acquire), Arc::as_ptr(value))
    }
}

impl<T> Default for ArcSlot<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> fmt::Debug for ArcSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ptr = self.ptr.load(Ordering::Relaxed);
        f.debug_tuple("ArcSlot").field(&ptr).finish()
    }
}

impl<T> Drop for ArcSlot<T> {
    #[inline]
    fn drop(&mut self) {
        drop(self.take());
    }
}
