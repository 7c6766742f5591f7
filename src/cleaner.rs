use crate::error::{QueueError, ReclaimError, Result, positive};
use crate::reference::{Reference, ReferenceQueue};
use crate::sync::{AtomicBool, Mutex, Ordering};
use log::{debug, error, info, warn};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

type Cleanup = Mutex<Option<Box<dyn FnOnce() + Send>>>;

/// Runs short callbacks once their referent becomes unreachable.
///
/// A `Cleaner` owns one daemon thread blocked on a `ReferenceQueue`. Every
/// `poll_interval` the thread runs a collection pass; each callback whose
/// referent has been dropped runs once, on that thread. A panicking callback is
/// logged and skipped; it never stops the daemon.
///
/// Dropping the `Cleaner` shuts it down. Callbacks still pending at that point
/// are discarded without running.
///
/// 在被引用对象不可达后运行简短回调。
///
/// `Cleaner` 拥有一个阻塞在 `ReferenceQueue` 上的守护线程。
/// 回调发生 panic 时会被记录并跳过，不会停止守护线程。
pub struct Cleaner {
    inner: Arc<CleanerInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct CleanerInner {
    name: String,
    queue: ReferenceQueue<Cleanup>,
    poll_interval: Duration,
    stopped: AtomicBool,
}

impl Cleaner {
    /// Start a cleaner daemon thread called `name`.
    ///
    /// Fails if `poll_interval` is zero or the thread cannot be spawned.
    ///
    /// 启动名为 `name` 的清理守护线程。
    pub fn start(name: impl Into<String>, poll_interval: Duration) -> Result<Self> {
        let poll_interval = positive("cleanup poll interval", poll_interval)?;
        let name = name.into();
        let inner = Arc::new(CleanerInner {
            name: name.clone(),
            queue: ReferenceQueue::new(),
            poll_interval,
            stopped: AtomicBool::new(false),
        });

        let worker_inner = inner.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_inner.run())
            .map_err(|source| ReclaimError::Spawn { name, source })?;

        Ok(Self {
            inner,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Run `cleanup` once `referent` has no strong references left.
    ///
    /// The returned `Cleanable` can cancel the callback; dropping it does not.
    /// Registrations made after `shutdown()` are ignored.
    ///
    /// 当 `referent` 不再有强引用时运行 `cleanup`。返回的 `Cleanable` 可取消该回调。
    pub fn register<O, F>(&self, referent: &Arc<O>, cleanup: F) -> Cleanable
    where
        O: Send + Sync + 'static,
        F: FnOnce() + Send + 'static,
    {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Cleanable {
                cleaner: Weak::new(),
                reference: None,
            };
        }
        let cleanup: Box<dyn FnOnce() + Send> = Box::new(cleanup);
        let reference = self
            .inner
            .queue
            .register(referent, Mutex::new(Some(cleanup)));
        Cleanable {
            cleaner: Arc::downgrade(&self.inner),
            reference: Some(reference),
        }
    }

    /// Run every callback that is ready now on the calling thread.
    ///
    /// Returns the number of callbacks that completed without panicking.
    ///
    /// 在调用线程上运行当前所有就绪的回调。
    pub fn run_pending(&self) -> usize {
        let mut completed = 0;
        while let Some(reference) = self.inner.queue.poll() {
            if self.inner.invoke(&reference) {
                completed += 1;
            }
        }
        completed
    }

    /// Number of callbacks still waiting on a live referent.
    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Stop the daemon thread and discard pending callbacks. Idempotent.
    ///
    /// 停止守护线程并丢弃待处理的回调。可重复调用。
    pub fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.queue.interrupt();
        join_worker(&self.worker, &self.inner.name);
        let discarded = self.inner.queue.clear();
        if discarded > 0 {
            debug!("{}: discarded {} pending callbacks", self.inner.name, discarded);
        }
    }
}

impl Drop for Cleaner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Cleaner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cleaner")
            .field("name", &self.inner.name)
            .field("pending", &self.inner.queue.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// A callback registered with a `Cleaner`.
///
/// 已在 `Cleaner` 中注册的回调。
pub struct Cleanable {
    cleaner: Weak<CleanerInner>,
    reference: Option<Reference<Cleanup>>,
}

impl Cleanable {
    /// Cancel the callback and release its registration.
    ///
    /// Returns `true` if the callback had not run (or started) yet; it never
    /// will now.
    ///
    /// 取消回调并释放其注册项。若回调尚未运行则返回 `true`。
    pub fn cancel(&self) -> bool {
        let Some(reference) = &self.reference else {
            return false;
        };
        if let Some(cleaner) = self.cleaner.upgrade() {
            cleaner.queue.unregister(reference);
        }
        let cleanup = reference.payload().lock().take();
        cleanup.is_some()
    }
}

impl fmt::Debug for Cleanable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cleanable")
            .field("registered", &self.reference.is_some())
            .finish()
    }
}

impl CleanerInner {
    fn run(&self) {
        info!("{} started", self.name);
        while !self.stopped.load(Ordering::Acquire) {
            match self.queue.remove(self.poll_interval) {
                Ok(reference) => {
                    self.invoke(&reference);
                }
                Err(QueueError::Timeout) => {}
                Err(QueueError::Interrupted) => {
                    if self.stopped.load(Ordering::Acquire) {
                        info!("{} interrupted for shutdown", self.name);
                    } else {
                        error!("{} interrupted while still running", self.name);
                    }
                }
            }
        }
        info!("{} stopped", self.name);
    }

    /// Run a delivered callback, returning `false` if it was already taken or
    /// panicked.
    fn invoke(&self, reference: &Reference<Cleanup>) -> bool {
        let cleanup = reference.payload().lock().take();
        let Some(cleanup) = cleanup else {
            return false;
        };
        match panic::catch_unwind(AssertUnwindSafe(cleanup)) {
            Ok(()) => true,
            Err(payload) => {
                error!(
                    "{}: cleanup callback panicked: {}",
                    self.name,
                    panic_message(payload.as_ref())
                );
                false
            }
        }
    }
}

/// Join a background thread unless called from that very thread.
pub(crate) fn join_worker(worker: &Mutex<Option<JoinHandle<()>>>, name: &str) {
    let Some(handle) = worker.lock().take() else {
        return;
    };
    if handle.thread().id() == thread::current().id() {
        return;
    }
    if handle.join().is_err() {
        warn!("{} thread exited with a panic", name);
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
