use crate::bag::PartitionedBag;
use crate::cleaner::{Cleaner, join_worker, panic_message};
use crate::error::{ReclaimError, Result, positive};
use crate::sync::{AtomicBool, AtomicU64, Mutex, Ordering};
use crate::timed::Expirable;
use crossbeam_channel::{Receiver, Sender, after, bounded, select, tick};
use log::{debug, error, info, trace};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default delay before the first sweep.
/// 第一次扫描前的默认延迟。
pub const DEFAULT_INITIAL_SWEEP_DELAY: Duration = Duration::from_secs(30);

/// Default period between sweeps.
/// 两次扫描之间的默认周期。
pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_secs(30);

/// Default lower bound on entry delays.
/// 条目延迟的默认下限。
pub const DEFAULT_MINIMUM_ENTRY_DELAY: Duration = Duration::from_millis(100);

/// Default wait between collection passes of the cleaner thread.
pub const DEFAULT_CLEANUP_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub const ENV_INITIAL_SWEEP_DELAY: &str = "RECLAIM_INITIAL_SWEEP_DELAY_MS";
pub const ENV_SWEEP_PERIOD: &str = "RECLAIM_SWEEP_PERIOD_MS";
pub const ENV_MINIMUM_ENTRY_DELAY: &str = "RECLAIM_MINIMUM_ENTRY_DELAY_MS";
pub const ENV_CLEANUP_POLL: &str = "RECLAIM_CLEANUP_POLL_MS";
pub const ENV_DEBUG: &str = "RECLAIM_DEBUG";

/// Settings of an `ExpiryService`.
///
/// `ExpiryService` 的设置。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryConfig {
    /// Delay before the first sweep.
    pub initial_sweep_delay: Duration,
    /// Period between sweeps; must be positive.
    pub sweep_period: Duration,
    /// Entry delays shorter than this are raised to it.
    pub minimum_entry_delay: Duration,
    /// Wait between collection passes of the cleaner thread; must be positive.
    pub cleanup_poll_interval: Duration,
    /// Log per-sweep statistics at debug level.
    pub debug_logging: bool,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            initial_sweep_delay: DEFAULT_INITIAL_SWEEP_DELAY,
            sweep_period: DEFAULT_SWEEP_PERIOD,
            minimum_entry_delay: DEFAULT_MINIMUM_ENTRY_DELAY,
            cleanup_poll_interval: DEFAULT_CLEANUP_POLL_INTERVAL,
            debug_logging: false,
        }
    }
}

// --- 1. Builder ---
// --- 1. 构建器 ---

/// Builder for configuring an `ExpiryService`.
///
/// # Example
/// ```
/// use lockless_reclaim::ExpiryService;
/// use std::time::Duration;
///
/// let service = ExpiryService::builder()
///     .initial_sweep_delay(Duration::from_millis(10))
///     .sweep_period(Duration::from_millis(50))
///     .minimum_entry_delay(Duration::from_millis(10))
///     .build()
///     .unwrap();
/// assert_eq!(service.config().sweep_period, Duration::from_millis(50));
/// ```
///
/// 用于配置 `ExpiryService` 的构建器。
#[derive(Debug, Clone)]
pub struct ExpiryServiceBuilder {
    config: ExpiryConfig,
    thread_name: String,
}

impl ExpiryServiceBuilder {
    #[inline]
    pub fn new() -> Self {
        Self {
            config: ExpiryConfig::default(),
            thread_name: String::from("reclaim-expiry"),
        }
    }

    /// Default: `30s`
    #[inline]
    pub fn initial_sweep_delay(mut self, delay: Duration) -> Self {
        self.config.initial_sweep_delay = delay;
        self
    }

    /// Default: `30s`
    #[inline]
    pub fn sweep_period(mut self, period: Duration) -> Self {
        self.config.sweep_period = period;
        self
    }

    /// Default: `100ms`
    #[inline]
    pub fn minimum_entry_delay(mut self, delay: Duration) -> Self {
        self.config.minimum_entry_delay = delay;
        self
    }

    /// Default: `1s`
    #[inline]
    pub fn cleanup_poll_interval(mut self, interval: Duration) -> Self {
        self.config.cleanup_poll_interval = interval;
        self
    }

    /// Default: `false`
    #[inline]
    pub fn debug_logging(mut self, enabled: bool) -> Self {
        self.config.debug_logging = enabled;
        self
    }

    /// Name prefix of the service threads (`<name>-sweep`, `<name>-cleaner`).
    #[inline]
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Override settings from the `RECLAIM_*` environment variables.
    ///
    /// 使用 `RECLAIM_*` 环境变量覆盖设置。
    pub fn override_from_env(self) -> Result<Self> {
        self.override_from(|name| std::env::var(name).ok())
    }

    /// Override settings from any variable source. Durations are whole
    /// milliseconds; the debug flag accepts `1/0`, `true/false`, `yes/no`,
    /// `on/off`.
    ///
    /// 从任意变量来源覆盖设置。时长以毫秒为单位。
    pub fn override_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(delay) = lookup_millis(&lookup, ENV_INITIAL_SWEEP_DELAY)? {
            self.config.initial_sweep_delay = delay;
        }
        if let Some(period) = lookup_millis(&lookup, ENV_SWEEP_PERIOD)? {
            self.config.sweep_period = period;
        }
        if let Some(delay) = lookup_millis(&lookup, ENV_MINIMUM_ENTRY_DELAY)? {
            self.config.minimum_entry_delay = delay;
        }
        if let Some(interval) = lookup_millis(&lookup, ENV_CLEANUP_POLL)? {
            self.config.cleanup_poll_interval = interval;
        }
        if let Some(value) = lookup(ENV_DEBUG) {
            self.config.debug_logging = parse_flag(ENV_DEBUG, &value)?;
        }
        Ok(self)
    }

    /// Validate the settings and start the sweep and cleaner threads.
    ///
    /// 校验设置并启动扫描线程和清理线程。
    pub fn build(self) -> Result<ExpiryService> {
        let config = self.config;
        positive("sweep period", config.sweep_period)?;

        let cleaner = Cleaner::start(
            format!("{}-cleaner", self.thread_name),
            config.cleanup_poll_interval,
        )?;

        let tracker = Arc::new(Tracker {
            live: PartitionedBag::new(),
            epoch: Instant::now(),
            config: config.clone(),
            shut_down: AtomicBool::new(false),
            sweeps: AtomicU64::new(0),
            demoted: AtomicU64::new(0),
        });

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let name = format!("{}-sweep", self.thread_name);
        let sweep_tracker = tracker.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || sweep_loop(sweep_tracker, stop_rx))
            .map_err(|source| ReclaimError::Spawn {
                name: name.clone(),
                source,
            })?;

        info!(
            "{} started: first sweep in {:?}, then every {:?}",
            name, config.initial_sweep_delay, config.sweep_period
        );

        Ok(ExpiryService {
            tracker,
            cleaner,
            stop_tx: Mutex::new(Some(stop_tx)),
            sweeper: Mutex::new(Some(handle)),
            name,
        })
    }
}

impl Default for ExpiryServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn lookup_millis<F>(lookup: &F, var: &'static str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    let parsed = value.trim().parse::<u64>();
    match parsed {
        Ok(millis) => Ok(Some(Duration::from_millis(millis))),
        Err(_) => Err(ReclaimError::InvalidEnv { var, value }),
    }
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ReclaimError::InvalidEnv {
            var,
            value: value.to_owned(),
        }),
    }
}

// --- 2. Shared tracker ---
// --- 2. 共享跟踪器 ---

/// State shared between the service, its sweep thread and every entry.
pub(crate) struct Tracker {
    /// Entries currently Strong.
    pub(crate) live: PartitionedBag<dyn Expirable>,
    epoch: Instant,
    pub(crate) config: ExpiryConfig,
    shut_down: AtomicBool,
    sweeps: AtomicU64,
    demoted: AtomicU64,
}

impl Tracker {
    /// Milliseconds since the tracker was created.
    #[inline]
    pub(crate) fn now_millis(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    #[inline]
    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Demote every tracked entry whose deadline has passed.
    fn sweep(&self) -> usize {
        let now = self.now_millis();
        let expired = self.live.removing(|entry| entry.expires_at() <= now);
        let selected = expired.len();
        let mut demoted = 0;
        for entry in expired {
            if entry.expire(now, &self.live) {
                demoted += 1;
            }
        }

        self.sweeps.fetch_add(1, Ordering::Relaxed);
        self.demoted.fetch_add(demoted as u64, Ordering::Relaxed);
        if self.config.debug_logging {
            debug!(
                "sweep at {}ms: {} expired, {} demoted, {} still strong",
                now,
                selected,
                demoted,
                self.live.len()
            );
        }
        demoted
    }

    /// Sweep, logging instead of unwinding if dropping a referent panics.
    fn guarded_sweep(&self) -> usize {
        match panic::catch_unwind(AssertUnwindSafe(|| self.sweep())) {
            Ok(demoted) => demoted,
            Err(payload) => {
                error!("expiry sweep panicked: {}", panic_message(payload.as_ref()));
                0
            }
        }
    }
}

fn sweep_loop(tracker: Arc<Tracker>, stop: Receiver<()>) {
    let first = after(tracker.config.initial_sweep_delay);
    select! {
        recv(stop) -> _ => return,
        recv(first) -> _ => {}
    }

    let ticker = tick(tracker.config.sweep_period);
    loop {
        let demoted = tracker.guarded_sweep();
        trace!("periodic sweep demoted {} entries", demoted);
        select! {
            recv(stop) -> _ => break,
            recv(ticker) -> _ => {}
        }
    }
}

// --- 3. Service ---
// --- 3. 服务 ---

/// Shared expiry machinery for `TimedWeakRef`s.
///
/// The service owns the set of Strong entries, a sweep thread that demotes
/// expired entries (after `initial_sweep_delay`, then every `sweep_period`)
/// and a `Cleaner` that evicts entries whose referent was dropped.
///
/// It is created and shut down explicitly; dropping it shuts it down. Shutdown
/// stops the sweep thread, then demotes every entry that is still tracked in one
/// final pass and stops the cleaner.
///
/// 供 `TimedWeakRef` 共享的过期机制。
///
/// 服务拥有强条目集合、一个降级过期条目的扫描线程，以及一个在被引用对象被 drop
/// 后移除条目的 `Cleaner`。它被显式创建和关闭；drop 时会自动关闭。
pub struct ExpiryService {
    tracker: Arc<Tracker>,
    cleaner: Cleaner,
    stop_tx: Mutex<Option<Sender<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    name: String,
}

impl ExpiryService {
    /// Start a service with default settings.
    /// 使用默认设置启动服务。
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    #[inline]
    pub fn builder() -> ExpiryServiceBuilder {
        ExpiryServiceBuilder::new()
    }

    #[inline]
    pub(crate) fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    /// The cleaner evicting entries of dropped referents. It also accepts
    /// unrelated callbacks.
    #[inline]
    pub fn cleaner(&self) -> &Cleaner {
        &self.cleaner
    }

    #[inline]
    pub fn config(&self) -> &ExpiryConfig {
        &self.tracker.config
    }

    /// Run a sweep on the calling thread, returning how many entries were
    /// demoted. Does nothing after shutdown.
    ///
    /// 在调用线程上执行一次扫描，返回被降级的条目数量。
    pub fn sweep_now(&self) -> usize {
        if self.tracker.is_shut_down() {
            return 0;
        }
        self.tracker.guarded_sweep()
    }

    /// Number of entries currently Strong and tracked.
    /// 当前处于强状态并被跟踪的条目数量。
    #[inline]
    pub fn tracked_len(&self) -> usize {
        self.tracker.live.len()
    }

    /// Completed sweeps, periodic and manual.
    #[inline]
    pub fn sweeps(&self) -> u64 {
        self.tracker.sweeps.load(Ordering::Relaxed)
    }

    /// Entries demoted by sweeps so far.
    #[inline]
    pub fn demoted(&self) -> u64 {
        self.tracker.demoted.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_shut_down(&self) -> bool {
        self.tracker.is_shut_down()
    }

    /// Stop the sweep thread, demote every tracked entry and stop the cleaner.
    /// Idempotent.
    ///
    /// 停止扫描线程，降级所有被跟踪的条目并停止清理线程。可重复调用。
    pub fn shutdown(&self) {
        if self.tracker.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        drop(self.stop_tx.lock().take());
        join_worker(&self.sweeper, &self.name);

        let drained = self.tracker.live.drain();
        for entry in &drained {
            entry.release();
        }
        self.cleaner.shutdown();
        info!(
            "{} shut down, released {} tracked entries",
            self.name,
            drained.len()
        );
    }
}

impl Drop for ExpiryService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ExpiryService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpiryService")
            .field("name", &self.name)
            .field("tracked", &self.tracked_len())
            .field("sweeps", &self.sweeps())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
