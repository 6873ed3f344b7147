use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::{LimitsConfig, CPU_INTENSITY_UNLIMITED};

/// Throttle values that may change while a backup runs. Read at every
/// upload progress callback.
#[derive(Debug, Default)]
pub struct LiveTunables {
    upload_bytes_per_sec: AtomicU64,
    download_bytes_per_sec: AtomicU64,
}

impl LiveTunables {
    pub fn from_config(limits: &LimitsConfig) -> Self {
        Self {
            upload_bytes_per_sec: AtomicU64::new(limits.upload_bytes_per_sec()),
            download_bytes_per_sec: AtomicU64::new(limits.download_bytes_per_sec()),
        }
    }

    /// Upload rate in bytes/s (0 = unlimited).
    pub fn upload_rate(&self) -> u64 {
        self.upload_bytes_per_sec.load(Ordering::Relaxed)
    }

    pub fn set_upload_rate(&self, bytes_per_sec: u64) {
        self.upload_bytes_per_sec.store(bytes_per_sec, Ordering::Relaxed);
    }

    /// Local read rate for upload sources in bytes/s (0 = unlimited).
    pub fn download_rate(&self) -> u64 {
        self.download_bytes_per_sec.load(Ordering::Relaxed)
    }

    pub fn set_download_rate(&self, bytes_per_sec: u64) {
        self.download_bytes_per_sec.store(bytes_per_sec, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct LimiterState {
    bytes_per_sec: u64,
    start: Instant,
    bytes_consumed: u128,
}

/// Process-local byte-rate limiter. The rate can be changed at any time;
/// a change restarts the accounting window.
#[derive(Debug)]
pub struct ByteRateLimiter {
    state: Mutex<LimiterState>,
}

impl ByteRateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                bytes_per_sec,
                start: Instant::now(),
                bytes_consumed: 0,
            }),
        }
    }

    pub fn set_rate(&self, bytes_per_sec: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.bytes_per_sec != bytes_per_sec {
            state.bytes_per_sec = bytes_per_sec;
            state.start = Instant::now();
            state.bytes_consumed = 0;
        }
    }

    pub fn rate(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .bytes_per_sec
    }

    /// Account for `bytes` and sleep until the running average is back under
    /// the rate.
    pub fn consume(&self, bytes: usize) {
        let delay = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if bytes == 0 || state.bytes_per_sec == 0 {
                return;
            }
            state.bytes_consumed = state.bytes_consumed.saturating_add(bytes as u128);
            let elapsed_secs = state.start.elapsed().as_secs_f64();
            let expected_secs = state.bytes_consumed as f64 / state.bytes_per_sec as f64;
            (expected_secs > elapsed_secs).then(|| expected_secs - elapsed_secs)
        };
        if let Some(secs) = delay {
            std::thread::sleep(Duration::from_secs_f64(secs));
        }
    }
}

/// Reader that feeds every read through a [`ByteRateLimiter`], re-sampling
/// its rate from [`LiveTunables`] before each read.
pub struct ThrottledReader<R> {
    inner: R,
    limiter: ByteRateLimiter,
    tunables: Arc<LiveTunables>,
}

impl<R: Read> ThrottledReader<R> {
    pub fn new(inner: R, tunables: Arc<LiveTunables>) -> Self {
        let limiter = ByteRateLimiter::new(tunables.download_rate());
        Self {
            inner,
            limiter,
            tunables,
        }
    }
}

impl<R: Read> Read for ThrottledReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.limiter.set_rate(self.tunables.download_rate());
        let n = self.inner.read(buf)?;
        self.limiter.consume(n);
        Ok(n)
    }
}

/// Limits a worker to `intensity` tenths of each one-second window.
///
/// Work is measured between [`start`](Self::start) and
/// [`finish`](Self::finish); once the window's budget is spent the worker
/// sleeps out the rest of the window.
#[derive(Debug)]
pub struct CpuThrottle {
    budget: Option<Duration>,
    window_start: Instant,
    busy: Duration,
}

const CPU_WINDOW: Duration = Duration::from_secs(1);

impl CpuThrottle {
    pub fn new(intensity: u8) -> Self {
        let budget = (intensity < CPU_INTENSITY_UNLIMITED)
            .then(|| CPU_WINDOW / CPU_INTENSITY_UNLIMITED as u32 * intensity.max(1) as u32);
        Self {
            budget,
            window_start: Instant::now(),
            busy: Duration::ZERO,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.budget.is_some()
    }

    pub fn start(&self) -> Instant {
        Instant::now()
    }

    /// Record the work done since `started`; returns how long it slept.
    pub fn finish(&mut self, started: Instant) -> Duration {
        let Some(budget) = self.budget else {
            return Duration::ZERO;
        };
        let now = Instant::now();
        if now.duration_since(self.window_start) >= CPU_WINDOW {
            self.window_start = now;
            self.busy = Duration::ZERO;
        }
        self.busy += now.duration_since(started);
        if self.busy < budget {
            return Duration::ZERO;
        }
        let rest = CPU_WINDOW.saturating_sub(now.duration_since(self.window_start));
        if !rest.is_zero() {
            std::thread::sleep(rest);
        }
        self.window_start = Instant::now();
        self.busy = Duration::ZERO;
        rest
    }
}
