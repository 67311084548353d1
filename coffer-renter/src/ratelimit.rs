use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// Direction of piece data relative to the renter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

#[derive(Debug)]
struct TokenBucket {
    rate: u64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: u64) -> TokenBucket {
        TokenBucket {
            rate,
            tokens: rate as f64,
            last_refill: Instant::now(),
        }
    }

    fn set_rate(&mut self, rate: u64) {
        self.refill();
        self.rate = rate;
        self.tokens = self.tokens.min(rate as f64);
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate as f64).min(self.rate as f64);
        self.last_refill = now;
    }

    /// Take up to `want` tokens, or report how long until they are available.
    fn take(&mut self, want: u64) -> Result<u64, Duration> {
        if self.rate == 0 {
            return Ok(want);
        }
        self.refill();
        let want = want.min(self.rate);
        if self.tokens >= want as f64 {
            self.tokens -= want as f64;
            Ok(want)
        } else {
            let missing = want as f64 - self.tokens;
            Err(Duration::from_secs_f64(missing / self.rate as f64))
        }
    }
}

/// Process-wide bandwidth limits for piece data. A rate of zero is unlimited.
///
/// Each direction is a token bucket refilled at `rate` bytes per second and
/// holding at most one second of burst.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    download: Arc<Mutex<TokenBucket>>,
    upload: Arc<Mutex<TokenBucket>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        RateLimiter::new(0, 0)
    }
}

impl RateLimiter {
    pub fn new(download: u64, upload: u64) -> RateLimiter {
        RateLimiter {
            download: Arc::new(Mutex::new(TokenBucket::new(download))),
            upload: Arc::new(Mutex::new(TokenBucket::new(upload))),
        }
    }

    /// Change limits. Transfers already waiting pick up the new rate on
    /// their next refill.
    pub fn set_limits(&self, download: u64, upload: u64) {
        self.download.lock().set_rate(download);
        self.upload.lock().set_rate(upload);
    }

    pub fn limits(&self) -> (u64, u64) {
        (self.download.lock().rate, self.upload.lock().rate)
    }

    /// Wait until `bytes` may be transferred in `direction`.
    pub async fn acquire(&self, direction: Direction, bytes: usize) {
        let bucket = match direction {
            Direction::Download => &self.download,
            Direction::Upload => &self.upload,
        };
        let mut remaining = bytes as u64;
        while remaining > 0 {
            let taken = bucket.lock().take(remaining);
            match taken {
                Ok(n) => remaining -= n,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }
}
