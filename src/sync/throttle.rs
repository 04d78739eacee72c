//! Download pacing.
//!
//! Every fetch task of a pass draws from one token bucket, so the limit
//! applies to the pass as a whole rather than per object.

use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;

type Bucket = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// One token pays for this many bytes, keeping large limits inside a `u32` quota.
const TOKEN_BYTES: u64 = 1024;

/// Aggregate download ceiling, 0 meaning none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BandwidthLimit {
    pub bytes_per_second: u64,
}

impl BandwidthLimit {
    pub fn new(bytes_per_second: u64) -> Self {
        Self { bytes_per_second }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn is_limited(&self) -> bool {
        self.bytes_per_second != 0
    }

    fn tokens_per_second(&self) -> Option<NonZeroU32> {
        if !self.is_limited() {
            return None;
        }
        let tokens = (self.bytes_per_second / TOKEN_BYTES).clamp(1, u64::from(u32::MAX));
        NonZeroU32::new(tokens as u32)
    }
}

impl std::fmt::Display for BandwidthLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_limited() {
            write!(
                f,
                "{}/s",
                humansize::format_size(self.bytes_per_second, humansize::DECIMAL)
            )
        } else {
            f.write_str("unlimited")
        }
    }
}

/// Shared pacing handle. Clones draw from the same bucket.
#[derive(Clone, Default)]
pub struct BandwidthLimiter {
    bucket: Option<Arc<Bucket>>,
    limit: BandwidthLimit,
}

impl BandwidthLimiter {
    pub fn new(limit: BandwidthLimit) -> Self {
        let bucket = limit
            .tokens_per_second()
            .map(|rate| Arc::new(RateLimiter::direct(Quota::per_second(rate))));
        Self { bucket, limit }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn limit(&self) -> BandwidthLimit {
        self.limit
    }

    /// Wait until `bytes` more may be written.
    ///
    /// Chunks larger than the bucket are paid for in bucket-sized slices.
    pub async fn acquire(&self, bytes: usize) {
        let (Some(bucket), Some(burst)) = (&self.bucket, self.limit.tokens_per_second()) else {
            return;
        };
        let mut owed = (bytes as u64).div_ceil(TOKEN_BYTES).max(1);
        while owed > 0 {
            let slice = owed.min(u64::from(burst.get()));
            owed -= slice;
            if let Some(n) = NonZeroU32::new(slice as u32) {
                // Never exceeds the burst, so capacity errors cannot occur
                let _ = bucket.until_n_ready(n).await;
            }
        }
    }
}

impl std::fmt::Debug for BandwidthLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BandwidthLimiter({})", self.limit)
    }
}
