// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Token-bucket rate limiting (§3, §4.C). A [`TokenBucket`] is shared per
//! user email so that aggregate throughput across all of a user's
//! concurrent conduits is bounded by `rate`, not per-conduit.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{buffer::MultiBuffer, error::CoreError, pipe::PipeWrite};

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket parameters keyed by user identity (§3 `RateBucket`).
pub struct TokenBucket {
    rate_bytes_per_sec: f64,
    burst_bytes: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate_bytes_per_sec: u64, burst_bytes: u64) -> Self {
        Self {
            rate_bytes_per_sec: rate_bytes_per_sec as f64,
            burst_bytes: burst_bytes as f64,
            state: Mutex::new(BucketState { tokens: burst_bytes as f64, last_refill: Instant::now() }),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate_bytes_per_sec <= 0.0
    }

    pub fn burst_bytes(&self) -> u64 {
        self.burst_bytes as u64
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_bytes_per_sec).min(self.burst_bytes);
        state.last_refill = now;
    }

    /// Await until `n` tokens are available, then deduct them. Cancellable:
    /// a cancelled `cancel` token unblocks immediately without consuming
    /// tokens, and the bucket's internal lock is not held across the
    /// select so other waiters are not starved by a cancelled task.
    pub async fn take_n(&self, n: u64, cancel: &CancellationToken) -> Result<(), CoreError> {
        if self.is_unlimited() {
            return Ok(());
        }
        let n = n as f64;
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);
                if state.tokens >= n {
                    state.tokens -= n;
                    return Ok(());
                }
                let deficit = n - state.tokens;
                Duration::from_secs_f64(deficit / self.rate_bytes_per_sec)
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(CoreError::PipeInterrupted),
                _ = tokio::time::sleep(wait) => {},
            }
        }
    }
}

/// Process-wide registry of per-user-email buckets (§5: "entries persist
/// for the process lifetime unless an operator removes them").
pub static BUCKETS: Lazy<DashMap<String, Arc<TokenBucket>>> = Lazy::new(DashMap::new);

/// Return the shared bucket for `email`, creating it with `(rate, burst)`
/// if this is the first conduit for that user.
pub fn bucket_for_user(email: &str, rate_bytes_per_sec: u64, burst_bytes: u64) -> Arc<TokenBucket> {
    BUCKETS
        .entry(email.to_string())
        .or_insert_with(|| Arc::new(TokenBucket::new(rate_bytes_per_sec, burst_bytes)))
        .clone()
}

/// Wraps any [`PipeWrite`] side, metering every write through a shared
/// [`TokenBucket`] in chunks no larger than the bucket's burst size
/// (§4.C). A `rate = 0` bucket is a transparent pass-through. Implements
/// `PipeWrite` itself so it can stand in as a `Link`'s writer, or be
/// nested under another decorator such as a traffic counter.
pub struct RateLimitedWriter {
    inner: Box<dyn PipeWrite>,
    bucket: Arc<TokenBucket>,
    cancel: CancellationToken,
}

impl RateLimitedWriter {
    pub fn new(inner: impl PipeWrite + 'static, bucket: Arc<TokenBucket>, cancel: CancellationToken) -> Self {
        Self { inner: Box::new(inner), bucket, cancel }
    }

    async fn write_impl(&self, mb: MultiBuffer) -> Result<(), CoreError> {
        if self.bucket.is_unlimited() {
            return self.inner.write(mb).await;
        }

        let burst = self.bucket.burst_bytes().max(1) as usize;
        let mut remaining = mb;
        loop {
            if remaining.is_empty() {
                return Ok(());
            }
            let take = burst.min(remaining.len());
            let mut rest = remaining.split_at(take);

            if let Err(e) = self.bucket.take_n(take as u64, &self.cancel).await {
                remaining.release_all();
                rest.release_all();
                return Err(e);
            }

            if let Err(e) = self.inner.write(remaining).await {
                rest.release_all();
                return Err(e);
            }
            remaining = rest;
        }
    }

    pub async fn write(&self, mb: MultiBuffer) -> Result<(), CoreError> {
        self.write_impl(mb).await
    }

    pub fn close(&self) {
        self.inner.close();
    }
}

impl PipeWrite for RateLimitedWriter {
    fn write<'a>(
        &'a self,
        mb: MultiBuffer,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), CoreError>> + Send + 'a>> {
        Box::pin(self.write_impl(mb))
    }

    fn close(&self) {
        RateLimitedWriter::close(self)
    }

    fn interrupt(&self) {
        self.inner.interrupt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{buffer::Buffer, pipe};

    fn mb_of(len: usize) -> MultiBuffer {
        let mut b = Buffer::new();
        b.write(&vec![0u8; len]).expect("write");
        MultiBuffer::from_buffer(b)
    }

    #[tokio::test]
    async fn single_writer_rate_cap_takes_expected_time() {
        let (r, w) = pipe::pipe(pipe::PipeOptions::unbounded());
        let bucket = Arc::new(TokenBucket::new(64 * 1024, 64 * 1024));
        let limiter = RateLimitedWriter::new(w, bucket, CancellationToken::new());

        let drainer = tokio::spawn(async move {
            let mut total = 0usize;
            loop {
                match r.read().await {
                    Ok(mb) => total += mb.len(),
                    Err(_) => break,
                }
                if total >= 256 * 1024 {
                    break;
                }
            }
        });

        let start = Instant::now();
        limiter.write(mb_of(256 * 1024)).await.expect("write");
        limiter.close();
        drainer.await.expect("drainer task panicked");
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn zero_rate_is_pass_through() {
        let (r, w) = pipe::pipe(pipe::PipeOptions::unbounded());
        let bucket = Arc::new(TokenBucket::new(0, 0));
        let limiter = RateLimitedWriter::new(w, bucket, CancellationToken::new());
        limiter.write(mb_of(1024)).await.expect("write");
        limiter.close();
        let got = r.read().await.expect("read");
        assert_eq!(got.len(), 1024);
    }

    #[tokio::test]
    async fn cancel_unblocks_pending_take() {
        let cancel = CancellationToken::new();
        let bucket = Arc::new(TokenBucket::new(1, 1));
        // Drain the single token so the next take_n must wait.
        bucket.take_n(1, &cancel).await.expect("drain initial token");

        let cancel2 = cancel.clone();
        let bucket2 = bucket.clone();
        let task = tokio::spawn(async move { bucket2.take_n(1_000_000, &cancel2).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        let res = task.await.expect("task panicked");
        assert_eq!(res, Err(CoreError::PipeInterrupted));
    }
}
