// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! "Peek without loss" (§4.D): wraps the outbound-side [`PipeReader`] so
//! sniffers can inspect a growing prefix while the outbound handler still
//! receives the full, ordered original byte stream.

use std::{collections::VecDeque, time::Duration};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{SniffResult, Sniffer};
use crate::{
    buffer::MultiBuffer,
    error::CoreError,
    pipe::PipeRead,
};

/// Default per-attempt read budget (§4.D: "100 ms budget").
pub const SNIFF_READ_BUDGET: Duration = Duration::from_millis(100);

/// Maximum total read attempts before the loop gives up (§4.D).
pub const MAX_SNIFF_ATTEMPTS: u32 = 2;

pub struct CachedReader {
    upstream: Box<dyn PipeRead>,
    cache: Mutex<VecDeque<MultiBuffer>>,
    cache_limit: usize,
    read_budget: Duration,
}

impl CachedReader {
    pub fn new(upstream: impl PipeRead + 'static, cache_limit: usize) -> Self {
        Self::with_read_budget(upstream, cache_limit, SNIFF_READ_BUDGET)
    }

    /// As `new`, but with an explicit per-attempt read budget (§4.D),
    /// normally sourced from `SnifferConfig::probe_timeout`.
    pub fn with_read_budget(upstream: impl PipeRead + 'static, cache_limit: usize, read_budget: Duration) -> Self {
        Self { upstream: Box::new(upstream), cache: Mutex::new(VecDeque::new()), cache_limit, read_budget }
    }

    pub fn cache_limit(&self) -> usize {
        self.cache_limit
    }

    async fn cached_len(&self) -> usize {
        self.cache.lock().await.iter().map(MultiBuffer::len).sum()
    }

    /// One sniff attempt: if there is still cache headroom, pull one more
    /// chunk from upstream (bounded by `read_budget`) and append it to the
    /// cache; return the concatenated cached prefix either way.
    pub async fn sniff_attempt(&self) -> Result<Vec<u8>, CoreError> {
        let mut cache = self.cache.lock().await;
        let current: usize = cache.iter().map(MultiBuffer::len).sum();
        if current < self.cache_limit {
            match self.upstream.read_timeout(self.read_budget).await {
                Ok(mb) => cache.push_back(mb),
                Err(CoreError::ReadTimeout) => {},
                Err(e) => return Err(e),
            }
        }
        let mut out = Vec::with_capacity(cache.iter().map(MultiBuffer::len).sum());
        for mb in cache.iter() {
            out.extend_from_slice(&mb.to_vec());
        }
        Ok(out)
    }

    /// Real read path used by the outbound handler: drains the cache in
    /// FIFO order first, then falls through to the upstream reader, so the
    /// handler sees the original stream in order regardless of how many
    /// `sniff_attempt` calls happened in between.
    pub async fn read(&self) -> Result<MultiBuffer, CoreError> {
        {
            let mut cache = self.cache.lock().await;
            if let Some(mb) = cache.pop_front() {
                return Ok(mb);
            }
        }
        self.upstream.read().await
    }
}

impl PipeRead for CachedReader {
    fn read<'a>(&'a self) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<MultiBuffer, CoreError>> + Send + 'a>> {
        Box::pin(CachedReader::read(self))
    }

    fn interrupt(&self) {
        self.upstream.interrupt();
    }
}

/// Outcome of a full sniff loop (§4.D). `NoDecision` covers every
/// recoverable case the dispatcher treats as "fall through to
/// metadata-only": `UnknownContent`, `SniffingTimeout`, cache-full, and
/// cancellation.
pub enum SniffOutcome {
    Matched { protocol: String, domain: String },
    NoDecision,
}

/// Run the sniff loop (§4.D): try every sniffer against the growing cached
/// prefix, terminating on a match, a hard error, a full cache, a cancelled
/// context, or after `MAX_SNIFF_ATTEMPTS` read attempts.
pub async fn run_sniff_loop(
    cached: &CachedReader,
    sniffers: &[std::sync::Arc<dyn Sniffer>],
    cancel: &CancellationToken,
) -> Result<SniffOutcome, CoreError> {
    for _ in 0..MAX_SNIFF_ATTEMPTS {
        if cancel.is_cancelled() {
            return Ok(SniffOutcome::NoDecision);
        }

        let prefix = match cached.sniff_attempt().await {
            Ok(p) => p,
            Err(CoreError::EndOfStream) => return Ok(SniffOutcome::NoDecision),
            Err(CoreError::PipeInterrupted) => return Err(CoreError::PipeInterrupted),
            Err(_) => return Ok(SniffOutcome::NoDecision),
        };

        for s in sniffers {
            match s.sniff(&prefix) {
                SniffResult::Match { protocol, domain } => {
                    return Ok(SniffOutcome::Matched { protocol, domain });
                },
                SniffResult::Error => return Ok(SniffOutcome::NoDecision),
                SniffResult::NoClue => continue,
            }
        }

        if cached.cached_len().await >= cached.cache_limit() {
            return Ok(SniffOutcome::NoDecision);
        }
    }
    Ok(SniffOutcome::NoDecision)
}
