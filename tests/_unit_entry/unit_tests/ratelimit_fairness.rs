// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Instant};

use relay_core::{
    buffer::{Buffer, MultiBuffer},
    pipe::{self, PipeOptions, PipeWrite},
    ratelimit::{RateLimitedWriter, TokenBucket},
};
use tokio_util::sync::CancellationToken;

fn mb_of(len: usize) -> MultiBuffer {
    let mut b = Buffer::new();
    b.write(&vec![0xAu8; len]).expect("write");
    MultiBuffer::from_buffer(b)
}

/// §8 scenario 6: 5 writers sharing one bucket (rate=10 KiB/s, burst=1
/// KiB), each writing 4 KiB, must together take roughly
/// aggregate/rate ≈ 2 s — not each finishing independently in ~0.4 s as
/// they would with a per-writer bucket.
#[tokio::test]
async fn five_writers_sharing_one_bucket_are_bounded_by_the_aggregate_rate() {
    const RATE: u64 = 10 * 1024;
    const BURST: u64 = 1024;
    const PER_WRITER: usize = 4 * 1024;
    const WRITERS: usize = 5;

    let bucket = Arc::new(TokenBucket::new(RATE, BURST));

    let mut drains = Vec::new();
    let mut writers = Vec::new();
    for _ in 0..WRITERS {
        let (r, w) = pipe::pipe(PipeOptions::unbounded());
        let limiter = RateLimitedWriter::new(w, bucket.clone(), CancellationToken::new());
        drains.push(tokio::spawn(async move {
            let mut got = 0usize;
            while got < PER_WRITER {
                match r.read().await {
                    Ok(mb) => got += mb.len(),
                    Err(_) => break,
                }
            }
        }));
        writers.push(tokio::spawn(async move {
            limiter.write(mb_of(PER_WRITER)).await.expect("write");
            limiter.close();
        }));
    }

    let start = Instant::now();
    for w in writers {
        w.await.expect("writer task panicked");
    }
    for d in drains {
        d.await.expect("drain task panicked");
    }
    let elapsed = start.elapsed();

    assert!(elapsed >= std::time::Duration::from_millis(1500), "finished too fast for a shared bucket: {elapsed:?}");
    assert!(elapsed <= std::time::Duration::from_secs(3), "took unexpectedly long: {elapsed:?}");
}
