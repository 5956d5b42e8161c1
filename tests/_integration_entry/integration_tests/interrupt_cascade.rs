// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use relay_core::{
    destination::{Address, Destination},
    dispatch::RequestCtx,
    error::CoreError,
    mux::{ClientStrategy, ClientWorker, FrameReader, FrameStatus, FrameWriter},
    pipe::{self, Link, PipeOptions},
};
use tokio_util::sync::CancellationToken;

fn mb_of(s: &[u8]) -> relay_core::buffer::MultiBuffer {
    let mut b = relay_core::buffer::Buffer::new();
    b.write(s).expect("write");
    relay_core::buffer::MultiBuffer::from_buffer(b)
}

/// Acts as the far end of a Mux worker's underlying link just long enough
/// to observe `count` `New` frames, then returns — dropping its own
/// `FrameWriter` and ending the fake connection, the same as a peer
/// closing the socket out from under the worker.
async fn drop_link_after_n_new_frames(mut reader: FrameReader, _writer: FrameWriter, count: usize) {
    let mut seen = 0usize;
    while seen < count {
        match reader.read_frame(|_| None, false).await {
            Ok(frame) if matches!(frame.meta.status, FrameStatus::New) => seen += 1,
            Ok(_) => {},
            Err(_) => break,
        }
    }
}

/// §8 scenario 4: closing a Mux worker's underlying link must cause every
/// one of its substreams' readers to observe a terminal error, not hang.
#[tokio::test]
async fn closing_underlying_link_cascades_to_every_substream() {
    let (underlying_a_reader, underlying_a_writer) = pipe::pipe(PipeOptions::unbounded());
    let (underlying_b_reader, underlying_b_writer) = pipe::pipe(PipeOptions::unbounded());

    let worker_link = Link { reader: Box::new(underlying_a_reader), writer: Box::new(underlying_b_writer) };
    let peer_reader = FrameReader::new(underlying_b_reader);
    let peer_writer = FrameWriter::new(underlying_a_writer);
    tokio::spawn(drop_link_after_n_new_frames(peer_reader, peer_writer, 3));

    let worker = ClientWorker::spawn(worker_link, ClientStrategy::default());

    let mut caller_out_readers = Vec::new();
    for i in 0..3u16 {
        let (caller_in_reader, caller_in_writer) = pipe::pipe(PipeOptions::unbounded());
        let (caller_out_reader, caller_out_writer) = pipe::pipe(PipeOptions::unbounded());
        let caller_link = Link { reader: Box::new(caller_in_reader), writer: Box::new(caller_out_writer) };

        let ctx = RequestCtx::new(CancellationToken::new());
        worker.dispatch(&ctx, Destination::tcp(Address::Domain(format!("sub{i}.example.com")), 9000), caller_link, None);
        caller_in_writer.write(mb_of(b"hello")).await.expect("write first payload");
        // Keep each substream's input side open for the rest of the test;
        // the underlying link closing, not an EOF from the caller, is
        // what must end these substreams.
        std::mem::forget(caller_in_writer);
        caller_out_readers.push(caller_out_reader);
    }

    for reader in caller_out_readers {
        let result = tokio::time::timeout(Duration::from_millis(500), async {
            loop {
                match reader.read().await {
                    Ok(_) => continue,
                    Err(e) => return e,
                }
            }
        })
        .await
        .expect("every substream must observe a terminal error, not hang");
        assert!(matches!(result, CoreError::EndOfStream | CoreError::PipeInterrupted));
    }
}
