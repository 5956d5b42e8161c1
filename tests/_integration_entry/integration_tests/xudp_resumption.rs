// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::Ipv4Addr,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use relay_core::{
    destination::{Address, Destination},
    dispatch::{Dispatcher, OutboundHandler, OutboundHandlerRegistry},
    error::CoreError,
    mux::{FrameFlags, FrameMetadata, FrameReader, FrameStatus, FrameWriter, ServerWorker, SessionFrame},
    pipe::{self, Link, PipeOptions, PipeWrite},
};

/// Echoes like the other tests' `EchoHandler`, but counts how many times
/// it was dispatched, so a test can tell a resumed flow apart from one
/// that reopened a fresh outbound connection.
struct CountingEchoHandler(Arc<AtomicUsize>);

impl OutboundHandler for CountingEchoHandler {
    fn tag(&self) -> &str {
        "echo"
    }

    fn dispatch<'a>(
        &'a self,
        _target: &'a Destination,
        link: Link,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), CoreError>> + Send + 'a>> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            loop {
                match link.reader.read().await {
                    Ok(mb) => {
                        if link.writer.write(mb).await.is_err() {
                            break;
                        }
                    },
                    Err(_) => break,
                }
            }
            link.writer.close();
            Ok(())
        })
    }
}

struct SingleHandlerRegistry(Arc<dyn OutboundHandler>);

impl OutboundHandlerRegistry for SingleHandlerRegistry {
    fn get(&self, tag: &str) -> Option<Arc<dyn OutboundHandler>> {
        (tag == self.0.tag()).then(|| self.0.clone())
    }

    fn default_handler(&self) -> Option<Arc<dyn OutboundHandler>> {
        Some(self.0.clone())
    }
}

fn mb_of(s: &[u8]) -> relay_core::buffer::MultiBuffer {
    let mut b = relay_core::buffer::Buffer::new();
    b.write(s).expect("write");
    relay_core::buffer::MultiBuffer::from_buffer(b)
}

fn new_udp_frame(session_id: u16, global_id: [u8; 8], payload: &[u8]) -> SessionFrame {
    SessionFrame {
        meta: FrameMetadata {
            session_id,
            status: FrameStatus::New,
            flags: FrameFlags::HAS_DATA,
            target: Some(Destination::udp(Address::V4(Ipv4Addr::new(8, 8, 8, 8)), 53)),
            inbound_source: None,
            inbound_local: None,
            global_id: Some(global_id),
        },
        payload: Some(mb_of(payload)),
    }
}

/// §8 "XUDP resumption": two literal New+UDP frames sharing a GlobalID,
/// driven over the wire at a live `ServerWorker`, must make the second
/// frame inherit the first's already-dispatched underlying link rather
/// than dispatching a fresh one.
#[tokio::test]
async fn second_new_frame_with_same_global_id_resumes_instead_of_redispatching() {
    let dispatch_count = Arc::new(AtomicUsize::new(0));
    let outbounds = Arc::new(SingleHandlerRegistry(Arc::new(CountingEchoHandler(dispatch_count.clone()))));
    let dispatcher = Arc::new(Dispatcher::new(outbounds));

    let (client_reader, client_writer) = pipe::pipe(PipeOptions::unbounded());
    let (server_reader, server_writer) = pipe::pipe(PipeOptions::unbounded());
    let worker_link = Link { reader: Box::new(server_reader), writer: Box::new(client_writer) };
    let _worker = ServerWorker::spawn(worker_link, dispatcher, PipeOptions::unbounded(), false);

    let client_frame_writer = FrameWriter::new(server_writer);
    let mut client_frame_reader = FrameReader::new(client_reader);

    let global_id = [0x51u8; 8];

    client_frame_writer.write_frame(&new_udp_frame(1, global_id, b"first")).await.expect("write first New frame");
    let first_echo = client_frame_reader.read_frame(|_| Some(relay_core::destination::Network::Udp), false).await.expect("read first echo");
    assert_eq!(first_echo.meta.session_id, 1);
    assert_eq!(first_echo.payload.expect("payload").to_vec(), b"first");

    client_frame_writer.write_frame(&new_udp_frame(2, global_id, b"second")).await.expect("write resuming New frame");
    let second_echo = client_frame_reader.read_frame(|_| Some(relay_core::destination::Network::Udp), false).await.expect("read second echo");
    assert_eq!(second_echo.meta.session_id, 2);
    assert_eq!(second_echo.payload.expect("payload").to_vec(), b"second");

    assert_eq!(dispatch_count.load(Ordering::SeqCst), 1, "resumed GlobalID must not re-dispatch a fresh outbound flow");
}
