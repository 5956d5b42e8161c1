// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{pin::Pin, sync::Arc};

use relay_core::{
    destination::{Address, Destination},
    dispatch::{Dispatcher, OutboundHandler, OutboundHandlerRegistry, RequestCtx},
    error::CoreError,
    mux::{ClientStrategy, ClientWorker, ServerWorker},
    pipe::{self, Link, PipeOptions, PipeWrite},
};
use tokio_util::sync::CancellationToken;

struct EchoHandler;

impl OutboundHandler for EchoHandler {
    fn tag(&self) -> &str {
        "echo"
    }

    fn dispatch<'a>(
        &'a self,
        _target: &'a Destination,
        link: Link,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<(), CoreError>> + Send + 'a>> {
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

/// Three independent logical flows, dispatched concurrently over one
/// underlying Mux connection, must be delivered back to the right
/// caller without their payloads crossing streams.
#[tokio::test]
async fn three_concurrent_substreams_stay_independent() {
    let (underlying_client_reader, underlying_client_writer) = pipe::pipe(PipeOptions::unbounded());
    let (underlying_server_reader, underlying_server_writer) = pipe::pipe(PipeOptions::unbounded());

    let client_link = Link { reader: Box::new(underlying_client_reader), writer: Box::new(underlying_server_writer) };
    let server_link = Link { reader: Box::new(underlying_server_reader), writer: Box::new(underlying_client_writer) };

    let outbounds = Arc::new(SingleHandlerRegistry(Arc::new(EchoHandler)));
    let dispatcher = Arc::new(Dispatcher::new(outbounds));
    ServerWorker::spawn(server_link, dispatcher, PipeOptions::default(), false);

    let client = ClientWorker::spawn(client_link, ClientStrategy::default());

    let payloads: [(&str, &[u8]); 3] = [("a.example.com", b"first"), ("b.example.com", b"second"), ("c.example.com", b"third")];

    let mut callers = Vec::new();
    for (host, payload) in payloads {
        let (caller_in_reader, caller_in_writer) = pipe::pipe(PipeOptions::unbounded());
        let (caller_out_reader, caller_out_writer) = pipe::pipe(PipeOptions::unbounded());
        let caller_link = Link { reader: Box::new(caller_in_reader), writer: Box::new(caller_out_writer) };

        let ctx = RequestCtx::new(CancellationToken::new());
        client.dispatch(&ctx, Destination::tcp(Address::Domain(host.to_string()), 443), caller_link, None);

        caller_in_writer.write(mb_of(payload)).await.expect("write");
        callers.push((caller_out_reader, caller_in_writer, payload));
    }

    for (reader, _writer, payload) in &callers {
        let got = reader.read().await.expect("read echo");
        assert_eq!(got.to_vec(), *payload);
    }
}
