// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    pin::Pin,
    sync::Arc,
};

use anyhow::{Context, Result};
use relay_core::{
    buffer::{Buffer, MultiBuffer},
    cfg::{cli::resolve_config_path, config::Config, logger::init_logger_from_config},
    destination::{Address, Destination},
    dispatch::{DispatchTarget, Dispatcher, OutboundHandler, OutboundHandlerRegistry, RequestCtx},
    error::CoreError,
    pipe::{Link, PipeOptions},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Outbound handler that just echoes whatever it reads back to the writer.
/// Stands in for a real protocol backend in this demo binary.
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

/// Toy inbound: accept one TCP connection, dispatch it through the core,
/// and pump bytes between the socket and the dispatched `Link` until
/// either side closes.
async fn serve_one_connection(dispatcher: Arc<Dispatcher>) -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await.context("bind demo listener")?;
    info!(addr = %listener.local_addr()?, "listening for one demo connection");

    let (mut socket, peer) = listener.accept().await.context("accept")?;
    info!(%peer, "accepted connection");

    let ctx = RequestCtx::new(CancellationToken::new());
    let target = DispatchTarget::new(Destination::tcp(Address::Domain("demo.local".to_string()), 0));

    let link = dispatcher.dispatch(ctx, target);

    let (mut sock_read, mut sock_write) = socket.split();

    let write_side = async {
        let mut buf = vec![0u8; 4096];
        loop {
            let n = sock_read.read(&mut buf).await.context("read from socket")?;
            if n == 0 {
                link.writer.close();
                break;
            }
            let mut b = Buffer::new();
            b.write(&buf[..n]).context("buffer write")?;
            if link.writer.write(MultiBuffer::from_buffer(b)).await.is_err() {
                break;
            }
        }
        Ok::<(), anyhow::Error>(())
    };

    let read_side = async {
        loop {
            match link.reader.read().await {
                Ok(mb) => sock_write.write_all(&mb.to_vec()).await.context("write to socket")?,
                Err(_) => break,
            }
        }
        Ok::<(), anyhow::Error>(())
    };

    tokio::try_join!(write_side, read_side)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = resolve_config_path("config.yaml").and_then(Config::load_from_file).unwrap_or_else(|_| Config::default());

    let _logger_guard = init_logger_from_config(&cfg.logging)?;

    let outbounds = Arc::new(SingleHandlerRegistry(Arc::new(EchoHandler)));
    let mut dispatcher = Dispatcher::new(outbounds);
    dispatcher.pipe_options = PipeOptions { size_limit: cfg.pipe.default_size_limit, discard_overflow: cfg.pipe.discard_overflow, on_transmission: None };
    dispatcher.sniff_cache_limit = cfg.sniffer.max_buffered_bytes;
    dispatcher.sniff_probe_timeout = cfg.sniffer.probe_timeout;
    dispatcher.default_rate_bytes_per_sec = cfg.ratelimit.default_rate_bytes_per_sec;
    dispatcher.default_burst_bytes = cfg.ratelimit.default_burst_bytes;
    let dispatcher = Arc::new(dispatcher);

    if let Err(e) = serve_one_connection(dispatcher).await {
        error!(error = %e, "demo connection handling failed");
    }

    Ok(())
}
