// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-user traffic counters (§4.E: "wrap the inbound writer and outbound
//! writer in a size-counting writer that atomically adds bytes written to
//! a named counter"). Mirrors `ratelimit::RateLimitedWriter`'s decorator
//! shape so the two can nest in either order over a `Link`'s writer.

use std::{future::Future, pin::Pin, sync::Arc};

use crate::{
    buffer::MultiBuffer,
    dispatch::traits::Counter,
    error::CoreError,
    pipe::PipeWrite,
};

/// Adds every written byte count to `counter` before forwarding to `inner`.
pub struct CountingWriter {
    inner: Box<dyn PipeWrite>,
    counter: Arc<dyn Counter>,
}

impl CountingWriter {
    pub fn new(inner: impl PipeWrite + 'static, counter: Arc<dyn Counter>) -> Self {
        Self { inner: Box::new(inner), counter }
    }

    pub async fn write(&self, mb: MultiBuffer) -> Result<(), CoreError> {
        let len = mb.len() as i64;
        self.inner.write(mb).await?;
        self.counter.add(len);
        Ok(())
    }

    pub fn close(&self) {
        self.inner.close();
    }
}

impl PipeWrite for CountingWriter {
    fn write<'a>(&'a self, mb: MultiBuffer) -> Pin<Box<dyn Future<Output = Result<(), CoreError>> + Send + 'a>> {
        Box::pin(CountingWriter::write(self, mb))
    }

    fn close(&self) {
        CountingWriter::close(self)
    }

    fn interrupt(&self) {
        self.inner.interrupt();
    }
}
