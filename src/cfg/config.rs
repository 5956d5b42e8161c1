// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::logger::LogConfig;

/// Top-level knobs for running the core standalone (§10.3): buffer pool
/// sizing, default pipe backpressure limit, per-user rate defaults,
/// sniffer budgets, and Mux timing. Everything the core needs to be
/// exercised end to end without a surrounding product's own config layer.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    pub buffer: BufferConfig,
    pub pipe: PipeConfig,
    pub ratelimit: RateLimitConfig,
    pub sniffer: SnifferConfig,
    pub mux: MuxConfig,
    pub logging: LogConfig,
}

/// Pooled-buffer sizing (§4.A).
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct BufferConfig {
    /// Slot size of the default pool; 0 falls back to the built-in 8192.
    #[serde(default)]
    pub default_slot_size: usize,
}

/// Default backpressure settings for freshly created [`crate::pipe::Link`]s
/// (§4.B).
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PipeConfig {
    /// `None` keeps a pipe unbounded; a conduit still gets its own
    /// `PipeOptions` when the caller needs a different limit.
    pub default_size_limit: Option<u64>,
    #[serde(default)]
    pub discard_overflow: bool,
}

/// Per-user token-bucket defaults (§4.C). A conduit without an explicit
/// override gets these.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RateLimitConfig {
    pub default_rate_bytes_per_sec: u64,
    pub default_burst_bytes: u64,
}

/// Content sniffer budgets (§4.D): how much a sniffer may buffer and how
/// long it may wait before `Dispatcher` gives up and treats the flow as
/// unrecognized.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SnifferConfig {
    pub max_buffered_bytes: usize,
    #[serde(with = "serde_millis")]
    pub probe_timeout: std::time::Duration,
}

/// Mux timing (§4.F-§4.I): client/server idle-close thresholds and the
/// XUDP resumption-table sweep interval.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MuxConfig {
    #[serde(with = "serde_secs")]
    pub client_idle_close_after: std::time::Duration,
    #[serde(with = "serde_secs")]
    pub server_idle_close_after: std::time::Duration,
    #[serde(with = "serde_secs")]
    pub xudp_sweep_interval: std::time::Duration,
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config = serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and fills in the zero-means-default knobs.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        if self.buffer.default_slot_size == 0 {
            self.buffer.default_slot_size = crate::buffer::pool::DEFAULT_BUFFER_SIZE;
        }
        ensure!(self.sniffer.max_buffered_bytes > 0, "sniffer.max_buffered_bytes must be > 0");
        if let Some(limit) = self.pipe.default_size_limit {
            ensure!(limit > 0, "pipe.default_size_limit, if set, must be > 0");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer: BufferConfig { default_slot_size: crate::buffer::pool::DEFAULT_BUFFER_SIZE },
            pipe: PipeConfig { default_size_limit: Some(1 << 20), discard_overflow: false },
            ratelimit: RateLimitConfig { default_rate_bytes_per_sec: 0, default_burst_bytes: 0 },
            sniffer: SnifferConfig { max_buffered_bytes: 4096, probe_timeout: std::time::Duration::from_millis(200) },
            mux: MuxConfig {
                client_idle_close_after: std::time::Duration::from_secs(16),
                server_idle_close_after: std::time::Duration::from_secs(60),
                xudp_sweep_interval: std::time::Duration::from_secs(60),
            },
            logging: LogConfig {
                level: "info".to_string(),
                output: crate::cfg::logger::Output::Stdout,
                format: crate::cfg::logger::LogFormat::Compact,
                is_show_line: false,
                is_show_module_path: false,
                is_show_target: true,
                file: None,
            },
        }
    }
}

mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
