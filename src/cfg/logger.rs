// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, fmt, writer::BoxMakeWriter};

#[derive(Debug, Deserialize, Clone)]
struct LoggerFile {
    logger: LogConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Output {
    Stdout,
    Stderr,
    File,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum RotationFreq {
    Minutely,
    Hourly,
    Daily,
    Never,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LogFileConfig {
    pub path: String,
    #[serde(default)]
    pub rotation_frequency: Option<RotationFreq>,
}

/// Logging knobs loadable from YAML (§10.2): level, output target, wire
/// format, and which of line/module-path/target to attach to each record.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LogConfig {
    pub level: String,
    pub output: Output,
    #[serde(default)]
    pub format: LogFormat,
    pub is_show_line: bool,
    pub is_show_module_path: bool,
    pub is_show_target: bool,
    pub file: Option<LogFileConfig>,
}

/// Parse a standalone logger config file and install the global subscriber.
/// The returned `WorkerGuard` must be kept alive for the process lifetime —
/// dropping it stops the non-blocking writer from flushing.
pub fn init_logger(config_path: &str) -> Result<WorkerGuard> {
    let config_content = fs::read_to_string(config_path).with_context(|| format!("Failed to read config file: {config_path}"))?;
    let file: LoggerFile = serde_yaml::from_str(&config_content).with_context(|| format!("Failed to parse config file: {config_path}"))?;
    init_logger_from_config(&file.logger)
}

/// As `init_logger`, but takes an already-parsed `LogConfig` (e.g. one
/// nested inside the crate's main `Config`).
pub fn init_logger_from_config(cfg: &LogConfig) -> Result<WorkerGuard> {
    let (writer, guard) = make_writer(cfg)?;

    let env_filter = EnvFilter::try_new(&cfg.level).or_else(|_| EnvFilter::try_from_default_env()).context("Failed to parse log level from config or env")?;

    let builder = fmt()
        .with_writer(writer)
        .with_ansi(false)
        .with_line_number(cfg.is_show_line)
        .with_file(cfg.is_show_module_path)
        .with_target(cfg.is_show_target)
        .with_env_filter(env_filter);

    let result = match cfg.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to set global default subscriber: {e}"))?;

    Ok(guard)
}

fn make_writer(cfg: &LogConfig) -> Result<(BoxMakeWriter, WorkerGuard)> {
    Ok(match cfg.output {
        Output::Stdout => {
            let (w, g) = tracing_appender::non_blocking(std::io::stdout());
            (BoxMakeWriter::new(w), g)
        },
        Output::Stderr => {
            let (w, g) = tracing_appender::non_blocking(std::io::stderr());
            (BoxMakeWriter::new(w), g)
        },
        Output::File => {
            let fcfg = cfg.file.clone().context("log.file is required for output=file")?;
            let path = PathBuf::from(&fcfg.path);
            let dir = path.parent().unwrap_or_else(|| Path::new(""));

            let rotation = match fcfg.rotation_frequency.unwrap_or(RotationFreq::Never) {
                RotationFreq::Minutely => Rotation::MINUTELY,
                RotationFreq::Hourly => Rotation::HOURLY,
                RotationFreq::Daily => Rotation::DAILY,
                RotationFreq::Never => Rotation::NEVER,
            };

            let file_appender = RollingFileAppender::new(rotation, dir, path.file_name().unwrap_or_default());
            let (w, g) = tracing_appender::non_blocking(file_appender);
            (BoxMakeWriter::new(w), g)
        },
    })
}
