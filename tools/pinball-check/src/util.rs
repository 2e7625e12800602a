// Copyright 2020 Joyent, Inc.

use std::env;
use std::sync::Mutex;

use clap::{crate_name, crate_version};
use slog::{o, Drain, Level, LevelFilter, Logger};

pub const DEFAULT_LOG_LEVEL: Level = Level::Info;
pub const LOG_LEVEL_ENV_VAR: &str = "PINBALL_LOG_LEVEL";

pub fn parse_log_level(s: &str) -> Result<Level, String> {
    match s.to_lowercase().as_str() {
        "trace" => Ok(Level::Trace),
        "debug" => Ok(Level::Debug),
        "info" => Ok(Level::Info),
        "warning" => Ok(Level::Warning),
        "error" => Ok(Level::Error),
        "critical" => Ok(Level::Critical),
        _ => Err(format!("invalid log level: {:?}", s)),
    }
}

pub fn log_level_from_env() -> Result<Option<Level>, String> {
    match env::var_os(LOG_LEVEL_ENV_VAR) {
        Some(level_str) => {
            let level_str = level_str.into_string().map_err(|_| {
                format!("{} has invalid Unicode data", LOG_LEVEL_ENV_VAR)
            })?;
            parse_log_level(&level_str).map(Some)
        }
        None => Ok(None),
    }
}

pub fn standard_log(l: Level) -> Logger {
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_bunyan::with_name(crate_name!(), std::io::stdout()).build(),
            l,
        ))
        .fuse(),
        o!("build-id" => crate_version!()),
    )
}
