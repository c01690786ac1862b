// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

use std::fs::OpenOptions;
use std::str::FromStr;

use anyhow::Context;
use serde::Deserialize;
use serde::Serialize;
use slog::Drain;
use slog::Logger;

/// How log records should be rendered.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Unstructured text, intended for a person at a terminal
    #[default]
    Human,
    /// Bunyan-style json records, one per line
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "human" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("invalid log format: {s}")),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Human => write!(f, "human"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

// All drains are funneled through slog_async, so that a slow terminal or disk
// never stalls a thread holding a table lock.
fn async_root<D>(name: &str, drain: D) -> Logger
where
    D: Drain<Ok = (), Err = slog::Never> + Send + 'static,
{
    let drain = slog_async::Async::new(drain).chan_size(0x2000).build().fuse();
    Logger::root(drain, slog::o!("name" => name.to_string()))
}

/// Build the root logger for a process.  If `log_file` is set, records are
/// appended to that file; otherwise they go to stdout.
pub fn init(
    name: &str,
    log_file: &Option<String>,
    log_format: LogFormat,
) -> anyhow::Result<Logger> {
    let log = match (log_file, log_format) {
        (None, LogFormat::Human) => {
            let decorator = slog_term::TermDecorator::new().build();
            let drain = slog_term::FullFormat::new(decorator).build().fuse();
            async_root(name, drain)
        }
        (None, LogFormat::Json) => {
            let drain = slog_bunyan::new(std::io::stdout()).build().fuse();
            async_root(name, drain)
        }
        (Some(path), format) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {path}"))?;
            match format {
                LogFormat::Human => {
                    let decorator = slog_term::PlainDecorator::new(file);
                    let drain =
                        slog_term::FullFormat::new(decorator).build().fuse();
                    async_root(name, drain)
                }
                LogFormat::Json => {
                    let drain = slog_bunyan::new(file).build().fuse();
                    async_root(name, drain)
                }
            }
        }
    };

    Ok(log)
}

#[test]
fn test_log_format_parse() {
    assert_eq!(LogFormat::from_str("JSON").unwrap(), LogFormat::Json);
    assert_eq!(LogFormat::from_str("human").unwrap(), LogFormat::Human);
    assert!(LogFormat::from_str("xml").is_err());
    assert_eq!(LogFormat::Json.to_string(), "json");
}
