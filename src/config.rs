//! Command-line surface of the server binary.

use anyhow::{bail, Result};
use clap::Parser;

/// Event-driven HTTP/1.x static file server.
#[derive(Parser, Debug)]
#[command(name = "evhttpd", version, ignore_errors = true)]
pub struct Config {
    /// Number of worker event-loop threads; must be positive.
    #[arg(
        short = 't',
        long = "threads",
        default_value_t = 4,
        allow_negative_numbers = true
    )]
    pub threads: i64,

    /// Listen port.
    #[arg(short = 'p', long = "port", default_value_t = 80)]
    pub port: u16,

    /// Log file path; must be absolute when given.
    #[arg(short = 'l', long = "log-path")]
    pub log_path: Option<String>,
}

impl Config {
    /// Validate the worker count. Zero or negative counts are startup
    /// failures, not values to round up.
    pub fn worker_threads(&self) -> Result<usize> {
        if self.threads <= 0 {
            bail!("worker thread count must be positive, got {}", self.threads);
        }
        Ok(self.threads as usize)
    }

    /// Resolve the log path, enforcing that an explicit one is absolute.
    pub fn resolved_log_path(&self) -> Result<String> {
        match &self.log_path {
            Some(path) => {
                if path.len() < 2 || !path.starts_with('/') {
                    bail!("log path should start with \"/\"");
                }
                Ok(path.clone())
            }
            None => Ok("./evhttpd.log".to_owned()),
        }
    }
}
