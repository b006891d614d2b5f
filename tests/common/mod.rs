//! Common helpers for pipeline integration tests

#![allow(dead_code)]

use std::io::Cursor;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use url_fetcher::config::FetchConfig;
use url_fetcher::{Config, Pipeline, Result};

/// Config with short waits so retry scenarios finish quickly
pub fn test_config(workers: usize) -> Config {
    let mut config = Config::default();
    config.app.workers = workers;
    config.fetch = FetchConfig {
        retry_wait_min: Duration::from_millis(5),
        retry_wait_max: Duration::from_millis(50),
        shutdown_timeout: Duration::from_millis(500),
        ..FetchConfig::default()
    };
    config
}

/// One URL per line
pub fn lines(urls: &[String]) -> Cursor<Vec<u8>> {
    Cursor::new(urls.join("\n").into_bytes())
}

/// Run a pipeline to completion and return its result and output
pub async fn run(config: &Config, urls: &[String], cancel: CancellationToken) -> (Result<()>, String) {
    let pipeline = Pipeline::new(config, lines(urls), Vec::new(), cancel)
        .unwrap_or_else(|e| panic!("pipeline setup failed: {e}"));

    let result = pipeline.run().await;

    let sink = pipeline.sink();
    let bytes = sink.lock().await.clone();
    let output = String::from_utf8(bytes).unwrap_or_else(|e| panic!("output is not utf-8: {e}"));
    (result, output)
}

/// The record lines of an output, without separators and the sentinel
pub fn records(output: &str) -> Vec<&str> {
    output
        .lines()
        .filter(|line| line.starts_with("Completed url: "))
        .collect()
}

/// The record for `url`, panicking if there is not exactly one
pub fn record_for<'a>(output: &'a str, url: &str) -> &'a str {
    let prefix = format!("Completed url: {url}, ");
    let matching: Vec<_> = records(output)
        .into_iter()
        .filter(|r| r.starts_with(&prefix))
        .collect();
    assert_eq!(matching.len(), 1, "expected one record for {url} in:\n{output}");
    matching[0]
}
