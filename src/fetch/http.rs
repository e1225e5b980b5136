//! HTTP client seam for feed downloads.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Request, Response};
use std::time::Duration;

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> reqwest::Result<Response>;
}

/// Plain reqwest-backed client with a bounded request timeout, so a hung
/// upstream fails the fetch instead of stalling the schedule.
pub struct BasicClient(reqwest::Client);

impl BasicClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self(client))
    }
}

#[async_trait]
impl HttpClient for BasicClient {
    async fn execute(&self, req: Request) -> reqwest::Result<Response> {
        self.0.execute(req).await
    }
}

/// Downloads one feed snapshot. Network and HTTP-status failures are
/// transient: the caller's scheduler retries on the next tick.
pub async fn fetch_bytes<C: HttpClient>(client: &C, url: &str) -> Result<Vec<u8>> {
    let req = reqwest::Request::new(reqwest::Method::GET, url.parse()?);

    let resp = client
        .execute(req)
        .await
        .with_context(|| format!("feed fetch failed for {url}"))?
        .error_for_status()
        .with_context(|| format!("feed endpoint returned an error status for {url}"))?;
    Ok(resp.bytes().await?.to_vec())
}
