use std::time::Duration;

use anyhow::{Context as _, Result};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};

use super::{Chain, IndexerClient, IndexerEvent, NetworkStatus};

/// Slack added on top of the long-poll window before the HTTP request is abandoned.
const LONG_POLL_SLACK: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct HttpIndexerClient {
    chain: Chain,
    base_url: Url,
    http: Client,
}

#[derive(Serialize)]
struct TrackAddressRequest<'a> {
    address: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeeRateResponse {
    fee_rate: f64,
}

#[derive(Serialize)]
struct BroadcastRequest<'a> {
    raw: &'a str,
}

#[derive(Deserialize)]
struct BroadcastResponse {
    txid: String,
}

#[derive(Deserialize)]
struct EventsResponse {
    events: Vec<IndexerEvent>,
}

impl HttpIndexerClient {
    pub fn new(chain: Chain, base_url: &str) -> Result<Self> {
        let mut base_url =
            Url::parse(base_url).with_context(|| format!("parse {chain} indexer url {base_url}"))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("build indexer http client")?;

        Ok(Self {
            chain,
            base_url,
            http,
        })
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("build {} indexer url for {path}", self.chain))
    }
}

#[async_trait::async_trait]
impl IndexerClient for HttpIndexerClient {
    async fn network_status(&self) -> Result<NetworkStatus> {
        self.http
            .get(self.url("status")?)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .context("GET status")?
            .error_for_status()
            .context("GET status")?
            .json()
            .await
            .context("decode network status")
    }

    async fn track_address(&self, address: &str) -> Result<()> {
        self.http
            .post(self.url("track-address")?)
            .timeout(Duration::from_secs(30))
            .json(&TrackAddressRequest { address })
            .send()
            .await
            .context("POST track-address")?
            .error_for_status()
            .with_context(|| format!("track address {address}"))?;
        Ok(())
    }

    async fn fee_rate(&self, target_blocks: u32) -> Result<f64> {
        let resp: FeeRateResponse = self
            .http
            .get(self.url("fee-rate")?)
            .query(&[("targetBlocks", target_blocks)])
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .context("GET fee-rate")?
            .error_for_status()
            .context("GET fee-rate")?
            .json()
            .await
            .context("decode fee rate")?;
        anyhow::ensure!(
            resp.fee_rate.is_finite() && resp.fee_rate > 0.0,
            "indexer returned invalid fee rate {}",
            resp.fee_rate
        );
        Ok(resp.fee_rate)
    }

    async fn broadcast_tx(&self, raw_hex: &str) -> Result<String> {
        let resp = self
            .http
            .post(self.url("broadcast")?)
            .timeout(Duration::from_secs(30))
            .json(&BroadcastRequest { raw: raw_hex })
            .send()
            .await
            .context("POST broadcast")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("broadcast rejected ({status}): {body}");
        }

        let resp: BroadcastResponse = resp.json().await.context("decode broadcast response")?;
        Ok(resp.txid)
    }

    async fn get_events(&self, after: u64, timeout: Duration) -> Result<Vec<IndexerEvent>> {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let resp: EventsResponse = self
            .http
            .get(self.url("events")?)
            .query(&[("after", after), ("timeoutMs", timeout_ms)])
            .timeout(timeout + LONG_POLL_SLACK)
            .send()
            .await
            .context("GET events")?
            .error_for_status()
            .context("GET events")?
            .json()
            .await
            .context("decode events")?;
        Ok(resp.events)
    }
}
