use std::path::Path;
use std::time::Duration;

use anyhow::{Context as _, Result};
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE as BASE64_URL};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::json;

use super::{HoldInvoiceRequest, InvoiceLookup, InvoiceState, LightningClient};
use crate::chain::ChainWallet;

const MACAROON_HEADER: &str = "Grpc-Metadata-macaroon";

/// Bound on waiting for the first message of a payment track stream. An
/// in-flight payment sends nothing until it resolves.
const TRACK_TIMEOUT: Duration = Duration::from_secs(10);

/// gRPC status LND answers with for a payment it never sent.
const GRPC_NOT_FOUND: i32 = 5;

/// LND REST client. Also serves as the operator's base-layer wallet.
#[derive(Clone)]
pub struct LndRestClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct SendPaymentResponse {
    #[serde(default)]
    payment_error: String,
    #[serde(default)]
    payment_preimage: String,
}

/// One message of the `v2/router/track` stream.
#[derive(Debug, Deserialize)]
struct TrackPaymentMessage {
    result: Option<TrackedPayment>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct TrackedPayment {
    #[serde(default)]
    payment_preimage: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

impl RpcError {
    fn is_unknown_payment(&self) -> bool {
        self.code == GRPC_NOT_FOUND || self.message.contains("not initiated")
    }
}

#[derive(Debug, Deserialize)]
struct AddHoldInvoiceResponse {
    payment_request: String,
}

#[derive(Debug, Deserialize)]
struct InvoiceResponse {
    state: InvoiceState,
    #[serde(default)]
    htlcs: Vec<InvoiceHtlc>,
}

#[derive(Debug, Deserialize)]
struct InvoiceHtlc {
    expiry_height: u32,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Deserialize)]
struct NewAddressResponse {
    address: String,
}

#[derive(Debug, Deserialize)]
struct SendCoinsResponse {
    txid: String,
}

impl LndRestClient {
    pub fn new(base_url: &str, macaroon_hex: &str, tls_cert_path: Option<&Path>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut macaroon =
            HeaderValue::from_str(macaroon_hex.trim()).context("invalid macaroon header")?;
        macaroon.set_sensitive(true);
        headers.insert(MACAROON_HEADER, macaroon);

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            // Payments block until they resolve.
            .timeout(Duration::from_secs(120));
        if let Some(path) = tls_cert_path {
            let pem = std::fs::read(path)
                .with_context(|| format!("read lnd tls cert {}", path.display()))?;
            let cert = reqwest::Certificate::from_pem(&pem).context("parse lnd tls cert")?;
            builder = builder.add_root_certificate(cert);
        }

        Ok(Self {
            http: builder.build().context("build lnd http client")?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self
            .http
            .get(self.url(path))
            .send()
            .await
            .with_context(|| format!("GET {path}"))?;
        decode(resp, path).await
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let resp = self
            .http
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {path}"))?;
        decode(resp, path).await
    }
}

async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response, path: &str) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("lnd {path} returned {status}: {body}");
    }
    resp.json()
        .await
        .with_context(|| format!("decode lnd {path} response"))
}

fn held_htlc_expiry(htlcs: &[InvoiceHtlc]) -> Option<u32> {
    htlcs
        .iter()
        .filter(|h| h.state != "CANCELED")
        .map(|h| h.expiry_height)
        .min()
}

fn track_path(payment_hash: &[u8; 32]) -> String {
    format!(
        "v2/router/track/{}?no_inflight_updates=true",
        BASE64_URL.encode(payment_hash)
    )
}

/// Preimage from the first message of a payment track stream. Only a
/// succeeded payment yields one.
fn tracked_preimage(message: &[u8]) -> Result<Option<[u8; 32]>> {
    let msg: TrackPaymentMessage =
        serde_json::from_slice(message).context("decode payment track message")?;
    if let Some(err) = msg.error {
        if err.is_unknown_payment() {
            return Ok(None);
        }
        anyhow::bail!("track payment failed: {}", err.message);
    }
    let Some(payment) = msg.result.filter(|p| p.status == "SUCCEEDED") else {
        return Ok(None);
    };
    let bytes = hex::decode(&payment.payment_preimage).context("decode payment preimage")?;
    preimage_from_bytes(bytes).map(Some)
}

fn preimage_from_bytes(bytes: Vec<u8>) -> Result<[u8; 32]> {
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("preimage must be 32 bytes"))
}

#[async_trait::async_trait]
impl LightningClient for LndRestClient {
    async fn send_payment(&self, invoice: &str, cltv_limit: u32) -> Result<[u8; 32]> {
        let resp: SendPaymentResponse = self
            .post(
                "v1/channels/transactions",
                json!({ "payment_request": invoice, "cltv_limit": cltv_limit }),
            )
            .await?;
        if !resp.payment_error.is_empty() {
            anyhow::bail!("payment failed: {}", resp.payment_error);
        }
        let bytes = BASE64
            .decode(&resp.payment_preimage)
            .context("decode payment preimage")?;
        preimage_from_bytes(bytes)
    }

    async fn find_payment_preimage(&self, payment_hash: &[u8; 32]) -> Result<Option<[u8; 32]>> {
        let path = track_path(payment_hash);
        let mut resp = self
            .http
            .get(self.url(&path))
            .timeout(TRACK_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("GET {path}"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if serde_json::from_str::<RpcError>(&body).is_ok_and(|e| e.is_unknown_payment()) {
                return Ok(None);
            }
            anyhow::bail!("lnd {path} returned {status}: {body}");
        }

        // The stream stays open; the first newline-terminated message is enough.
        let mut buf = Vec::new();
        while let Some(chunk) = resp.chunk().await.context("read payment track stream")? {
            buf.extend_from_slice(&chunk);
            if buf.contains(&b'\n') {
                break;
            }
        }
        let first = buf.split(|b| *b == b'\n').next().unwrap_or_default();
        tracked_preimage(first)
    }

    async fn add_hold_invoice(&self, req: HoldInvoiceRequest) -> Result<String> {
        let resp: AddHoldInvoiceResponse = self
            .post(
                "v2/invoices/hodl",
                json!({
                    "hash": BASE64.encode(req.payment_hash),
                    "value": req.amount_sat.to_string(),
                    "expiry": req.expiry_secs.to_string(),
                    "cltv_expiry": req.cltv_expiry.to_string(),
                    "memo": req.memo,
                }),
            )
            .await?;
        Ok(resp.payment_request)
    }

    async fn lookup_invoice(&self, payment_hash: &[u8; 32]) -> Result<InvoiceLookup> {
        let resp: InvoiceResponse = self
            .get(&format!("v1/invoice/{}", hex::encode(payment_hash)))
            .await?;
        Ok(InvoiceLookup {
            state: resp.state,
            htlc_expiry: held_htlc_expiry(&resp.htlcs),
        })
    }

    async fn settle_invoice(&self, preimage: &[u8; 32]) -> Result<()> {
        let _: serde_json::Value = self
            .post(
                "v2/invoices/settle",
                json!({ "preimage": BASE64.encode(preimage) }),
            )
            .await?;
        Ok(())
    }

    async fn cancel_invoice(&self, payment_hash: &[u8; 32]) -> Result<()> {
        let _: serde_json::Value = self
            .post(
                "v2/invoices/cancel",
                json!({ "payment_hash": BASE64.encode(payment_hash) }),
            )
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChainWallet for LndRestClient {
    async fn new_address(&self) -> Result<String> {
        let resp: NewAddressResponse = self.get("v1/newaddress?type=WITNESS_PUBKEY_HASH").await?;
        Ok(resp.address)
    }

    async fn send_to_address(&self, address: &str, amount_sat: u64) -> Result<String> {
        let resp: SendCoinsResponse = self
            .post(
                "v1/transactions",
                json!({ "addr": address, "amount": amount_sat.to_string() }),
            )
            .await?;
        Ok(resp.txid)
    }
}
