use std::collections::HashMap;
use std::str::FromStr as _;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context as _, Result};
use bitcoin::hashes::{Hash as _, sha256};
use ln_chain_swap::chain::{ChainWallet, IndexerClient, IndexerEvent, NetworkStatus};
use ln_chain_swap::contract::spend::txid_of;
use ln_chain_swap::chain::Chain;
use ln_chain_swap::lightning::invoice::payment_hash_from_bolt11;
use ln_chain_swap::lightning::{HoldInvoiceRequest, InvoiceLookup, InvoiceState, LightningClient};

/// Scripted indexer: a settable tip, a recorded broadcast log and an event
/// stream tests append to.
pub struct MockIndexer {
    chain: Chain,
    height: AtomicU32,
    fee_rate: Mutex<f64>,
    tracked: Mutex<Vec<String>>,
    broadcasts: Mutex<Vec<String>>,
    events: Mutex<Vec<IndexerEvent>>,
    fail_polls: AtomicUsize,
    polls: AtomicUsize,
}

impl MockIndexer {
    pub fn new(chain: Chain, height: u32) -> Self {
        Self {
            chain,
            height: AtomicU32::new(height),
            fee_rate: Mutex::new(2.0),
            tracked: Mutex::new(Vec::new()),
            broadcasts: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            fail_polls: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
        }
    }

    pub fn set_height(&self, height: u32) {
        self.height.store(height, Ordering::SeqCst);
    }

    pub fn tracked(&self) -> Vec<String> {
        self.tracked.lock().expect("indexer mutex poisoned").clone()
    }

    pub fn broadcasts(&self) -> Vec<String> {
        self.broadcasts.lock().expect("indexer mutex poisoned").clone()
    }

    pub fn push_event(&self, event: IndexerEvent) {
        self.events.lock().expect("indexer mutex poisoned").push(event);
    }

    /// Makes the next `n` event polls fail.
    pub fn fail_next_polls(&self, n: usize) {
        self.fail_polls.store(n, Ordering::SeqCst);
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl IndexerClient for MockIndexer {
    async fn network_status(&self) -> Result<NetworkStatus> {
        Ok(NetworkStatus {
            chain_height: self.height.load(Ordering::SeqCst),
        })
    }

    async fn track_address(&self, address: &str) -> Result<()> {
        self.tracked
            .lock()
            .expect("indexer mutex poisoned")
            .push(address.to_string());
        Ok(())
    }

    async fn fee_rate(&self, _target_blocks: u32) -> Result<f64> {
        Ok(*self.fee_rate.lock().expect("indexer mutex poisoned"))
    }

    async fn broadcast_tx(&self, raw_hex: &str) -> Result<String> {
        let txid = txid_of(self.chain, raw_hex)?;
        self.broadcasts
            .lock()
            .expect("indexer mutex poisoned")
            .push(raw_hex.to_string());
        Ok(txid)
    }

    async fn get_events(&self, after: u64, timeout: Duration) -> Result<Vec<IndexerEvent>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("indexer unavailable");
        }

        let ready: Vec<IndexerEvent> = self
            .events
            .lock()
            .expect("indexer mutex poisoned")
            .iter()
            .filter(|e| e.id > after)
            .cloned()
            .collect();
        if ready.is_empty() {
            tokio::time::sleep(timeout.min(Duration::from_millis(20))).await;
        }
        Ok(ready)
    }
}

/// Lightning node double. Outgoing payments succeed for invoices whose
/// preimage was registered, hold invoices are driven by the test.
#[derive(Default)]
pub struct MockLightning {
    preimages: Mutex<HashMap<[u8; 32], [u8; 32]>>,
    completed: Mutex<HashMap<[u8; 32], [u8; 32]>>,
    failures_left: AtomicU32,
    payment_attempts: AtomicU32,
    invoice_lookups: AtomicU32,
    hold_invoices: Mutex<HashMap<[u8; 32], (HoldInvoiceRequest, InvoiceLookup)>>,
    settled: Mutex<Vec<[u8; 32]>>,
    canceled: Mutex<Vec<[u8; 32]>>,
}

impl MockLightning {
    /// Lets `send_payment` succeed for the invoice paying to `sha256(preimage)`.
    pub fn know_preimage(&self, preimage: [u8; 32]) {
        let hash = sha256::Hash::hash(&preimage).to_byte_array();
        self.preimages
            .lock()
            .expect("lightning mutex poisoned")
            .insert(hash, preimage);
    }

    /// Records a payment the node completed outside the swap engine, as if
    /// it was sent before a restart.
    pub fn record_completed_payment(&self, preimage: [u8; 32]) {
        let hash = sha256::Hash::hash(&preimage).to_byte_array();
        self.completed
            .lock()
            .expect("lightning mutex poisoned")
            .insert(hash, preimage);
    }

    pub fn fail_next_payments(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn payment_attempts(&self) -> u32 {
        self.payment_attempts.load(Ordering::SeqCst)
    }

    pub fn hold_invoice(&self, hash: &[u8; 32]) -> Option<HoldInvoiceRequest> {
        self.hold_invoices
            .lock()
            .expect("lightning mutex poisoned")
            .get(hash)
            .map(|(req, _)| req.clone())
    }

    /// Simulates the counterparty's HTLC arriving with the given expiry height.
    pub fn accept_hold_invoice(&self, hash: &[u8; 32], htlc_expiry: u32) {
        if let Some((_, lookup)) = self
            .hold_invoices
            .lock()
            .expect("lightning mutex poisoned")
            .get_mut(hash)
        {
            lookup.state = InvoiceState::Accepted;
            lookup.htlc_expiry = Some(htlc_expiry);
        }
    }

    /// The payer side gives up on the hold invoice.
    pub fn cancel_hold_invoice(&self, hash: &[u8; 32]) {
        if let Some((_, lookup)) = self
            .hold_invoices
            .lock()
            .expect("lightning mutex poisoned")
            .get_mut(hash)
        {
            lookup.state = InvoiceState::Canceled;
        }
    }

    pub fn invoice_lookups(&self) -> u32 {
        self.invoice_lookups.load(Ordering::SeqCst)
    }

    pub fn settled(&self) -> Vec<[u8; 32]> {
        self.settled.lock().expect("lightning mutex poisoned").clone()
    }

    pub fn canceled(&self) -> Vec<[u8; 32]> {
        self.canceled.lock().expect("lightning mutex poisoned").clone()
    }
}

#[async_trait::async_trait]
impl LightningClient for MockLightning {
    async fn send_payment(&self, invoice: &str, _cltv_limit: u32) -> Result<[u8; 32]> {
        self.payment_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("no route");
        }

        let hash = payment_hash_from_bolt11(invoice)?;
        let preimage = *self
            .preimages
            .lock()
            .expect("lightning mutex poisoned")
            .get(&hash)
            .context("unknown payment hash")?;
        self.completed
            .lock()
            .expect("lightning mutex poisoned")
            .insert(hash, preimage);
        Ok(preimage)
    }

    async fn find_payment_preimage(&self, payment_hash: &[u8; 32]) -> Result<Option<[u8; 32]>> {
        Ok(self
            .completed
            .lock()
            .expect("lightning mutex poisoned")
            .get(payment_hash)
            .copied())
    }

    async fn add_hold_invoice(&self, req: HoldInvoiceRequest) -> Result<String> {
        let encoded = format!("lnbcrt-hold-{}", hex::encode(req.payment_hash));
        self.hold_invoices.lock().expect("lightning mutex poisoned").insert(
            req.payment_hash,
            (
                req,
                InvoiceLookup {
                    state: InvoiceState::Open,
                    htlc_expiry: None,
                },
            ),
        );
        Ok(encoded)
    }

    async fn lookup_invoice(&self, payment_hash: &[u8; 32]) -> Result<InvoiceLookup> {
        self.invoice_lookups.fetch_add(1, Ordering::SeqCst);
        self.hold_invoices
            .lock()
            .expect("lightning mutex poisoned")
            .get(payment_hash)
            .map(|(_, lookup)| *lookup)
            .context("invoice not found")
    }

    async fn settle_invoice(&self, preimage: &[u8; 32]) -> Result<()> {
        let hash = sha256::Hash::hash(preimage).to_byte_array();
        let mut invoices = self.hold_invoices.lock().expect("lightning mutex poisoned");
        let (_, lookup) = invoices.get_mut(&hash).context("invoice not found")?;
        anyhow::ensure!(lookup.state == InvoiceState::Accepted, "invoice not accepted");
        lookup.state = InvoiceState::Settled;
        self.settled
            .lock()
            .expect("lightning mutex poisoned")
            .push(*preimage);
        Ok(())
    }

    async fn cancel_invoice(&self, payment_hash: &[u8; 32]) -> Result<()> {
        if let Some((_, lookup)) = self
            .hold_invoices
            .lock()
            .expect("lightning mutex poisoned")
            .get_mut(payment_hash)
        {
            lookup.state = InvoiceState::Canceled;
        }
        self.canceled
            .lock()
            .expect("lightning mutex poisoned")
            .push(*payment_hash);
        Ok(())
    }
}

/// Regtest wallet double. Funding transactions are real, unsigned-input
/// transactions so the contract can be spent from them.
pub struct MockWallet {
    address: String,
    sends: Mutex<Vec<String>>,
}

impl MockWallet {
    pub fn new(address: String) -> Self {
        Self {
            address,
            sends: Mutex::new(Vec::new()),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Raw hex of every funding transaction sent so far.
    pub fn sends(&self) -> Vec<String> {
        self.sends.lock().expect("wallet mutex poisoned").clone()
    }
}

#[async_trait::async_trait]
impl ChainWallet for MockWallet {
    async fn new_address(&self) -> Result<String> {
        Ok(self.address.clone())
    }

    async fn send_to_address(&self, address: &str, amount_sat: u64) -> Result<String> {
        let script_pubkey = bitcoin::Address::from_str(address)
            .context("parse address")?
            .require_network(bitcoin::Network::Regtest)
            .context("regtest address")?
            .script_pubkey();
        let (raw, txid) = super::funding_tx(script_pubkey, amount_sat);
        self.sends.lock().expect("wallet mutex poisoned").push(raw);
        Ok(txid)
    }
}
