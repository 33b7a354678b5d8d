#![allow(dead_code)]

pub mod mocks;
pub mod wait;

use std::str::FromStr as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context as _, Result};
use bitcoin::absolute::LockTime;
use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use lightning_invoice::{Currency, InvoiceBuilder, PaymentSecret};
use ln_chain_swap::chain::{
    BlockEvent, Chain, ChainEvent, OutputAmount, TransactionData, TransactionEvent, TxInputRef,
    TxOutputInfo,
};
use ln_chain_swap::config::{EngineConfig, Timings};
use ln_chain_swap::keys::KeyDeriver;
use ln_chain_swap::swap::machine::{ChainBackend, EngineContext};
use ln_chain_swap::swap::memory::MemoryStore;
use ln_chain_swap::swap::{Orchestrator, Swap};
use rust_decimal::Decimal;
use uuid::Uuid;

use mocks::{MockIndexer, MockLightning, MockWallet};
use wait::wait_for;

pub const MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

pub const START_HEIGHT: u32 = 100;

pub fn secret_key(seed: u8) -> SecretKey {
    SecretKey::from_slice(&[seed; 32]).expect("valid secret key")
}

pub fn public_key_hex(key: &SecretKey) -> String {
    key.public_key(&Secp256k1::new()).to_string()
}

pub fn regtest_address(key: &SecretKey) -> String {
    bitcoin::Address::p2wpkh(
        &bitcoin::CompressedPublicKey(key.public_key(&Secp256k1::new())),
        bitcoin::Network::Regtest,
    )
    .to_string()
}

pub fn payment_hash(preimage: &[u8; 32]) -> [u8; 32] {
    sha256::Hash::hash(preimage).to_byte_array()
}

/// Signed regtest invoice paying to `sha256(preimage)`.
pub fn invoice(preimage: &[u8; 32], amount_msat: u64) -> String {
    invoice_for(Currency::Regtest, preimage, amount_msat)
}

pub fn invoice_for(currency: Currency, preimage: &[u8; 32], amount_msat: u64) -> String {
    let secp = Secp256k1::new();
    let node_key = secret_key(41);
    InvoiceBuilder::new(currency)
        .description("swap".into())
        .payment_hash(sha256::Hash::hash(preimage))
        .payment_secret(PaymentSecret([9u8; 32]))
        .amount_milli_satoshis(amount_msat)
        .current_timestamp()
        .expiry_time(Duration::from_secs(3600))
        .min_final_cltv_expiry_delta(40)
        .build_signed(|msg| secp.sign_ecdsa_recoverable(msg, &node_key))
        .expect("build invoice")
        .to_string()
}

/// A transaction paying `sats` to `script_pubkey` at output 0, with a
/// unique dummy input. Returns raw hex and txid.
pub fn funding_tx(script_pubkey: ScriptBuf, sats: u64) -> (String, String) {
    static NONCE: AtomicU32 = AtomicU32::new(1);
    let nonce = NONCE.fetch_add(1, Ordering::SeqCst);

    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: Txid::from_byte_array(sha256::Hash::hash(&nonce.to_le_bytes()).to_byte_array()),
                vout: 0,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(sats),
            script_pubkey,
        }],
    };
    let txid = tx.compute_txid().to_string();
    (bitcoin::consensus::encode::serialize_hex(&tx), txid)
}

/// Pays `sats` to a regtest `address`.
pub fn pay_to(address: &str, sats: u64) -> Result<(String, String)> {
    let script_pubkey = bitcoin::Address::from_str(address)
        .context("parse address")?
        .require_network(bitcoin::Network::Regtest)
        .context("regtest address")?
        .script_pubkey();
    Ok(funding_tx(script_pubkey, sats))
}

/// The indexer's view of a raw regtest transaction.
pub fn tx_event(raw_hex: &str, height: Option<u32>) -> Result<TransactionEvent> {
    let tx: Transaction =
        bitcoin::consensus::encode::deserialize_hex(raw_hex).context("decode transaction")?;
    let outputs: Vec<TxOutputInfo> = tx
        .output
        .iter()
        .enumerate()
        .map(|(vout, out)| TxOutputInfo {
            vout: vout as u32,
            address: bitcoin::Address::from_script(&out.script_pubkey, bitcoin::Network::Regtest)
                .ok()
                .map(|a| a.to_string()),
            amount: OutputAmount::Plain(out.value.to_sat()),
        })
        .collect();
    Ok(TransactionEvent {
        tracked_source: outputs
            .first()
            .and_then(|o| o.address.clone())
            .unwrap_or_default(),
        inputs: tx
            .input
            .iter()
            .map(|i| TxInputRef {
                txid: i.previous_output.txid.to_string(),
                vout: i.previous_output.vout,
            })
            .collect(),
        outputs,
        transaction_data: TransactionData {
            hash: tx.compute_txid().to_string(),
            raw: raw_hex.to_string(),
            height,
        },
    })
}

pub fn sats(amount: u64) -> Decimal {
    Decimal::new(amount as i64, 8)
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        fee_percent: Decimal::ZERO,
        timings: Timings {
            expiry_check_interval: Duration::from_millis(50),
            invoice_poll_interval: Duration::from_millis(20),
            payment_attempts: 3,
            payment_retry_delay: Duration::from_millis(10),
        },
        ..EngineConfig::default()
    }
}

/// An orchestrator wired to in-process doubles. Chain events are
/// dispatched directly instead of going through an event consumer.
pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<MemoryStore>,
    pub lightning: Arc<MockLightning>,
    pub bitcoin: Arc<MockIndexer>,
    pub liquid: Arc<MockIndexer>,
    pub wallet: Arc<MockWallet>,
}

impl Harness {
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(config: EngineConfig, store: Arc<MemoryStore>) -> Result<Self> {
        let lightning = Arc::new(MockLightning::default());
        let bitcoin = Arc::new(MockIndexer::new(Chain::Bitcoin, START_HEIGHT));
        let liquid = Arc::new(MockIndexer::new(Chain::Liquid, START_HEIGHT * 10));
        let wallet = Arc::new(MockWallet::new(regtest_address(&secret_key(90))));

        let ctx = EngineContext::new(
            config,
            store.clone(),
            lightning.clone(),
            ChainBackend {
                indexer: bitcoin.clone(),
                wallet: wallet.clone(),
            },
            ChainBackend {
                indexer: liquid.clone(),
                wallet: wallet.clone(),
            },
        );
        let keys = KeyDeriver::from_mnemonic(MNEMONIC, false).context("key deriver")?;
        let orchestrator = Arc::new(Orchestrator::new(ctx, keys, store.clone()));

        Ok(Self {
            orchestrator,
            store,
            lightning,
            bitcoin,
            liquid,
            wallet,
        })
    }

    pub fn swap(&self, id: Uuid) -> Result<Swap> {
        Ok(self.orchestrator.get_swap(id)?)
    }

    pub async fn block(&self, height: u32) -> Result<()> {
        self.bitcoin.set_height(height);
        self.orchestrator
            .dispatch(
                Chain::Bitcoin,
                ChainEvent::Block(BlockEvent { height, hash: None }),
            )
            .await
    }

    pub async fn transaction(&self, raw_hex: &str, height: Option<u32>) -> Result<()> {
        self.orchestrator
            .dispatch(
                Chain::Bitcoin,
                ChainEvent::Transaction(tx_event(raw_hex, height)?),
            )
            .await
    }

    pub async fn wait_for_status(&self, id: Uuid, status: &str) -> Result<Swap> {
        wait_for(
            &format!("swap {id} to reach {status}"),
            Duration::from_secs(10),
            || async move {
                let swap = self.swap(id)?;
                Ok((swap.status_str() == status).then_some(swap))
            },
        )
        .await
    }

    pub async fn wait_for_broadcast(&self, count: usize) -> Result<String> {
        wait_for(
            &format!("{count} broadcast transaction(s)"),
            Duration::from_secs(10),
            || async move { Ok(self.bitcoin.broadcasts().get(count - 1).cloned()) },
        )
        .await
    }
}
