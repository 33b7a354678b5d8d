//! Per-swap actor plumbing shared by both swap kinds.
//!
//! Every swap runs as one task owning its record. Chain events, payment
//! results and timer ticks are handled one at a time from its mailbox, so
//! no two handlers ever read-modify-write the same record concurrently.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::store::SwapRepository;
use crate::chain::{Chain, ChainEvent, ChainWallet, IndexerClient, TransactionEvent};
use crate::config::{EngineConfig, LIQUID_BLOCKS_PER_BITCOIN_BLOCK, PAYMENT_CLTV_SAFETY_BLOCKS, Timings};
use crate::contract::{Networks, SwapScript};
use crate::lightning::LightningClient;

/// Indexer and operator wallet of one settlement layer.
#[derive(Clone)]
pub struct ChainBackend {
    pub indexer: Arc<dyn IndexerClient>,
    pub wallet: Arc<dyn ChainWallet>,
}

/// Everything a swap actor talks to.
pub struct EngineContext {
    pub config: EngineConfig,
    pub networks: Networks,
    pub store: Arc<dyn SwapRepository>,
    pub lightning: Arc<dyn LightningClient>,
    pub bitcoin: ChainBackend,
    pub liquid: ChainBackend,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn SwapRepository>,
        lightning: Arc<dyn LightningClient>,
        bitcoin: ChainBackend,
        liquid: ChainBackend,
    ) -> Self {
        let networks = Networks {
            bitcoin: config.bitcoin_network,
            liquid: config.liquid_network.address_params(),
        };
        Self {
            config,
            networks,
            store,
            lightning,
            bitcoin,
            liquid,
        }
    }

    pub fn backend(&self, chain: Chain) -> &ChainBackend {
        match chain {
            Chain::Bitcoin => &self.bitcoin,
            Chain::Liquid => &self.liquid,
        }
    }

    pub async fn tip(&self, chain: Chain) -> Result<u32> {
        let status = self
            .backend(chain)
            .indexer
            .network_status()
            .await
            .with_context(|| format!("get {chain} network status"))?;
        Ok(status.chain_height)
    }

    pub async fn fee_rate(&self, chain: Chain) -> Result<f64> {
        let target = self.config.chain(chain).fee_target_blocks;
        self.backend(chain)
            .indexer
            .fee_rate(target)
            .await
            .with_context(|| format!("get {chain} fee rate"))
    }

    pub fn contract_address(&self, chain: Chain, script: &SwapScript) -> String {
        match chain {
            Chain::Bitcoin => script.bitcoin_address(self.networks.bitcoin).to_string(),
            Chain::Liquid => script.liquid_address(self.networks.liquid).to_string(),
        }
    }
}

pub(crate) enum PaymentOutcome {
    Paid([u8; 32]),
    Exhausted,
}

pub(crate) enum Command {
    Chain {
        event: Arc<ChainEvent>,
        ack: oneshot::Sender<Result<()>>,
    },
    Payment(PaymentOutcome),
    Stop,
}

/// One swap's reactions. Implementations persist their record on every
/// status change.
#[async_trait::async_trait]
pub(crate) trait SwapMachine: Send {
    fn id(&self) -> Uuid;

    fn chain(&self) -> Chain;

    fn is_done(&self) -> bool;

    fn polls_invoice(&self) -> bool {
        false
    }

    async fn start(&mut self) -> Result<()>;

    async fn on_chain_event(&mut self, event: &ChainEvent) -> Result<()>;

    async fn on_expiry_check(&mut self) -> Result<()>;

    async fn on_invoice_poll(&mut self) -> Result<()> {
        Ok(())
    }

    async fn on_payment(&mut self, _outcome: PaymentOutcome) -> Result<()> {
        Ok(())
    }
}

pub(crate) async fn run<M: SwapMachine>(
    mut machine: M,
    mut mailbox: mpsc::Receiver<Command>,
    timings: Timings,
) {
    let swap_id = machine.id();
    let chain = machine.chain();

    if let Err(e) = machine.start().await {
        tracing::warn!(%swap_id, %chain, "swap start failed: {e:#}");
    }

    let mut expiry = tokio::time::interval(timings.expiry_check_interval);
    expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut invoice_poll = tokio::time::interval(timings.invoice_poll_interval);
    invoice_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while !machine.is_done() {
        tokio::select! {
            cmd = mailbox.recv() => match cmd {
                Some(Command::Chain { event, ack }) => {
                    let res = machine.on_chain_event(&event).await;
                    if let Err(e) = &res {
                        tracing::warn!(%swap_id, %chain, "chain event handling failed: {e:#}");
                    }
                    let _ = ack.send(res);
                }
                Some(Command::Payment(outcome)) => {
                    if let Err(e) = machine.on_payment(outcome).await {
                        tracing::warn!(%swap_id, %chain, "payment result handling failed: {e:#}");
                    }
                }
                Some(Command::Stop) | None => break,
            },
            _ = expiry.tick() => {
                if let Err(e) = machine.on_expiry_check().await {
                    tracing::warn!(%swap_id, %chain, "expiry check failed: {e:#}");
                }
            }
            _ = invoice_poll.tick(), if machine.polls_invoice() => {
                if let Err(e) = machine.on_invoice_poll().await {
                    tracing::debug!(%swap_id, %chain, "invoice poll failed: {e:#}");
                }
            }
        }
    }

    tracing::debug!(%swap_id, %chain, done = machine.is_done(), "swap actor stopped");
}

/// Time-lock budget for paying a swap-in invoice, in Bitcoin blocks.
///
/// Liquid heights are converted at the fixed block-time ratio. `None` when
/// the contract is too close to its timeout to pay safely.
pub fn payment_cltv_limit(chain: Chain, timeout: u32, tip: u32) -> Option<u32> {
    let remaining = timeout.checked_sub(tip)?;
    let remaining = match chain {
        Chain::Bitcoin => remaining,
        Chain::Liquid => remaining / LIQUID_BLOCKS_PER_BITCOIN_BLOCK,
    };
    remaining
        .checked_sub(PAYMENT_CLTV_SAFETY_BLOCKS)
        .filter(|limit| *limit > 0)
}

/// Contract timeout of a swap-out, derived from the held HTLC's expiry.
///
/// `None` when the HTLC expires too soon to leave any room for the contract.
pub fn swap_out_timeout(
    chain: Chain,
    htlc_expiry: u32,
    margin: u32,
    bitcoin_tip: u32,
    chain_tip: u32,
) -> Option<u32> {
    let bitcoin_timeout = htlc_expiry.checked_sub(margin)?;
    let remaining = bitcoin_timeout.checked_sub(bitcoin_tip).filter(|r| *r > 0)?;
    match chain {
        Chain::Bitcoin => Some(bitcoin_timeout),
        Chain::Liquid => chain_tip.checked_add(remaining.checked_mul(LIQUID_BLOCKS_PER_BITCOIN_BLOCK)?),
    }
}

/// First output of `tx` paying `address`, with its normalized amount.
pub fn contract_output(
    tx: &TransactionEvent,
    address: &str,
    policy_asset: Option<&str>,
) -> Option<(u32, Decimal)> {
    tx.outputs
        .iter()
        .find(|o| o.address.as_deref() == Some(address))
        .map(|o| (o.vout, o.amount.normalize(policy_asset)))
}
