//! Swap-in: the counterparty locks on-chain funds in a forward contract, the
//! operator pays their invoice and claims the contract with the preimage.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use bitcoin::hashes::{Hash as _, sha256};
use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::machine::{
    Command, EngineContext, PaymentOutcome, SwapMachine, contract_output, payment_cltv_limit,
};
use super::{ObservedTx, Swap, SwapError, SwapIn, SwapInStatus, SwapOutcome};
use crate::chain::{Chain, ChainEvent, IndexerClient, TransactionEvent};
use crate::contract::{ContractSpend, SpendBranch, SwapScript, spend};
use crate::keys::parse_secret_key;
use crate::lightning::LightningClient;

pub(crate) struct SwapInMachine {
    record: SwapIn,
    ctx: Arc<EngineContext>,
    mailbox: mpsc::Sender<Command>,
    tip: u32,
    payment_in_flight: bool,
    payment_exhausted: bool,
    claim_broadcast: bool,
}

impl SwapInMachine {
    pub(crate) fn new(record: SwapIn, ctx: Arc<EngineContext>, mailbox: mpsc::Sender<Command>) -> Self {
        Self {
            record,
            ctx,
            mailbox,
            tip: 0,
            payment_in_flight: false,
            payment_exhausted: false,
            claim_broadcast: false,
        }
    }

    fn set_status(&mut self, next: SwapInStatus) -> Result<()> {
        let from = self.record.status;
        if !from.can_transition_to(next) {
            return Err(SwapError::InvalidTransition {
                from: format!("{from:?}"),
                to: format!("{next:?}"),
            }
            .into());
        }
        self.record.status = next;
        self.record.common.updated_at = Utc::now();
        tracing::info!(
            swap_id = %self.id(),
            chain = %self.chain(),
            from = ?from,
            to = ?next,
            "swap-in status changed"
        );
        Ok(())
    }

    fn finish(&mut self, outcome: SwapOutcome) -> Result<()> {
        self.set_status(SwapInStatus::Done)?;
        self.record.common.outcome = Some(outcome);
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        self.ctx
            .store
            .save(&Swap::In(self.record.clone()))
            .with_context(|| format!("persist swap-in {}", self.id()))
    }

    fn required_confirmations(&self) -> u32 {
        self.ctx.config.chain(self.chain()).required_confirmations
    }

    fn observe_height(&mut self, height: Option<u32>) {
        if let Some(h) = height {
            self.tip = self.tip.max(h);
        }
    }

    fn lock_outpoint(&self) -> Option<(String, u32)> {
        let lock = self.record.common.lock_tx.as_ref()?;
        Some((lock.txid.clone(), self.record.common.lock_vout?))
    }

    async fn handle_chain_event(&mut self, event: &ChainEvent) -> Result<()> {
        match event {
            ChainEvent::Block(block) => self.observe_height(Some(block.height)),
            ChainEvent::Transaction(tx) => {
                self.observe_height(tx.transaction_data.height);
                // A refund can be reported before the block that times the contract out.
                self.expire_if_timed_out().await?;
                self.handle_transaction(tx)?;
            }
        }
        self.advance().await
    }

    fn handle_transaction(&mut self, tx: &TransactionEvent) -> Result<()> {
        let data = &tx.transaction_data;

        if let Some((lock_txid, lock_vout)) = self.lock_outpoint() {
            if data.hash == lock_txid {
                if let Some(lock) = self.record.common.lock_tx.as_mut()
                    && lock.height != data.height
                {
                    lock.height = data.height;
                    self.persist()?;
                }
                return Ok(());
            }
            if tx.spends(&lock_txid, lock_vout) {
                return self.handle_spend(tx);
            }
            return Ok(());
        }

        if self.record.status != SwapInStatus::Created {
            return Ok(());
        }
        let Some(address) = self.record.common.contract_address.clone() else {
            return Ok(());
        };
        let policy = self.ctx.config.policy_asset_hex(self.chain());
        let Some((vout, amount)) = contract_output(tx, &address, policy.as_deref()) else {
            return Ok(());
        };

        let expected = self.record.common.input_amount;
        let next = if amount == expected {
            SwapInStatus::ContractFundedUnconfirmed
        } else {
            tracing::warn!(
                swap_id = %self.id(),
                %expected,
                received = %amount,
                txid = %data.hash,
                "contract funded with unexpected amount"
            );
            SwapInStatus::PartialPaymentUnconfirmed
        };

        self.record.common.lock_tx = Some(ObservedTx {
            txid: data.hash.clone(),
            raw: data.raw.clone(),
            height: data.height,
        });
        self.record.common.lock_vout = Some(vout);
        self.set_status(next)?;
        self.persist()
    }

    fn handle_spend(&mut self, tx: &TransactionEvent) -> Result<()> {
        let data = &tx.transaction_data;

        if let Some(unlock) = self.record.common.unlock_tx.as_mut() {
            if unlock.txid == data.hash && unlock.height != data.height {
                unlock.height = data.height;
                self.persist()?;
            }
            return Ok(());
        }

        let pays_sweep = self
            .record
            .sweep_address
            .as_deref()
            .is_some_and(|a| tx.pays_to(a));
        let next = match (self.record.status, pays_sweep) {
            (SwapInStatus::InvoicePaid, true) => SwapInStatus::ContractClaimedUnconfirmed,
            (SwapInStatus::ContractExpired, false) => SwapInStatus::ContractRefundedUnconfirmed,
            (status, _) => {
                tracing::warn!(
                    swap_id = %self.id(),
                    ?status,
                    txid = %data.hash,
                    pays_sweep,
                    "ignoring unexpected contract spend"
                );
                return Ok(());
            }
        };

        self.record.common.unlock_tx = Some(ObservedTx {
            txid: data.hash.clone(),
            raw: data.raw.clone(),
            height: data.height,
        });
        self.set_status(next)?;
        self.persist()
    }

    /// Moves a funded swap whose contract timed out to `ContractExpired`.
    /// A confirmed swap whose invoice was already paid, for instance before a
    /// restart, moves to `InvoicePaid` instead so the contract is still claimed.
    async fn expire_if_timed_out(&mut self) -> Result<()> {
        let timed_out = self
            .record
            .common
            .timeout_block_height
            .is_some_and(|timeout| self.tip >= timeout);
        if !(self.record.status.is_funded() && timed_out) {
            return Ok(());
        }

        if self.record.status == SwapInStatus::ContractFunded
            && let Some(preimage) = self.completed_payment().await
        {
            tracing::info!(swap_id = %self.id(), "invoice already paid, claiming past timeout");
            self.record.common.preimage = Some(hex::encode(preimage));
            self.set_status(SwapInStatus::InvoicePaid)?;
            return self.persist();
        }

        self.set_status(SwapInStatus::ContractExpired)?;
        self.persist()
    }

    /// Preimage of an earlier successful payment of this swap's invoice. A
    /// failed lookup counts as unpaid so the chain stream is not held up.
    async fn completed_payment(&self) -> Option<[u8; 32]> {
        let payment_hash = parse_hash(&self.record.payment_hash).ok()?;
        match self.ctx.lightning.find_payment_preimage(&payment_hash).await {
            Ok(found) => found.filter(|p| sha256::Hash::hash(p).to_byte_array() == payment_hash),
            Err(e) => {
                tracing::warn!(swap_id = %self.id(), "payment lookup before expiry failed: {e:#}");
                None
            }
        }
    }

    /// Applies whatever the current height allows.
    async fn advance(&mut self) -> Result<()> {
        self.expire_if_timed_out().await?;

        let required = self.required_confirmations();
        let tip = self.tip;
        let status = self.record.status;
        let lock_confs = self
            .record
            .common
            .lock_tx
            .as_ref()
            .map_or(0, |t| t.confirmations(tip));
        let unlock_confs = self
            .record
            .common
            .unlock_tx
            .as_ref()
            .map_or(0, |t| t.confirmations(tip));

        match status {
            SwapInStatus::ContractFundedUnconfirmed if lock_confs >= required => {
                self.set_status(SwapInStatus::ContractFunded)?;
                self.persist()?;
                self.start_payment();
            }
            SwapInStatus::PartialPaymentUnconfirmed if lock_confs >= required => {
                self.set_status(SwapInStatus::PartialPaymentConfirmed)?;
                self.persist()?;
            }
            SwapInStatus::ContractFunded => self.start_payment(),
            SwapInStatus::InvoicePaid if !self.claim_broadcast => {
                if let Err(e) = self.claim().await {
                    tracing::warn!(swap_id = %self.id(), "claim failed: {e:#}");
                }
            }
            SwapInStatus::ContractClaimedUnconfirmed if unlock_confs >= required => {
                self.finish(SwapOutcome::Success)?;
                self.persist()?;
            }
            SwapInStatus::ContractRefundedUnconfirmed if unlock_confs >= required => {
                self.finish(SwapOutcome::Refunded)?;
                self.persist()?;
            }
            _ => {}
        }
        Ok(())
    }

    fn start_payment(&mut self) {
        if self.payment_in_flight || self.payment_exhausted {
            return;
        }
        let payment_hash = match parse_hash(&self.record.payment_hash) {
            Ok(hash) => hash,
            Err(e) => {
                tracing::error!(swap_id = %self.id(), "cannot pay invoice: {e:#}");
                return;
            }
        };
        let Some(timeout) = self.record.common.timeout_block_height else {
            return;
        };

        self.payment_in_flight = true;
        let job = PaymentJob {
            swap_id: self.id(),
            chain: self.chain(),
            invoice: self.record.invoice.clone(),
            payment_hash,
            timeout,
            attempts: self.ctx.config.timings.payment_attempts,
            retry_delay: self.ctx.config.timings.payment_retry_delay,
            lightning: self.ctx.lightning.clone(),
            indexer: self.ctx.backend(self.chain()).indexer.clone(),
        };
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let outcome = job.run().await;
            // The swap may have stopped meanwhile; its result is then dropped.
            let _ = mailbox.send(Command::Payment(outcome)).await;
        });
    }

    /// Builds and broadcasts the operator's claim of the contract.
    async fn claim(&mut self) -> Result<()> {
        let chain = self.chain();
        let common = &self.record.common;
        let lock = common.lock_tx.clone().context("no lock transaction")?;
        let vout = common.lock_vout.context("no lock output")?;
        let script = SwapScript::from_hex(common.lock_script.as_deref().context("no lock script")?)?;
        let preimage = parse_hash(common.preimage.as_deref().context("no preimage")?)?;
        let key = parse_secret_key(&common.unlock_private_key)?;

        let destination = match self.record.sweep_address.clone() {
            Some(address) => address,
            None => {
                let address = self
                    .ctx
                    .backend(chain)
                    .wallet
                    .new_address()
                    .await
                    .context("get sweep address")?;
                self.record.sweep_address = Some(address.clone());
                self.record.common.updated_at = Utc::now();
                self.persist()?;
                address
            }
        };

        let fee_rate = self.ctx.fee_rate(chain).await?;
        let built = spend::sign_spend(
            &ContractSpend {
                chain,
                script: &script,
                lock_tx_hex: &lock.raw,
                lock_vout: vout,
                destination: &destination,
                fee_rate,
            },
            &self.ctx.networks,
            &key,
            SpendBranch::Claim { preimage },
        )?;

        let txid = self
            .ctx
            .backend(chain)
            .indexer
            .broadcast_tx(&built.raw_hex)
            .await
            .context("broadcast claim")?;
        self.claim_broadcast = true;
        tracing::info!(
            swap_id = %self.id(),
            %chain,
            %txid,
            fee = built.quote.fee,
            payout = built.quote.payout,
            "claim broadcast"
        );
        Ok(())
    }
}

pub(crate) fn parse_hash(hex_str: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_str).context("decode hex")?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected 32 bytes"))
}

/// Pays a swap-in invoice with bounded retries and exponential back-off.
struct PaymentJob {
    swap_id: Uuid,
    chain: Chain,
    invoice: String,
    payment_hash: [u8; 32],
    timeout: u32,
    attempts: u32,
    retry_delay: std::time::Duration,
    lightning: Arc<dyn LightningClient>,
    indexer: Arc<dyn IndexerClient>,
}

impl PaymentJob {
    fn verified(&self, preimage: [u8; 32]) -> Option<[u8; 32]> {
        (sha256::Hash::hash(&preimage).to_byte_array() == self.payment_hash).then_some(preimage)
    }

    async fn attempt(&self) -> Result<Option<[u8; 32]>> {
        // A payment that completed before a restart must not be sent twice.
        if let Some(preimage) = self.lightning.find_payment_preimage(&self.payment_hash).await? {
            return Ok(self.verified(preimage));
        }

        let tip = self.indexer.network_status().await?.chain_height;
        let Some(cltv_limit) = payment_cltv_limit(self.chain, self.timeout, tip) else {
            anyhow::bail!("contract times out at {} (tip {tip}), too late to pay", self.timeout);
        };

        let preimage = self.lightning.send_payment(&self.invoice, cltv_limit).await?;
        let verified = self.verified(preimage);
        if verified.is_none() {
            anyhow::bail!("payment returned a preimage not matching the invoice");
        }
        Ok(verified)
    }

    async fn run(self) -> PaymentOutcome {
        let mut delay = self.retry_delay;
        for attempt in 1..=self.attempts {
            match self.attempt().await {
                Ok(Some(preimage)) => return PaymentOutcome::Paid(preimage),
                Ok(None) => {
                    tracing::warn!(swap_id = %self.swap_id, attempt, "stored payment has mismatched preimage")
                }
                Err(e) => {
                    tracing::warn!(swap_id = %self.swap_id, attempt, "invoice payment failed: {e:#}")
                }
            }
            if attempt < self.attempts {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
        PaymentOutcome::Exhausted
    }
}

#[async_trait::async_trait]
impl SwapMachine for SwapInMachine {
    fn id(&self) -> Uuid {
        self.record.common.id
    }

    fn chain(&self) -> Chain {
        self.record.common.chain
    }

    fn is_done(&self) -> bool {
        self.record.status == SwapInStatus::Done
    }

    async fn start(&mut self) -> Result<()> {
        tracing::info!(swap_id = %self.id(), chain = %self.chain(), status = ?self.record.status, "swap-in started");
        if let Some(address) = self.record.common.contract_address.as_deref() {
            self.ctx
                .backend(self.chain())
                .indexer
                .track_address(address)
                .await
                .context("track contract address")?;
        }
        self.tip = self.ctx.tip(self.chain()).await?;
        self.advance().await
    }

    async fn on_chain_event(&mut self, event: &ChainEvent) -> Result<()> {
        let snapshot = self.record.clone();
        let res = self.handle_chain_event(event).await;
        if res.is_err() {
            // Redelivery replays the event against the last persisted state.
            self.record = snapshot;
        }
        res
    }

    async fn on_expiry_check(&mut self) -> Result<()> {
        if self.record.status != SwapInStatus::Created {
            return Ok(());
        }
        let age = Utc::now() - self.record.common.created_at;
        let expired = age
            .to_std()
            .is_ok_and(|age| age > self.ctx.config.swap_expiry);
        if expired {
            self.finish(SwapOutcome::Expired)?;
            self.persist()?;
        }
        Ok(())
    }

    async fn on_payment(&mut self, outcome: PaymentOutcome) -> Result<()> {
        self.payment_in_flight = false;
        match outcome {
            PaymentOutcome::Paid(preimage) => {
                self.record.common.preimage = Some(hex::encode(preimage));
                if self.record.status == SwapInStatus::ContractFunded {
                    self.set_status(SwapInStatus::InvoicePaid)?;
                } else {
                    tracing::warn!(swap_id = %self.id(), status = ?self.record.status, "invoice paid after swap moved on");
                    self.record.common.updated_at = Utc::now();
                }
                self.persist()?;
                if self.record.status == SwapInStatus::InvoicePaid {
                    self.claim().await?;
                }
            }
            PaymentOutcome::Exhausted => {
                self.payment_exhausted = true;
                tracing::warn!(
                    swap_id = %self.id(),
                    "payment attempts exhausted, swap left to expire"
                );
            }
        }
        Ok(())
    }
}
