//! Swap-out: the counterparty pays a hold invoice, the operator locks funds
//! in a reverse contract and settles the invoice with the preimage revealed
//! by the counterparty's claim.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use chrono::Utc;
use uuid::Uuid;

use super::machine::{EngineContext, SwapMachine, contract_output, swap_out_timeout};
use super::swap_in::parse_hash;
use super::{ObservedTx, Swap, SwapError, SwapOut, SwapOutStatus, SwapOutcome};
use crate::amount::decimal_to_sats;
use crate::chain::{Chain, ChainEvent, TransactionEvent};
use crate::contract::{ContractSpend, SpendBranch, SwapScript, spend};
use crate::keys::{parse_public_key, parse_secret_key, public_key};
use crate::lightning::InvoiceState;

pub(crate) struct SwapOutMachine {
    record: SwapOut,
    ctx: Arc<EngineContext>,
    tip: u32,
    invoice_canceled: bool,
    refund_broadcast: bool,
}

impl SwapOutMachine {
    pub(crate) fn new(record: SwapOut, ctx: Arc<EngineContext>) -> Self {
        Self {
            record,
            ctx,
            tip: 0,
            invoice_canceled: false,
            refund_broadcast: false,
        }
    }

    fn set_status(&mut self, next: SwapOutStatus) -> Result<()> {
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
            "swap-out status changed"
        );
        Ok(())
    }

    fn finish(&mut self, outcome: SwapOutcome) -> Result<()> {
        self.set_status(SwapOutStatus::Done)?;
        self.record.common.outcome = Some(outcome);
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        self.ctx
            .store
            .save(&Swap::Out(self.record.clone()))
            .with_context(|| format!("persist swap-out {}", self.id()))
    }

    fn preimage_hash(&self) -> Result<[u8; 32]> {
        parse_hash(&self.record.preimage_hash).context("stored preimage hash")
    }

    fn script(&self) -> Result<SwapScript> {
        SwapScript::from_hex(
            self.record
                .common
                .lock_script
                .as_deref()
                .context("no lock script")?,
        )
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

    async fn cancel_invoice(&self) {
        let hash = match self.preimage_hash() {
            Ok(hash) => hash,
            Err(e) => {
                tracing::warn!(swap_id = %self.id(), "cannot cancel invoice: {e:#}");
                return;
            }
        };
        if let Err(e) = self.ctx.lightning.cancel_invoice(&hash).await {
            tracing::warn!(swap_id = %self.id(), "cancel hold invoice failed: {e:#}");
        }
    }

    /// The counterparty's HTLC is held: derive and record the contract.
    async fn prepare_contract(&mut self, htlc_expiry: Option<u32>) -> Result<()> {
        let chain = self.chain();
        let Some(htlc_expiry) = htlc_expiry else {
            anyhow::bail!("accepted invoice reports no HTLC expiry");
        };

        let bitcoin_tip = self.ctx.tip(Chain::Bitcoin).await?;
        let chain_tip = match chain {
            Chain::Bitcoin => bitcoin_tip,
            Chain::Liquid => self.ctx.tip(Chain::Liquid).await?,
        };
        self.tip = self.tip.max(chain_tip);

        self.set_status(SwapOutStatus::InvoicePaymentIntentReceived)?;

        let margin = self.ctx.config.swap_out_cltv_margin;
        let Some(timeout) = swap_out_timeout(chain, htlc_expiry, margin, bitcoin_tip, chain_tip)
        else {
            tracing::warn!(
                swap_id = %self.id(),
                htlc_expiry,
                bitcoin_tip,
                "held HTLC expires too soon to lock funds"
            );
            self.cancel_invoice().await;
            self.finish(SwapOutcome::Expired)?;
            return self.persist();
        };

        let claim_pubkey = parse_public_key(&self.record.common.counterparty_public_key)?;
        let refund_pubkey = public_key(&parse_secret_key(&self.record.common.unlock_private_key)?);
        let script = SwapScript::reverse(self.preimage_hash()?, claim_pubkey, refund_pubkey, timeout);
        let address = self.ctx.contract_address(chain, &script);

        self.record.common.lock_script = Some(script.to_hex());
        self.record.common.contract_address = Some(address.clone());
        self.record.common.timeout_block_height = Some(timeout);
        self.persist()
    }

    async fn track_and_fund(&mut self) -> Result<()> {
        let chain = self.chain();
        let address = self
            .record
            .common
            .contract_address
            .clone()
            .context("no contract address")?;
        self.ctx
            .backend(chain)
            .indexer
            .track_address(&address)
            .await
            .context("track contract address")?;

        let amount = decimal_to_sats(self.record.common.output_amount)?;

        let txid = self
            .ctx
            .backend(chain)
            .wallet
            .send_to_address(&address, amount)
            .await
            .context("fund contract")?;
        tracing::info!(swap_id = %self.id(), %chain, %txid, amount, "contract funding sent");

        self.record.funding_txid = Some(txid);
        self.record.common.updated_at = Utc::now();
        self.persist()
    }

    async fn refund(&mut self) -> Result<()> {
        let chain = self.chain();
        let common = &self.record.common;
        let lock = common.lock_tx.clone().context("no lock transaction")?;
        let vout = common.lock_vout.context("no lock output")?;
        let timeout = common.timeout_block_height.context("no timeout")?;
        let key = parse_secret_key(&common.unlock_private_key)?;
        let script = self.script()?;

        let destination = match self.record.sweep_address.clone() {
            Some(address) => address,
            None => {
                let address = self
                    .ctx
                    .backend(chain)
                    .wallet
                    .new_address()
                    .await
                    .context("get refund address")?;
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
            SpendBranch::Refund { timeout },
        )?;

        let txid = self
            .ctx
            .backend(chain)
            .indexer
            .broadcast_tx(&built.raw_hex)
            .await
            .context("broadcast refund")?;
        self.refund_broadcast = true;
        tracing::info!(
            swap_id = %self.id(),
            %chain,
            %txid,
            fee = built.quote.fee,
            "refund broadcast"
        );
        Ok(())
    }

    async fn handle_chain_event(&mut self, event: &ChainEvent) -> Result<()> {
        match event {
            ChainEvent::Block(block) => self.observe_height(Some(block.height)),
            ChainEvent::Transaction(tx) => {
                self.observe_height(tx.transaction_data.height);
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
                return self.handle_spend(tx, &lock_txid, lock_vout);
            }
            return Ok(());
        }

        if self.record.status != SwapOutStatus::InvoicePaymentIntentReceived {
            return Ok(());
        }
        let Some(address) = self.record.common.contract_address.clone() else {
            return Ok(());
        };
        let policy = self.ctx.config.policy_asset_hex(self.chain());
        let Some((vout, amount)) = contract_output(tx, &address, policy.as_deref()) else {
            return Ok(());
        };

        if amount != self.record.common.output_amount {
            tracing::warn!(
                swap_id = %self.id(),
                expected = %self.record.common.output_amount,
                received = %amount,
                "contract funded with unexpected amount"
            );
        }
        if let Some(funding) = self.record.funding_txid.as_deref()
            && funding != data.hash
        {
            tracing::warn!(swap_id = %self.id(), funding, txid = %data.hash, "contract funded by another transaction");
        }

        self.record.common.lock_tx = Some(ObservedTx {
            txid: data.hash.clone(),
            raw: data.raw.clone(),
            height: data.height,
        });
        self.record.common.lock_vout = Some(vout);
        self.set_status(SwapOutStatus::ContractFundedUnconfirmed)?;
        self.persist()
    }

    fn handle_spend(&mut self, tx: &TransactionEvent, lock_txid: &str, lock_vout: u32) -> Result<()> {
        let data = &tx.transaction_data;

        if let Some(unlock) = self.record.common.unlock_tx.as_mut() {
            if unlock.txid == data.hash && unlock.height != data.height {
                unlock.height = data.height;
                self.persist()?;
            }
            return Ok(());
        }

        let script = self.script()?;
        let preimage =
            match spend::extract_preimage(self.chain(), &data.raw, lock_txid, lock_vout, &script) {
                Ok(preimage) => preimage,
                Err(e) => {
                    tracing::warn!(swap_id = %self.id(), txid = %data.hash, "cannot decode contract spend: {e:#}");
                    None
                }
            };

        let observed = ObservedTx {
            txid: data.hash.clone(),
            raw: data.raw.clone(),
            height: data.height,
        };

        if let Some(preimage) = preimage {
            // Settled in `advance`, which also retries a failed settle.
            tracing::info!(swap_id = %self.id(), txid = %data.hash, "counterparty claim revealed the preimage");
            self.record.common.preimage = Some(hex::encode(preimage));
            self.record.common.unlock_tx = Some(observed);
            self.record.common.updated_at = Utc::now();
            return self.persist();
        }

        let pays_sweep = self
            .record
            .sweep_address
            .as_deref()
            .is_some_and(|a| tx.pays_to(a));
        if self.record.status == SwapOutStatus::ContractExpired && pays_sweep {
            self.record.common.unlock_tx = Some(observed);
            self.set_status(SwapOutStatus::ContractRefundedUnconfirmed)?;
            return self.persist();
        }

        tracing::warn!(
            swap_id = %self.id(),
            status = ?self.record.status,
            txid = %data.hash,
            "ignoring unexpected contract spend"
        );
        Ok(())
    }

    async fn settle(&mut self) -> Result<()> {
        let preimage = parse_hash(
            self.record
                .common
                .preimage
                .as_deref()
                .context("no preimage")?,
        )?;
        self.ctx
            .lightning
            .settle_invoice(&preimage)
            .await
            .context("settle hold invoice")?;
        tracing::info!(swap_id = %self.id(), "hold invoice settled");
        self.set_status(SwapOutStatus::ContractClaimedUnconfirmed)?;
        self.persist()
    }

    async fn advance(&mut self) -> Result<()> {
        let required = self.ctx.config.chain(self.chain()).required_confirmations;
        let tip = self.tip;
        let status = self.record.status;
        let claimed = self.record.common.preimage.is_some() && self.record.common.unlock_tx.is_some();

        if claimed && (status.is_funded() || status == SwapOutStatus::ContractExpired) {
            if let Err(e) = self.settle().await {
                tracing::warn!(swap_id = %self.id(), "settle failed, will retry: {e:#}");
            }
            return Ok(());
        }

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
        let timed_out = self
            .record
            .common
            .timeout_block_height
            .is_some_and(|timeout| tip >= timeout);

        if status.is_funded() && timed_out {
            self.set_status(SwapOutStatus::ContractExpired)?;
            self.persist()?;
            self.cancel_invoice().await;
            if let Err(e) = self.refund().await {
                tracing::warn!(swap_id = %self.id(), "refund failed: {e:#}");
            }
            return Ok(());
        }

        match status {
            SwapOutStatus::ContractFundedUnconfirmed if lock_confs >= required => {
                self.set_status(SwapOutStatus::ContractFunded)?;
                self.persist()?;
            }
            SwapOutStatus::ContractExpired
                if !self.refund_broadcast && self.record.common.unlock_tx.is_none() =>
            {
                if let Err(e) = self.refund().await {
                    tracing::warn!(swap_id = %self.id(), "refund failed: {e:#}");
                }
            }
            SwapOutStatus::ContractClaimedUnconfirmed if unlock_confs >= required => {
                self.finish(SwapOutcome::Success)?;
                self.persist()?;
            }
            SwapOutStatus::ContractRefundedUnconfirmed if unlock_confs >= required => {
                self.finish(SwapOutcome::Refunded)?;
                self.persist()?;
            }
            _ => {}
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl SwapMachine for SwapOutMachine {
    fn id(&self) -> Uuid {
        self.record.common.id
    }

    fn chain(&self) -> Chain {
        self.record.common.chain
    }

    fn is_done(&self) -> bool {
        self.record.status == SwapOutStatus::Done
    }

    fn polls_invoice(&self) -> bool {
        self.record.status == SwapOutStatus::Created && !self.invoice_canceled
    }

    async fn start(&mut self) -> Result<()> {
        tracing::info!(swap_id = %self.id(), chain = %self.chain(), status = ?self.record.status, "swap-out started");
        if let Some(address) = self.record.common.contract_address.as_deref() {
            self.ctx
                .backend(self.chain())
                .indexer
                .track_address(address)
                .await
                .context("track contract address")?;
        }
        self.tip = self.ctx.tip(self.chain()).await?;

        if self.record.status == SwapOutStatus::InvoicePaymentIntentReceived
            && self.record.funding_txid.is_none()
        {
            self.track_and_fund().await?;
        }
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
        match self.record.status {
            SwapOutStatus::Created => {
                let age = Utc::now() - self.record.common.created_at;
                let expired = age
                    .to_std()
                    .is_ok_and(|age| age > self.ctx.config.swap_expiry);
                if expired {
                    self.cancel_invoice().await;
                    self.finish(SwapOutcome::Expired)?;
                    self.persist()?;
                }
            }
            SwapOutStatus::InvoicePaymentIntentReceived if self.record.funding_txid.is_none() => {
                self.track_and_fund().await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn on_invoice_poll(&mut self) -> Result<()> {
        let lookup = self.ctx.lightning.lookup_invoice(&self.preimage_hash()?).await?;
        match lookup.state {
            InvoiceState::Accepted => {
                tracing::info!(swap_id = %self.id(), htlc_expiry = ?lookup.htlc_expiry, "hold invoice accepted");
                let snapshot = self.record.clone();
                if let Err(e) = self.prepare_contract(lookup.htlc_expiry).await {
                    self.record = snapshot;
                    return Err(e);
                }
                if self.record.status == SwapOutStatus::InvoicePaymentIntentReceived {
                    // A failure here is retried by the expiry check.
                    self.track_and_fund().await?;
                }
            }
            InvoiceState::Canceled => {
                tracing::info!(swap_id = %self.id(), "hold invoice canceled, waiting for expiry");
                self.invoice_canceled = true;
            }
            InvoiceState::Open | InvoiceState::Settled => {}
        }
        Ok(())
    }
}
