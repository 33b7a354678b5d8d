use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::machine::{self, Command, EngineContext, payment_cltv_limit};
use super::store::CursorStore;
use super::swap_in::{SwapInMachine, parse_hash};
use super::swap_out::SwapOutMachine;
use super::{Swap, SwapCommon, SwapError, SwapIn, SwapInStatus, SwapOut, SwapOutStatus};
use crate::amount::{add_fee_percent, decimal_to_sats, sats_to_decimal, sub_fee_percent};
use crate::chain::{Chain, ChainEvent};
use crate::contract::{ContractSpend, SpendBranch, SwapScript, UnsignedSpend, spend};
use crate::events::EventSubscriber;
use crate::keys::{KeyDeriver, parse_public_key, public_key};
use crate::lightning::HoldInvoiceRequest;
use crate::lightning::invoice::parse_bolt11;

const MAILBOX_CAPACITY: usize = 64;

/// Request for a swap-in: the caller locks on-chain funds and gets `invoice` paid.
#[derive(Debug, Clone)]
pub struct CreateSwapIn {
    pub chain: Chain,
    pub invoice: String,
    /// Key the counterparty refunds with after the timeout.
    pub refund_public_key: String,
}

/// Request for a swap-out: the caller pays a hold invoice of `amount` and
/// claims the on-chain contract with the preimage of `preimage_hash`.
#[derive(Debug, Clone)]
pub struct CreateSwapOut {
    pub chain: Chain,
    pub amount: Decimal,
    pub preimage_hash: String,
    pub claim_public_key: String,
}

struct ActorHandle {
    chain: Chain,
    mailbox: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

/// Creates swaps, runs one actor per unfinished swap and routes chain events to them.
pub struct Orchestrator {
    ctx: Arc<EngineContext>,
    keys: KeyDeriver,
    cursors: Arc<dyn CursorStore>,
    actors: Mutex<HashMap<Uuid, ActorHandle>>,
}

impl Orchestrator {
    pub fn new(ctx: EngineContext, keys: KeyDeriver, cursors: Arc<dyn CursorStore>) -> Self {
        Self {
            ctx: Arc::new(ctx),
            keys,
            cursors,
            actors: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Number of swaps with a running actor.
    pub fn active_swaps(&self) -> usize {
        let mut actors = self.actors.lock().expect("actors mutex poisoned");
        actors.retain(|_, a| !a.mailbox.is_closed());
        actors.len()
    }

    fn check_amount(&self, chain: Chain, amount: Decimal) -> Result<(), SwapError> {
        let cfg = self.ctx.config.chain(chain);
        if amount < cfg.min_amount || amount > cfg.max_amount {
            return Err(SwapError::AmountOutOfRange {
                chain,
                amount,
                min: cfg.min_amount,
                max: cfg.max_amount,
            });
        }
        Ok(())
    }

    fn new_common(
        &self,
        chain: Chain,
        input_amount: Decimal,
        output_amount: Decimal,
        counterparty_public_key: String,
    ) -> Result<(SwapCommon, bitcoin::secp256k1::SecretKey), SwapError> {
        let key_index = self.cursors.next_key_index()?;
        let secret_key = self.keys.derive_secret_key(key_index)?;
        let now = Utc::now();
        let common = SwapCommon {
            id: Uuid::new_v4(),
            chain,
            input_amount,
            output_amount,
            lock_script: None,
            contract_address: None,
            key_index,
            unlock_private_key: hex::encode(secret_key.secret_bytes()),
            counterparty_public_key,
            timeout_block_height: None,
            lock_tx: None,
            lock_vout: None,
            unlock_tx: None,
            preimage: None,
            outcome: None,
            created_at: now,
            updated_at: now,
        };
        Ok((common, secret_key))
    }

    pub async fn create_swap_in(&self, req: CreateSwapIn) -> Result<Swap, SwapError> {
        let invoice = parse_bolt11(&req.invoice)
            .map_err(|e| SwapError::InvalidInvoice(format!("{e:#}")))?;
        if invoice.network != self.ctx.config.bitcoin_network {
            return Err(SwapError::InvalidInvoice(format!(
                "invoice is for {}, expected {}",
                invoice.network, self.ctx.config.bitcoin_network
            )));
        }
        if invoice.is_expired {
            return Err(SwapError::InvalidInvoice("invoice expired".into()));
        }
        let amount_msat = invoice
            .amount_msat
            .ok_or_else(|| SwapError::InvalidInvoice("invoice has no amount".into()))?;
        if amount_msat % 1_000 != 0 {
            return Err(SwapError::InvalidInvoice(
                "invoice amount is not a whole number of satoshis".into(),
            ));
        }

        let output_amount = sats_to_decimal(amount_msat / 1_000);
        let input_amount = add_fee_percent(output_amount, self.ctx.config.fee_percent);
        self.check_amount(req.chain, input_amount)?;

        let refund_pubkey = parse_public_key(&req.refund_public_key)
            .map_err(|e| SwapError::InvalidPublicKey(format!("{e:#}")))?;

        let chain = req.chain;
        let tip = self.ctx.tip(chain).await?;
        let timeout = tip + self.ctx.config.chain(chain).swap_in_timeout_blocks;
        let budget = payment_cltv_limit(chain, timeout, tip).unwrap_or(0);
        if u64::from(budget) < invoice.min_final_cltv_expiry_delta {
            return Err(SwapError::InvalidInvoice(format!(
                "min_final_cltv_expiry_delta {} exceeds the payment budget of {budget} blocks",
                invoice.min_final_cltv_expiry_delta
            )));
        }

        let (mut common, secret_key) =
            self.new_common(chain, input_amount, output_amount, req.refund_public_key.clone())?;
        let script = SwapScript::forward(
            &invoice.payment_hash,
            public_key(&secret_key),
            refund_pubkey,
            timeout,
        );
        let address = self.ctx.contract_address(chain, &script);
        common.lock_script = Some(script.to_hex());
        common.contract_address = Some(address.clone());
        common.timeout_block_height = Some(timeout);

        let swap = Swap::In(SwapIn {
            common,
            status: SwapInStatus::Created,
            invoice: req.invoice.trim().to_string(),
            payment_hash: hex::encode(invoice.payment_hash),
            sweep_address: None,
        });
        self.ctx.store.save(&swap).context("persist new swap-in")?;
        self.ctx
            .backend(chain)
            .indexer
            .track_address(&address)
            .await
            .context("track contract address")?;

        tracing::info!(
            swap_id = %swap.id(),
            %chain,
            %input_amount,
            %output_amount,
            %address,
            timeout,
            "swap-in created"
        );
        self.spawn(swap.clone());
        Ok(swap)
    }

    pub async fn create_swap_out(&self, req: CreateSwapOut) -> Result<Swap, SwapError> {
        self.check_amount(req.chain, req.amount)?;
        let preimage_hash = parse_hash(&req.preimage_hash)
            .map_err(|e| SwapError::InvalidPreimageHash(format!("{e:#}")))?;
        parse_public_key(&req.claim_public_key)
            .map_err(|e| SwapError::InvalidPublicKey(format!("{e:#}")))?;

        let input_amount = req.amount;
        let output_amount = sub_fee_percent(input_amount, self.ctx.config.fee_percent);
        let amount_sat = decimal_to_sats(input_amount)?;

        let (common, _) = self.new_common(
            req.chain,
            input_amount,
            output_amount,
            req.claim_public_key.clone(),
        )?;
        let invoice = self
            .ctx
            .lightning
            .add_hold_invoice(HoldInvoiceRequest {
                payment_hash: preimage_hash,
                amount_sat,
                expiry_secs: self.ctx.config.swap_out_invoice_expiry_secs,
                cltv_expiry: self.ctx.config.swap_out_min_final_cltv_expiry,
                memo: format!("swap-out {}", common.id),
            })
            .await
            .context("add hold invoice")?;

        let swap = Swap::Out(SwapOut {
            common,
            status: SwapOutStatus::Created,
            invoice,
            preimage_hash: hex::encode(preimage_hash),
            funding_txid: None,
            sweep_address: None,
        });
        self.ctx.store.save(&swap).context("persist new swap-out")?;

        tracing::info!(
            swap_id = %swap.id(),
            chain = %req.chain,
            %input_amount,
            %output_amount,
            "swap-out created"
        );
        self.spawn(swap.clone());
        Ok(swap)
    }

    pub fn get_swap(&self, id: Uuid) -> Result<Swap, SwapError> {
        self.ctx.store.find_by_id(id)?.ok_or(SwapError::NotFound(id))
    }

    fn funded_contract(swap: &Swap) -> Result<(SwapScript, String, String, u32), SwapError> {
        let common = swap.common();
        let (Some(script), Some(lock), Some(vout)) = (
            common.lock_script.as_deref(),
            common.lock_tx.as_ref(),
            common.lock_vout,
        ) else {
            return Err(SwapError::WrongStatus {
                id: common.id,
                status: swap.status_str(),
            });
        };
        let script = SwapScript::from_hex(script)?;
        Ok((script, lock.txid.clone(), lock.raw.clone(), vout))
    }

    /// Broadcasts a counterparty-signed claim (swap-out) or refund (swap-in).
    ///
    /// The swap reacts once the indexer reports the transaction.
    pub async fn submit_signed_tx(&self, id: Uuid, raw_hex: &str) -> Result<String, SwapError> {
        let swap = self.get_swap(id)?;
        let (_, lock_txid, _, vout) = Self::funded_contract(&swap)?;
        let chain = swap.chain();

        let spending = spend::witnesses_spending(chain, raw_hex, &lock_txid, vout)?;
        if spending.is_empty() {
            return Err(SwapError::UnrelatedTransaction(id));
        }

        let txid = self
            .ctx
            .backend(chain)
            .indexer
            .broadcast_tx(raw_hex)
            .await
            .context("broadcast counterparty transaction")?;
        tracing::info!(swap_id = %id, %chain, %txid, "counterparty transaction broadcast");
        Ok(txid)
    }

    /// Fee-sized unsigned spend of the contract for the counterparty to sign:
    /// the refund of a swap-in or the claim of a swap-out.
    pub async fn unsigned_spend(
        &self,
        id: Uuid,
        destination: &str,
    ) -> Result<UnsignedSpend, SwapError> {
        let swap = self.get_swap(id)?;
        let (script, _, lock_raw, vout) = Self::funded_contract(&swap)?;
        let chain = swap.chain();

        let branch = match &swap {
            Swap::In(_) => SpendBranch::Refund {
                timeout: script.timeout(),
            },
            // Only the witness shape matters for sizing.
            Swap::Out(_) => SpendBranch::Claim {
                preimage: [0u8; 32],
            },
        };
        let fee_rate = self.ctx.fee_rate(chain).await?;
        let unsigned = spend::unsigned_spend(
            &ContractSpend {
                chain,
                script: &script,
                lock_tx_hex: &lock_raw,
                lock_vout: vout,
                destination,
                fee_rate,
            },
            &self.ctx.networks,
            branch,
        )?;
        Ok(unsigned)
    }

    fn spawn(&self, swap: Swap) {
        let id = swap.id();
        let chain = swap.chain();
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let timings = self.ctx.config.timings.clone();

        let task = match swap {
            Swap::In(record) => {
                let machine = SwapInMachine::new(record, self.ctx.clone(), tx.clone());
                tokio::spawn(machine::run(machine, rx, timings))
            }
            Swap::Out(record) => {
                let machine = SwapOutMachine::new(record, self.ctx.clone());
                tokio::spawn(machine::run(machine, rx, timings))
            }
        };

        let mut actors = self.actors.lock().expect("actors mutex poisoned");
        actors.insert(
            id,
            ActorHandle {
                chain,
                mailbox: tx,
                task,
            },
        );
    }

    /// Starts an actor for every unfinished swap in storage.
    pub fn resume(&self) -> Result<usize> {
        let swaps = self
            .ctx
            .store
            .find_unfinished()
            .context("load unfinished swaps")?;
        let mut resumed = 0;
        for swap in swaps {
            let running = self
                .actors
                .lock()
                .expect("actors mutex poisoned")
                .contains_key(&swap.id());
            if running {
                continue;
            }
            self.spawn(swap);
            resumed += 1;
        }
        tracing::info!(resumed, "resumed unfinished swaps");
        Ok(resumed)
    }

    /// Delivers `event` to every actor on `chain` and waits until all handled it.
    pub async fn dispatch(&self, chain: Chain, event: ChainEvent) -> Result<()> {
        let targets: Vec<(Uuid, mpsc::Sender<Command>)> = {
            let actors = self.actors.lock().expect("actors mutex poisoned");
            actors
                .iter()
                .filter(|(_, a)| a.chain == chain)
                .map(|(id, a)| (*id, a.mailbox.clone()))
                .collect()
        };

        let event = Arc::new(event);
        let deliveries = targets.into_iter().map(|(id, mailbox)| {
            let event = event.clone();
            async move {
                let (ack, done) = oneshot::channel();
                if mailbox.send(Command::Chain { event, ack }).await.is_err() {
                    return (id, Ok(false));
                }
                match done.await {
                    Ok(res) => (id, res.map(|()| true)),
                    // The actor finished while the event was queued.
                    Err(_) => (id, Ok(false)),
                }
            }
        });
        let results = futures::future::join_all(deliveries).await;

        let mut first_error = None;
        let mut finished = Vec::new();
        for (id, res) in results {
            match res {
                Ok(true) => {}
                Ok(false) => finished.push(id),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e.context(format!("swap {id}")));
                    }
                }
            }
        }

        if !finished.is_empty() {
            let mut actors = self.actors.lock().expect("actors mutex poisoned");
            for id in finished {
                actors.remove(&id);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stops every actor and waits for them. Swaps stay resumable.
    pub async fn shutdown(&self) {
        let actors: Vec<(Uuid, ActorHandle)> = self
            .actors
            .lock()
            .expect("actors mutex poisoned")
            .drain()
            .collect();
        tracing::info!(count = actors.len(), "stopping swap actors");

        let stops = actors.into_iter().map(|(id, actor)| async move {
            let _ = actor.mailbox.send(Command::Stop).await;
            if let Err(e) = actor.task.await {
                tracing::warn!(swap_id = %id, "swap actor panicked: {e}");
            }
        });
        futures::future::join_all(stops).await;
    }
}

#[async_trait::async_trait]
impl EventSubscriber for Orchestrator {
    async fn on_chain_event(&self, chain: Chain, event: &ChainEvent) -> Result<()> {
        self.dispatch(chain, event.clone()).await
    }
}
