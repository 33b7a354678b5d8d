mod support;

use std::time::Duration;

use anyhow::{Context as _, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use lightning_invoice::Currency;
use ln_chain_swap::chain::Chain;
use ln_chain_swap::config::EngineConfig;
use ln_chain_swap::contract::{ContractSpend, SpendBranch, SwapScript, spend};
use ln_chain_swap::swap::{CreateSwapIn, Swap, SwapError, SwapIn, SwapInStatus, SwapOutcome};
use support::wait::wait_for;
use support::{
    Harness, START_HEIGHT, invoice, invoice_for, pay_to, public_key_hex, regtest_address, sats,
    secret_key, test_config, tx_event,
};
use uuid::Uuid;

fn swap_in(swap: Swap) -> Result<SwapIn> {
    match swap {
        Swap::In(s) => Ok(s),
        Swap::Out(_) => anyhow::bail!("expected a swap-in"),
    }
}

async fn create(h: &Harness, preimage: [u8; 32], amount_sat: u64) -> Result<SwapIn> {
    let swap = h
        .orchestrator
        .create_swap_in(CreateSwapIn {
            chain: Chain::Bitcoin,
            invoice: invoice(&preimage, amount_sat * 1_000),
            refund_public_key: public_key_hex(&secret_key(21)),
        })
        .await
        .context("create swap-in")?;
    swap_in(swap)
}

fn contract_address(swap: &SwapIn) -> Result<String> {
    swap.common
        .contract_address
        .clone()
        .context("contract address missing")
}

/// The counterparty's own refund of the contract, signed with the refund key.
fn counterparty_refund(h: &Harness, id: Uuid, lock_raw: &str, timeout: u32) -> Result<String> {
    let record = swap_in(h.swap(id)?)?;
    let script = SwapScript::from_hex(record.common.lock_script.as_deref().context("script")?)?;
    let refund_key = secret_key(21);
    let refund = spend::sign_spend(
        &ContractSpend {
            chain: Chain::Bitcoin,
            script: &script,
            lock_tx_hex: lock_raw,
            lock_vout: 0,
            destination: &regtest_address(&refund_key),
            fee_rate: 2.0,
        },
        &h.orchestrator.context().networks,
        &refund_key,
        SpendBranch::Refund { timeout },
    )?;
    Ok(refund.raw_hex)
}

/// Funds and confirms the contract while every payment attempt fails.
async fn fund_unpayable(h: &Harness, created: &SwapIn, amount_sat: u64) -> Result<String> {
    let (lock_raw, _) = pay_to(&contract_address(created)?, amount_sat)?;
    h.transaction(&lock_raw, Some(START_HEIGHT + 1)).await?;
    h.block(START_HEIGHT + 2).await?;
    wait_for("payment attempts to run out", Duration::from_secs(5), || async {
        Ok((h.lightning.payment_attempts() >= 3).then_some(()))
    })
    .await?;
    assert_eq!(h.swap(created.common.id)?.status_str(), "CONTRACT_FUNDED");
    Ok(lock_raw)
}

#[tokio::test]
async fn swap_in_pays_invoice_and_claims_contract() -> Result<()> {
    let h = Harness::new(test_config())?;
    let preimage = [3u8; 32];
    h.lightning.know_preimage(preimage);

    let created = create(&h, preimage, 250_000).await?;
    let id = created.common.id;
    assert_eq!(created.status, SwapInStatus::Created);
    assert_eq!(created.common.input_amount, sats(250_000));
    assert_eq!(created.common.output_amount, sats(250_000));
    assert_eq!(created.common.timeout_block_height, Some(START_HEIGHT + 144));
    let address = contract_address(&created)?;
    assert!(h.bitcoin.tracked().contains(&address));

    let (lock_raw, lock_txid) = pay_to(&address, 250_000)?;
    h.transaction(&lock_raw, None).await?;
    assert_eq!(h.swap(id)?.status_str(), "CONTRACT_FUNDED_UNCONFIRMED");

    h.transaction(&lock_raw, Some(START_HEIGHT + 1)).await?;
    assert_eq!(h.swap(id)?.status_str(), "CONTRACT_FUNDED_UNCONFIRMED");
    h.block(START_HEIGHT + 2).await?;

    let claim_raw = h.wait_for_broadcast(1).await?;
    let paid = swap_in(h.swap(id)?)?;
    assert_eq!(paid.status, SwapInStatus::InvoicePaid);
    assert_eq!(paid.common.preimage.as_deref(), Some(hex::encode(preimage).as_str()));
    assert_eq!(paid.sweep_address.as_deref(), Some(h.wallet.address()));
    assert_eq!(h.lightning.payment_attempts(), 1);

    let claim = tx_event(&claim_raw, None)?;
    assert!(claim.spends(&lock_txid, 0));
    assert!(claim.pays_to(h.wallet.address()));

    h.transaction(&claim_raw, Some(START_HEIGHT + 3)).await?;
    assert_eq!(h.swap(id)?.status_str(), "CONTRACT_CLAIMED_UNCONFIRMED");
    h.block(START_HEIGHT + 4).await?;

    let done = swap_in(h.swap(id)?)?;
    assert_eq!(done.status, SwapInStatus::Done);
    assert_eq!(done.common.outcome, Some(SwapOutcome::Success));

    wait_for("actor to stop", Duration::from_secs(5), || async {
        Ok((h.orchestrator.active_swaps() == 0).then_some(()))
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn unconfirmed_contract_expires_and_counterparty_refunds() -> Result<()> {
    let h = Harness::new(test_config())?;
    let preimage = [4u8; 32];
    h.lightning.know_preimage(preimage);

    let created = create(&h, preimage, 250_000).await?;
    let id = created.common.id;
    let timeout = created.common.timeout_block_height.context("timeout")?;
    let (lock_raw, lock_txid) = pay_to(&contract_address(&created)?, 250_000)?;
    h.transaction(&lock_raw, None).await?;

    h.block(timeout - 1).await?;
    assert_eq!(h.swap(id)?.status_str(), "CONTRACT_FUNDED_UNCONFIRMED");
    h.block(timeout).await?;
    assert_eq!(h.swap(id)?.status_str(), "CONTRACT_EXPIRED");
    assert_eq!(h.lightning.payment_attempts(), 0);

    let refund_key = secret_key(21);
    let refund_address = regtest_address(&refund_key);

    let unsigned = h.orchestrator.unsigned_spend(id, &refund_address).await?;
    let psbt = bitcoin::psbt::Psbt::deserialize(&BASE64.decode(&unsigned.encoded)?)?;
    assert_eq!(psbt.unsigned_tx.input[0].previous_output.txid.to_string(), lock_txid);
    assert_eq!(psbt.unsigned_tx.lock_time.to_consensus_u32(), timeout);
    assert_eq!(
        psbt.unsigned_tx.output[0].value.to_sat(),
        250_000 - unsigned.quote.fee
    );

    let record = swap_in(h.swap(id)?)?;
    let script = SwapScript::from_hex(record.common.lock_script.as_deref().context("script")?)?;
    let refund = spend::sign_spend(
        &ContractSpend {
            chain: Chain::Bitcoin,
            script: &script,
            lock_tx_hex: &lock_raw,
            lock_vout: 0,
            destination: &refund_address,
            fee_rate: 2.0,
        },
        &h.orchestrator.context().networks,
        &refund_key,
        SpendBranch::Refund { timeout },
    )?;
    let txid = h.orchestrator.submit_signed_tx(id, &refund.raw_hex).await?;
    assert_eq!(txid, refund.txid);
    assert_eq!(h.bitcoin.broadcasts(), vec![refund.raw_hex.clone()]);

    h.transaction(&refund.raw_hex, Some(timeout + 1)).await?;
    assert_eq!(h.swap(id)?.status_str(), "CONTRACT_REFUNDED_UNCONFIRMED");
    h.block(timeout + 2).await?;

    let done = swap_in(h.swap(id)?)?;
    assert_eq!(done.status, SwapInStatus::Done);
    assert_eq!(done.common.outcome, Some(SwapOutcome::Refunded));
    Ok(())
}

#[tokio::test]
async fn wrong_amount_is_a_partial_payment_and_never_paid() -> Result<()> {
    let h = Harness::new(test_config())?;
    let preimage = [5u8; 32];
    h.lightning.know_preimage(preimage);

    let created = create(&h, preimage, 250_000).await?;
    let id = created.common.id;
    let timeout = created.common.timeout_block_height.context("timeout")?;

    let (lock_raw, _) = pay_to(&contract_address(&created)?, 249_999)?;
    h.transaction(&lock_raw, Some(START_HEIGHT + 1)).await?;
    assert_eq!(h.swap(id)?.status_str(), "PARTIAL_PAYMENT_UNCONFIRMED");

    h.block(START_HEIGHT + 2).await?;
    assert_eq!(h.swap(id)?.status_str(), "PARTIAL_PAYMENT_CONFIRMED");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.lightning.payment_attempts(), 0);

    h.block(timeout).await?;
    assert_eq!(h.swap(id)?.status_str(), "CONTRACT_EXPIRED");
    Ok(())
}

#[tokio::test]
async fn failed_payments_are_retried() -> Result<()> {
    let h = Harness::new(test_config())?;
    let preimage = [6u8; 32];
    h.lightning.know_preimage(preimage);
    h.lightning.fail_next_payments(2);

    let created = create(&h, preimage, 100_000).await?;
    let id = created.common.id;
    let (lock_raw, _) = pay_to(&contract_address(&created)?, 100_000)?;
    h.transaction(&lock_raw, Some(START_HEIGHT + 1)).await?;
    h.block(START_HEIGHT + 2).await?;

    h.wait_for_broadcast(1).await?;
    assert_eq!(h.lightning.payment_attempts(), 3);
    assert_eq!(h.swap(id)?.status_str(), "INVOICE_PAID");
    Ok(())
}

#[tokio::test]
async fn exhausted_payments_leave_the_swap_funded() -> Result<()> {
    let h = Harness::new(test_config())?;
    let preimage = [7u8; 32];
    h.lightning.know_preimage(preimage);
    h.lightning.fail_next_payments(3);

    let created = create(&h, preimage, 100_000).await?;
    let id = created.common.id;
    let (lock_raw, _) = pay_to(&contract_address(&created)?, 100_000)?;
    h.transaction(&lock_raw, Some(START_HEIGHT + 1)).await?;
    h.block(START_HEIGHT + 2).await?;

    wait_for("three payment attempts", Duration::from_secs(5), || async {
        Ok((h.lightning.payment_attempts() >= 3).then_some(()))
    })
    .await?;
    h.block(START_HEIGHT + 3).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.lightning.payment_attempts(), 3);
    assert_eq!(h.swap(id)?.status_str(), "CONTRACT_FUNDED");
    assert!(h.bitcoin.broadcasts().is_empty());
    Ok(())
}

#[tokio::test]
async fn swap_resumes_after_restart() -> Result<()> {
    let first = Harness::new(test_config())?;
    let preimage = [8u8; 32];

    let created = create(&first, preimage, 150_000).await?;
    let id = created.common.id;
    let (lock_raw, _) = pay_to(&contract_address(&created)?, 150_000)?;
    first.transaction(&lock_raw, Some(START_HEIGHT + 1)).await?;
    first.orchestrator.shutdown().await;
    assert_eq!(first.orchestrator.active_swaps(), 0);

    let second = Harness::with_store(test_config(), first.store.clone())?;
    second.lightning.know_preimage(preimage);
    assert_eq!(second.orchestrator.resume()?, 1);
    assert_eq!(second.orchestrator.resume()?, 0);

    second.block(START_HEIGHT + 2).await?;
    second.wait_for_status(id, "INVOICE_PAID").await?;
    second.wait_for_broadcast(1).await?;
    Ok(())
}

#[tokio::test]
async fn create_rejects_invalid_requests() -> Result<()> {
    let h = Harness::new(test_config())?;
    let preimage = [9u8; 32];

    let too_small = h
        .orchestrator
        .create_swap_in(CreateSwapIn {
            chain: Chain::Bitcoin,
            invoice: invoice(&preimage, 1_000_000),
            refund_public_key: public_key_hex(&secret_key(21)),
        })
        .await;
    assert!(matches!(too_small, Err(SwapError::AmountOutOfRange { .. })));

    let mainnet = h
        .orchestrator
        .create_swap_in(CreateSwapIn {
            chain: Chain::Bitcoin,
            invoice: invoice_for(Currency::Bitcoin, &preimage, 250_000_000),
            refund_public_key: public_key_hex(&secret_key(21)),
        })
        .await;
    assert!(matches!(mainnet, Err(SwapError::InvalidInvoice(_))));

    let bad_key = h
        .orchestrator
        .create_swap_in(CreateSwapIn {
            chain: Chain::Bitcoin,
            invoice: invoice(&preimage, 250_000_000),
            refund_public_key: "02zz".to_string(),
        })
        .await;
    assert!(matches!(bad_key, Err(SwapError::InvalidPublicKey(_))));

    assert!(matches!(
        h.orchestrator.get_swap(Uuid::new_v4()),
        Err(SwapError::NotFound(_))
    ));
    assert!(h.store.all().is_empty());
    Ok(())
}

#[tokio::test]
async fn submit_rejects_transactions_not_spending_the_contract() -> Result<()> {
    let h = Harness::new(test_config())?;
    let preimage = [10u8; 32];
    let created = create(&h, preimage, 100_000).await?;
    let id = created.common.id;

    let (unrelated, _) = pay_to(&regtest_address(&secret_key(33)), 50_000)?;
    assert!(matches!(
        h.orchestrator.submit_signed_tx(id, &unrelated).await,
        Err(SwapError::WrongStatus { .. })
    ));

    let (lock_raw, _) = pay_to(&contract_address(&created)?, 100_000)?;
    h.transaction(&lock_raw, None).await?;
    assert!(matches!(
        h.orchestrator.submit_signed_tx(id, &unrelated).await,
        Err(SwapError::UnrelatedTransaction(_))
    ));
    assert!(h.bitcoin.broadcasts().is_empty());
    Ok(())
}

#[tokio::test]
async fn refund_reported_before_the_timeout_block_is_recorded() -> Result<()> {
    let h = Harness::new(test_config())?;
    let preimage = [11u8; 32];

    let created = create(&h, preimage, 120_000).await?;
    let id = created.common.id;
    let timeout = created.common.timeout_block_height.context("timeout")?;
    let lock_raw = fund_unpayable(&h, &created, 120_000).await?;

    h.block(timeout - 1).await?;
    assert_eq!(h.swap(id)?.status_str(), "CONTRACT_FUNDED");

    // The indexer reports the mined refund before the block that mined it.
    let refund_raw = counterparty_refund(&h, id, &lock_raw, timeout)?;
    h.transaction(&refund_raw, Some(timeout + 1)).await?;
    assert_eq!(h.swap(id)?.status_str(), "CONTRACT_REFUNDED_UNCONFIRMED");

    h.block(timeout + 1).await?;
    h.block(timeout + 5).await?;
    let done = swap_in(h.swap(id)?)?;
    assert_eq!(done.status, SwapInStatus::Done);
    assert_eq!(done.common.outcome, Some(SwapOutcome::Refunded));
    assert_eq!(
        done.common.unlock_tx.map(|t| t.txid),
        Some(tx_event(&refund_raw, None)?.transaction_data.hash)
    );
    Ok(())
}

#[tokio::test]
async fn paid_invoice_is_claimed_after_restart_past_the_timeout() -> Result<()> {
    let first = Harness::new(test_config())?;
    let preimage = [12u8; 32];

    let created = create(&first, preimage, 130_000).await?;
    let id = created.common.id;
    let timeout = created.common.timeout_block_height.context("timeout")?;
    let lock_raw = fund_unpayable(&first, &created, 130_000).await?;
    first.orchestrator.shutdown().await;

    // The node paid the invoice just before the crash.
    let second = Harness::with_store(test_config(), first.store.clone())?;
    second.lightning.record_completed_payment(preimage);
    second.bitcoin.set_height(timeout + 3);
    assert_eq!(second.orchestrator.resume()?, 1);

    second.wait_for_status(id, "INVOICE_PAID").await?;
    let claim = tx_event(&second.wait_for_broadcast(1).await?, None)?;
    assert!(claim.spends(&tx_event(&lock_raw, None)?.transaction_data.hash, 0));
    assert!(claim.pays_to(second.wallet.address()));
    assert_eq!(second.lightning.payment_attempts(), 0);

    let paid = swap_in(second.swap(id)?)?;
    assert_eq!(paid.common.preimage.as_deref(), Some(hex::encode(preimage).as_str()));
    Ok(())
}

#[tokio::test]
async fn expired_funded_swap_without_payment_is_not_claimed() -> Result<()> {
    let h = Harness::new(test_config())?;
    let preimage = [13u8; 32];

    let created = create(&h, preimage, 110_000).await?;
    let id = created.common.id;
    let timeout = created.common.timeout_block_height.context("timeout")?;
    fund_unpayable(&h, &created, 110_000).await?;

    h.block(timeout).await?;
    assert_eq!(h.swap(id)?.status_str(), "CONTRACT_EXPIRED");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.bitcoin.broadcasts().is_empty());
    Ok(())
}

#[tokio::test]
async fn created_swap_in_expires_unfunded() -> Result<()> {
    let h = Harness::new(EngineConfig {
        swap_expiry: Duration::from_millis(100),
        ..test_config()
    })?;
    let preimage = [14u8; 32];

    let id = create(&h, preimage, 100_000).await?.common.id;
    let done = swap_in(h.wait_for_status(id, "DONE").await?)?;
    assert_eq!(done.common.outcome, Some(SwapOutcome::Expired));
    assert!(done.common.lock_tx.is_none());
    assert_eq!(h.lightning.payment_attempts(), 0);

    wait_for("actor to stop", Duration::from_secs(5), || async {
        Ok((h.orchestrator.active_swaps() == 0).then_some(()))
    })
    .await?;
    Ok(())
}
