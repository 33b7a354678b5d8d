//! Chain-dispatching spend construction on top of the two-pass fee builder.

use std::str::FromStr as _;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bitcoin::Amount;
use bitcoin::secp256k1::SecretKey;
use lwk_wollet::elements;

use super::btc::{self, ContractUtxo};
use super::fee::{FeeQuote, build_with_fee};
use super::script::{PREIMAGE_LEN, SwapScript};
use super::SpendError;
use crate::chain::Chain;
use crate::liquid::htlc::{self as liquid_htlc, LiquidContractUtxo};

/// Address parameters of both on-chain layers.
#[derive(Debug, Clone, Copy)]
pub struct Networks {
    pub bitcoin: bitcoin::Network,
    pub liquid: &'static elements::AddressParams,
}

/// Which branch of the contract a spend takes.
#[derive(Debug, Clone, Copy)]
pub enum SpendBranch {
    Claim { preimage: [u8; 32] },
    Refund { timeout: u32 },
}

impl SpendBranch {
    fn refund_timeout(&self) -> Option<u32> {
        match self {
            SpendBranch::Claim { .. } => None,
            SpendBranch::Refund { timeout } => Some(*timeout),
        }
    }

    /// Witness secret for the given pass. The fee pass uses a zero preimage of the real length.
    fn secret(&self, is_fee_pass: bool) -> Vec<u8> {
        match self {
            SpendBranch::Claim { .. } if is_fee_pass => vec![0u8; PREIMAGE_LEN],
            SpendBranch::Claim { preimage } => preimage.to_vec(),
            SpendBranch::Refund { .. } => Vec::new(),
        }
    }

    fn secret_len(&self) -> usize {
        match self {
            SpendBranch::Claim { .. } => PREIMAGE_LEN,
            SpendBranch::Refund { .. } => 0,
        }
    }
}

/// One contract output to be swept to one destination.
#[derive(Debug, Clone)]
pub struct ContractSpend<'a> {
    pub chain: Chain,
    pub script: &'a SwapScript,
    pub lock_tx_hex: &'a str,
    pub lock_vout: u32,
    pub destination: &'a str,
    pub fee_rate: f64,
}

#[derive(Debug, Clone)]
pub struct BuiltSpend {
    pub txid: String,
    pub raw_hex: String,
    pub quote: FeeQuote,
}

#[derive(Debug, Clone)]
pub struct UnsignedSpend {
    /// Base64 PSBT on Bitcoin, unsigned transaction hex on Liquid.
    pub encoded: String,
    pub quote: FeeQuote,
}

fn invalid_address(address: &str, reason: impl ToString) -> SpendError {
    SpendError::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    }
}

fn bitcoin_destination(address: &str, network: bitcoin::Network) -> Result<bitcoin::ScriptBuf, SpendError> {
    let unchecked = bitcoin::Address::from_str(address).map_err(|e| invalid_address(address, e))?;
    let checked = unchecked
        .require_network(network)
        .map_err(|e| invalid_address(address, e))?;
    Ok(checked.script_pubkey())
}

fn liquid_destination(
    address: &str,
    params: &'static elements::AddressParams,
) -> Result<elements::Script, SpendError> {
    let parsed = elements::Address::from_str(address).map_err(|e| invalid_address(address, e))?;
    if parsed.params != params {
        return Err(invalid_address(address, "network mismatch"));
    }
    Ok(parsed.script_pubkey())
}

fn liquid_key(secret_key: &SecretKey) -> Result<elements::bitcoin::secp256k1::SecretKey, SpendError> {
    elements::bitcoin::secp256k1::SecretKey::from_slice(&secret_key.secret_bytes())
        .map_err(|e| SpendError::Signing(e.to_string()))
}

/// Builds and signs a spend of the contract output with the operator's key.
pub fn sign_spend(
    spend: &ContractSpend<'_>,
    networks: &Networks,
    secret_key: &SecretKey,
    branch: SpendBranch,
) -> Result<BuiltSpend, SpendError> {
    let witness_script = spend.script.witness_script();
    match spend.chain {
        Chain::Bitcoin => {
            let utxo = ContractUtxo::from_lock_tx(spend.lock_tx_hex, spend.lock_vout, witness_script)?;
            let destination = bitcoin_destination(spend.destination, networks.bitcoin)?;
            let value = utxo.value.to_sat();

            let (tx, quote) = build_with_fee(value, 1, spend.fee_rate, |fee, is_fee_pass| {
                let payout = Amount::from_sat(value - fee);
                let mut tx =
                    btc::spend_tx(&utxo, destination.clone(), payout, branch.refund_timeout())?;
                btc::sign_input(&mut tx, &utxo, secret_key, &branch.secret(is_fee_pass))?;
                Ok(tx)
            })?;

            Ok(BuiltSpend {
                txid: tx.compute_txid().to_string(),
                raw_hex: btc::encode_tx(&tx),
                quote,
            })
        }
        Chain::Liquid => {
            let script = elements::Script::from(witness_script.into_bytes());
            let utxo = LiquidContractUtxo::from_lock_tx(spend.lock_tx_hex, spend.lock_vout, script)?;
            let destination = liquid_destination(spend.destination, networks.liquid)?;
            let key = liquid_key(secret_key)?;
            let value = utxo.value;

            let (tx, quote) = build_with_fee(value, 1, spend.fee_rate, |fee, is_fee_pass| {
                let mut tx = liquid_htlc::spend_tx(
                    &utxo,
                    destination.clone(),
                    value - fee,
                    fee,
                    branch.refund_timeout(),
                )?;
                liquid_htlc::sign_input(&mut tx, &utxo, &key, &branch.secret(is_fee_pass))?;
                Ok(tx)
            })?;

            Ok(BuiltSpend {
                txid: tx.txid().to_string(),
                raw_hex: liquid_htlc::encode_tx(&tx),
                quote,
            })
        }
    }
}

/// Builds an unsigned, fee-sized spend for the counterparty to sign.
pub fn unsigned_spend(
    spend: &ContractSpend<'_>,
    networks: &Networks,
    branch: SpendBranch,
) -> Result<UnsignedSpend, SpendError> {
    let witness_script = spend.script.witness_script();
    let secret_len = branch.secret_len();
    match spend.chain {
        Chain::Bitcoin => {
            let utxo = ContractUtxo::from_lock_tx(spend.lock_tx_hex, spend.lock_vout, witness_script)?;
            let destination = bitcoin_destination(spend.destination, networks.bitcoin)?;
            let value = utxo.value.to_sat();

            let (tx, quote) = build_with_fee(value, 1, spend.fee_rate, |fee, is_fee_pass| {
                let payout = Amount::from_sat(value - fee);
                let mut tx =
                    btc::spend_tx(&utxo, destination.clone(), payout, branch.refund_timeout())?;
                if is_fee_pass {
                    btc::placeholder_witness(&mut tx, &utxo, secret_len);
                }
                Ok(tx)
            })?;

            let psbt = btc::to_psbt(tx, &utxo)?;
            Ok(UnsignedSpend {
                encoded: BASE64.encode(psbt.serialize()),
                quote,
            })
        }
        Chain::Liquid => {
            let script = elements::Script::from(witness_script.into_bytes());
            let utxo = LiquidContractUtxo::from_lock_tx(spend.lock_tx_hex, spend.lock_vout, script)?;
            let destination = liquid_destination(spend.destination, networks.liquid)?;
            let value = utxo.value;

            let (tx, quote) = build_with_fee(value, 1, spend.fee_rate, |fee, is_fee_pass| {
                let mut tx = liquid_htlc::spend_tx(
                    &utxo,
                    destination.clone(),
                    value - fee,
                    fee,
                    branch.refund_timeout(),
                )?;
                if is_fee_pass {
                    liquid_htlc::placeholder_witness(&mut tx, &utxo, secret_len);
                }
                Ok(tx)
            })?;

            Ok(UnsignedSpend {
                encoded: liquid_htlc::encode_tx(&tx),
                quote,
            })
        }
    }
}

/// Txid of a raw transaction on `chain`.
pub fn txid_of(chain: Chain, raw_hex: &str) -> Result<String, SpendError> {
    Ok(match chain {
        Chain::Bitcoin => btc::decode_tx(raw_hex)?.compute_txid().to_string(),
        Chain::Liquid => liquid_htlc::decode_tx(raw_hex)?.txid().to_string(),
    })
}

/// Witness stacks of every input of `raw_hex` spending `lock_txid:lock_vout`.
pub fn witnesses_spending(
    chain: Chain,
    raw_hex: &str,
    lock_txid: &str,
    lock_vout: u32,
) -> Result<Vec<Vec<Vec<u8>>>, SpendError> {
    match chain {
        Chain::Bitcoin => {
            let tx = btc::decode_tx(raw_hex)?;
            let txid = bitcoin::Txid::from_str(lock_txid)
                .map_err(|e| SpendError::MalformedTx(e.to_string()))?;
            Ok(btc::witnesses_spending(
                &tx,
                &bitcoin::OutPoint {
                    txid,
                    vout: lock_vout,
                },
            ))
        }
        Chain::Liquid => {
            let tx = liquid_htlc::decode_tx(raw_hex)?;
            let txid = elements::Txid::from_str(lock_txid)
                .map_err(|e| SpendError::MalformedTx(e.to_string()))?;
            Ok(liquid_htlc::witnesses_spending(
                &tx,
                &elements::OutPoint {
                    txid,
                    vout: lock_vout,
                },
            ))
        }
    }
}

/// Finds the secret revealed by a claim of the contract output, if `raw_hex` is one.
pub fn extract_preimage(
    chain: Chain,
    raw_hex: &str,
    lock_txid: &str,
    lock_vout: u32,
    script: &SwapScript,
) -> Result<Option<[u8; 32]>, SpendError> {
    let witnesses = witnesses_spending(chain, raw_hex, lock_txid, lock_vout)?;
    let found = witnesses
        .into_iter()
        .flatten()
        .filter(|item| item.len() == PREIMAGE_LEN)
        .find(|item| script.accepts_preimage(item));

    Ok(found.map(|item| {
        let mut out = [0u8; 32];
        out.copy_from_slice(&item);
        out
    }))
}
