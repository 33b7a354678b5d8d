use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode;
use bitcoin::hashes::Hash as _;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

use super::{PLACEHOLDER_SIGNATURE_LEN, SpendError};

/// A funded base-layer contract output.
#[derive(Debug, Clone)]
pub struct ContractUtxo {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub script_pubkey: ScriptBuf,
    pub witness_script: ScriptBuf,
}

impl ContractUtxo {
    pub fn from_lock_tx(
        lock_tx_hex: &str,
        vout: u32,
        witness_script: ScriptBuf,
    ) -> Result<Self, SpendError> {
        let tx = decode_tx(lock_tx_hex)?;
        let output = tx
            .output
            .get(vout as usize)
            .ok_or(SpendError::MissingOutput(vout))?;
        Ok(Self {
            outpoint: OutPoint {
                txid: tx.compute_txid(),
                vout,
            },
            value: output.value,
            script_pubkey: output.script_pubkey.clone(),
            witness_script,
        })
    }
}

pub fn decode_tx(raw_hex: &str) -> Result<Transaction, SpendError> {
    encode::deserialize_hex(raw_hex).map_err(|e| SpendError::MalformedTx(e.to_string()))
}

pub fn encode_tx(tx: &Transaction) -> String {
    encode::serialize_hex(tx)
}

/// Unsigned single-input spend. `refund_timeout` selects the timeout branch.
pub fn spend_tx(
    utxo: &ContractUtxo,
    destination: ScriptBuf,
    payout: Amount,
    refund_timeout: Option<u32>,
) -> Result<Transaction, SpendError> {
    let (lock_time, sequence) = match refund_timeout {
        Some(height) => (
            LockTime::from_height(height)
                .map_err(|e| SpendError::MalformedTx(format!("refund locktime {height}: {e}")))?,
            Sequence::ENABLE_LOCKTIME_NO_RBF,
        ),
        None => (LockTime::ZERO, Sequence::MAX),
    };

    Ok(Transaction {
        version: Version::TWO,
        lock_time,
        input: vec![TxIn {
            previous_output: utxo.outpoint,
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: payout,
            script_pubkey: destination,
        }],
    })
}

/// Signs input 0 and sets its witness to `[signature, secret, witness_script]`.
///
/// `secret` is the preimage on the claim branch and empty on the refund branch.
pub fn sign_input(
    tx: &mut Transaction,
    utxo: &ContractUtxo,
    secret_key: &SecretKey,
    secret: &[u8],
) -> Result<(), SpendError> {
    let secp = Secp256k1::signing_only();
    let sighash_type = EcdsaSighashType::All;

    let sighash = SighashCache::new(&*tx)
        .p2wsh_signature_hash(0, &utxo.witness_script, utxo.value, sighash_type)
        .map_err(|e| SpendError::Signing(e.to_string()))?;
    let msg = Message::from_digest(sighash.to_byte_array());
    let sig = secp.sign_ecdsa(&msg, secret_key);

    let mut sig_bytes = sig.serialize_der().to_vec();
    sig_bytes.push(sighash_type.to_u32() as u8);

    tx.input[0].witness = Witness::from_slice(&[
        sig_bytes.as_slice(),
        secret,
        utxo.witness_script.as_bytes(),
    ]);
    Ok(())
}

/// Fills input 0 with a witness of the same shape as a signed one.
pub fn placeholder_witness(tx: &mut Transaction, utxo: &ContractUtxo, secret_len: usize) {
    let sig = vec![0u8; PLACEHOLDER_SIGNATURE_LEN];
    let secret = vec![0u8; secret_len];
    tx.input[0].witness =
        Witness::from_slice(&[sig.as_slice(), secret.as_slice(), utxo.witness_script.as_bytes()]);
}

/// Wraps an unsigned spend into a PSBT carrying the witness UTXO and script.
pub fn to_psbt(tx: Transaction, utxo: &ContractUtxo) -> Result<Psbt, SpendError> {
    let mut psbt =
        Psbt::from_unsigned_tx(tx).map_err(|e| SpendError::MalformedTx(e.to_string()))?;
    psbt.inputs[0].witness_utxo = Some(TxOut {
        value: utxo.value,
        script_pubkey: utxo.script_pubkey.clone(),
    });
    psbt.inputs[0].witness_script = Some(utxo.witness_script.clone());
    Ok(psbt)
}

/// Witness stacks of the inputs spending `outpoint`.
pub fn witnesses_spending(tx: &Transaction, outpoint: &OutPoint) -> Vec<Vec<Vec<u8>>> {
    tx.input
        .iter()
        .filter(|input| input.previous_output == *outpoint)
        .map(|input| input.witness.iter().map(<[u8]>::to_vec).collect())
        .collect()
}
