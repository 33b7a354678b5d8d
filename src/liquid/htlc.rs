use lwk_wollet::elements::bitcoin::hashes::Hash as _;
use lwk_wollet::elements::bitcoin::secp256k1::Message as BitcoinMessage;
use lwk_wollet::elements::bitcoin::secp256k1::Secp256k1 as BitcoinSecp256k1;
use lwk_wollet::elements::bitcoin::secp256k1::SecretKey as BitcoinSecretKey;
use lwk_wollet::elements::confidential::{Asset, Nonce, Value};
use lwk_wollet::elements::encode;
use lwk_wollet::elements::script::Script;
use lwk_wollet::elements::sighash::SighashCache;
use lwk_wollet::elements::{
    AssetId, EcdsaSighashType, LockTime, OutPoint, Sequence, Transaction, TxIn, TxInWitness,
    TxOut, TxOutWitness,
};

use crate::contract::{PLACEHOLDER_SIGNATURE_LEN, SpendError};

/// A funded Liquid contract output. Only explicit (unblinded) outputs can be spent.
#[derive(Debug, Clone)]
pub struct LiquidContractUtxo {
    pub outpoint: OutPoint,
    pub asset: AssetId,
    pub value: u64,
    pub witness_script: Script,
}

impl LiquidContractUtxo {
    pub fn from_lock_tx(
        lock_tx_hex: &str,
        vout: u32,
        witness_script: Script,
    ) -> Result<Self, SpendError> {
        let tx = decode_tx(lock_tx_hex)?;
        let output = tx
            .output
            .get(vout as usize)
            .ok_or(SpendError::MissingOutput(vout))?;

        let (Asset::Explicit(asset), Value::Explicit(value)) = (output.asset, output.value) else {
            return Err(SpendError::ConfidentialOutput(vout));
        };

        Ok(Self {
            outpoint: OutPoint {
                txid: tx.txid(),
                vout,
            },
            asset,
            value,
            witness_script,
        })
    }
}

pub fn decode_tx(raw_hex: &str) -> Result<Transaction, SpendError> {
    let bytes = hex::decode(raw_hex).map_err(|e| SpendError::MalformedTx(e.to_string()))?;
    encode::deserialize(&bytes).map_err(|e| SpendError::MalformedTx(e.to_string()))
}

pub fn encode_tx(tx: &Transaction) -> String {
    hex::encode(encode::serialize(tx))
}

/// Unsigned spend paying `payout` to `destination` plus an explicit fee output.
pub fn spend_tx(
    utxo: &LiquidContractUtxo,
    destination: Script,
    payout: u64,
    fee_sats: u64,
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

    let inputs = vec![TxIn {
        previous_output: utxo.outpoint,
        is_pegin: false,
        script_sig: Script::new(),
        sequence,
        asset_issuance: Default::default(),
        witness: TxInWitness::default(),
    }];

    let outputs = vec![
        TxOut {
            asset: Asset::Explicit(utxo.asset),
            value: Value::Explicit(payout),
            nonce: Nonce::Null,
            script_pubkey: destination,
            witness: TxOutWitness::default(),
        },
        TxOut::new_fee(fee_sats, utxo.asset),
    ];

    Ok(Transaction {
        version: 2,
        lock_time,
        input: inputs,
        output: outputs,
    })
}

/// Signs input 0 and sets its witness to `[signature, secret, witness_script]`.
pub fn sign_input(
    tx: &mut Transaction,
    utxo: &LiquidContractUtxo,
    secret_key: &BitcoinSecretKey,
    secret: &[u8],
) -> Result<(), SpendError> {
    let secp = BitcoinSecp256k1::signing_only();
    let sighash_type = EcdsaSighashType::All;

    let sighash = SighashCache::new(&*tx).segwitv0_sighash(
        0,
        &utxo.witness_script,
        Value::Explicit(utxo.value),
        sighash_type,
    );
    let msg = BitcoinMessage::from_digest_slice(&sighash.to_byte_array())
        .map_err(|e| SpendError::Signing(e.to_string()))?;
    let sig = secp.sign_ecdsa(&msg, secret_key);

    let mut sig_bytes = sig.serialize_der().to_vec();
    sig_bytes.push(sighash_type.as_u32() as u8);

    tx.input[0].witness.script_witness =
        vec![sig_bytes, secret.to_vec(), utxo.witness_script.to_bytes()];
    Ok(())
}

pub fn placeholder_witness(tx: &mut Transaction, utxo: &LiquidContractUtxo, secret_len: usize) {
    tx.input[0].witness.script_witness = vec![
        vec![0u8; PLACEHOLDER_SIGNATURE_LEN],
        vec![0u8; secret_len],
        utxo.witness_script.to_bytes(),
    ];
}

pub fn witnesses_spending(tx: &Transaction, outpoint: &OutPoint) -> Vec<Vec<Vec<u8>>> {
    tx.input
        .iter()
        .filter(|input| input.previous_output == *outpoint)
        .map(|input| input.witness.script_witness.clone())
        .collect()
}
