use anyhow::{Context as _, Result};
use bitcoin::hashes::{Hash as _, hash160, ripemd160, sha256};
use bitcoin::opcodes::{self, Opcode};
use bitcoin::script::{Builder, Instruction, Script, ScriptBuf};
use bitcoin::secp256k1::PublicKey;
use lwk_wollet::elements;

/// Length of the secret revealed on the success branch.
pub const PREIMAGE_LEN: usize = 32;

/// The two HTLC shapes used to lock swap funds.
///
/// Both redeem through exactly one branch: reveal the secret and sign with the
/// claim key, or wait for `timeout` and sign with the refund key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapScript {
    /// Swap-in. The operator claims with the Lightning preimage, the
    /// counterparty refunds after the timeout.
    Forward {
        payment_hash160: [u8; 20],
        claim_pubkey: PublicKey,
        refund_pubkey: PublicKey,
        timeout: u32,
    },
    /// Swap-out. The counterparty claims once it knows the secret, the
    /// operator refunds after the timeout.
    Reverse {
        preimage_hash: [u8; 32],
        claim_pubkey: PublicKey,
        refund_pubkey: PublicKey,
        timeout: u32,
    },
}

impl SwapScript {
    pub fn forward(
        payment_hash: &[u8; 32],
        claim_pubkey: PublicKey,
        refund_pubkey: PublicKey,
        timeout: u32,
    ) -> Self {
        SwapScript::Forward {
            payment_hash160: ripemd160::Hash::hash(payment_hash).to_byte_array(),
            claim_pubkey,
            refund_pubkey,
            timeout,
        }
    }

    pub fn reverse(
        preimage_hash: [u8; 32],
        claim_pubkey: PublicKey,
        refund_pubkey: PublicKey,
        timeout: u32,
    ) -> Self {
        SwapScript::Reverse {
            preimage_hash,
            claim_pubkey,
            refund_pubkey,
            timeout,
        }
    }

    pub fn timeout(&self) -> u32 {
        match self {
            SwapScript::Forward { timeout, .. } | SwapScript::Reverse { timeout, .. } => *timeout,
        }
    }

    pub fn claim_pubkey(&self) -> PublicKey {
        match self {
            SwapScript::Forward { claim_pubkey, .. } | SwapScript::Reverse { claim_pubkey, .. } => {
                *claim_pubkey
            }
        }
    }

    pub fn refund_pubkey(&self) -> PublicKey {
        match self {
            SwapScript::Forward { refund_pubkey, .. }
            | SwapScript::Reverse { refund_pubkey, .. } => *refund_pubkey,
        }
    }

    /// Whether `preimage` unlocks the success branch.
    pub fn accepts_preimage(&self, preimage: &[u8]) -> bool {
        match self {
            SwapScript::Forward {
                payment_hash160, ..
            } => hash160::Hash::hash(preimage).to_byte_array() == *payment_hash160,
            SwapScript::Reverse { preimage_hash, .. } => {
                preimage.len() == PREIMAGE_LEN
                    && sha256::Hash::hash(preimage).to_byte_array() == *preimage_hash
            }
        }
    }

    pub fn witness_script(&self) -> ScriptBuf {
        match self {
            SwapScript::Forward {
                payment_hash160,
                claim_pubkey,
                refund_pubkey,
                timeout,
            } => Builder::new()
                .push_opcode(opcodes::all::OP_HASH160)
                .push_slice(payment_hash160)
                .push_opcode(opcodes::all::OP_EQUAL)
                .push_opcode(opcodes::all::OP_IF)
                .push_slice(claim_pubkey.serialize())
                .push_opcode(opcodes::all::OP_ELSE)
                .push_int(i64::from(*timeout))
                .push_opcode(opcodes::all::OP_CLTV)
                .push_opcode(opcodes::all::OP_DROP)
                .push_slice(refund_pubkey.serialize())
                .push_opcode(opcodes::all::OP_ENDIF)
                .push_opcode(opcodes::all::OP_CHECKSIG)
                .into_script(),
            SwapScript::Reverse {
                preimage_hash,
                claim_pubkey,
                refund_pubkey,
                timeout,
            } => Builder::new()
                .push_opcode(opcodes::all::OP_SIZE)
                .push_int(PREIMAGE_LEN as i64)
                .push_opcode(opcodes::all::OP_EQUAL)
                .push_opcode(opcodes::all::OP_IF)
                .push_opcode(opcodes::all::OP_SHA256)
                .push_slice(preimage_hash)
                .push_opcode(opcodes::all::OP_EQUALVERIFY)
                .push_slice(claim_pubkey.serialize())
                .push_opcode(opcodes::all::OP_ELSE)
                .push_opcode(opcodes::all::OP_DROP)
                .push_int(i64::from(*timeout))
                .push_opcode(opcodes::all::OP_CLTV)
                .push_opcode(opcodes::all::OP_DROP)
                .push_slice(refund_pubkey.serialize())
                .push_opcode(opcodes::all::OP_ENDIF)
                .push_opcode(opcodes::all::OP_CHECKSIG)
                .into_script(),
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.witness_script().as_bytes())
    }

    pub fn bitcoin_address(&self, network: bitcoin::Network) -> bitcoin::Address {
        bitcoin::Address::p2wsh(&self.witness_script(), network)
    }

    /// Unconfidential P2WSH address, so funding outputs stay explicit and spendable
    /// without a blinding key.
    pub fn liquid_address(&self, params: &'static elements::AddressParams) -> elements::Address {
        let script = elements::Script::from(self.witness_script().into_bytes());
        elements::Address::p2wsh(&script, None, params)
    }

    pub fn from_hex(script_hex: &str) -> Result<Self> {
        let bytes = hex::decode(script_hex).context("decode witness script hex")?;
        Self::parse(Script::from_bytes(&bytes))
    }

    /// Decodes a script built by [`SwapScript::witness_script`].
    pub fn parse(witness_script: &Script) -> Result<Self> {
        let mut iter = witness_script.instructions_minimal();

        let first = next_instruction(&mut iter)?;
        let script = match first {
            Instruction::Op(op) if op == opcodes::all::OP_HASH160 => {
                let payment_hash160 = expect_push::<20>(next_instruction(&mut iter)?)?;
                expect_op(next_instruction(&mut iter)?, opcodes::all::OP_EQUAL)?;
                expect_op(next_instruction(&mut iter)?, opcodes::all::OP_IF)?;
                let claim_pubkey = expect_pubkey(next_instruction(&mut iter)?)?;
                expect_op(next_instruction(&mut iter)?, opcodes::all::OP_ELSE)?;
                let timeout = parse_timeout(next_instruction(&mut iter)?)?;
                expect_op(next_instruction(&mut iter)?, opcodes::all::OP_CLTV)?;
                expect_op(next_instruction(&mut iter)?, opcodes::all::OP_DROP)?;
                let refund_pubkey = expect_pubkey(next_instruction(&mut iter)?)?;
                SwapScript::Forward {
                    payment_hash160,
                    claim_pubkey,
                    refund_pubkey,
                    timeout,
                }
            }
            Instruction::Op(op) if op == opcodes::all::OP_SIZE => {
                let size = parse_script_num(next_instruction(&mut iter)?)?;
                anyhow::ensure!(
                    size == PREIMAGE_LEN as i64,
                    "unexpected preimage size check: {size}"
                );
                expect_op(next_instruction(&mut iter)?, opcodes::all::OP_EQUAL)?;
                expect_op(next_instruction(&mut iter)?, opcodes::all::OP_IF)?;
                expect_op(next_instruction(&mut iter)?, opcodes::all::OP_SHA256)?;
                let preimage_hash = expect_push::<32>(next_instruction(&mut iter)?)?;
                expect_op(next_instruction(&mut iter)?, opcodes::all::OP_EQUALVERIFY)?;
                let claim_pubkey = expect_pubkey(next_instruction(&mut iter)?)?;
                expect_op(next_instruction(&mut iter)?, opcodes::all::OP_ELSE)?;
                expect_op(next_instruction(&mut iter)?, opcodes::all::OP_DROP)?;
                let timeout = parse_timeout(next_instruction(&mut iter)?)?;
                expect_op(next_instruction(&mut iter)?, opcodes::all::OP_CLTV)?;
                expect_op(next_instruction(&mut iter)?, opcodes::all::OP_DROP)?;
                let refund_pubkey = expect_pubkey(next_instruction(&mut iter)?)?;
                SwapScript::Reverse {
                    preimage_hash,
                    claim_pubkey,
                    refund_pubkey,
                    timeout,
                }
            }
            other => anyhow::bail!("unrecognized swap script start: {other:?}"),
        };

        expect_op(next_instruction(&mut iter)?, opcodes::all::OP_ENDIF)?;
        expect_op(next_instruction(&mut iter)?, opcodes::all::OP_CHECKSIG)?;
        anyhow::ensure!(
            iter.next().is_none(),
            "unexpected trailing instructions in witness script"
        );

        Ok(script)
    }
}

fn next_instruction<'a>(
    iter: &mut impl Iterator<Item = std::result::Result<Instruction<'a>, bitcoin::script::Error>>,
) -> Result<Instruction<'a>> {
    iter.next()
        .transpose()
        .map_err(|e| anyhow::anyhow!("decode witness script instruction: {e:?}"))?
        .context("unexpected end of witness script")
}

fn expect_op(actual: Instruction<'_>, expected: Opcode) -> Result<()> {
    match actual {
        Instruction::Op(op) if op == expected => Ok(()),
        other => anyhow::bail!("unexpected instruction: expected {expected:?}, got {other:?}"),
    }
}

fn expect_push<const N: usize>(actual: Instruction<'_>) -> Result<[u8; N]> {
    match actual {
        Instruction::PushBytes(bytes) if bytes.len() == N => {
            let mut out = [0u8; N];
            out.copy_from_slice(bytes.as_bytes());
            Ok(out)
        }
        other => anyhow::bail!("unexpected instruction: expected push {N} bytes, got {other:?}"),
    }
}

fn expect_pubkey(actual: Instruction<'_>) -> Result<PublicKey> {
    let bytes = expect_push::<33>(actual)?;
    PublicKey::from_slice(&bytes).context("invalid public key in witness script")
}

fn parse_timeout(actual: Instruction<'_>) -> Result<u32> {
    let timeout = parse_script_num(actual)?;
    u32::try_from(timeout).with_context(|| format!("timeout out of range: {timeout}"))
}

fn parse_script_num(actual: Instruction<'_>) -> Result<i64> {
    match actual {
        Instruction::PushBytes(bytes) => decode_script_num(bytes.as_bytes()),
        Instruction::Op(op) => {
            let code = op.to_u8();
            if code == opcodes::all::OP_PUSHNUM_NEG1.to_u8() {
                return Ok(-1);
            }

            let one = opcodes::all::OP_PUSHNUM_1.to_u8();
            let sixteen = opcodes::all::OP_PUSHNUM_16.to_u8();
            if (one..=sixteen).contains(&code) {
                return Ok(i64::from(code - one + 1));
            }

            anyhow::bail!("unexpected opcode where script number expected: {op:?}");
        }
    }
}

fn decode_script_num(bytes: &[u8]) -> Result<i64> {
    if bytes.is_empty() {
        return Ok(0);
    }
    if bytes.len() > 8 {
        anyhow::bail!("script number too large: {} bytes", bytes.len());
    }

    let mut magnitude = bytes.to_vec();
    let negative = magnitude.last().is_some_and(|b| (b & 0x80) != 0);
    if let Some(last) = magnitude.last_mut() {
        *last &= 0x7f;
    }

    let mut value: i64 = 0;
    for (i, b) in magnitude.iter().enumerate() {
        value |= i64::from(*b) << (8 * i);
    }

    Ok(if negative { -value } else { value })
}
