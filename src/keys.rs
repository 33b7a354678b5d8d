use anyhow::{Context as _, Result};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use lwk_signer::SwSigner;
use lwk_wollet::elements::bitcoin::bip32::{ChildNumber, DerivationPath};

/// Derives per-swap operator keys from the operator mnemonic.
pub struct KeyDeriver {
    signer: SwSigner,
}

impl KeyDeriver {
    pub fn from_mnemonic(mnemonic: &str, is_mainnet: bool) -> Result<Self> {
        let signer = SwSigner::new(mnemonic, is_mainnet).context("create SwSigner")?;
        Ok(Self { signer })
    }

    pub fn derive_secret_key(&self, index: u32) -> Result<SecretKey> {
        let child = ChildNumber::from_normal_idx(index).context("invalid derivation index")?;
        let path = DerivationPath::from(vec![child]);
        let xprv = self.signer.derive_xprv(&path).context("derive xprv")?;
        SecretKey::from_slice(&xprv.private_key.secret_bytes()).context("convert derived key")
    }
}

pub fn public_key(secret_key: &SecretKey) -> PublicKey {
    secret_key.public_key(&Secp256k1::signing_only())
}

pub fn parse_public_key(hex_str: &str) -> Result<PublicKey> {
    let bytes = hex::decode(hex_str).context("decode public key hex")?;
    PublicKey::from_slice(&bytes).context("parse public key")
}

pub fn parse_secret_key(hex_str: &str) -> Result<SecretKey> {
    let bytes = hex::decode(hex_str).context("decode secret key hex")?;
    SecretKey::from_slice(&bytes).context("parse secret key")
}
