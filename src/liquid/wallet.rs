use std::path::Path;
use std::str::FromStr as _;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use lwk_common::Signer as _;
use lwk_signer::SwSigner;
use lwk_wollet::blocking::BlockchainBackend as _;
use lwk_wollet::{
    ElectrumClient, ElectrumUrl, ElementsNetwork, Wollet, WolletDescriptor,
    elements::{Address, AssetId, Transaction, Txid},
    full_scan_with_electrum_client,
};

use crate::chain::ChainWallet;

pub struct LiquidWallet {
    signer: SwSigner,
    wollet: Wollet,
    client: ElectrumClient,
}

impl LiquidWallet {
    pub fn new(
        mnemonic: &str,
        slip77_key: &str,
        electrum_url: &str,
        persist_dir: &Path,
        network: ElementsNetwork,
    ) -> Result<Self> {
        let is_mainnet = matches!(network, ElementsNetwork::Liquid);
        let signer = SwSigner::new(mnemonic, is_mainnet).context("create SwSigner")?;
        let xpub = signer.xpub();

        let desc_str = format!("ct(slip77({slip77_key}),elwpkh({xpub}/*))");
        let descriptor: WolletDescriptor = desc_str.parse().context("parse wollet descriptor")?;

        let wollet =
            Wollet::with_fs_persist(network, descriptor, persist_dir).context("create wollet")?;

        let client = electrum_client(electrum_url).context("create electrum client")?;

        let mut wallet = Self {
            signer,
            wollet,
            client,
        };
        wallet.sync().context("initial sync")?;
        Ok(wallet)
    }

    pub fn policy_asset(&self) -> AssetId {
        self.wollet.policy_asset()
    }

    pub fn balance(&self, asset: &AssetId) -> Result<u64> {
        let balances = self.wollet.balance().context("get wollet balance")?;
        Ok(*balances.get(asset).unwrap_or(&0))
    }

    pub fn sync(&mut self) -> Result<()> {
        full_scan_with_electrum_client(&mut self.wollet, &mut self.client)
            .context("sync wollet via electrum")
    }

    /// Fresh receive address of the wallet, in unconfidential form so the
    /// indexer reports it back verbatim.
    pub fn new_address(&self) -> Result<Address> {
        Ok(self
            .wollet
            .address(None)
            .context("get wollet address")?
            .address()
            .to_unconfidential())
    }

    /// Pays `amount_sats` of the policy asset to `address` as an explicit output.
    pub fn send_lbtc(&mut self, address: &Address, amount_sats: u64) -> Result<Txid> {
        self.sync().context("sync wallet before building funding tx")?;

        let policy_asset = self.policy_asset();
        anyhow::ensure!(
            self.balance(&policy_asset)? > amount_sats,
            "insufficient L-BTC balance for {amount_sats} sat"
        );

        let mut pset = self
            .wollet
            .tx_builder()
            .add_explicit_recipient(address, amount_sats, policy_asset)
            .context("add contract output")?
            .finish()
            .context("finalize funding pset")?;

        let sigs = self.signer.sign(&mut pset).context("sign funding pset")?;
        anyhow::ensure!(sigs > 0, "no signatures added for funding");

        let tx: Transaction = self
            .wollet
            .finalize(&mut pset)
            .context("finalize funding tx")?;
        self.client.broadcast(&tx).context("broadcast funding tx")
    }
}

/// Shares one [`LiquidWallet`] between swaps. Electrum calls block, so every
/// operation runs on the blocking pool.
#[derive(Clone)]
pub struct LiquidWalletHandle {
    inner: Arc<Mutex<LiquidWallet>>,
}

impl LiquidWalletHandle {
    pub fn new(wallet: LiquidWallet) -> Self {
        Self {
            inner: Arc::new(Mutex::new(wallet)),
        }
    }
}

#[async_trait::async_trait]
impl ChainWallet for LiquidWalletHandle {
    async fn new_address(&self) -> Result<String> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let wallet = inner.lock().expect("wallet mutex poisoned");
            wallet.new_address().map(|a| a.to_string())
        })
        .await
        .context("join wallet task")?
    }

    async fn send_to_address(&self, address: &str, amount_sat: u64) -> Result<String> {
        let address = Address::from_str(address)
            .with_context(|| format!("parse liquid address {address}"))?;
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut wallet = inner.lock().expect("wallet mutex poisoned");
            wallet
                .send_lbtc(&address, amount_sat)
                .map(|txid| txid.to_string())
        })
        .await
        .context("join wallet task")?
    }
}

fn electrum_client(url: &str) -> Result<ElectrumClient> {
    let endpoint = url.trim_start_matches("tcp://");
    let electrum_url = ElectrumUrl::new(endpoint, false, false)
        .with_context(|| format!("parse electrum url {endpoint}"))?;
    ElectrumClient::new(&electrum_url).context("create electrum client")
}
