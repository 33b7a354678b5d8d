use std::path::PathBuf;
use std::str::FromStr as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser as _;
use ln_chain_swap::chain::{Chain, IndexerClient};
use ln_chain_swap::chain::indexer::HttpIndexerClient;
use ln_chain_swap::config::EngineConfig;
use ln_chain_swap::events::EventConsumer;
use ln_chain_swap::keys::KeyDeriver;
use ln_chain_swap::lightning::lnd::LndRestClient;
use ln_chain_swap::liquid::wallet::{LiquidWallet, LiquidWalletHandle};
use ln_chain_swap::swap::machine::{ChainBackend, EngineContext};
use ln_chain_swap::swap::{Orchestrator, SqliteStore};
use lwk_wollet::ElementsNetwork;
use lwk_wollet::elements::AssetId;
use rust_decimal::Decimal;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum LiquidNetwork {
    Liquid,
    Testnet,
    Regtest,
}

#[derive(Debug, clap::Parser)]
#[command(about = "Atomic swaps between Lightning and Bitcoin or Liquid on-chain funds")]
struct Args {
    #[arg(long, env = "SWAPD_STORE_PATH", default_value = "swapd.sqlite3")]
    store_path: PathBuf,

    /// BIP39 mnemonic the contract keys derive from.
    #[arg(long, env = "SWAPD_MNEMONIC", hide_env_values = true)]
    mnemonic: String,

    #[arg(long, env = "SWAPD_BITCOIN_NETWORK", default_value = "regtest")]
    bitcoin_network: bitcoin::Network,

    #[arg(long, env = "SWAPD_LIQUID_NETWORK", value_enum, default_value = "regtest")]
    liquid_network: LiquidNetwork,

    /// Policy asset of an Elements regtest chain. Defaults to the LWK regtest asset.
    #[arg(long, env = "SWAPD_LIQUID_POLICY_ASSET")]
    liquid_policy_asset: Option<String>,

    #[arg(long, env = "SWAPD_LND_REST_URL")]
    lnd_rest_url: String,

    #[arg(long, env = "SWAPD_LND_MACAROON_HEX", hide_env_values = true)]
    lnd_macaroon_hex: String,

    #[arg(long, env = "SWAPD_LND_TLS_CERT")]
    lnd_tls_cert: Option<PathBuf>,

    #[arg(long, env = "SWAPD_BITCOIN_INDEXER_URL")]
    bitcoin_indexer_url: String,

    #[arg(long, env = "SWAPD_LIQUID_INDEXER_URL")]
    liquid_indexer_url: String,

    #[arg(long, env = "SWAPD_LIQUID_ELECTRUM_URL")]
    liquid_electrum_url: String,

    #[arg(long, env = "SWAPD_LIQUID_SLIP77", hide_env_values = true)]
    liquid_slip77: String,

    #[arg(long, env = "SWAPD_LIQUID_WALLET_DIR", default_value = "swapd-liquid-wallet")]
    liquid_wallet_dir: PathBuf,

    /// Operator fee in percent of the swapped amount.
    #[arg(long, env = "SWAPD_FEE_PERCENT", default_value = "0.5")]
    fee_percent: Decimal,

    #[arg(long, env = "SWAPD_EVENT_POLL_TIMEOUT_SECS", default_value_t = 30)]
    event_poll_timeout_secs: u64,
}

impl Args {
    fn elements_network(&self) -> Result<ElementsNetwork> {
        Ok(match self.liquid_network {
            LiquidNetwork::Liquid => ElementsNetwork::Liquid,
            LiquidNetwork::Testnet => ElementsNetwork::LiquidTestnet,
            LiquidNetwork::Regtest => match &self.liquid_policy_asset {
                Some(asset) => ElementsNetwork::ElementsRegtest {
                    policy_asset: AssetId::from_str(asset).context("parse liquid_policy_asset")?,
                },
                None => ElementsNetwork::default_regtest(),
            },
        })
    }

    fn engine_config(&self) -> Result<EngineConfig> {
        Ok(EngineConfig {
            bitcoin_network: self.bitcoin_network,
            liquid_network: self.elements_network()?,
            fee_percent: self.fee_percent,
            ..EngineConfig::default()
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    ln_chain_swap::logging::init().ok();

    let args = Args::parse();
    let config = args.engine_config()?;

    std::fs::create_dir_all(&args.liquid_wallet_dir).context("create liquid_wallet_dir")?;
    if let Some(parent) = args.store_path.parent() {
        std::fs::create_dir_all(parent).context("create store parent dir")?;
    }

    let store = Arc::new(SqliteStore::open(args.store_path.clone()).context("open sqlite store")?);
    let keys = KeyDeriver::from_mnemonic(
        &args.mnemonic,
        args.bitcoin_network == bitcoin::Network::Bitcoin,
    )
    .context("create key deriver")?;

    let lnd = Arc::new(
        LndRestClient::new(
            &args.lnd_rest_url,
            &args.lnd_macaroon_hex,
            args.lnd_tls_cert.as_deref(),
        )
        .context("create lnd client")?,
    );

    let liquid_network = config.liquid_network.clone();
    let liquid_wallet = {
        let mnemonic = args.mnemonic.clone();
        let slip77 = args.liquid_slip77.clone();
        let electrum_url = args.liquid_electrum_url.clone();
        let dir = args.liquid_wallet_dir.clone();
        tokio::task::spawn_blocking(move || {
            LiquidWallet::new(&mnemonic, &slip77, &electrum_url, &dir, liquid_network)
        })
        .await
        .context("join liquid wallet init")?
        .context("create liquid wallet")?
    };
    tracing::info!(
        policy_asset = %liquid_wallet.policy_asset(),
        "liquid wallet ready"
    );

    let bitcoin_indexer = Arc::new(
        HttpIndexerClient::new(Chain::Bitcoin, &args.bitcoin_indexer_url)
            .context("create bitcoin indexer client")?,
    );
    let liquid_indexer = Arc::new(
        HttpIndexerClient::new(Chain::Liquid, &args.liquid_indexer_url)
            .context("create liquid indexer client")?,
    );

    let ctx = EngineContext::new(
        config,
        store.clone(),
        lnd.clone(),
        ChainBackend {
            indexer: bitcoin_indexer.clone(),
            wallet: lnd,
        },
        ChainBackend {
            indexer: liquid_indexer.clone(),
            wallet: Arc::new(LiquidWalletHandle::new(liquid_wallet)),
        },
    );
    let orchestrator = Arc::new(Orchestrator::new(ctx, keys, store.clone()));
    orchestrator.resume().context("resume swaps")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poll_timeout = Duration::from_secs(args.event_poll_timeout_secs);
    let mut consumers = Vec::new();
    let indexers: [(Chain, Arc<dyn IndexerClient>); 2] = [
        (Chain::Bitcoin, bitcoin_indexer),
        (Chain::Liquid, liquid_indexer),
    ];
    for (chain, indexer) in indexers {
        let mut consumer =
            EventConsumer::new(chain, indexer, store.clone()).with_poll_timeout(poll_timeout);
        consumer.subscribe(orchestrator.clone());
        consumers.push(tokio::spawn(consumer.run(shutdown_rx.clone())));
    }

    tracing::info!(store = %args.store_path.display(), "swapd running");
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("shutting down");

    let _ = shutdown_tx.send(true);
    for consumer in consumers {
        match consumer.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(error = %err, "event consumer failed"),
            Err(err) => tracing::warn!(error = %err, "event consumer join error"),
        }
    }
    orchestrator.shutdown().await;
    Ok(())
}
