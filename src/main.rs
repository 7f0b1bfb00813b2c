use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use fundme::{
    chain::{Chain, Receipt},
    config::{FeedSelection, NetworkConfig, DEV_CHAIN_ID},
    deploy,
    oracle::{MockV3Aggregator, PriceFeed},
    tx::{Call, TxBuilder},
    units::{format_ether, parse_ether},
    Address, Wallet,
};

//==================== CLI ====================//

#[derive(Parser)]
#[command(name = "fundme", version, about = "Local devnet for the FundMe ledger")]
struct Cli {
    /// Devnet state file
    #[arg(long, global = true, default_value = "devnet.json")]
    state: PathBuf,

    /// Network table (JSON); built-in goerli/polygon/hardhat table otherwise
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate an ed25519 keypair (sk.hex / pk.hex)
    Keygen {
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Create an empty devnet for a network
    Init {
        #[arg(long, default_value = "hardhat")]
        network: String,
    },
    /// Mint native value into an account
    Faucet {
        #[arg(long)]
        to: Address,
        #[arg(long, default_value = "100")]
        eth: String,
    },
    /// Deploy mocks (development networks) and the ledger
    Deploy {
        #[arg(long)]
        sk_hex: String,
        #[arg(long, default_value = "hardhat")]
        network: String,
        /// On public networks, simulate the live feed with this answer
        #[arg(long)]
        fork_answer: Option<i128>,
    },
    /// Contribute to the ledger
    Fund {
        #[arg(long)]
        sk_hex: String,
        #[arg(long, default_value = "0.1")]
        eth: String,
        #[arg(long)]
        contract: Option<Address>,
    },
    /// Withdraw everything to the owner
    Withdraw {
        #[arg(long)]
        sk_hex: String,
        /// Use the storage-optimized path
        #[arg(long)]
        optimized: bool,
        #[arg(long)]
        contract: Option<Address>,
    },
    /// Push a new answer to the ledger's mock feed
    SetPrice {
        #[arg(long)]
        sk_hex: String,
        #[arg(long)]
        answer: i128,
        #[arg(long)]
        contract: Option<Address>,
    },
    /// Print ledger state
    Show {
        #[arg(long)]
        contract: Option<Address>,
    },
    /// Funder at a registry position
    Funder {
        #[arg(long)]
        index: usize,
        #[arg(long)]
        contract: Option<Address>,
    },
    /// Cumulative amount funded by an address
    AmountFunded {
        #[arg(long)]
        address: Address,
        #[arg(long)]
        contract: Option<Address>,
    },
    /// Native balance of an address
    Balance {
        #[arg(long)]
        address: Address,
    },
}

//==================== Helpers ====================//

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn load_config(path: Option<&Path>) -> Result<NetworkConfig> {
    match path {
        Some(p) => NetworkConfig::load(p).with_context(|| format!("load config {}", p.display())),
        None => Ok(NetworkConfig::default()),
    }
}

fn load_chain(path: &Path) -> Result<Chain> {
    Chain::load(path).with_context(|| {
        format!(
            "load devnet state {} (run `fundme init` first)",
            path.display()
        )
    })
}

fn save_chain(chain: &Chain, path: &Path) -> Result<()> {
    chain
        .save(path)
        .with_context(|| format!("save devnet state {}", path.display()))
}

fn wallet(sk_hex: &str) -> Result<Wallet> {
    Wallet::from_secret_hex(sk_hex).context("invalid --sk-hex")
}

fn resolve_contract(chain: &Chain, contract: Option<Address>) -> Result<Address> {
    match contract {
        Some(address) => Ok(address),
        None => chain
            .latest_ledger()
            .ok_or_else(|| anyhow!("no ledger deployed; run `fundme deploy`")),
    }
}

fn print_receipt(receipt: &Receipt) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(receipt)?);
    match receipt.error() {
        Some(err) => bail!("transaction reverted: {err}"),
        None => Ok(()),
    }
}

fn send(
    chain: &mut Chain,
    state: &Path,
    signer: &Wallet,
    to: Address,
    value: u128,
    call: Call,
) -> Result<()> {
    let nonce = chain.nonce(&signer.address());
    let signed = TxBuilder::new(signer, chain.chain_id()).call(nonce, Some(to), value, call);
    let from = signed.sender().context("sender key")?;
    tracing::info!(%from, %to, nonce, call = ?signed.tx.call, "sending");
    let receipt = chain.execute(&signed, now())?;
    // a reverted call still consumed the nonce
    save_chain(chain, state)?;
    print_receipt(&receipt)
}

//==================== Commands ====================//

fn keygen_cmd(out_dir: &Path) -> Result<()> {
    fs::create_dir_all(out_dir).with_context(|| format!("mkdir {}", out_dir.display()))?;
    let wallet = Wallet::generate();
    fs::write(out_dir.join("sk.hex"), wallet.secret_hex())?;
    fs::write(out_dir.join("pk.hex"), wallet.public_hex())?;
    println!("address {}", wallet.address());
    println!("keypair written → {}", out_dir.display());
    Ok(())
}

fn init_cmd(state: &Path, config: &NetworkConfig, network: &str) -> Result<()> {
    let chain_id = config
        .chain_id(network)
        .ok_or_else(|| anyhow!("unknown network {network:?}"))?;
    let chain = Chain::new(chain_id);
    save_chain(&chain, state)?;
    println!("devnet for {network} (chain {chain_id}) → {}", state.display());
    Ok(())
}

fn deploy_cmd(
    state: &Path,
    config: &NetworkConfig,
    sk_hex: &str,
    network: &str,
    fork_answer: Option<i128>,
) -> Result<()> {
    let mut chain = load_chain(state)?;
    let deployer = wallet(sk_hex)?;
    if let (Some(answer), Ok(FeedSelection::Live(address))) =
        (fork_answer, config.resolve_feed(network, chain.chain_id()))
    {
        chain.install_feed(address, MockV3Aggregator::new(config.mock.decimals, answer, now()));
    }
    let deployment = deploy::deploy_all(&mut chain, &deployer, network, config, now())?;
    save_chain(&chain, state)?;
    if !deployment.mock && chain.feed(&deployment.price_feed).is_none() {
        tracing::warn!(
            feed = %deployment.price_feed,
            "live feed is not reachable on the devnet; pass --fork-answer to simulate it"
        );
    }
    println!("price feed {}", deployment.price_feed);
    println!("fund_me    {}", deployment.fund_me);
    Ok(())
}

fn show_cmd(chain: &Chain, contract: Address) -> Result<()> {
    let ledger = chain
        .ledger(&contract)
        .ok_or_else(|| anyhow!("no ledger at {contract}"))?;
    println!("contract     {contract}");
    println!("owner        {}", ledger.owner());
    println!("price feed   {}", ledger.price_feed());
    if let Some(feed) = chain.feed(&ledger.price_feed()) {
        let round = feed.latest_round_data();
        println!(
            "price        {} (decimals {}, round {})",
            round.answer,
            feed.decimals(),
            round.round_id
        );
    }
    println!("minimum usd  {}", format_ether(ledger.minimum_usd()));
    println!("balance      {} eth", format_ether(chain.balance(&contract)));
    println!("funders      {}", ledger.funders_len());
    for (idx, funder) in ledger.funders().iter().enumerate() {
        println!("  [{idx}] {funder}");
    }
    for (funder, amount) in &ledger.state().amount_funded {
        println!("  {funder} → {} eth", format_ether(*amount));
    }
    println!("height       {}", chain.meta().height);
    println!("state root   {}", hex::encode(chain.state_root()));
    Ok(())
}

//==================== main ====================//

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let state = cli.state.as_path();

    match cli.command {
        Command::Keygen { out_dir } => keygen_cmd(&out_dir),
        Command::Init { network } => init_cmd(state, &config, &network),
        Command::Faucet { to, eth } => {
            let mut chain = load_chain(state)?;
            if chain.chain_id() != DEV_CHAIN_ID {
                tracing::warn!(chain_id = chain.chain_id(), "minting on a non-development devnet");
            }
            let amount = parse_ether(&eth).context("invalid --eth")?;
            chain
                .credit(&to, amount)
                .with_context(|| format!("faucet to {to}"))?;
            save_chain(&chain, state)?;
            println!("{to} balance {} eth", format_ether(chain.balance(&to)));
            Ok(())
        }
        Command::Deploy {
            sk_hex,
            network,
            fork_answer,
        } => deploy_cmd(state, &config, &sk_hex, &network, fork_answer),
        Command::Fund {
            sk_hex,
            eth,
            contract,
        } => {
            let mut chain = load_chain(state)?;
            let signer = wallet(&sk_hex)?;
            let contract = resolve_contract(&chain, contract)?;
            let value = parse_ether(&eth).context("invalid --eth")?;
            tracing::info!(%contract, eth = %eth, "funding contract");
            send(&mut chain, state, &signer, contract, value, Call::Fund)
        }
        Command::Withdraw {
            sk_hex,
            optimized,
            contract,
        } => {
            let mut chain = load_chain(state)?;
            let signer = wallet(&sk_hex)?;
            let contract = resolve_contract(&chain, contract)?;
            let call = if optimized {
                Call::OptimizedWithdraw
            } else {
                Call::Withdraw
            };
            tracing::info!(%contract, optimized, "withdrawing");
            send(&mut chain, state, &signer, contract, 0, call)
        }
        Command::SetPrice {
            sk_hex,
            answer,
            contract,
        } => {
            let mut chain = load_chain(state)?;
            let signer = wallet(&sk_hex)?;
            let contract = resolve_contract(&chain, contract)?;
            let feed = chain
                .ledger(&contract)
                .map(|l| l.price_feed())
                .ok_or_else(|| anyhow!("no ledger at {contract}"))?;
            send(&mut chain, state, &signer, feed, 0, Call::UpdateAnswer { answer })
        }
        Command::Show { contract } => {
            let chain = load_chain(state)?;
            let contract = resolve_contract(&chain, contract)?;
            show_cmd(&chain, contract)
        }
        Command::Funder { index, contract } => {
            let chain = load_chain(state)?;
            let contract = resolve_contract(&chain, contract)?;
            let ledger = chain
                .ledger(&contract)
                .ok_or_else(|| anyhow!("no ledger at {contract}"))?;
            println!("{}", ledger.funder(index)?);
            Ok(())
        }
        Command::AmountFunded { address, contract } => {
            let chain = load_chain(state)?;
            let contract = resolve_contract(&chain, contract)?;
            let ledger = chain
                .ledger(&contract)
                .ok_or_else(|| anyhow!("no ledger at {contract}"))?;
            println!("{}", ledger.amount_funded(&address));
            Ok(())
        }
        Command::Balance { address } => {
            let chain = load_chain(state)?;
            println!("{}", chain.balance(&address));
            Ok(())
        }
    }
}
