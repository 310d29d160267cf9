use std::{
    fs::{self, File},
    io::BufReader,
    path::PathBuf,
    process::exit,
};

use clap::CommandFactory;
use clap_serde_derive::{
    clap::{self, Parser},
    ClapSerde,
};
use home::home_dir;
use serde::Deserialize;
use tracing::error;

use crate::types::{Address, Privkey, Secret};

const DEFAULT_CONFIG_FILE_NAME: &str = "config.yml";
const DEFAULT_KEY_FILE_NAME: &str = "key";
const DEFAULT_DB_NAME: &str = "log.db";

/// Safety margin in blocks between an outgoing lock's expiry and the
/// incoming one, enough to register a revealed secret on-chain.
pub const DEFAULT_REVEAL_TIMEOUT: u64 = 10;

/// When an incoming lock is this close to expiry and the secret is known,
/// the secret goes to the settlement contract instead of waiting for the
/// payer's off-chain unlock.
pub const DEFAULT_ON_CHAIN_MARGIN: u64 = 5;

pub const DEFAULT_CONFIRMATION_BLOCKS: u64 = 5;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

fn get_default_base_dir() -> PathBuf {
    let mut path = home_dir().expect("get home directory");
    path.push(".volt-node");
    path
}

fn get_default_config_file() -> PathBuf {
    let mut path = get_default_base_dir();
    path.push(DEFAULT_CONFIG_FILE_NAME);
    path
}

#[derive(ClapSerde, Debug, Clone)]
pub struct NodeConfig {
    /// base directory for the node's key and database
    #[arg(
        name = "NODE_BASE_DIR",
        long = "node-base-dir",
        env,
        help = "base directory for the node's key and database [default: $BASE_DIR]"
    )]
    pub base_dir: Option<PathBuf>,

    /// blocks an outgoing lock must outlive an incoming reveal
    #[arg(
        name = "NODE_REVEAL_TIMEOUT",
        long = "node-reveal-timeout",
        env,
        help = "reveal timeout in blocks [default: 10]"
    )]
    pub reveal_timeout: Option<u64>,

    /// remaining blocks at which a known secret is registered on-chain
    #[arg(
        name = "NODE_ON_CHAIN_MARGIN",
        long = "node-on-chain-margin",
        env,
        help = "on-chain secret registration margin in blocks [default: 5]"
    )]
    pub on_chain_margin: Option<u64>,
}

impl NodeConfig {
    pub fn base_dir(&self) -> PathBuf {
        self.base_dir.clone().unwrap_or_else(get_default_base_dir)
    }

    pub fn store_path(&self) -> PathBuf {
        self.base_dir().join(DEFAULT_DB_NAME)
    }

    pub fn reveal_timeout(&self) -> u64 {
        self.reveal_timeout.unwrap_or(DEFAULT_REVEAL_TIMEOUT)
    }

    pub fn on_chain_margin(&self) -> u64 {
        self.on_chain_margin.unwrap_or(DEFAULT_ON_CHAIN_MARGIN)
    }

    /// The node's account key, a 32-byte hex file under the base dir. The
    /// keystore proper is an external service; a missing file is populated
    /// with a fresh key so a dev node can start from nothing.
    pub fn read_or_generate_secret_key(&self) -> Result<Privkey, std::io::Error> {
        let path = self.base_dir().join(DEFAULT_KEY_FILE_NAME);
        if !path.exists() {
            fs::create_dir_all(self.base_dir())?;
            let fresh = Secret::generate();
            fs::write(&path, hex::encode(fresh.as_bytes()))?;
        }
        let content = fs::read_to_string(&path)?;
        let bytes = hex::decode(content.trim()).map_err(|err| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("key file is not valid hex: {}", err),
            )
        })?;
        if bytes.len() != 32 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "key file must hold exactly 32 bytes",
            ));
        }
        Ok(Privkey::from_slice(&bytes))
    }
}

#[derive(ClapSerde, Debug, Clone)]
pub struct ChainConfig {
    /// settlement layer JSON-RPC endpoint
    #[arg(
        name = "CHAIN_RPC_URL",
        long = "chain-rpc-url",
        env,
        default_value = "http://127.0.0.1:8545"
    )]
    pub rpc_url: String,

    /// address of the secret registry contract
    #[arg(name = "CHAIN_SECRET_REGISTRY", long = "chain-secret-registry", env)]
    pub secret_registry: Option<Address>,

    /// confirmation depth before chain events are acted upon
    #[arg(
        name = "CHAIN_CONFIRMATION_BLOCKS",
        long = "chain-confirmation-blocks",
        env,
        help = "confirmation depth in blocks [default: 5]"
    )]
    pub confirmation_blocks: Option<u64>,

    /// block to start watching from on first run
    #[arg(name = "CHAIN_START_BLOCK", long = "chain-start-block", env)]
    pub start_block: Option<u64>,

    /// settlement layer poll interval in milliseconds
    #[arg(
        name = "CHAIN_POLL_INTERVAL_MS",
        long = "chain-poll-interval-ms",
        env,
        help = "poll interval in milliseconds [default: 5000]"
    )]
    pub poll_interval_ms: Option<u64>,
}

impl ChainConfig {
    pub fn confirmation_blocks(&self) -> u64 {
        self.confirmation_blocks
            .unwrap_or(DEFAULT_CONFIRMATION_BLOCKS)
    }

    pub fn poll_interval_ms(&self) -> u64 {
        self.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS)
    }
}

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// config file
    #[arg(short, long = "config", help = format!("config file [default: {:?} or $BASE_DIR/config.yml]", get_default_config_file()))]
    config_file: Option<std::path::PathBuf>,

    /// base directory
    #[arg(short = 'd', long = "dir", help = format!("base directory for all [default: {:?}]", get_default_base_dir()))]
    base_dir: Option<std::path::PathBuf>,

    /// config for the node core
    #[command(flatten)]
    pub node: <NodeConfig as ClapSerde>::Opt,

    /// config for the settlement layer connection
    #[command(flatten)]
    pub chain: <ChainConfig as ClapSerde>::Opt,
}

#[derive(Deserialize)]
struct SerializedConfig {
    node: Option<<NodeConfig as ClapSerde>::Opt>,
    chain: Option<<ChainConfig as ClapSerde>::Opt>,
}

#[derive(Debug)]
pub struct Config {
    pub node: NodeConfig,
    pub chain: ChainConfig,
}

pub(crate) fn print_help_and_exit(code: i32) {
    use std::io::IsTerminal;
    if std::io::stdout().is_terminal() {
        let mut cmd = Args::command();
        cmd.print_help().expect("print help");
    }
    exit(code);
}

impl Config {
    pub fn parse() -> Self {
        let mut args = Args::parse();

        let base_dir = args.base_dir.clone().unwrap_or_else(get_default_base_dir);

        // Config file resolution order:
        // 1. the explicit `--config` argument
        // 2. `config.yml` under an explicit `--dir`
        // 3. the default `config.yml`
        let config_file = args
            .config_file
            .or(args.base_dir.map(|x| x.join(DEFAULT_CONFIG_FILE_NAME)))
            .unwrap_or_else(get_default_config_file);

        let config_from_file = File::open(config_file).map(BufReader::new).map(|f| {
            serde_yaml::from_reader::<_, SerializedConfig>(f).expect("valid config file format")
        });

        args.node.base_dir = Some(Some(base_dir));

        let (node, chain) = config_from_file
            .map(|x| {
                let SerializedConfig { node, chain } = x;
                (
                    node.map(|c| NodeConfig::from(c).merge(&mut args.node)),
                    chain.map(|c| ChainConfig::from(c).merge(&mut args.chain)),
                )
            })
            .unwrap_or((None, None));
        let node = node.unwrap_or_else(|| NodeConfig::from(&mut args.node));
        let chain = chain.unwrap_or_else(|| ChainConfig::from(&mut args.chain));

        if chain.secret_registry.is_none() {
            error!("A secret registry contract address is required to run the node.");
            print_help_and_exit(1);
        }

        Self { node, chain }
    }
}
