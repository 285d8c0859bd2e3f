// CLI commands

use crate::config::{ConfigError, NodeConfig};
use crate::consensus::pow::COIN;
use crate::core::{Address, Block, Hash256, Transaction};
use crate::network::{
    ChainSync, Command, ForkChoice, Node, NodeError, PeerError, PeerHandle, SyncError,
};
use crate::storage::{ChainStore, StoreError, UtxoSet};
use crate::wallet::{Keystore, TransactionBuilder, WalletError};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Wallet(#[from] WalletError),
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("block not found: {0}")]
    BlockNotFound(String),
    #[error("transaction rejected: {0}")]
    Rejected(String),
}

#[derive(Parser)]
#[command(name = "minichain")]
#[command(about = "Minimal proof-of-work cryptocurrency node and wallet", long_about = None)]
pub struct Cli {
    /// Node configuration file (JSON)
    #[arg(short, long, global = true, default_value = "minichain.json")]
    pub config: PathBuf,

    /// Data directory, overrides the configured one
    #[arg(short, long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the chain store and write the config file
    Init,

    /// Get blockchain info
    Info,

    /// Wallet commands
    #[command(subcommand)]
    Wallet(WalletCommands),

    /// Block commands
    #[command(subcommand)]
    Block(BlockCommands),

    /// Run a network node until Ctrl-C
    Node {
        /// Mine blocks, paying the configured miner address
        /// (or the wallet's default address)
        #[arg(long)]
        mine: bool,
        /// Listening address
        #[arg(long)]
        listen: Option<SocketAddr>,
        /// Node to connect to at startup (repeatable)
        #[arg(long = "peer")]
        peers: Vec<SocketAddr>,
        /// Chain quality ordering used when syncing
        #[arg(long, value_enum)]
        fork_choice: Option<ForkChoice>,
    },
}

#[derive(Subcommand)]
pub enum WalletCommands {
    /// Create a new address
    NewAddress,

    /// List all addresses
    List,

    /// Get balance for an address
    Balance {
        /// Address to check (uses default if not specified)
        address: Option<String>,
    },

    /// Send coins to an address
    Send {
        /// Recipient address
        to: String,
        /// Amount in base units
        amount: u64,
        /// Transaction fee in base units
        #[arg(short, long, default_value = "0")]
        fee: u64,
        /// Node to sync from and submit the transaction to
        #[arg(long)]
        node: Option<SocketAddr>,
    },
}

#[derive(Subcommand)]
pub enum BlockCommands {
    /// Get block by hash or height
    Get {
        /// Block hash or height
        id: String,
    },

    /// Get blockchain height
    Height,

    /// Get best block hash
    BestBlock,
}

/// CLI handler
pub struct CliHandler {
    config: NodeConfig,
    config_path: PathBuf,
    keystore: Keystore,
}

impl CliHandler {
    /// Load the config (overriding its data directory if asked) and the keystore
    pub fn new(config_path: PathBuf, data_dir: Option<PathBuf>) -> Result<Self, CliError> {
        let mut config = NodeConfig::load(&config_path)?;
        if let Some(data_dir) = data_dir {
            config.data_dir = data_dir;
        }

        let keystore_path = config.keystore_path();
        log::info!("Loading keystore from {}", keystore_path.display());
        let keystore = Keystore::load_or_default(&keystore_path)?;

        Ok(Self {
            config,
            config_path,
            keystore,
        })
    }

    pub fn from_cli(cli: &Cli) -> Result<Self, CliError> {
        Self::new(cli.config.clone(), cli.data_dir.clone())
    }

    fn save_keystore(&self) -> Result<(), CliError> {
        self.keystore.save(self.config.keystore_path())?;
        Ok(())
    }

    fn open_store(&self) -> Result<ChainStore, CliError> {
        Ok(ChainStore::open(self.config.chain_path())?)
    }

    /// Handle CLI command
    pub fn handle(&mut self, command: Commands) -> Result<(), CliError> {
        match command {
            Commands::Init => self.init(),
            Commands::Info => self.info(),
            Commands::Wallet(cmd) => self.handle_wallet(cmd),
            Commands::Block(cmd) => self.handle_block(cmd),
            Commands::Node {
                mine,
                listen,
                peers,
                fork_choice,
            } => self.run_node(mine, listen, peers, fork_choice),
        }
    }

    fn init(&mut self) -> Result<(), CliError> {
        println!("Initializing blockchain...");

        let store = self.open_store()?;
        let genesis = store.genesis()?;
        if !self.config_path.exists() {
            self.config.save(&self.config_path)?;
            println!("Config written to {}", self.config_path.display());
        }

        println!("✓ Chain store ready at {}", self.config.chain_path().display());
        println!("  Genesis: {}", genesis.hash());
        println!("  Length: {}", store.length()?);
        Ok(())
    }

    fn info(&self) -> Result<(), CliError> {
        let store = self.open_store()?;
        let length = store.length()?;
        let utxos = store.get_utxos()?;
        let supply: u64 = utxos.iter().map(|(_, utxo)| utxo.amount).sum();

        println!("Blockchain Info:");
        println!("  Length: {}", length);
        println!("  Best block: {}", store.tip_hash()?);
        println!("  Genesis: {}", store.genesis()?.hash());
        println!("  UTXO count: {}", utxos.len());
        println!("  Supply: {}", format_amount(supply));
        println!("  Fork choice: {:?}", self.config.fork_choice);
        Ok(())
    }

    fn handle_wallet(&mut self, cmd: WalletCommands) -> Result<(), CliError> {
        match cmd {
            WalletCommands::NewAddress => {
                let addr = self.keystore.new_address();
                self.save_keystore()?;
                println!("New address: {}", addr);
                Ok(())
            }
            WalletCommands::List => {
                let default = self.keystore.default_address();
                let addresses = self.keystore.list_addresses();
                println!("Addresses ({}):", addresses.len());
                for addr in addresses {
                    let marker = if Some(addr) == default { "*" } else { " " };
                    println!(" {} {}", marker, addr);
                }
                Ok(())
            }
            WalletCommands::Balance { address } => {
                let addr = match address {
                    Some(a) => parse_address(&a)?,
                    None => self.keystore.default_address().ok_or(WalletError::NoDefaultAddress)?,
                };

                let utxos = self.open_store()?.get_utxos()?;
                let builder = TransactionBuilder::new(&self.keystore, &utxos);
                let balance = builder.get_balance(&addr);

                println!("Balance for {}:", addr);
                println!("  {} ({} outputs)", format_amount(balance), builder.list_utxos(&addr).len());
                Ok(())
            }
            WalletCommands::Send {
                to,
                amount,
                fee,
                node,
            } => {
                let to = parse_address(&to)?;
                let tx = match node {
                    Some(node) => self.send_via_node(node, &to, amount, fee)?,
                    None => {
                        let utxos = self.open_store()?.get_utxos()?;
                        let tx = self.build_transaction(&utxos, &to, amount, fee)?;
                        println!("Transaction created (not broadcast, pass --node to submit):");
                        let json = serde_json::to_string(&tx).map_err(WalletError::from)?;
                        println!("  {}", json);
                        tx
                    }
                };

                println!("  Hash: {}", tx.hash());
                println!("  Inputs: {}", tx.inputs.len());
                println!("  Outputs: {}", tx.outputs.len());
                Ok(())
            }
        }
    }

    fn build_transaction(
        &self,
        utxos: &UtxoSet,
        to: &Address,
        amount: u64,
        fee: u64,
    ) -> Result<Transaction, CliError> {
        let from = self.keystore.default_address().ok_or(WalletError::NoDefaultAddress)?;
        let tx = TransactionBuilder::new(&self.keystore, utxos).build(&from, to, amount, fee)?;
        utxos
            .validate_transaction(&tx)
            .map_err(|e| CliError::Rejected(e.to_string()))?;
        Ok(tx)
    }

    /// Replicate the node's chain into memory, spend from it and submit
    /// the transaction to the node
    fn send_via_node(
        &self,
        node: SocketAddr,
        to: &Address,
        amount: u64,
        fee: u64,
    ) -> Result<Transaction, CliError> {
        let runtime = Runtime::new()?;
        runtime.block_on(async {
            let (events, _events) = mpsc::channel(16);
            let peer = PeerHandle::connect(node, events, self.config.request_timeout()).await?;

            let replica = ChainStore::memory()?;
            let outcome = ChainSync::new(self.config.fork_choice)
                .sync(&replica, &[peer.clone()])
                .await?;
            log::info!("Replicated chain from {}: {:?}", node, outcome);

            let tx = self.build_transaction(&replica.get_utxos()?, to, amount, fee)?;
            peer.send(Command::NewTransaction {
                transaction: tx.clone(),
            })
            .await?;
            // frames go out in order, so an answered request means the
            // transaction was written
            peer.request(Command::ChainInfoRequest).await?;
            peer.kill("done").await;

            println!("Transaction submitted to {}", node);
            Ok::<_, CliError>(tx)
        })
    }

    fn handle_block(&self, cmd: BlockCommands) -> Result<(), CliError> {
        let store = self.open_store()?;
        match cmd {
            BlockCommands::Get { id } => {
                let height = match id.parse::<u64>() {
                    Ok(height) => Some(height),
                    Err(_) => match Hash256::from_hex(&id) {
                        Ok(hash) => store.height_of(&hash)?,
                        Err(_) => None,
                    },
                };
                let block = match height {
                    Some(height) => store.get(height)?,
                    None => None,
                };

                match (height, block) {
                    (Some(height), Some(block)) => {
                        print_block(height, &block);
                        Ok(())
                    }
                    _ => Err(CliError::BlockNotFound(id)),
                }
            }
            BlockCommands::Height => {
                println!("Blockchain height: {}", store.length()?.saturating_sub(1));
                Ok(())
            }
            BlockCommands::BestBlock => {
                println!("Best block: {}", store.tip_hash()?);
                Ok(())
            }
        }
    }

    fn run_node(
        &mut self,
        mine: bool,
        listen: Option<SocketAddr>,
        peers: Vec<SocketAddr>,
        fork_choice: Option<ForkChoice>,
    ) -> Result<(), CliError> {
        let mut config = self.config.clone();
        if let Some(listen) = listen {
            config.listen = listen;
        }
        config.peers.extend(peers);
        if let Some(fork_choice) = fork_choice {
            config.fork_choice = fork_choice;
        }

        if mine && config.miner_address.is_none() {
            let address = match self.keystore.default_address() {
                Some(address) => address,
                None => {
                    let address = self.keystore.new_address();
                    self.save_keystore()?;
                    address
                }
            };
            config.miner_address = Some(address);
        }
        if !mine {
            config.miner_address = None;
        }

        let store = self.open_store()?;
        println!("Chain length {}, tip {}", store.length()?, store.tip_hash()?);
        if let Some(address) = config.miner_address {
            println!("Mining to {}", address);
        }

        let node = Node::new(config, store);
        Runtime::new()?.block_on(node.run())?;
        Ok(())
    }
}

fn parse_address(s: &str) -> Result<Address, CliError> {
    Address::from_hex(s).map_err(|e| CliError::InvalidAddress(format!("{}: {}", s, e)))
}

fn format_amount(amount: u64) -> String {
    format!("{} units ({:.6} coins)", amount, amount as f64 / COIN as f64)
}

fn print_block(height: u64, block: &Block) {
    println!("Block {}:", height);
    println!("  Hash: {}", block.hash());
    match block.prev_hash() {
        Some(prev) => println!("  Previous: {}", prev),
        None => println!("  Previous: none (genesis)"),
    }
    match block.header.transactions_root {
        Some(root) => println!("  Transactions root: {}", root),
        None => println!("  Transactions root: none"),
    }
    println!("  Timestamp: {}", block.timestamp());
    println!("  Nonce: {}", block.header.nonce);
    println!("  Transactions: {}", block.transactions.len());

    for (i, tx) in block.transactions.iter().enumerate() {
        println!("    {}", transaction_line(i, tx));
    }
}

fn transaction_line(index: usize, tx: &Transaction) -> String {
    let total = tx.total_output_value().unwrap_or(u64::MAX);
    format!(
        "[{}] {} ({} inputs, {} outputs paying {} units)",
        index,
        tx.hash(),
        tx.inputs.len(),
        tx.outputs.len(),
        total
    )
}
