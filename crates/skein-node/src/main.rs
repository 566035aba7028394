//! `skein-node` binary

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use skein_core::{ChannelName, Credential, LoginRequest, NodeName, PeerKey, SkeinError, SkeinResult, LOGIN_PROCEDURE};
use skein_node::{gateway, init_logging, LogFormat, Node, NodeConfig, DEFAULT_LOG_FILTER};
use skein_store::CredentialFile;
use skein_transport::Socket;

#[derive(Parser)]
#[command(name = "skein-node", version, about = "Member node of a skein channel mesh")]
struct Cli {
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a node: transport, replication and HTTP gateway
    Run(RunArgs),
    /// Add or update a user in a credential file
    AddUser(AddUserArgs),
    /// Log in to a node and print every message published on a channel
    Watch(WatchArgs),
}

#[derive(Args)]
struct RunArgs {
    /// TOML config file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    gateway_port: Option<u16>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Report write and connect failures to gateway callers
    #[arg(long)]
    surface_errors: bool,
}

#[derive(Args)]
struct AddUserArgs {
    #[arg(long, default_value = "data/credentials.json")]
    file: PathBuf,
    #[arg(long)]
    username: String,
    #[arg(long)]
    password: String,
}

#[derive(Args)]
struct WatchArgs {
    #[arg(long, default_value = "localhost")]
    host: String,
    #[arg(long)]
    port: u16,
    #[arg(long)]
    channel: String,
    #[arg(long)]
    username: String,
    #[arg(long)]
    password: String,
    /// Name to declare to the node; messages it already saw are withheld
    #[arg(long)]
    name: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_logging(cli.log_format, DEFAULT_LOG_FILTER) {
        eprintln!("skein-node: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Command::Run(args) => run(args).await,
        Command::AddUser(args) => add_user(args),
        Command::Watch(args) => watch(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "skein-node failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: RunArgs) -> SkeinResult<()> {
    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(name) = args.name {
        config.name = NodeName::from(name);
    }
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(port) = args.gateway_port {
        config.gateway.port = port;
    }
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    config.gateway.surface_errors |= args.surface_errors;
    config.validate()?;

    let gateway_addr = config.gateway_addr()?;
    let node = Node::open(config).await?;
    let listener = TcpListener::bind(gateway_addr).await?;

    gateway::serve(Arc::clone(&node), listener, shutdown_signal()).await?;
    node.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn add_user(args: AddUserArgs) -> SkeinResult<()> {
    CredentialFile::new(args.file).add_user(Credential::new(args.username, args.password))
}

async fn watch(args: WatchArgs) -> SkeinResult<()> {
    let key = PeerKey::new(args.host, args.port);
    let socket = Socket::connect(&key).await?;
    info!(peer = %key, "connected");

    let login = LoginRequest {
        credential: Credential::new(args.username, args.password),
        client_name: args.name.map(NodeName::from),
    };
    let (_, token) = tokio::try_join!(
        socket.invoke(LOGIN_PROCEDURE, serde_json::to_value(&login)?, None),
        socket.authenticated(),
    )?;
    info!(peer = %key, remote = ?token.server_name, "authenticated");

    let channel = ChannelName::from(args.channel);
    let mut stream = socket.subscribe(&channel).await?;
    loop {
        tokio::select! {
            item = stream.recv() => match item {
                Some(data) => println!("{data}"),
                None => return Err(SkeinError::ConnectionClosed),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    if let Err(e) = socket.unsubscribe(&channel) {
        warn!(%channel, error = %e, "unsubscribe failed");
    }
    socket.close();
    Ok(())
}
