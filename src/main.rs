use clap::Parser;
use cogworks::admin::AdminCommand;
use cogworks::anyhow::{Context, Result};
use cogworks::config::HostConfig;
use cogworks::host::{spawn_log_relay, Host};
use cogworks::registry::Severity;
use cogworks::services::ServiceCollection;
use cogworks::tokio::{
    self,
    io::{AsyncBufReadExt, BufReader},
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Cogworks - hot-load and unload modules without restarting the host
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Directory containing compiled units
    #[arg(short, long)]
    units_dir: Option<String>,

    /// Unit to load at startup (repeatable)
    #[arg(short, long = "load")]
    load: Vec<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn init_logging(level: &str, debug: bool) -> Result<()> {
    // RUST_LOG wins over the config level; --debug wins over both
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .with(filter)
        .try_init()
        .context("Failed to set global default subscriber")
}

// Runtime crates come through `cogworks` so that a dynamically linked host
// shares one runtime with its units.
#[tokio::main(crate = "cogworks::tokio")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        HostConfig::load_from_file(config_path)?
    } else {
        HostConfig::load_default()?
    };

    if let Some(dir) = args.units_dir {
        config.units.directory = dir.into();
    }
    config.units.autoload.extend(args.load);

    init_logging(&config.logging.level, args.debug)?;

    let host = Host::start(config, ServiceCollection::new()).await;
    let relay = spawn_log_relay(host.registry(), Severity::Warning, |line| println!("{line}"));

    println!("{}", AdminCommand::usage());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read command")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        match AdminCommand::parse(&line) {
            Ok(AdminCommand::Quit) => break,
            Ok(command) => println!("{}", host.execute(command).await),
            Err(e) => println!("Error: {e}"),
        }
    }

    relay.abort();
    let leaked = host.shutdown().await;
    if !leaked.is_empty() {
        eprintln!("Units still awaiting reclamation: {}", leaked.join(", "));
    }

    Ok(())
}
