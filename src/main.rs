//! Binary entrypoint for the meshwatch CLI.
//!
//! Commands:
//! - `start [--broker <host>] [--topic <filter>]` - run the tracker against the configured broker
//! - `init` - create a starter `config.toml` and the data directory
//! - `status` - summarize the persisted node state without starting the tracker
//!
//! See the library crate docs for module-level details: `meshwatch::`.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;

use meshwatch::config::Config;
use meshwatch::persist;
use meshwatch::server::TrackerServer;

#[derive(Parser)]
#[command(name = "meshwatch")]
#[command(about = "Live node tracker and gateway monitor for Meshtastic mesh networks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the tracker
    Start {
        /// MQTT broker host (overrides the config file)
        #[arg(short, long)]
        broker: Option<String>,

        /// MQTT topic filter (overrides the config file)
        #[arg(short, long)]
        topic: Option<String>,
    },
    /// Initialize a new tracker configuration
    Init,
    /// Show a summary of the persisted node state
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };

    match cli.command {
        Commands::Start { broker, topic } => {
            let mut config = match pre_config {
                Some(config) => config,
                None => Config::load(&cli.config).await?,
            };
            init_logging(&Some(config.clone()), cli.verbose);
            info!("Starting meshwatch v{}", env!("CARGO_PKG_VERSION"));

            if let Some(broker) = broker {
                config.mqtt.broker = broker;
            }
            if let Some(topic) = topic {
                config.mqtt.topic = topic;
            }

            let mqtt_config = config.mqtt.clone();
            let mut server = TrackerServer::new(config)?;

            #[cfg(feature = "mqtt")]
            {
                meshwatch::transport::spawn_mqtt_feeder(mqtt_config, server.message_sender());
            }
            #[cfg(not(feature = "mqtt"))]
            {
                let _ = mqtt_config;
                log::warn!(
                    "built without the 'mqtt' feature; no transport will feed the tracker"
                );
            }

            server.run().await?;
        }
        Commands::Init => {
            init_logging(&None, cli.verbose);
            info!("Initializing new tracker configuration");
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);

            let config = Config::load(&cli.config).await?;
            tokio::fs::create_dir_all(&config.storage.data_dir).await?;
            info!("Data directory ready at {}", config.storage.data_dir);
        }
        Commands::Status => {
            init_logging(&pre_config, cli.verbose);
            let config = match pre_config {
                Some(config) => config,
                None => Config::load(&cli.config).await?,
            };

            let path = std::path::Path::new(&config.storage.data_dir)
                .join(&config.storage.state_file);
            let nodes = persist::read_snapshot(&path);

            let special = nodes.values().filter(|n| n.is_special).count();
            let observations: usize = nodes.values().map(|n| n.gateways.len()).sum();
            let newest = nodes.values().map(|n| n.last_seen).max();

            println!("meshwatch state: {}", path.display());
            println!("  nodes tracked:        {}", nodes.len());
            println!("  special nodes:        {}", special);
            println!("  gateway observations: {}", observations);
            match newest {
                Some(t) => println!("  most recent packet:   {}", t.format("%Y-%m-%dT%H:%M:%SZ")),
                None => println!("  most recent packet:   (none)"),
            }
        }
    }

    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // Base level from CLI verbosity; config level applies when not verbose
    let base_level = match verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    if verbosity == 0 {
        if let Some(cfg) = config {
            if let Ok(level) = cfg.logging.level.parse::<log::LevelFilter>() {
                builder.filter_level(level);
            }
        }
    }

    let log_file = config.as_ref().and_then(|c| c.logging.file.clone());
    if let Some(file) = log_file {
        if let Ok(f) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file)
        {
            let sink = std::sync::Arc::new(std::sync::Mutex::new(f));

            // When stdout is a terminal, echo to the console as well as the
            // file; under a service manager only the file gets written.
            let is_tty = atty::is(atty::Stream::Stdout);

            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());

                if let Ok(mut guard) = sink.lock() {
                    let _ = writeln!(guard, "{}", line);
                }

                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        } else {
            builder.format(|fmt, record| {
                writeln!(
                    fmt,
                    "{} [{}] {}",
                    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                    record.level(),
                    record.args()
                )
            });
        }
    } else {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "{} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        });
    }
    let _ = builder.try_init();
}
