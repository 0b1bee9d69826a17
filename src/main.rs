//! tscast command line: `play` triples or `serve` with the REST API.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};

use tscast::caster::Caster;
use tscast::net::MuxerConfig;
use tscast::stream::Endpoint;

#[derive(Parser)]
#[command(name = "tscast", version, about = "SMPTE 2022-2 MPEG-TS file-to-UDP caster")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Cast one or more TS files and exit when all streams end.
    Play {
        /// FILE IP PORT triples, one per stream.
        #[arg(required = true, num_args = 3.., value_name = "FILE IP PORT")]
        targets: Vec<String>,
    },
    /// Run as a service exposing the REST API.
    Service {
        /// REST listening port.
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Play { targets } => {
            anyhow::ensure!(
                targets.len() % 3 == 0,
                "play expects FILE IP PORT triples, got {} arguments",
                targets.len()
            );

            let caster = Caster::new(false, MuxerConfig::default())?;
            for triple in targets.chunks(3) {
                let ip: Ipv4Addr = triple[1]
                    .parse()
                    .with_context(|| format!("invalid IPv4 address '{}'", triple[1]))?;
                let port: u16 = triple[2]
                    .parse()
                    .with_context(|| format!("invalid port '{}'", triple[2]))?;
                caster
                    .create_stream(&triple[0], Endpoint { ip, port })
                    .with_context(|| format!("cannot cast '{}'", triple[0]))?;
            }
            caster.run()?;
        }
        Command::Service { port } => {
            let caster = Arc::new(Caster::new(true, MuxerConfig::default())?);
            let server = tscast::api::spawn(
                Arc::clone(&caster),
                SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            )?;
            tracing::info!(addr = %server.local_addr(), "tscast service running");
            caster.run()?;
        }
    }
    Ok(())
}
