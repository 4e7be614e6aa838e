// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use sxgd::{
    config::{Config, load_config},
    server::Server,
    signal_handler,
};
use tracing::Instrument;
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan, layer::SubscriberExt};

// The path, relative to CONFIGURATION_DIRECTORY, of the default config file.
const DEFAULT_CONFIG: &str = "sxgd/sxgd.toml";

/// The signed exchange packaging server.
///
/// sxgd fetches resources from your origin, signs them as Signed HTTP
/// Exchanges with your certificate, and serves the exchanges along with the
/// certificate chain distributors need to validate them.
///
/// To begin, you'll need a configuration file naming your certificate
/// chain, private key, and cert-url base. For an example of the current
/// format, consult the `config` subcommand.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// The path to the server's configuration file.
    ///
    /// If no path is provided, the defaults are used. To view the service
    /// configuration, run the `config` subcommand.
    #[arg(long, short, env = "SXGD_CONFIG")]
    config: Option<PathBuf>,

    /// A set of one or more comma-separated directives to filter logs.
    ///
    /// The general format is "target_name[span_name{field=value}]=level"
    /// where level is one of TRACE, DEBUG, INFO, WARN, ERROR.
    ///
    /// Details: https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[arg(long, env = "SXGD_LOG", default_value = "WARN,sxgd=INFO")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run the service.
    Listen {},

    /// See the current server configuration.
    Config {},
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Cli::parse();

    // Unfortunately we can't use clap's value_parser since EnvFilter does
    // not implement Clone.
    let log_filter = EnvFilter::builder().parse(&opts.log_filter).context(
        "SXGD_LOG contains an invalid log directive; refer to \
            https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/\
            filter/struct.EnvFilter.html#directives for format details.",
    )?;
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(log_filter);
    tracing::subscriber::set_global_default(registry)
        .expect("Programming error: set_global_default should only be called once.");

    let config = load_config::<Config>(opts.config, DEFAULT_CONFIG)?;

    match opts.command {
        Command::Listen {} => {
            let root_span = tracing::info_span!("server");
            async move {
                let server = Server::new(config).await?;
                let listener = server.run()?;
                tokio::spawn(signal_handler(listener.halt_token()));

                listener.wait_to_finish().await?;
                Ok::<_, anyhow::Error>(())
            }
            .instrument(root_span)
            .await?;
        }
        Command::Config {} => {
            println!("# This is the current configuration\n\n{config}\n# This concludes the configuration.\n");
            if let Err(error) = config.validate() {
                eprintln!("The configuration format is valid, but its content is not: {error}");
            }
        }
    }

    Ok(())
}
