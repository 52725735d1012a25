//! Binary entry point for the privileged mount connector.
//!
//! The connector runs with the rights needed to mount buckets and executes
//! only commands signed with the shared secret.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;
use tracing::info;

use stowage::exec::ProcessCommandRunner;
use stowage::logging::{self, LogFormat, LoggingError};
use stowage::mount::{MountError, MountServer, ServerSettings};
use stowage::transport::{self, TransportError};
use stowage::{ConfigError, ConnectorConfig};

#[path = "../cli/mod.rs"]
#[expect(dead_code, reason = "the plugin parser belongs to the other binary")]
mod cli;

use cli::ConnectorCli;

#[derive(Debug, Error)]
enum ConnectorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("logging error: {0}")]
    Logging(#[from] LoggingError),
    #[error("socket error: {0}")]
    Socket(#[from] TransportError),
    #[error("connector error: {0}")]
    Mount(#[from] MountError),
    #[error("cannot prepare credential directory: {0}")]
    CredentialDir(#[from] io::Error),
}

#[tokio::main]
async fn main() {
    let cli = ConnectorCli::parse();
    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            writeln!(io::stderr(), "{err}").ok();
            1
        }
    };

    process::exit(exit_code);
}

async fn run(cli: ConnectorCli) -> Result<(), ConnectorError> {
    let mut config = ConnectorConfig::load_without_cli_args()?;
    if let Some(socket) = cli.socket {
        config.socket = socket;
    }
    config.validate()?;
    logging::init(config.log_format.parse::<LogFormat>()?)?;

    tokio::fs::create_dir_all(&config.credential_dir).await?;
    let server = Arc::new(MountServer::new(
        ServerSettings::from(&config),
        Arc::new(ProcessCommandRunner),
    )?);
    let socket = Utf8PathBuf::from(&config.socket);
    let listener = transport::bind(&socket)?;
    info!(%socket, credential_dir = %config.credential_dir, "mount connector listening");
    server.serve(listener, transport::shutdown_signal()).await?;
    Ok(())
}
