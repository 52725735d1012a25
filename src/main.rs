//! Binary entry point for the Stowage plugin.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;
use tracing::info;

use stowage::cloud::{
    CloudError, MetadataServiceClient, RestClient, RestInstanceApi, RestShareApi,
    RestTurboShareApi, RestVolumeApi,
};
use stowage::exec::ProcessCommandRunner;
use stowage::logging::{self, LogFormat, LoggingError};
use stowage::mount::MountClient;
use stowage::mounter::Mounter;
use stowage::rpc::{ControllerService, NodeService, RpcServer};
use stowage::transport::{self, TransportError};
use stowage::{Attacher, ConfigError, DeviceResolver, PluginConfig, Provisioner};

#[expect(dead_code, reason = "the connector parser belongs to the other binary")]
mod cli;

use cli::Cli;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("logging error: {0}")]
    Logging(#[from] LoggingError),
    #[error("cloud client error: {0}")]
    Cloud(#[from] CloudError),
    #[error("server error: {0}")]
    Server(#[from] TransportError),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let mut config = PluginConfig::load_without_cli_args()?;
    if let Some(endpoint) = cli.endpoint {
        config.rpc_socket = endpoint;
    }
    if cli.node_id.is_some() {
        config.node_id = cli.node_id;
    }
    config.validate()?;
    logging::init(config.log_format.parse::<LogFormat>()?)?;

    let controller = cli
        .mode
        .controller()
        .then(|| build_controller(&config))
        .transpose()?;
    let node = cli.mode.node().then(|| build_node(&config)).transpose()?;
    let server = Arc::new(RpcServer::new(controller, node));

    let socket = Utf8PathBuf::from(&config.rpc_socket);
    let listener = transport::bind(&socket)?;
    info!(%socket, mode = ?cli.mode, "plugin listening");
    server.serve(listener, transport::shutdown_signal()).await?;
    Ok(())
}

fn build_controller(config: &PluginConfig) -> Result<ControllerService, CliError> {
    let client = RestClient::from_config(config)?;
    let shares = Provisioner::new(Arc::new(RestShareApi::new(client.clone())))
        .with_access_network(config.share_network_id.clone());
    Ok(ControllerService::new()
        .with_provisioner(Provisioner::new(Arc::new(RestVolumeApi::new(client.clone()))))
        .with_provisioner(shares)
        .with_provisioner(Provisioner::new(Arc::new(RestTurboShareApi::new(
            client.clone(),
        ))))
        .with_attacher(Attacher::new(Arc::new(RestInstanceApi::new(client))))
        .with_bucket_endpoint(&config.region, &config.endpoint_domain))
}

fn build_node(config: &PluginConfig) -> Result<NodeService, CliError> {
    let node_id = config.require_node_id()?;
    let metadata = MetadataServiceClient::new(config.metadata_url.as_str())?;
    let connector = MountClient::new(
        config.connector_socket.as_str(),
        config.shared_secret.as_str(),
    );
    Ok(NodeService::new(
        node_id,
        Mounter::new(Arc::new(ProcessCommandRunner)),
        DeviceResolver::new(Arc::new(metadata)),
    )
    .with_max_volumes(config.max_volumes_per_node)
    .with_connector(connector, config.credential_dir.as_str()))
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
