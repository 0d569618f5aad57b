use std::sync::Arc;

use clap::Parser;
use futures_util::FutureExt;
use tokio::net::{TcpListener, UnixListener};
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tonic::transport::Server;

use csi::config::{Cli, Endpoint, Role};
use csi::controller::ControllerService;
use csi::identity::{IdentityService, Readiness};
use csi::node::NodeService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Cli::parse();
    args.validate()?;

    let endpoint = Endpoint::parse(&args.endpoint)?;
    let client = linode_api::Client::new(args.api_token.clone())?;

    let metadata = match args.role {
        Role::Node => Some(
            metadata::resolve(&client)
                .await
                .map_err(|err| format!("could not resolve node identity: {err}"))?,
        ),
        Role::Controller => match metadata::resolve(&client).await {
            Ok(meta) => Some(meta),
            Err(err) => {
                log::warn!("node metadata unavailable for controller process: {err}");
                None
            }
        },
    };

    let api: Arc<dyn linode_api::LinodeApiOps> = Arc::new(client);

    let region = args
        .region
        .clone()
        .or_else(|| metadata.as_ref().map(|m| m.region.clone()))
        .ok_or("region could not be determined: pass --region or run where node metadata resolves")?;

    let readiness = Readiness::new();
    let identity = IdentityService::new(
        args.driver_name.clone(),
        args.vendor_version.clone(),
        args.role == Role::Controller,
        readiness.clone(),
    );

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel(1);
    ctrlc::set_handler(move || shutdown_tx.blocking_send(()).expect("could not send sigint"))
        .expect("could not set Ctrl-C handler");

    log::info!("starting {:?} service on {}", args.role, args.endpoint);

    match args.role {
        Role::Controller => {
            let controller = ControllerService::new(api, region, args.label_prefix.clone());
            readiness.mark_ready();

            let server = Server::builder()
                .add_service(controller.into_service())
                .add_service(identity.into_service());

            match endpoint {
                Endpoint::Unix(path) => {
                    std::fs::remove_file(&path).ok();
                    let listener = UnixListener::bind(&path)?;
                    let stream = UnixListenerStream::new(listener);
                    server
                        .serve_with_incoming_shutdown(stream, shutdown_rx.recv().map(|_| ()))
                        .await?;
                    tokio::fs::remove_file(&path).await.ok();
                }
                Endpoint::Tcp(addr) => {
                    let listener = TcpListener::bind(addr).await?;
                    let stream = TcpListenerStream::new(listener);
                    server
                        .serve_with_incoming_shutdown(stream, shutdown_rx.recv().map(|_| ()))
                        .await?;
                }
            }
        }
        Role::Node => {
            let metadata = metadata.expect("node metadata resolved above");
            let luks: Arc<dyn device::luks::LuksOps> = Arc::new(device::luks::Cryptsetup);
            let node = NodeService::new(api, luks, metadata);
            readiness.mark_ready();

            let server = Server::builder()
                .add_service(node.into_service())
                .add_service(identity.into_service());

            match endpoint {
                Endpoint::Unix(path) => {
                    std::fs::remove_file(&path).ok();
                    let listener = UnixListener::bind(&path)?;
                    let stream = UnixListenerStream::new(listener);
                    server
                        .serve_with_incoming_shutdown(stream, shutdown_rx.recv().map(|_| ()))
                        .await?;
                    tokio::fs::remove_file(&path).await.ok();
                }
                Endpoint::Tcp(addr) => {
                    let listener = TcpListener::bind(addr).await?;
                    let stream = TcpListenerStream::new(listener);
                    server
                        .serve_with_incoming_shutdown(stream, shutdown_rx.recv().map(|_| ()))
                        .await?;
                }
            }
        }
    }

    log::info!("shut down cleanly");
    Ok(())
}
