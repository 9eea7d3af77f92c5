// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use forest_messager::cli::{perms_for_level, AuthCommand, Cli, Command};
use forest_messager::config::Config;
use forest_messager::node::{rpc::RpcNode, NodeApi, RpcNodeConnector};
use forest_messager::repo::memory::MemRepo;
use forest_messager::rpc::{start_rpc, MessagerApiImpl};
use forest_messager::service::{
    AddressService, MessageService, NodeService, SharedParamsService, WalletService,
};
use forest_messager::wallet::RpcWalletConnector;
use forest_messager::{auth, logger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command {
        Command::Run => run(config).await,
        Command::Auth {
            command: AuthCommand::CreateToken { perm },
        } => {
            let perms = perms_for_level(&perm)?;
            let token = auth::create_token_without_exp(perms, &config.rpc.secret()?)?;
            println!("{token}");
            Ok(())
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    logger::setup_logger(&config.log);
    info!("starting forest-messager");

    let repo = Arc::new(MemRepo::new());
    let node: Arc<dyn NodeApi> = Arc::new(
        RpcNode::connect(&config.node.url, &config.node.token)
            .await
            .with_context(|| format!("connecting to node {}", config.node.url))?,
    );

    let sps = Arc::new(SharedParamsService::new(repo.clone())?);
    let wallet_service = Arc::new(WalletService::new(
        repo.clone(),
        Box::new(RpcWalletConnector),
    ));
    let message_service = Arc::new(MessageService::new(
        repo.clone(),
        node.clone(),
        config.messager.service_config(),
        sps.clone(),
        wallet_service.clone(),
    )?);
    let address_service = Arc::new(AddressService::new(
        repo.clone(),
        node.clone(),
        wallet_service.clone(),
    ));
    let node_service = Arc::new(NodeService::new(repo, Arc::new(RpcNodeConnector)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = message_service.start(shutdown_rx.clone());
    handles.push(address_service.start_reset_coordinator(shutdown_rx.clone()));
    handles.push(node_service.clone().start_refresh(shutdown_rx));

    let listen = config.rpc.listen.parse().context("parsing rpc listen address")?;
    let api = MessagerApiImpl {
        message_service,
        address_service,
        wallet_service,
        node_service,
        sps,
    };
    let rpc_handle = start_rpc(api, listen, config.rpc.secret()?).await?;
    info!(%listen, "rpc server up");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = rpc_handle.stop();
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}
