//! A standalone hub node.
//!
//! Configuration comes from an optional `meshhub.toml` in the working
//! directory, overlaid with `MESHHUB_*` environment variables
//! (`MESHHUB_LISTENER_ADDR=0.0.0.0:9000`, `MESHHUB_PARENT_ENABLE=true`, ...).

use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::info;

use meshhub::config::keys;
use meshhub::handler::echo::EchoHandler;
use meshhub::handler::forward::DefaultForwardHandler;
use meshhub::handler::login::LoginHandler;
use meshhub::handler::upper::UpperHandler;
use meshhub::process::dispatcher::Dispatcher;
use meshhub::process::prerouting::PreRoutingProcess;
use meshhub::{Config, ConnectionManager, Context, Options, Server, TcpAcceptor};

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let config = Config::from_toml_path("meshhub.toml")?;
    config.merge(&Config::from_env("MESHHUB_"));
    let config = Arc::new(config);

    let addr = match config.get(keys::LISTENER_ADDR) {
        Some(addr) if !addr.is_empty() => addr,
        _ => "0.0.0.0:9000".to_string(),
    };

    let base = Arc::new(PreRoutingProcess::from_config(&config));
    let dispatcher = Dispatcher::from_config(&config, Some(base));
    dispatcher
        .register_handler(Arc::new(LoginHandler::new()))
        .expect("register login handler");
    dispatcher
        .register_handler(Arc::new(EchoHandler::new()))
        .expect("register echo handler");
    dispatcher
        .register_handler(Arc::new(UpperHandler::new()))
        .expect("register upper handler");
    dispatcher.register_default_handler(Arc::new(DefaultForwardHandler::from_config(&config)));

    let listener = Arc::new(
        TcpAcceptor::bind_with(
            &addr,
            meshhub::listener::AcceptorOptions::from_config(&config),
        )
        .await?,
    );
    info!("hub listening on {}", listener.local_addr());

    let server = Server::new(Options {
        name: "hub".into(),
        listener: Some(listener),
        manager: Some(ConnectionManager::new()),
        process: Some(dispatcher),
        config: Some(config),
        node_id: 1,
    })
    .expect("build server");
    server.start().expect("start server");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = server.stop(&Context::with_timeout(Duration::from_secs(5))).await;
    Ok(())
}
