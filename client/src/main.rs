//! # kubedash-watch
//!
//! Terminal client for a kubedash server. Subscribes to one or more
//! resource paths and prints every event until interrupted, reconnecting
//! and resubscribing whenever the connection drops.
//!
//! ```text
//! kubedash-watch --url http://127.0.0.1:9090 --path /api/v1/pods --fields status.phase
//! ```

mod config;

use clap::Parser;
use tracing::info;

use config::Cli;
use kubedash_client::{ClientState, DashboardClient, MessageType, ServerMessage};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let url = match config::build_ws_url(&cli.url) {
        Ok(url) => url,
        Err(e) => {
            eprintln!("kubedash-watch: {e}");
            std::process::exit(1);
        }
    };

    let client = DashboardClient::connect(url.clone(), cli.policy());
    let params = cli.params();
    let json = cli.json;
    for (i, path) in cli.paths.iter().enumerate() {
        let id = (i + 1).to_string();
        let result = client
            .subscribe(&id, path, params.clone(), move |msg| print_event(msg, json))
            .await;
        if let Err(e) = result {
            eprintln!("kubedash-watch: cannot subscribe to {path}: {e}");
            std::process::exit(1);
        }
    }
    info!("Watching {} path(s) via {url}", cli.paths.len());

    let mut states = client.state_changes();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                if state == ClientState::Active {
                    info!("Connected");
                } else if state == ClientState::Disconnected {
                    info!("Disconnected, will retry");
                }
            }
        }
    }
    client.shutdown().await;
}

fn print_event(msg: &ServerMessage, json: bool) {
    let id = msg.id.as_deref().unwrap_or("-");
    match msg.kind {
        MessageType::Data => {
            let Some(event) = &msg.data else { return };
            if json {
                println!("{event}");
                return;
            }
            let object = &event["object"];
            let name = object["metadata"]["name"]
                .as_str()
                .or_else(|| object["name"].as_str())
                .unwrap_or("?");
            let namespace = object["metadata"]["namespace"]
                .as_str()
                .or_else(|| object["namespace"].as_str())
                .unwrap_or("");
            println!(
                "[{id}] {:<8} {namespace}/{name}",
                event["type"].as_str().unwrap_or("?")
            );
        }
        MessageType::Status => {
            let status = msg
                .data
                .as_ref()
                .and_then(|d| d["type"].as_str())
                .unwrap_or("?");
            eprintln!("[{id}] {status} {}", msg.path.as_deref().unwrap_or(""));
        }
        MessageType::Error => {
            eprintln!("[{id}] error: {}", msg.error.as_deref().unwrap_or("unknown"));
        }
        _ => {}
    }
}
