mod command;
mod config;
mod connection;
mod errors;
mod handshake;
mod protocol_constants;
mod replication;
mod resp;
mod store;
mod util;

use crate::config::Config;
use crate::connection::serve_connection;
use crate::handshake::attach_to_leader;
use crate::replication::{ReplicationState, Role};
use crate::store::Store;
use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config = Config::from_args(&args).map_err(anyhow::Error::msg)?;

    let role = match &config.replica_of {
        Some(leader_addr) => Role::Replica {
            leader_addr: leader_addr.clone(),
        },
        None => Role::Master,
    };
    let store = Arc::new(Store::new());
    let repl = Arc::new(ReplicationState::new(role));

    let listener = TcpListener::bind(("127.0.0.1", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    println!("Listening on port {} as {}", config.port, repl.role_name());

    // A follower attaches before serving clients; failing to reach the
    // leader is fatal.
    let mut replication_link = None;
    if let Some(leader_addr) = repl.leader_addr().map(str::to_string) {
        let link = attach_to_leader(&leader_addr, config.port, store.clone(), repl.clone()).await?;
        replication_link = Some(link);
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        println!("New connection: {}", addr);
                        let (read_half, write_half) = stream.into_split();
                        tokio::spawn(serve_connection(
                            read_half,
                            write_half,
                            store.clone(),
                            repl.clone(),
                        ));
                    }
                    Err(e) => eprintln!("Error accepting a connection: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting the server down");
                break;
            }
        }
    }

    // Stop accepting, then let in-flight tasks die with the process.
    drop(listener);
    if let Some(link) = replication_link {
        link.abort();
    }
    Ok(())
}
