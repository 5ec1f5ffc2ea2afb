//! Echo server and client in one process over the in-memory broker.
//!
//! Run with: cargo run --example echo_memory
mod common;

use common::{EchoRequest, EchoResponse, ECHO_QUEUE};
use queue_rpc::{RpcClient, RpcConfig, RpcServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    common::init_logging();

    let server = RpcServer::new(&RpcConfig::memory("echo-server")).await?;
    server.register(ECHO_QUEUE, |req: EchoRequest| async move {
        Ok(EchoResponse {
            text: req.text,
            served_by: "in-process".to_string(),
        })
    })?;

    let handle = server.spawn().await?;

    let client = RpcClient::new(&RpcConfig::memory("echo-client")).await?;

    let resp: EchoResponse = client
        .call(
            ECHO_QUEUE,
            &EchoRequest {
                text: "ping".to_string(),
                shout: false,
            },
        )
        .await?;

    println!("ping -> {} (from {})", resp.text, resp.served_by);

    client.close().await?;
    server.shutdown();
    handle.await??;
    Ok(())
}
