//! gmcastd — joins a gmcast group and bridges stdin/stdout to the mesh.
//!
//! Every line typed on stdin fans out to all established peers; every
//! datagram the mesh delivers is printed with its source uuid. Run one
//! instance per node:
//!
//!   gmcastd 'gmcast://0.0.0.0?gmcast.group=demo&gmcast.listen_addr=tcp://0.0.0.0:4567'
//!   gmcastd 'gmcast://127.0.0.1:4567?gmcast.group=demo&gmcast.listen_addr=tcp://0.0.0.0:4568'

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, BufReader};

use gmcast::net::tcp::TokioNet;
use gmcast::{GmcastEngine, Runner, SystemClock};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let url = std::env::args().nth(1).context(
        "usage: gmcastd <gmcast://host[:port]?gmcast.group=NAME[&gmcast.listen_addr=tcp://...]>",
    )?;

    let (net, events) = TokioNet::new();
    let engine = GmcastEngine::new(&url, Box::new(net), Box::new(SystemClock))
        .context("invalid gmcast URL")?;
    tracing::info!(uuid = %engine.uuid(), group = engine.group(), listen = %engine.listen_addr(), "gmcastd starting");

    let (runner, handle, mut up_rx) = Runner::new(engine, events);

    let printer = tokio::spawn(async move {
        while let Some((payload, meta)) = up_rx.recv().await {
            println!("[{}] {}", meta.source, String::from_utf8_lossy(&payload));
        }
    });

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if handle.send(Bytes::from(line.into_bytes())).is_err() {
                break;
            }
        }
    });

    runner.run().await?;
    printer.abort();
    reader.abort();
    Ok(())
}
