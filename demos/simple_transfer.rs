use std::sync::Arc;

use tracing::{info, Level};

use rustftp::command::TransferMode;
use rustftp::config::TransferConfig;
use rustftp::session::{TransferServer, TransferSession};
use rustftp::store::{FileStore, MemoryStore};

fn init_logging() {
    tracing_subscriber::fmt()
        // .with_max_level(Level::TRACE)
        .with_max_level(Level::DEBUG)
        .with_thread_ids(true)
        .try_init()
        .ok();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let store = Arc::new(MemoryStore::new());
    store.write("hello.txt", b"hello over tftp\n".to_vec())?;

    let mut server = TransferServer::bind(
        "127.0.0.1:0".parse()?,
        store.clone(),
        TransferConfig::default(),
    ).await?;
    let server_addr = server.local_addr();

    tokio::spawn(async move {
        // one transfer per call: serve the download, then the upload
        for _ in 0..2 {
            if let Err(e) = server.serve_once().await {
                info!("server: transfer failed: {}", e);
            }
        }
    });

    let mut session = TransferSession::connect(server_addr, TransferConfig::default()).await?;
    let contents = session.download("hello.txt", TransferMode::Octet).await?;
    info!("downloaded {} bytes: {:?}", contents.len(), String::from_utf8_lossy(&contents));

    let mut session = TransferSession::connect(server_addr, TransferConfig::default()).await?;
    session.upload("answer.txt", TransferMode::Octet, b"thanks!\n").await?;
    info!("uploaded answer.txt: {:?}", store.get("answer.txt").map(|c| c.len()));

    Ok(())
}
