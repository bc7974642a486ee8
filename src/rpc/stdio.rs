use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::RpcServer;

/// Serve JSON-RPC over newline-delimited stdio until stdin closes.
///
/// The only bytes ever written to stdout are response frames — logging is
/// configured onto stderr at process startup, and a dedicated writer task
/// owns stdout so concurrent responses cannot interleave mid-frame.
/// Requests run concurrently; responses whose client is gone (channel
/// closed) are discarded rather than interrupting the running tool.
pub async fn serve(server: Arc<RpcServer>) -> Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let (tx, mut rx) = mpsc::channel::<String>(64);

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(frame) = rx.recv().await {
            if stdout.write_all(frame.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
            {
                warn!("stdout closed; dropping remaining responses");
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    info!("stdio JSON-RPC server ready");
    let mut lines = stdin.lines();
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let server = Arc::clone(&server);
        let tx = tx.clone();
        let frame = trimmed.to_string();
        tokio::spawn(async move {
            if let Some(response) = server.handle_frame(&frame).await {
                // A closed channel means the transport is gone; the
                // response is discarded by design.
                if tx.send(response.to_string()).await.is_err() {
                    debug!("transport closed before response could be sent");
                }
            }
        });
    }

    drop(tx);
    let _ = writer.await;
    info!("stdin closed; stdio server shutting down");
    Ok(())
}
