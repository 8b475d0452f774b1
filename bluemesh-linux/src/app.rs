//! Local application: stdin lines are flooded to the mesh, delivered payloads are printed.

use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use bluemesh_core::{MeshRouter, RouterError};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const INPUT_QUEUE: usize = 64;

/// Read stdin lines on a plain thread. Tokio's stdin read cannot be
/// cancelled and would hold runtime shutdown until the next line.
pub fn spawn_stdin_reader() -> std::io::Result<mpsc::Receiver<String>> {
    let (tx, rx) = mpsc::channel(INPUT_QUEUE);
    std::thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.blocking_send(line).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "reading stdin failed");
                        return;
                    }
                }
            }
        })?;
    Ok(rx)
}

/// Submit every non-empty input line. Returns at end of input or once the router stops.
pub async fn run_input(router: Arc<MeshRouter>, mut lines: mpsc::Receiver<String>) {
    while let Some(line) = lines.recv().await {
        if line.is_empty() {
            continue;
        }
        match router.submit_outbound(line.as_bytes()) {
            Ok(id) => debug!(id = %id, "message sent"),
            Err(RouterError::Stopped) => break,
            Err(e) => warn!(error = %e, "message not sent"),
        }
    }
}

/// Poll the router every `interval` and write each delivered payload as one line.
pub async fn run_output<W: AsyncWrite + Unpin>(
    router: Arc<MeshRouter>,
    mut out: W,
    interval: Duration,
) -> std::io::Result<()> {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let mut wrote = false;
        while let Some(payload) = router.next_message() {
            out.write_all(String::from_utf8_lossy(&payload).as_bytes())
                .await?;
            out.write_all(b"\n").await?;
            wrote = true;
        }
        if wrote {
            out.flush().await?;
        }
        if router.is_stopped() && router.pending_messages() == 0 {
            return Ok(());
        }
    }
}
