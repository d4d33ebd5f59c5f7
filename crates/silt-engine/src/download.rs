//! Download stream driver.
//!
//! One stream is one long-lived `GET /download` with cache-defeating
//! headers, read chunk by chunk. Every chunk length is credited to the
//! stream's counter; the driver exits on cancellation, body end, or
//! transport error, and reports back to the manager exactly once.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::events::Direction;
use crate::manager::{StreamManager, StreamShared};

pub(crate) struct DownloadCtx {
    pub(crate) manager: Arc<StreamManager>,
    pub(crate) shared: Arc<StreamShared>,
    pub(crate) cancel: watch::Receiver<bool>,
}

pub(crate) async fn run(mut ctx: DownloadCtx) {
    let id = ctx.shared.id();
    let url = format!("{}/download", ctx.manager.origin());
    let chunk_delay = ctx.manager.download_cfg().chunk_delay;
    let nonce: u64 = rand::random();

    let request = ctx
        .manager
        .http()
        .get(&url)
        .query(&[("nonce", nonce.to_string())])
        .header("Cache-Control", "no-store")
        .header("Pragma", "no-cache")
        .header("X-Stream-ID", id.to_string())
        .header("X-Priority", "bulk");

    let response = tokio::select! {
        _ = ctx.cancel.changed() => None,
        resp = request.send() => match resp {
            Ok(resp) if resp.status().is_success() => Some(resp),
            Ok(resp) => {
                tracing::debug!(stream_id = id, status = %resp.status(), "download rejected");
                None
            }
            Err(err) => {
                tracing::debug!(stream_id = id, error = %err, "download request failed");
                None
            }
        },
    };

    if let Some(response) = response {
        let mut body = response.bytes_stream();
        loop {
            if *ctx.cancel.borrow() {
                break;
            }
            tokio::select! {
                _ = ctx.cancel.changed() => break,
                chunk = body.next() => match chunk {
                    Some(Ok(bytes)) => {
                        ctx.shared.credit(bytes.len());
                        if let Some(delay) = chunk_delay {
                            sleep(delay).await;
                        }
                    }
                    Some(Err(err)) => {
                        tracing::debug!(stream_id = id, error = %err, "download body error");
                        break;
                    }
                    None => break,
                },
            }
        }
        // Dropping the body aborts the in-flight request; the origin sees
        // the connection close.
    }

    ctx.manager.finish_stream(id, Direction::Download);
}
