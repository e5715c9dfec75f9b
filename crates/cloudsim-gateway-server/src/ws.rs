//! Interactive exec sessions over WebSocket.
//!
//! The socket is a byte pipe: text and binary frames go to the container's
//! stdin, output chunks come back as binary frames. The session is opened
//! before the upgrade so policy errors (not running, session already open)
//! surface as normal HTTP errors instead of an immediately-closed socket.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use tracing::{debug, info};

use cloudsim_orchestrator::ExecSession;

use crate::{ApiError, AppState};

pub(crate) async fn exec_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let session = state.gateway.open_session(&id, None).await?;
    info!(instance_id = %id, "websocket exec session accepted");
    Ok(ws.on_upgrade(move |socket| pump(socket, session)))
}

/// Shuttle bytes both ways until either side hangs up or the lifecycle
/// manager force-closes the session.
async fn pump(mut socket: WebSocket, mut session: ExecSession) {
    loop {
        tokio::select! {
            frame = socket.recv() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if session.send(text.as_bytes()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    if session.send(&bytes).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            },
            chunk = session.recv() => match chunk {
                Some(Ok(bytes)) => {
                    if socket.send(Message::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                // Process exited or the session was force-closed.
                Some(Err(_)) | None => break,
            },
        }
    }
    debug!(instance_id = %session.instance_id(), "websocket exec session ended");
    session.close().await;
    let _ = socket.send(Message::Close(None)).await;
}
