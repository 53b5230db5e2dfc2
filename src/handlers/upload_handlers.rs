//! Upload control channel over a WebSocket.
//!
//! - GET /cryptic/{project} -> upgrade; MessagePack frames both ways
//!
//! One task writes encoded events to the socket while the connection task
//! decodes incoming frames and dispatches them to the session. Closing the
//! socket cancels the session's unfinished uploads.

use std::sync::Arc;

use axum::{
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::HeaderMap,
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::{SessionQuery, session_id};
use crate::{
    errors::AppError,
    models::messages::{ClientCommand, ServerEvent},
    services::{session::UploadSession, transfer_service::TransferService},
};

/// `GET /cryptic/{project}`
pub async fn upload_socket(
    State(service): State<TransferService>,
    Path(project): Path<String>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, AppError> {
    let session = service.session(session_id(&headers, &query).as_deref())?;
    let ws = ws.map_err(|rejection| AppError::new(rejection.status(), rejection.body_text()))?;
    tracing::debug!(%project, "upload channel requested");
    Ok(ws.on_upgrade(move |socket| run_channel(socket, session)))
}

async fn run_channel(socket: WebSocket, session: Arc<UploadSession>) {
    let (mut sink, mut stream) = socket.split();
    let (events, mut outbound) = mpsc::unbounded_channel::<ServerEvent>();

    let writer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let frame = match event.encode() {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::warn!(error = %err, "could not encode upload event");
                    continue;
                }
            };
            if let Err(err) = sink.send(Message::Binary(frame.into())).await {
                tracing::debug!(error = %err, "upload channel write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Binary(frame)) => match ClientCommand::decode(&frame) {
                Ok(command) => {
                    let (container, object) = command.target();
                    tracing::trace!(container, object, "upload command received");
                    session.dispatch(command, &events).await
                }
                Err(err) => {
                    tracing::warn!(error = %err, len = frame.len(), "ignoring undecodable frame")
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(error = %err, "upload channel read failed");
                break;
            }
        }
    }

    session.close_uploads().await;
    writer.abort();
    tracing::debug!(project = %session.project, "upload channel closed");
}
