use crate::{bridge::Session, server::AppState};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use object_detection::Detector;
use tracing::instrument;

// Close frame payloads are limited to 125 bytes, two of which hold the code.
const MAX_CLOSE_REASON: usize = 123;

#[instrument(skip(ws, state))]
pub async fn object_detection_ws<D: Detector>(
    ws: WebSocketUpgrade,
    State(state): State<AppState<D>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket<D: Detector>(socket: WebSocket, state: AppState<D>) {
    let (mut sender, mut receiver) = socket.split();
    let session = Session::new(
        state.detector.clone(),
        state.session_config.frame_buffer_capacity,
        state.metrics.clone(),
    );

    match session.run(&mut receiver, &mut sender).await {
        Ok(()) => tracing::info!("Detection session closed by client"),
        Err(err) => {
            tracing::error!("Detection session failed: {}", err);
            let frame = CloseFrame {
                code: close_code::ERROR,
                reason: close_reason(&err.to_string()).into(),
            };
            if let Err(e) = sender.send(Message::Close(Some(frame))).await {
                tracing::debug!("Failed to send close frame: {}", e);
            }
        }
    }
}

fn close_reason(message: &str) -> String {
    let mut end = message.len().min(MAX_CLOSE_REASON);
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}
