//! WebSocket gateway: transport only.
//!
//! Each socket gets one writer task fed by the connection's outbound channel,
//! so acks and broadcasts share a single ordered stream.  The first inbound
//! frame must be `hello`; anything else closes the socket.  After the
//! handshake, frames are parsed, handed to the engine, and the resulting acks
//! queued behind whatever broadcasts are already in flight.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use causerie_shared::protocol::{Ack, ClientCommand, CommandFrame};
use causerie_shared::{ChatError, ConnectionId, UserId};

use crate::api::AppState;
use crate::registry::Outbound;

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = ConnectionId::new();
    let (mut sink, mut stream) = socket.split();

    // Hello-first handshake.
    let Some(text) = next_text(&mut stream).await else {
        return;
    };
    let (user_id, display_name, hello_seq) = match serde_json::from_str::<CommandFrame>(&text) {
        Ok(CommandFrame { seq, command: ClientCommand::Hello { user_id, display_name } }) => {
            (user_id, display_name, seq)
        }
        Ok(CommandFrame { seq, .. }) => {
            send_frame(&mut sink, &Outbound::Ack(Ack::err(seq, &ChatError::Auth))).await;
            return;
        }
        Err(e) => {
            let err = ChatError::Validation(format!("malformed frame: {e}"));
            send_frame(&mut sink, &Outbound::Ack(Ack::err(None, &err))).await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    if let Err(e) = state
        .engine
        .connect(conn_id, user_id, &display_name, tx.clone())
        .await
    {
        send_frame(&mut sink, &Outbound::Ack(Ack::err(hello_seq, &e))).await;
        return;
    }
    tracing::info!(conn = %conn_id, user = %user_id.short(), "session opened");

    // Single writer per socket; the sink moves in here and everything
    // outbound goes through the channel from now on.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if !send_frame(&mut sink, &frame).await {
                break;
            }
        }
    });

    let hello_ack = Ack::ok(
        hello_seq,
        Some(serde_json::json!({ "connectionId": conn_id })),
    );
    if tx.send(Outbound::Ack(hello_ack)).is_ok() {
        read_loop(&mut stream, &state, user_id, &tx).await;
    }

    state.engine.disconnect(conn_id).await;
    tracing::info!(conn = %conn_id, user = %user_id.short(), "session closed");

    // The registry dropped its sender in disconnect; dropping ours lets the
    // writer drain and exit.
    drop(tx);
    let _ = writer.await;
}

async fn read_loop(
    stream: &mut SplitStream<WebSocket>,
    state: &AppState,
    user_id: UserId,
    tx: &mpsc::UnboundedSender<Outbound>,
) {
    while let Some(text) = next_text(stream).await {
        let ack = match serde_json::from_str::<CommandFrame>(&text) {
            Ok(frame) => state.engine.handle_command(user_id, frame).await,
            Err(e) => Some(Ack::err(
                None,
                &ChatError::Validation(format!("malformed frame: {e}")),
            )),
        };
        if let Some(ack) = ack {
            if tx.send(Outbound::Ack(ack)).is_err() {
                break;
            }
        }
    }
}

/// Next text payload, skipping control frames.  `None` means the peer is gone.
async fn next_text(stream: &mut SplitStream<WebSocket>) -> Option<String> {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => return Some(text.to_string()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

/// Returns false when the socket write half is gone.
async fn send_frame(
    sink: &mut (impl SinkExt<Message> + Unpin),
    frame: &Outbound,
) -> bool {
    let json = match frame {
        Outbound::Ack(ack) => serde_json::to_string(ack),
        Outbound::Event(event) => serde_json::to_string(event),
    };
    match json {
        Ok(json) => sink.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "outbound frame failed to serialize");
            true
        }
    }
}
