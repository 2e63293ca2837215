//! WebSocket console endpoint
//!
//! Frames are event-typed JSON. A client opens the socket, sends
//! `console.connect {vmName}`, then exchanges `console.output` /
//! `console.input` frames until either side closes. Output fans out to every
//! client of the same VM through the console hub; input is forwarded as-is,
//! last writer wins.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::Extension;
use axum::response::Response;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::console::ConsoleClient;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum ConsoleFrame {
    #[serde(rename = "console.connect")]
    Connect {
        #[serde(rename = "vmName")]
        vm_name: String,
    },
    #[serde(rename = "console.input")]
    Input { text: String },
    #[serde(rename = "console.output")]
    Output { text: String },
    #[serde(rename = "console.disconnected")]
    Disconnected,
    #[serde(rename = "console.error")]
    Error { error: String },
}

pub async fn console_ws(
    ws: WebSocketUpgrade,
    Extension(state): Extension<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_session(socket, state))
}

async fn handle_session(mut socket: WebSocket, state: AppState) {
    // The first frame selects the VM.
    let vm_name = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<ConsoleFrame>(&text) {
                    Ok(ConsoleFrame::Connect { vm_name }) => break vm_name,
                    Ok(_) | Err(_) => {
                        let _ = send_frame(
                            &mut socket,
                            &ConsoleFrame::Error {
                                error: "expected console.connect".into(),
                            },
                        )
                        .await;
                        return;
                    }
                }
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            _ => return,
        }
    };

    let mut client = match state.control.console_attach(&vm_name).await {
        Ok(client) => client,
        Err(e) => {
            let _ = send_frame(
                &mut socket,
                &ConsoleFrame::Error {
                    error: e.code().to_string(),
                },
            )
            .await;
            return;
        }
    };
    tracing::debug!(vm = %vm_name, "console websocket attached");

    loop {
        tokio::select! {
            output = client.recv() => match output {
                Some(data) => {
                    let frame = ConsoleFrame::Output {
                        text: String::from_utf8_lossy(&data).into_owned(),
                    };
                    if send_frame(&mut socket, &frame).await.is_err() {
                        return;
                    }
                }
                None => {
                    let frame = match client.close_reason().as_deref() {
                        Some("disconnected") | None => ConsoleFrame::Disconnected,
                        Some(reason) => ConsoleFrame::Error {
                            error: reason.to_string(),
                        },
                    };
                    let _ = send_frame(&mut socket, &frame).await;
                    return;
                }
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(ConsoleFrame::Input { text }) =
                        serde_json::from_str::<ConsoleFrame>(&text)
                    {
                        if forward_input(&client, text.into_bytes()).await.is_err() {
                            let _ = send_frame(&mut socket, &ConsoleFrame::Disconnected).await;
                            return;
                        }
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if forward_input(&client, data).await.is_err() {
                        let _ = send_frame(&mut socket, &ConsoleFrame::Disconnected).await;
                        return;
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
            },
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &ConsoleFrame) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_string());
    socket.send(Message::Text(text)).await
}

async fn forward_input(
    client: &ConsoleClient,
    data: Vec<u8>,
) -> crate::error::KestrelResult<()> {
    client.send_input(Bytes::from(data)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip_their_tags() {
        let connect: ConsoleFrame =
            serde_json::from_str(r#"{"type":"console.connect","vmName":"web-1"}"#).unwrap();
        assert!(matches!(connect, ConsoleFrame::Connect { ref vm_name } if vm_name == "web-1"));

        let output = ConsoleFrame::Output {
            text: "login:".into(),
        };
        let raw = serde_json::to_string(&output).unwrap();
        assert!(raw.contains(r#""type":"console.output""#));

        let error = ConsoleFrame::Error {
            error: "slow_consumer".into(),
        };
        let raw = serde_json::to_string(&error).unwrap();
        assert!(raw.contains("slow_consumer"));
    }
}
