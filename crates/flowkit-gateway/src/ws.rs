//! WebSocket client protocol (§6): one duplex connection per client, JSON
//! frames. A background task per active subscription forwards TopicBus
//! deliveries into a single writer task so concurrent run/stats streams
//! don't race on the socket.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use flowkit_storage::StreamReadOptions;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn frame(value: Value) -> Message {
    Message::Text(value.to_string())
}

fn error_frame(message: impl Into<String>) -> Message {
    frame(json!({"type": "error", "message": message.into()}))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let mut writer: JoinHandle<()> = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let _ = tx.send(frame(json!({"type": "connected"})));

    let mut run_subs: HashMap<(String, Uuid), JoinHandle<()>> = HashMap::new();
    let mut stats_sub: Option<JoinHandle<()>> = None;

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => {
                let parsed: Result<Value, _> = serde_json::from_str(&text);
                let Ok(value) = parsed else {
                    let _ = tx.send(error_frame("invalid JSON frame"));
                    continue;
                };
                handle_client_frame(&state, &tx, &mut run_subs, &mut stats_sub, value).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    for (_, handle) in run_subs.drain() {
        handle.abort();
    }
    if let Some(handle) = stats_sub.take() {
        handle.abort();
    }
    writer.abort();
}

async fn handle_client_frame(
    state: &AppState,
    tx: &mpsc::UnboundedSender<Message>,
    run_subs: &mut HashMap<(String, Uuid), JoinHandle<()>>,
    stats_sub: &mut Option<JoinHandle<()>>,
    value: Value,
) {
    let msg_type = value.get("type").and_then(Value::as_str).unwrap_or_default();
    match msg_type {
        "subscribe" => {
            let (Some(flow_name), Some(run_id)) = (field_str(&value, "flowName"), field_uuid(&value, "runId")) else {
                let _ = tx.send(error_frame("subscribe requires flowName and runId"));
                return;
            };

            let prefix = state.engine.events.prefix().to_string();
            let subject = flowkit_engine::naming::run_stream(&prefix, run_id);
            let history = match state.engine.events.store().stream_read(&subject, StreamReadOptions::default()).await {
                Ok(events) => events,
                Err(err) => {
                    let _ = tx.send(error_frame(format!("failed to read history: {err}")));
                    return;
                }
            };
            let _ = tx.send(frame(json!({"type": "history", "events": history})));

            let topic = flowkit_engine::naming::flow_events_topic(&prefix, run_id);
            let bus = state.engine.events.bus().clone();
            let forward_tx = tx.clone();
            let handle = tokio::spawn(async move {
                let Ok(mut sub) = bus.subscribe(&topic).await else { return };
                while let Some(event) = sub.recv().await {
                    if forward_tx.send(frame(json!({"type": "event", "event": event.payload}))).is_err() {
                        break;
                    }
                }
            });
            if let Some(old) = run_subs.insert((flow_name.clone(), run_id), handle) {
                old.abort();
            }
            let _ = tx.send(frame(json!({"type": "subscribed", "flowName": flow_name, "runId": run_id})));
        }
        "unsubscribe" => {
            let (Some(flow_name), Some(run_id)) = (field_str(&value, "flowName"), field_uuid(&value, "runId")) else {
                let _ = tx.send(error_frame("unsubscribe requires flowName and runId"));
                return;
            };
            if let Some(handle) = run_subs.remove(&(flow_name.clone(), run_id)) {
                handle.abort();
            }
            let _ = tx.send(frame(json!({"type": "unsubscribed", "flowName": flow_name, "runId": run_id})));
        }
        "subscribe.stats" => {
            if let Some(old) = stats_sub.take() {
                old.abort();
            }

            match state.engine.facade.list_flows().await {
                Ok(flows) => {
                    for flow in flows {
                        let _ = tx.send(frame(json!({"type": "flow.stats.initial", "flow": flow})));
                    }
                }
                Err(err) => {
                    let _ = tx.send(error_frame(format!("failed to list flows: {err}")));
                }
            }

            let prefix = state.engine.events.prefix().to_string();
            let topic = flowkit_engine::naming::flow_stats_topic(&prefix);
            let bus = state.engine.events.bus().clone();
            let forward_tx = tx.clone();
            let handle = tokio::spawn(async move {
                let Ok(mut sub) = bus.subscribe(&topic).await else { return };
                while let Some(event) = sub.recv().await {
                    if forward_tx.send(frame(json!({"type": "flow.stats.update", "event": event.payload}))).is_err() {
                        break;
                    }
                }
            });
            *stats_sub = Some(handle);
            let _ = tx.send(frame(json!({"type": "stats.subscribed"})));
        }
        "unsubscribe.stats" => {
            if let Some(handle) = stats_sub.take() {
                handle.abort();
            }
            let _ = tx.send(frame(json!({"type": "stats.unsubscribed"})));
        }
        "ping" => {
            let _ = tx.send(frame(json!({"type": "pong"})));
        }
        other => {
            let _ = tx.send(error_frame(format!("unknown message type '{other}'")));
        }
    }
}

fn field_str(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn field_uuid(value: &Value, key: &str) -> Option<Uuid> {
    value.get(key).and_then(Value::as_str).and_then(|s| s.parse().ok())
}
