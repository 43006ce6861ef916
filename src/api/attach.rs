//! WebSocket attach proxy.
//!
//! GET `/v1/instances/{id}/attach?token=…` — the token in the query string
//! is the sole credential. After validation the connection upgrades and
//! three pumps bridge frames to the terminal session: client→stdin,
//! stdout→client, and stderr→client when the binding exposes a distinct
//! stderr. A writer task owns the sink, interleaving pump output with a
//! 30-second keepalive ping; a stale pong tears the session down. The
//! first flow to finish ends the session and aborts the rest.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::TokenType;
use crate::terminal::TerminalSession;

use super::error::ApiError;
use super::AppState;

/// Keepalive ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Read buffer size for terminal output pumps.
const PUMP_BUFFER: usize = 4096;

/// Outbound frame channel capacity.
const OUTBOUND_CAPACITY: usize = 32;

/// GET /v1/instances/{id}/attach — authenticate, bind, upgrade, pump.
pub async fn attach(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let token = params
        .get("token")
        .ok_or_else(|| ApiError::Unauthorized("missing token".to_owned()))?;

    let claims = state.tokens.validate(token)?;
    if claims.typ != TokenType::Instance {
        return Err(ApiError::Unauthorized("instance token required".to_owned()));
    }
    if claims.instance_id.as_deref() != Some(id.as_str()) {
        return Err(ApiError::Forbidden(
            "token does not grant access to this instance".to_owned(),
        ));
    }

    state.provider.get_instance(&id).await?;

    // Bind before upgrading so a failed binding still maps to an HTTP
    // error instead of an immediately closed socket.
    let session = state.binder.bind(&id).await?;

    info!(instance_id = %id, "terminal attach accepted");
    Ok(ws.on_upgrade(move |socket| proxy_session(socket, session, id)))
}

/// Bridge one WebSocket to one terminal session until either side ends.
async fn proxy_session(socket: WebSocket, session: TerminalSession, instance_id: String) {
    let TerminalSession {
        mut input,
        mut stdout,
        stderr,
    } = session;

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
    let last_pong = Arc::new(Mutex::new(Instant::now()));

    // Writer: owns the sink; interleaves pump frames with keepalive pings
    // and tears down when pongs stop arriving.
    let pong_seen = Arc::clone(&last_pong);
    let mut writer = tokio::spawn(async move {
        let mut ping_timer = tokio::time::interval(PING_INTERVAL);
        ping_timer.tick().await;
        loop {
            tokio::select! {
                frame = out_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if ws_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                _ = ping_timer.tick() => {
                    let stale = pong_seen
                        .lock()
                        .map(|at| at.elapsed() > PING_INTERVAL.saturating_mul(2))
                        .unwrap_or(true);
                    if stale {
                        debug!("keepalive pong overdue; closing session");
                        break;
                    }
                    if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Client → terminal stdin.
    let mut reader = tokio::spawn(async move {
        while let Some(frame) = ws_rx.next().await {
            match frame {
                Ok(Message::Binary(data)) => {
                    if input.write_all(&data).await.is_err() {
                        break;
                    }
                    let _ = input.flush().await;
                }
                Ok(Message::Text(text)) => {
                    if input.write_all(text.as_bytes()).await.is_err() {
                        break;
                    }
                    let _ = input.flush().await;
                }
                Ok(Message::Pong(_)) => {
                    if let Ok(mut at) = last_pong.lock() {
                        *at = Instant::now();
                    }
                }
                Ok(Message::Ping(_)) => {} // The socket answers automatically.
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    debug!(error = %e, "attach socket read error");
                    break;
                }
            }
        }
    });

    // Terminal stdout → client.
    let stdout_tx = out_tx.clone();
    let mut stdout_pump = tokio::spawn(async move {
        let mut buf = vec![0_u8; PUMP_BUFFER];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdout_tx
                        .send(Message::Binary(buf[..n].to_vec()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    });

    // Terminal stderr → client, when the binding exposes one.
    let mut stderr_pump = stderr.map(|mut stderr| {
        let stderr_tx = out_tx.clone();
        tokio::spawn(async move {
            let mut buf = vec![0_u8; PUMP_BUFFER];
            loop {
                match stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stderr_tx
                            .send(Message::Binary(buf[..n].to_vec()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        })
    });
    drop(out_tx);

    // First finished flow ends the session.
    tokio::select! {
        result = &mut writer => {
            log_flow_exit("writer", result);
        }
        result = &mut reader => {
            log_flow_exit("reader", result);
        }
        result = &mut stdout_pump => {
            log_flow_exit("stdout", result);
        }
        result = async {
            match &mut stderr_pump {
                Some(pump) => pump.await,
                None => std::future::pending().await,
            }
        } => {
            log_flow_exit("stderr", result);
        }
    }

    writer.abort();
    reader.abort();
    stdout_pump.abort();
    if let Some(pump) = stderr_pump {
        pump.abort();
    }

    info!(instance_id = %instance_id, "terminal session closed");
}

fn log_flow_exit(flow: &str, result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if !e.is_cancelled() {
            warn!(flow, error = %e, "attach flow panicked");
        }
    }
}
