//! Server-side RFB handshake and message routing for one viewer connection.

use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::{Buf, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};

use crate::backend::BackendLink;
use crate::registry::ConnectionRegistry;
use crate::rfb::wire::{self, ClientFrame, ServerInit};

/// WebSocket close codes, one per rejection cause so clients can tell them
/// apart.
pub mod close_code {
    pub const INVALID_PARAMS: u16 = 4000;
    pub const INVALID_API_KEY: u16 = 4001;
    pub const CAPACITY_EXCEEDED: u16 = 4002;
    pub const BAD_PROTOCOL_VERSION: u16 = 4003;
    pub const UNSUPPORTED_SECURITY: u16 = 4004;
    pub const BACKEND_NOT_READY: u16 = 4005;
    pub const KEY_REVOKED: u16 = 4006;
    pub const BACKEND_LOST: u16 = 4007;
    pub const QUEUE_OVERFLOW: u16 = 4008;
    pub const HANDSHAKE_TIMEOUT: u16 = 4009;
    pub const SUPERSEDED: u16 = 4010;
    /// Standard WebSocket "message too big".
    pub const MESSAGE_TOO_BIG: u16 = 1009;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: &'static str,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub handshake_timeout: Duration,
    /// When false the timeout only logs, matching long-standing relay
    /// behavior; when true the viewer is closed.
    pub enforce_handshake_timeout: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            enforce_handshake_timeout: false,
        }
    }
}

/// Security-type offer sent to every viewer: exactly one type, "None". The
/// relay authenticates viewers with API keys, never with VNC passwords.
const SECURITY_OFFER: &[u8] = &[1, wire::SECURITY_TYPE_NONE];
const NEUTRAL_ACK: &[u8] = &[0, 0, 0, 0];

/// Cap on buffered, still-unframed viewer input.
const MAX_PENDING_INPUT: usize = 1 << 20;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum SessionState {
    #[default]
    AwaitingVersion,
    AwaitingSecurityType,
    AwaitingInit,
    Authenticated,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionAction {
    /// Bytes for the viewer socket.
    Send(Bytes),
    /// Bytes for the backend socket.
    Forward(Bytes),
}

/// Handshake and routing state machine for one viewer, driven purely by
/// inbound chunks. The caller supplies the backend's server-init and the
/// current control state at each dispatch.
#[derive(Default)]
pub struct SessionHandshake {
    state: SessionState,
    buf: BytesMut,
}

impl SessionHandshake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == SessionState::Authenticated
    }

    /// Dispatches one inbound chunk. Returns true when this chunk completed
    /// the handshake. Messages may arrive split or coalesced across chunks.
    pub fn on_data(
        &mut self,
        chunk: &[u8],
        server_init: Option<&ServerInit>,
        has_control: bool,
        actions: &mut Vec<SessionAction>,
    ) -> Result<bool, CloseReason> {
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > MAX_PENDING_INPUT {
            return Err(CloseReason {
                code: close_code::MESSAGE_TOO_BIG,
                reason: "client message too large",
            });
        }

        let mut newly_authenticated = false;
        loop {
            match self.state {
                SessionState::AwaitingVersion => {
                    if self.buf.len() < 12 {
                        break;
                    }
                    let version = self.buf.split_to(12);
                    if !wire::is_supported_version(&version) {
                        return Err(CloseReason {
                            code: close_code::BAD_PROTOCOL_VERSION,
                            reason: "unsupported protocol version",
                        });
                    }
                    actions.push(SessionAction::Send(Bytes::from_static(SECURITY_OFFER)));
                    self.state = SessionState::AwaitingSecurityType;
                }
                SessionState::AwaitingSecurityType => {
                    if self.buf.is_empty() {
                        break;
                    }
                    let choice = self.buf.split_to(1)[0];
                    if choice != wire::SECURITY_TYPE_NONE {
                        return Err(CloseReason {
                            code: close_code::UNSUPPORTED_SECURITY,
                            reason: "unsupported security type",
                        });
                    }
                    actions.push(SessionAction::Send(Bytes::from_static(NEUTRAL_ACK)));
                    self.state = SessionState::AwaitingInit;
                }
                SessionState::AwaitingInit => {
                    if self.buf.is_empty() {
                        break;
                    }
                    let Some(init) = server_init else {
                        return Err(CloseReason {
                            code: close_code::BACKEND_NOT_READY,
                            reason: "backend desktop is not ready",
                        });
                    };
                    // Shared flag; the value is ignored because the relay
                    // always shares the one backend session.
                    self.buf.advance(1);
                    actions.push(SessionAction::Send(init.encode()));
                    self.state = SessionState::Authenticated;
                    newly_authenticated = true;
                }
                SessionState::Authenticated => match wire::frame_client_message(&self.buf) {
                    ClientFrame::Incomplete => break,
                    ClientFrame::Opaque => {
                        // Unknown type: no length is derivable, so the rest of
                        // the buffer moves as one opaque unit.
                        let payload = self.buf.split().freeze();
                        if has_control {
                            actions.push(SessionAction::Forward(payload));
                        }
                    }
                    ClientFrame::Message { kind, len } => {
                        let message = self.buf.split_to(len).freeze();
                        match kind {
                            wire::MSG_SET_PIXEL_FORMAT | wire::MSG_SET_ENCODINGS => {
                                // The pixel format is fixed by the backend;
                                // acknowledge and swallow.
                                actions.push(SessionAction::Send(Bytes::from_static(NEUTRAL_ACK)));
                            }
                            wire::MSG_FRAMEBUFFER_UPDATE_REQUEST => {
                                // Every viewer may request refreshes.
                                actions.push(SessionAction::Forward(message));
                            }
                            _ => {
                                // Key, pointer and clipboard input from
                                // non-controlling viewers is dropped silently.
                                if has_control {
                                    actions.push(SessionAction::Forward(message));
                                }
                            }
                        }
                    }
                },
            }
        }
        Ok(newly_authenticated)
    }
}

pub(crate) async fn reject(mut socket: WebSocket, reason: CloseReason) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: reason.code,
            reason: reason.reason.into(),
        })))
        .await;
}

/// Runs one admitted viewer connection to completion.
pub async fn serve(
    socket: WebSocket,
    client_id: String,
    api_key: String,
    backend: BackendLink,
    registry: ConnectionRegistry,
    config: SessionConfig,
) {
    let mut admission = match registry.admit(&client_id, &api_key).await {
        Ok(admission) => admission,
        Err(reason) => {
            reject(socket, reason).await;
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();
    if sink
        .send(Message::Binary(Bytes::from_static(
            wire::PROTOCOL_VERSION_3_8,
        )))
        .await
        .is_err()
    {
        registry.remove(&client_id, admission.connection_id).await;
        return;
    }

    let mut handshake = SessionHandshake::new();
    let mut actions = Vec::new();
    let mut exit: Option<CloseReason> = None;
    let deadline = tokio::time::sleep(config.handshake_timeout);
    tokio::pin!(deadline);
    let mut timer_armed = true;

    'session: loop {
        tokio::select! {
            frame = admission.outbound.recv() => match frame {
                Some(bytes) => {
                    if sink.send(Message::Binary(bytes)).await.is_err() {
                        break 'session;
                    }
                }
                None => {
                    // The registry dropped our handle; pick up the close code
                    // if one was queued before the drop.
                    if let Ok(code) = admission.close.try_recv() {
                        exit = Some(CloseReason {
                            code,
                            reason: "connection closed by relay",
                        });
                    }
                    break 'session;
                }
            },
            code = admission.close.recv() => {
                if let Some(code) = code {
                    exit = Some(CloseReason {
                        code,
                        reason: "connection closed by relay",
                    });
                }
                break 'session;
            },
            () = &mut deadline, if timer_armed => {
                timer_armed = false;
                if !handshake.is_authenticated() {
                    if config.enforce_handshake_timeout {
                        exit = Some(CloseReason {
                            code: close_code::HANDSHAKE_TIMEOUT,
                            reason: "handshake timed out",
                        });
                        break 'session;
                    }
                    tracing::warn!(
                        client = %client_id,
                        timeout = ?config.handshake_timeout,
                        "viewer handshake still incomplete"
                    );
                }
            },
            message = stream.next() => {
                let data = match message {
                    Some(Ok(Message::Binary(data))) => data,
                    // Some WebSocket clients send the version exchange as text.
                    Some(Ok(Message::Text(text))) => Bytes::copy_from_slice(text.as_bytes()),
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break 'session,
                    Some(Err(error)) => {
                        tracing::debug!(client = %client_id, %error, "websocket receive error");
                        break 'session;
                    }
                };

                let server_init = if handshake.is_authenticated() {
                    None
                } else {
                    backend.server_init().await
                };
                let has_control = admission.has_control.load(Ordering::Relaxed);
                actions.clear();
                match handshake.on_data(&data, server_init.as_ref(), has_control, &mut actions) {
                    Ok(newly_authenticated) => {
                        for action in actions.drain(..) {
                            match action {
                                SessionAction::Send(bytes) => {
                                    if sink.send(Message::Binary(bytes)).await.is_err() {
                                        break 'session;
                                    }
                                }
                                SessionAction::Forward(bytes) => backend.write(bytes).await,
                            }
                        }
                        if newly_authenticated {
                            admission.authenticated.store(true, Ordering::Relaxed);
                            tracing::debug!(client = %client_id, "viewer authenticated");
                        }
                    }
                    Err(reason) => {
                        exit = Some(reason);
                        break 'session;
                    }
                }
            }
        }
    }

    if let Some(reason) = exit {
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: reason.code,
                reason: reason.reason.into(),
            })))
            .await;
    }
    registry.remove(&client_id, admission.connection_id).await;
}
