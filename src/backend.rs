//! Client-side RFB handshake and forwarding for the single backend
//! connection.
//!
//! The relay owns exactly one TCP connection to the real VNC server. The
//! handshake is driven purely by inbound bytes through `BackendHandshake`;
//! once it reaches forwarding, every chunk fans out unmodified to the
//! authenticated viewers. Any malformed byte at any stage is fatal: the link
//! marks itself disconnected, drops the cached server-init and closes all
//! viewer sessions. There is no reconnect; the operator restarts the process.

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};

use crate::events::RelayEvents;
use crate::registry::ConnectionRegistry;
use crate::rfb::auth;
use crate::rfb::wire::{self, ProtocolError, ServerInit};
use crate::session::close_code;

const READ_BUFFER_LEN: usize = 16 * 1024;
const WRITE_QUEUE_FRAMES: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BackendState {
    AwaitingVersion,
    AwaitingSecurityTypes,
    AwaitingChallenge,
    AwaitingSecurityResult,
    AwaitingServerInit,
    Forwarding,
}

#[derive(Debug)]
pub enum LinkAction {
    /// Bytes to write to the backend socket.
    Send(Bytes),
    /// Handshake complete; the captured server-init.
    Ready(Box<ServerInit>),
    /// Post-handshake bytes for all authenticated viewers.
    Broadcast(Bytes),
}

/// Handshake state machine for the backend connection, driven purely by
/// inbound chunks.
pub struct BackendHandshake {
    state: BackendState,
    password: Option<String>,
    buf: BytesMut,
}

impl BackendHandshake {
    pub fn new(password: Option<String>) -> Self {
        Self {
            state: BackendState::AwaitingVersion,
            password,
            buf: BytesMut::new(),
        }
    }

    pub fn is_forwarding(&self) -> bool {
        self.state == BackendState::Forwarding
    }

    pub fn on_data(
        &mut self,
        chunk: &[u8],
        actions: &mut Vec<LinkAction>,
    ) -> Result<(), ProtocolError> {
        if self.state == BackendState::Forwarding && self.buf.is_empty() {
            actions.push(LinkAction::Broadcast(Bytes::copy_from_slice(chunk)));
            return Ok(());
        }

        self.buf.extend_from_slice(chunk);
        loop {
            match self.state {
                BackendState::AwaitingVersion => {
                    if self.buf.len() < 12 {
                        break;
                    }
                    let version = self.buf.split_to(12);
                    if !wire::is_supported_version(&version) {
                        return Err(ProtocolError::BadVersion(
                            String::from_utf8_lossy(&version).into_owned(),
                        ));
                    }
                    actions.push(LinkAction::Send(Bytes::from_static(
                        wire::PROTOCOL_VERSION_3_8,
                    )));
                    self.state = BackendState::AwaitingSecurityTypes;
                }
                BackendState::AwaitingSecurityTypes => {
                    let Some(&count) = self.buf.first() else {
                        break;
                    };
                    let count = count as usize;
                    if count == 0 {
                        return Err(ProtocolError::NoUsableSecurityType);
                    }
                    if self.buf.len() < 1 + count {
                        break;
                    }
                    let offered = self.buf[1..1 + count].to_vec();
                    self.buf.advance(1 + count);

                    // "None" always wins, whatever position the server lists
                    // it in.
                    if offered.contains(&wire::SECURITY_TYPE_NONE) {
                        actions.push(LinkAction::Send(Bytes::from_static(&[
                            wire::SECURITY_TYPE_NONE,
                        ])));
                        self.state = BackendState::AwaitingSecurityResult;
                    } else if offered.contains(&wire::SECURITY_TYPE_VNC_AUTH) {
                        if self.password.is_none() {
                            return Err(ProtocolError::PasswordRequired);
                        }
                        actions.push(LinkAction::Send(Bytes::from_static(&[
                            wire::SECURITY_TYPE_VNC_AUTH,
                        ])));
                        self.state = BackendState::AwaitingChallenge;
                    } else {
                        return Err(ProtocolError::NoUsableSecurityType);
                    }
                }
                BackendState::AwaitingChallenge => {
                    if self.buf.len() < 16 {
                        break;
                    }
                    let mut challenge = [0u8; 16];
                    challenge.copy_from_slice(&self.buf.split_to(16));
                    let password = self.password.as_deref().unwrap_or("");
                    let response = auth::encrypt_challenge(password, &challenge);
                    actions.push(LinkAction::Send(Bytes::copy_from_slice(&response)));
                    self.state = BackendState::AwaitingSecurityResult;
                }
                BackendState::AwaitingSecurityResult => {
                    if self.buf.len() < 4 {
                        break;
                    }
                    let code = self.buf.get_u32();
                    if code != 0 {
                        return Err(ProtocolError::AuthFailed(code));
                    }
                    actions.push(LinkAction::Send(Bytes::from_static(&[
                        wire::CLIENT_INIT_SHARED,
                    ])));
                    self.state = BackendState::AwaitingServerInit;
                }
                BackendState::AwaitingServerInit => match ServerInit::decode(&self.buf)? {
                    None => break,
                    Some((init, consumed)) => {
                        self.buf.advance(consumed);
                        actions.push(LinkAction::Ready(Box::new(init)));
                        self.state = BackendState::Forwarding;
                    }
                },
                BackendState::Forwarding => {
                    if !self.buf.is_empty() {
                        actions.push(LinkAction::Broadcast(self.buf.split().freeze()));
                    }
                    break;
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct VncStatus {
    pub connected: bool,
    pub host: String,
    pub port: u16,
    pub width: Option<u16>,
    pub height: Option<u16>,
    pub desktop_name: Option<String>,
    pub error: Option<String>,
}

#[derive(Default)]
struct LinkState {
    connected: bool,
    init: Option<ServerInit>,
    error: Option<String>,
}

struct LinkShared {
    host: String,
    port: u16,
    writer: mpsc::Sender<Bytes>,
    state: RwLock<LinkState>,
}

/// Handle to the single backend connection.
#[derive(Clone)]
pub struct BackendLink {
    shared: Arc<LinkShared>,
}

impl BackendLink {
    /// Connects to the VNC server and spawns the reader loop and the writer
    /// task. A failed connection still yields a usable handle whose status
    /// reports the error; viewers then cannot complete their handshakes.
    pub async fn connect(
        host: &str,
        port: u16,
        password: Option<String>,
        registry: ConnectionRegistry,
        events: Arc<dyn RelayEvents>,
    ) -> Self {
        let (writer_tx, mut writer_rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_FRAMES);
        let shared = Arc::new(LinkShared {
            host: host.to_string(),
            port,
            writer: writer_tx,
            state: RwLock::new(LinkState::default()),
        });
        let link = BackendLink {
            shared: shared.clone(),
        };

        let stream = match TcpStream::connect((host, port)).await {
            Ok(stream) => stream,
            Err(error) => {
                shared.state.write().await.error = Some(format!("connect failed: {error}"));
                return link;
            }
        };
        if let Err(error) = stream.set_nodelay(true) {
            tracing::warn!(%error, "failed to enable TCP_NODELAY on backend socket");
        }
        shared.state.write().await.connected = true;

        let (read_half, mut write_half) = stream.into_split();

        // Single writer: every frame headed for the backend, handshake
        // replies and viewer input alike, goes through this task so discrete
        // messages are never interleaved.
        tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                if let Err(error) = write_half.write_all(&frame).await {
                    tracing::debug!(%error, "backend write failed");
                    break;
                }
            }
        });

        let reader_link = link.clone();
        tokio::spawn(async move {
            reader_link
                .run_reader(read_half, password, registry, events)
                .await;
        });

        link
    }

    /// Handle that never had a connection, for embedders that want the
    /// management surface without a live backend.
    pub fn disconnected(host: &str, port: u16) -> Self {
        let (writer_tx, _) = mpsc::channel(1);
        BackendLink {
            shared: Arc::new(LinkShared {
                host: host.to_string(),
                port,
                writer: writer_tx,
                state: RwLock::new(LinkState::default()),
            }),
        }
    }

    async fn run_reader(
        &self,
        mut read_half: OwnedReadHalf,
        password: Option<String>,
        registry: ConnectionRegistry,
        events: Arc<dyn RelayEvents>,
    ) {
        let mut handshake = BackendHandshake::new(password);
        let mut chunk = vec![0u8; READ_BUFFER_LEN];
        let mut actions = Vec::new();
        loop {
            let n = match read_half.read(&mut chunk).await {
                Ok(0) => {
                    self.fail("backend closed the connection".to_string(), &registry, &events)
                        .await;
                    return;
                }
                Ok(n) => n,
                Err(error) => {
                    self.fail(format!("backend read failed: {error}"), &registry, &events)
                        .await;
                    return;
                }
            };

            actions.clear();
            if let Err(error) = handshake.on_data(&chunk[..n], &mut actions) {
                self.fail(format!("backend protocol error: {error}"), &registry, &events)
                    .await;
                return;
            }
            for action in actions.drain(..) {
                match action {
                    LinkAction::Send(frame) => {
                        if self.shared.writer.send(frame).await.is_err() {
                            self.fail("backend writer stopped".to_string(), &registry, &events)
                                .await;
                            return;
                        }
                    }
                    LinkAction::Ready(init) => {
                        tracing::info!(
                            width = init.width,
                            height = init.height,
                            desktop = %init.desktop_name(),
                            "backend handshake complete"
                        );
                        let name = init.desktop_name();
                        let (width, height) = (init.width, init.height);
                        self.shared.state.write().await.init = Some(*init);
                        events.backend_ready(width, height, &name).await;
                    }
                    LinkAction::Broadcast(frame) => registry.broadcast(frame).await,
                }
            }
        }
    }

    async fn fail(
        &self,
        message: String,
        registry: &ConnectionRegistry,
        events: &Arc<dyn RelayEvents>,
    ) {
        tracing::error!(error = %message, "backend link failed");
        {
            let mut state = self.shared.state.write().await;
            state.connected = false;
            state.init = None;
            state.error = Some(message.clone());
        }
        registry.close_all(close_code::BACKEND_LOST).await;
        events.backend_closed(&message).await;
    }

    /// Queues bytes for the backend socket. Each call is written as one
    /// contiguous unit. Writes after the link has failed are dropped.
    pub async fn write(&self, frame: Bytes) {
        if self.shared.writer.send(frame).await.is_err() {
            tracing::debug!("dropping write to closed backend link");
        }
    }

    pub async fn server_init(&self) -> Option<ServerInit> {
        self.shared.state.read().await.init.clone()
    }

    pub async fn status(&self) -> VncStatus {
        let state = self.shared.state.read().await;
        VncStatus {
            connected: state.connected,
            host: self.shared.host.clone(),
            port: self.shared.port,
            width: state.init.as_ref().map(|init| init.width),
            height: state.init.as_ref().map(|init| init.height),
            desktop_name: state.init.as_ref().map(ServerInit::desktop_name),
            error: state.error.clone(),
        }
    }
}
