//! End-to-end relay scenarios: a real WebSocket viewer talking RFB through
//! the relay to a mock VNC server on a loopback socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tungstenite::Message;
use vncmux::events::RelayEvents;
use vncmux::rfb::auth;
use vncmux::{build_router, BackendLink, ConnectionRegistry, SessionConfig, TracingEvents};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TEST_KEY: &str = "test-key";
const MOCK_CHALLENGE: [u8; 16] = [
    0x10, 0x32, 0x54, 0x76, 0x98, 0xba, 0xdc, 0xfe, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd,
    0xef,
];

fn server_init_bytes(width: u16, height: u16, name: &str) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u16(width);
    buf.put_u16(height);
    buf.put_u8(32);
    buf.put_u8(24);
    buf.put_u8(0);
    buf.put_u8(1);
    buf.put_u16(255);
    buf.put_u16(255);
    buf.put_u16(255);
    buf.put_u8(16);
    buf.put_u8(8);
    buf.put_u8(0);
    buf.put_bytes(0, 3);
    buf.put_u32(name.len() as u32);
    buf.extend_from_slice(name.as_bytes());
    buf.to_vec()
}

struct MockVnc {
    addr: SocketAddr,
    /// Bytes the mock received after its handshake completed.
    input: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Bytes the mock pushes to the relay as framebuffer traffic.
    frames: mpsc::UnboundedSender<Vec<u8>>,
}

async fn spawn_mock_vnc(width: u16, height: u16, password: Option<&'static str>) -> MockVnc {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(b"RFB 003.008\n").await.unwrap();

        let mut version = [0u8; 12];
        stream.read_exact(&mut version).await.unwrap();
        assert_eq!(&version, b"RFB 003.008\n");

        match password {
            None => {
                stream.write_all(&[1, 1]).await.unwrap();
                let mut choice = [0u8; 1];
                stream.read_exact(&mut choice).await.unwrap();
                assert_eq!(choice[0], 1);
            }
            Some(password) => {
                stream.write_all(&[1, 2]).await.unwrap();
                let mut choice = [0u8; 1];
                stream.read_exact(&mut choice).await.unwrap();
                assert_eq!(choice[0], 2);

                stream.write_all(&MOCK_CHALLENGE).await.unwrap();
                let mut response = [0u8; 16];
                stream.read_exact(&mut response).await.unwrap();
                assert_eq!(response, auth::encrypt_challenge(password, &MOCK_CHALLENGE));
            }
        }
        stream.write_all(&[0, 0, 0, 0]).await.unwrap();

        let mut shared = [0u8; 1];
        stream.read_exact(&mut shared).await.unwrap();
        stream
            .write_all(&server_init_bytes(width, height, "mock desktop"))
            .await
            .unwrap();

        let (mut read_half, mut write_half) = stream.into_split();
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                if write_half.write_all(&frame).await.is_err() {
                    break;
                }
            }
        });

        let mut buf = vec![0u8; 4096];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let _ = input_tx.send(buf[..n].to_vec());
                }
            }
        }
    });

    MockVnc {
        addr,
        input: input_rx,
        frames: frame_tx,
    }
}

async fn start_relay(
    vnc_addr: SocketAddr,
    password: Option<&str>,
) -> (SocketAddr, ConnectionRegistry, BackendLink) {
    let events: Arc<dyn RelayEvents> = Arc::new(TracingEvents);
    let registry = ConnectionRegistry::new(8, events.clone());
    registry.register_key(TEST_KEY).await;

    let backend = BackendLink::connect(
        &vnc_addr.ip().to_string(),
        vnc_addr.port(),
        password.map(String::from),
        registry.clone(),
        events,
    )
    .await;

    for _ in 0..200 {
        if backend.server_init().await.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(
        backend.server_init().await.is_some(),
        "backend never finished its handshake"
    );

    let app = build_router(backend.clone(), registry.clone(), SessionConfig::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, registry, backend)
}

async fn connect_viewer(addr: SocketAddr, client_id: &str, api_key: &str) -> WsStream {
    let url = format!("ws://{addr}/vnc?clientId={client_id}&apiKey={api_key}");
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn expect_binary(ws: &mut WsStream) -> Vec<u8> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        match message {
            Message::Binary(data) => return data,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

async fn expect_close_code(ws: &mut WsStream) -> u16 {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for close")
            .expect("stream ended without a close frame")
            .expect("websocket error");
        match message {
            Message::Close(Some(frame)) => return u16::from(frame.code),
            Message::Close(None) => panic!("close frame carried no code"),
            _ => continue,
        }
    }
}

/// Runs the viewer-side RFB handshake and returns the server-init bytes.
async fn rfb_handshake(ws: &mut WsStream) -> Vec<u8> {
    assert_eq!(expect_binary(ws).await, b"RFB 003.008\n");
    ws.send(Message::Binary(b"RFB 003.008\n".to_vec()))
        .await
        .unwrap();
    assert_eq!(expect_binary(ws).await, vec![1, 1]);
    ws.send(Message::Binary(vec![1])).await.unwrap();
    assert_eq!(expect_binary(ws).await, vec![0, 0, 0, 0]);
    ws.send(Message::Binary(vec![1])).await.unwrap();
    expect_binary(ws).await
}

async fn expect_input(mock: &mut MockVnc) -> Vec<u8> {
    tokio::time::timeout(Duration::from_secs(5), mock.input.recv())
        .await
        .expect("timed out waiting for backend input")
        .expect("mock backend stopped")
}

#[tokio::test]
async fn viewer_handshake_reports_backend_geometry() {
    let mock = spawn_mock_vnc(1024, 768, None).await;
    let (addr, _registry, _backend) = start_relay(mock.addr, None).await;

    let mut ws = connect_viewer(addr, "viewer-1", TEST_KEY).await;
    let init = rfb_handshake(&mut ws).await;

    assert_eq!(u16::from_be_bytes([init[0], init[1]]), 1024);
    assert_eq!(u16::from_be_bytes([init[2], init[3]]), 768);
    let name_len = u32::from_be_bytes([init[20], init[21], init[22], init[23]]) as usize;
    assert_eq!(&init[24..24 + name_len], b"mock desktop");
}

#[tokio::test]
async fn authenticates_against_a_password_protected_backend() {
    let mock = spawn_mock_vnc(800, 600, Some("hunter42")).await;
    let (addr, _registry, _backend) = start_relay(mock.addr, Some("hunter42")).await;

    let mut ws = connect_viewer(addr, "viewer-1", TEST_KEY).await;
    let init = rfb_handshake(&mut ws).await;
    assert_eq!(u16::from_be_bytes([init[0], init[1]]), 800);
}

#[tokio::test]
async fn refresh_requests_reach_the_backend_and_frames_come_back() {
    let mut mock = spawn_mock_vnc(1024, 768, None).await;
    let (addr, _registry, _backend) = start_relay(mock.addr, None).await;

    let mut ws = connect_viewer(addr, "viewer-1", TEST_KEY).await;
    rfb_handshake(&mut ws).await;

    let request = vec![3u8, 0, 0, 0, 0, 0, 0, 4, 0, 3];
    ws.send(Message::Binary(request.clone())).await.unwrap();
    assert_eq!(expect_input(&mut mock).await, request);

    let frame = vec![0u8, 0, 0, 1, 0xde, 0xad, 0xbe, 0xef];
    mock.frames.send(frame.clone()).unwrap();
    assert_eq!(expect_binary(&mut ws).await, frame);
}

#[tokio::test]
async fn only_the_controller_reaches_the_backend() {
    let mut mock = spawn_mock_vnc(1024, 768, None).await;
    let (addr, registry, _backend) = start_relay(mock.addr, None).await;

    let mut viewer_a = connect_viewer(addr, "a", TEST_KEY).await;
    rfb_handshake(&mut viewer_a).await;
    let mut viewer_b = connect_viewer(addr, "b", TEST_KEY).await;
    rfb_handshake(&mut viewer_b).await;

    registry.assign_control("a").await;

    // The non-controller's pointer event must be dropped silently.
    let pointer_b = vec![5u8, 0, 0, 50, 0, 60];
    viewer_b.send(Message::Binary(pointer_b)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let pointer_a = vec![5u8, 1, 0, 10, 0, 20];
    viewer_a
        .send(Message::Binary(pointer_a.clone()))
        .await
        .unwrap();

    // The first input to arrive must be the controller's, byte for byte.
    assert_eq!(expect_input(&mut mock).await, pointer_a);
}

#[tokio::test]
async fn unknown_api_keys_are_rejected_with_a_distinct_code() {
    let mock = spawn_mock_vnc(1024, 768, None).await;
    let (addr, _registry, _backend) = start_relay(mock.addr, None).await;

    let mut ws = connect_viewer(addr, "viewer-1", "wrong-key").await;
    assert_eq!(expect_close_code(&mut ws).await, 4001);

    let url = format!("ws://{addr}/vnc?apiKey={TEST_KEY}");
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    assert_eq!(expect_close_code(&mut ws).await, 4000);
}

#[tokio::test]
async fn revoking_a_key_disconnects_and_blocks_viewers() {
    let mock = spawn_mock_vnc(1024, 768, None).await;
    let (addr, registry, _backend) = start_relay(mock.addr, None).await;

    let mut ws = connect_viewer(addr, "viewer-1", TEST_KEY).await;
    rfb_handshake(&mut ws).await;

    assert_eq!(registry.revoke_key(TEST_KEY).await.unwrap(), 1);
    assert_eq!(expect_close_code(&mut ws).await, 4006);

    let mut ws = connect_viewer(addr, "viewer-2", TEST_KEY).await;
    assert_eq!(expect_close_code(&mut ws).await, 4001);
}

#[tokio::test]
async fn stored_control_grant_applies_on_connect() {
    let mut mock = spawn_mock_vnc(1024, 768, None).await;
    let (addr, registry, _backend) = start_relay(mock.addr, None).await;

    let entry = registry.assign_control("later").await;
    assert!(!entry.connected);

    let mut ws = connect_viewer(addr, "later", TEST_KEY).await;
    rfb_handshake(&mut ws).await;
    assert!(registry.list_permissions().await.is_empty());

    let key_event = vec![4u8, 1, 0, 0, 0, 0, 0, 0x61];
    ws.send(Message::Binary(key_event.clone())).await.unwrap();
    assert_eq!(expect_input(&mut mock).await, key_event);
}
