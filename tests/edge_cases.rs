#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Edge-case tests for malformed input and failure isolation
//! Tests framing violations, unknown types and misbehaving handlers against a live listener

use std::sync::{Arc, Mutex};
use std::time::Duration;

use framelink::core::packet::{encode, Frame, HEADER_SIZE};
use framelink::core::reassembler::{FrameLimits, Reassembler};
use framelink::error::ProtocolError;
use framelink::{CloseReason, Dispatcher, MessageRegistry, NetworkConfig, Server};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing_test::traced_test;

const KNOWN: i32 = 7;
const PANICS: i32 = 8;

#[derive(Debug)]
struct Body(Vec<u8>);

struct Harness {
    addr: std::net::SocketAddr,
    token: CancellationToken,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    closes: Arc<Mutex<Vec<CloseReason>>>,
    handle: tokio::task::JoinHandle<framelink::Result<()>>,
}

impl Harness {
    async fn start(max_frame_size: usize) -> Self {
        let mut registry = MessageRegistry::new();
        registry
            .register_fn(KNOWN, |body: &[u8]| Ok(Body(body.to_vec())))
            .unwrap();
        registry
            .register_fn(PANICS, |body: &[u8]| Ok(Body(body.to_vec())))
            .unwrap();
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(registry)));

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        dispatcher
            .register_handler(KNOWN, move |_, msg: Arc<Body>| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(msg.0.clone());
                    Ok(())
                }
            })
            .unwrap();
        dispatcher
            .register_handler(PANICS, |_, _| async {
                if true {
                    panic!("handler exploded");
                }
                Ok(())
            })
            .unwrap();

        let config = NetworkConfig::default_with_overrides(|c| {
            c.server.address = "127.0.0.1:0".to_string();
            c.transport.max_frame_size = max_frame_size;
        });
        let closes = Arc::new(Mutex::new(Vec::new()));
        let recorder = closes.clone();
        let server = Server::bind(&config, dispatcher)
            .await
            .unwrap()
            .on_disconnect(move |_, reason| recorder.lock().unwrap().push(reason));
        let addr = server.local_addr();
        let token = server.shutdown_token();
        let handle = tokio::spawn(
            server
                .run_until(std::future::pending())
                .in_current_span(),
        );

        Self {
            addr,
            token,
            received,
            closes,
            handle,
        }
    }

    async fn wait_for_closes(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.closes.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection should close");
    }

    async fn wait_for_received(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.received.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("frames should be dispatched");
    }

    async fn stop(self) {
        self.token.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

async fn expect_eof(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("server should close the socket")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

// ============================================================================
// FRAMING VIOLATIONS
// ============================================================================

#[traced_test]
#[tokio::test]
async fn test_length_below_header_closes_exactly_once() {
    let harness = Harness::start(1024 * 1024).await;
    let mut stream = TcpStream::connect(harness.addr).await.unwrap();

    let mut bytes = 4u32.to_le_bytes().to_vec();
    bytes.extend_from_slice(&KNOWN.to_le_bytes());
    bytes.extend_from_slice(&encode(KNOWN, b"never dispatched"));
    stream.write_all(&bytes).await.unwrap();

    expect_eof(&mut stream).await;
    harness.wait_for_closes(1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    {
        let closes = harness.closes.lock().unwrap();
        assert_eq!(closes.len(), 1);
        assert!(matches!(
            &closes[0],
            CloseReason::Error { kind: "FrameTooShort", .. }
        ));
    }
    assert!(harness.received.lock().unwrap().is_empty());
    assert!(logs_contain("FrameTooShort"));

    harness.stop().await;
}

#[traced_test]
#[tokio::test]
async fn test_oversized_frame_is_fatal() {
    let harness = Harness::start(1024).await;
    let mut stream = TcpStream::connect(harness.addr).await.unwrap();

    let mut header = 5000u32.to_le_bytes().to_vec();
    header.extend_from_slice(&KNOWN.to_le_bytes());
    stream.write_all(&header).await.unwrap();

    expect_eof(&mut stream).await;
    harness.wait_for_closes(1).await;
    assert!(matches!(
        &harness.closes.lock().unwrap()[0],
        CloseReason::Error { kind: "FrameTooLarge", .. }
    ));
    assert!(logs_contain("FrameTooLarge"));

    harness.stop().await;
}

#[tokio::test]
async fn test_frame_at_size_limit_is_accepted() {
    let harness = Harness::start(1024).await;
    let mut stream = TcpStream::connect(harness.addr).await.unwrap();

    let body = vec![0x5A; 1024 - HEADER_SIZE];
    stream.write_all(&encode(KNOWN, &body)).await.unwrap();
    harness.wait_for_received(1).await;
    assert_eq!(harness.received.lock().unwrap()[0], body);
    assert!(harness.closes.lock().unwrap().is_empty());

    harness.stop().await;
}

#[test]
fn test_reassembler_overflow_when_buffer_limit_is_tight() {
    let limits = FrameLimits {
        initial_buffer_size: 16,
        max_frame_size: 1024,
        max_buffer_size: 32,
    };
    let mut reassembler = Reassembler::new(limits);
    let bytes = encode(KNOWN, &[1u8; 40]);
    let err = reassembler.push(&bytes).unwrap_err();
    assert!(matches!(err, ProtocolError::BufferOverflow { required: 48, max: 32 }));
    assert!(err.is_fatal());
}

#[test]
fn test_empty_body_frame() {
    let mut reassembler = Reassembler::new(FrameLimits::default());
    let frames = reassembler.feed(&encode(KNOWN, &[])).unwrap();
    assert_eq!(frames, vec![Frame::new(KNOWN, Vec::new())]);
}

// ============================================================================
// DISPATCH-LEVEL FAILURES KEEP THE CONNECTION
// ============================================================================

#[traced_test]
#[tokio::test]
async fn test_unknown_type_keeps_connection_open() {
    let harness = Harness::start(1024 * 1024).await;
    let mut stream = TcpStream::connect(harness.addr).await.unwrap();

    let mut bytes = encode(12345, b"from a newer peer");
    bytes.extend(encode(KNOWN, b"after"));
    stream.write_all(&bytes).await.unwrap();

    harness.wait_for_received(1).await;
    assert_eq!(harness.received.lock().unwrap()[0], b"after".to_vec());
    assert!(harness.closes.lock().unwrap().is_empty());
    assert!(logs_contain("UnknownMessageType"));

    // Still usable afterwards.
    stream.write_all(&encode(KNOWN, b"again")).await.unwrap();
    harness.wait_for_received(2).await;

    harness.stop().await;
}

#[traced_test]
#[tokio::test]
async fn test_panicking_handler_is_isolated() {
    let harness = Harness::start(1024 * 1024).await;
    let mut stream = TcpStream::connect(harness.addr).await.unwrap();

    let mut bytes = encode(PANICS, b"boom");
    bytes.extend(encode(KNOWN, b"survivor"));
    stream.write_all(&bytes).await.unwrap();

    harness.wait_for_received(1).await;
    assert_eq!(harness.received.lock().unwrap()[0], b"survivor".to_vec());
    assert!(harness.closes.lock().unwrap().is_empty());
    assert!(logs_contain("handler exploded"));
    assert!(logs_contain("HandlerException"));

    harness.stop().await;
}
