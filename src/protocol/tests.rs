// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

use crate::core::packet::Frame;
use crate::error::ProtocolError;
use crate::protocol::dispatcher::{DispatchOutcome, Dispatcher};
use crate::protocol::registry::MessageRegistry;
use crate::transport::connection::{ConnectionId, Session};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Chat {
    text: String,
}

#[derive(Debug, Clone, PartialEq)]
enum Msg {
    Chat(Chat),
    Tick,
}

const CHAT: i32 = 10;
const TICK: i32 = 11;

fn dispatcher() -> Dispatcher<Msg> {
    let mut registry = MessageRegistry::new();
    registry.register_bincode(CHAT, "Chat", Msg::Chat).unwrap();
    registry.register_fn(TICK, |_: &[u8]| Ok(Msg::Tick)).unwrap();
    Dispatcher::new(Arc::new(registry))
}

fn session() -> (Session, mpsc::UnboundedReceiver<Frame>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let session = Session::new(
        ConnectionId::new(42),
        "127.0.0.1:4000".parse().unwrap(),
        tx,
        CancellationToken::new(),
        1024 * 1024,
    );
    (session, rx)
}

fn chat_frame(text: &str) -> Frame {
    let body = bincode::serialize(&Chat { text: text.to_string() }).unwrap();
    Frame::new(CHAT, body)
}

#[tokio::test]
async fn test_handlers_run_in_registration_order() {
    let dispatcher = dispatcher();
    let order = Arc::new(Mutex::new(Vec::new()));

    for tag in ["first", "second", "third"] {
        let order = order.clone();
        dispatcher
            .register_handler(CHAT, move |_, msg: Arc<Msg>| {
                let order = order.clone();
                async move {
                    if let Msg::Chat(chat) = &*msg {
                        order.lock().unwrap().push(format!("{}:{}", tag, chat.text));
                    }
                    Ok(())
                }
            })
            .unwrap();
    }

    let (session, _rx) = session();
    let outcome = dispatcher.dispatch(&session, chat_frame("hi")).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Delivered { invoked: 3, failed: 0 });
    assert_eq!(
        *order.lock().unwrap(),
        vec!["first:hi", "second:hi", "third:hi"]
    );
}

#[traced_test]
#[tokio::test]
async fn test_failing_handler_does_not_stop_the_rest() {
    let dispatcher = dispatcher();
    let reached = Arc::new(Mutex::new(0));

    dispatcher
        .register_handler(TICK, |_, _| async { Err(ProtocolError::Handler("bad state".into())) })
        .unwrap();
    dispatcher
        .register_handler(TICK, |_, _| async {
            if true {
                panic!("handler blew up");
            }
            Ok(())
        })
        .unwrap();
    let counter = reached.clone();
    dispatcher
        .register_handler(TICK, move |_, _| {
            let counter = counter.clone();
            async move {
                *counter.lock().unwrap() += 1;
                Ok(())
            }
        })
        .unwrap();

    let (session, _rx) = session();
    let outcome = dispatcher.dispatch(&session, Frame::new(TICK, Vec::new())).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Delivered { invoked: 3, failed: 2 });
    assert_eq!(*reached.lock().unwrap(), 1);
    assert!(logs_contain("HandlerException"));
    assert!(logs_contain("handler blew up"));

    // The next frame on the same connection is still processed.
    dispatcher.dispatch(&session, Frame::new(TICK, Vec::new())).await.unwrap();
    assert_eq!(*reached.lock().unwrap(), 2);
}

#[traced_test]
#[tokio::test]
async fn test_unknown_type_is_dropped_with_warning() {
    let dispatcher = dispatcher();
    let (session, _rx) = session();

    let outcome = dispatcher.dispatch(&session, Frame::new(999, vec![1, 2])).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Dropped);
    assert!(logs_contain("UnknownMessageType"));
    assert!(logs_contain("conn-42"));
    assert!(!session.is_closed());
}

#[traced_test]
#[tokio::test]
async fn test_malformed_body_is_dropped() {
    let dispatcher = dispatcher();
    let calls = Arc::new(Mutex::new(0));
    let counter = calls.clone();
    dispatcher
        .register_handler(CHAT, move |_, _| {
            let counter = counter.clone();
            async move {
                *counter.lock().unwrap() += 1;
                Ok(())
            }
        })
        .unwrap();

    let (session, _rx) = session();
    let outcome = dispatcher.dispatch(&session, Frame::new(CHAT, vec![0xFF])).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Dropped);
    assert_eq!(*calls.lock().unwrap(), 0);
    assert!(logs_contain("MalformedBody"));

    dispatcher.dispatch(&session, chat_frame("ok")).await.unwrap();
    assert_eq!(*calls.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_unregister_handler() {
    let dispatcher = dispatcher();
    let first = dispatcher.register_handler(TICK, |_, _| async { Ok(()) }).unwrap();
    dispatcher.register_handler(TICK, |_, _| async { Ok(()) }).unwrap();
    assert_eq!(dispatcher.handler_count(TICK), 2);

    assert!(dispatcher.unregister_handler(TICK, first).unwrap());
    assert!(!dispatcher.unregister_handler(TICK, first).unwrap());
    assert_eq!(dispatcher.handler_count(TICK), 1);

    assert_eq!(dispatcher.unregister_all(TICK).unwrap(), 1);
    let (session, _rx) = session();
    let outcome = dispatcher.dispatch(&session, Frame::new(TICK, Vec::new())).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Delivered { invoked: 0, failed: 0 });
}

#[tokio::test]
async fn test_handler_replies_through_session() {
    let dispatcher = dispatcher();
    dispatcher
        .register_handler(CHAT, |session: Session, msg: Arc<Msg>| async move {
            if let Msg::Chat(chat) = &*msg {
                session.send_message(CHAT, &Chat { text: chat.text.to_uppercase() })?;
            }
            Ok(())
        })
        .unwrap();

    let (session, mut rx) = session();
    dispatcher.dispatch(&session, chat_frame("echo")).await.unwrap();
    let reply = rx.try_recv().unwrap();
    let chat: Chat = bincode::deserialize(&reply.body).unwrap();
    assert_eq!(chat.text, "ECHO");
}
