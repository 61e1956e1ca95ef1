//! End-to-end scenario tests against in-memory fakes, covering the literal
//! scenarios not already exercised by a component's own unit tests:
//! reply/idle arriving out of order, a queued send surviving a reconnect,
//! and concurrent idempotent session shutdown.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use reqwest::Method;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use jupyter_client::config::ClientConfig;
use jupyter_client::protocol::codec::{self, WireFrame};
use jupyter_client::protocol::{Channel, ExecuteRequest, KernelHeader, KernelMessage, KernelMessageType, Reply};
use jupyter_client::rest::{JupyterRestClient, RawResponse, RestTransport};
use jupyter_client::socket::{BoxedSink, BoxedStream, SocketFactory};
use jupyter_client::{KernelChannelEngine, KernelStatus, Session};

fn header(msg_type: KernelMessageType) -> KernelHeader {
    KernelHeader {
        msg_id: uuid::Uuid::new_v4().to_string(),
        session: "s1".into(),
        username: "kernel".into(),
        date: time::OffsetDateTime::now_utc(),
        msg_type,
        version: "5.4".into(),
    }
}

fn send_frame(tx: &mpsc::UnboundedSender<Message>, msg: &KernelMessage) {
    let frame = codec::encode(msg).unwrap();
    let wire = match frame {
        WireFrame::Text(t) => Message::Text(t),
        WireFrame::Binary(b) => Message::Binary(b),
    };
    let _ = tx.send(wire);
}

fn send_status(tx: &mpsc::UnboundedSender<Message>, state: &str) {
    send_frame(
        tx,
        &KernelMessage {
            header: header(KernelMessageType::Status),
            parent_header: None,
            channel: Channel::IoPub,
            metadata: Map::new(),
            content: json!({"execution_state": state}),
            buffers: Vec::new(),
        },
    );
}

fn send_iopub(tx: &mpsc::UnboundedSender<Message>, parent: &KernelMessage, msg_type: KernelMessageType, content: Value) {
    send_frame(
        tx,
        &KernelMessage {
            header: header(msg_type),
            parent_header: Some(parent.header.clone()),
            channel: Channel::IoPub,
            metadata: Map::new(),
            content,
            buffers: Vec::new(),
        },
    );
}

fn send_reply(tx: &mpsc::UnboundedSender<Message>, parent: &KernelMessage, msg_type: KernelMessageType, content: Value) {
    send_frame(
        tx,
        &KernelMessage {
            header: header(msg_type),
            parent_header: Some(parent.header.clone()),
            channel: Channel::Shell,
            metadata: Map::new(),
            content,
            buffers: Vec::new(),
        },
    );
}

struct EmptyRestTransport;

impl RestTransport for EmptyRestTransport {
    fn execute<'a>(
        &'a self,
        _method: Method,
        _path: &'a str,
        _body: Option<Vec<u8>>,
    ) -> Pin<Box<dyn Future<Output = Result<RawResponse, jupyter_client::Error>> + Send + 'a>> {
        Box::pin(async move {
            Ok(RawResponse {
                status: 200,
                body: bytes::Bytes::from_static(b"{}"),
            })
        })
    }
}

/// S2: a scripted kernel that answers `execute_request` with its iopub
/// `idle` status arriving *before* the shell `execute_reply`.
struct IdleBeforeReplyFactory;

impl SocketFactory for IdleBeforeReplyFactory {
    fn connect<'a>(
        &'a self,
        _url: &'a str,
        _token: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<(BoxedSink, BoxedStream), jupyter_client::Error>> + Send + 'a>> {
        Box::pin(async move {
            let (to_client_tx, to_client_rx) = mpsc::unbounded_channel::<Message>();
            let (from_client_tx, mut from_client_rx) = mpsc::unbounded_channel::<Message>();

            send_status(&to_client_tx, "idle");

            tokio::spawn(async move {
                while let Some(frame) = from_client_rx.recv().await {
                    let bytes = match frame {
                        Message::Text(t) => t.into_bytes(),
                        Message::Binary(b) => b,
                        _ => continue,
                    };
                    let wire = match std::str::from_utf8(&bytes) {
                        Ok(_) => WireFrame::Text(String::from_utf8(bytes).unwrap()),
                        Err(_) => WireFrame::Binary(bytes),
                    };
                    let Ok(msg) = codec::decode(wire) else { continue };
                    match msg.header.msg_type {
                        KernelMessageType::KernelInfoRequest => {
                            send_reply(
                                &to_client_tx,
                                &msg,
                                KernelMessageType::KernelInfoReply,
                                json!({
                                    "protocol_version": "5.4",
                                    "implementation": "test",
                                    "implementation_version": "0.1",
                                    "language_info": {
                                        "name": "python", "version": "3.11",
                                        "mimetype": "text/x-python", "file_extension": ".py"
                                    },
                                    "banner": "",
                                }),
                            );
                        }
                        KernelMessageType::ExecuteRequest => {
                            send_status(&to_client_tx, "busy");
                            send_iopub(
                                &to_client_tx,
                                &msg,
                                KernelMessageType::ExecuteResult,
                                json!({"execution_count": 1, "data": {"text/plain": "2"}, "metadata": {}}),
                            );
                            // idle arrives before the shell reply
                            send_status(&to_client_tx, "idle");
                            send_reply(
                                &to_client_tx,
                                &msg,
                                KernelMessageType::ExecuteReply,
                                json!({"status": "ok", "execution_count": 1}),
                            );
                        }
                        _ => {}
                    }
                }
            });

            let outbound_sink = futures_util::sink::unfold(from_client_tx, |tx, item: Message| async move {
                tx.send(item).map_err(|_| jupyter_client::Error::KernelConnect("closed".into()))?;
                Ok::<_, jupyter_client::Error>(tx)
            });
            let inbound_stream = futures_util::stream::unfold(to_client_rx, |mut rx| async move {
                rx.recv().await.map(|m| (Ok(m), rx))
            });
            Ok((Box::pin(outbound_sink) as BoxedSink, Box::pin(inbound_stream) as BoxedStream))
        })
    }
}

fn test_engine(factory: Arc<dyn SocketFactory>) -> KernelChannelEngine {
    let rest = JupyterRestClient::new(Arc::new(EmptyRestTransport));
    let config = ClientConfig::new("http://localhost:8888/");
    KernelChannelEngine::new(factory, rest, config, "k1", "python3")
}

async fn wait_idle(engine: &KernelChannelEngine) {
    let mut status = engine.watch_status();
    while *status.borrow() != KernelStatus::Idle {
        status.changed().await.unwrap();
    }
}

/// S2: Future must not resolve until both the iopub idle *and* the shell
/// execute_reply have arrived, regardless of which comes first on the wire.
#[tokio::test]
async fn out_of_order_idle_then_reply_still_resolves_correctly() {
    let engine = test_engine(Arc::new(IdleBeforeReplyFactory));
    wait_idle(&engine).await;

    let mut handle = engine.execute(ExecuteRequest::new("1+1")).unwrap();

    let result_msg = handle.next_iopub().await.expect("execute_result");
    assert_eq!(result_msg.header.msg_type, KernelMessageType::ExecuteResult);

    // The idle that completes this execution is consumed internally by the
    // future's bookkeeping, not re-delivered through next_iopub as a
    // separate item the caller must skip past.
    let reply = handle.reply().await.unwrap();
    match reply {
        Reply::Ok(content) => assert_eq!(content.execution_count, 1),
        other => panic!("unexpected reply: {other:?}"),
    }
}

/// S3: a socket that fails its first connect attempt, succeeds on the
/// second, and only then greets with a status that releases the queue.
struct FlakyThenIdleFactory {
    attempts: Arc<AtomicUsize>,
}

impl SocketFactory for FlakyThenIdleFactory {
    fn connect<'a>(
        &'a self,
        _url: &'a str,
        _token: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<(BoxedSink, BoxedStream), jupyter_client::Error>> + Send + 'a>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if attempt == 0 {
                return Err(jupyter_client::Error::KernelConnect("refused".into()));
            }

            let (to_client_tx, to_client_rx) = mpsc::unbounded_channel::<Message>();
            let (from_client_tx, mut from_client_rx) = mpsc::unbounded_channel::<Message>();
            send_status(&to_client_tx, "idle");

            tokio::spawn(async move {
                while let Some(frame) = from_client_rx.recv().await {
                    let bytes = match frame {
                        Message::Text(t) => t.into_bytes(),
                        Message::Binary(b) => b,
                        _ => continue,
                    };
                    let wire = match std::str::from_utf8(&bytes) {
                        Ok(_) => WireFrame::Text(String::from_utf8(bytes).unwrap()),
                        Err(_) => WireFrame::Binary(bytes),
                    };
                    let Ok(msg) = codec::decode(wire) else { continue };
                    if msg.header.msg_type == KernelMessageType::KernelInfoRequest {
                        send_reply(
                            &to_client_tx,
                            &msg,
                            KernelMessageType::KernelInfoReply,
                            json!({
                                "protocol_version": "5.4", "implementation": "test",
                                "implementation_version": "0.1",
                                "language_info": {
                                    "name": "python", "version": "3.11",
                                    "mimetype": "text/x-python", "file_extension": ".py"
                                },
                                "banner": "",
                            }),
                        );
                    }
                }
            });

            let outbound_sink = futures_util::sink::unfold(from_client_tx, |tx, item: Message| async move {
                tx.send(item).map_err(|_| jupyter_client::Error::KernelConnect("closed".into()))?;
                Ok::<_, jupyter_client::Error>(tx)
            });
            let inbound_stream = futures_util::stream::unfold(to_client_rx, |mut rx| async move {
                rx.recv().await.map(|m| (Ok(m), rx))
            });
            Ok((Box::pin(outbound_sink) as BoxedSink, Box::pin(inbound_stream) as BoxedStream))
        })
    }
}

/// S3: calling `kernel_info()` while the socket is reconnecting suspends
/// until the retry succeeds and the post-reconnect status greeting flushes
/// the queue; the request is delivered exactly once.
#[tokio::test]
async fn reconnect_delivers_queued_request_exactly_once() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let engine = test_engine(Arc::new(FlakyThenIdleFactory {
        attempts: attempts.clone(),
    }));

    let reply = tokio::time::timeout(std::time::Duration::from_secs(5), engine.kernel_info())
        .await
        .expect("kernel_info should eventually resolve")
        .unwrap();

    assert!(matches!(reply, Reply::Ok(_)));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

/// S5: two concurrent `shutdown()` calls on the same session issue exactly
/// one DELETE, and both resolve successfully.
#[derive(Default)]
struct CountingDeleteTransport {
    delete_calls: AtomicUsize,
}

impl RestTransport for CountingDeleteTransport {
    fn execute<'a>(
        &'a self,
        method: Method,
        _path: &'a str,
        _body: Option<Vec<u8>>,
    ) -> Pin<Box<dyn Future<Output = Result<RawResponse, jupyter_client::Error>> + Send + 'a>> {
        if method == Method::DELETE {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
        }
        Box::pin(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            Ok(RawResponse {
                status: 204,
                body: bytes::Bytes::new(),
            })
        })
    }
}

struct PanicConnector;
impl jupyter_client::session::KernelConnector for PanicConnector {
    fn connect(&self, _kernel_id: &str, _kernel_name: &str) -> KernelChannelEngine {
        panic!("no kernel should be connected in the shutdown scenario");
    }
}

#[tokio::test]
async fn concurrent_shutdown_issues_exactly_one_delete() {
    let transport = Arc::new(CountingDeleteTransport::default());
    let rest = JupyterRestClient::new(transport.clone());
    let model: jupyter_client::SessionModel = serde_json::from_value(json!({
        "id": "sess-1",
        "path": "a.ipynb",
        "name": "nb",
        "type": "notebook",
        "kernel": {"id": "k1", "name": "python3"},
    }))
    .unwrap();
    let session = Arc::new(Session::from_model(rest, Arc::new(PanicConnector), model));

    let a = session.clone();
    let b = session.clone();
    let (r1, r2) = tokio::join!(tokio::spawn(async move { a.shutdown().await }), tokio::spawn(async move { b.shutdown().await }));
    r1.unwrap().unwrap();
    r2.unwrap().unwrap();

    assert_eq!(transport.delete_calls.load(Ordering::SeqCst), 1);
    assert_eq!(session.id().await, None);
}
