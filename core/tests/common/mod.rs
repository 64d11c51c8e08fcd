//! Test harness: a fake STOMP broker and a fake REST backend on loopback.
#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use marketchat_core::bus::frame::{Command, Decoded, Frame};
use marketchat_core::messenger_types::OutboundEnvelope;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

// ─── Fake broker ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Value of the CONNECTED heart-beat header
    pub heart_beat: &'static str,
    /// Answer each SEND with an ack and an inbox MESSAGE
    pub confirm_sends: bool,
    /// Conversation id used for confirmed messages
    pub conversation_id: &'static str,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            heart_beat: "0,0",
            confirm_sends: true,
            conversation_id: "c1",
        }
    }
}

enum Control {
    DropAll,
    Push { destination: String, body: String },
}

#[derive(Default)]
struct BrokerState {
    connections: AtomicUsize,
    heartbeats: AtomicUsize,
    next_id: AtomicU64,
    sends: Mutex<Vec<OutboundEnvelope>>,
    connect_frames: Mutex<Vec<Frame>>,
    subscriptions: Mutex<Vec<String>>,
}

pub struct FakeBroker {
    pub addr: SocketAddr,
    state: Arc<BrokerState>,
    control: broadcast::Sender<Arc<Control>>,
}

impl FakeBroker {
    pub async fn start(options: BrokerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(BrokerState {
            next_id: AtomicU64::new(123),
            ..Default::default()
        });
        let (control, _) = broadcast::channel(16);

        let accept_state = state.clone();
        let accept_control = control.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                let state = accept_state.clone();
                let control = accept_control.subscribe();
                let options = options.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, state, control, options).await;
                });
            }
        });

        Self {
            addr,
            state,
            control,
        }
    }

    /// Close every open client connection
    pub fn drop_connections(&self) {
        let _ = self.control.send(Arc::new(Control::DropAll));
    }

    /// Deliver a raw body to subscribers of `destination`
    pub fn push(&self, destination: &str, body: &str) {
        let _ = self.control.send(Arc::new(Control::Push {
            destination: destination.to_string(),
            body: body.to_string(),
        }));
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn heartbeats(&self) -> usize {
        self.state.heartbeats.load(Ordering::SeqCst)
    }

    pub fn sends(&self) -> Vec<OutboundEnvelope> {
        self.state.sends.lock().unwrap().clone()
    }

    pub fn connect_frames(&self) -> Vec<Frame> {
        self.state.connect_frames.lock().unwrap().clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state.subscriptions.lock().unwrap().clone()
    }
}

async fn write(stream: &mut TcpStream, frame: Frame) -> std::io::Result<()> {
    stream.write_all(&frame.encode()).await
}

async fn serve(
    mut stream: TcpStream,
    state: Arc<BrokerState>,
    mut control: broadcast::Receiver<Arc<Control>>,
    options: BrokerOptions,
) -> std::io::Result<()> {
    let mut buf = BytesMut::new();
    // destination -> subscription id chosen by the client
    let mut subs: HashMap<String, String> = HashMap::new();

    loop {
        tokio::select! {
            read = stream.read_buf(&mut buf) => {
                if read? == 0 {
                    return Ok(());
                }
                while let Some(decoded) = Frame::decode(&mut buf).expect("client sent bad frame") {
                    let frame = match decoded {
                        Decoded::Heartbeat => {
                            state.heartbeats.fetch_add(1, Ordering::SeqCst);
                            continue;
                        }
                        Decoded::Frame(frame) => frame,
                    };
                    match frame.command {
                        Command::Connect => {
                            state.connect_frames.lock().unwrap().push(frame);
                            write(
                                &mut stream,
                                Frame::new(Command::Connected)
                                    .header("version", "1.2")
                                    .header("heart-beat", options.heart_beat),
                            )
                            .await?;
                        }
                        Command::Subscribe => {
                            let dest = frame.get("destination").unwrap_or_default().to_string();
                            let id = frame.get("id").unwrap_or_default().to_string();
                            state.subscriptions.lock().unwrap().push(dest.clone());
                            subs.insert(dest, id);
                        }
                        Command::Send => {
                            let envelope: OutboundEnvelope =
                                serde_json::from_slice(&frame.body).expect("bad envelope");
                            state.sends.lock().unwrap().push(envelope.clone());
                            if options.confirm_sends {
                                let id = format!("m-{}", state.next_id.fetch_add(1, Ordering::SeqCst));
                                let ack = json!({
                                    "status": "success",
                                    "clientMessageId": envelope.client_message_id,
                                    "messageId": id,
                                    "conversationId": options.conversation_id,
                                });
                                deliver(&mut stream, &subs, "/user/queue/responses", ack.to_string()).await?;
                                let message = json!({
                                    "id": id,
                                    "conversationId": options.conversation_id,
                                    "senderId": envelope.sender_id,
                                    "recipientId": envelope.recipient_id,
                                    "content": envelope.content,
                                    "type": "TEXT",
                                    "status": "SENT",
                                    "createdAt": "2024-05-01T12:00:00Z",
                                });
                                let inbox = format!("/topic/messages/{}", envelope.sender_id);
                                deliver(&mut stream, &subs, &inbox, message.to_string()).await?;
                            }
                        }
                        Command::Disconnect => {
                            if let Some(receipt) = frame.get("receipt") {
                                let reply = Frame::new(Command::Receipt).header("receipt-id", receipt);
                                let _ = write(&mut stream, reply).await;
                            }
                            return Ok(());
                        }
                        _ => {}
                    }
                }
            }
            ctl = control.recv() => match ctl.as_deref() {
                Ok(Control::DropAll) | Err(_) => return Ok(()),
                Ok(Control::Push { destination, body }) => {
                    deliver(&mut stream, &subs, destination, body.clone()).await?;
                }
            }
        }
    }
}

async fn deliver(
    stream: &mut TcpStream,
    subs: &HashMap<String, String>,
    destination: &str,
    body: String,
) -> std::io::Result<()> {
    let Some(sub_id) = subs.get(destination) else {
        return Ok(());
    };
    let frame = Frame::new(Command::Message)
        .header("destination", destination)
        .header("subscription", sub_id.as_str())
        .header("message-id", uuid_like())
        .header("content-type", "application/json")
        .with_body(body.into_bytes());
    write(stream, frame).await
}

fn uuid_like() -> String {
    static N: AtomicU64 = AtomicU64::new(0);
    format!("broker-{}", N.fetch_add(1, Ordering::SeqCst))
}

// ─── Fake REST backend ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub query: String,
    pub authorization: Option<String>,
    pub user_id: Option<String>,
}

pub type Handler = Arc<dyn Fn(&Recorded) -> (u16, String) + Send + Sync>;

pub struct FakeRest {
    pub origin: String,
    log: Arc<Mutex<Vec<Recorded>>>,
}

impl FakeRest {
    pub async fn start(handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log: Arc<Mutex<Vec<Recorded>>> = Arc::new(Mutex::new(Vec::new()));

        let server_log = log.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let io = TokioIo::new(stream);
                let handler = handler.clone();
                let log = server_log.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let handler = handler.clone();
                        let log = log.clone();
                        async move {
                            let header = |name: &str| {
                                req.headers()
                                    .get(name)
                                    .and_then(|v| v.to_str().ok())
                                    .map(str::to_string)
                            };
                            let recorded = Recorded {
                                method: req.method().to_string(),
                                path: req.uri().path().to_string(),
                                query: req.uri().query().unwrap_or("").to_string(),
                                authorization: header("authorization"),
                                user_id: header("x-user-id"),
                            };
                            log.lock().unwrap().push(recorded.clone());
                            let (status, body) = handler(&recorded);
                            let response = Response::builder()
                                .status(StatusCode::from_u16(status).unwrap())
                                .header("Content-Type", "application/json")
                                .body(Full::new(Bytes::from(body)))
                                .unwrap();
                            Ok::<_, Infallible>(response)
                        }
                    });
                    let _ = http1::Builder::new().serve_connection(io, svc).await;
                });
            }
        });

        Self {
            origin: format!("http://{}", addr),
            log,
        }
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.log.lock().unwrap().clone()
    }
}

/// Standard backend: one conversation c1 (u1 <-> u2), c2 (u1 <-> u3), no history
pub fn default_handler() -> Handler {
    Arc::new(|req: &Recorded| match req.path.as_str() {
        "/chats/conservations" => (
            200,
            json!({
                "content": [
                    {"id": "c1", "participants": ["u1", "u2"], "unreadCount": 0, "status": "ACTIVE"},
                    {"id": "c2", "participants": ["u1", "u3"], "unreadCount": 2, "status": "ACTIVE"}
                ],
                "number": 0, "size": 20, "totalElements": 2, "totalPages": 1, "last": true
            })
            .to_string(),
        ),
        p if p.ends_with("/messages") => (
            200,
            json!({"content": [], "number": 0, "size": 20, "totalElements": 0, "totalPages": 0, "last": true})
                .to_string(),
        ),
        _ => (404, String::new()),
    })
}

/// Poll `check` until it holds or `limit` elapses
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check().await
}

/// Synchronous variant of [`eventually`] for broker-side counters
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
