// In-process coordination server for driving real clients in tests.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

use proctor_session::identity::{ParticipantId, Role, SignalingEndpoint};
use proctor_session::signaling::{SignalPayload, SignalingMessage};

pub const STEP: Duration = Duration::from_secs(5);

pub struct MockServer {
    addr: SocketAddr,
    connections: mpsc::UnboundedReceiver<MockConnection>,
}

pub struct MockConnection {
    pub uri: String,
    sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    stream: SplitStream<WebSocketStream<TcpStream>>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, connections) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let uri = Arc::new(Mutex::new(String::new()));
                    let seen = uri.clone();
                    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        *seen.lock().unwrap() = req.uri().to_string();
                        Ok(resp)
                    };

                    if let Ok(ws) = accept_hdr_async(tcp, callback).await {
                        let (sink, stream) = ws.split();
                        let uri = uri.lock().unwrap().clone();
                        let _ = tx.send(MockConnection { uri, sink, stream });
                    }
                });
            }
        });

        Self { addr, connections }
    }

    pub fn url(&self, path: &str) -> String {
        format!("ws://{}/api/ws/chat/{}", self.addr, path)
    }

    pub fn endpoint(&self, role: Role, participant: ParticipantId, token: &str) -> SignalingEndpoint {
        SignalingEndpoint::new(self.url(role.socket_path()), role, participant, token)
    }

    pub async fn accept(&mut self) -> MockConnection {
        timeout(STEP, self.connections.recv())
            .await
            .expect("no client connected in time")
            .expect("server stopped")
    }

    /// `true` if a client connects within `wait`.
    pub async fn accepts_within(&mut self, wait: Duration) -> bool {
        matches!(timeout(wait, self.connections.recv()).await, Ok(Some(_)))
    }
}

impl MockConnection {
    /// Next text frame, parsed as an envelope.
    pub async fn recv(&mut self) -> SignalingMessage {
        loop {
            let frame = timeout(STEP, self.stream.next())
                .await
                .expect("no frame received in time")
                .expect("connection closed")
                .expect("transport error");
            if let Message::Text(text) = frame {
                return SignalingMessage::parse(&text).expect("client sent a malformed envelope");
            }
        }
    }

    /// Next envelope whose event is `event`, skipping others.
    pub async fn recv_event(&mut self, event: &str) -> SignalingMessage {
        loop {
            let message = self.recv().await;
            if message.event == event {
                return message;
            }
        }
    }

    /// Waits for the client to close the transport.
    pub async fn closed(&mut self) -> bool {
        loop {
            match timeout(STEP, self.stream.next()).await {
                Err(_) => return false,
                Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return true,
                Ok(Some(Ok(_))) => continue,
            }
        }
    }

    pub async fn send(&mut self, message: &SignalingMessage) {
        self.send_raw(&message.to_json().unwrap()).await;
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.sink.send(Message::Text(text.to_string())).await.unwrap();
    }

    pub async fn send_payload(&mut self, payload: &SignalPayload, participant: ParticipantId, sender: ParticipantId) {
        let message = SignalingMessage::new(payload, participant, Some(sender)).unwrap();
        self.send(&message).await;
    }

    /// Forwards every frame between two connections until either side closes.
    pub fn bridge(self, other: MockConnection) {
        let (mut a_sink, mut a_stream) = (self.sink, self.stream);
        let (mut b_sink, mut b_stream) = (other.sink, other.stream);

        tokio::spawn(async move {
            while let Some(Ok(frame)) = a_stream.next().await {
                if frame.is_text() && b_sink.send(frame).await.is_err() {
                    break;
                }
            }
        });
        tokio::spawn(async move {
            while let Some(Ok(frame)) = b_stream.next().await {
                if frame.is_text() && a_sink.send(frame).await.is_err() {
                    break;
                }
            }
        });
    }
}

/// Polls `check` until it returns `true` or `STEP` elapses.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + STEP;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}
