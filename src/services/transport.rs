//! Push transport abstraction and its WebSocket and in-memory implementations.

use futures::{SinkExt, StreamExt, future::BoxFuture};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Message, client::IntoClientRequest, http::HeaderValue},
};
use tracing::debug;
use url::Url;

use crate::error::TransportError;

/// Header carrying the application key on the upgrade request.
pub const APPLICATION_KEY_HEADER: &str = "x-application-key";
/// Query parameter carrying the application key on the endpoint URL.
pub const APPLICATION_KEY_PARAM: &str = "applicationKey";

/// An established bidirectional text-frame connection.
pub trait Transport: Send {
    /// Write one text frame.
    fn send(&mut self, frame: String) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Next text frame, or `None` once the peer closed the connection.
    fn recv(&mut self) -> BoxFuture<'_, Option<Result<String, TransportError>>>;

    /// Close the connection, ignoring errors.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Opens new transports. Called once per connection attempt.
pub trait Connector: Send + Sync {
    /// Open a fresh transport.
    fn connect(&self) -> BoxFuture<'static, Result<Box<dyn Transport>, TransportError>>;
}

/// Connects to the backend over a WebSocket authenticated with an application key.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
    application_key: String,
}

impl WsConnector {
    /// Connector for the backend at `url`, authenticating with `application_key`.
    pub fn new(url: Url, application_key: impl Into<String>) -> Self {
        Self {
            url,
            application_key: application_key.into(),
        }
    }

    /// Endpoint with the application key appended to the query. Existing query pairs and any
    /// fragment are kept.
    pub fn endpoint(&self) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair(APPLICATION_KEY_PARAM, &self.application_key);
        url
    }
}

impl Connector for WsConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Box<dyn Transport>, TransportError>> {
        let mut endpoint = self.endpoint();
        // Fragments never reach the server.
        endpoint.set_fragment(None);
        let key = self.application_key.clone();
        Box::pin(async move {
            let mut request = endpoint
                .as_str()
                .into_client_request()
                .map_err(|err| TransportError::Connect(err.to_string()))?;
            let header = HeaderValue::from_str(&key)
                .map_err(|err| TransportError::Connect(format!("invalid application key: {err}")))?;
            request.headers_mut().insert(APPLICATION_KEY_HEADER, header);

            let (stream, response) = connect_async(request)
                .await
                .map_err(|err| TransportError::Connect(err.to_string()))?;
            debug!(status = %response.status(), "websocket upgrade accepted");
            Ok(Box::new(WsTransport { stream }) as Box<dyn Transport>)
        })
    }
}

struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Transport for WsTransport {
    fn send(&mut self, frame: String) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.stream
                .send(Message::Text(frame))
                .await
                .map_err(|err| TransportError::Closed(err.to_string()))
        })
    }

    fn recv(&mut self) -> BoxFuture<'_, Option<Result<String, TransportError>>> {
        Box::pin(async move {
            loop {
                match self.stream.next().await? {
                    Ok(Message::Text(text)) => return Some(Ok(text)),
                    Ok(Message::Close(_)) => return None,
                    // Ping/Pong are answered by tungstenite; binary frames are not part of the protocol.
                    Ok(_) => continue,
                    Err(err) => return Some(Err(TransportError::Closed(err.to_string()))),
                }
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(err) = self.stream.close(None).await {
                debug!(error = %err, "websocket close handshake failed");
            }
        })
    }
}

/// In-process transport pair for tests and host simulations.
pub mod memory {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use futures::future::BoxFuture;
    use serde_json::Value;
    use tokio::sync::mpsc;

    use super::{Connector, Transport};
    use crate::error::TransportError;

    /// Client side connector. Every successful connect hands a [`MemoryServer`] to the listener.
    #[derive(Clone)]
    pub struct MemoryConnector {
        sessions: mpsc::UnboundedSender<MemoryServer>,
        refusals: Arc<AtomicU32>,
        attempts: Arc<AtomicU32>,
    }

    /// Server side accept queue.
    pub struct MemoryListener {
        sessions: mpsc::UnboundedReceiver<MemoryServer>,
    }

    /// Server end of one connection.
    pub struct MemoryServer {
        to_client: Option<mpsc::UnboundedSender<String>>,
        from_client: mpsc::UnboundedReceiver<String>,
    }

    struct MemoryTransport {
        to_server: mpsc::UnboundedSender<String>,
        from_server: mpsc::UnboundedReceiver<String>,
    }

    /// Connected client and server halves sharing one session queue.
    pub fn pair() -> (MemoryConnector, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MemoryConnector {
                sessions: tx,
                refusals: Arc::new(AtomicU32::new(0)),
                attempts: Arc::new(AtomicU32::new(0)),
            },
            MemoryListener { sessions: rx },
        )
    }

    impl MemoryConnector {
        /// Make the next `count` connection attempts fail.
        pub fn refuse_next(&self, count: u32) {
            self.refusals.store(count, Ordering::SeqCst);
        }

        /// Connection attempts made so far, successful or not.
        pub fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl Connector for MemoryConnector {
        fn connect(&self) -> BoxFuture<'static, Result<Box<dyn Transport>, TransportError>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let refused = self
                .refusals
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if refused {
                return Box::pin(async { Err(TransportError::Connect("connection refused".into())) });
            }

            let (to_server, from_client) = mpsc::unbounded_channel();
            let (to_client, from_server) = mpsc::unbounded_channel();
            let server = MemoryServer {
                to_client: Some(to_client),
                from_client,
            };
            let accepted = self.sessions.send(server).is_ok();
            Box::pin(async move {
                if !accepted {
                    return Err(TransportError::Connect("listener dropped".into()));
                }
                Ok(Box::new(MemoryTransport {
                    to_server,
                    from_server,
                }) as Box<dyn Transport>)
            })
        }
    }

    impl MemoryListener {
        /// Next session opened by the connector, `None` once it is dropped.
        pub async fn accept(&mut self) -> Option<MemoryServer> {
            self.sessions.recv().await
        }
    }

    impl MemoryServer {
        /// Next frame sent by the client, parsed as JSON.
        pub async fn next_frame(&mut self) -> Option<Value> {
            let text = self.from_client.recv().await?;
            serde_json::from_str(&text).ok()
        }

        /// Next frame whose event name is `event`, skipping others.
        pub async fn expect_event(&mut self, event: &str) -> Option<Value> {
            loop {
                let frame = self.next_frame().await?;
                if frame["event"] == event {
                    return Some(frame);
                }
            }
        }

        /// Push `{ event, data }` to the client. Returns `false` once the client is gone.
        pub fn push(&self, event: &str, data: Value) -> bool {
            let frame = serde_json::json!({ "event": event, "data": data });
            self.to_client
                .as_ref()
                .is_some_and(|tx| tx.send(frame.to_string()).is_ok())
        }

        /// Close the server side; the client observes a disconnect.
        pub fn close(&mut self) {
            self.to_client.take();
        }
    }

    impl Transport for MemoryTransport {
        fn send(&mut self, frame: String) -> BoxFuture<'_, Result<(), TransportError>> {
            let result = self
                .to_server
                .send(frame)
                .map_err(|_| TransportError::Closed("server gone".into()));
            Box::pin(async move { result })
        }

        fn recv(&mut self) -> BoxFuture<'_, Option<Result<String, TransportError>>> {
            Box::pin(async move { self.from_server.recv().await.map(Ok) })
        }

        fn close(&mut self) -> BoxFuture<'_, ()> {
            self.from_server.close();
            Box::pin(async {})
        }
    }
}
