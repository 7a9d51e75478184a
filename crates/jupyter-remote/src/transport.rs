//! Socket plumbing between a [`KernelConnection`](crate::KernelConnection)
//! and the server's `/api/kernels/{id}/channels` endpoint.
//!
//! The connection never sees WebSocket types directly. It talks to a
//! [`KernelSocket`], a pair of boxed sink/stream halves carrying [`Frame`]s,
//! obtained from a [`SocketConnector`]. The production connector dials the
//! server with tokio-tungstenite; tests plug in an in-memory one.

use std::pin::Pin;
use std::sync::Arc;

use futures::future::{self, BoxFuture};
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use jupyter_wire::{decode_binary, encode_binary, WireMessage};
use log::{debug, info};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::error::{Error, Result};
use crate::server_connection::ServerConnection;

/// One WebSocket frame, stripped of the library's types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

impl Frame {
    /// Encode a message for the wire. Messages with buffers need the binary
    /// framing; everything else goes as a JSON text frame.
    pub fn encode(message: &WireMessage) -> Result<Frame> {
        if message.buffers.is_empty() {
            let text = message
                .to_json()
                .map_err(|e| Error::Protocol(e.to_string()))?;
            Ok(Frame::Text(text))
        } else {
            let bytes = encode_binary(message).map_err(|e| Error::Protocol(e.to_string()))?;
            Ok(Frame::Binary(bytes))
        }
    }

    /// Decode a data frame. `Ok(None)` for control frames.
    pub fn decode(&self) -> Result<Option<WireMessage>> {
        let decoded = match self {
            Frame::Text(text) => WireMessage::from_json(text),
            Frame::Binary(bytes) => decode_binary(bytes),
            Frame::Ping(_) | Frame::Pong(_) | Frame::Close => return Ok(None),
        };
        decoded
            .map(Some)
            .map_err(|e| Error::Protocol(e.to_string()))
    }
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = Error> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

/// An open socket to one kernel.
pub struct KernelSocket {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl KernelSocket {
    pub fn new<Si, St>(sink: Si, stream: St) -> Self
    where
        Si: Sink<Frame, Error = Error> + Send + 'static,
        St: Stream<Item = Result<Frame>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }

    pub fn from_websocket<S>(socket: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = socket.split();
        let sink = sink
            .sink_map_err(|e| Error::Network(e.to_string()))
            .with(|frame: Frame| future::ready(Ok::<Message, Error>(to_message(frame))));
        let stream = stream.filter_map(|item| {
            future::ready(match item {
                Ok(message) => from_message(message).map(Ok),
                Err(e) => Some(Err(Error::Network(e.to_string()))),
            })
        });
        Self::new(sink, stream)
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(bytes) => Message::Binary(bytes.into()),
        Frame::Ping(payload) => Message::Ping(payload.into()),
        Frame::Pong(payload) => Message::Pong(payload.into()),
        Frame::Close => Message::Close(None),
    }
}

fn from_message(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
        Message::Binary(bytes) => Some(Frame::Binary(bytes.to_vec())),
        Message::Ping(payload) => Some(Frame::Ping(payload.to_vec())),
        Message::Pong(payload) => Some(Frame::Pong(payload.to_vec())),
        Message::Close(_) => Some(Frame::Close),
        // Raw frames only show up when writing, never when reading.
        Message::Frame(_) => None,
    }
}

/// Opens sockets to kernels. Called again for every reconnect attempt.
pub trait SocketConnector: Send + Sync + 'static {
    fn connect(&self, kernel_id: &str, session_id: &str) -> BoxFuture<'static, Result<KernelSocket>>;
}

/// Dials `ws(s)://…/api/kernels/{id}/channels?session_id=…` on a server.
pub struct WebSocketConnector {
    server: Arc<ServerConnection>,
}

impl WebSocketConnector {
    pub fn new(server: Arc<ServerConnection>) -> Self {
        Self { server }
    }
}

impl SocketConnector for WebSocketConnector {
    fn connect(&self, kernel_id: &str, session_id: &str) -> BoxFuture<'static, Result<KernelSocket>> {
        let server = Arc::clone(&self.server);
        let kernel_id = kernel_id.to_string();
        let session_id = session_id.to_string();

        async move {
            let mut url = server.build_ws_url(&format!("api/kernels/{}/channels", kernel_id))?;
            url.query_pairs_mut().append_pair("session_id", &session_id);

            let mut request = url
                .as_str()
                .into_client_request()
                .map_err(|e| Error::Config(e.to_string()))?;
            if let Some(value) = server.auth_value() {
                let name = HeaderName::from_bytes(server.settings().auth_header.as_bytes())
                    .map_err(|e| Error::Config(format!("auth header name: {}", e)))?;
                let value = HeaderValue::from_str(&value)
                    .map_err(|e| Error::Config(format!("auth header value: {}", e)))?;
                request.headers_mut().insert(name, value);
            }

            debug!("[ws] Connecting to kernel {}", kernel_id);
            let (socket, _response) = tokio_tungstenite::connect_async(request)
                .await
                .map_err(|e| classify_handshake_error(&kernel_id, e))?;
            info!("[ws] Connected to kernel {}", kernel_id);
            Ok(KernelSocket::from_websocket(socket))
        }
        .boxed()
    }
}

fn classify_handshake_error(kernel_id: &str, err: tungstenite::Error) -> Error {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            match status {
                401 | 403 => Error::Auth { status },
                404 => Error::NotFound(format!("kernel {}", kernel_id)),
                _ => Error::Server {
                    status,
                    message: format!("WebSocket upgrade for kernel {} refused", kernel_id),
                },
            }
        }
        other => Error::Network(other.to_string()),
    }
}
