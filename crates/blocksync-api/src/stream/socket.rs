// ── Transport seam ──
//
// A `Connector` opens one underlying channel and hands back a frame
// reader plus a payload writer. The connection actor owns both halves
// for the lifetime of a single session and never holds two at once.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt, future};
use reqwest::header::HeaderValue;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder, Message};
use url::Url;

use super::envelope::Payload;
use crate::error::Error;
use crate::transport::TransportConfig;

/// Inbound frame, transport-agnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Ping,
    Pong,
    Close { code: u16, reason: String },
}

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, Error>> + Send>>;
pub type PayloadSink = Pin<Box<dyn Sink<Payload, Error = Error> + Send>>;
pub type ConnectFuture = Pin<Box<dyn Future<Output = Result<Transport, Error>> + Send>>;

/// One open session: frames in, payloads out.
pub struct Transport {
    pub reader: FrameStream,
    pub writer: PayloadSink,
}

/// Opens transports to an endpoint.
///
/// Implementations must resolve only once the channel is usable; the
/// connection actor treats a resolved `Ok` as the open confirmation.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, endpoint: &Url) -> ConnectFuture;
}

// ── tokio-tungstenite ────────────────────────────────────────────────

/// WebSocket connector backed by tokio-tungstenite.
#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector {
    authorization: Option<HeaderValue>,
}

impl TungsteniteConnector {
    /// Build a connector that reuses the HTTP transport's bearer token on
    /// the upgrade request.
    pub fn new(transport: &TransportConfig) -> Result<Self, Error> {
        Ok(Self {
            authorization: transport.bearer_header()?,
        })
    }
}

impl Connector for TungsteniteConnector {
    fn connect(&self, endpoint: &Url) -> ConnectFuture {
        let endpoint = endpoint.clone();
        let authorization = self.authorization.clone();

        Box::pin(async move {
            tracing::info!(url = %endpoint, "Connecting to stream");

            let uri: tungstenite::http::Uri = endpoint.as_str().parse().map_err(
                |e: tungstenite::http::uri::InvalidUri| Error::StreamConnect(e.to_string()),
            )?;

            let mut request = ClientRequestBuilder::new(uri);
            if let Some(value) = authorization {
                let value = value
                    .to_str()
                    .map_err(|e| Error::StreamConnect(format!("invalid auth header: {e}")))?
                    .to_owned();
                request = request.with_header("Authorization", value);
            }

            let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
                .await
                .map_err(|e| Error::StreamConnect(e.to_string()))?;

            tracing::info!(url = %endpoint, "Stream connected");

            let (write, read) = ws_stream.split();
            let writer = write
                .with(|payload: Payload| future::ready(Ok::<_, tungstenite::Error>(to_message(payload))))
                .sink_map_err(|e| Error::StreamTransport(e.to_string()));
            let reader = read.filter_map(|msg| future::ready(to_frame(msg)));

            Ok(Transport {
                reader: Box::pin(reader),
                writer: Box::pin(writer),
            })
        })
    }
}

fn to_message(payload: Payload) -> Message {
    match payload {
        Payload::Text(text) => Message::text(text),
        Payload::Binary(bytes) => Message::binary(bytes),
    }
}

fn to_frame(msg: Result<Message, tungstenite::Error>) -> Option<Result<Frame, Error>> {
    let frame = match msg {
        Ok(Message::Text(text)) => Frame::Text(text.as_str().to_owned()),
        Ok(Message::Binary(bytes)) => Frame::Binary(bytes),
        // tungstenite queues pong replies automatically
        Ok(Message::Ping(_)) => Frame::Ping,
        Ok(Message::Pong(_)) => Frame::Pong,
        Ok(Message::Close(frame)) => match frame {
            Some(cf) => Frame::Close {
                code: u16::from(cf.code),
                reason: cf.reason.as_str().to_owned(),
            },
            None => Frame::Close {
                code: 1005,
                reason: String::new(),
            },
        },
        Ok(Message::Frame(_)) => return None,
        Err(e) => return Some(Err(Error::StreamTransport(e.to_string()))),
    };
    Some(Ok(frame))
}
