// Websocket transport for the realtime channel.
//
// Each STOMP frame travels as one websocket text message. The connector
// spawns a writer task (frames -> websocket) and a reader task
// (websocket -> frames) and hands the channel ends back as a `Link`.

use async_trait::async_trait;
use futures_util::stream::Stream;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, Connector, Credential, Link};
use crate::stomp::Frame;

/// Buffered frames per direction.
const LINK_CAPACITY: usize = 256;

/// Opens STOMP-over-websocket links to a fixed endpoint.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        WsConnector { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    fn host(&self) -> String {
        host_of(&self.url)
    }

    async fn open(&self, credential: &Credential) -> Result<Link, ChannelError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| {
                ChannelError::Connect(format!("invalid websocket url {}: {e}", self.url))
            })?;
        let auth = HeaderValue::from_str(&credential.bearer())
            .map_err(|_| ChannelError::Connect("credential is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        info!("Websocket connected to {}", self.url);

        let (write, read) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::channel(LINK_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(LINK_CAPACITY);

        tokio::spawn(write_frames(out_rx, write));
        let url = self.url.clone();
        tokio::spawn(async move {
            let _ = process_message_stream(read, &in_tx, &url).await;
        });

        Ok(Link::new(out_tx, in_rx))
    }
}

/// `ws://host:port/path` -> `host:port`.
fn host_of(url: &str) -> String {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    rest.split('/').next().unwrap_or(rest).to_string()
}

/// Writer task: encode frames until the channel side drops its sender, then
/// close the websocket.
async fn write_frames<S>(mut rx: mpsc::Receiver<Frame>, mut sink: S)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(frame) = rx.recv().await {
        if let Err(e) = sink.send(Message::Text(frame.encode().into())).await {
            warn!("Websocket write failed: {e}");
            break;
        }
    }
    let _ = sink.close().await;
    debug!("Websocket writer finished");
}

/// Decode websocket messages into frames and forward them through `tx`.
/// Heart-beats and undecodable frames are skipped. Returns `Err(())` when the
/// receiver is gone.
///
/// Generic over the stream so it can be tested without a socket.
pub async fn process_message_stream<St>(
    mut stream: St,
    tx: &mpsc::Sender<Frame>,
    peer: &str,
) -> Result<(), ()>
where
    St: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match Frame::decode(text.as_str()) {
                Ok(Some(frame)) => {
                    if tx.send(frame).await.is_err() {
                        return Err(());
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Dropping undecodable frame from {peer}: {e}"),
            },
            Ok(Message::Close(_)) => {
                info!("{peer} sent close frame");
                break;
            }
            Err(e) => {
                warn!("Websocket error from {peer}: {e}");
                break;
            }
            _ => {
                // Binary, Ping, Pong and raw frames carry no STOMP traffic.
            }
        }
    }
    Ok(())
}
