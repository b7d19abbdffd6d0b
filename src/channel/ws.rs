use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::protocol::{self, ClientFrame, ServerFrame};
use super::{Connection, Connector};
use crate::error::ChannelError;
use crate::models::Credentials;

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket connector for the results hub. The bearer credential rides on
/// the upgrade request.
pub struct WsConnector {
    hub_url: Url,
}

impl WsConnector {
    pub fn new(hub_url: Url) -> Self {
        Self { hub_url }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, credentials: &Credentials) -> Result<Box<dyn Connection>, ChannelError> {
        debug!("Connecting to results hub at {}", self.hub_url);

        let mut request = self
            .hub_url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::Transport(format!("Failed to build hub request: {}", e)))?;
        let bearer = HeaderValue::from_str(&credentials.bearer())
            .map_err(|_| ChannelError::Auth("credential is not a valid header value".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _) = match connect_async(request).await {
            Ok(connected) => connected,
            Err(tungstenite::Error::Http(response)) => {
                let status = response.status();
                return Err(match status.as_u16() {
                    401 | 403 => ChannelError::Auth(format!("hub refused upgrade with {}", status)),
                    _ => ChannelError::Transport(format!("hub upgrade failed with {}", status)),
                });
            }
            Err(e) => return Err(ChannelError::Transport(format!("Connection failed: {}", e))),
        };

        info!("Connected to results hub at {}", self.hub_url);
        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: Stream,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, frame: ClientFrame) -> Result<(), ChannelError> {
        let payload = protocol::encode(&frame)?;
        self.stream
            .send(Message::Text(payload.into()))
            .await
            .map_err(|e| ChannelError::Transport(format!("Failed to send frame: {}", e)))
    }

    async fn recv(&mut self) -> Option<Result<ServerFrame, ChannelError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(protocol::decode(text.as_str())),
                Ok(Message::Binary(bytes)) => {
                    return Some(match std::str::from_utf8(&bytes) {
                        Ok(text) => protocol::decode(text),
                        Err(e) => Err(ChannelError::Protocol(format!("binary frame is not UTF-8: {}", e))),
                    });
                }
                Ok(Message::Close(frame)) => {
                    debug!("Results hub closed the connection: {:?}", frame);
                    return None;
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Err(e) => {
                    warn!("Results hub read failed: {}", e);
                    return Some(Err(ChannelError::Transport(e.to_string())));
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("Error while closing hub connection: {}", e);
        }
    }
}
