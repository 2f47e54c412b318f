//! WebSocket client speaking the grid event protocol.
//!
//! Used by embedding applications and by the end-to-end tests. Identity is
//! passed the same way a fronting proxy would: `x-user-id` and `x-user-name`
//! headers on the upgrade request.

use std::time::Duration;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use gridsync_core::{GridId, Identity, Operation, SheetId};

use crate::protocol::{ClientEvent, JoinRequest, ProtocolError, ServerEvent};
use crate::server::{USER_ID_HEADER, USER_NAME_HEADER};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct GridClient {
    writer: SplitSink<WsStream, Message>,
    reader: SplitStream<WsStream>,
}

impl GridClient {
    /// Connect to `url`, optionally as a verified user.
    pub async fn connect(url: &str, identity: Option<&Identity>) -> Result<Self, ProtocolError> {
        let mut request = url.into_client_request()?;
        if let Some(identity) = identity {
            let headers = request.headers_mut();
            headers.insert(USER_ID_HEADER, header_value(&identity.id.to_string())?);
            headers.insert(USER_NAME_HEADER, header_value(&identity.display_name)?);
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(request).await?;
        let (writer, reader) = ws_stream.split();
        log::debug!("Connected to {url}");
        Ok(Self { writer, reader })
    }

    pub async fn send(&mut self, event: &ClientEvent) -> Result<(), ProtocolError> {
        let text = event.encode()?;
        self.writer.send(Message::Text(text.into())).await?;
        Ok(())
    }

    pub async fn join(&mut self, grid_id: GridId, sheet_id: Option<SheetId>) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::Join(JoinRequest { grid_id, sheet_id }))
            .await
    }

    pub async fn send_operation(&mut self, op: Operation) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::Operation(op)).await
    }

    /// Next decoded server event. Control frames are skipped.
    pub async fn next_event(&mut self) -> Result<ServerEvent, ProtocolError> {
        loop {
            match self.reader.next().await {
                Some(Ok(Message::Text(text))) => return ServerEvent::decode(text.as_str()),
                Some(Ok(Message::Close(_))) | None => return Err(ProtocolError::ConnectionClosed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Like [`next_event`](Self::next_event) but fails with
    /// [`ProtocolError::Timeout`] when nothing arrives within `timeout`.
    pub async fn next_event_timeout(&mut self, timeout: Duration) -> Result<ServerEvent, ProtocolError> {
        tokio::time::timeout(timeout, self.next_event())
            .await
            .map_err(|_| ProtocolError::Timeout)?
    }

    /// Skip events until one matches `pred`.
    pub async fn wait_for(
        &mut self,
        timeout: Duration,
        mut pred: impl FnMut(&ServerEvent) -> bool,
    ) -> Result<ServerEvent, ProtocolError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let event = self.next_event_timeout(remaining).await?;
            if pred(&event) {
                return Ok(event);
            }
            log::trace!("Skipping {} while waiting", event.name());
        }
    }

    /// Send a close frame and shut the connection down.
    pub async fn close(mut self) -> Result<(), ProtocolError> {
        match self.writer.close().await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn header_value(value: &str) -> Result<HeaderValue, ProtocolError> {
    HeaderValue::from_str(value).map_err(|e| ProtocolError::WebSocket(e.to_string()))
}
