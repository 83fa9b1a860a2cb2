use crate::control::{StreamEvent, TickSource};
use crate::models::{Candle, KlineEvent};
use crate::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Combined-stream envelope: `{"stream": "...", "data": {...}}`
#[derive(Debug, Deserialize)]
struct Envelope {
    stream: String,
    data: KlinePayload,
}

#[derive(Debug, Deserialize)]
struct KlinePayload {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: RawKline,
}

#[derive(Debug, Deserialize)]
struct RawKline {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "o")]
    open: Decimal,
    #[serde(rename = "h")]
    high: Decimal,
    #[serde(rename = "l")]
    low: Decimal,
    #[serde(rename = "c")]
    close: Decimal,
    #[serde(rename = "v")]
    volume: Decimal,
    #[serde(rename = "x")]
    is_closed: bool,
}

/// Parse one combined-stream text frame
///
/// Frames for other stream types yield `Ok(None)`.
pub fn parse_kline_message(text: &str) -> serde_json::Result<Option<KlineEvent>> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let is_kline = value
        .get("stream")
        .and_then(|s| s.as_str())
        .is_some_and(|s| s.contains("@kline_"));
    if !is_kline {
        return Ok(None);
    }

    let envelope: Envelope = serde_json::from_value(value)?;
    tracing::trace!("Frame from {}", envelope.stream);
    let data = envelope.data;
    Ok(Some(KlineEvent {
        symbol: data.symbol,
        event_time: data.event_time,
        is_closed: data.kline.is_closed,
        candle: Candle {
            open_time: data.kline.open_time,
            open: data.kline.open,
            high: data.kline.high,
            low: data.kline.low,
            close: data.kline.close,
            volume: data.kline.volume,
        },
    }))
}

/// Live `kline_1m` websocket for a set of symbols
pub struct BinanceKlineStream {
    url: String,
    idle_timeout: Duration,
    socket: Option<Socket>,
    last_message: Instant,
}

impl BinanceKlineStream {
    pub fn new(ws_base_url: &str, symbols: &[String], idle_timeout: Duration) -> Self {
        let streams: Vec<String> = symbols
            .iter()
            .map(|s| format!("{}@kline_1m", s.to_lowercase()))
            .collect();
        Self {
            url: format!(
                "{}/stream?streams={}",
                ws_base_url.trim_end_matches('/'),
                streams.join("/")
            ),
            idle_timeout,
            socket: None,
            last_message: Instant::now(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TickSource for BinanceKlineStream {
    async fn connect(&mut self) -> Result<()> {
        tracing::info!(url = %self.url, "Connecting to kline stream");
        let (socket, _) = connect_async(self.url.as_str()).await?;
        self.socket = Some(socket);
        self.last_message = Instant::now();
        tracing::info!("Kline stream connected");
        Ok(())
    }

    async fn next_event(&mut self) -> StreamEvent {
        loop {
            let Some(socket) = self.socket.as_mut() else {
                return StreamEvent::Disconnected("not connected".into());
            };

            // Idle deadline is measured from the last frame, so dropping this future loses nothing
            let deadline = self.last_message + self.idle_timeout;
            let frame = match timeout_at(deadline, socket.next()).await {
                Err(_) => {
                    return StreamEvent::Disconnected(format!(
                        "no data for {}s",
                        self.idle_timeout.as_secs()
                    ))
                }
                Ok(None) => return StreamEvent::Disconnected("stream ended".into()),
                Ok(Some(Err(e))) => return StreamEvent::Disconnected(e.to_string()),
                Ok(Some(Ok(frame))) => frame,
            };
            self.last_message = Instant::now();

            match frame {
                Message::Text(text) => match parse_kline_message(&text) {
                    Ok(Some(event)) => return StreamEvent::Kline(event),
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!(error = %e, "Unparseable kline frame");
                        continue;
                    }
                },
                Message::Close(frame) => {
                    return StreamEvent::Disconnected(format!("closed by server: {:?}", frame))
                }
                // Pings are answered by tungstenite on the next read
                _ => continue,
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.close(None).await {
                tracing::debug!("Error closing kline stream: {}", e);
            }
            tracing::info!("Kline stream closed");
        }
    }
}
