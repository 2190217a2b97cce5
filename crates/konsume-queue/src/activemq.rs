//! ActiveMQ consumer via STOMP.
//!
//! Connects over TCP with LOGIN credentials and 2-hour heart-beats,
//! subscribes with auto-ack and delivers message bodies to the handler from
//! a background task. Close unsubscribes, then disconnects.

use std::sync::Arc;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::{debug, error, info};

use crate::stomp::{Frame, StompCodec};
use crate::{MessageHandler, QueueConsumer, QueueError, Result};
use async_trait::async_trait;
use konsume_config::StompSettings;

// rw heart-beat interval, in milliseconds
const HEARTBEAT_MS: u64 = 2 * 60 * 60 * 1000;
const SUBSCRIPTION_ID: &str = "0";

type StompTransport = Framed<TcpStream, StompCodec>;

pub struct ActiveMqConsumer {
    settings: StompSettings,
    transport: Mutex<Option<StompTransport>>,
    writer: Mutex<Option<SplitSink<StompTransport, Frame>>>,
}

impl ActiveMqConsumer {
    pub fn new(settings: StompSettings) -> Self {
        Self {
            settings,
            transport: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }
}

#[async_trait]
impl QueueConsumer for ActiveMqConsumer {
    async fn connect(&self) -> Result<()> {
        let address = format!("{}:{}", self.settings.host, self.settings.port);
        debug!(address = %address, "connecting to ActiveMQ");

        let stream = TcpStream::connect(&address)
            .await
            .map_err(|e| QueueError::Connect(format!("TCP connect failed: {e}")))?;
        let mut transport = Framed::new(stream, StompCodec);

        let connect = Frame::new("CONNECT")
            .with_header("accept-version", "1.2")
            .with_header("host", &self.settings.host)
            .with_header("login", &self.settings.username)
            .with_header("passcode", &self.settings.password)
            .with_header("heart-beat", &format!("{HEARTBEAT_MS},{HEARTBEAT_MS}"));
        transport
            .send(connect)
            .await
            .map_err(|e| QueueError::Connect(format!("CONNECT failed: {e}")))?;

        match transport.next().await {
            Some(Ok(frame)) if frame.command == "CONNECTED" => {}
            Some(Ok(frame)) => {
                return Err(QueueError::Connect(format!(
                    "broker rejected connection: {} {}",
                    frame.command,
                    frame.header("message").unwrap_or_default()
                )));
            }
            Some(Err(e)) => return Err(QueueError::Connect(e.to_string())),
            None => {
                return Err(QueueError::Connect(
                    "connection closed during handshake".into(),
                ));
            }
        }

        *self.transport.lock().await = Some(transport);
        info!(address = %address, "connected to ActiveMQ");
        Ok(())
    }

    async fn consume(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut transport = self
            .transport
            .lock()
            .await
            .take()
            .ok_or(QueueError::NotConnected)?;

        let subscribe = Frame::new("SUBSCRIBE")
            .with_header("id", SUBSCRIPTION_ID)
            .with_header("destination", queue)
            .with_header("ack", "auto");
        transport
            .send(subscribe)
            .await
            .map_err(|e| QueueError::Consume(format!("SUBSCRIBE failed: {e}")))?;

        let (writer, mut reader) = transport.split();
        *self.writer.lock().await = Some(writer);

        let queue_name = queue.to_string();
        tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(frame) if frame.command == "MESSAGE" => {
                        if let Err(e) = handler.handle(frame.body).await {
                            error!(queue = %queue_name, error = %e, "failed to process message");
                        }
                    }
                    Ok(frame) if frame.command == "ERROR" => {
                        error!(
                            queue = %queue_name,
                            message = frame.header("message").unwrap_or_default(),
                            "broker sent ERROR frame"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(queue = %queue_name, error = %e, "failed to read STOMP frame");
                        break;
                    }
                }
            }
            debug!(queue = %queue_name, "STOMP reader exited");
        });

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let unsubscribe = Frame::new("UNSUBSCRIBE").with_header("id", SUBSCRIPTION_ID);
            writer
                .send(unsubscribe)
                .await
                .map_err(|e| QueueError::Close(e.to_string()))?;
            writer
                .send(Frame::new("DISCONNECT"))
                .await
                .map_err(|e| QueueError::Close(e.to_string()))?;
            let _ = writer.close().await;
        }
        // Connected but never consumed: drop the intact transport as well.
        self.transport.lock().await.take();
        info!(host = %self.settings.host, "ActiveMQ consumer closed");
        Ok(())
    }
}
