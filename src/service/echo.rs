//! Echo service: replies to every DATA frame with the same payload.

use std::sync::Arc;
use std::time::Duration;

use crate::channel::{Channel, ChannelHandle, HandleFactory, TrackedHandle};
use crate::net::protocol::{Frame, FramedStream, ProtocolError};

pub const SERVICE_NAME: &str = "echo";

#[derive(Debug, Clone, Default)]
pub struct EchoService {
    reply_delay: Option<Duration>,
}

impl EchoService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold each request for `delay` before replying.
    pub fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = Some(delay);
        self
    }
}

impl HandleFactory for EchoService {
    fn create_handle(&self, channel: &Channel, stream: FramedStream) -> Arc<dyn ChannelHandle> {
        let handle = Arc::new(TrackedHandle::new(channel.clone()));
        tokio::spawn(serve(Arc::clone(&handle), stream, self.reply_delay));
        handle
    }
}

enum Exit {
    /// Handle drained or channel closed locally.
    Shutdown,
    /// Peer sent CLOSED.
    PeerClosed,
    /// Stream ended or broke.
    Disconnected,
}

async fn serve(handle: Arc<TrackedHandle>, mut stream: FramedStream, reply_delay: Option<Duration>) {
    let channel = handle.channel().clone();
    let exit = loop {
        let frame = tokio::select! {
            biased;
            _ = handle.drained() => break Exit::Shutdown,
            frame = stream.read_frame() => frame,
        };

        match frame {
            Ok(Frame::Data(message)) => {
                let Some(_request) = handle.begin() else {
                    break Exit::Shutdown;
                };
                if let Some(delay) = reply_delay {
                    tokio::time::sleep(delay).await;
                }
                metrics::counter!("remoting_echo_messages_total").increment(1);
                if let Err(e) = stream.write_frame(&Frame::Data(message)).await {
                    tracing::debug!(channel_id = %channel.id(), error = %e, "Echo reply failed");
                    break Exit::Disconnected;
                }
            }
            Ok(Frame::Closed(_)) => break Exit::PeerClosed,
            Ok(other) => {
                tracing::debug!(channel_id = %channel.id(), verb = other.verb(), "Unexpected frame on echo channel");
                let _ = stream
                    .write_frame(&Frame::Closed(format!("unexpected {}", other.verb())))
                    .await;
                break Exit::Disconnected;
            }
            Err(ProtocolError::Closed) => break Exit::Disconnected,
            Err(e) => {
                tracing::debug!(channel_id = %channel.id(), error = %e, "Echo channel read failed");
                break Exit::Disconnected;
            }
        }
    };

    if matches!(exit, Exit::Shutdown) {
        let _ = stream.write_frame(&Frame::Closed("service is shutting down".into())).await;
    }
    let _ = stream.shutdown().await;
    channel.close();
}
