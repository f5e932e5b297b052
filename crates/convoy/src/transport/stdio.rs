//! JSON Lines transport: one [`InboundEvent`] per line from any async reader.

use async_trait::async_trait;
use convoy_protocol::InboundEvent;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Connection, Disconnect, EventSink, Transport, TransportError};

/// Reads events from a single stream. The stream can be connected once;
/// later connects fail with [`TransportError::Closed`].
pub struct JsonLinesTransport<R> {
    reader: Mutex<Option<R>>,
}

impl<R> JsonLinesTransport<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: Mutex::new(Some(reader)),
        }
    }
}

impl JsonLinesTransport<BufReader<tokio::io::Stdin>> {
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

#[async_trait]
impl<R> Transport for JsonLinesTransport<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    fn name(&self) -> &str {
        "json-lines"
    }

    async fn connect(&self, sink: EventSink) -> Result<Box<dyn Connection>, TransportError> {
        let reader = self.reader.lock().await.take().ok_or(TransportError::Closed)?;
        let (done_tx, done_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut lines = reader.lines();
            let end = loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<InboundEvent>(line) {
                            Ok(event) => {
                                let delivery = sink.deliver(event);
                                debug!(?delivery, "Delivered inbound event");
                            }
                            Err(e) => warn!(error = %e, "Skipping malformed event line"),
                        }
                    }
                    Ok(None) => break Disconnect::Finished,
                    Err(e) => break Disconnect::Dropped(TransportError::Io(e)),
                }
            };
            let _ = done_tx.send(end);
        });

        Ok(Box::new(JsonLinesConnection { done_rx, task }))
    }
}

struct JsonLinesConnection {
    done_rx: oneshot::Receiver<Disconnect>,
    task: JoinHandle<()>,
}

#[async_trait]
impl Connection for JsonLinesConnection {
    async fn wait(&mut self) -> Disconnect {
        (&mut self.done_rx)
            .await
            .unwrap_or(Disconnect::Dropped(TransportError::Closed))
    }
}

impl Drop for JsonLinesConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}
