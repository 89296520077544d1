//! Byte streams over a notify/write characteristic pair
//!
//! Notifications from the notify characteristic are fed into an
//! [`InputStream`] in arrival order. Bytes written to an [`OutputStream`] are
//! cut into chunks no larger than the negotiated write size and written to the
//! write characteristic one after another.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{BleSerialError, Result};
use crate::peripheral::PeripheralId;
use crate::platform::{BlePlatform, CharacteristicInfo, WriteType};
use crate::protocol::NegotiatedChannel;

// ----------------------------------------------------------------------------
// Stream Bridge
// ----------------------------------------------------------------------------

/// Connection-side end of a stream pair
pub(crate) struct StreamBridge {
    notify_characteristic: Uuid,
    input: Option<mpsc::UnboundedSender<Vec<u8>>>,
    closed: Arc<AtomicBool>,
}

impl StreamBridge {
    /// Build a bridge and the caller-facing stream pair bound to `channel`
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        peripheral: PeripheralId,
        channel: NegotiatedChannel,
    ) -> (Self, StreamPair) {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let bridge = Self {
            notify_characteristic: channel.notify.uuid,
            input: Some(input_tx),
            closed: closed.clone(),
        };

        let pair = StreamPair {
            input: InputStream {
                receiver: input_rx,
                pending: Vec::new(),
                position: 0,
                closed: closed.clone(),
            },
            output: OutputStream {
                platform,
                peripheral,
                characteristic: channel.write,
                write_type: channel.write_type,
                max_write_size: channel.max_write_size.max(1),
                closed,
            },
        };

        (bridge, pair)
    }

    /// Append a notification payload to the input stream
    pub fn deliver(&self, characteristic: Uuid, value: Vec<u8>) {
        if characteristic != self.notify_characteristic {
            trace!("Ignoring notification from {}", characteristic);
            return;
        }
        if value.is_empty() {
            return;
        }
        trace!("Received {} bytes: {}", value.len(), hex::encode(&value));
        if let Some(input) = &self.input {
            if input.send(value).is_err() {
                trace!("Input stream dropped, discarding notification");
            }
        }
    }

    /// Close both streams; idempotent
    pub fn close(&mut self) {
        if self.input.take().is_some() {
            self.closed.store(true, Ordering::Release);
            debug!("Stream pair closed");
        }
    }
}

impl Drop for StreamBridge {
    fn drop(&mut self) {
        self.close();
    }
}

// ----------------------------------------------------------------------------
// Stream Pair
// ----------------------------------------------------------------------------

/// The byte streams of a ready connection
#[derive(Debug)]
pub struct StreamPair {
    pub input: InputStream,
    pub output: OutputStream,
}

impl StreamPair {
    pub fn into_split(self) -> (InputStream, OutputStream) {
        (self.input, self.output)
    }
}

// ----------------------------------------------------------------------------
// Input Stream
// ----------------------------------------------------------------------------

/// Bytes received from the peripheral.
///
/// Reads return end-of-stream once the connection is gone.
pub struct InputStream {
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Notification partially handed out to a previous read
    pending: Vec<u8>,
    position: usize,
    closed: Arc<AtomicBool>,
}

impl InputStream {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for InputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputStream")
            .field("buffered", &(self.pending.len() - self.position))
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl AsyncRead for InputStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.is_closed() || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        if self.position >= self.pending.len() {
            match self.receiver.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    self.pending = chunk;
                    self.position = 0;
                }
                // Sender gone: the connection ended.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }

        let this = &mut *self;
        let available = &this.pending[this.position..];
        let count = available.len().min(buf.remaining());
        buf.put_slice(&available[..count]);
        this.position += count;
        Poll::Ready(Ok(()))
    }
}

// ----------------------------------------------------------------------------
// Output Stream
// ----------------------------------------------------------------------------

/// Bytes sent to the peripheral
pub struct OutputStream {
    platform: Arc<dyn BlePlatform>,
    peripheral: PeripheralId,
    characteristic: CharacteristicInfo,
    write_type: WriteType,
    max_write_size: usize,
    closed: Arc<AtomicBool>,
}

impl OutputStream {
    /// Write `data`, split into chunks of at most [`max_write_size`] bytes.
    ///
    /// Returns the number of bytes written, which is `data.len()` on success.
    /// A failed chunk aborts the remaining ones.
    ///
    /// [`max_write_size`]: OutputStream::max_write_size
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(BleSerialError::ChannelClosed);
        }

        let mut written = 0;
        for chunk in data.chunks(self.max_write_size) {
            if self.is_closed() {
                return Err(BleSerialError::ChannelClosed);
            }
            trace!("Writing {} bytes: {}", chunk.len(), hex::encode(chunk));
            self.platform
                .write(&self.peripheral, &self.characteristic, chunk, self.write_type)
                .await
                .map_err(|e| BleSerialError::WriteFailed {
                    written,
                    reason: e.to_string(),
                })?;
            written += chunk.len();
        }
        Ok(written)
    }

    pub fn max_write_size(&self) -> usize {
        self.max_write_size
    }

    pub fn write_type(&self) -> WriteType {
        self.write_type
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputStream")
            .field("peripheral", &self.peripheral)
            .field("characteristic", &self.characteristic.uuid)
            .field("max_write_size", &self.max_write_size)
            .field("closed", &self.is_closed())
            .finish()
    }
}
