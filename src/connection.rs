//! Line-oriented link to one device. No protocol knowledge lives here.

use std::{fmt, time::Duration};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// One open link to a device, exclusively owned by whoever opened it.
///
/// Lines are written with a `\n` terminator; reads return one trimmed line
/// at a time.
pub struct Connection {
    device_path: String,
    write: BoxedWrite,
    read: BufReader<BoxedRead>,

    // Bytes of a line whose read timed out before the terminator arrived.
    partial: Vec<u8>,
}

impl Connection {
    /// Create a new [Connection] from the two halves of some underlying
    /// byte stream.
    pub fn new<ReadT, WriteT>(device_path: &str, read: ReadT, write: WriteT) -> Self
    where
        ReadT: AsyncRead + Send + Unpin + 'static,
        WriteT: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            device_path: device_path.to_owned(),
            write: Box::new(write),
            read: BufReader::new(Box::new(read)),
            partial: Vec::new(),
        }
    }

    /// Split a bidirectional stream into a [Connection].
    pub fn from_stream<StreamT>(device_path: &str, stream: StreamT) -> Self
    where
        StreamT: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        Self::new(device_path, read, write)
    }

    /// Path of the device this link talks to.
    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    /// Write one line to the device.
    pub async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        tracing::trace!(device = self.device_path, line = line, "send");
        self.write.write_all(line.as_bytes()).await?;
        self.write.write_all(b"\n").await?;
        self.write.flush().await
    }

    /// Read one line, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when the wait expires. A line cut short by the
    /// timeout is kept and completed by the next call. Returns an
    /// `UnexpectedEof` error when the device side closed the link.
    pub async fn read_line(&mut self, timeout: Duration) -> std::io::Result<Option<String>> {
        match tokio::time::timeout(timeout, self.read.read_until(b'\n', &mut self.partial)).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(e),
            Ok(Ok(0)) => Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "device closed the link",
            )),
            Ok(Ok(_)) => {
                if self.partial.last() != Some(&b'\n') {
                    // EOF in the middle of a line.
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "device closed the link mid-line",
                    ));
                }
                let bytes = std::mem::take(&mut self.partial);
                let line = String::from_utf8_lossy(&bytes).trim().to_owned();
                tracing::trace!(device = self.device_path, line = line, "recv");
                Ok(Some(line))
            }
        }
    }

    /// Flush and shut the link down.
    pub async fn close(mut self) -> std::io::Result<()> {
        tracing::debug!(device = self.device_path, "closing link");
        self.write.shutdown().await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("device_path", &self.device_path).finish()
    }
}
