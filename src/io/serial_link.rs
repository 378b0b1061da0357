//! Serial links - line-oriented access to one serial port
//!
//! Every input, output and printer connection goes through `SerialLink`.
//! Reads never wait for a line: bytes already buffered by the OS are pulled
//! in and a line is handed out only once its `\n` has arrived.

use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialPortType, SerialStream};
use tracing::{debug, info, warn};

/// Longest line kept while waiting for a terminator
const MAX_LINE_LEN: usize = 4096;
/// Bytes pulled from the port per read
const READ_CHUNK: usize = 256;

/// Opening a port failed. Callers disable the channel instead of aborting.
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("serial port {port} not found")]
    NotFound { port: String },
    #[error("serial port {port} is busy or access was denied")]
    Busy { port: String },
    #[error("failed to open serial port {port}: {message}")]
    Other { port: String, message: String },
}

impl OpenError {
    pub fn port(&self) -> &str {
        match self {
            OpenError::NotFound { port } | OpenError::Busy { port } | OpenError::Other { port, .. } => {
                port
            }
        }
    }

    fn from_serial(port: &str, e: tokio_serial::Error) -> Self {
        use std::io::ErrorKind as Io;
        use tokio_serial::ErrorKind;

        let port = port.to_string();
        match e.kind {
            ErrorKind::NoDevice | ErrorKind::Io(Io::NotFound) => OpenError::NotFound { port },
            ErrorKind::Io(Io::PermissionDenied) | ErrorKind::Io(Io::AddrInUse) => {
                OpenError::Busy { port }
            }
            _ => OpenError::Other { port, message: e.description },
        }
    }
}

/// Read or write on an open link failed
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("link {port} is closed")]
    Closed { port: String },
    #[error("I/O error on {port}: {source}")]
    Io {
        port: String,
        #[source]
        source: std::io::Error,
    },
}

impl LinkError {
    pub fn io(port: &str, source: impl Into<std::io::Error>) -> Self {
        LinkError::Io { port: port.to_string(), source: source.into() }
    }
}

/// One open serial connection, owned by exactly one component at a time
#[async_trait]
pub trait SerialLink: Send {
    /// Port name the link was opened on
    fn port(&self) -> &str;

    /// Next complete line without its terminator, or `None` if no full line is buffered
    async fn try_read_line(&mut self) -> Result<Option<String>, LinkError>;

    /// Write all bytes, best effort
    async fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError>;

    /// Release the port. Safe to call more than once.
    async fn close(&mut self);
}

/// Opens links by port name
pub trait LinkFactory: Send + Sync {
    fn open(&self, port: &str, baud: u32) -> Result<Box<dyn SerialLink>, OpenError>;
}

/// Accumulates raw bytes and splits them into lines on `\n`
///
/// A trailing `\r` is dropped with the terminator. Invalid UTF-8 is
/// replaced, never rejected.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(READ_CHUNK) }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);

        // No terminator in sight: drop the garbage rather than grow forever
        if self.buf.len() > MAX_LINE_LEN && !self.buf.contains(&b'\n') {
            warn!(discarded = self.buf.len(), "line_buffer_overflow");
            self.buf.clear();
        }
    }

    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let line = self.buf.split_to(pos + 1);

        let mut end = pos;
        if end > 0 && line[end - 1] == b'\r' {
            end -= 1;
        }
        Some(String::from_utf8_lossy(&line[..end]).into_owned())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// `SerialLink` over a real port via tokio-serial
pub struct TokioSerialLink {
    port: String,
    stream: Option<SerialStream>,
    lines: LineBuffer,
}

impl TokioSerialLink {
    /// Open `port`. The read timeout only bounds a blocking read.
    pub fn open(port: &str, baud: u32, read_timeout: Duration) -> Result<Self, OpenError> {
        let stream = tokio_serial::new(port, baud)
            .timeout(read_timeout)
            .open_native_async()
            .map_err(|e| OpenError::from_serial(port, e))?;

        info!(port = %port, baud = %baud, "serial_link_opened");

        Ok(Self { port: port.to_string(), stream: Some(stream), lines: LineBuffer::new() })
    }
}

#[async_trait]
impl SerialLink for TokioSerialLink {
    fn port(&self) -> &str {
        &self.port
    }

    async fn try_read_line(&mut self) -> Result<Option<String>, LinkError> {
        if let Some(line) = self.lines.next_line() {
            return Ok(Some(line));
        }

        let Some(stream) = self.stream.as_mut() else {
            return Err(LinkError::Closed { port: self.port.clone() });
        };

        let available = stream.bytes_to_read().map_err(|e| LinkError::io(&self.port, e))?;
        if available == 0 {
            return Ok(None);
        }

        let mut chunk = [0u8; READ_CHUNK];
        let n = stream.read(&mut chunk).await.map_err(|e| LinkError::io(&self.port, e))?;
        tracing::trace!(port = %self.port, bytes = n, "serial_link_read");
        self.lines.extend(&chunk[..n]);

        Ok(self.lines.next_line())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(LinkError::Closed { port: self.port.clone() });
        };

        stream.write_all(bytes).await.map_err(|e| LinkError::io(&self.port, e))?;
        stream.flush().await.map_err(|e| LinkError::io(&self.port, e))?;
        debug!(port = %self.port, hex = %hex::encode(bytes), "serial_link_written");
        Ok(())
    }

    async fn close(&mut self) {
        if self.stream.take().is_some() {
            info!(port = %self.port, "serial_link_closed");
        }
    }
}

/// Opens real serial ports
#[derive(Debug, Clone)]
pub struct SerialPortFactory {
    read_timeout: Duration,
}

impl SerialPortFactory {
    pub fn new(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }
}

impl LinkFactory for SerialPortFactory {
    fn open(&self, port: &str, baud: u32) -> Result<Box<dyn SerialLink>, OpenError> {
        Ok(Box::new(TokioSerialLink::open(port, baud, self.read_timeout)?))
    }
}

/// A link shared between the dispatcher and the shutdown path
///
/// Each write holds the lock for the duration of that write only, so the
/// fail-safe OFF on stop can always get through.
#[derive(Clone)]
pub struct SharedLink {
    port: Arc<str>,
    inner: Arc<tokio::sync::Mutex<Box<dyn SerialLink>>>,
}

impl SharedLink {
    pub fn new(link: Box<dyn SerialLink>) -> Self {
        let port: Arc<str> = Arc::from(link.port());
        Self { port, inner: Arc::new(tokio::sync::Mutex::new(link)) }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub async fn write(&self, bytes: &[u8]) -> Result<(), LinkError> {
        self.inner.lock().await.write(bytes).await
    }

    pub async fn close(&self) {
        self.inner.lock().await.close().await;
    }
}

/// Available serial ports as `"<device> - <description>"`
pub fn list_ports() -> Result<Vec<String>, tokio_serial::Error> {
    let ports = tokio_serial::available_ports()?;
    Ok(ports
        .into_iter()
        .map(|p| {
            let description = match p.port_type {
                SerialPortType::UsbPort(usb) => {
                    usb.product.unwrap_or_else(|| format!("USB {:04x}:{:04x}", usb.vid, usb.pid))
                }
                SerialPortType::PciPort => "PCI".to_string(),
                SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                SerialPortType::Unknown => "Unknown".to_string(),
            };
            format!("{} - {}", p.port_name, description)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_splits_on_newline() {
        let mut lines = LineBuffer::new();
        lines.extend(b"ABC\r\nDEF\n");
        assert_eq!(lines.next_line().as_deref(), Some("ABC"));
        assert_eq!(lines.next_line().as_deref(), Some("DEF"));
        assert_eq!(lines.next_line(), None);
        assert!(lines.is_empty());
    }

    #[test]
    fn test_line_buffer_keeps_partial_line() {
        let mut lines = LineBuffer::new();
        lines.extend(b"AB");
        assert_eq!(lines.next_line(), None);
        assert_eq!(lines.len(), 2);

        lines.extend(b"C1\r");
        assert_eq!(lines.next_line(), None);
        lines.extend(b"\n");
        assert_eq!(lines.next_line().as_deref(), Some("ABC1"));
    }

    #[test]
    fn test_line_buffer_replaces_invalid_utf8() {
        let mut lines = LineBuffer::new();
        lines.extend(&[b'A', 0xFF, b'B', b'\n']);
        assert_eq!(lines.next_line().as_deref(), Some("A\u{FFFD}B"));
    }

    #[test]
    fn test_line_buffer_empty_line() {
        let mut lines = LineBuffer::new();
        lines.extend(b"\r\n");
        assert_eq!(lines.next_line().as_deref(), Some(""));
    }

    #[test]
    fn test_line_buffer_discards_unterminated_overflow() {
        let mut lines = LineBuffer::new();
        lines.extend(&vec![b'A'; MAX_LINE_LEN + 1]);
        assert!(lines.is_empty());
    }

    #[tokio::test]
    async fn test_open_missing_port_is_an_open_error() {
        let result =
            TokioSerialLink::open("/dev/does-not-exist-scan-relay", 9600, Duration::from_secs(1));
        let err = result.err().unwrap();
        assert_eq!(err.port(), "/dev/does-not-exist-scan-relay");
    }
}
