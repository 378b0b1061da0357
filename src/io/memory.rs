//! In-process serial links
//!
//! `MemoryLink` behaves like a serial port whose far end is a `MemoryPort`
//! handle: lines pushed into the handle are read by the link, and every
//! write through the link is recorded with the time it happened. Used by
//! tests and by `--dry-run`, where no hardware is attached.

use crate::io::serial_link::{LineBuffer, LinkError, LinkFactory, OpenError, SerialLink};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Default)]
struct PortState {
    incoming: LineBuffer,
    written: Vec<(Instant, Vec<u8>)>,
    open: bool,
    opened_count: usize,
    fail_writes: bool,
    fail_reads: usize,
}

/// Far end of an in-process link
#[derive(Clone)]
pub struct MemoryPort {
    name: Arc<str>,
    state: Arc<Mutex<PortState>>,
}

impl MemoryPort {
    pub fn new(name: &str) -> Self {
        Self { name: Arc::from(name), state: Arc::new(Mutex::new(PortState::default())) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open a link on this port
    pub fn connect(&self) -> MemoryLink {
        let mut state = self.state.lock();
        state.open = true;
        state.opened_count += 1;
        MemoryLink { port: self.clone(), closed: false }
    }

    /// Queue raw bytes for the link to read
    pub fn push_bytes(&self, bytes: &[u8]) {
        self.state.lock().incoming.extend(bytes);
    }

    /// Queue one `\r\n`-terminated line
    pub fn push_line(&self, line: &str) {
        let mut bytes = line.as_bytes().to_vec();
        bytes.extend_from_slice(b"\r\n");
        self.push_bytes(&bytes);
    }

    /// Everything written so far, one entry per write
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().written.iter().map(|(_, bytes)| bytes.clone()).collect()
    }

    /// Writes decoded as text
    pub fn written_text(&self) -> Vec<String> {
        self.written().iter().map(|b| String::from_utf8_lossy(b).into_owned()).collect()
    }

    /// Writes with the time each one happened
    pub fn written_at(&self) -> Vec<(Instant, Vec<u8>)> {
        self.state.lock().written.clone()
    }

    pub fn clear_written(&self) {
        self.state.lock().written.clear();
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn opened_count(&self) -> usize {
        self.state.lock().opened_count
    }

    /// Make every following write fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Make the next `count` reads fail
    pub fn fail_next_reads(&self, count: usize) {
        self.state.lock().fail_reads = count;
    }
}

/// Near end of an in-process link
pub struct MemoryLink {
    port: MemoryPort,
    closed: bool,
}

#[async_trait]
impl SerialLink for MemoryLink {
    fn port(&self) -> &str {
        self.port.name()
    }

    async fn try_read_line(&mut self) -> Result<Option<String>, LinkError> {
        if self.closed {
            return Err(LinkError::Closed { port: self.port.name().to_string() });
        }
        let mut state = self.port.state.lock();
        if state.fail_reads > 0 {
            state.fail_reads -= 1;
            return Err(LinkError::io(
                self.port.name(),
                std::io::Error::new(std::io::ErrorKind::Other, "injected read failure"),
            ));
        }
        Ok(state.incoming.next_line())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        if self.closed {
            return Err(LinkError::Closed { port: self.port.name().to_string() });
        }
        let mut state = self.port.state.lock();
        if state.fail_writes {
            return Err(LinkError::io(
                self.port.name(),
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "injected write failure"),
            ));
        }
        state.written.push((Instant::now(), bytes.to_vec()));
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.port.state.lock().open = false;
        }
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        if !self.closed {
            self.port.state.lock().open = false;
        }
    }
}

/// Hands out `MemoryLink`s for registered port names
///
/// Unknown names fail with `OpenError::NotFound`; a port that already has
/// an open link fails with `OpenError::Busy`.
#[derive(Clone, Default)]
pub struct MemoryFactory {
    ports: Arc<Mutex<HashMap<String, MemoryPort>>>,
}

impl MemoryFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a port and return its far end
    pub fn add_port(&self, name: &str) -> MemoryPort {
        let port = MemoryPort::new(name);
        self.ports.lock().insert(name.to_string(), port.clone());
        port
    }

    pub fn port(&self, name: &str) -> Option<MemoryPort> {
        self.ports.lock().get(name).cloned()
    }
}

impl LinkFactory for MemoryFactory {
    fn open(&self, port: &str, _baud: u32) -> Result<Box<dyn SerialLink>, OpenError> {
        let Some(memory_port) = self.port(port) else {
            return Err(OpenError::NotFound { port: port.to_string() });
        };
        if memory_port.is_open() {
            return Err(OpenError::Busy { port: port.to_string() });
        }
        Ok(Box::new(memory_port.connect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_link_reads_pushed_lines() {
        let port = MemoryPort::new("COM1");
        let mut link = port.connect();

        assert_eq!(link.try_read_line().await.unwrap(), None);
        port.push_line("A1");
        port.push_bytes(b"B2\n");
        assert_eq!(link.try_read_line().await.unwrap().as_deref(), Some("A1"));
        assert_eq!(link.try_read_line().await.unwrap().as_deref(), Some("B2"));
        assert_eq!(link.try_read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_link_records_writes() {
        let port = MemoryPort::new("COM2");
        let mut link = port.connect();

        link.write(b"@ON01$\r\n").await.unwrap();
        assert_eq!(port.written_text(), vec!["@ON01$\r\n".to_string()]);

        port.set_fail_writes(true);
        assert!(link.write(b"@OFF01$\r\n").await.is_err());
        assert_eq!(port.written().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_link_close_is_idempotent() {
        let port = MemoryPort::new("COM3");
        let mut link = port.connect();
        assert!(port.is_open());

        link.close().await;
        link.close().await;
        assert!(!port.is_open());
        assert!(matches!(link.write(b"x").await, Err(LinkError::Closed { .. })));
    }

    #[tokio::test]
    async fn test_memory_factory_open_errors() {
        let factory = MemoryFactory::new();
        factory.add_port("COM4");

        assert!(matches!(factory.open("COM9", 9600), Err(OpenError::NotFound { .. })));

        let link = factory.open("COM4", 9600).unwrap();
        assert!(matches!(factory.open("COM4", 9600), Err(OpenError::Busy { .. })));

        drop(link);
        assert!(factory.open("COM4", 9600).is_ok());
    }

    #[tokio::test]
    async fn test_injected_read_failure() {
        let port = MemoryPort::new("COM5");
        let mut link = port.connect();
        port.push_line("A1");
        port.fail_next_reads(1);

        assert!(link.try_read_line().await.is_err());
        assert_eq!(link.try_read_line().await.unwrap().as_deref(), Some("A1"));
    }
}
