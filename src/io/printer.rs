//! Printer relay - forwards ingested barcodes to a label printer
//!
//! Frame: [STX][barcode][ETX]\r\n

use crate::io::serial_link::SerialLink;
use tracing::{debug, warn};

const STX: u8 = 0x02;
const ETX: u8 = 0x03;

/// Wrap a barcode in STX/ETX and terminate it with `\r\n`
pub fn format(value: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(value.len() + 4);
    frame.push(STX);
    frame.extend_from_slice(value.as_bytes());
    frame.push(ETX);
    frame.extend_from_slice(b"\r\n");
    frame
}

/// Optional printer link; without one, forwarding is a no-op
#[derive(Default)]
pub struct PrinterRelay {
    link: Option<Box<dyn SerialLink>>,
}

impl PrinterRelay {
    pub fn new(link: Option<Box<dyn SerialLink>>) -> Self {
        Self { link }
    }

    pub fn is_attached(&self) -> bool {
        self.link.is_some()
    }

    /// Send one barcode to the printer
    /// Returns true if a frame was written
    pub async fn forward(&mut self, value: &str) -> bool {
        let Some(link) = self.link.as_mut() else {
            return false;
        };

        let frame = format(value);
        match link.write(&frame).await {
            Ok(()) => {
                debug!(port = %link.port(), value = %value, "printer_frame_sent");
                true
            }
            Err(e) => {
                warn!(port = %link.port(), value = %value, error = %e, "printer_write_failed");
                false
            }
        }
    }

    pub async fn close(&mut self) {
        if let Some(link) = self.link.as_mut() {
            link.close().await;
        }
    }
}
