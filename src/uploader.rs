// Pushes encoded stills to a collection server over TCP. Each still is a
// 6-byte header (sequence as u16, payload length as u32, both big-endian)
// followed by the JPEG bytes. The server sends nothing back.

use std::time::Duration;

use async_trait::async_trait;
use canonical_error::{CanonicalError, invalid_argument_error, unavailable_error};
use log::{info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::still_writer::{EncodedStill, StillSink};

pub const HEADER_LEN: usize = 6;

pub fn still_header(sequence: u32, payload_len: usize) -> Result<[u8; HEADER_LEN], CanonicalError> {
    let length = u32::try_from(payload_len).map_err(|_| invalid_argument_error(
        format!("still of {} bytes is too large to send", payload_len).as_str()))?;
    let mut header = [0u8; HEADER_LEN];
    // Sequence numbers wrap on the wire.
    header[..2].copy_from_slice(&(sequence as u16).to_be_bytes());
    header[2..].copy_from_slice(&length.to_be_bytes());
    Ok(header)
}

pub struct TcpStillSink {
    address: String,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpStillSink {
    /// `address` is "host:port". No connection is made until the first
    /// still arrives.
    pub fn new(address: &str) -> Self {
        TcpStillSink{address: address.to_string(),
                     connect_timeout: Duration::from_secs(2),
                     stream: None}
    }

    async fn connect(&mut self) -> Result<&mut TcpStream, CanonicalError> {
        if self.stream.is_none() {
            let stream = match timeout(self.connect_timeout,
                                       TcpStream::connect(&self.address)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(unavailable_error(
                    format!("could not connect to {}: {}", self.address, e).as_str())),
                Err(_) => return Err(unavailable_error(
                    format!("timed out connecting to {}", self.address).as_str())),
            };
            info!("Connected to still server {}", self.address);
            self.stream = Some(stream);
        }
        self.stream.as_mut().ok_or_else(|| unavailable_error("not connected"))
    }
}

#[async_trait]
impl StillSink for TcpStillSink {
    fn name(&self) -> String {
        format!("tcp:{}", self.address)
    }

    async fn write(&mut self, still: &EncodedStill) -> Result<(), CanonicalError> {
        let header = still_header(still.sequence, still.jpeg.len())?;
        let address = self.address.clone();
        let stream = self.connect().await?;
        let sent = async {
            stream.write_all(&header).await?;
            stream.write_all(&still.jpeg).await?;
            stream.flush().await
        }.await;
        if let Err(e) = sent {
            // Reconnect on the next still.
            self.stream = None;
            warn!("Lost connection to {}", address);
            return Err(unavailable_error(
                format!("sending still {} to {} failed: {}", still.sequence, address, e).as_str()));
        }
        Ok(())
    }
}
