//! Shared, mutually exclusive access to the VESC serial link
//!
//! The poller and the duty controller talk over the same half-duplex link.
//! Every write, read and buffer reset takes the channel lock for the duration
//! of that single call only; callers sleep without holding it.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::trace;

use super::port_trait::SerialPortIO;
use crate::error::{Result, VescBridgeError};

/// Size of a single read chunk
const READ_CHUNK_SIZE: usize = 256;

/// Cloneable handle to the shared serial port
#[derive(Clone)]
pub struct SerialChannel {
    port: Arc<Mutex<Box<dyn SerialPortIO>>>,
    read_timeout: Duration,
}

impl std::fmt::Debug for SerialChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialChannel")
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

impl SerialChannel {
    /// Wrap a port; reads give up after `read_timeout` with no data
    pub fn new<P: SerialPortIO + 'static>(port: P, read_timeout: Duration) -> Self {
        Self {
            port: Arc::new(Mutex::new(Box::new(port))),
            read_timeout,
        }
    }

    /// Take the channel lock for a short check-then-write sequence
    ///
    /// Hold the guard only across I/O, never across a sleep.
    pub async fn lock(&self) -> ChannelGuard<'_> {
        ChannelGuard {
            port: self.port.lock().await,
            read_timeout: self.read_timeout,
        }
    }

    /// Write a complete frame
    pub async fn send(&self, frame: &[u8]) -> Result<()> {
        self.lock().await.send(frame).await
    }

    /// Read the bytes currently available (empty on timeout)
    pub async fn read_available(&self) -> Result<Vec<u8>> {
        self.lock().await.read_available().await
    }

    /// Discard stale bytes in both directions
    pub async fn clear_buffers(&self) -> Result<()> {
        self.lock().await.clear_buffers()
    }
}

/// Exclusive access to the port while held
pub struct ChannelGuard<'a> {
    port: MutexGuard<'a, Box<dyn SerialPortIO>>,
    read_timeout: Duration,
}

impl ChannelGuard<'_> {
    pub async fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.port
            .write_all(frame)
            .await
            .map_err(|e| VescBridgeError::Serial(format!("Failed to write packet: {}", e)))?;

        self.port
            .flush()
            .await
            .map_err(|e| VescBridgeError::Serial(format!("Failed to flush serial port: {}", e)))?;

        trace!("Sent VESC frame ({} bytes)", frame.len());
        Ok(())
    }

    pub async fn read_available(&mut self) -> Result<Vec<u8>> {
        let mut buf = [0u8; READ_CHUNK_SIZE];
        let n = self
            .port
            .read_available(&mut buf, self.read_timeout)
            .await
            .map_err(|e| VescBridgeError::Serial(format!("Failed to read serial port: {}", e)))?;

        Ok(buf[..n].to_vec())
    }

    pub fn clear_buffers(&mut self) -> Result<()> {
        self.port
            .clear_buffers()
            .map_err(|e| VescBridgeError::Serial(format!("Failed to clear serial buffers: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::port_trait::mocks::MockSerialPort;
    use std::io;

    fn channel() -> (SerialChannel, MockSerialPort) {
        let mock = MockSerialPort::new();
        (SerialChannel::new(mock.clone(), Duration::from_millis(10)), mock)
    }

    #[tokio::test]
    async fn test_send_records_frame() {
        let (channel, mock) = channel();
        channel.send(&[0x02, 0x01, 0x04, 0x40, 0x84, 0x03]).await.unwrap();

        assert_eq!(mock.get_written_data(), vec![vec![0x02, 0x01, 0x04, 0x40, 0x84, 0x03]]);
    }

    #[tokio::test]
    async fn test_send_write_error_maps_to_serial() {
        let (channel, mock) = channel();
        mock.set_write_error(io::ErrorKind::BrokenPipe);

        match channel.send(&[0x00]).await {
            Err(VescBridgeError::Serial(msg)) => assert!(msg.contains("Failed to write packet")),
            other => panic!("Expected Serial error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_flush_error_maps_to_serial() {
        let (channel, mock) = channel();
        mock.set_flush_error(io::ErrorKind::TimedOut);

        match channel.send(&[0x00]).await {
            Err(VescBridgeError::Serial(msg)) => assert!(msg.contains("flush")),
            other => panic!("Expected Serial error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_available_empty_on_no_data() {
        let (channel, _mock) = channel();
        assert!(channel.read_available().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_available_returns_chunks_in_order() {
        let (channel, mock) = channel();
        mock.push_read(&[1, 2, 3]);
        mock.push_read(&[4]);

        assert_eq!(channel.read_available().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(channel.read_available().await.unwrap(), vec![4]);
    }

    #[tokio::test]
    async fn test_read_large_chunk_split() {
        let (channel, mock) = channel();
        mock.push_read(&[0xAB; READ_CHUNK_SIZE + 10]);

        assert_eq!(channel.read_available().await.unwrap().len(), READ_CHUNK_SIZE);
        assert_eq!(channel.read_available().await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_clear_buffers_discards_pending_input() {
        let (channel, mock) = channel();
        mock.push_read(&[1, 2, 3]);

        channel.clear_buffers().await.unwrap();
        assert_eq!(mock.clear_count(), 1);
        assert!(channel.read_available().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_guard_excludes_other_writers() {
        let (channel, mock) = channel();

        let mut guard = channel.lock().await;
        let other = channel.clone();
        let pending = tokio::spawn(async move { other.send(&[0xBB]).await });

        tokio::task::yield_now().await;
        guard.send(&[0xAA]).await.unwrap();
        guard.send(&[0xAA]).await.unwrap();
        drop(guard);

        pending.await.unwrap().unwrap();
        assert_eq!(mock.get_written_data(), vec![vec![0xAA], vec![0xAA], vec![0xBB]]);
    }
}
