//! Trait abstraction for serial port operations to enable testing

use async_trait::async_trait;
use std::io;
use std::time::Duration;

/// Trait for serial port I/O operations
#[async_trait]
pub trait SerialPortIO: Send {
    /// Write all data to the port
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flush the output buffer
    async fn flush(&mut self) -> io::Result<()>;

    /// Read whatever arrives within `timeout`
    ///
    /// Returns `Ok(0)` when the timeout elapses with no data.
    async fn read_available(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Discard pending bytes in both the input and output buffers
    fn clear_buffers(&mut self) -> io::Result<()>;
}

/// Wrapper around tokio_serial::SerialStream that implements SerialPortIO
pub struct TokioSerialPort {
    port: tokio_serial::SerialStream,
}

impl TokioSerialPort {
    pub fn new(port: tokio_serial::SerialStream) -> Self {
        Self { port }
    }
}

#[async_trait]
impl SerialPortIO for TokioSerialPort {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.port.write_all(data).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.port.flush().await
    }

    async fn read_available(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        use tokio::io::AsyncReadExt;
        match tokio::time::timeout(timeout, self.port.read(buf)).await {
            Ok(result) => result,
            Err(_) => Ok(0),
        }
    }

    fn clear_buffers(&mut self) -> io::Result<()> {
        use tokio_serial::SerialPort;
        self.port
            .clear(tokio_serial::ClearBuffer::All)
            .map_err(io::Error::from)
    }
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use crate::vesc::encoder::encode_command;
    use crate::vesc::protocol::VescCommand;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Mock serial port for testing
    #[derive(Clone)]
    pub struct MockSerialPort {
        pub written_data: Arc<Mutex<Vec<Vec<u8>>>>,
        pub read_queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
        pub get_values_response: Arc<Mutex<Option<Vec<u8>>>>,
        pub clear_count: Arc<Mutex<usize>>,
        pub write_error: Arc<Mutex<Option<io::ErrorKind>>>,
        pub flush_error: Arc<Mutex<Option<io::ErrorKind>>>,
        pub read_error: Arc<Mutex<Option<io::ErrorKind>>>,
    }

    impl MockSerialPort {
        pub fn new() -> Self {
            Self {
                written_data: Arc::new(Mutex::new(Vec::new())),
                read_queue: Arc::new(Mutex::new(VecDeque::new())),
                get_values_response: Arc::new(Mutex::new(None)),
                clear_count: Arc::new(Mutex::new(0)),
                write_error: Arc::new(Mutex::new(None)),
                flush_error: Arc::new(Mutex::new(None)),
                read_error: Arc::new(Mutex::new(None)),
            }
        }

        pub fn get_written_data(&self) -> Vec<Vec<u8>> {
            self.written_data.lock().unwrap().clone()
        }

        /// Queue bytes to be returned by the next read
        pub fn push_read(&self, data: &[u8]) {
            self.read_queue.lock().unwrap().push_back(data.to_vec());
        }

        /// Reply to every GET_VALUES request with this raw response
        pub fn respond_to_get_values(&self, response: Vec<u8>) {
            *self.get_values_response.lock().unwrap() = Some(response);
        }

        pub fn clear_count(&self) -> usize {
            *self.clear_count.lock().unwrap()
        }

        pub fn set_write_error(&self, error: io::ErrorKind) {
            *self.write_error.lock().unwrap() = Some(error);
        }

        pub fn clear_write_error(&self) {
            *self.write_error.lock().unwrap() = None;
        }

        pub fn set_flush_error(&self, error: io::ErrorKind) {
            *self.flush_error.lock().unwrap() = Some(error);
        }

        pub fn set_read_error(&self, error: io::ErrorKind) {
            *self.read_error.lock().unwrap() = Some(error);
        }
    }

    #[async_trait]
    impl SerialPortIO for MockSerialPort {
        async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
            if let Some(error) = *self.write_error.lock().unwrap() {
                return Err(io::Error::new(error, "Mock write error"));
            }
            self.written_data.lock().unwrap().push(data.to_vec());

            if data == encode_command(&VescCommand::GetValues).as_slice() {
                if let Some(response) = self.get_values_response.lock().unwrap().clone() {
                    self.read_queue.lock().unwrap().push_back(response);
                }
            }
            Ok(())
        }

        async fn flush(&mut self) -> io::Result<()> {
            if let Some(error) = *self.flush_error.lock().unwrap() {
                return Err(io::Error::new(error, "Mock flush error"));
            }
            Ok(())
        }

        async fn read_available(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
            if let Some(error) = *self.read_error.lock().unwrap() {
                return Err(io::Error::new(error, "Mock read error"));
            }

            let mut queue = self.read_queue.lock().unwrap();
            match queue.pop_front() {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        queue.push_front(chunk[n..].to_vec());
                    }
                    Ok(n)
                }
                None => Ok(0),
            }
        }

        fn clear_buffers(&mut self) -> io::Result<()> {
            self.read_queue.lock().unwrap().clear();
            *self.clear_count.lock().unwrap() += 1;
            Ok(())
        }
    }
}
