//! Byte transport underneath the controller link.
//!
//! `SerialChannel` is the seam between the protocol client and the wire. The
//! real implementation wraps `tokio-serial`; tests and `--simulate` runs use
//! the in-process controller from [`crate::hardware::mock`].

use crate::error::AppResult;
#[cfg(feature = "instrument_serial")]
use crate::error::DaqError;
use crate::hardware::protocol::SerialParams;
use async_trait::async_trait;
use std::time::Duration;

/// Async byte channel to the controller.
///
/// # Contract
/// - `read_until` returns everything up to and including `terminator`, or
///   whatever arrived before `timeout` elapsed (possibly nothing). It never
///   blocks longer than `timeout`.
/// - `bytes_pending` reports bytes that can be read without waiting.
/// - A channel whose device has gone away fails with
///   [`SerialPortNotConnected`](crate::error::DaqError::SerialPortNotConnected).
#[async_trait]
pub trait SerialChannel: Send {
    /// Write the whole buffer.
    async fn write_all(&mut self, data: &[u8]) -> AppResult<()>;

    /// Read up to and including `terminator`, bounded by `timeout`.
    async fn read_until(&mut self, terminator: &[u8], timeout: Duration) -> AppResult<Vec<u8>>;

    /// Bytes available without waiting.
    async fn bytes_pending(&mut self) -> AppResult<usize>;

    /// Human-readable endpoint description for logs.
    fn describe(&self) -> String;
}

/// Position of `needle` in `haystack`, if present.
pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Open the configured serial port.
///
/// # Errors
/// `SerialFeatureDisabled` when built without `instrument_serial`.
pub fn open_serial(port: &str, params: SerialParams) -> AppResult<Box<dyn SerialChannel>> {
    #[cfg(feature = "instrument_serial")]
    {
        let channel = TokioSerialChannel::open(port, params)?;
        Ok(Box::new(channel))
    }
    #[cfg(not(feature = "instrument_serial"))]
    {
        let _ = (port, params);
        Err(crate::error::DaqError::SerialFeatureDisabled)
    }
}

/// `tokio-serial` backed channel with its own line buffer.
#[cfg(feature = "instrument_serial")]
pub struct TokioSerialChannel {
    stream: tokio_serial::SerialStream,
    path: String,
    buffer: Vec<u8>,
}

#[cfg(feature = "instrument_serial")]
impl TokioSerialChannel {
    /// Open `path` with the given byte framing.
    pub fn open(path: &str, params: SerialParams) -> AppResult<Self> {
        use crate::hardware::protocol::Parity;
        use tokio_serial::SerialPortBuilderExt;

        let data_bits = match params.data_bits {
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let parity = match params.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        };
        let stop_bits = match params.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        let stream = tokio_serial::new(path, params.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| DaqError::Io(std::io::Error::from(e)))?;

        tracing::info!(port = %path, baud = params.baud_rate, "Opened controller serial port");
        Ok(Self {
            stream,
            path: path.to_string(),
            buffer: Vec::with_capacity(256),
        })
    }
}

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl SerialChannel for TokioSerialChannel {
    async fn write_all(&mut self, data: &[u8]) -> AppResult<()> {
        use tokio::io::AsyncWriteExt;
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_until(&mut self, terminator: &[u8], timeout: Duration) -> AppResult<Vec<u8>> {
        use tokio::io::AsyncReadExt;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut chunk = [0u8; 256];
        loop {
            if let Some(pos) = find_subsequence(&self.buffer, terminator) {
                let line: Vec<u8> = self.buffer.drain(..pos + terminator.len()).collect();
                return Ok(line);
            }
            match tokio::time::timeout_at(deadline, self.stream.read(&mut chunk)).await {
                // end of stream with nothing buffered: the device went away
                Ok(Ok(0)) if self.buffer.is_empty() => {
                    return Err(DaqError::SerialPortNotConnected)
                }
                Ok(Ok(0)) | Err(_) => return Ok(std::mem::take(&mut self.buffer)),
                Ok(Ok(n)) => self.buffer.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn bytes_pending(&mut self) -> AppResult<usize> {
        use tokio_serial::SerialPort;
        let waiting = self
            .stream
            .bytes_to_read()
            .map_err(|e| DaqError::Io(std::io::Error::from(e)))?;
        Ok(self.buffer.len() + waiting as usize)
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_subsequence() {
        assert_eq!(find_subsequence(b"03:OK\r\nrest", b"\r\n"), Some(5));
        assert_eq!(find_subsequence(b"partial", b"\r\n"), None);
        assert_eq!(find_subsequence(b"abc", b""), None);
    }

    #[cfg(not(feature = "instrument_serial"))]
    #[test]
    fn test_open_without_feature() {
        use crate::error::DaqError;
        use crate::hardware::protocol::ControllerVariant;
        let result = open_serial("/dev/null", ControllerVariant::Pm1000.default_serial());
        assert!(matches!(result, Err(DaqError::SerialFeatureDisabled)));
    }
}
