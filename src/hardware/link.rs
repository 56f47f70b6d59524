//! Request/response client for the motor controller.
//!
//! One `Link` owns the serial channel shared by every axis on the controller.
//! A call to [`Link::send`] is one complete exchange: encode, write, read the
//! (possibly multi-line) reply, verify the echo and optionally the OK status.
//!
//! # Example
//!
//! ```no_run
//! use hallprobe_daq::hardware::link::Link;
//! use hallprobe_daq::hardware::protocol::{ControllerVariant, Parameter};
//! use hallprobe_daq::hardware::transport::open_serial;
//!
//! # async fn demo() -> hallprobe_daq::error::AppResult<()> {
//! let variant = ControllerVariant::Pm1000;
//! let channel = open_serial("/dev/ttyUSB0", variant.default_serial())?;
//! let mut link = Link::new(channel, variant);
//! let lines = link.send(3, "oc", Parameter::None, false).await?;
//! println!("{lines:?}");
//! # Ok(())
//! # }
//! ```

use crate::config::ControllerSettings;
use crate::error::{AppResult, DaqError};
use crate::hardware::protocol::{encode, mnemonic, ControllerVariant, Parameter};
use crate::hardware::transport::SerialChannel;
use std::time::Duration;
use tracing::{trace, warn};

/// Framed, retrying protocol client.
pub struct Link {
    channel: Box<dyn SerialChannel>,
    variant: ControllerVariant,
    read_timeout: Duration,
    retry_grace: Duration,
    query_delay: Duration,
}

impl Link {
    /// Create a link with the default timing (1 s reads, 2 s retry grace, 1 s query delay).
    pub fn new(channel: Box<dyn SerialChannel>, variant: ControllerVariant) -> Self {
        Self {
            channel,
            variant,
            read_timeout: Duration::from_secs(1),
            retry_grace: Duration::from_secs(2),
            query_delay: Duration::from_secs(1),
        }
    }

    /// Create a link using the timing from the controller settings.
    pub fn from_settings(channel: Box<dyn SerialChannel>, settings: &ControllerSettings) -> Self {
        Self::new(channel, settings.variant)
            .with_read_timeout(settings.read_timeout)
            .with_retry_grace(settings.retry_grace)
            .with_query_delay(settings.query_delay)
    }

    /// Set the per-read timeout
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the pause before re-reading after a non-OK status
    pub fn with_retry_grace(mut self, grace: Duration) -> Self {
        self.retry_grace = grace;
        self
    }

    /// Set the pause before reading a query-all report
    pub fn with_query_delay(mut self, delay: Duration) -> Self {
        self.query_delay = delay;
        self
    }

    /// Protocol variant spoken on this link.
    pub fn variant(&self) -> ControllerVariant {
        self.variant
    }

    /// Channel description for logs.
    pub fn describe(&self) -> String {
        self.channel.describe()
    }

    /// Exchange one command with axis `axis_id`.
    ///
    /// Returns the reply lines with the echo (if any) removed. An empty vector
    /// means the controller sent nothing before the read timeout.
    ///
    /// # Errors
    /// - `Protocol` when the echo differs from the command sent
    /// - `Protocol` when `check_ok` is set and the first line is still not the
    ///   OK marker after one grace-period re-read
    pub async fn send(
        &mut self,
        axis_id: u8,
        command: &str,
        parameter: impl Into<Parameter>,
        check_ok: bool,
    ) -> AppResult<Vec<String>> {
        let line = encode(axis_id, command, parameter.into());
        trace!(axis_id, command = %line, "tx");

        let mut frame = line.clone().into_bytes();
        frame.extend_from_slice(self.variant.terminator().as_bytes());
        self.channel.write_all(&frame).await?;

        let lower = command.to_lowercase();
        if lower == mnemonic::QUERY_ALL || lower == mnemonic::QUERY_ALL_HIDDEN {
            tokio::time::sleep(self.query_delay).await;
        }

        let mut lines = self.read_lines().await?;
        trace!(axis_id, reply = ?lines, "rx");

        if self.variant.echoes() {
            let echo = if lines.is_empty() {
                String::new()
            } else {
                lines.remove(0)
            };
            if echo != line {
                return Err(DaqError::protocol(
                    axis_id.to_string(),
                    format!("incorrect command echo: sent \"{line}\", received \"{echo}\""),
                    lines,
                ));
            }
        }

        if check_ok {
            let ok = self.variant.ok_marker(axis_id);
            if lines.first() != Some(&ok) {
                warn!(
                    axis_id,
                    command = %line,
                    reply = ?lines,
                    "Initial error response, re-reading after grace period"
                );
                tokio::time::sleep(self.retry_grace).await;
                lines = self.read_lines().await?;
                if lines.first() != Some(&ok) {
                    return Err(DaqError::protocol(
                        axis_id.to_string(),
                        format!("error response on command \"{line}\""),
                        lines,
                    ));
                }
            }
        }

        Ok(lines)
    }

    /// Read one terminated line, then keep draining while input is buffered.
    async fn read_lines(&mut self) -> AppResult<Vec<String>> {
        let terminator = self.variant.terminator().as_bytes();
        let mut raw = self.channel.read_until(terminator, self.read_timeout).await?;
        while self.channel.bytes_pending().await? > 0 {
            let more = self.channel.read_until(terminator, self.read_timeout).await?;
            if more.is_empty() {
                break;
            }
            raw.extend_from_slice(&more);
        }

        Ok(String::from_utf8_lossy(&raw)
            .split(|c| c == '\r' || c == '\n')
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::ScriptedChannel;

    fn pm1000(channel: ScriptedChannel) -> Link {
        Link::new(Box::new(channel), ControllerVariant::Pm1000)
            .with_read_timeout(Duration::from_millis(50))
            .with_retry_grace(Duration::from_millis(100))
            .with_query_delay(Duration::from_millis(10))
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_stripped_and_ok_checked() {
        let channel = ScriptedChannel::new().reply("3MA6400\r\n03:OK\r\n");
        let log = channel.log();
        let mut link = pm1000(channel);

        let lines = link.send(3, "ma", 6400.2, true).await.unwrap();
        assert_eq!(lines, vec!["03:OK"]);
        assert_eq!(log.written(), vec!["3MA6400\r\n"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_mismatch_is_fatal() {
        let channel = ScriptedChannel::new()
            .reply("3MA640\r\n03:OK\r\n")
            .late("03:OK\r\n");
        let log = channel.log();
        let mut link = pm1000(channel);

        let err = link.send(3, "ma", 6400i64, true).await.unwrap_err();
        assert!(matches!(err, DaqError::Protocol { .. }));
        // no silent retry
        assert_eq!(log.written().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_status_recovers_on_reread() {
        let channel = ScriptedChannel::new()
            .reply("3ST\r\n")
            .late("03:OK\r\n");
        let log = channel.log();
        let mut link = pm1000(channel);

        let lines = link.send(3, "st", Parameter::None, true).await.unwrap();
        assert_eq!(lines, vec!["03:OK"]);
        // re-read, not re-send
        assert_eq!(log.written().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_bad_status_carries_response() {
        let channel = ScriptedChannel::new()
            .reply("3UL99\r\n03:! RANGE\r\n")
            .late("03:! RANGE\r\n");
        let mut link = pm1000(channel);

        match link.send(3, "ul", 99i64, true).await {
            Err(DaqError::Protocol { response, .. }) => {
                assert_eq!(response, vec!["03:! RANGE"]);
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_line_reply_is_drained() {
        let channel = ScriptedChannel::new().reply("3QA\r\n03:Banner\r\nSlew speed = 100\r\nLower limit = -5\r\n");
        let mut link = pm1000(channel);

        let lines = link.send(3, "qa", Parameter::None, false).await.unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2], "Lower limit = -5");
    }

    #[tokio::test(start_paused = true)]
    async fn test_scl_uses_percent_marker_without_echo() {
        let channel = ScriptedChannel::new().reply("1%\r");
        let mut link = Link::new(Box::new(channel), ControllerVariant::Scl)
            .with_read_timeout(Duration::from_millis(50));

        let lines = link.send(1, "fp", -2400i64, true).await.unwrap();
        assert_eq!(lines, vec!["1%"]);
    }
}
