//! Stream transport for socket and serial instruments
//!
//! Wraps any tokio byte stream (TCP socket, serial port) into a
//! line-oriented [`Transport`]: writes are terminated with the configured
//! terminator, reads collect bytes up to the terminator under a timeout.

use super::{ResourceAddress, Transport};
use crate::error::TransportError;
use async_trait::async_trait;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{
    split, AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader,
    ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tracing::debug;

/// Default session timeout, matching the bench instruments' VISA setting.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Default line terminator.
pub const DEFAULT_TERMINATOR: char = '\n';

/// Line-oriented transport over an async byte stream.
///
/// ## Example Usage
/// ```no_run
/// use rf_bench::adapters::{StreamTransport, Transport};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), rf_bench::error::TransportError> {
/// let mut transport = StreamTransport::connect_tcp(
///     "TCPIP0::192.168.1.100::5025::SOCKET",
///     Duration::from_secs(2),
///     '\n',
/// )
/// .await?;
///
/// transport.write("*IDN?").await?;
/// println!("Instrument: {}", transport.read().await?);
/// # Ok(())
/// # }
/// ```
pub struct StreamTransport<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    resource: String,
    timeout: Duration,
    terminator: char,
    connected: bool,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
{
    /// Wrap an already-open stream.
    pub fn from_stream(stream: S, resource: String, timeout: Duration, terminator: char) -> Self {
        let (read_half, write_half) = split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            resource,
            timeout,
            terminator,
            connected: true,
        }
    }

    /// Get current timeout setting
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Get resource name
    pub fn resource_name(&self) -> &str {
        &self.resource
    }
}

impl StreamTransport<TcpStream> {
    /// Open a TCP socket session from a resource string.
    pub async fn connect_tcp(
        address: &str,
        timeout: Duration,
        terminator: char,
    ) -> Result<Self, TransportError> {
        let (host, port) = match ResourceAddress::parse(address)? {
            ResourceAddress::Tcp { host, port } => (host, port),
            ResourceAddress::Serial { path } => {
                return Err(TransportError::NotConnected(format!(
                    "'{}' is a serial resource, not a socket",
                    path
                )))
            }
        };

        let stream = tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;
        stream.set_nodelay(true)?;

        debug!(resource = %address, "Socket session opened");
        Ok(Self::from_stream(stream, address.to_string(), timeout, terminator))
    }
}

#[cfg(feature = "instrument_serial")]
impl StreamTransport<tokio_serial::SerialStream> {
    /// Open a serial port session.
    pub fn open_serial(
        path: &str,
        baud_rate: u32,
        timeout: Duration,
        terminator: char,
    ) -> Result<Self, TransportError> {
        use tokio_serial::SerialPortBuilderExt;

        let stream = tokio_serial::new(path, baud_rate)
            .timeout(timeout)
            .open_native_async()
            .map_err(|e| TransportError::NotConnected(format!("{}: {}", path, e)))?;

        debug!(port = %path, baud_rate, "Serial session opened");
        Ok(Self::from_stream(stream, path.to_string(), timeout, terminator))
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
{
    async fn write(&mut self, command: &str) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected(self.resource.clone()));
        }

        let mut line = String::with_capacity(command.len() + 1);
        line.push_str(command);
        line.push(self.terminator);

        let result = tokio::time::timeout(self.timeout, async {
            self.writer.write_all(line.as_bytes()).await?;
            self.writer.flush().await
        })
        .await
        .map_err(|_| TransportError::Timeout(self.timeout))?;

        if let Err(e) = result {
            self.connected = false;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read(&mut self) -> Result<String, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected(self.resource.clone()));
        }

        // Only single-byte terminators are supported on the wire.
        let delimiter = u8::try_from(self.terminator).map_err(|_| {
            TransportError::MalformedReply(format!(
                "terminator {:?} is not a single byte",
                self.terminator
            ))
        })?;

        let mut buf = Vec::new();
        let count = tokio::time::timeout(self.timeout, self.reader.read_until(delimiter, &mut buf))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))??;

        if count == 0 {
            self.connected = false;
            return Err(TransportError::Closed);
        }

        let text = String::from_utf8(buf)
            .map_err(|e| TransportError::MalformedReply(format!("non UTF-8 reply: {}", e)))?;
        Ok(text
            .trim_end_matches(self.terminator)
            .trim_end_matches('\r')
            .to_string())
    }

    async fn clear(&mut self) -> Result<(), TransportError> {
        let pending = self.reader.buffer().len();
        if pending > 0 {
            debug!(resource = %self.resource, bytes = pending, "Discarding unread input");
            Pin::new(&mut self.reader).consume(pending);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn describe(&self) -> String {
        format!(
            "StreamTransport({} @ {}ms timeout)",
            self.resource,
            self.timeout.as_millis()
        )
    }
}
