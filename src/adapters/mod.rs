//! Instrument transports
//!
//! Byte-stream channels the Instrument Link talks through. A transport owns
//! the session settings of one instrument handle (address, timeout, line
//! terminator) and is owned exclusively by the device that opened it.

use crate::error::TransportError;
use async_trait::async_trait;
use std::fmt;

pub mod mock_adapter;
pub mod stream_adapter;

pub use mock_adapter::MockTransport;
pub use stream_adapter::StreamTransport;

/// Generic async transport trait for instrument communication
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one command; the transport appends its line terminator.
    async fn write(&mut self, command: &str) -> Result<(), TransportError>;

    /// Read one reply line with the terminator stripped.
    async fn read(&mut self) -> Result<String, TransportError>;

    /// Discard any unread input (device clear).
    async fn clear(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Whether the session is open.
    fn is_connected(&self) -> bool;

    /// Human-readable session description for logs.
    fn describe(&self) -> String;
}

/// Parsed instrument address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceAddress {
    /// Raw TCP socket (`TCPIP0::host::port::SOCKET` or `host:port`)
    Tcp {
        /// Host name or IP
        host: String,
        /// TCP port
        port: u16,
    },
    /// Serial port (`ASRL/dev/ttyUSB0::INSTR` or a bare device path)
    Serial {
        /// Device path
        path: String,
    },
}

impl ResourceAddress {
    /// Parse a VISA-style resource string or a plain `host:port`.
    pub fn parse(address: &str) -> Result<Self, TransportError> {
        let address = address.trim();
        let upper = address.to_ascii_uppercase();

        if upper.starts_with("TCPIP") {
            let parts: Vec<&str> = address.split("::").collect();
            return match parts.as_slice() {
                [_, host, port, kind] if kind.eq_ignore_ascii_case("SOCKET") => {
                    let port = port.parse::<u16>().map_err(|_| {
                        TransportError::NotConnected(format!("bad port in '{}'", address))
                    })?;
                    Ok(ResourceAddress::Tcp {
                        host: (*host).to_string(),
                        port,
                    })
                }
                _ => Err(TransportError::NotConnected(format!(
                    "unsupported TCPIP resource '{}', expected TCPIP0::<host>::<port>::SOCKET",
                    address
                ))),
            };
        }

        if upper.starts_with("ASRL") {
            let path = address[4..]
                .split("::")
                .next()
                .unwrap_or_default()
                .to_string();
            if path.is_empty() {
                return Err(TransportError::NotConnected(format!(
                    "missing serial path in '{}'",
                    address
                )));
            }
            return Ok(ResourceAddress::Serial { path });
        }

        if address.starts_with('/') || upper.starts_with("COM") {
            return Ok(ResourceAddress::Serial {
                path: address.to_string(),
            });
        }

        match address.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port.parse::<u16>().map_err(|_| {
                    TransportError::NotConnected(format!("bad port in '{}'", address))
                })?;
                Ok(ResourceAddress::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            _ => Err(TransportError::NotConnected(format!(
                "unrecognised instrument address '{}'",
                address
            ))),
        }
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceAddress::Tcp { host, port } => write!(f, "TCPIP0::{}::{}::SOCKET", host, port),
            ResourceAddress::Serial { path } => write!(f, "ASRL{}::INSTR", path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visa_socket_resource() {
        let addr = ResourceAddress::parse("TCPIP0::localhost::5025::SOCKET").unwrap();
        assert_eq!(
            addr,
            ResourceAddress::Tcp {
                host: "localhost".into(),
                port: 5025
            }
        );
        assert_eq!(addr.to_string(), "TCPIP0::localhost::5025::SOCKET");
    }

    #[test]
    fn test_plain_host_port() {
        let addr = ResourceAddress::parse("192.168.1.20:5025").unwrap();
        assert_eq!(
            addr,
            ResourceAddress::Tcp {
                host: "192.168.1.20".into(),
                port: 5025
            }
        );
    }

    #[test]
    fn test_serial_resources() {
        assert_eq!(
            ResourceAddress::parse("ASRL/dev/ttyUSB0::INSTR").unwrap(),
            ResourceAddress::Serial {
                path: "/dev/ttyUSB0".into()
            }
        );
        assert_eq!(
            ResourceAddress::parse("COM3").unwrap(),
            ResourceAddress::Serial {
                path: "COM3".into()
            }
        );
    }

    #[test]
    fn test_instr_resource_rejected() {
        assert!(ResourceAddress::parse("TCPIP0::192.168.1.100::INSTR").is_err());
        assert!(ResourceAddress::parse("nonsense").is_err());
    }
}
