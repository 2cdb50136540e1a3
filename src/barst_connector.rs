use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::net::UnixStream;

/// Baud rate used for `serial://` endpoints that do not name one.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Endpoint '{0}' is not supported on this platform")]
    Unsupported(String),

    #[error("Could not resolve '{0}'")]
    Unresolved(String),

    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Where a Barst server listens.
///
/// Parsed from `tcp://host:port`, `unix:///path/to/socket` or
/// `serial:///dev/ttyUSB0@115200` (the baud rate is optional).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
    Serial { path: String, baud_rate: u32 },
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } if host.contains(':') => write!(f, "tcp://[{host}]:{port}"),
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Serial { path, baud_rate } => write!(f, "serial://{path}@{baud_rate}"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConnectorError::InvalidEndpoint {
            endpoint: s.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| invalid("expected scheme://address"))?;
        match scheme {
            "tcp" => {
                let (host, port) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| invalid("missing port"))?;
                let host = host.trim_start_matches('[').trim_end_matches(']');
                if host.is_empty() {
                    return Err(invalid("missing host"));
                }
                let port = port.parse().map_err(|_| invalid("port is not a number"))?;
                Ok(Self::tcp(host, port))
            }
            "unix" => {
                if rest.is_empty() {
                    return Err(invalid("missing socket path"));
                }
                Ok(Self::Unix(PathBuf::from(rest)))
            }
            "serial" => {
                let (path, baud_rate) = match rest.rsplit_once('@') {
                    Some((path, baud)) => (
                        path,
                        baud.parse()
                            .map_err(|_| invalid("baud rate is not a number"))?,
                    ),
                    None => (rest, DEFAULT_BAUD_RATE),
                };
                if path.is_empty() {
                    return Err(invalid("missing port name"));
                }
                Ok(Self::Serial {
                    path: path.to_string(),
                    baud_rate,
                })
            }
            other => Err(invalid(&format!("unknown scheme '{other}'"))),
        }
    }
}

/// A connected byte stream to a server.
pub trait Transport: Read + Write + Send {
    /// A second handle on the same connection, used by the reader thread.
    fn try_clone_transport(&self) -> io::Result<Box<dyn Transport>>;

    /// Bounds how long a read may block before reporting a timeout.
    fn set_poll_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Tears the connection down so blocked readers on every handle return.
    fn shutdown(&self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for TcpStream {
    fn try_clone_transport(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn set_poll_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.set_read_timeout(Some(timeout))
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

#[cfg(unix)]
impl Transport for UnixStream {
    fn try_clone_transport(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn set_poll_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.set_read_timeout(Some(timeout))
    }

    fn shutdown(&self) -> io::Result<()> {
        UnixStream::shutdown(self, Shutdown::Both)
    }
}

impl Transport for Box<dyn serialport::SerialPort> {
    fn try_clone_transport(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn set_poll_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.set_timeout(timeout)?;
        Ok(())
    }
}

/// A serial port that could host a server.
#[derive(Debug, Clone)]
pub struct SerialCandidate {
    pub description: String,
    pub endpoint: Endpoint,
}

pub struct BarstConnector;

impl BarstConnector {
    /// Opens a byte stream to `endpoint`.
    pub fn open(
        endpoint: &Endpoint,
        connect_timeout: Duration,
    ) -> Result<Box<dyn Transport>, ConnectorError> {
        log::debug!("Connecting to Barst server at {}", endpoint);
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let addrs = (host.as_str(), *port)
                    .to_socket_addrs()
                    .map_err(|_| ConnectorError::Unresolved(endpoint.to_string()))?;
                let mut last_error = None;
                for addr in addrs {
                    match TcpStream::connect_timeout(&addr, connect_timeout) {
                        Ok(stream) => {
                            stream.set_nodelay(true)?;
                            return Ok(Box::new(stream));
                        }
                        Err(e) => {
                            log::debug!("Connecting to {} failed: {}", addr, e);
                            last_error = Some(e);
                        }
                    }
                }
                Err(last_error.map_or_else(
                    || ConnectorError::Unresolved(endpoint.to_string()),
                    ConnectorError::Io,
                ))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(Box::new(UnixStream::connect(path)?)),
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(ConnectorError::Unsupported(endpoint.to_string())),
            Endpoint::Serial { path, baud_rate } => {
                let port = serialport::new(path, *baud_rate)
                    .timeout(connect_timeout)
                    .open()?;
                Ok(Box::new(port))
            }
        }
    }

    /// Serial ports present on this machine, as endpoints at the default
    /// baud rate.
    pub fn available_serial_endpoints() -> Result<Vec<SerialCandidate>, ConnectorError> {
        let ports = serialport::available_ports()?;
        Ok(ports
            .into_iter()
            .map(|port| {
                let description = match &port.port_type {
                    serialport::SerialPortType::UsbPort(usb) => usb
                        .product
                        .clone()
                        .unwrap_or_else(|| format!("USB {:04x}:{:04x}", usb.vid, usb.pid)),
                    serialport::SerialPortType::PciPort => "PCI".to_string(),
                    serialport::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                    serialport::SerialPortType::Unknown => "Unknown".to_string(),
                };
                SerialCandidate {
                    description,
                    endpoint: Endpoint::Serial {
                        path: port.port_name,
                        baud_rate: DEFAULT_BAUD_RATE,
                    },
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        let endpoint: Endpoint = "tcp://localhost:4000".parse().unwrap();
        assert_eq!(endpoint, Endpoint::tcp("localhost", 4000));
        let v6: Endpoint = "tcp://[::1]:4000".parse().unwrap();
        assert_eq!(v6, Endpoint::tcp("::1", 4000));
        assert_eq!(v6.to_string(), "tcp://[::1]:4000");
    }

    #[test]
    fn test_parse_unix_and_serial() {
        assert_eq!(
            "unix:///tmp/barst.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/barst.sock"))
        );
        assert_eq!(
            "serial:///dev/ttyUSB0@9600".parse::<Endpoint>().unwrap(),
            Endpoint::Serial {
                path: "/dev/ttyUSB0".to_string(),
                baud_rate: 9600
            }
        );
        assert_eq!(
            "serial://COM3".parse::<Endpoint>().unwrap(),
            Endpoint::Serial {
                path: "COM3".to_string(),
                baud_rate: DEFAULT_BAUD_RATE
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["localhost:4000", "tcp://localhost", "tcp://:80", "ftp://x:1", "serial://@9600"] {
            assert!(
                matches!(bad.parse::<Endpoint>(), Err(ConnectorError::InvalidEndpoint { .. })),
                "{bad} parsed"
            );
        }
    }

    #[test]
    fn test_available_serial_endpoints() {
        // Depends on the machine; only check that whatever is listed is usable
        match BarstConnector::available_serial_endpoints() {
            Ok(candidates) => {
                for candidate in candidates {
                    assert!(matches!(candidate.endpoint, Endpoint::Serial { .. }));
                }
            }
            Err(ConnectorError::SerialPort(_)) => {}
            Err(e) => panic!("Unexpected error: {:?}", e),
        }
    }
}
