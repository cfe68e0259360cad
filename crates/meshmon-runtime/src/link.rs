//! Links to the mesh device
//!
//! A `LinkOpener` produces a fresh byte stream each time the connector
//! (re)connects. TCP is the default; serial devices are available behind the
//! `serial` feature, and `virtual_link` gives an in-memory pair for bridged
//! sources and tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use meshmon_core::config::{LinkKind, TransportConfig};
use meshmon_core::errors::TransportError;
use meshmon_core::MeshmonError;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

// ----------------------------------------------------------------------------
// Link Traits
// ----------------------------------------------------------------------------

/// Bidirectional byte stream to the device
pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> LinkStream for T {}

pub type BoxedLink = Box<dyn LinkStream>;

/// Opens a new link for every connection attempt
#[async_trait]
pub trait LinkOpener: Send + Sync {
    async fn open(&self) -> Result<BoxedLink, TransportError>;

    /// Endpoint description for status and logs
    fn endpoint(&self) -> String;
}

/// Opener for the link kind named in the configuration
pub fn opener_from_config(config: &TransportConfig) -> Result<Arc<dyn LinkOpener>, MeshmonError> {
    match config.kind {
        LinkKind::Tcp => Ok(Arc::new(TcpLinkOpener::new(config.host.clone(), config.port))),
        #[cfg(feature = "serial")]
        LinkKind::Serial => Ok(Arc::new(serial::SerialLinkOpener::new(
            config.serial_path.clone(),
            config.baud_rate,
        ))),
        #[cfg(not(feature = "serial"))]
        LinkKind::Serial => Err(MeshmonError::invalid_config(
            "transport.kind",
            "serial links require the `serial` feature",
        )),
    }
}

// ----------------------------------------------------------------------------
// TCP
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TcpLinkOpener {
    host: String,
    port: u16,
}

impl TcpLinkOpener {
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl LinkOpener for TcpLinkOpener {
    async fn open(&self) -> Result<BoxedLink, TransportError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| TransportError::ConnectionFailed {
                endpoint: self.endpoint(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;
        debug!(endpoint = %self.endpoint(), "TCP link opened");
        Ok(Box::new(stream))
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ----------------------------------------------------------------------------
// Virtual link
// ----------------------------------------------------------------------------

/// Connector side of an in-memory link
#[derive(Debug, Clone)]
pub struct VirtualLinkOpener {
    radio: mpsc::UnboundedSender<DuplexStream>,
    online: Arc<AtomicBool>,
    buffer: usize,
}

/// Device side of an in-memory link; receives one stream per connection
#[derive(Debug)]
pub struct VirtualRadio {
    links: mpsc::UnboundedReceiver<DuplexStream>,
    online: Arc<AtomicBool>,
}

/// Create a connected opener/radio pair with `buffer` bytes per direction
pub fn virtual_link(buffer: usize) -> (VirtualLinkOpener, VirtualRadio) {
    let (radio, links) = mpsc::unbounded_channel();
    let online = Arc::new(AtomicBool::new(true));
    (
        VirtualLinkOpener {
            radio,
            online: online.clone(),
            buffer: buffer.max(64),
        },
        VirtualRadio { links, online },
    )
}

#[async_trait]
impl LinkOpener for VirtualLinkOpener {
    async fn open(&self) -> Result<BoxedLink, TransportError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed {
                endpoint: self.endpoint(),
                reason: "device offline".to_string(),
            });
        }
        let (local, remote) = tokio::io::duplex(self.buffer);
        self.radio
            .send(remote)
            .map_err(|_| TransportError::ConnectionFailed {
                endpoint: self.endpoint(),
                reason: "device side dropped".to_string(),
            })?;
        Ok(Box::new(local))
    }

    fn endpoint(&self) -> String {
        "virtual".to_string()
    }
}

impl VirtualRadio {
    /// Next stream opened by the connector
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.links.recv().await
    }

    /// Offline radios refuse new connections; open streams are unaffected
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

// ----------------------------------------------------------------------------
// Serial
// ----------------------------------------------------------------------------

#[cfg(feature = "serial")]
pub mod serial {
    use std::io::{ErrorKind, Read, Write};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use meshmon_core::errors::TransportError;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::runtime::Handle;
    use tracing::debug;

    use super::{BoxedLink, LinkOpener};

    const SERIAL_BUFFER: usize = 4096;
    const READ_TIMEOUT: Duration = Duration::from_millis(100);

    /// Serial device bridged onto an in-memory stream by two blocking threads
    #[derive(Debug, Clone)]
    pub struct SerialLinkOpener {
        path: String,
        baud_rate: u32,
    }

    impl SerialLinkOpener {
        pub fn new<P: Into<String>>(path: P, baud_rate: u32) -> Self {
            Self {
                path: path.into(),
                baud_rate,
            }
        }

        fn failed(&self, reason: String) -> TransportError {
            TransportError::ConnectionFailed {
                endpoint: self.path.clone(),
                reason,
            }
        }
    }

    #[async_trait]
    impl LinkOpener for SerialLinkOpener {
        async fn open(&self) -> Result<BoxedLink, TransportError> {
            let (path, baud_rate) = (self.path.clone(), self.baud_rate);
            let mut port = tokio::task::spawn_blocking(move || {
                serialport::new(path, baud_rate).timeout(READ_TIMEOUT).open()
            })
            .await
            .map_err(|e| self.failed(e.to_string()))?
            .map_err(|e| self.failed(e.to_string()))?;
            let mut reader = port.try_clone().map_err(|e| self.failed(e.to_string()))?;

            let (link, device_side) = tokio::io::duplex(SERIAL_BUFFER);
            let (mut side_read, mut side_write) = tokio::io::split(device_side);
            let closed = Arc::new(AtomicBool::new(false));
            let handle = Handle::current();

            let reader_closed = closed.clone();
            let reader_handle = handle.clone();
            std::thread::spawn(move || {
                let mut buf = [0u8; 512];
                while !reader_closed.load(Ordering::SeqCst) {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if reader_handle.block_on(side_write.write_all(&buf[..n])).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                        Err(_) => break,
                    }
                }
                debug!("Serial reader stopped");
            });

            std::thread::spawn(move || {
                let mut buf = [0u8; 512];
                loop {
                    match handle.block_on(side_read.read(&mut buf)) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if port.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
                closed.store(true, Ordering::SeqCst);
                debug!("Serial writer stopped");
            });

            debug!(path = %self.path, baud_rate = self.baud_rate, "Serial link opened");
            Ok(Box::new(link))
        }

        fn endpoint(&self) -> String {
            self.path.clone()
        }
    }
}
