//! Physical links to a Meshtastic device.
//!
//! A [`Connector`] opens a fresh byte stream each time the transport (re)connects. TCP
//! nodes expose the stream API on port 4403; USB/UART nodes are driven through the
//! blocking `serialport` crate and bridged into an async stream.
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::config::{DeviceConfig, TransportKind};

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type DeviceStream = Box<dyn AsyncStream>;
pub type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<DeviceStream>> + Send>>;

/// Opens a byte stream to the device.
pub trait Connector: Send + Sync {
    fn open(&self) -> ConnectFuture;
    fn describe(&self) -> String;
}

/// Build the connector named by the device section of the config.
pub fn connector_for(config: &DeviceConfig) -> Result<Arc<dyn Connector>> {
    let connector: Arc<dyn Connector> = match config.transport {
        TransportKind::Tcp => Arc::new(TcpConnector::new(&config.host, config.tcp_port)),
        #[cfg(feature = "serial")]
        TransportKind::Serial => Arc::new(serial::SerialConnector::new(
            &config.serial_port,
            config.baud_rate,
        )),
        #[cfg(not(feature = "serial"))]
        TransportKind::Serial => anyhow::bail!(
            "{}: serial transport requested but the 'serial' feature is not enabled",
            config.describe()
        ),
    };
    Ok(connector)
}

pub struct TcpConnector {
    host: String,
    port: u16,
}

impl TcpConnector {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }
}

impl Connector for TcpConnector {
    fn open(&self) -> ConnectFuture {
        let host = self.host.clone();
        let port = self.port;
        Box::pin(async move {
            debug!("Opening TCP link to {}:{}", host, port);
            let stream = TcpStream::connect((host.as_str(), port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as DeviceStream)
        })
    }

    fn describe(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

#[cfg(feature = "serial")]
pub mod serial {
    use super::*;
    use log::warn;
    use serialport::SerialPort;
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const READ_TIMEOUT: Duration = Duration::from_millis(50);

    pub struct SerialConnector {
        path: String,
        baud_rate: u32,
    }

    impl SerialConnector {
        pub fn new(path: &str, baud_rate: u32) -> Self {
            Self {
                path: path.to_string(),
                baud_rate,
            }
        }
    }

    impl Connector for SerialConnector {
        fn open(&self) -> ConnectFuture {
            let path = self.path.clone();
            let baud = self.baud_rate;
            Box::pin(async move {
                let port = tokio::task::spawn_blocking(move || open_port(&path, baud))
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
                Ok(bridge_port(Arc::new(Mutex::new(port))))
            })
        }

        fn describe(&self) -> String {
            format!("serial://{}@{}", self.path, self.baud_rate)
        }
    }

    fn open_port(path: &str, baud: u32) -> io::Result<Box<dyn SerialPort>> {
        debug!("Opening serial port {} at {} baud", path, baud);
        let mut builder = serialport::new(path, baud).timeout(READ_TIMEOUT);
        #[cfg(unix)]
        {
            builder = builder
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None);
        }
        let mut port = builder.open()?;

        // Toggle DTR/RTS so the device wakes, then drop buffered boot text
        let _ = port.write_data_terminal_ready(true);
        let _ = port.write_request_to_send(true);
        std::thread::sleep(Duration::from_millis(150));
        let _ = port.clear(serialport::ClearBuffer::Input);
        Ok(port)
    }

    /// Expose a blocking port as an async stream: a reader thread feeds one half of an
    /// in-memory duplex and a writer task drains the other half into the port.
    fn bridge_port(port: Arc<Mutex<Box<dyn SerialPort>>>) -> DeviceStream {
        let (client, bridge) = tokio::io::duplex(4096);
        let (mut bridge_rx, mut bridge_tx) = tokio::io::split(bridge);
        let closed = Arc::new(AtomicBool::new(false));
        let handle = tokio::runtime::Handle::current();

        let reader_port = port.clone();
        let reader_closed = closed.clone();
        std::thread::spawn(move || {
            let mut buf = [0u8; 1024];
            while !reader_closed.load(Ordering::Relaxed) {
                let read = match reader_port.lock() {
                    Ok(mut guard) => guard.read(&mut buf),
                    Err(_) => break,
                };
                match read {
                    Ok(0) => {}
                    Ok(n) => {
                        if handle.block_on(bridge_tx.write_all(&buf[..n])).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                    Err(e) => {
                        warn!("Serial read error: {}", e);
                        break;
                    }
                }
            }
            reader_closed.store(true, Ordering::Relaxed);
            debug!("Serial reader thread exiting");
        });

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            loop {
                let n = match bridge_rx.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if closed.load(Ordering::Relaxed) {
                    break;
                }
                let chunk = buf[..n].to_vec();
                let port = port.clone();
                let written = tokio::task::spawn_blocking(move || -> io::Result<()> {
                    let mut guard = port
                        .lock()
                        .map_err(|_| io::Error::new(io::ErrorKind::Other, "serial port poisoned"))?;
                    guard.write_all(&chunk)?;
                    guard.flush()
                })
                .await;
                match written {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!("Serial write error: {}", e);
                        break;
                    }
                    Err(e) => {
                        warn!("Serial writer task failed: {}", e);
                        break;
                    }
                }
            }
            closed.store(true, Ordering::Relaxed);
        });

        Box::new(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_connector_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let connector = TcpConnector::new("127.0.0.1", addr.port());
        assert_eq!(connector.describe(), format!("tcp://127.0.0.1:{}", addr.port()));
        let mut stream = connector.open().await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut echo = [0u8; 4];
        stream.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"ping");
    }

    #[tokio::test]
    async fn tcp_connector_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(TcpConnector::new("127.0.0.1", port).open().await.is_err());
    }
}
