//! The byte-oriented duplex link the engine runs over.
//! Out of scope for this crate: UART baud/parity/flow-control *discovery*
//! from platform firmware (modeled as [`crate::controller::PlatformDescriptor`]),
//! and DMA channel pre-flight. What the transport itself must do is narrow:
//! open, close, write with a timeout, and hand inbound bytes to the
//! controller via [`crate::SshController::feed`].

use std::io::{self, Read, Write};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    RtsCts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UartConfig {
    pub baud_rate: u32,
    pub parity: Parity,
    pub flow_control: FlowControl,
}

/// External collaborator: a duplex byte transport. Implementations are
/// expected to spawn their own reader and push inbound bytes into the
/// controller via `feed`; this trait only covers the write/control half.
pub trait Transport: Send + Sync {
    fn open(&self) -> io::Result<()>;
    fn close(&self) -> io::Result<()>;
    fn write(&self, buf: &[u8], timeout: Duration) -> io::Result<()>;
    fn configure(&self, cfg: UartConfig) -> io::Result<()>;
}

/// A real transport backed by a physical or virtual serial port, using the
/// `serialport` crate.
pub struct SerialTransport {
    path: String,
    port: std::sync::Mutex<Option<Box<dyn serialport::SerialPort>>>,
}

impl SerialTransport {
    pub fn new(path: impl Into<String>) -> Self {
        SerialTransport {
            path: path.into(),
            port: std::sync::Mutex::new(None),
        }
    }

    /// Spawns a reader thread that repeatedly reads from the port and feeds
    /// bytes into `feed`. Returns immediately; the thread runs until the
    /// port is closed and a read errors out.
    pub fn spawn_reader(&self, feed: impl Fn(&[u8]) -> usize + Send + 'static) -> io::Result<()> {
        let mut reader = {
            let guard = self.port.lock().unwrap();
            let port = guard
                .as_ref()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "port not open"))?;
            port.try_clone()?
        };
        std::thread::Builder::new()
            .name("ssh-ec-reader".into())
            .spawn(move || {
                let mut buf = [0u8; 512];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => continue,
                        Ok(n) => {
                            feed(&buf[..n]);
                        }
                        Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                        Err(_) => break,
                    }
                }
            })
            .map(|_| ())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

impl Transport for SerialTransport {
    fn open(&self) -> io::Result<()> {
        let port = serialport::new(&self.path, 115_200)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        *self.port.lock().unwrap() = Some(port);
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        *self.port.lock().unwrap() = None;
        Ok(())
    }

    fn write(&self, buf: &[u8], _timeout: Duration) -> io::Result<()> {
        let mut guard = self.port.lock().unwrap();
        let port = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "port not open"))?;
        port.write_all(buf)
    }

    fn configure(&self, cfg: UartConfig) -> io::Result<()> {
        let mut guard = self.port.lock().unwrap();
        let port = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "port not open"))?;
        port.set_baud_rate(cfg.baud_rate)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        port.set_parity(match cfg.parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        })
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        port.set_flow_control(match cfg.flow_control {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::RtsCts => serialport::FlowControl::Hardware,
        })
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(())
    }
}
