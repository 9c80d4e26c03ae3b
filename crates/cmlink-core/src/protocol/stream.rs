use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use serialport::SerialPort;

use super::TransportError;

/// Read side of a link. Never blocks for longer than a short port timeout.
pub trait ByteSource: Send {
    /// Return whatever bytes are available right now; may be empty
    fn read_available(&mut self) -> Result<Vec<u8>, TransportError>;
}

/// Write side of a link
pub trait ByteSink: Send {
    /// Write all bytes to the link
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;
}

/// Largest single read taken from the port
const READ_CHUNK: usize = 512;

/// Serial port wrapper implementing both link halves
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
}

impl SerialChannel {
    /// Wrap an opened and configured port
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }

    /// Clone the underlying port handle
    pub fn try_clone(&self) -> Result<SerialChannel, TransportError> {
        Ok(SerialChannel::new(self.port.try_clone()?))
    }

    /// Split into independent read and write halves
    pub fn split(self) -> Result<(Box<dyn ByteSource>, Box<dyn ByteSink>), TransportError> {
        let writer = self.try_clone()?;
        Ok((Box::new(self), Box::new(writer)))
    }
}

impl ByteSource for SerialChannel {
    fn read_available(&mut self) -> Result<Vec<u8>, TransportError> {
        // Poll bytes_to_read() instead of blocking in read()
        let available = self.port.bytes_to_read()? as usize;
        if available == 0 {
            return Ok(Vec::new());
        }

        let mut buf = vec![0u8; available.min(READ_CHUNK)];
        match self.port.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(TransportError::Io(e)),
        }
    }
}

impl ByteSink for SerialChannel {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.port.write_all(bytes)?;
        // flush() ends in tcdrain, which stalls on some USB CDC drivers;
        // write_all already hands the bytes to the kernel tty buffer
        #[cfg(not(target_family = "unix"))]
        self.port.flush()?;
        Ok(())
    }
}

/// TCP stream wrapper, for controllers reached through a serial-to-TCP bridge
pub struct TcpChannel {
    stream: TcpStream,
}

impl TcpChannel {
    /// Wrap a connected stream. Reads give up after `poll` so the reader
    /// can check its stop flag.
    pub fn new(stream: TcpStream, poll: Duration) -> io::Result<Self> {
        stream.set_read_timeout(Some(poll))?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Connect to `addr` (e.g. `192.168.0.10:4000`)
    pub fn connect(addr: &str, poll: Duration) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)?;
        Ok(Self::new(stream, poll)?)
    }

    /// Split into independent read and write halves
    pub fn split(self) -> Result<(Box<dyn ByteSource>, Box<dyn ByteSink>), TransportError> {
        let writer = TcpChannel {
            stream: self.stream.try_clone()?,
        };
        Ok((Box::new(self), Box::new(writer)))
    }
}

impl ByteSource for TcpChannel {
    fn read_available(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut buf = [0u8; READ_CHUNK];
        match self.stream.read(&mut buf) {
            Ok(0) => Err(TransportError::Closed),
            Ok(n) => Ok(buf[..n].to_vec()),
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(TransportError::Io(e)),
        }
    }
}

impl ByteSink for TcpChannel {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }
}
