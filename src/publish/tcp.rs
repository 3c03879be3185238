use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use super::{Link, Transport};

/// Newline-delimited JSON over a plain TCP connection.
pub struct TcpTransport {
    addr: String,
    connect_timeout: Duration,
    send_timeout: Duration,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration, send_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
            send_timeout,
        }
    }

    fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = self
            .addr
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve {}", self.addr))?
            .collect();
        if addrs.is_empty() {
            return Err(anyhow!("{} resolved to no addresses", self.addr));
        }
        Ok(addrs)
    }
}

impl Transport for TcpTransport {
    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    fn connect(&mut self) -> Result<Box<dyn Link>> {
        let mut last_err = None;
        for addr in self.resolve()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_write_timeout(Some(self.send_timeout))?;
                    stream.set_nodelay(true)?;
                    return Ok(Box::new(TcpLink { stream }));
                }
                Err(err) => last_err = Some(err),
            }
        }
        match last_err {
            Some(err) => Err(err).with_context(|| format!("failed to connect to {}", self.addr)),
            None => Err(anyhow!("failed to connect to {}", self.addr)),
        }
    }
}

struct TcpLink {
    stream: TcpStream,
}

impl Link for TcpLink {
    fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.stream.write_all(payload)?;
        self.stream.write_all(b"\n")?;
        self.stream.flush()?;
        Ok(())
    }

    fn is_open(&mut self) -> bool {
        if self.stream.set_nonblocking(true).is_err() {
            return false;
        }
        let mut scratch = [0u8; 64];
        let open = match self.stream.read(&mut scratch) {
            Ok(0) => false,
            // Inbound data is not part of the protocol; discard it.
            Ok(_) => true,
            Err(err) => err.kind() == ErrorKind::WouldBlock,
        };
        open && self.stream.set_nonblocking(false).is_ok()
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;

    #[test]
    fn sends_one_line_per_payload() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let reader = std::thread::spawn(move || -> Result<Vec<String>> {
            let (stream, _) = listener.accept()?;
            let lines = BufReader::new(stream).lines().take(2).collect::<std::io::Result<_>>()?;
            Ok(lines)
        });

        let mut transport =
            TcpTransport::new(addr.to_string(), Duration::from_secs(1), Duration::from_secs(1));
        let mut link = transport.connect()?;
        assert!(link.is_open());
        link.send(br#"{"n":1}"#)?;
        link.send(br#"{"n":2}"#)?;

        let lines = reader.join().unwrap()?;
        assert_eq!(lines, vec![r#"{"n":1}"#, r#"{"n":2}"#]);
        Ok(())
    }

    #[test]
    fn peer_close_is_detected() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let mut transport =
            TcpTransport::new(addr.to_string(), Duration::from_secs(1), Duration::from_secs(1));
        let mut link = transport.connect()?;
        let (peer, _) = listener.accept()?;
        drop(peer);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while link.is_open() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!link.is_open());
        Ok(())
    }

    #[test]
    fn refused_connection_is_an_error() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);
        let mut transport =
            TcpTransport::new(addr.to_string(), Duration::from_millis(200), Duration::from_secs(1));
        assert!(transport.connect().is_err());
        Ok(())
    }
}
