//! Single TCP session to one cache node, with request/response framing.
//!
//! The protocol is strictly request/response: one command in flight per
//! connection, except that a per-node store batch is written back-to-back
//! and its replies read in order on the same connection.

use std::io::{BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};

use memring_proto::{encode_command, read_response, Command, ProtoError, Response};

use crate::config::ClientConfig;
use crate::error::{Error, Result};

/// One established connection with reusable buffers.
///
/// Buffers live on the connection so the hot path does not allocate per call.
/// The stream closes when the connection drops.
pub struct Connection {
    // Buffered reader reduces syscalls while still allowing direct writes.
    reader: BufReader<TcpStream>,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
    max_value_size: usize,
}

impl Connection {
    /// Opens a connection to `addr`, applying the configured timeouts.
    pub fn open(addr: &str, config: &ClientConfig) -> Result<Self> {
        let stream = connect_stream(addr, config)?;
        stream.set_read_timeout(Some(config.read_timeout))?;
        stream.set_write_timeout(Some(config.write_timeout))?;
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;

        Ok(Connection {
            reader: BufReader::new(stream),
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
            max_value_size: config.max_value_size,
        })
    }

    /// Sends one command and reads its response.
    pub fn round_trip(&mut self, cmd: &Command<'_>) -> Result<Response> {
        self.write_buf.clear();
        encode_command(cmd, &mut self.write_buf);
        self.flush_write_buf()?;
        self.read_one()
    }

    /// Sends a batch of commands back-to-back and reads one response per
    /// command, in order.
    pub fn round_trip_batch(&mut self, cmds: &[Command<'_>]) -> Result<Vec<Response>> {
        self.write_buf.clear();
        for cmd in cmds {
            encode_command(cmd, &mut self.write_buf);
        }
        self.flush_write_buf()?;

        let mut responses = Vec::with_capacity(cmds.len());
        for _ in cmds {
            responses.push(self.read_one()?);
        }
        Ok(responses)
    }

    fn flush_write_buf(&mut self) -> Result<()> {
        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf).map_err(map_io)?;
        stream.flush().map_err(map_io)?;
        Ok(())
    }

    fn read_one(&mut self) -> Result<Response> {
        read_response(&mut self.reader, &mut self.line_buf, self.max_value_size)
            .map_err(map_proto)
    }
}

fn connect_stream(addr: &str, config: &ClientConfig) -> Result<TcpStream> {
    let connect = || -> std::io::Result<TcpStream> {
        let mut last_err = None;
        for sock_addr in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&sock_addr, config.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "address resolved to nothing")
        }))
    };

    connect().map_err(|source| Error::Connect {
        addr: addr.to_string(),
        source,
    })
}

/// Socket timeouts surface as WouldBlock or TimedOut depending on platform.
fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

fn map_io(err: std::io::Error) -> Error {
    if is_timeout(&err) {
        Error::Timeout
    } else {
        Error::Io(err)
    }
}

fn map_proto(err: ProtoError) -> Error {
    match err {
        ProtoError::Io(io_err) => map_io(io_err),
        other => Error::Protocol(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    fn test_config() -> ClientConfig {
        let mut config = ClientConfig::new(["127.0.0.1:1"]);
        config.connect_timeout = Duration::from_millis(500);
        config.read_timeout = Duration::from_millis(500);
        config.write_timeout = Duration::from_millis(500);
        config
    }

    #[test]
    fn connect_refused_maps_to_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        match Connection::open(&addr, &test_config()) {
            Err(Error::Connect { addr: failed, .. }) => assert_eq!(failed, addr),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn round_trip_exchanges_one_command() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 128];
            let n = stream.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"version\r\n");
            stream.write_all(b"VERSION test\r\n").unwrap();
        });

        let mut conn = Connection::open(&addr, &test_config()).unwrap();
        let resp = conn.round_trip(&Command::Version).unwrap();
        assert_eq!(resp, Response::Version("test".to_string()));
    }

    #[test]
    fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            // Hold the socket open without answering.
            thread::sleep(Duration::from_millis(800));
            drop(stream);
        });

        let mut conn = Connection::open(&addr, &test_config()).unwrap();
        match conn.round_trip(&Command::Version) {
            Err(Error::Timeout) => {}
            other => panic!("unexpected: {:?}", other),
        }
        handle.join().unwrap();
    }
}
