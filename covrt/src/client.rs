//! Client side of the runtime control protocol.
//!
//! Every call opens a fresh connection, sends one request, reads one
//! response, and closes the connection.

use std::io::{BufReader, BufWriter};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use covrt_proto::{DEFAULT_HOST, DEFAULT_PORT, Payload, Request, Response};
use tracing::trace;

use crate::{Error, Result};

/// Proxy for a remote [`Controller`](crate::Controller).
#[derive(Debug, Clone)]
pub struct ClientProxy {
    /// Resolved endpoint candidates, tried in order.
    addrs: Vec<SocketAddr>,
    /// Per-address connect timeout.
    connect_timeout: Option<Duration>,
    /// Read/write timeout on the connection.
    io_timeout: Option<Duration>,
}

impl ClientProxy {
    /// Resolves `host:port`.
    pub fn create(host: &str, port: u16) -> Result<Self> {
        let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "host [{host}] did not resolve"
            )));
        }
        Ok(Self {
            addrs,
            connect_timeout: None,
            io_timeout: None,
        })
    }

    /// Parses `host`, `host:port`, `:port`, or a bare port, with missing
    /// parts defaulting to `localhost` and the standard control port.
    pub fn from_connection_string(spec: &str) -> Result<Self> {
        let (host, port) = parse_connection_string(spec)?;
        Self::create(&host, port)
    }

    /// Limits how long each connection attempt may take.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Limits how long a read or write may block.
    #[must_use]
    pub const fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }

    /// Sends `request` and waits for the response.
    ///
    /// Only transport and protocol failures are errors here; an error
    /// payload comes back as a normal [`Response`].
    pub fn execute(&self, request: &Request) -> Result<Response> {
        let stream = self.connect()?;
        stream.set_read_timeout(self.io_timeout)?;
        stream.set_write_timeout(self.io_timeout)?;
        trace!(request = %request, peer = ?stream.peer_addr().ok(), "sending control request");

        covrt_proto::encode_request(&mut BufWriter::new(&stream), request)?;
        let response = covrt_proto::decode_response(&mut BufReader::new(&stream))?;
        Ok(response)
    }

    /// Like [`execute`](Self::execute) but re-raises an error payload as
    /// [`Error::Remote`].
    pub fn call(&self, request: &Request) -> Result<Payload> {
        self.execute(request)?.into_result().map_err(Error::Remote)
    }

    fn connect(&self) -> Result<TcpStream> {
        let mut last = None;
        for addr in &self.addrs {
            let attempt = match self.connect_timeout {
                Some(t) => TcpStream::connect_timeout(addr, t),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => return Ok(stream),
                Err(e) => last = Some(e),
            }
        }
        Err(last.map_or_else(
            || Error::InvalidArgument("no address to connect to".into()),
            Error::Io,
        ))
    }
}

/// Splits a `[host][:][port]` connection string.
pub fn parse_connection_string(spec: &str) -> Result<(String, u16)> {
    let spec = spec.trim();
    let (host, port) = match spec.rsplit_once(':') {
        Some((h, p)) if !h.contains(':') || h.starts_with('[') => (h, Some(p)),
        _ if spec.chars().all(|c| c.is_ascii_digit()) && !spec.is_empty() => ("", Some(spec)),
        _ => (spec, None),
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let host = if host.is_empty() { DEFAULT_HOST } else { host };
    let port = match port.filter(|p| !p.is_empty()) {
        Some(p) => p
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid port [{p}]")))?,
        None => DEFAULT_PORT,
    };
    Ok((host.to_owned(), port))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn connection_string_forms() {
        let cases = [
            ("", ("localhost", 47653)),
            ("box", ("box", 47653)),
            ("box:9000", ("box", 9000)),
            (":9000", ("localhost", 9000)),
            ("9000", ("localhost", 9000)),
            ("box:", ("box", 47653)),
            ("[::1]:80", ("::1", 80)),
        ];
        for (spec, (host, port)) in cases {
            assert_eq!(parse_connection_string(spec).unwrap(), (host.to_owned(), port), "{spec}");
        }
        assert!(parse_connection_string("box:http").is_err());
    }

    #[test]
    fn refused_connection_is_error() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let client = ClientProxy::create("127.0.0.1", port).unwrap();
        let req = Request::new(3, Vec::new());
        assert!(matches!(client.execute(&req), Err(Error::Io(_))));
    }

    #[test]
    fn premature_close_is_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            covrt_proto::decode_request(&mut BufReader::new(&stream)).unwrap();
        });

        let client = ClientProxy::create("127.0.0.1", port).unwrap();
        let err = client.execute(&Request::new(3, Vec::new())).unwrap_err();
        server.join().unwrap();
        assert!(matches!(err, Error::Proto(e) if e.is_eof()));
    }
}
