use crate::net::packet::Packet;
use crate::net::support::NetworkResult;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

enum Endpoint {
    Listener(mio::net::TcpListener),
    Stream(TcpStream),
    Closed,
}

/// A TCP endpoint in one of two roles fixed at construction: a listener
/// bound to a local port, or a connected stream. Streams start out blocking;
/// the server flips the ones it owns to non-blocking before handing them to
/// a reactor.
pub struct Socket {
    endpoint: Endpoint,
}

impl Socket {
    /// Binds `0.0.0.0:port` with address reuse and starts listening.
    pub fn listen(port: u16) -> NetworkResult<Socket> {
        let address: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
        let listener = mio::net::TcpListener::bind(&address)?;

        Ok(Socket {
            endpoint: Endpoint::Listener(listener),
        })
    }

    /// Blocks until a connection to `address:port` is established.
    pub fn connect(address: &str, port: u16) -> NetworkResult<Socket> {
        let address: SocketAddr = format!("{}:{}", address, port).parse()?;
        let stream = TcpStream::connect(&address)?;

        Ok(Socket {
            endpoint: Endpoint::Stream(stream),
        })
    }

    /// Accepts one pending connection, yielding the connected endpoint and
    /// the peer address. Returns `Wait` when nothing is pending.
    pub fn accept(&self) -> NetworkResult<(Socket, SocketAddr)> {
        let (stream, address) = self.listener().accept_std()?;

        Ok((
            Socket {
                endpoint: Endpoint::Stream(stream),
            },
            address,
        ))
    }

    /// Makes subsequent reads and writes non-blocking. Listeners already
    /// are.
    pub fn set_non_blocking(&mut self) -> NetworkResult<()> {
        match &self.endpoint {
            Endpoint::Stream(stream) => {
                stream.set_nonblocking(true)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Reads up to `buffer.len()` bytes. `Ok(0)` signals an orderly close by
    /// the peer; `Wait` that nothing is buffered on a non-blocking stream.
    pub fn read(&mut self, buffer: &mut [u8]) -> NetworkResult<usize> {
        let mut stream = self.stream();
        let count = stream.read(buffer)?;

        Ok(count)
    }

    /// Writes from `buffer` in a single call, surfacing a partial count
    /// as-is.
    pub fn write_bytes(&mut self, buffer: &[u8]) -> NetworkResult<usize> {
        let mut stream = self.stream();
        let count = stream.write(buffer)?;

        Ok(count)
    }

    /// Serializes `packet` and transmits it in one write.
    pub fn write_packet(&mut self, packet: &Packet) -> NetworkResult<usize> {
        let frame = packet.serialize();
        self.write_bytes(&frame)
    }

    /// Shuts the stream down in both directions. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Endpoint::Stream(stream) = &self.endpoint {
            drop(stream.shutdown(Shutdown::Both));
        }

        self.endpoint = Endpoint::Closed;
    }

    /// Local address of a listening socket.
    pub fn local_addr(&self) -> NetworkResult<SocketAddr> {
        let address = self.listener().local_addr()?;

        Ok(address)
    }

    pub fn raw_fd(&self) -> RawFd {
        match &self.endpoint {
            Endpoint::Listener(listener) => listener.as_raw_fd(),
            Endpoint::Stream(stream) => stream.as_raw_fd(),
            Endpoint::Closed => panic!("Socket already closed"),
        }
    }

    fn listener(&self) -> &mio::net::TcpListener {
        match &self.endpoint {
            Endpoint::Listener(listener) => listener,
            _ => panic!("Socket must be a listener"),
        }
    }

    fn stream(&self) -> &TcpStream {
        match &self.endpoint {
            Endpoint::Stream(stream) => stream,
            _ => panic!("Socket must be an open stream"),
        }
    }
}
