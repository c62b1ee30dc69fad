use std::io::prelude::*;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
use std::time::Duration;

use crate::error::Result;
use crate::rdma::mr::{Mr, RemoteMr};
use crate::rdma::qp::{HandshakeData, RcQp, HANDSHAKE_BYTES};

fn stream_write(stream: &mut TcpStream, buf: &[u8]) -> Result<()> {
    stream.write_all(&(buf.len() as u64).to_le_bytes())?;
    stream.write_all(buf)?;
    Ok(())
}

fn stream_read(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut len = [0u8; 8];
    stream.read_exact(&mut len)?;
    let len = u64::from_le_bytes(len) as usize;

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

/// Connection manager that bootstraps a queue pair with a specific remote
/// peer over TCP.
///
/// Exactly one side passes the peer address (and connects, retrying until
/// the other side is up); the other passes `None` and accepts.
pub struct Connecter {
    stream: TcpStream,
}

impl Connecter {
    /// Default TCP port for the bootstrap exchange.
    pub const DEFAULT_PORT: u16 = 13337;

    /// Connect to `peer`, or accept one connection if `peer` is `None`.
    pub fn new(peer: Option<Ipv4Addr>) -> Result<Self> {
        Self::new_on_port(peer, Self::DEFAULT_PORT)
    }

    /// Like [`Connecter::new`], on an explicit port.
    pub fn new_on_port(peer: Option<Ipv4Addr>, port: u16) -> Result<Self> {
        let stream = match peer {
            Some(ip) => {
                let addr = SocketAddrV4::new(ip, port);
                loop {
                    match TcpStream::connect(addr) {
                        Ok(stream) => break stream,
                        Err(_) => std::thread::sleep(Duration::from_millis(100)),
                    }
                }
            }
            None => {
                let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))?;
                listener.accept()?.0
            }
        };
        Ok(Self { stream })
    }

    /// Exchange handshake records with the peer and bring the queue pair
    /// up to RTS.
    ///
    /// Both sides write their fixed 26-byte record first and then read the
    /// peer's; the records fit the socket buffer, so the symmetric order
    /// cannot deadlock.
    pub fn handshake(&mut self, qp: &RcQp) -> Result<HandshakeData> {
        let local = qp.handshake()?;
        self.stream.write_all(&local.to_bytes())?;

        let mut buf = [0u8; HANDSHAKE_BYTES];
        self.stream.read_exact(&mut buf)?;
        let peer = HandshakeData::from_bytes(&buf);

        qp.bring_up(&peer)?;
        Ok(peer)
    }

    /// Send the remote descriptor of a local MR to the peer.
    pub fn send_mr(&mut self, mr: &Mr) -> Result<()> {
        let mr = RemoteMr::from(mr);
        let json = serde_json::to_string(&mr)?;
        stream_write(&mut self.stream, json.as_bytes())
    }

    /// Receive a remote MR descriptor from the peer.
    pub fn recv_mr(&mut self) -> Result<RemoteMr> {
        let buf = stream_read(&mut self.stream)?;
        Ok(serde_json::from_slice::<RemoteMr>(&buf)?)
    }
}
