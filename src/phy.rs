use std::net::{SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use log::trace;
use nix::poll::{poll, PollFd, PollFlags};
use rand::Rng;

use crate::err::Error;
use crate::proto::Pdu;

const MAX_DATAGRAM: usize = 1500;

/// Best-effort datagram primitive: a UDP socket with an artificial loss
/// injector on the send side. Stands in for an IP service with observable
/// loss.
#[derive(Debug)]
pub struct Endpoint {
    socket: UdpSocket,
    loss_rate: AtomicU32,
}

impl Endpoint {
    /// Binds a datagram endpoint. Loss injection starts disabled.
    pub fn open(addr: SocketAddr) -> Result<Endpoint, Error> {
        let socket = UdpSocket::bind(addr)?;

        Ok(Endpoint {
            socket,
            loss_rate: AtomicU32::new(0),
        })
    }

    /// Configures the loss injector, in percent of sent datagrams.
    pub fn set_loss_rate(&self, percent: u32) {
        self.loss_rate.store(percent, Ordering::Relaxed);
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.socket.local_addr()?)
    }

    /// Best-effort send: the datagram is silently discarded with the
    /// configured probability, as a lossy channel would.
    pub fn send(&self, pdu: &Pdu, dest: SocketAddr) -> Result<(), Error> {
        let loss_rate = self.loss_rate.load(Ordering::Relaxed);
        if loss_rate > 0 && rand::thread_rng().gen_range(0..100) < loss_rate {
            trace!("loss injector dropped a datagram for {dest}");
            return Ok(());
        }

        let wire = pdu.encode();
        match self.socket.send_to(&wire, dest) {
            Ok(_) => Ok(()),
            Err(err) => {
                trace!("datagram send to {dest} failed: {err}");
                Err(Error::Transport)
            }
        }
    }

    /// Receives one PDU, waiting at most `timeout_ms` (0 waits forever).
    /// `Ok(None)` reports a timeout.
    pub fn recv(&self, timeout_ms: u32) -> Result<Option<(Pdu, SocketAddr)>, Error> {
        let wait = if timeout_ms == 0 { -1 } else { timeout_ms as i32 };

        let mut pfd = [PollFd::new(self.socket.as_raw_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut pfd[..], wait).map_err(std::io::Error::from)?;
        if ready == 0 {
            return Ok(None);
        }

        let mut buf = [0u8; MAX_DATAGRAM];
        let (n, from) = self.socket.recv_from(&mut buf)?;
        let pdu = Pdu::decode(&buf[..n])?;

        Ok(Some((pdu, from)))
    }
}

impl AsRawFd for Endpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

pub fn timeout_ms(timeout: Duration) -> u32 {
    timeout.as_millis() as u32
}
