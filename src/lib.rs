use std::cmp;
use std::sync::Arc;

use log::{debug, trace, warn};

mod err;
pub use err::*;

mod buffer;
pub mod config;
mod phy;
mod proto;

pub use phy::Endpoint;
pub use proto::{Mode, Pdu, SockAddr, State};

use config::{
    CLOSE_TIMEOUT, LOSS_RATE, MAX_ATTEMPTS, PROBE_ACK_TIMEOUT, PROBE_PACKET_COUNT, PROBE_PAYLOAD,
    TIMEOUT, WINDOW_SIZE,
};
use phy::timeout_ms;
use proto::{send_connection_ack, spawn_dispatcher, tolerance_for, SocketTable};

/// The MIC-TCP transport: a socket table plus the facade operations. Clones
/// share the same table, so a stack can be handed to as many threads as
/// needed.
#[derive(Debug, Clone, Default)]
pub struct Stack {
    table: Arc<SocketTable>,
}

impl Stack {
    pub fn new() -> Self {
        Stack {
            table: Arc::new(SocketTable::new()),
        }
    }

    /// Allocates a connection record and returns its public descriptor.
    pub fn socket(&self, mode: Mode) -> Result<i32, Error> {
        let socket = self.table.allocate(mode)?;
        debug!("socket created (fd {}, {:?})", socket.fd, mode);

        Ok(socket.fd)
    }

    /// Attaches the socket to a local address. The datagram endpoint comes
    /// to life here; a server's dispatcher thread starts here too, so that
    /// `accept` has someone to hand it the SYN.
    pub fn bind(&self, fd: i32, addr: SockAddr) -> Result<(), Error> {
        let socket = self.table.by_fd(fd).ok_or(Error::InvalidSocket(fd))?;
        let mut conn = socket.conn.lock().unwrap();

        let endpoint = Arc::new(Endpoint::open(addr.ip_addr)?);
        endpoint.set_loss_rate(LOSS_RATE);
        socket.attach_endpoint(&mut conn, endpoint.clone());
        conn.local_addr = Some(SockAddr::new(endpoint.local_addr()?, addr.port));
        conn.state = State::Idle;
        debug!("socket {fd} bound to port {}", addr.port);

        if conn.mode == Mode::Server {
            conn.listener = Some(spawn_dispatcher(self.table.clone(), endpoint, Mode::Server));
        }

        Ok(())
    }

    /// The local address the socket is bound to, with any ephemeral port
    /// resolved.
    pub fn local_addr(&self, fd: i32) -> Result<SockAddr, Error> {
        let socket = self.table.by_fd(fd).ok_or(Error::InvalidSocket(fd))?;
        let conn = socket.conn.lock().unwrap();

        conn.local_addr.ok_or(Error::WrongState(conn.state))
    }

    /// Reconfigures the endpoint's artificial loss injector.
    pub fn set_loss_rate(&self, fd: i32, percent: u32) -> Result<(), Error> {
        let socket = self.table.by_fd(fd).ok_or(Error::InvalidSocket(fd))?;
        let conn = socket.conn.lock().unwrap();

        let endpoint = conn.endpoint.as_ref().ok_or(Error::WrongState(conn.state))?;
        endpoint.set_loss_rate(percent);

        Ok(())
    }

    /// Waits for a connection: blocks until a SYN arrives, then answers
    /// SYN+ACK until the handshake ACK is in. Returns the peer's address.
    pub fn accept(&self, fd: i32) -> Result<SockAddr, Error> {
        let socket = self.table.by_fd(fd).ok_or(Error::InvalidSocket(fd))?;
        let mut conn = socket.conn.lock().unwrap();

        if conn.endpoint.is_none() {
            return Err(Error::WrongState(conn.state));
        }

        conn.state = State::Accepting;
        debug!("socket {fd} accepting connections");

        conn = socket
            .cond
            .wait_while(conn, |conn| conn.state == State::Accepting)
            .unwrap();

        let mut attempts = 0;
        while conn.state == State::SynReceived {
            if attempts == MAX_ATTEMPTS {
                return Err(Error::HandshakeTimeout(attempts));
            }
            attempts += 1;

            let endpoint = conn.endpoint.clone().ok_or(Error::Transport)?;
            let remote = conn.remote_addr.ok_or(Error::Transport)?;
            let syn_ack = Pdu::control(true, true, false, 0, 0, conn.local_port(), remote.port);

            debug!("sending SYN+ACK (attempt {attempts})");
            if let Err(err) = endpoint.send(&syn_ack, remote.ip_addr) {
                warn!("failed to send SYN+ACK: {err}");
                continue;
            }

            let (guard, _) = socket
                .cond
                .wait_timeout_while(conn, TIMEOUT, |conn| conn.state == State::SynReceived)
                .unwrap();
            conn = guard;
        }

        if conn.state == State::Established {
            debug!("connection accepted");
            conn.remote_addr.ok_or(Error::Transport)
        } else {
            Err(Error::WrongState(conn.state))
        }
    }

    /// Connects to a listening peer: three-way handshake, then the
    /// reliability probe that decides how much loss this connection will
    /// silently absorb.
    pub fn connect(&self, fd: i32, addr: SockAddr) -> Result<(), Error> {
        let socket = self.table.by_fd(fd).ok_or(Error::InvalidSocket(fd))?;

        // An unbound client gets an ephemeral endpoint.
        let endpoint = {
            let mut conn = socket.conn.lock().unwrap();
            match conn.endpoint.clone() {
                Some(endpoint) => endpoint,
                None => {
                    let endpoint = Arc::new(Endpoint::open("0.0.0.0:0".parse().unwrap())?);
                    endpoint.set_loss_rate(LOSS_RATE);
                    socket.attach_endpoint(&mut conn, endpoint.clone());
                    conn.local_addr = Some(SockAddr::new(endpoint.local_addr()?, 0));
                    endpoint
                }
            }
        };
        let local_port = socket.conn.lock().unwrap().local_port();

        // SYN / SYN+ACK exchange, inline on the endpoint: the dispatcher is
        // not running yet on the client side.
        let mut attempts = 0;
        'handshake: loop {
            if attempts == MAX_ATTEMPTS {
                return Err(Error::HandshakeTimeout(attempts));
            }
            attempts += 1;

            let syn = Pdu::control(true, false, false, 0, 0, local_port, addr.port);
            debug!("sending SYN (attempt {attempts})");
            if endpoint.send(&syn, addr.ip_addr).is_err() {
                continue;
            }
            socket.conn.lock().unwrap().state = State::SynSent;

            loop {
                match endpoint.recv(timeout_ms(TIMEOUT)) {
                    Ok(Some((pdu, _))) if pdu.matches(true, true, false, 0, 0) => {
                        break 'handshake;
                    }
                    Ok(Some((pdu, _))) => {
                        trace!("ignoring {:?} while waiting for SYN+ACK", pdu.header);
                    }
                    Ok(None) => continue 'handshake,
                    Err(err) => trace!("dropping undecodable datagram: {err}"),
                }
            }
        }
        debug!("SYN+ACK received");

        {
            let mut conn = socket.conn.lock().unwrap();
            conn.remote_addr = Some(addr);
            send_connection_ack(&mut conn)?;
            conn.listener = Some(spawn_dispatcher(
                self.table.clone(),
                endpoint.clone(),
                Mode::Client,
            ));
            conn.state = State::MeasuringReliability;
            conn.received_packets = 0;
        }

        // Reliability probe. The lock is held across each send so the
        // dispatcher can only credit an ACK while we wait on the condvar.
        let probe = Pdu::data(0, local_port, addr.port, PROBE_PAYLOAD.to_vec());
        let mut conn = socket.conn.lock().unwrap();
        for i in 0..PROBE_PACKET_COUNT {
            if let Err(err) = endpoint.send(&probe, addr.ip_addr) {
                warn!("failed to send probe {}/{PROBE_PACKET_COUNT}: {err}", i + 1);
                continue;
            }

            let (guard, _) = socket.cond.wait_timeout(conn, PROBE_ACK_TIMEOUT).unwrap();
            conn = guard;
        }

        let received = conn.received_packets;
        drop(conn);

        let loss_rate = 100.0 - 100.0 * received as f32 / PROBE_PACKET_COUNT as f32;
        debug!(
            "channel reliability: {received}/{PROBE_PACKET_COUNT} probes acknowledged \
             ({loss_rate:.1}% loss)"
        );

        match tolerance_for(loss_rate) {
            Some(tolerated) => {
                let mut conn = socket.conn.lock().unwrap();
                conn.window.set_tolerated(tolerated);
                conn.state = State::Established;
                debug!("connection established, tolerating {tolerated}/{WINDOW_SIZE} losses");
                Ok(())
            }
            None => {
                warn!("channel too unreliable ({loss_rate:.1}% loss), closing");
                self.close(fd)?;
                Err(Error::PeerTooUnreliable(loss_rate))
            }
        }
    }

    /// Sends one application message. Stop-and-wait: the call returns once
    /// the ACK is credited, or once the loss window absorbs the silence (the
    /// message is then reported sent anyway), and retransmits otherwise.
    pub fn send(&self, fd: i32, msg: &[u8]) -> Result<usize, Error> {
        let socket = self.table.by_fd(fd).ok_or(Error::InvalidSocket(fd))?;
        let mut conn = socket.conn.lock().unwrap();

        if conn.state != State::Established {
            return Err(Error::WrongState(conn.state));
        }
        let endpoint = conn.endpoint.clone().ok_or(Error::Transport)?;
        let remote = conn.remote_addr.ok_or(Error::Transport)?;

        loop {
            let expected_ack = conn.current_seq_num.wrapping_add(1);
            let pdu = Pdu::data(
                conn.current_seq_num,
                conn.local_port(),
                remote.port,
                msg.to_vec(),
            );

            trace!("sending data (seq {})", conn.current_seq_num);
            endpoint.send(&pdu, remote.ip_addr)?;

            let (guard, _) = socket.cond.wait_timeout(conn, TIMEOUT).unwrap();
            conn = guard;

            if conn.current_seq_num == expected_ack {
                conn.window.record(true);
                return Ok(msg.len());
            }

            // Timed out, or credited with an ACK for something else.
            if conn.window.acceptable() {
                debug!(
                    "no ACK for seq {}, loss within tolerance",
                    expected_ack.wrapping_sub(1)
                );
                conn.window.record(false);
                return Ok(msg.len());
            }

            if conn.current_seq_num == 1 {
                // The peer may still be in SYN_RECEIVED, waiting for the
                // handshake ACK we already consider delivered.
                send_connection_ack(&mut conn)?;
            }

            trace!("retransmitting seq {}", conn.current_seq_num);
        }
    }

    /// Receives one application message: blocks until the dispatcher has
    /// delivered a payload, and returns 0 once the connection has closed
    /// and the queue is drained.
    pub fn recv(&self, fd: i32, buf: &mut [u8]) -> Result<usize, Error> {
        let socket = self.table.by_fd(fd).ok_or(Error::InvalidSocket(fd))?;
        let rx = socket.conn.lock().unwrap().rx.clone();

        match rx.get() {
            Some(payload) => {
                let n = cmp::min(buf.len(), payload.len());
                buf[..n].copy_from_slice(&payload[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    /// Tears the connection down (FIN / FIN+ACK / ACK, bounded retries) and
    /// releases the record: the dispatcher is joined and the table slot is
    /// freed for reuse.
    pub fn close(&self, fd: i32) -> Result<(), Error> {
        let socket = self.table.by_fd(fd).ok_or(Error::InvalidSocket(fd))?;
        let mut conn = socket.conn.lock().unwrap();

        if conn.state != State::Closed {
            if let Some(remote) = conn.remote_addr {
                let endpoint = conn.endpoint.clone().ok_or(Error::Transport)?;

                conn.state = State::Closing;
                let fin = Pdu::control(false, false, true, 0, 0, conn.local_port(), remote.port);

                let mut attempts = 0;
                let mut fin_ack_received = false;
                while !fin_ack_received && attempts < MAX_ATTEMPTS {
                    attempts += 1;

                    debug!("sending FIN (attempt {attempts})");
                    if let Err(err) = endpoint.send(&fin, remote.ip_addr) {
                        warn!("failed to send FIN: {err}");
                        continue;
                    }

                    let (guard, timeout) = socket.cond.wait_timeout(conn, CLOSE_TIMEOUT).unwrap();
                    conn = guard;

                    if timeout.timed_out() {
                        debug!("timeout waiting for FIN+ACK");
                    } else {
                        fin_ack_received = true;
                    }
                }

                if !fin_ack_received {
                    warn!("no FIN+ACK after {MAX_ATTEMPTS} attempts, closing anyway");
                }

                let ack = Pdu::control(false, true, false, 0, 0, conn.local_port(), remote.port);
                let _ = endpoint.send(&ack, remote.ip_addr);
            }
        }

        conn.state = State::Closed;
        conn.rx.close();
        let listener = conn.listener.take();
        drop(conn);

        // One broadcast to unblock any stray waiter, then reap the
        // dispatcher: it observes Closed at its next poll tick.
        socket.cond.notify_all();
        if let Some(listener) = listener {
            let _ = listener.join();
        }

        self.table.release(fd);
        debug!("socket {fd} closed");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn loopback(port: u16) -> SockAddr {
        SockAddr::new("127.0.0.1:0".parse().unwrap(), port)
    }

    fn listening_server(mictcp_port: u16) -> (Stack, i32, SockAddr) {
        let stack = Stack::new();
        let fd = stack.socket(Mode::Server).unwrap();
        stack.bind(fd, loopback(mictcp_port)).unwrap();
        stack.set_loss_rate(fd, 0).unwrap();
        let addr = stack.local_addr(fd).unwrap();
        (stack, fd, addr)
    }

    fn connected_client(server_addr: SockAddr, loss_rate: u32) -> Result<(Stack, i32), Error> {
        let stack = Stack::new();
        let fd = stack.socket(Mode::Client).unwrap();
        stack.bind(fd, loopback(0)).unwrap();
        stack.set_loss_rate(fd, loss_rate).unwrap();
        stack.connect(fd, server_addr)?;
        Ok((stack, fd))
    }

    #[test]
    fn operations_on_unknown_descriptors_fail() {
        let stack = Stack::new();

        assert!(matches!(
            stack.send(42, b"data"),
            Err(Error::InvalidSocket(42))
        ));
        assert!(matches!(stack.close(-1), Err(Error::InvalidSocket(-1))));
    }

    #[test]
    fn send_requires_an_established_connection() {
        let stack = Stack::new();
        let fd = stack.socket(Mode::Client).unwrap();

        assert!(matches!(
            stack.send(fd, b"data"),
            Err(Error::WrongState(State::Closed))
        ));
    }

    #[test]
    fn loss_free_transfer_delivers_everything_in_order() {
        let (server, sfd, server_addr) = listening_server(9090);

        let receiver = {
            let server = server.clone();

            thread::spawn(move || {
                let remote = server.accept(sfd).unwrap();

                let mut messages = Vec::new();
                loop {
                    let mut buf = [0u8; 1500];
                    let n = server.recv(sfd, &mut buf).unwrap();
                    if n == 0 {
                        break;
                    }
                    messages.push(buf[..n].to_vec());
                }

                server.close(sfd).unwrap();
                (remote, messages)
            })
        };

        let (client, cfd) = connected_client(server_addr, 0).unwrap();
        let client_addr = client.local_addr(cfd).unwrap();

        let sent: Vec<Vec<u8>> = (0..5).map(|i| format!("ping-{i}").into_bytes()).collect();
        for msg in &sent {
            assert_eq!(client.send(cfd, msg).unwrap(), msg.len());
        }

        client.close(cfd).unwrap();

        let (remote, messages) = receiver.join().unwrap();
        assert_eq!(remote.ip_addr, client_addr.ip_addr);
        assert_eq!(messages, sent);
    }

    #[test]
    fn lossy_channel_still_reports_every_send_as_delivered() {
        let (server, sfd, server_addr) = listening_server(9191);

        let receiver = {
            let server = server.clone();

            thread::spawn(move || {
                server.accept(sfd).unwrap();

                let mut messages = Vec::new();
                loop {
                    let mut buf = [0u8; 1500];
                    let n = server.recv(sfd, &mut buf).unwrap();
                    if n == 0 {
                        break;
                    }
                    messages.push(String::from_utf8(buf[..n].to_vec()).unwrap());
                }

                server.close(sfd).unwrap();
                messages
            })
        };

        let (client, cfd) = connected_client(server_addr, 5).unwrap();

        let sent: Vec<String> = (0..20).map(|i| format!("msg-{i:02}")).collect();
        for msg in &sent {
            // A lost packet within tolerance is still reported delivered.
            assert_eq!(client.send(cfd, msg.as_bytes()).unwrap(), msg.len());
        }

        // Drop the loss for the close handshake so both sides terminate.
        client.set_loss_rate(cfd, 0).unwrap();
        client.close(cfd).unwrap();

        let messages = receiver.join().unwrap();
        assert!(!messages.is_empty());
        assert!(messages.len() <= sent.len());

        // Stop-and-wait plus duplicate suppression: what arrives is an
        // in-order subsequence of what was sent.
        let mut cursor = sent.iter();
        for msg in &messages {
            assert!(
                cursor.any(|s| s == msg),
                "{msg} delivered out of order or twice"
            );
        }
    }

    #[test]
    fn too_unreliable_channel_is_refused() {
        let (server, sfd, server_addr) = listening_server(9292);

        // The handshake completes before the probe gives up, so accept
        // itself succeeds; the thread is deliberately left behind.
        thread::spawn(move || {
            let _ = server.accept(sfd);
        });

        let err = connected_client(server_addr, 35).unwrap_err();
        assert!(matches!(err, Error::PeerTooUnreliable(p) if p > 20.0));
    }

    #[test]
    fn connect_gives_up_when_nobody_answers() {
        let stack = Stack::new();
        let fd = stack.socket(Mode::Client).unwrap();
        stack.bind(fd, loopback(0)).unwrap();
        stack.set_loss_rate(fd, 0).unwrap();

        let started = std::time::Instant::now();
        let dead = SockAddr::new("127.0.0.1:1".parse().unwrap(), 1);

        assert!(matches!(
            stack.connect(fd, dead),
            Err(Error::HandshakeTimeout(_))
        ));
        assert!(started.elapsed() >= TIMEOUT);
    }

    #[test]
    fn wire_level_handshake_duplicate_suppression_and_close() {
        let (server, sfd, server_addr) = listening_server(9393);

        let acceptor = {
            let server = server.clone();
            thread::spawn(move || server.accept(sfd).unwrap())
        };

        let peer = Endpoint::open("127.0.0.1:0".parse().unwrap()).unwrap();
        let peer_port = 7777;

        // SYN -> SYN+ACK -> ACK, observable on the wire in that order.
        let syn = Pdu::control(true, false, false, 0, 0, peer_port, server_addr.port);
        peer.send(&syn, server_addr.ip_addr).unwrap();

        let (syn_ack, _) = peer.recv(2000).unwrap().expect("no SYN+ACK");
        assert!(syn_ack.matches(true, true, false, 0, 0));

        let ack = Pdu::control(false, true, false, 0, 0, peer_port, server_addr.port);
        peer.send(&ack, server_addr.ip_addr).unwrap();

        let remote = acceptor.join().unwrap();
        assert_eq!(remote.port, peer_port);

        // The first copy of seq 1 is delivered, the duplicate only re-ACKed.
        let data = Pdu::data(1, peer_port, server_addr.port, b"hello".to_vec());
        peer.send(&data, server_addr.ip_addr).unwrap();
        let (ack1, _) = peer.recv(2000).unwrap().expect("no data ACK");
        assert!(ack1.matches(false, true, false, 0, 2));

        peer.send(&data, server_addr.ip_addr).unwrap();
        let (ack2, _) = peer.recv(2000).unwrap().expect("no duplicate ACK");
        assert!(ack2.matches(false, true, false, 0, 2));

        let mut buf = [0u8; 1500];
        let n = server.recv(sfd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");

        // FIN -> FIN+ACK -> ACK; the drained queue then reports EOF.
        let fin = Pdu::control(false, false, true, 0, 0, peer_port, server_addr.port);
        peer.send(&fin, server_addr.ip_addr).unwrap();
        let (fin_ack, _) = peer.recv(2000).unwrap().expect("no FIN+ACK");
        assert!(fin_ack.matches(false, true, true, 0, 0));

        peer.send(&ack, server_addr.ip_addr).unwrap();

        assert_eq!(server.recv(sfd, &mut buf).unwrap(), 0);
        server.close(sfd).unwrap();
    }

    #[test]
    fn probe_sentinel_is_acked_but_never_delivered() {
        let (server, sfd, server_addr) = listening_server(9494);

        let acceptor = {
            let server = server.clone();
            thread::spawn(move || server.accept(sfd).unwrap())
        };

        let peer = Endpoint::open("127.0.0.1:0".parse().unwrap()).unwrap();
        let peer_port = 7878;

        let syn = Pdu::control(true, false, false, 0, 0, peer_port, server_addr.port);
        peer.send(&syn, server_addr.ip_addr).unwrap();
        peer.recv(2000).unwrap().expect("no SYN+ACK");
        let ack = Pdu::control(false, true, false, 0, 0, peer_port, server_addr.port);
        peer.send(&ack, server_addr.ip_addr).unwrap();
        acceptor.join().unwrap();

        // A data PDU carrying the sentinel payload is answered with a bare
        // ACK and does not consume a sequence number.
        let fake_probe = Pdu::data(1, peer_port, server_addr.port, PROBE_PAYLOAD.to_vec());
        peer.send(&fake_probe, server_addr.ip_addr).unwrap();
        let (probe_ack, _) = peer.recv(2000).unwrap().expect("no probe ACK");
        assert!(probe_ack.matches(false, true, false, 0, 0));
        assert_eq!(probe_ack.header.ack_num, 0);

        // Sequence 1 is still available for real data.
        let data = Pdu::data(1, peer_port, server_addr.port, b"real".to_vec());
        peer.send(&data, server_addr.ip_addr).unwrap();
        let (data_ack, _) = peer.recv(2000).unwrap().expect("no data ACK");
        assert!(data_ack.matches(false, true, false, 0, 2));

        let mut buf = [0u8; 1500];
        let n = server.recv(sfd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"real");

        let fin = Pdu::control(false, false, true, 0, 0, peer_port, server_addr.port);
        peer.send(&fin, server_addr.ip_addr).unwrap();
        peer.recv(2000).unwrap().expect("no FIN+ACK");
        peer.send(&ack, server_addr.ip_addr).unwrap();

        assert_eq!(server.recv(sfd, &mut buf).unwrap(), 0);
        server.close(sfd).unwrap();
    }
}
