use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, trace, warn};

use crate::config::TIMEOUT;
use crate::err::Error;
use crate::phy::{timeout_ms, Endpoint};
use crate::proto::{Conn, Mode, Pdu, SockAddr, Socket, SocketTable, State};

/// Starts the background thread that drains the endpoint and drives the
/// state machine. The thread exits once its record reaches `Closed` or
/// leaves the table.
pub fn spawn_dispatcher(
    table: Arc<SocketTable>,
    endpoint: Arc<Endpoint>,
    mode: Mode,
) -> JoinHandle<()> {
    thread::spawn(move || dispatch_loop(table, endpoint, mode))
}

fn dispatch_loop(table: Arc<SocketTable>, endpoint: Arc<Endpoint>, mode: Mode) {
    let sys_fd = endpoint.as_raw_fd();
    debug!("dispatcher started for sys fd {sys_fd}");

    loop {
        let Some(socket) = table.by_sys_fd(sys_fd) else {
            break;
        };
        if socket.conn.lock().unwrap().state == State::Closed {
            break;
        }

        // Bounded poll so the Closed check above is revisited.
        match endpoint.recv(timeout_ms(TIMEOUT)) {
            Ok(None) => continue,
            Ok(Some((pdu, from))) => match mode {
                Mode::Server => process_server_pdu(&table, &endpoint, pdu, from),
                Mode::Client => process_client_pdu(&table, &endpoint, pdu, from),
            },
            Err(err) => trace!("dropping undecodable datagram: {err}"),
        }
    }

    debug!("dispatcher for sys fd {sys_fd} exiting");
}

/// Re-emits the handshake ACK and moves the record to `Established`. Used
/// when completing `connect` and again whenever a retransmitted SYN+ACK
/// shows the peer never saw the first ACK.
pub fn send_connection_ack(conn: &mut Conn) -> Result<(), Error> {
    let endpoint = conn.endpoint.clone().ok_or(Error::Transport)?;
    let remote = conn.remote_addr.ok_or(Error::Transport)?;

    let ack = Pdu::control(false, true, false, 0, 0, conn.local_port(), remote.port);
    endpoint.send(&ack, remote.ip_addr)?;

    conn.state = State::Established;
    conn.current_seq_num = 1;

    Ok(())
}

fn process_server_pdu(table: &SocketTable, endpoint: &Endpoint, pdu: Pdu, from: SocketAddr) {
    let sys_fd = endpoint.as_raw_fd();
    let Some(socket) = table.by_sys_fd(sys_fd) else {
        warn!("no socket for sys fd {sys_fd}, dropping PDU");
        return;
    };
    let mut conn = socket.conn.lock().unwrap();

    // A FIN interrupts whatever the connection was doing.
    if conn.state != State::AwaitingClosing && pdu.matches(false, false, true, 0, 0) {
        debug!("FIN received in state {:?}, replying FIN+ACK", conn.state);
        conn.state = State::AwaitingClosing;
        reply_fin_ack(endpoint, &pdu, from);
        return;
    }

    match conn.state {
        State::Accepting => {
            if pdu.matches(true, false, false, 0, 0) {
                debug!("SYN received from {from}");
                conn.remote_addr = Some(SockAddr::new(from, pdu.header.source_port));
                conn.state = State::SynReceived;
                socket.cond.notify_one();
            }
        }

        State::SynReceived => {
            if pdu.matches(false, true, false, 0, 0) {
                debug!("handshake ACK received, connection established");
                conn.state = State::Established;
                conn.current_seq_num = 1;
                socket.cond.notify_one();
            }
        }

        State::Established => {
            if pdu.matches(false, false, false, 0, 0) {
                if pdu.is_probe() {
                    let ack = Pdu::control(
                        false,
                        true,
                        false,
                        0,
                        0,
                        pdu.header.dest_port,
                        pdu.header.source_port,
                    );
                    send_reply(endpoint, &conn, ack, from);
                    return;
                }

                trace!(
                    "data PDU (seq {}, expected {})",
                    pdu.header.seq_num,
                    conn.current_seq_num
                );

                if pdu.header.seq_num == conn.current_seq_num {
                    conn.current_seq_num = conn.current_seq_num.wrapping_add(1);
                    conn.rx.put(pdu.payload);
                }

                // Accepted or duplicate, the peer learns the next expected
                // sequence number either way.
                let ack = Pdu::control(
                    false,
                    true,
                    false,
                    0,
                    conn.current_seq_num,
                    pdu.header.dest_port,
                    pdu.header.source_port,
                );
                send_reply(endpoint, &conn, ack, from);
            }
        }

        State::AwaitingClosing => handle_awaiting_closing(&socket, &mut conn, endpoint, &pdu, from),

        State::Closing => {
            if pdu.matches(false, true, true, 0, 0) {
                socket.cond.notify_one();
            }
        }

        _ => debug!("PDU ignored in state {:?}", conn.state),
    }
}

fn process_client_pdu(table: &SocketTable, endpoint: &Endpoint, pdu: Pdu, from: SocketAddr) {
    let sys_fd = endpoint.as_raw_fd();
    let Some(socket) = table.by_sys_fd(sys_fd) else {
        warn!("no socket for sys fd {sys_fd}, dropping PDU");
        return;
    };
    let mut conn = socket.conn.lock().unwrap();

    // A retransmitted SYN+ACK means the peer never received our handshake
    // ACK and is still in SYN_RECEIVED.
    if pdu.matches(true, true, false, 0, 0) {
        debug!("SYN+ACK after handshake, re-sending connection ACK");
        if let Err(err) = send_connection_ack(&mut conn) {
            warn!("failed to re-send connection ACK: {err}");
        }
        return;
    }

    match conn.state {
        State::MeasuringReliability => {
            if pdu.matches(false, true, false, 0, 0) {
                conn.received_packets += 1;
                socket.cond.notify_one();
            }
        }

        State::Established => {
            if pdu.matches(false, true, false, 0, 0) {
                trace!("data ACK (ack_num {})", pdu.header.ack_num);
                conn.current_seq_num = pdu.header.ack_num;
                socket.cond.notify_one();
            } else if pdu.matches(false, false, true, 0, 0) {
                debug!("FIN received, replying FIN+ACK");
                conn.state = State::AwaitingClosing;
                reply_fin_ack(endpoint, &pdu, from);
            }
        }

        State::AwaitingClosing => handle_awaiting_closing(&socket, &mut conn, endpoint, &pdu, from),

        State::Closing => {
            if pdu.matches(false, true, true, 0, 0) {
                socket.cond.notify_one();
            }
        }

        _ => debug!("PDU ignored in state {:?}", conn.state),
    }
}

fn handle_awaiting_closing(
    socket: &Socket,
    conn: &mut Conn,
    endpoint: &Endpoint,
    pdu: &Pdu,
    from: SocketAddr,
) {
    if pdu.matches(false, true, false, 0, 0) {
        debug!("final ACK received, connection closed");
        conn.state = State::Closed;
        conn.rx.close();
        socket.cond.notify_all();
    } else if pdu.matches(false, false, true, 0, 0) {
        debug!("duplicate FIN, replying FIN+ACK again");
        reply_fin_ack(endpoint, pdu, from);
    }
}

fn reply_fin_ack(endpoint: &Endpoint, pdu: &Pdu, from: SocketAddr) {
    let fin_ack = Pdu::control(
        false,
        true,
        true,
        0,
        0,
        pdu.header.dest_port,
        pdu.header.source_port,
    );
    if endpoint.send(&fin_ack, from).is_err() {
        warn!("failed to send FIN+ACK");
    }
}

fn send_reply(endpoint: &Endpoint, conn: &Conn, pdu: Pdu, from: SocketAddr) {
    let dest = conn.remote_addr.map(|addr| addr.ip_addr).unwrap_or(from);
    if endpoint.send(&pdu, dest).is_err() {
        warn!("failed to send {:?} reply", conn.state);
    }
}
