use std::net::SocketAddr;

mod dispatch;
mod pdu;
mod table;
mod window;

pub use dispatch::*;
pub use pdu::*;
pub use table::*;
pub use window::*;

/*
                     server                          client

                  +---------+                     +---------+
      bind        |  IDLE   |                     |  IDLE   |
      ----------->+---------+                     +---------+
                       | accept                        | connect
                       V                               | snd SYN
                  +-----------+                        V
                  | ACCEPTING |                   +----------+
                  +-----------+      ------------ | SYN_SENT | <--+
                       | rcv SYN    /   rcv       +----------+    | timeout
                       V           /  SYN+ACK          |          | snd SYN
                 +--------------+ /   snd ACK          +----------+
    timeout      | SYN_RECEIVED |<
    snd SYN+ACK  +--------------+ \               +-----------------------+
                       | rcv ACK   \------------> | MEASURING_RELIABILITY |
                       V                          +-----------------------+
                 +-------------+                       | loss <= 20%
                 | ESTABLISHED |<----------------------+   (else close)
                 +-------------+
                   |         | local close
          rcv FIN  |         | snd FIN
      snd FIN+ACK  |         V
                   |    +---------+  rcv FIN+ACK
                   |    | CLOSING |  snd ACK
                   V    +---------+------------------+
         +------------------+                        |
         | AWAITING_CLOSING |  rcv ACK               V
         +------------------+----------------> +---------+
                   | rcv FIN (dup)             | CLOSED  |
                   | snd FIN+ACK               +---------+
                   +--^
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Closed,
    SynSent,
    Accepting,
    SynReceived,
    Established,
    MeasuringReliability,
    AwaitingClosing,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Client,
    Server,
}

/// A protocol-level address: the underlying datagram endpoint (opaque to
/// the protocol, compared bytewise) plus the MIC-TCP port carried in PDU
/// headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockAddr {
    pub ip_addr: SocketAddr,
    pub port: u16,
}

impl SockAddr {
    pub fn new(ip_addr: SocketAddr, port: u16) -> Self {
        SockAddr { ip_addr, port }
    }
}
