use std::time::Duration;

/// Socket table capacity.
pub const MAX_SOCKETS: usize = 20;

/// Retry cap for the close handshake and, unlike the historical behaviour,
/// also for the SYN and SYN+ACK retransmit loops.
pub const MAX_ATTEMPTS: u32 = 10;

/// Wait bound for an ACK or a handshake step.
pub const TIMEOUT: Duration = Duration::from_millis(1000);

/// Wait bound for the final ACK of the close handshake.
pub const CLOSE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Simulated loss percentage configured on every fresh endpoint.
pub const LOSS_RATE: u32 = 2;

/// Number of probe PDUs sent after the handshake to estimate channel loss.
pub const PROBE_PACKET_COUNT: u32 = 100;

/// Per-probe pacing wait. Much shorter than TIMEOUT: a probe ACK either
/// arrives within a channel round trip or is counted as lost.
pub const PROBE_ACK_TIMEOUT: Duration = Duration::from_millis(100);

/// Sentinel payload of probe PDUs. Wire-visible: the responder matches
/// these exact bytes to tell probes from application data.
pub const PROBE_PAYLOAD: &[u8] = b"mesure";

/// Width of the loss-accounting window, in packets.
pub const WINDOW_SIZE: u32 = 10;
