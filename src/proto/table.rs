use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::buffer::AppBuffer;
use crate::config::MAX_SOCKETS;
use crate::err::Error;
use crate::phy::Endpoint;
use crate::proto::{LossWindow, Mode, SockAddr, State};

/// Per-connection state, guarded by the owning `Socket`'s lock.
#[derive(Debug)]
pub struct Conn {
    pub fd: i32,
    pub mode: Mode,
    pub state: State,
    pub endpoint: Option<Arc<Endpoint>>,
    pub local_addr: Option<SockAddr>,
    pub remote_addr: Option<SockAddr>,
    pub current_seq_num: u32,
    pub received_packets: u32,
    pub window: LossWindow,
    pub rx: Arc<AppBuffer>,
    pub listener: Option<JoinHandle<()>>,
}

impl Conn {
    pub fn local_port(&self) -> u16 {
        self.local_addr.map(|addr| addr.port).unwrap_or(0)
    }
}

/// A connection record with its lock and condition variable. Every blocking
/// facade operation waits on `cond`; the dispatcher signals it.
#[derive(Debug)]
pub struct Socket {
    pub fd: i32,
    sys_fd: AtomicI32,
    pub conn: Mutex<Conn>,
    pub cond: Condvar,
}

impl Socket {
    /// Records the raw descriptor of the attached endpoint so the table can
    /// find this socket from the dispatcher side.
    pub fn attach_endpoint(&self, conn: &mut Conn, endpoint: Arc<Endpoint>) {
        use std::os::fd::AsRawFd;

        self.sys_fd.store(endpoint.as_raw_fd(), Ordering::Release);
        conn.endpoint = Some(endpoint);
    }
}

/// Bounded table of connection slots. The public descriptor is the slot
/// index; slots freed by `release` are reused by the next `allocate`.
#[derive(Debug)]
pub struct SocketTable {
    slots: Mutex<Vec<Option<Arc<Socket>>>>,
}

impl Default for SocketTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketTable {
    pub fn new() -> Self {
        SocketTable {
            slots: Mutex::new((0..MAX_SOCKETS).map(|_| None).collect()),
        }
    }

    pub fn allocate(&self, mode: Mode) -> Result<Arc<Socket>, Error> {
        let mut slots = self.slots.lock().unwrap();

        let free = slots
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(Error::TableFull)?;

        let fd = free as i32;
        let socket = Arc::new(Socket {
            fd,
            sys_fd: AtomicI32::new(-1),
            conn: Mutex::new(Conn {
                fd,
                mode,
                state: State::Closed,
                endpoint: None,
                local_addr: None,
                remote_addr: None,
                current_seq_num: 0,
                received_packets: 0,
                window: LossWindow::new(),
                rx: Arc::new(AppBuffer::new()),
                listener: None,
            }),
            cond: Condvar::new(),
        });

        slots[free] = Some(socket.clone());

        Ok(socket)
    }

    pub fn by_fd(&self, fd: i32) -> Option<Arc<Socket>> {
        if fd < 0 {
            return None;
        }

        let slots = self.slots.lock().unwrap();
        slots.get(fd as usize)?.clone()
    }

    pub fn by_sys_fd(&self, sys_fd: i32) -> Option<Arc<Socket>> {
        let slots = self.slots.lock().unwrap();

        slots
            .iter()
            .flatten()
            .find(|socket| socket.sys_fd.load(Ordering::Acquire) == sys_fd)
            .cloned()
    }

    pub fn release(&self, fd: i32) {
        if fd < 0 {
            return;
        }

        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(fd as usize) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_ascending_descriptors() {
        let table = SocketTable::new();

        assert_eq!(table.allocate(Mode::Client).unwrap().fd, 0);
        assert_eq!(table.allocate(Mode::Server).unwrap().fd, 1);
    }

    #[test]
    fn fresh_record_starts_closed_at_seq_zero() {
        let table = SocketTable::new();
        let socket = table.allocate(Mode::Client).unwrap();
        let conn = socket.conn.lock().unwrap();

        assert_eq!(conn.state, State::Closed);
        assert_eq!(conn.current_seq_num, 0);
        assert!(conn.endpoint.is_none());
    }

    #[test]
    fn lookup_by_public_fd() {
        let table = SocketTable::new();
        let socket = table.allocate(Mode::Server).unwrap();

        assert!(Arc::ptr_eq(&table.by_fd(socket.fd).unwrap(), &socket));
        assert!(table.by_fd(19).is_none());
        assert!(table.by_fd(-1).is_none());
        assert!(table.by_fd(MAX_SOCKETS as i32).is_none());
    }

    #[test]
    fn lookup_by_system_fd() {
        let table = SocketTable::new();
        let socket = table.allocate(Mode::Client).unwrap();
        let endpoint = Arc::new(Endpoint::open("127.0.0.1:0".parse().unwrap()).unwrap());

        let sys_fd = {
            use std::os::fd::AsRawFd;
            let mut conn = socket.conn.lock().unwrap();
            socket.attach_endpoint(&mut conn, endpoint.clone());
            endpoint.as_raw_fd()
        };

        assert!(Arc::ptr_eq(&table.by_sys_fd(sys_fd).unwrap(), &socket));
        assert!(table.by_sys_fd(-2).is_none());
    }

    #[test]
    fn overflow_fails_and_release_reuses_the_slot() {
        let table = SocketTable::new();

        let sockets: Vec<_> = (0..MAX_SOCKETS)
            .map(|_| table.allocate(Mode::Client).unwrap())
            .collect();

        assert!(matches!(table.allocate(Mode::Client), Err(Error::TableFull)));

        table.release(sockets[7].fd);
        assert_eq!(table.allocate(Mode::Client).unwrap().fd, 7);
    }
}
