use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::config::PROBE_PAYLOAD;
use crate::err::Error;

pub const HEADER_LEN: usize = 13;

const FLAG_SYN: u8 = 1 << 0;
const FLAG_ACK: u8 = 1 << 1;
const FLAG_FIN: u8 = 1 << 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub source_port: u16,
    pub dest_port: u16,
    pub seq_num: u32,
    pub ack_num: u32,
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Pdu {
    /// Builds a payload-less control PDU.
    pub fn control(
        syn: bool,
        ack: bool,
        fin: bool,
        seq_num: u32,
        ack_num: u32,
        source_port: u16,
        dest_port: u16,
    ) -> Pdu {
        Pdu {
            header: Header {
                source_port,
                dest_port,
                seq_num,
                ack_num,
                syn,
                ack,
                fin,
            },
            payload: Vec::new(),
        }
    }

    /// Builds a data PDU, all flags clear.
    pub fn data(seq_num: u32, source_port: u16, dest_port: u16, payload: Vec<u8>) -> Pdu {
        Pdu {
            header: Header {
                source_port,
                dest_port,
                seq_num,
                ack_num: 0,
                syn: false,
                ack: false,
                fin: false,
            },
            payload,
        }
    }

    /// Predicate the state machine discriminates headers with. True iff the
    /// flag triple matches exactly and every non-zero expected number matches
    /// its header field; zero means don't-care. The ack number is only
    /// examined when the expected ACK flag is set.
    pub fn matches(&self, syn: bool, ack: bool, fin: bool, seq_num: u32, ack_num: u32) -> bool {
        let header = &self.header;

        if header.syn != syn {
            return false;
        }

        if header.ack != ack || (ack && ack_num != 0 && header.ack_num != ack_num) {
            return false;
        }

        if header.fin != fin {
            return false;
        }

        if seq_num != 0 && header.seq_num != seq_num {
            return false;
        }

        true
    }

    /// Probe PDUs carry this exact sentinel payload.
    pub fn is_probe(&self) -> bool {
        self.payload == PROBE_PAYLOAD
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());

        let mut flags = 0u8;
        if self.header.syn {
            flags |= FLAG_SYN;
        }
        if self.header.ack {
            flags |= FLAG_ACK;
        }
        if self.header.fin {
            flags |= FLAG_FIN;
        }

        // Writes to a Vec cannot fail.
        buf.write_u16::<BigEndian>(self.header.source_port).unwrap();
        buf.write_u16::<BigEndian>(self.header.dest_port).unwrap();
        buf.write_u32::<BigEndian>(self.header.seq_num).unwrap();
        buf.write_u32::<BigEndian>(self.header.ack_num).unwrap();
        buf.write_u8(flags).unwrap();
        buf.extend_from_slice(&self.payload);

        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Pdu, Error> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Malformed);
        }

        let mut cursor = Cursor::new(buf);
        let source_port = cursor.read_u16::<BigEndian>()?;
        let dest_port = cursor.read_u16::<BigEndian>()?;
        let seq_num = cursor.read_u32::<BigEndian>()?;
        let ack_num = cursor.read_u32::<BigEndian>()?;
        let flags = cursor.read_u8()?;

        if flags & !(FLAG_SYN | FLAG_ACK | FLAG_FIN) != 0 {
            return Err(Error::Malformed);
        }

        let payload = buf[HEADER_LEN..].to_vec();

        // A PDU with no flags and no payload carries nothing.
        if flags == 0 && payload.is_empty() {
            return Err(Error::Malformed);
        }

        Ok(Pdu {
            header: Header {
                source_port,
                dest_port,
                seq_num,
                ack_num,
                syn: flags & FLAG_SYN != 0,
                ack: flags & FLAG_ACK != 0,
                fin: flags & FLAG_FIN != 0,
            },
            payload,
        })
    }
}
