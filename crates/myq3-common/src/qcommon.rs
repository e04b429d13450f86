// qcommon.rs — definitions common between client and server
//
// Copyright (C) 1999-2005 Id Software, Inc.
// Licensed under the GNU General Public License v2.

use std::collections::VecDeque;

// ============================================================
// SizeBuf — fixed capacity message buffer
// ============================================================

#[derive(Debug, Clone, Default)]
pub struct SizeBuf {
    /// if false, do a fatal error on overflow
    pub allow_overflow: bool,
    /// set to true if the buffer size failed
    pub overflowed: bool,
    pub data: Vec<u8>,
    pub maxsize: i32,
    pub cursize: i32,
    pub readcount: i32,
}

impl SizeBuf {
    pub fn new(maxsize: i32) -> Self {
        Self {
            allow_overflow: false,
            overflowed: false,
            data: vec![0u8; maxsize as usize],
            maxsize,
            cursize: 0,
            readcount: 0,
        }
    }

    /// Wraps received bytes for reading.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = Self::new(bytes.len() as i32);
        buf.data.copy_from_slice(bytes);
        buf.cursize = bytes.len() as i32;
        buf
    }

    pub fn clear(&mut self) {
        self.cursize = 0;
        self.overflowed = false;
    }

    /// The bytes written so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.cursize as usize]
    }
}

// ============================================================
// Protocol
// ============================================================

pub const PROTOCOL_VERSION: i32 = 68;

/// Max size of a network packet.
pub const MAX_MSGLEN: usize = 16384;

/// Number of old messages that must be kept on client and server for
/// delta compression and ping estimation.
pub const PACKET_BACKUP: i32 = 32;
pub const PACKET_MASK: i32 = PACKET_BACKUP - 1;

/// Max string commands buffered for retransmit.
pub const MAX_RELIABLE_COMMANDS: i32 = 64;

// ============================================================
// Server-to-client ops
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SvcOps {
    Bad = 0,
    Nop = 1,
    Gamestate = 2,
    /// [short] [string] only in gamestate messages
    ConfigString = 3,
    /// only in gamestate messages
    Baseline = 4,
    /// [string] to be executed by client game module
    ServerCommand = 5,
    /// [short] size [size bytes]
    Download = 6,
    Snapshot = 7,
    Eof = 8,
}

impl SvcOps {
    pub fn from_byte(b: i32) -> Option<Self> {
        Some(match b {
            0 => Self::Bad,
            1 => Self::Nop,
            2 => Self::Gamestate,
            3 => Self::ConfigString,
            4 => Self::Baseline,
            5 => Self::ServerCommand,
            6 => Self::Download,
            7 => Self::Snapshot,
            8 => Self::Eof,
            _ => return None,
        })
    }
}

// ============================================================
// Client-to-server ops
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ClcOps {
    Bad = 0,
    Nop = 1,
    /// the frames acknowledged may be used as a delta reference
    Move = 2,
    /// the client is requesting a full snapshot
    MoveNoDelta = 3,
    /// [long sequence] [string] message
    ClientCommand = 4,
    Eof = 5,
}

impl ClcOps {
    pub fn from_byte(b: i32) -> Option<Self> {
        Some(match b {
            0 => Self::Bad,
            1 => Self::Nop,
            2 => Self::Move,
            3 => Self::MoveNoDelta,
            4 => Self::ClientCommand,
            5 => Self::Eof,
            _ => return None,
        })
    }
}

// ============================================================
// Network addresses
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum NetAdrType {
    Bot = 0,
    Loopback,
    Broadcast,
    Ip,
    Ip6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetAdr {
    pub adr_type: NetAdrType,
    /// IPv4 address (4 bytes)
    pub ip: [u8; 4],
    /// IPv6 address (16 bytes)
    pub ip6: [u8; 16],
    pub port: u16,
}

impl Default for NetAdr {
    fn default() -> Self {
        Self {
            adr_type: NetAdrType::Loopback,
            ip: [0; 4],
            ip6: [0; 16],
            port: 0,
        }
    }
}

impl NetAdr {
    pub fn ipv4(ip: [u8; 4], port: u16) -> Self {
        Self {
            adr_type: NetAdrType::Ip,
            ip,
            port,
            ..Self::default()
        }
    }
}

// ============================================================
// NetChan — sequencing for one connection
//
// Fragmentation and the datagram socket live below this layer; the
// channel only numbers outgoing messages and queues them for the
// transport to drain.
// ============================================================

#[derive(Debug, Clone, Default)]
pub struct NetChan {
    pub remote_address: NetAdr,

    pub incoming_sequence: i32,
    pub outgoing_sequence: i32,

    /// Messages handed to the transport, oldest first.
    pub outbox: VecDeque<(i32, Vec<u8>)>,
    pub last_sent: i32,
}

impl NetChan {
    pub fn new(remote_address: NetAdr) -> Self {
        Self {
            remote_address,
            outgoing_sequence: 1,
            ..Self::default()
        }
    }

    /// Queues `data` under the current outgoing sequence and advances it.
    pub fn transmit(&mut self, data: &[u8], curtime: i32) {
        self.outbox.push_back((self.outgoing_sequence, data.to_vec()));
        self.outgoing_sequence += 1;
        self.last_sent = curtime;
    }

    /// Drains everything queued for the transport.
    pub fn take_outgoing(&mut self) -> Vec<(i32, Vec<u8>)> {
        self.outbox.drain(..).collect()
    }
}
