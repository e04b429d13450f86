// snapshot_parse.rs — client side parsing of server messages
//
// Copyright (C) 1999-2005 Id Software, Inc.
// Licensed under the GNU General Public License v2.

use crate::common::*;
use crate::msg_delta::*;
use crate::q_shared::*;
use crate::qcommon::*;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("read past end of server message")]
    Overrun,
    #[error("illegible server message {0}")]
    IllegibleServerMessage(i32),
    #[error("bad entity number {0}")]
    BadEntityNumber(i32),
    #[error("entity {0} out of order")]
    EntityOutOfOrder(i32),
    #[error("invalid field count {0}")]
    BadFieldCount(i32),
    #[error("bad float tag {0}")]
    BadFloatTag(i32),
    #[error("invalid size {0} for areamask")]
    BadAreaMask(i32),
}

/// One decoded snapshot as the client sees it.
#[derive(Debug, Clone, Default)]
pub struct ReceivedSnapshot {
    /// cleared if the delta parsing was invalid
    pub valid: bool,
    pub snap_flags: i32,
    pub server_time: i32,
    /// copied from the netchan->incoming_sequence
    pub message_num: i32,
    /// messageNum the delta is from, -1 for a full snapshot
    pub delta_num: i32,
    /// portalarea visibility bits
    pub areamask: Vec<u8>,
    pub ps: PlayerState,
    /// sorted by number
    pub entities: Vec<EntityState>,
}

/// Client-side mirror of the snapshot stream: keeps baselines and the
/// last PACKET_BACKUP frames so deltas can be resolved, and collects the
/// reliable commands the server sent.
pub struct SnapshotReceiver {
    pub server_id: i32,
    pub baselines: Vec<EntityState>,
    pub snapshots: Vec<Option<ReceivedSnapshot>>,
    /// most recent valid snapshot
    pub snap: Option<ReceivedSnapshot>,
    /// sequence number of the last message received from the server
    pub server_message_sequence: i32,
    /// highest reliable command received
    pub server_command_sequence: i32,
    /// commands in arrival order, without duplicates
    pub server_commands: Vec<(i32, String)>,
}

impl Default for SnapshotReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotReceiver {
    pub fn new() -> Self {
        Self {
            server_id: 0,
            baselines: (0..MAX_GENTITIES as i32).map(EntityState::with_number).collect(),
            snapshots: vec![None; PACKET_BACKUP as usize],
            snap: None,
            server_message_sequence: 0,
            server_command_sequence: 0,
            server_commands: Vec::new(),
        }
    }

    pub fn set_baseline(&mut self, es: EntityState) -> Result<(), ParseError> {
        if es.number < 0 || es.number >= MAX_GENTITIES as i32 {
            return Err(ParseError::BadEntityNumber(es.number));
        }
        self.baselines[es.number as usize] = es;
        Ok(())
    }

    // ============================================================
    // Server message
    // ============================================================

    /// Parses one whole message received as `message_num`.
    pub fn parse_server_message(&mut self, data: &[u8], message_num: i32) -> Result<(), ParseError> {
        let mut msg = SizeBuf::from_bytes(data);
        msg_begin_reading(&mut msg);
        self.server_message_sequence = message_num;

        while msg.readcount < msg.cursize {
            let cmd = msg_read_byte(&mut msg);
            match SvcOps::from_byte(cmd) {
                Some(SvcOps::Nop) => {}
                Some(SvcOps::Eof) => break,
                Some(SvcOps::ServerCommand) => self.parse_command_string(&mut msg)?,
                Some(SvcOps::Snapshot) => self.parse_snapshot(&mut msg, message_num)?,
                _ => return Err(ParseError::IllegibleServerMessage(cmd)),
            }
        }
        Ok(())
    }

    /// Commands are resent until acknowledged, so only the ones past the
    /// highest sequence seen are new.
    fn parse_command_string(&mut self, msg: &mut SizeBuf) -> Result<(), ParseError> {
        let seq = msg_read_long(msg);
        let s = msg_read_string(msg);
        if msg_read_overrun(msg) {
            return Err(ParseError::Overrun);
        }

        if seq <= self.server_command_sequence {
            return Ok(());
        }
        self.server_command_sequence = seq;
        self.server_commands.push((seq, s));
        Ok(())
    }

    // ============================================================
    // Snapshot
    // ============================================================

    fn parse_snapshot(&mut self, msg: &mut SizeBuf, message_num: i32) -> Result<(), ParseError> {
        let mut newsnap = ReceivedSnapshot {
            server_time: msg_read_long(msg),
            message_num,
            ..ReceivedSnapshot::default()
        };

        let delta_num = msg_read_byte(msg);
        newsnap.delta_num = if delta_num <= 0 { -1 } else { message_num - delta_num };
        newsnap.snap_flags = msg_read_byte(msg);

        // If the frame is delta compressed from data that we no longer
        // have available, we must suck up the rest of the frame, but not
        // use it, then ask for a non-compressed message.
        let old = if newsnap.delta_num <= 0 {
            newsnap.valid = true; // uncompressed frame
            None
        } else {
            match &self.snapshots[(newsnap.delta_num & PACKET_MASK) as usize] {
                Some(old) if !old.valid => {
                    log::debug!("Delta from invalid frame (not supposed to happen!).");
                    None
                }
                Some(old) if old.message_num != newsnap.delta_num => {
                    log::debug!("Delta frame too old.");
                    None
                }
                Some(old) => {
                    newsnap.valid = true;
                    Some(old.clone())
                }
                None => {
                    log::debug!("Delta from invalid frame (not supposed to happen!).");
                    None
                }
            }
        };

        let len = msg_read_byte(msg);
        if len < 0 || len as usize > MAX_MAP_AREA_BYTES {
            return Err(ParseError::BadAreaMask(len));
        }
        newsnap.areamask = msg_read_data(msg, len as usize);

        newsnap.ps = msg_read_delta_playerstate(msg, old.as_ref().map(|o| &o.ps))?;

        let old_entities = old.as_ref().map_or(&[][..], |o| o.entities.as_slice());
        newsnap.entities = self.parse_packet_entities(msg, old_entities)?;

        if !newsnap.valid {
            return Ok(());
        }

        self.snapshots[(message_num & PACKET_MASK) as usize] = Some(newsnap.clone());
        self.snap = Some(newsnap);
        Ok(())
    }

    /// Entities present in `old` that the message skips over carry forward
    /// unchanged; the rest are deltas from the old frame or the baseline.
    fn parse_packet_entities(
        &self,
        msg: &mut SizeBuf,
        old: &[EntityState],
    ) -> Result<Vec<EntityState>, ParseError> {
        let mut entities = Vec::with_capacity(old.len());
        let mut old_iter = old.iter().peekable();
        let mut last_num = -1;

        loop {
            let newnum = msg_read_entity_number(msg)?;
            if newnum == MAX_GENTITIES as i32 - 1 {
                break;
            }
            if newnum <= last_num {
                return Err(ParseError::EntityOutOfOrder(newnum));
            }
            last_num = newnum;

            while let Some(unchanged) = old_iter.next_if(|o| o.number < newnum) {
                entities.push(*unchanged);
            }

            let from = match old_iter.next_if(|o| o.number == newnum) {
                Some(o) => o,
                None => &self.baselines[newnum as usize],
            };
            if let Some(state) = msg_read_delta_entity(msg, from, newnum)? {
                entities.push(state);
            }
        }

        entities.extend(old_iter.copied());
        Ok(entities)
    }

    // ============================================================
    // Acknowledgement
    // ============================================================

    /// Builds the client's reply: the ack header, any reliable client
    /// commands, and a move op asking for a delta or a full snapshot.
    pub fn write_ack(&self, msg: &mut SizeBuf, client_commands: &[(i32, &str)]) {
        msg_write_long(msg, self.server_id);
        msg_write_long(msg, self.server_message_sequence);
        msg_write_long(msg, self.server_command_sequence);

        for (seq, cmd) in client_commands {
            msg_write_byte(msg, ClcOps::ClientCommand as i32);
            msg_write_long(msg, *seq);
            msg_write_string(msg, cmd);
        }

        let delta_ok = self
            .snap
            .as_ref()
            .is_some_and(|s| s.message_num == self.server_message_sequence);
        if delta_ok {
            msg_write_byte(msg, ClcOps::Move as i32);
        } else {
            msg_write_byte(msg, ClcOps::MoveNoDelta as i32);
        }
        msg_write_byte(msg, ClcOps::Eof as i32);
    }
}
