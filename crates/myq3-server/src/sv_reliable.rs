// sv_reliable.rs — reliable server command channel
//
// Copyright (C) 1999-2005 Id Software, Inc.
// Licensed under the GNU General Public License v2.
//
// Commands are numbered from 1 and resent in every message until the
// client acknowledges them. The window is MAX_RELIABLE_COMMANDS deep.

use myq3_common::common::{msg_write_byte, msg_write_long, msg_write_string};
use myq3_common::q_shared::{q_strncpyz, MAX_STRING_CHARS};
use myq3_common::qcommon::{SizeBuf, SvcOps, MAX_RELIABLE_COMMANDS};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReliableError {
    #[error("reliable command window full ({outstanding} unacknowledged)")]
    Overflow { outstanding: i32 },
}

pub fn write_server_command(msg: &mut SizeBuf, seq: i32, cmd: &str) {
    msg_write_byte(msg, SvcOps::ServerCommand as i32);
    msg_write_long(msg, seq);
    msg_write_string(msg, cmd);
}

#[derive(Debug, Clone)]
pub struct ReliableCommands {
    commands: Vec<String>,
    /// last added reliable message, not necesarily sent or acknowledged yet
    sequence: i32,
    /// last acknowledged reliable message
    acknowledge: i32,
    /// last reliable message written into a snapshot
    sent: i32,
}

impl Default for ReliableCommands {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliableCommands {
    pub fn new() -> Self {
        Self {
            commands: vec![String::new(); MAX_RELIABLE_COMMANDS as usize],
            sequence: 0,
            acknowledge: 0,
            sent: 0,
        }
    }

    pub fn sequence(&self) -> i32 {
        self.sequence
    }

    pub fn acknowledged(&self) -> i32 {
        self.acknowledge
    }

    pub fn sent(&self) -> i32 {
        self.sent
    }

    pub fn outstanding(&self) -> i32 {
        self.sequence - self.acknowledge
    }

    /// Queues a command and returns its sequence number.
    ///
    /// Fails without queuing when the client has fallen a whole window
    /// behind; the caller is expected to drop the client.
    pub fn add(&mut self, cmd: &str) -> Result<i32, ReliableError> {
        if self.sequence + 1 - self.acknowledge > MAX_RELIABLE_COMMANDS {
            return Err(ReliableError::Overflow {
                outstanding: self.outstanding(),
            });
        }
        self.sequence += 1;
        let index = (self.sequence & (MAX_RELIABLE_COMMANDS - 1)) as usize;
        self.commands[index] = q_strncpyz(cmd, MAX_STRING_CHARS);
        Ok(self.sequence)
    }

    /// The stored text of `seq`, if it is still inside the window.
    pub fn command(&self, seq: i32) -> Option<&str> {
        if seq <= self.sequence - MAX_RELIABLE_COMMANDS || seq <= 0 || seq > self.sequence {
            return None;
        }
        Some(&self.commands[(seq & (MAX_RELIABLE_COMMANDS - 1)) as usize])
    }

    /// Unacknowledged commands, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = (i32, &str)> + '_ {
        (self.acknowledge + 1..=self.sequence)
            .map(move |seq| (seq, self.commands[(seq & (MAX_RELIABLE_COMMANDS - 1)) as usize].as_str()))
    }

    pub fn mark_sent(&mut self) {
        self.sent = self.sequence;
    }

    /// Applies an acknowledgement from the client. Returns false when the
    /// value was out of range, in which case everything is treated as
    /// acknowledged.
    pub fn acknowledge(&mut self, ack: i32) -> bool {
        if ack < self.sequence - MAX_RELIABLE_COMMANDS || ack > self.sequence {
            // usually only hackers create messages like this
            // it is more annoying for them to let them hanging
            self.acknowledge = self.sequence;
            return false;
        }
        self.acknowledge = self.acknowledge.max(ack);
        true
    }

    pub fn clear(&mut self) {
        for cmd in self.commands.iter_mut() {
            cmd.clear();
        }
        self.sequence = 0;
        self.acknowledge = 0;
        self.sent = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use myq3_common::common::{msg_begin_reading, msg_read_byte, msg_read_long, msg_read_string};
    use myq3_common::qcommon::MAX_MSGLEN;

    use crate::server::Client;
    use crate::sv_snapshot::sv_update_server_commands_to_client;

    fn read_commands(msg: &mut SizeBuf) -> Vec<(i32, String)> {
        msg_begin_reading(msg);
        let mut out = Vec::new();
        while msg.readcount < msg.cursize {
            assert_eq!(msg_read_byte(msg), SvcOps::ServerCommand as i32);
            let seq = msg_read_long(msg);
            out.push((seq, msg_read_string(msg)));
        }
        out
    }

    fn channel_at(sequence: i32) -> ReliableCommands {
        let mut reliable = ReliableCommands::new();
        for n in 1..=sequence {
            reliable.add(&format!("cmd {}", n)).unwrap();
        }
        reliable
    }

    #[test]
    fn only_unacknowledged_commands_are_resent() {
        let mut reliable = channel_at(9);
        reliable.acknowledge(9);
        for n in 10..=13 {
            assert_eq!(reliable.add(&format!("cmd {}", n)), Ok(n));
        }
        reliable.acknowledge(11);
        let mut client = Client { reliable, ..Default::default() };

        let mut msg = SizeBuf::new(MAX_MSGLEN as i32);
        sv_update_server_commands_to_client(&mut client, &mut msg, None);
        assert_eq!(client.reliable.sent(), 13);
        assert_eq!(
            read_commands(&mut msg),
            vec![(12, "cmd 12".to_string()), (13, "cmd 13".to_string())]
        );
    }

    #[test]
    fn resending_writes_identical_bytes() {
        let mut client = Client { reliable: channel_at(3), ..Default::default() };
        let mut first = SizeBuf::new(MAX_MSGLEN as i32);
        let mut second = SizeBuf::new(MAX_MSGLEN as i32);
        sv_update_server_commands_to_client(&mut client, &mut first, None);
        sv_update_server_commands_to_client(&mut client, &mut second, None);
        assert_eq!(first.as_slice(), second.as_slice());
        assert_eq!(client.reliable.sent(), 3);
        assert_eq!(read_commands(&mut second).len(), 3);
    }

    #[test]
    fn window_overflow_is_an_error() {
        let mut reliable = channel_at(MAX_RELIABLE_COMMANDS);
        assert_eq!(
            reliable.add("one too many"),
            Err(ReliableError::Overflow { outstanding: MAX_RELIABLE_COMMANDS })
        );
        assert_eq!(reliable.sequence(), MAX_RELIABLE_COMMANDS);
    }

    #[test]
    fn acknowledge_never_moves_backwards() {
        let mut reliable = channel_at(10);
        assert!(reliable.acknowledge(8));
        assert!(reliable.acknowledge(5));
        assert_eq!(reliable.acknowledged(), 8);
    }

    #[test]
    fn bogus_acknowledge_clears_the_window() {
        let mut reliable = channel_at(10);
        assert!(!reliable.acknowledge(50));
        assert_eq!(reliable.acknowledged(), 10);
        assert_eq!(reliable.outstanding(), 0);
    }

    #[test]
    fn long_commands_are_truncated() {
        let mut reliable = ReliableCommands::new();
        let seq = reliable.add(&"x".repeat(MAX_STRING_CHARS + 10)).unwrap();
        assert_eq!(reliable.command(seq).map(str::len), Some(MAX_STRING_CHARS - 1));
        assert_eq!(reliable.command(seq + 1), None);
    }
}
