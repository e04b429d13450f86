// common.rs — message primitives used by client and server
//
// Copyright (C) 1999-2005 Id Software, Inc.
// Licensed under the GNU General Public License v2.

use crate::qcommon::SizeBuf;

// ============================================================
// SizeBuf operations
// ============================================================

impl SizeBuf {
    /// Reserve `length` bytes and return the start offset.
    ///
    /// An overflowing buffer with `allow_overflow` set is cleared and
    /// flagged; later writes keep going into the cleared space so the
    /// caller can discard the whole message once it is done.
    pub fn get_space(&mut self, length: usize) -> usize {
        let cursize = self.cursize as usize;
        let maxsize = self.maxsize as usize;

        if cursize + length > maxsize {
            if !self.allow_overflow {
                panic!("SZ_GetSpace: overflow without allowoverflow set");
            }
            if length > maxsize {
                panic!("SZ_GetSpace: {} is > full buffer size", length);
            }
            log::debug!("SZ_GetSpace: overflow");
            self.clear();
            self.overflowed = true;
        }

        let start = self.cursize as usize;
        self.cursize += length as i32;
        start
    }

    /// Write raw bytes into the buffer.
    pub fn write(&mut self, src: &[u8]) {
        let start = self.get_space(src.len());
        self.data[start..start + src.len()].copy_from_slice(src);
    }
}

// ============================================================
// MSG write functions
// ============================================================

pub fn msg_write_char(sb: &mut SizeBuf, c: i32) {
    let start = sb.get_space(1);
    sb.data[start] = c as i8 as u8;
}

pub fn msg_write_byte(sb: &mut SizeBuf, c: i32) {
    let start = sb.get_space(1);
    sb.data[start] = c as u8;
}

pub fn msg_write_short(sb: &mut SizeBuf, c: i32) {
    let start = sb.get_space(2);
    sb.data[start..start + 2].copy_from_slice(&(c as i16).to_le_bytes());
}

pub fn msg_write_long(sb: &mut SizeBuf, c: i32) {
    let start = sb.get_space(4);
    sb.data[start..start + 4].copy_from_slice(&c.to_le_bytes());
}

pub fn msg_write_float(sb: &mut SizeBuf, f: f32) {
    let start = sb.get_space(4);
    sb.data[start..start + 4].copy_from_slice(&f.to_le_bytes());
}

pub fn msg_write_data(sb: &mut SizeBuf, data: &[u8]) {
    sb.write(data);
}

/// Null terminated; embedded nulls and '%' are not filtered.
pub fn msg_write_string(sb: &mut SizeBuf, s: &str) {
    sb.write(s.as_bytes());
    sb.write(&[0]);
}

// ============================================================
// MSG read functions
//
// Reads past the end of the message return -1 (or an empty string) and
// leave readcount past cursize, which callers check once per block.
// ============================================================

pub fn msg_begin_reading(msg: &mut SizeBuf) {
    msg.readcount = 0;
}

/// True once any read went past the end of the message.
pub fn msg_read_overrun(msg: &SizeBuf) -> bool {
    msg.readcount > msg.cursize
}

fn msg_read_bytes<const N: usize>(msg: &mut SizeBuf) -> Option<[u8; N]> {
    let start = msg.readcount as usize;
    msg.readcount += N as i32;
    if msg.readcount > msg.cursize {
        return None;
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&msg.data[start..start + N]);
    Some(out)
}

pub fn msg_read_char(msg: &mut SizeBuf) -> i32 {
    match msg_read_bytes::<1>(msg) {
        Some(b) => b[0] as i8 as i32,
        None => -1,
    }
}

pub fn msg_read_byte(msg: &mut SizeBuf) -> i32 {
    match msg_read_bytes::<1>(msg) {
        Some(b) => b[0] as i32,
        None => -1,
    }
}

pub fn msg_read_short(msg: &mut SizeBuf) -> i32 {
    match msg_read_bytes::<2>(msg) {
        Some(b) => i16::from_le_bytes(b) as i32,
        None => -1,
    }
}

pub fn msg_read_long(msg: &mut SizeBuf) -> i32 {
    match msg_read_bytes::<4>(msg) {
        Some(b) => i32::from_le_bytes(b),
        None => -1,
    }
}

pub fn msg_read_float(msg: &mut SizeBuf) -> f32 {
    match msg_read_bytes::<4>(msg) {
        Some(b) => f32::from_le_bytes(b),
        None => -1.0,
    }
}

pub fn msg_read_string(msg: &mut SizeBuf) -> String {
    let mut bytes = Vec::new();
    loop {
        let c = msg_read_byte(msg);
        if c == -1 || c == 0 {
            break;
        }
        bytes.push(c as u8);
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

pub fn msg_read_data(msg: &mut SizeBuf, len: usize) -> Vec<u8> {
    let start = msg.readcount as usize;
    msg.readcount += len as i32;
    if msg.readcount > msg.cursize {
        return Vec::new();
    }
    msg.data[start..start + len].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_primitives() {
        let mut msg = SizeBuf::new(64);
        msg_write_byte(&mut msg, 200);
        msg_write_char(&mut msg, -5);
        msg_write_short(&mut msg, -1234);
        msg_write_long(&mut msg, 0x1234_5678);
        msg_write_float(&mut msg, 1.5);
        msg_write_string(&mut msg, "cs 3 \"x\"");
        assert_eq!(msg.cursize, 1 + 1 + 2 + 4 + 4 + 9);

        msg_begin_reading(&mut msg);
        assert_eq!(msg_read_byte(&mut msg), 200);
        assert_eq!(msg_read_char(&mut msg), -5);
        assert_eq!(msg_read_short(&mut msg), -1234);
        assert_eq!(msg_read_long(&mut msg), 0x1234_5678);
        assert_eq!(msg_read_float(&mut msg), 1.5);
        assert_eq!(msg_read_string(&mut msg), "cs 3 \"x\"");
        assert!(!msg_read_overrun(&msg));
    }

    #[test]
    fn read_past_end_returns_minus_one() {
        let mut msg = SizeBuf::new(8);
        msg_write_byte(&mut msg, 1);
        msg_begin_reading(&mut msg);
        assert_eq!(msg_read_byte(&mut msg), 1);
        assert_eq!(msg_read_long(&mut msg), -1);
        assert!(msg_read_overrun(&msg));
    }

    #[test]
    fn overflow_clears_and_flags_when_allowed() {
        let mut msg = SizeBuf::new(4);
        msg.allow_overflow = true;
        msg_write_long(&mut msg, 7);
        assert!(!msg.overflowed);
        msg_write_byte(&mut msg, 1);
        assert!(msg.overflowed);
        assert_eq!(msg.cursize, 1);
    }

    #[test]
    #[should_panic(expected = "overflow without allowoverflow")]
    fn overflow_without_allow_is_fatal() {
        let mut msg = SizeBuf::new(2);
        msg_write_long(&mut msg, 7);
    }
}
