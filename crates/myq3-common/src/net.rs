// net.rs — address utility functions (pure logic, no sockets)
//
// Copyright (C) 1999-2005 Id Software, Inc.
// Licensed under the GNU General Public License v2.

use crate::qcommon::{NetAdr, NetAdrType};

/// Convert a NetAdr to a human-readable string.
pub fn net_adr_to_string(a: &NetAdr) -> String {
    match a.adr_type {
        NetAdrType::Bot => "bot".to_string(),
        NetAdrType::Loopback => "loopback".to_string(),
        NetAdrType::Ip | NetAdrType::Broadcast => format!(
            "{}.{}.{}.{}:{}",
            a.ip[0], a.ip[1], a.ip[2], a.ip[3], a.port
        ),
        NetAdrType::Ip6 => {
            let groups: Vec<String> = (0..8)
                .map(|i| format!("{:x}", u16::from_be_bytes([a.ip6[i * 2], a.ip6[i * 2 + 1]])))
                .collect();
            format!("[{}]:{}", groups.join(":"), a.port)
        }
    }
}

/// True for the in-process loopback channel.
pub fn net_is_loopback(adr: &NetAdr) -> bool {
    adr.adr_type == NetAdrType::Loopback
}

/// Sys_IsLANAddress: loopback, RFC 1918 private IPv4 ranges, IPv6
/// loopback, link-local and unique-local addresses count as LAN.
pub fn net_is_lan_address(a: &NetAdr) -> bool {
    match a.adr_type {
        NetAdrType::Loopback => true,
        NetAdrType::Bot => false,
        NetAdrType::Ip | NetAdrType::Broadcast => {
            a.ip[0] == 127
                || a.ip[0] == 10
                || (a.ip[0] == 192 && a.ip[1] == 168)
                || (a.ip[0] == 172 && (16..=31).contains(&a.ip[1]))
        }
        NetAdrType::Ip6 => {
            // ::1
            if a.ip6 == [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1] {
                return true;
            }
            // fe80::/10
            if a.ip6[0] == 0xfe && (a.ip6[1] & 0xc0) == 0x80 {
                return true;
            }
            // fc00::/7
            (a.ip6[0] & 0xfe) == 0xfc
        }
    }
}
