// sv_rate.rs — snapshot scheduling against client bandwidth
//
// Copyright (C) 1999-2005 Id Software, Inc.
// Licensed under the GNU General Public License v2.

use myq3_common::cvar::CvarContext;
use myq3_common::net::{net_is_lan_address, net_is_loopback};

use crate::server::{Client, ClientState, HEADER_RATE_BYTES};

/// Server-side rate policy, read from cvars once per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSettings {
    /// 0 for no ceiling
    pub max_rate: i32,
    /// 0 for no floor
    pub min_rate: i32,
    pub lan_force_rate: bool,
    pub fps: i32,
}

impl Default for RateSettings {
    fn default() -> Self {
        Self {
            max_rate: 0,
            min_rate: 0,
            lan_force_rate: true,
            fps: 20,
        }
    }
}

impl RateSettings {
    /// Reads sv_maxRate, sv_minRate, sv_lanForceRate and sv_fps. A rate
    /// limit set below 1000 is raised to 1000 in the cvar itself.
    pub fn from_cvars(cvars: &mut CvarContext) -> Self {
        let mut max_rate = cvars.variable_integer("sv_maxRate");
        if max_rate != 0 && max_rate < 1000 {
            cvars.set("sv_maxRate", "1000");
            max_rate = 1000;
        }
        let mut min_rate = cvars.variable_integer("sv_minRate");
        if min_rate != 0 && min_rate < 1000 {
            cvars.set("sv_minRate", "1000");
            min_rate = 1000;
        }
        Self {
            max_rate,
            min_rate,
            lan_force_rate: cvars.variable_integer("sv_lanForceRate") != 0,
            fps: cvars.variable_integer("sv_fps").max(1),
        }
    }

    /// `rate` clamped by the server limits.
    pub fn effective_rate(&self, rate: i32) -> i32 {
        let mut rate = rate;
        if self.max_rate != 0 {
            rate = rate.min(self.max_rate);
        }
        if self.min_rate != 0 {
            rate = rate.max(self.min_rate);
        }
        rate.max(1)
    }
}

/// Milliseconds the client's bandwidth needs to absorb a message of
/// `message_size` bytes.
pub fn sv_rate_msec(settings: &RateSettings, rate: i32, message_size: i32) -> i32 {
    // individual messages will never be larger than fragment size
    let message_size = message_size.min(1500);
    let rate = settings.effective_rate(rate);
    (message_size + HEADER_RATE_BYTES) * 1000 / rate
}

/// Sets the client's next snapshot time after sending `message_size`
/// bytes at server time `time`.
pub fn sv_schedule_next_snapshot(settings: &RateSettings, client: &mut Client, message_size: i32, time: i32) {
    let adr = &client.netchan.remote_address;

    // unlimited bandwidth on local and lan links
    if net_is_loopback(adr) || (settings.lan_force_rate && net_is_lan_address(adr)) {
        client.next_snapshot_time = time + 1000 / settings.fps;
        client.rate_delayed = false;
        return;
    }

    // normal rate / snapshotMsec calculation
    let rate_msec = sv_rate_msec(settings, client.rate, message_size);
    if rate_msec < client.snapshot_msec {
        // never send more packets than this, no matter what the rate is at
        client.next_snapshot_time = time + client.snapshot_msec;
        client.rate_delayed = false;
    } else {
        client.next_snapshot_time = time + rate_msec;
        client.rate_delayed = true;
    }

    // don't pile up empty snapshots while connecting, unless a download
    // wants the packets
    if client.state != ClientState::Active && !client.downloading && client.next_snapshot_time < time + 1000 {
        client.next_snapshot_time = time + 1000;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use myq3_common::qcommon::{NetAdr, NetChan};

    fn internet_client(rate: i32, snapshot_msec: i32) -> Client {
        Client {
            state: ClientState::Active,
            rate,
            snapshot_msec,
            netchan: NetChan::new(NetAdr::ipv4([8, 8, 4, 4], 27960)),
            ..Client::default()
        }
    }

    #[test]
    fn rate_msec_formula() {
        let settings = RateSettings::default();
        assert_eq!(sv_rate_msec(&settings, 25000, 200), (200 + 48) * 1000 / 25000);
        // capped at fragment size
        assert_eq!(sv_rate_msec(&settings, 3000, 4000), (1500 + 48) * 1000 / 3000);
    }

    #[test]
    fn server_limits_clamp_the_rate() {
        let settings = RateSettings { max_rate: 10000, min_rate: 5000, ..RateSettings::default() };
        assert_eq!(settings.effective_rate(90000), 10000);
        assert_eq!(settings.effective_rate(1000), 5000);
        assert_eq!(settings.effective_rate(8000), 8000);
    }

    #[test]
    fn rate_floor_never_beats_snapshot_msec() {
        let settings = RateSettings { min_rate: 25000, ..RateSettings::default() };
        for size in [0, 10, 100, 400, 1400, 3000] {
            let mut client = internet_client(settings.min_rate, 50);
            sv_schedule_next_snapshot(&settings, &mut client, size, 1000);
            assert!(client.next_snapshot_time - 1000 >= client.snapshot_msec);
        }
    }

    #[test]
    fn small_messages_are_not_rate_delayed() {
        let settings = RateSettings::default();
        let mut client = internet_client(25000, 50);
        sv_schedule_next_snapshot(&settings, &mut client, 100, 1000);
        assert_eq!(client.next_snapshot_time, 1050);
        assert!(!client.rate_delayed);
    }

    #[test]
    fn large_messages_are_rate_delayed() {
        let settings = RateSettings::default();
        let mut client = internet_client(3000, 50);
        sv_schedule_next_snapshot(&settings, &mut client, 1400, 1000);
        assert_eq!(client.next_snapshot_time, 1000 + (1400 + 48) * 1000 / 3000);
        assert!(client.rate_delayed);
    }

    #[test]
    fn local_clients_bypass_rate() {
        let settings = RateSettings::default();
        let mut client = internet_client(1000, 50);
        client.netchan.remote_address = NetAdr::ipv4([192, 168, 1, 4], 27960);
        sv_schedule_next_snapshot(&settings, &mut client, 1400, 1000);
        assert_eq!(client.next_snapshot_time, 1050);
        assert!(!client.rate_delayed);

        let mut loopback = internet_client(1000, 50);
        loopback.netchan.remote_address = NetAdr::default();
        sv_schedule_next_snapshot(&settings, &mut loopback, 1400, 1000);
        assert_eq!(loopback.next_snapshot_time, 1050);
    }

    #[test]
    fn connecting_clients_wait_a_second_unless_downloading() {
        let settings = RateSettings::default();
        let mut client = internet_client(25000, 50);
        client.state = ClientState::Primed;
        sv_schedule_next_snapshot(&settings, &mut client, 100, 1000);
        assert_eq!(client.next_snapshot_time, 2000);

        client.downloading = true;
        sv_schedule_next_snapshot(&settings, &mut client, 100, 1000);
        assert_eq!(client.next_snapshot_time, 1050);
    }

    #[test]
    fn low_rate_cvars_are_raised() {
        let mut cvars = CvarContext::default();
        cvars.get("sv_maxRate", "500", 0);
        cvars.get("sv_minRate", "0", 0);
        cvars.get("sv_lanForceRate", "1", 0);
        cvars.get("sv_fps", "20", 0);
        let settings = RateSettings::from_cvars(&mut cvars);
        assert_eq!(settings.max_rate, 1000);
        assert_eq!(cvars.variable_integer("sv_maxRate"), 1000);
        assert_eq!(settings.min_rate, 0);
    }
}
