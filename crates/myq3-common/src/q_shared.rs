// q_shared.rs — foundational types shared by server and client
//
// Copyright (C) 1999-2005 Id Software, Inc.
// Licensed under the GNU General Public License v2.

// ============================================================
// Basic types
// ============================================================

pub type Vec3 = [f32; 3];

pub fn vector_subtract(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

pub fn vector_length_squared(v: &Vec3) -> f32 {
    v[0] * v[0] + v[1] * v[1] + v[2] * v[2]
}

// ============================================================
// Limits
// ============================================================

pub const MAX_CLIENTS: usize = 64;

/// Entity numbers are sent over the net in GENTITYNUM_BITS.
pub const GENTITYNUM_BITS: u32 = 10;
pub const MAX_GENTITIES: usize = 1 << GENTITYNUM_BITS;

/// Entity number used when no entity is referenced.
pub const ENTITYNUM_NONE: i32 = MAX_GENTITIES as i32 - 1;
pub const ENTITYNUM_WORLD: i32 = MAX_GENTITIES as i32 - 2;

/// Bit vector of area visibility.
pub const MAX_MAP_AREA_BYTES: usize = 32;

pub const MAX_STRING_CHARS: usize = 1024;
pub const MAX_INFO_STRING: usize = 1024;
pub const MAX_NAME_LENGTH: usize = 32;

// bit field limits
pub const MAX_STATS: usize = 16;
pub const MAX_PERSISTANT: usize = 16;
pub const MAX_POWERUPS: usize = 16;
pub const MAX_WEAPONS: usize = 16;

pub const MAX_PS_EVENTS: usize = 2;

// ============================================================
// Trajectories
// ============================================================

pub const TR_STATIONARY: i32 = 0;
pub const TR_INTERPOLATE: i32 = 1;
pub const TR_LINEAR: i32 = 2;
pub const TR_LINEAR_STOP: i32 = 3;
pub const TR_SINE: i32 = 4;
pub const TR_GRAVITY: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Trajectory {
    pub tr_type: i32,
    pub tr_time: i32,
    /// if non 0, tr_time + tr_duration = stop time
    pub tr_duration: i32,
    pub tr_base: Vec3,
    /// velocity, etc
    pub tr_delta: Vec3,
}

// ============================================================
// entityState_t
//
// The information conveyed from the server in an update message about
// entities that the client will need to render in some way. Different
// eTypes may use the information in different ways. The messages are
// delta compressed, so it doesn't really matter if the structure size
// is fairly large.
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EntityState {
    /// entity index
    pub number: i32,
    pub e_type: i32,
    pub e_flags: i32,

    /// for calculating position
    pub pos: Trajectory,
    /// for calculating angles
    pub apos: Trajectory,

    pub time: i32,
    pub time2: i32,

    pub origin: Vec3,
    pub origin2: Vec3,

    pub angles: Vec3,
    pub angles2: Vec3,

    /// shotgun sources, etc
    pub other_entity_num: i32,
    pub other_entity_num2: i32,

    /// ENTITYNUM_NONE = in air
    pub ground_entity_num: i32,

    /// r + (g<<8) + (b<<16) + (intensity<<24)
    pub constant_light: i32,
    /// constantly loop this sound
    pub loop_sound: i32,

    pub modelindex: i32,
    pub modelindex2: i32,
    /// 0 to (MAX_CLIENTS - 1), for players and corpses
    pub client_num: i32,
    pub frame: i32,

    /// for client side prediction, trap_linkentity sets this properly
    pub solid: i32,

    /// impulse events -- muzzle flashes, footsteps, etc
    pub event: i32,
    pub event_parm: i32,

    /// bit flags
    pub powerups: i32,
    /// determines weapon and flash model, etc
    pub weapon: i32,
    /// mask off ANIM_TOGGLEBIT
    pub legs_anim: i32,
    /// mask off ANIM_TOGGLEBIT
    pub torso_anim: i32,

    pub generic1: i32,
}

impl EntityState {
    pub fn with_number(number: i32) -> Self {
        Self {
            number,
            ..Self::default()
        }
    }
}

// ============================================================
// playerState_t
//
// The information needed by both the client and server to predict
// player motion and actions. Nothing outside of pmove should modify
// these, or some degree of prediction error will occur. It is a full
// superset of EntityState as it is used by players, so if a PlayerState
// is transmitted, the EntityState can be fully derived from it.
// ============================================================

pub const PM_NORMAL: i32 = 0;
pub const PM_NOCLIP: i32 = 1;
pub const PM_SPECTATOR: i32 = 2;
pub const PM_DEAD: i32 = 3;
pub const PM_FREEZE: i32 = 4;
pub const PM_INTERMISSION: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlayerState {
    /// cmd->serverTime of last executed command
    pub command_time: i32,
    pub pm_type: i32,
    /// for view bobbing and footstep generation
    pub bob_cycle: i32,
    pub pm_flags: i32,
    pub pm_time: i32,

    pub origin: Vec3,
    pub velocity: Vec3,
    pub weapon_time: i32,
    pub gravity: i32,
    pub speed: i32,
    /// add to command angles to get view direction,
    /// changed by spawns, rotating objects, and teleporters
    pub delta_angles: [i32; 3],

    /// ENTITYNUM_NONE = in air
    pub ground_entity_num: i32,

    pub legs_timer: i32,
    pub legs_anim: i32,
    pub torso_timer: i32,
    pub torso_anim: i32,

    /// a number 0 to 7 that represents the relative angle
    /// of movement to the view angle
    pub movement_dir: i32,

    pub grapple_point: Vec3,

    pub e_flags: i32,

    pub event_sequence: i32,
    pub events: [i32; MAX_PS_EVENTS],
    pub event_parms: [i32; MAX_PS_EVENTS],

    pub external_event: i32,
    pub external_event_parm: i32,
    pub external_event_time: i32,

    /// ranges from 0 to MAX_CLIENTS-1
    pub client_num: i32,
    pub weapon: i32,
    pub weaponstate: i32,

    /// for fixed views
    pub viewangles: Vec3,
    pub viewheight: i32,

    // damage feedback
    pub damage_event: i32,
    pub damage_yaw: i32,
    pub damage_pitch: i32,
    pub damage_count: i32,

    pub stats: [i32; MAX_STATS],
    /// stats that aren't cleared on death
    pub persistant: [i32; MAX_PERSISTANT],
    /// level.time that the powerup runs out
    pub powerups: [i32; MAX_POWERUPS],
    pub ammo: [i32; MAX_WEAPONS],

    pub generic1: i32,
    pub loop_sound: i32,
    pub jumppad_ent: i32,

    // not communicated over the net at all
    pub ping: i32,
    pub pmove_framecount: i32,
    pub jumppad_frame: i32,
    pub entity_event_sequence: i32,
}

impl PlayerState {
    /// The eye position the client renders from.
    pub fn view_origin(&self) -> Vec3 {
        [
            self.origin[0],
            self.origin[1],
            self.origin[2] + self.viewheight as f32,
        ]
    }
}

// ============================================================
// Info strings
// ============================================================

/// Searches the string for the given key and returns the associated value,
/// or an empty string.
pub fn info_value_for_key(s: &str, key: &str) -> String {
    let mut chars = s;
    if chars.starts_with('\\') {
        chars = &chars[1..];
    }

    loop {
        // parse key
        let pkey = match chars.find('\\') {
            Some(pos) => {
                let k = &chars[..pos];
                chars = &chars[pos + 1..];
                k
            }
            None => return String::new(),
        };

        // parse value
        let value = match chars.find('\\') {
            Some(pos) => {
                let v = &chars[..pos];
                chars = &chars[pos + 1..];
                v
            }
            None => {
                // value runs to end of string
                if pkey.eq_ignore_ascii_case(key) {
                    return chars.to_string();
                }
                return String::new();
            }
        };

        if pkey.eq_ignore_ascii_case(key) {
            return value.to_string();
        }
    }
}

/// Truncates `s` to at most `max - 1` bytes on a char boundary, like
/// copying into a fixed C buffer of `max` bytes.
pub fn q_strncpyz(s: &str, max: usize) -> String {
    if s.len() < max {
        return s.to_string();
    }
    let mut end = max.saturating_sub(1);
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Parses a leading integer the way atoi does: junk after the digits is
/// ignored and an unparsable string is zero.
pub fn atoi(s: &str) -> i32 {
    let s = s.trim_start();
    let mut end = 0;
    for (i, c) in s.char_indices() {
        if c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+')) {
            end = i + c.len_utf8();
        } else {
            break;
        }
    }
    s[..end].parse::<i32>().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_value_for_key_finds_values() {
        let info = "\\name\\Sarge\\rate\\25000\\snaps\\40";
        assert_eq!(info_value_for_key(info, "name"), "Sarge");
        assert_eq!(info_value_for_key(info, "rate"), "25000");
        assert_eq!(info_value_for_key(info, "snaps"), "40");
        assert_eq!(info_value_for_key(info, "model"), "");
    }

    #[test]
    fn info_value_for_key_is_case_insensitive() {
        assert_eq!(info_value_for_key("\\Rate\\8000", "rate"), "8000");
    }

    #[test]
    fn q_strncpyz_truncates_to_buffer() {
        assert_eq!(q_strncpyz("hello", 16), "hello");
        assert_eq!(q_strncpyz("hello", 4), "hel");
        assert_eq!(q_strncpyz("", 1), "");
    }

    #[test]
    fn atoi_behaves_like_c() {
        assert_eq!(atoi("25000"), 25000);
        assert_eq!(atoi("  -12abc"), -12);
        assert_eq!(atoi("abc"), 0);
        assert_eq!(atoi(""), 0);
    }

    #[test]
    fn view_origin_adds_viewheight() {
        let mut ps = PlayerState::default();
        ps.origin = [10.0, 20.0, 30.0];
        ps.viewheight = 26;
        assert_eq!(ps.view_origin(), [10.0, 20.0, 56.0]);
    }
}
