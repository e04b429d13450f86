// msg_delta.rs — field-table delta compression of entity and player states
//
// Copyright (C) 1999-2005 Id Software, Inc.
// Licensed under the GNU General Public License v2.

use crate::common::*;
use crate::q_shared::*;
use crate::qcommon::SizeBuf;
use crate::snapshot_parse::ParseError;

// ============================================================
// Net field tables
//
// Each networked field is described by a name, a bit width and an
// accessor pair over the raw 32-bit value. A width of 0 marks a float
// field (the raw value is the IEEE bit pattern), a negative width a
// signed integer.
//
// Fields are ordered by how often they change, so the "last changed"
// count written before the change mask stays small for typical deltas.
// ============================================================

pub struct NetField<T> {
    pub name: &'static str,
    pub bits: i32,
    pub get: fn(&T) -> i32,
    pub set: fn(&mut T, i32),
}

macro_rules! int_field {
    ($t:ty, $name:expr, |$s:ident| $path:expr, $bits:expr) => {
        NetField::<$t> {
            name: $name,
            bits: $bits,
            get: |$s: &$t| $path,
            set: |$s: &mut $t, v: i32| $path = v,
        }
    };
}

macro_rules! float_field {
    ($t:ty, $name:expr, |$s:ident| $path:expr) => {
        NetField::<$t> {
            name: $name,
            bits: 0,
            get: |$s: &$t| $path.to_bits() as i32,
            set: |$s: &mut $t, v: i32| $path = f32::from_bits(v as u32),
        }
    };
}

const GENTITYNUM: i32 = GENTITYNUM_BITS as i32;

pub static ENTITY_STATE_FIELDS: [NetField<EntityState>; 51] = [
    int_field!(EntityState, "pos.trTime", |s| s.pos.tr_time, 32),
    float_field!(EntityState, "pos.trBase[0]", |s| s.pos.tr_base[0]),
    float_field!(EntityState, "pos.trBase[1]", |s| s.pos.tr_base[1]),
    float_field!(EntityState, "pos.trDelta[0]", |s| s.pos.tr_delta[0]),
    float_field!(EntityState, "pos.trDelta[1]", |s| s.pos.tr_delta[1]),
    float_field!(EntityState, "pos.trBase[2]", |s| s.pos.tr_base[2]),
    float_field!(EntityState, "apos.trBase[1]", |s| s.apos.tr_base[1]),
    float_field!(EntityState, "pos.trDelta[2]", |s| s.pos.tr_delta[2]),
    float_field!(EntityState, "apos.trBase[0]", |s| s.apos.tr_base[0]),
    int_field!(EntityState, "event", |s| s.event, 10),
    float_field!(EntityState, "angles2[1]", |s| s.angles2[1]),
    int_field!(EntityState, "eType", |s| s.e_type, 8),
    int_field!(EntityState, "torsoAnim", |s| s.torso_anim, 8),
    int_field!(EntityState, "eventParm", |s| s.event_parm, 8),
    int_field!(EntityState, "legsAnim", |s| s.legs_anim, 8),
    int_field!(EntityState, "groundEntityNum", |s| s.ground_entity_num, GENTITYNUM),
    int_field!(EntityState, "pos.trType", |s| s.pos.tr_type, 8),
    int_field!(EntityState, "eFlags", |s| s.e_flags, 19),
    int_field!(EntityState, "otherEntityNum", |s| s.other_entity_num, GENTITYNUM),
    int_field!(EntityState, "weapon", |s| s.weapon, 8),
    int_field!(EntityState, "clientNum", |s| s.client_num, 8),
    float_field!(EntityState, "angles[1]", |s| s.angles[1]),
    int_field!(EntityState, "pos.trDuration", |s| s.pos.tr_duration, 32),
    int_field!(EntityState, "apos.trType", |s| s.apos.tr_type, 8),
    float_field!(EntityState, "origin[0]", |s| s.origin[0]),
    float_field!(EntityState, "origin[1]", |s| s.origin[1]),
    float_field!(EntityState, "origin[2]", |s| s.origin[2]),
    int_field!(EntityState, "solid", |s| s.solid, 24),
    int_field!(EntityState, "powerups", |s| s.powerups, MAX_POWERUPS as i32),
    int_field!(EntityState, "modelindex", |s| s.modelindex, 8),
    int_field!(EntityState, "otherEntityNum2", |s| s.other_entity_num2, GENTITYNUM),
    int_field!(EntityState, "loopSound", |s| s.loop_sound, 8),
    int_field!(EntityState, "generic1", |s| s.generic1, 8),
    float_field!(EntityState, "origin2[2]", |s| s.origin2[2]),
    float_field!(EntityState, "origin2[0]", |s| s.origin2[0]),
    float_field!(EntityState, "origin2[1]", |s| s.origin2[1]),
    int_field!(EntityState, "modelindex2", |s| s.modelindex2, 8),
    float_field!(EntityState, "angles[0]", |s| s.angles[0]),
    int_field!(EntityState, "time", |s| s.time, 32),
    int_field!(EntityState, "apos.trTime", |s| s.apos.tr_time, 32),
    int_field!(EntityState, "apos.trDuration", |s| s.apos.tr_duration, 32),
    float_field!(EntityState, "apos.trBase[2]", |s| s.apos.tr_base[2]),
    float_field!(EntityState, "apos.trDelta[0]", |s| s.apos.tr_delta[0]),
    float_field!(EntityState, "apos.trDelta[1]", |s| s.apos.tr_delta[1]),
    float_field!(EntityState, "apos.trDelta[2]", |s| s.apos.tr_delta[2]),
    int_field!(EntityState, "time2", |s| s.time2, 32),
    float_field!(EntityState, "angles[2]", |s| s.angles[2]),
    float_field!(EntityState, "angles2[0]", |s| s.angles2[0]),
    float_field!(EntityState, "angles2[2]", |s| s.angles2[2]),
    int_field!(EntityState, "constantLight", |s| s.constant_light, 32),
    int_field!(EntityState, "frame", |s| s.frame, 16),
];

pub static PLAYER_STATE_FIELDS: [NetField<PlayerState>; 48] = [
    int_field!(PlayerState, "commandTime", |s| s.command_time, 32),
    float_field!(PlayerState, "origin[0]", |s| s.origin[0]),
    float_field!(PlayerState, "origin[1]", |s| s.origin[1]),
    int_field!(PlayerState, "bobCycle", |s| s.bob_cycle, 8),
    float_field!(PlayerState, "velocity[0]", |s| s.velocity[0]),
    float_field!(PlayerState, "velocity[1]", |s| s.velocity[1]),
    float_field!(PlayerState, "viewangles[1]", |s| s.viewangles[1]),
    float_field!(PlayerState, "viewangles[0]", |s| s.viewangles[0]),
    int_field!(PlayerState, "weaponTime", |s| s.weapon_time, -16),
    float_field!(PlayerState, "origin[2]", |s| s.origin[2]),
    float_field!(PlayerState, "velocity[2]", |s| s.velocity[2]),
    int_field!(PlayerState, "legsTimer", |s| s.legs_timer, 8),
    int_field!(PlayerState, "pm_time", |s| s.pm_time, -16),
    int_field!(PlayerState, "eventSequence", |s| s.event_sequence, 16),
    int_field!(PlayerState, "torsoAnim", |s| s.torso_anim, 8),
    int_field!(PlayerState, "movementDir", |s| s.movement_dir, 4),
    int_field!(PlayerState, "events[0]", |s| s.events[0], 8),
    int_field!(PlayerState, "legsAnim", |s| s.legs_anim, 8),
    int_field!(PlayerState, "events[1]", |s| s.events[1], 8),
    int_field!(PlayerState, "pm_flags", |s| s.pm_flags, 16),
    int_field!(PlayerState, "groundEntityNum", |s| s.ground_entity_num, GENTITYNUM),
    int_field!(PlayerState, "weaponstate", |s| s.weaponstate, 4),
    int_field!(PlayerState, "eFlags", |s| s.e_flags, 16),
    int_field!(PlayerState, "externalEvent", |s| s.external_event, 10),
    int_field!(PlayerState, "gravity", |s| s.gravity, 16),
    int_field!(PlayerState, "speed", |s| s.speed, 16),
    int_field!(PlayerState, "delta_angles[1]", |s| s.delta_angles[1], 16),
    int_field!(PlayerState, "externalEventParm", |s| s.external_event_parm, 8),
    int_field!(PlayerState, "viewheight", |s| s.viewheight, -8),
    int_field!(PlayerState, "damageEvent", |s| s.damage_event, 8),
    int_field!(PlayerState, "damageYaw", |s| s.damage_yaw, 8),
    int_field!(PlayerState, "damagePitch", |s| s.damage_pitch, 8),
    int_field!(PlayerState, "damageCount", |s| s.damage_count, 8),
    int_field!(PlayerState, "generic1", |s| s.generic1, 8),
    int_field!(PlayerState, "pm_type", |s| s.pm_type, 8),
    int_field!(PlayerState, "delta_angles[0]", |s| s.delta_angles[0], 16),
    int_field!(PlayerState, "delta_angles[2]", |s| s.delta_angles[2], 16),
    int_field!(PlayerState, "torsoTimer", |s| s.torso_timer, 12),
    int_field!(PlayerState, "eventParms[0]", |s| s.event_parms[0], 8),
    int_field!(PlayerState, "eventParms[1]", |s| s.event_parms[1], 8),
    int_field!(PlayerState, "clientNum", |s| s.client_num, 8),
    int_field!(PlayerState, "weapon", |s| s.weapon, 5),
    float_field!(PlayerState, "viewangles[2]", |s| s.viewangles[2]),
    float_field!(PlayerState, "grapplePoint[0]", |s| s.grapple_point[0]),
    float_field!(PlayerState, "grapplePoint[1]", |s| s.grapple_point[1]),
    float_field!(PlayerState, "grapplePoint[2]", |s| s.grapple_point[2]),
    int_field!(PlayerState, "jumppad_ent", |s| s.jumppad_ent, GENTITYNUM),
    int_field!(PlayerState, "loopSound", |s| s.loop_sound, 16),
];

// entity delta flags
pub const DELTA_REMOVED: i32 = 1;
pub const DELTA_CHANGED: i32 = 2;

// player state array bits
const PS_STATS: i32 = 1;
const PS_PERSISTANT: i32 = 2;
const PS_AMMO: i32 = 4;
const PS_POWERUPS: i32 = 8;

// float field tags
const FLOAT_ZERO: i32 = 0;
const FLOAT_INT: i32 = 1;
const FLOAT_FULL: i32 = 2;

// ============================================================
// Field values
// ============================================================

fn write_field(msg: &mut SizeBuf, bits: i32, raw: i32) {
    if bits == 0 {
        let f = f32::from_bits(raw as u32);
        let trunc = f as i16;
        if raw == 0 {
            msg_write_byte(msg, FLOAT_ZERO);
        } else if (trunc as f32).to_bits() == f.to_bits() {
            msg_write_byte(msg, FLOAT_INT);
            msg_write_short(msg, trunc as i32);
        } else {
            msg_write_byte(msg, FLOAT_FULL);
            msg_write_float(msg, f);
        }
        return;
    }

    match bits.unsigned_abs() {
        1..=8 => msg_write_byte(msg, raw),
        9..=16 => msg_write_short(msg, raw),
        _ => msg_write_long(msg, raw),
    }
}

fn read_field(msg: &mut SizeBuf, bits: i32) -> Result<i32, ParseError> {
    let raw = if bits == 0 {
        match msg_read_byte(msg) {
            FLOAT_ZERO => 0,
            FLOAT_INT => (msg_read_short(msg) as f32).to_bits() as i32,
            FLOAT_FULL => msg_read_float(msg).to_bits() as i32,
            tag => return Err(ParseError::BadFloatTag(tag)),
        }
    } else {
        let signed = bits < 0;
        match (bits.unsigned_abs(), signed) {
            (1..=8, true) => msg_read_char(msg),
            (1..=8, false) => msg_read_byte(msg),
            (9..=16, true) => msg_read_short(msg),
            (9..=16, false) => msg_read_short(msg) & 0xffff,
            _ => msg_read_long(msg),
        }
    };

    if msg_read_overrun(msg) {
        return Err(ParseError::Overrun);
    }
    Ok(raw)
}

/// Number of leading fields up to and including the last changed one.
fn last_changed<T>(fields: &[NetField<T>], from: &T, to: &T) -> usize {
    fields
        .iter()
        .rposition(|f| (f.get)(from) != (f.get)(to))
        .map_or(0, |i| i + 1)
}

/// `[byte lc][ceil(lc/8) mask bytes][values]`
fn write_field_block<T>(msg: &mut SizeBuf, fields: &[NetField<T>], from: &T, to: &T, lc: usize) {
    msg_write_byte(msg, lc as i32);

    let mut mask = vec![0u8; lc.div_ceil(8)];
    for (i, field) in fields[..lc].iter().enumerate() {
        if (field.get)(from) != (field.get)(to) {
            mask[i >> 3] |= 1 << (i & 7);
        }
    }
    msg_write_data(msg, &mask);

    for (i, field) in fields[..lc].iter().enumerate() {
        if mask[i >> 3] & (1 << (i & 7)) != 0 {
            write_field(msg, field.bits, (field.get)(to));
        }
    }
}

fn read_field_block<T>(msg: &mut SizeBuf, fields: &[NetField<T>], to: &mut T) -> Result<(), ParseError> {
    let lc = msg_read_byte(msg);
    if lc < 0 || lc as usize > fields.len() {
        return Err(ParseError::BadFieldCount(lc));
    }
    let lc = lc as usize;

    let mask = msg_read_data(msg, lc.div_ceil(8));
    if msg_read_overrun(msg) {
        return Err(ParseError::Overrun);
    }

    for (i, field) in fields[..lc].iter().enumerate() {
        if mask[i >> 3] & (1 << (i & 7)) != 0 {
            let raw = read_field(msg, field.bits)?;
            (field.set)(to, raw);
        }
    }
    Ok(())
}

// ============================================================
// Entity states
// ============================================================

/// Writes part of a packetentities message.
///
/// `to == None` writes a removal of `from`. An unchanged entity writes
/// nothing unless `force` is set, in which case only its number and an
/// empty flag byte go out.
pub fn msg_write_delta_entity(
    msg: &mut SizeBuf,
    from: &EntityState,
    to: Option<&EntityState>,
    force: bool,
) {
    let Some(to) = to else {
        msg_write_short(msg, from.number);
        msg_write_byte(msg, DELTA_REMOVED);
        return;
    };

    assert!(
        to.number >= 0 && (to.number as usize) < MAX_GENTITIES,
        "MSG_WriteDeltaEntity: Bad entity number: {}",
        to.number
    );

    let lc = last_changed(&ENTITY_STATE_FIELDS, from, to);
    if lc == 0 {
        if !force {
            return; // nothing at all changed
        }
        msg_write_short(msg, to.number);
        msg_write_byte(msg, 0);
        return;
    }

    msg_write_short(msg, to.number);
    msg_write_byte(msg, DELTA_CHANGED);
    write_field_block(msg, &ENTITY_STATE_FIELDS, from, to, lc);
}

/// Reads the entity number that starts every packetentities record.
pub fn msg_read_entity_number(msg: &mut SizeBuf) -> Result<i32, ParseError> {
    let number = msg_read_short(msg);
    if msg_read_overrun(msg) {
        return Err(ParseError::Overrun);
    }
    if number < 0 || number as usize >= MAX_GENTITIES {
        return Err(ParseError::BadEntityNumber(number));
    }
    Ok(number)
}

/// Reads the rest of a record after its number. `None` means the entity
/// was removed.
pub fn msg_read_delta_entity(
    msg: &mut SizeBuf,
    from: &EntityState,
    number: i32,
) -> Result<Option<EntityState>, ParseError> {
    let flags = msg_read_byte(msg);
    if msg_read_overrun(msg) {
        return Err(ParseError::Overrun);
    }

    if flags & DELTA_REMOVED != 0 {
        return Ok(None);
    }

    let mut to = *from;
    to.number = number;
    if flags & DELTA_CHANGED != 0 {
        read_field_block(msg, &ENTITY_STATE_FIELDS, &mut to)?;
    }
    Ok(Some(to))
}

// ============================================================
// Player states
// ============================================================

fn array_mask(from: &[i32], to: &[i32]) -> i32 {
    from.iter()
        .zip(to)
        .enumerate()
        .filter(|(_, (a, b))| a != b)
        .fold(0, |mask, (i, _)| mask | (1 << i))
}

fn write_array(msg: &mut SizeBuf, mask: i32, to: &[i32], long: bool) {
    msg_write_short(msg, mask);
    for (i, &v) in to.iter().enumerate() {
        if mask & (1 << i) != 0 {
            if long {
                msg_write_long(msg, v);
            } else {
                msg_write_short(msg, v);
            }
        }
    }
}

fn read_array(msg: &mut SizeBuf, to: &mut [i32], long: bool) {
    let mask = msg_read_short(msg) & 0xffff;
    for (i, v) in to.iter_mut().enumerate() {
        if mask & (1 << i) != 0 {
            *v = if long { msg_read_long(msg) } else { msg_read_short(msg) };
        }
    }
}

/// Delta encodes `to` against `from`, or against a zeroed state when
/// there is no reference.
pub fn msg_write_delta_playerstate(msg: &mut SizeBuf, from: Option<&PlayerState>, to: &PlayerState) {
    let dummy = PlayerState::default();
    let from = from.unwrap_or(&dummy);

    let lc = last_changed(&PLAYER_STATE_FIELDS, from, to);
    write_field_block(msg, &PLAYER_STATE_FIELDS, from, to, lc);

    let statsbits = array_mask(&from.stats, &to.stats);
    let persistantbits = array_mask(&from.persistant, &to.persistant);
    let ammobits = array_mask(&from.ammo, &to.ammo);
    let powerupbits = array_mask(&from.powerups, &to.powerups);

    let mut array_bits = 0;
    if statsbits != 0 {
        array_bits |= PS_STATS;
    }
    if persistantbits != 0 {
        array_bits |= PS_PERSISTANT;
    }
    if ammobits != 0 {
        array_bits |= PS_AMMO;
    }
    if powerupbits != 0 {
        array_bits |= PS_POWERUPS;
    }
    msg_write_byte(msg, array_bits);

    if statsbits != 0 {
        write_array(msg, statsbits, &to.stats, false);
    }
    if persistantbits != 0 {
        write_array(msg, persistantbits, &to.persistant, false);
    }
    if ammobits != 0 {
        write_array(msg, ammobits, &to.ammo, false);
    }
    if powerupbits != 0 {
        write_array(msg, powerupbits, &to.powerups, true);
    }
}

pub fn msg_read_delta_playerstate(
    msg: &mut SizeBuf,
    from: Option<&PlayerState>,
) -> Result<PlayerState, ParseError> {
    let mut to = from.copied().unwrap_or_default();

    read_field_block(msg, &PLAYER_STATE_FIELDS, &mut to)?;

    let array_bits = msg_read_byte(msg);
    if array_bits & PS_STATS != 0 {
        read_array(msg, &mut to.stats, false);
    }
    if array_bits & PS_PERSISTANT != 0 {
        read_array(msg, &mut to.persistant, false);
    }
    if array_bits & PS_AMMO != 0 {
        read_array(msg, &mut to.ammo, false);
    }
    if array_bits & PS_POWERUPS != 0 {
        read_array(msg, &mut to.powerups, true);
    }

    if msg_read_overrun(msg) {
        return Err(ParseError::Overrun);
    }
    Ok(to)
}
