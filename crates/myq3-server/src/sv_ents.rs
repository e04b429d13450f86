// sv_ents.rs — visibility filtering and per-client snapshot building
//
// Copyright (C) 1999-2005 Id Software, Inc.
// Licensed under the GNU General Public License v2.

use myq3_common::q_shared::*;

use crate::server::*;
use crate::sv_game::GameWorld;
use crate::sv_world::WorldQuery;

// ============================================================
// Visibility
// ============================================================

fn pvs_bit(pvs: &[u8], cluster: i32) -> bool {
    if cluster < 0 {
        return false;
    }
    pvs.get(cluster as usize >> 3)
        .is_some_and(|b| b & (1 << (cluster & 7)) != 0)
}

fn sv_add_ent_to_snapshot(sv_ent: &mut SvEntity, num: usize, snapshot_counter: i32, e_nums: &mut Vec<usize>) {
    // if we have already added this entity to this snapshot, don't add again
    if sv_ent.snapshot_counter == snapshot_counter {
        return;
    }
    sv_ent.snapshot_counter = snapshot_counter;

    // if we are full, silently discard entities
    if e_nums.len() >= MAX_SNAPSHOT_ENTITIES {
        return;
    }

    e_nums.push(num);
}

/// Whether the entity's flags let `viewer` see it at all.
fn sv_entity_sendable(sv_flags: SvFlags, single_client: i32, viewer: i32) -> bool {
    // entities can be flagged to explicitly not be sent to the client
    if sv_flags.contains(SvFlags::NOCLIENT) {
        return false;
    }

    // entities can be flagged to be sent to only one client
    if sv_flags.contains(SvFlags::SINGLECLIENT) && single_client != viewer {
        return false;
    }
    // entities can be flagged to be sent to everyone but one client
    if sv_flags.contains(SvFlags::NOTSINGLECLIENT) && single_client == viewer {
        return false;
    }
    // entities can be flagged to be sent to a given mask of clients
    if sv_flags.contains(SvFlags::CLIENTMASK) {
        if !(0..32).contains(&viewer) {
            log::debug!("SVF_CLIENTMASK: client number {} out of mask range", viewer);
            return false;
        }
        if !single_client & (1 << viewer) != 0 {
            return false;
        }
    }

    true
}

/// Collects the numbers of entities visible from `origin` into `e_nums`
/// and ORs the areas visible from it into `frame.areabits`.
///
/// Portal entities add their second origin as another viewpoint, up to
/// `max_portal_depth` portals deep. An entity is added at most once per
/// snapshot counter.
#[allow(clippy::too_many_arguments)]
pub fn sv_add_entities_visible_from_point(
    world: &dyn WorldQuery,
    game: &GameWorld,
    sv: &mut Server,
    origin: &Vec3,
    frame: &mut ClientSnapshot,
    viewer: i32,
    max_portal_depth: usize,
    e_nums: &mut Vec<usize>,
) {
    // during an error shutdown message we may need to transmit
    // the shutdown message after the server has shutdown, so
    // specfically check for it
    if sv.state == ServerState::Dead {
        return;
    }

    let snapshot_counter = sv.snapshot_counter;
    let mut viewpoints = vec![(*origin, 0usize)];

    while let Some((origin, depth)) = viewpoints.pop() {
        let leafnum = world.point_leafnum(&origin);
        let clientarea = world.leaf_area(leafnum);
        let clientcluster = world.leaf_cluster(leafnum);

        // calculate the visible areas
        frame.areabytes = world.write_area_bits(&mut frame.areabits, clientarea);

        let bitvector = world.cluster_pvs(clientcluster);

        for e in 0..game.num_entities {
            let ent = &game.entities[e];

            // never send entities that aren't linked in
            if !ent.r.linked {
                continue;
            }

            if !sv_entity_sendable(ent.r.sv_flags, ent.r.single_client, viewer) {
                continue;
            }

            let sv_ent = &mut sv.sv_entities[e];

            // don't double add an entity through portals
            if sv_ent.snapshot_counter == snapshot_counter {
                continue;
            }

            // broadcast entities are always sent
            if ent.r.sv_flags.contains(SvFlags::BROADCAST) {
                sv_add_ent_to_snapshot(sv_ent, e, snapshot_counter, e_nums);
                continue;
            }

            // ignore if not touching a PV leaf
            // check area
            if !world.areas_connected(clientarea, sv_ent.areanum) {
                // doors can legally straddle two areas, so
                // we may need to check another one
                if !world.areas_connected(clientarea, sv_ent.areanum2) {
                    continue; // blocked by a door
                }
            }

            // check individual leafs
            if sv_ent.num_clusters == 0 {
                continue;
            }
            let clusters = &sv_ent.clusternums[..sv_ent.num_clusters];
            let mut visible = clusters.iter().any(|&c| pvs_bit(bitvector, c));

            // the entity touched more clusters than it stored,
            // so scan the ones between the last stored and the last touched
            if !visible {
                if let Some(last_cluster) = sv_ent.last_cluster {
                    let from = clusters[clusters.len() - 1];
                    visible = (from..=last_cluster).any(|c| pvs_bit(bitvector, c));
                }
            }

            if !visible {
                continue; // not visible
            }

            sv_add_ent_to_snapshot(sv_ent, e, snapshot_counter, e_nums);

            // if it's a portal entity, add everything visible from its camera position
            if ent.r.sv_flags.contains(SvFlags::PORTAL) {
                if ent.s.generic1 != 0 {
                    let dir = vector_subtract(&ent.s.origin, &origin);
                    let max_dist = ent.s.generic1 as f32;
                    if vector_length_squared(&dir) > max_dist * max_dist {
                        continue;
                    }
                }
                if depth < max_portal_depth {
                    viewpoints.push((ent.s.origin2, depth + 1));
                } else {
                    log::debug!("portal {} past sv_portalDepth, not followed", e);
                }
            }
        }
    }
}

// ============================================================
// Snapshot building
// ============================================================

/// Decides which entities are going to be visible to the client, and
/// copies off the playerstate and areabits.
///
/// This properly handles multiple recursive portals, but the render
/// currently doesn't.
pub fn sv_build_client_snapshot(ctx: &mut ServerContext, client_num: usize) {
    let ServerContext { sv, svs, cvars, game, world, .. } = ctx;

    // bump the counter used to prevent double adding
    sv.snapshot_counter += 1;

    let max_portal_depth = cvars.variable_integer("sv_portalDepth").max(0) as usize;
    let client = &mut svs.clients[client_num];
    let client_state = client.state;
    let gentity_num = client.gentity_num;

    // this is the frame we are creating
    let frame = client.current_frame_mut();

    // clear everything in this snapshot
    frame.areabytes = 0;
    frame.areabits = [0; MAX_MAP_AREA_BYTES];
    frame.num_entities = 0;
    frame.first_entity = svs.history.next_index();

    if sv.state == ServerState::Dead || client_state == ClientState::Zombie {
        return;
    }
    let Some(gentity_num) = gentity_num else {
        return;
    };

    // grab the current playerState_t
    frame.ps = *game.player_state(client_num);

    // never send client's own entity, because it can
    // be regenerated from the playerstate
    sv.sv_entities[gentity_num].snapshot_counter = sv.snapshot_counter;

    // find the client's viewpoint
    let org = frame.ps.view_origin();
    let viewer = frame.ps.client_num;

    // add all the entities directly visible to the eye, which
    // may include portal entities that merge other viewpoints
    let mut e_nums = Vec::with_capacity(MAX_SNAPSHOT_ENTITIES);
    sv_add_entities_visible_from_point(
        &**world,
        game,
        sv,
        &org,
        frame,
        viewer,
        max_portal_depth,
        &mut e_nums,
    );

    // if there were portals visible, there may be out of order entities
    // in the list which will need to be resorted for the delta compression
    // to work correctly.  This also catches the error condition
    // of an entity being included twice.
    e_nums.sort_unstable();
    if e_nums.windows(2).any(|w| w[0] == w[1]) {
        panic!("SV_SortEntityNumbers: duplicated entity");
    }

    // now that all viewpoint's areabits have been OR'd together, invert
    // all of them to make it a mask vector, which is what the renderer wants
    for b in frame.areabits.iter_mut() {
        *b = !*b;
    }

    // copy the entity states out
    for num in e_nums {
        let mut state = game.entities[num].s;
        if state.number != num as i32 {
            log::debug!("FIXING ENT->S.NUMBER!!!");
            state.number = num as i32;
        }
        svs.history.push(state);
        frame.num_entities += 1;
    }
}
