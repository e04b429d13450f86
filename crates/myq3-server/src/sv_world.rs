// sv_world.rs — world queries used for interest management
//
// Copyright (C) 1999-2005 Id Software, Inc.
// Licensed under the GNU General Public License v2.
//
// The map's BSP and visibility data live behind `WorldQuery`. `VisMap`
// is a small in-memory implementation (leaf boxes, uncompressed PVS rows
// and area portals) used by tools and tests.

use myq3_common::q_shared::*;

use crate::server::{ServerState, SvEntity, MAX_ENT_CLUSTERS};
use crate::sv_game::SharedEntity;

const MAX_TOTAL_ENT_LEAFS: usize = 128;

// ============================================================
// World query callbacks
// ============================================================

/// The map queries the snapshot code needs.
///
/// The `Sync` supertrait lets the world be shared with worker threads.
pub trait WorldQuery: Sync {
    /// Leaf containing `p`, or -1 outside the map.
    fn point_leafnum(&self, p: &Vec3) -> i32;
    fn leaf_cluster(&self, leafnum: i32) -> i32;
    fn leaf_area(&self, leafnum: i32) -> i32;
    /// Fills `list` with leaves touching the box, up to `max`. Returns the
    /// total touched and the last leaf found, which may be past `max`.
    fn box_leafnums(&self, mins: &Vec3, maxs: &Vec3, list: &mut Vec<i32>, max: usize) -> (usize, i32);
    /// Uncompressed visibility row of `cluster`.
    fn cluster_pvs(&self, cluster: i32) -> &[u8];
    /// ORs the areas connected to `area` into `buffer`, returns the byte count.
    fn write_area_bits(&self, buffer: &mut [u8], area: i32) -> i32;
    fn areas_connected(&self, area1: i32, area2: i32) -> bool;
}

// ============================================================
// VisMap
// ============================================================

#[derive(Debug, Clone)]
pub struct VisLeaf {
    pub mins: Vec3,
    pub maxs: Vec3,
    /// -1 for leaves nobody can see into
    pub cluster: i32,
    pub area: i32,
}

pub struct VisMap {
    pub leafs: Vec<VisLeaf>,
    num_clusters: usize,
    cluster_bytes: usize,
    pvs: Vec<u8>,
    /// pvs row for invalid clusters
    no_vis: Vec<u8>,
    num_areas: usize,
    /// reference counted open portals between area pairs
    area_portals: Vec<i32>,
    /// flood number per area; equal numbers are connected
    flood: Vec<i32>,
}

impl VisMap {
    /// A map with no leaves, every cluster seeing only itself and every
    /// area closed off.
    pub fn new(num_clusters: usize, num_areas: usize) -> Self {
        let cluster_bytes = num_clusters.div_ceil(8);
        let mut map = Self {
            leafs: Vec::new(),
            num_clusters,
            cluster_bytes,
            pvs: vec![0; num_clusters * cluster_bytes],
            no_vis: vec![0; cluster_bytes],
            num_areas,
            area_portals: vec![0; num_areas * num_areas],
            flood: Vec::new(),
        };
        for c in 0..num_clusters {
            map.set_visible(c as i32, c as i32, true);
        }
        map.flood_area_connections();
        map
    }

    pub fn num_clusters(&self) -> usize {
        self.num_clusters
    }

    pub fn num_areas(&self) -> usize {
        self.num_areas
    }

    pub fn add_leaf(&mut self, mins: Vec3, maxs: Vec3, cluster: i32, area: i32) -> i32 {
        self.leafs.push(VisLeaf { mins, maxs, cluster, area });
        self.leafs.len() as i32 - 1
    }

    pub fn set_visible(&mut self, from: i32, to: i32, visible: bool) {
        let row = from as usize * self.cluster_bytes;
        let byte = row + (to as usize >> 3);
        let bit = 1u8 << (to & 7);
        if visible {
            self.pvs[byte] |= bit;
        } else {
            self.pvs[byte] &= !bit;
        }
    }

    /// Opens (or closes) one reference on the portal between two areas.
    pub fn adjust_area_portal_state(&mut self, area1: i32, area2: i32, open: bool) {
        if area1 < 0 || area2 < 0 {
            return;
        }
        let (a, b) = (area1 as usize, area2 as usize);
        if a >= self.num_areas || b >= self.num_areas {
            log::warn!("CM_AdjustAreaPortalState: bad area number");
            return;
        }

        let delta = if open { 1 } else { -1 };
        for idx in [a * self.num_areas + b, b * self.num_areas + a] {
            self.area_portals[idx] += delta;
            if self.area_portals[idx] < 0 {
                log::warn!("CM_AdjustAreaPortalState: negative reference count");
                self.area_portals[idx] = 0;
            }
        }

        self.flood_area_connections();
    }

    fn flood_area_connections(&mut self) {
        self.flood = vec![-1; self.num_areas];
        let mut flood_num = 0;
        for start in 0..self.num_areas {
            if self.flood[start] != -1 {
                continue;
            }
            let mut stack = vec![start];
            self.flood[start] = flood_num;
            while let Some(area) = stack.pop() {
                for other in 0..self.num_areas {
                    if self.flood[other] == -1 && self.area_portals[area * self.num_areas + other] > 0 {
                        self.flood[other] = flood_num;
                        stack.push(other);
                    }
                }
            }
            flood_num += 1;
        }
    }

    fn leaf(&self, leafnum: i32) -> Option<&VisLeaf> {
        usize::try_from(leafnum).ok().and_then(|n| self.leafs.get(n))
    }
}

fn boxes_overlap(mins: &Vec3, maxs: &Vec3, leaf: &VisLeaf) -> bool {
    (0..3).all(|i| mins[i] <= leaf.maxs[i] && maxs[i] >= leaf.mins[i])
}

impl WorldQuery for VisMap {
    fn point_leafnum(&self, p: &Vec3) -> i32 {
        self.leafs
            .iter()
            .position(|leaf| boxes_overlap(p, p, leaf))
            .map_or(-1, |n| n as i32)
    }

    fn leaf_cluster(&self, leafnum: i32) -> i32 {
        self.leaf(leafnum).map_or(-1, |leaf| leaf.cluster)
    }

    fn leaf_area(&self, leafnum: i32) -> i32 {
        self.leaf(leafnum).map_or(-1, |leaf| leaf.area)
    }

    fn box_leafnums(&self, mins: &Vec3, maxs: &Vec3, list: &mut Vec<i32>, max: usize) -> (usize, i32) {
        list.clear();
        let mut count = 0;
        let mut last_leaf = -1;
        for (n, leaf) in self.leafs.iter().enumerate() {
            if !boxes_overlap(mins, maxs, leaf) {
                continue;
            }
            if list.len() < max {
                list.push(n as i32);
            }
            count += 1;
            last_leaf = n as i32;
        }
        (count, last_leaf)
    }

    fn cluster_pvs(&self, cluster: i32) -> &[u8] {
        match usize::try_from(cluster) {
            Ok(c) if c < self.num_clusters => {
                &self.pvs[c * self.cluster_bytes..(c + 1) * self.cluster_bytes]
            }
            _ => &self.no_vis,
        }
    }

    fn write_area_bits(&self, buffer: &mut [u8], area: i32) -> i32 {
        let bytes = self.num_areas.div_ceil(8).min(buffer.len());

        if area < 0 || area as usize >= self.num_areas {
            // outside the map, so send everything
            for b in buffer[..bytes].iter_mut() {
                *b = 0xff;
            }
        } else {
            let flood_num = self.flood[area as usize];
            for i in 0..self.num_areas.min(bytes * 8) {
                if self.flood[i] == flood_num {
                    buffer[i >> 3] |= 1 << (i & 7);
                }
            }
        }

        bytes as i32
    }

    fn areas_connected(&self, area1: i32, area2: i32) -> bool {
        if area1 < 0 || area2 < 0 {
            return false;
        }
        let (a, b) = (area1 as usize, area2 as usize);
        if a >= self.num_areas || b >= self.num_areas {
            return false;
        }
        self.flood[a] == self.flood[b]
    }
}

// ============================================================
// SV_LinkEntity
// ============================================================

/// Recomputes the entity's bounds, areas and clusters after the game
/// moved it. An entity that touches no leaf is outside the world and
/// stays unlinked.
pub fn sv_link_entity(
    world: &dyn WorldQuery,
    state: ServerState,
    ent: &mut SharedEntity,
    sv_ent: &mut SvEntity,
) {
    if ent.r.linked {
        sv_unlink_entity(ent);
    }

    // encode the size into the entity state for client prediction
    ent.s.solid = ent.r.packed_solid();

    // set the abs box
    if ent.r.bmodel && ent.r.current_angles.iter().any(|&a| a != 0.0) {
        // expand for rotation
        let max = ent.r.mins.iter().chain(ent.r.maxs.iter()).fold(0.0f32, |m, v| m.max(v.abs()));
        for i in 0..3 {
            ent.r.absmin[i] = ent.r.current_origin[i] - max;
            ent.r.absmax[i] = ent.r.current_origin[i] + max;
        }
    } else {
        for i in 0..3 {
            ent.r.absmin[i] = ent.r.current_origin[i] + ent.r.mins[i];
            ent.r.absmax[i] = ent.r.current_origin[i] + ent.r.maxs[i];
        }
    }

    // because movement is clipped an epsilon away from an actual edge,
    // we must fully check even when bounding boxes don't quite touch
    for i in 0..3 {
        ent.r.absmin[i] -= 1.0;
        ent.r.absmax[i] += 1.0;
    }

    // link to PVS leafs
    sv_ent.num_clusters = 0;
    sv_ent.last_cluster = None;
    sv_ent.areanum = -1;
    sv_ent.areanum2 = -1;

    // get all leafs, including solids
    let mut leafs = Vec::with_capacity(MAX_TOTAL_ENT_LEAFS);
    let (num_leafs, last_leaf) =
        world.box_leafnums(&ent.r.absmin, &ent.r.absmax, &mut leafs, MAX_TOTAL_ENT_LEAFS);

    // if none of the leafs were inside the map, the
    // entity is outside the world and can be considered unlinked
    if num_leafs == 0 {
        return;
    }

    // set areas, even from clusters that don't fit in the entity array
    for &leaf in &leafs {
        let area = world.leaf_area(leaf);
        if area == -1 {
            continue;
        }
        // doors may legally straddle two areas,
        // but nothing should ever need more than that
        if sv_ent.areanum != -1 && sv_ent.areanum != area {
            if sv_ent.areanum2 != -1 && sv_ent.areanum2 != area && state == ServerState::Loading {
                log::debug!(
                    "Object {} touching 3 areas at {} {} {}",
                    ent.s.number, ent.r.absmin[0], ent.r.absmin[1], ent.r.absmin[2]
                );
            }
            sv_ent.areanum2 = area;
        } else {
            sv_ent.areanum = area;
        }
    }

    // store as many explicit clusters as we can
    let mut stored_all = true;
    for (i, &leaf) in leafs.iter().enumerate() {
        let cluster = world.leaf_cluster(leaf);
        if cluster == -1 {
            continue;
        }
        sv_ent.clusternums[sv_ent.num_clusters] = cluster;
        sv_ent.num_clusters += 1;
        if sv_ent.num_clusters == MAX_ENT_CLUSTERS {
            stored_all = i + 1 == num_leafs;
            break;
        }
    }
    if num_leafs > leafs.len() {
        stored_all = false;
    }

    // store off a last cluster if we need to
    if !stored_all {
        sv_ent.last_cluster = Some(world.leaf_cluster(last_leaf));
    }

    ent.r.link_count += 1;
    ent.r.linked = true;
}

pub fn sv_unlink_entity(ent: &mut SharedEntity) {
    ent.r.linked = false;
}
