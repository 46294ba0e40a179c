// src/subtree.rs
//! Implicit-tiling availability: Morton-indexed bitstreams per fixed-depth
//! quadtree subtree, serialized as `.subtree` binary blobs.
//!
//! `.subtree` layout:
//!   magic: u32            (4) = 0x74627573 ("subt")
//!   version: u32          (4) = 1
//!   json length: u64      (8) including padding
//!   bin length: u64       (8)
//!   JSON text, right-padded with ASCII space to 8-byte alignment
//!   internal buffer (node then child availability), segments padded to 8
//!
//! Two parallel indexes are maintained per `(dataset, CS)`: the per-tile
//! map records tiles that actually carry content, while the tile-and-child
//! map additionally has every ancestor bit bubbled up. The `.subtree` JSON
//! mixes both: tile/child availability from the bubbled map, content
//! availability from the per-tile map (via its `.bin` sidecar when that
//! map is non-constant).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde_json::{json, Value};

use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::math::morton2d_encode;
use crate::tile::{Tile, MAX_LEVEL};
use crate::tileio::align_to_8;

pub const SUBTREE_MAGIC: u32 = 0x7462_7573;
pub const HEADER_BYTE_LENGTH: usize = 24;

/// Constants derived once from the configured subtree depth.
#[derive(Debug, Clone, Copy)]
pub struct ImplicitTilingParams {
    pub subtree_levels: u32,
    pub subtree_node_count: u64,
    pub child_subtree_count: u64,
    pub availability_byte_length: usize,
    pub node_availability_byte_length_with_padding: usize,
    pub child_subtree_availability_byte_length: usize,
    pub child_subtree_availability_byte_length_with_padding: usize,
}

impl ImplicitTilingParams {
    pub fn new(subtree_levels: u32) -> Result<Self> {
        if subtree_levels < 1 || subtree_levels > MAX_LEVEL as u32 {
            return Err(Error::InvalidConfiguration(format!(
                "subtree levels must be in [1, {MAX_LEVEL}], got {subtree_levels}"
            )));
        }
        let subtree_node_count = ((1u64 << (2 * subtree_levels)) - 1) / 3;
        let child_subtree_count = 1u64 << (2 * subtree_levels);
        let availability_byte_length = ((subtree_node_count + 7) / 8) as usize;
        let child_subtree_availability_byte_length = ((child_subtree_count + 7) / 8) as usize;
        Ok(Self {
            subtree_levels,
            subtree_node_count,
            child_subtree_count,
            availability_byte_length,
            node_availability_byte_length_with_padding: align_to_8(availability_byte_length),
            child_subtree_availability_byte_length,
            child_subtree_availability_byte_length_with_padding: align_to_8(
                child_subtree_availability_byte_length,
            ),
        })
    }
}

/// Availability buffers of one subtree.
#[derive(Debug, Clone)]
pub struct SubtreeAvailability {
    pub node_buffer: Vec<u8>,
    pub child_buffer: Vec<u8>,
    pub node_count: u64,
    pub child_count: u64,
}

impl SubtreeAvailability {
    pub fn new(params: &ImplicitTilingParams) -> Self {
        Self {
            node_buffer: vec![0; params.node_availability_byte_length_with_padding],
            child_buffer: vec![0; params.child_subtree_availability_byte_length_with_padding],
            node_count: 0,
            child_count: 0,
        }
    }
}

/// Subtree-root-keyed availability, one entry per `L_X_Y` key.
pub type SubtreeMap = BTreeMap<String, SubtreeAvailability>;

/// `"L_X_Y"` key of the subtree rooted at `(level, x, y)`.
pub fn subtree_key(level: i32, x: u32, y: u32) -> String {
    format!("{level}_{x}_{y}")
}

/// `"CS1_CS2"` key of a component-selector bucket.
pub fn cs_key(cs_1: u32, cs_2: u32) -> String {
    format!("{cs_1}_{cs_2}")
}

fn count_set_bits(buffer: &[u8]) -> u64 {
    buffer.iter().map(|b| b.count_ones() as u64).sum()
}

/// Sets the availability bit of `(local_x, local_y)` at `local_level`.
///
/// The bit index is `(4^level - 1)/3 + morton2d(x, y)`. Fails with
/// [`Error::OutOfRange`] when the index does not fit the buffer; returns
/// whether the bit was already set. Counts are not touched here.
pub fn set_bit_at_xy_level_morton(
    buffer: &mut [u8],
    local_x: u32,
    local_y: u32,
    local_level: u32,
) -> Result<bool> {
    let morton_index = morton2d_encode(local_x, local_y);
    let node_count_up_to_this_level = ((1u64 << (2 * local_level)) - 1) / 3;

    let index = node_count_up_to_this_level + morton_index;
    let byte = (index / 8) as usize;
    let bit = (index % 8) as u32;
    if byte >= buffer.len() {
        return Err(Error::OutOfRange);
    }
    let mask = 1u8 << bit;
    let already_set = buffer[byte] & mask != 0;
    buffer[byte] |= mask;
    Ok(already_set)
}

/// Climbs from `(level, x, y)` to the root, setting node-availability bits
/// in the containing subtrees of `map`.
///
/// Crossing a subtree boundary switches to the parent subtree and marks a
/// child-subtree bit there instead of a node bit. An already-set node bit
/// short-circuits the climb: everything above is marked already.
pub fn set_parent_bits_recursively(
    map: &mut SubtreeMap,
    params: &ImplicitTilingParams,
    mut level: i32,
    mut x: u32,
    mut y: u32,
    mut subtree_root_level: i32,
    mut subtree_root_x: u32,
    mut subtree_root_y: u32,
) -> Result<()> {
    loop {
        if level == 0 {
            return Ok(());
        }
        if level == subtree_root_level {
            // need to set the childSubtree bit of the parent subtree
            subtree_root_level -= params.subtree_levels as i32;
            subtree_root_x >>= params.subtree_levels;
            subtree_root_y >>= params.subtree_levels;

            let local_child_x = x - (subtree_root_x << params.subtree_levels);
            let local_child_y = y - (subtree_root_y << params.subtree_levels);

            let key = subtree_key(subtree_root_level, subtree_root_x, subtree_root_y);
            let subtree = map
                .entry(key)
                .or_insert_with(|| SubtreeAvailability::new(params));
            set_bit_at_xy_level_morton(&mut subtree.child_buffer, local_child_x, local_child_y, 0)?;
        } else {
            level -= 1;
            x >>= 1;
            y >>= 1;

            let local_level = (level - subtree_root_level) as u32;
            let local_x = x - (subtree_root_x << local_level);
            let local_y = y - (subtree_root_y << local_level);

            let key = subtree_key(subtree_root_level, subtree_root_x, subtree_root_y);
            let subtree = map
                .entry(key)
                .or_insert_with(|| SubtreeAvailability::new(params));
            let already_set =
                set_bit_at_xy_level_morton(&mut subtree.node_buffer, local_x, local_y, local_level)?;
            if already_set {
                // the ancestors above are marked already
                return Ok(());
            }
        }
    }
}

/// Process-level availability state: `dataset -> CS key -> subtree key ->
/// buffers`, kept twice (per-tile and bubbled tile-and-child).
pub struct AvailabilityIndex {
    params: ImplicitTilingParams,
    per_tile: BTreeMap<Dataset, BTreeMap<String, SubtreeMap>>,
    tile_and_child: BTreeMap<Dataset, BTreeMap<String, SubtreeMap>>,
}

impl AvailabilityIndex {
    pub fn new(params: ImplicitTilingParams) -> Self {
        Self {
            params,
            per_tile: BTreeMap::new(),
            tile_and_child: BTreeMap::new(),
        }
    }

    pub fn params(&self) -> &ImplicitTilingParams {
        &self.params
    }

    /// Drops all per-geocell state. Called between geocells.
    pub fn clear(&mut self) {
        self.per_tile.clear();
        self.tile_and_child.clear();
    }

    /// Records `tile` as available (and as carrying content), bubbling
    /// ancestor bits up to the root. Negative levels are not indexed.
    pub fn add_availability(&mut self, tile: &Tile) -> Result<()> {
        let level = tile.level();
        if level < 0 {
            return Ok(());
        }
        let x = tile.rref();
        let y = tile.uref();

        // the subtree this tile belongs to
        let subtree_root_level = (level / self.params.subtree_levels as i32)
            * self.params.subtree_levels as i32;
        let level_within_subtree = (level - subtree_root_level) as u32;
        let subtree_root_x = x >> level_within_subtree;
        let subtree_root_y = y >> level_within_subtree;
        let local_x = x - (subtree_root_x << level_within_subtree);
        let local_y = y - (subtree_root_y << level_within_subtree);

        let key = subtree_key(subtree_root_level, subtree_root_x, subtree_root_y);
        let ck = cs_key(tile.cs_1(), tile.cs_2());

        let subtree = self
            .per_tile
            .entry(tile.dataset())
            .or_default()
            .entry(ck.clone())
            .or_default()
            .entry(key.clone())
            .or_insert_with(|| SubtreeAvailability::new(&self.params));
        let already_set = set_bit_at_xy_level_morton(
            &mut subtree.node_buffer,
            local_x,
            local_y,
            level_within_subtree,
        )?;
        if !already_set {
            subtree.node_count += 1;
        }

        let tile_and_child = self
            .tile_and_child
            .entry(tile.dataset())
            .or_default()
            .entry(ck)
            .or_default();
        let entry = tile_and_child
            .entry(key)
            .or_insert_with(|| SubtreeAvailability::new(&self.params));
        set_bit_at_xy_level_morton(
            &mut entry.node_buffer,
            local_x,
            local_y,
            level_within_subtree,
        )?;
        set_parent_bits_recursively(
            tile_and_child,
            &self.params,
            level,
            x,
            y,
            subtree_root_level,
            subtree_root_x,
            subtree_root_y,
        )
    }

    /// Writes the `.bin` availability sidecars and `.subtree` files of the
    /// current geocell, then resets the bubbled accumulators.
    pub fn flush_subtrees(&mut self, dataset_dirs: &HashMap<Dataset, PathBuf>) -> Result<()> {
        let params = self.params;
        for (dataset, cs_tile_and_child) in self.tile_and_child.iter_mut() {
            let Some(cs_subtrees) = self.per_tile.get(dataset) else {
                continue;
            };
            let dataset_dir = dataset_dirs
                .get(dataset)
                .ok_or(Error::UnsupportedDataset(*dataset))?;

            for (ck, subtree_map) in cs_subtrees {
                let tile_and_child_map = cs_tile_and_child.get_mut(ck).ok_or_else(|| {
                    Error::InvalidConfiguration(format!(
                        "no tile-and-child availability for {dataset} CS {ck}"
                    ))
                })?;

                let mut subtree_roots = BTreeSet::new();

                // availability sidecars, gated on the per-tile-only map
                for (key, subtree) in subtree_map {
                    subtree_roots.insert(key.clone());

                    let constant_node_availability = subtree.node_count == 0
                        || subtree.node_count == params.subtree_node_count;
                    if constant_node_availability {
                        continue;
                    }

                    let dir = dataset_dir.join(ck).join("availability");
                    fs::create_dir_all(&dir)?;
                    fs::write(dir.join(format!("{key}.bin")), &subtree.node_buffer)?;
                }

                // .subtree files for every subtree of the per-tile map
                for key in &subtree_roots {
                    let tile_and_child = tile_and_child_map.get_mut(key).ok_or_else(|| {
                        Error::InvalidConfiguration(format!(
                            "subtree {key} has no bubbled availability"
                        ))
                    })?;
                    write_subtree_file(
                        &params,
                        dataset_dir,
                        ck,
                        key,
                        tile_and_child,
                        subtree_map.get(key),
                    )?;
                }

                debug!(
                    "{dataset} CS {ck}: wrote {} subtree file(s)",
                    subtree_roots.len()
                );
                tile_and_child_map.clear();
            }
        }
        Ok(())
    }
}

/// Serializes one `.subtree` blob (and returns nothing; the sidecar was
/// written beforehand when applicable).
fn write_subtree_file(
    params: &ImplicitTilingParams,
    dataset_dir: &Path,
    ck: &str,
    key: &str,
    tile_and_child: &mut SubtreeAvailability,
    per_tile: Option<&SubtreeAvailability>,
) -> Result<()> {
    tile_and_child.node_count = count_set_bits(&tile_and_child.node_buffer);
    tile_and_child.child_count = count_set_bits(&tile_and_child.child_buffer);
    let constant_tile_availability = tile_and_child.node_count == 0
        || tile_and_child.node_count == params.subtree_node_count;
    let constant_child_availability = tile_and_child.child_count == 0
        || tile_and_child.child_count == params.child_subtree_count;

    let node_buffer_length_to_write = if constant_tile_availability {
        0
    } else {
        params.node_availability_byte_length_with_padding
    };
    let child_buffer_length_to_write = if constant_child_availability {
        0
    } else {
        params.child_subtree_availability_byte_length_with_padding
    };
    let buffer_byte_length = node_buffer_length_to_write + child_buffer_length_to_write;

    let mut buffers: Vec<Value> = Vec::new();
    let mut buffer_views: Vec<Value> = Vec::new();
    let mut buffer_index = 0;
    if buffer_byte_length != 0 {
        buffers.push(json!({ "byteLength": buffer_byte_length }));
        buffer_index += 1;
    }

    let mut internal_buffer = vec![0u8; buffer_byte_length];
    let mut internal_buffer_offset = 0usize;
    let mut buffer_view_index = 0;

    let tile_availability = if constant_tile_availability {
        json!({ "constant": (tile_and_child.node_count == params.subtree_node_count) as i32 })
    } else {
        internal_buffer[..params.node_availability_byte_length_with_padding]
            .copy_from_slice(&tile_and_child.node_buffer);
        buffer_views.push(json!({
            "buffer": 0,
            "byteOffset": 0,
            "byteLength": params.availability_byte_length,
        }));
        internal_buffer_offset += params.node_availability_byte_length_with_padding;
        buffer_view_index += 1;
        json!({ "bufferView": buffer_view_index - 1 })
    };

    let child_availability = if constant_child_availability {
        json!({ "constant": (tile_and_child.child_count == params.child_subtree_count) as i32 })
    } else {
        internal_buffer[internal_buffer_offset
            ..internal_buffer_offset + params.child_subtree_availability_byte_length_with_padding]
            .copy_from_slice(&tile_and_child.child_buffer);
        buffer_views.push(json!({
            "buffer": 0,
            "byteOffset": internal_buffer_offset,
            "byteLength": params.child_subtree_availability_byte_length,
        }));
        buffer_view_index += 1;
        json!({ "bufferView": buffer_view_index - 1 })
    };

    // content availability: the sidecar written from the per-tile map wins;
    // otherwise fall back to that map's constant state
    let availability_file_name = format!("{key}.bin");
    let sidecar_path = dataset_dir
        .join(ck)
        .join("availability")
        .join(&availability_file_name);
    let content_availability = if sidecar_path.exists() {
        buffers.push(json!({
            "uri": format!("../availability/{availability_file_name}"),
            "byteLength": params.node_availability_byte_length_with_padding,
        }));
        buffer_views.push(json!({
            "buffer": buffer_index,
            "byteOffset": 0,
            "byteLength": params.availability_byte_length,
        }));
        buffer_view_index += 1;
        json!({ "bufferView": buffer_view_index - 1 })
    } else if let Some(subtree) = per_tile {
        json!({ "constant": (subtree.node_count == params.subtree_node_count) as i32 })
    } else {
        json!({ "constant": 0 })
    };

    let mut subtree_json = json!({
        "tileAvailability": tile_availability,
        "childSubtreeAvailability": child_availability,
        "contentAvailability": content_availability,
    });
    if !buffers.is_empty() {
        subtree_json["buffers"] = json!(buffers);
    }
    if !buffer_views.is_empty() {
        subtree_json["bufferViews"] = json!(buffer_views);
    }

    let mut json_bytes = serde_json::to_vec(&subtree_json)?;
    let json_byte_length_with_padding = align_to_8(json_bytes.len());
    json_bytes.resize(json_byte_length_with_padding, b' ');

    let mut output =
        Vec::with_capacity(HEADER_BYTE_LENGTH + json_byte_length_with_padding + buffer_byte_length);
    output.extend_from_slice(&SUBTREE_MAGIC.to_le_bytes());
    output.extend_from_slice(&1u32.to_le_bytes());
    output.extend_from_slice(&(json_byte_length_with_padding as u64).to_le_bytes());
    output.extend_from_slice(&(buffer_byte_length as u64).to_le_bytes());
    output.extend_from_slice(&json_bytes);
    output.extend_from_slice(&internal_buffer);

    let dir = dataset_dir.join(ck).join("subtrees");
    fs::create_dir_all(&dir)?;
    fs::write(dir.join(format!("{key}.subtree")), &output)?;
    Ok(())
}
