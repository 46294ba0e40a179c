// src/tileset.rs
//! The per-geocell, per-CS tileset tree and its JSON serialization.
//!
//! Tiles arrive in whatever order the reader yields them; `insert_tile`
//! keeps the tree consistent by lifting the root, descending through
//! existing ancestors, and adopting covered subtrees. Sibling order is the
//! quadrant order NW, NE, SW, SE.

use std::io::Write;

use serde_json::{json, Value};

use crate::error::Result;
use crate::tile::{BoundingRegion, Tile, MAX_LEVEL};

#[derive(Debug, Clone)]
struct TileNode {
    tile: Tile,
    children: Vec<TileNode>,
}

impl TileNode {
    fn new(tile: Tile) -> Self {
        Self {
            tile,
            children: Vec::new(),
        }
    }
}

/// Sort key for siblings: which quadrant of `parent` contains `child`.
fn quadrant_order(parent: &Tile, child: &Tile) -> u32 {
    if parent.level() < 0 || child.level() <= parent.level() {
        return 0;
    }
    let shift = (child.level() - parent.level() - 1) as u32;
    let north = (child.uref() >> shift) & 1;
    let east = (child.rref() >> shift) & 1;
    match (north, east) {
        (1, 0) => 0, // NW
        (1, 1) => 1, // NE
        (0, 0) => 2, // SW
        _ => 3,      // SE
    }
}

/// An ordered tree of tiles keyed by their quadtree coordinates.
#[derive(Debug, Clone, Default)]
pub struct Tileset {
    root: Option<TileNode>,
}

impl Tileset {
    pub fn root(&self) -> Option<&Tile> {
        self.root.as_ref().map(|node| &node.tile)
    }

    /// First tile at `level` in pre-order, if any.
    pub fn first_tile_at_level(&self, level: i32) -> Option<&Tile> {
        fn find(node: &TileNode, level: i32) -> Option<&Tile> {
            if node.tile.level() == level {
                return Some(&node.tile);
            }
            node.children.iter().find_map(|child| find(child, level))
        }
        self.root.as_ref().and_then(|node| find(node, level))
    }

    /// Deepest populated level, scanning `0..=MAX_LEVEL`.
    pub fn max_populated_level(&self) -> i32 {
        let mut max_level = 0;
        for level in 0..=MAX_LEVEL {
            if self.first_tile_at_level(level).is_some() {
                max_level = level;
            }
        }
        max_level
    }

    /// Places `tile` at its position relative to the existing ancestors,
    /// creating no intermediate nodes: a child may sit multiple levels
    /// below its tree parent.
    pub fn insert_tile(&mut self, tile: Tile) {
        let Some(root) = self.root.take() else {
            self.root = Some(TileNode::new(tile));
            return;
        };

        // lift the root until it covers the incoming tile
        let mut root = root;
        while !(root.tile == tile || root.tile.is_ancestor_of(&tile)) {
            match root.tile.parent() {
                Some(parent) => {
                    let mut lifted = TileNode::new(parent);
                    lifted.children.push(root);
                    root = lifted;
                }
                // at the level floor everything shares an ancestor; the
                // incoming tile must be the floor tile itself
                None => break,
            }
        }
        Self::insert_into(&mut root, tile);
        self.root = Some(root);
    }

    fn insert_into(node: &mut TileNode, tile: Tile) {
        if node.tile == tile {
            // same coordinate seen again: adopt the newer payload (content
            // URI, refreshed bound region), keep the subtree
            node.tile = tile;
            return;
        }

        for child in &mut node.children {
            if child.tile == tile || child.tile.is_ancestor_of(&tile) {
                return Self::insert_into(child, tile);
            }
        }

        // new sibling; pull any children it covers underneath it
        let mut inserted = TileNode::new(tile);
        let mut i = 0;
        while i < node.children.len() {
            if inserted.tile.is_ancestor_of(&node.children[i].tile) {
                inserted.children.push(node.children.remove(i));
            } else {
                i += 1;
            }
        }
        node.children.push(inserted);
        let parent_tile = node.tile.clone();
        node.children
            .sort_by_key(|child| quadrant_order(&parent_tile, &child.tile));
    }
}

fn geometric_error(region: &BoundingRegion) -> f64 {
    region.diagonal_meters()
}

fn tile_node_to_json(node: &TileNode, error: f64, refine: Option<&str>) -> Value {
    let leaf = node.children.is_empty();
    let mut tile_json = json!({
        "boundingVolume": { "region": node.tile.bound_region().to_tileset_region() },
        "geometricError": if leaf { 0.0 } else { error },
    });
    if let Some(refine) = refine {
        tile_json["refine"] = json!(refine);
    }
    if let Some(uri) = node.tile.custom_content_uri() {
        tile_json["content"] = json!({ "uri": uri.to_string_lossy() });
    }
    if !leaf {
        let children: Vec<Value> = node
            .children
            .iter()
            .map(|child| {
                let halvings = (child.tile.level() - node.tile.level()).max(1);
                tile_node_to_json(child, error / f64::powi(2.0, halvings), None)
            })
            .collect();
        tile_json["children"] = json!(children);
    }
    tile_json
}

/// Serializes a tileset tree to `tileset.json` form.
///
/// `replace` selects the root refinement; next-mode output additionally
/// advertises the implicit-tiling subtree layout on the root tile.
pub fn write_tileset_json(
    tileset: &Tileset,
    replace: bool,
    w: &mut dyn Write,
    use_3d_tiles_next: bool,
    subtree_levels: u32,
    max_level: i32,
) -> Result<()> {
    let Some(root) = &tileset.root else {
        return Ok(());
    };

    let root_error = geometric_error(root.tile.bound_region());
    let refine = if replace { "REPLACE" } else { "ADD" };
    let mut root_json = tile_node_to_json(root, root_error, Some(refine));
    if use_3d_tiles_next {
        root_json["extensions"] = json!({
            "3DTILES_implicit_tiling": {
                "subdivisionScheme": "QUADTREE",
                "subtreeLevels": subtree_levels,
                "availableLevels": max_level + 1,
                "subtrees": { "uri": "subtrees/{level}_{x}_{y}.subtree" },
            }
        });
    }

    let mut tileset_json = json!({
        "asset": { "version": "1.0" },
        "geometricError": root_error,
        "root": root_json,
    });
    if use_3d_tiles_next {
        tileset_json["extensionsUsed"] = json!(["3DTILES_implicit_tiling"]);
    }

    serde_json::to_writer(w, &tileset_json)?;
    Ok(())
}

/// Writes a tileset that stitches per-geocell tilesets together as
/// external references, its region the union of the parts.
pub fn combine_tileset_json(
    tileset_uris: &[String],
    regions: &[BoundingRegion],
    w: &mut dyn Write,
) -> Result<()> {
    debug_assert_eq!(tileset_uris.len(), regions.len());
    let Some(first) = regions.first() else {
        return Ok(());
    };
    let union = regions.iter().fold(*first, |acc, r| acc.union(r));
    let root_error = geometric_error(&union);

    let children: Vec<Value> = tileset_uris
        .iter()
        .zip(regions)
        .map(|(uri, region)| {
            json!({
                "boundingVolume": { "region": region.to_tileset_region() },
                "geometricError": geometric_error(region),
                "content": { "uri": uri },
            })
        })
        .collect();

    let tileset_json = json!({
        "asset": { "version": "1.0" },
        "geometricError": root_error,
        "root": {
            "boundingVolume": { "region": union.to_tileset_region() },
            "geometricError": root_error,
            "refine": "ADD",
            "children": children,
        },
    });
    serde_json::to_writer(w, &tileset_json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;
    use crate::geocell::GeoCell;
    use std::path::PathBuf;

    fn tile(level: i32, uref: u32, rref: u32) -> Tile {
        Tile::new(
            GeoCell::new(0, 0),
            Dataset::Elevation,
            1,
            1,
            level,
            uref,
            rref,
        )
    }

    #[test]
    fn test_insert_root_then_children() {
        let mut tileset = Tileset::default();
        tileset.insert_tile(tile(0, 0, 0));
        tileset.insert_tile(tile(1, 1, 0));
        tileset.insert_tile(tile(1, 0, 0));

        assert_eq!(tileset.root().unwrap(), &tile(0, 0, 0));
        let root = tileset.root.as_ref().unwrap();
        assert_eq!(root.children.len(), 2);
        // NW before SW
        assert_eq!(root.children[0].tile, tile(1, 1, 0));
        assert_eq!(root.children[1].tile, tile(1, 0, 0));
    }

    #[test]
    fn test_insert_lifts_root_for_out_of_order_tiles() {
        let mut tileset = Tileset::default();
        tileset.insert_tile(tile(2, 0, 0));
        tileset.insert_tile(tile(0, 0, 0));

        assert_eq!(tileset.root().unwrap(), &tile(0, 0, 0));
        // the original deep tile survives underneath
        assert_eq!(tileset.first_tile_at_level(2), Some(&tile(2, 0, 0)));
    }

    #[test]
    fn test_insert_disjoint_siblings_meet_at_common_ancestor() {
        let mut tileset = Tileset::default();
        tileset.insert_tile(tile(2, 0, 0));
        tileset.insert_tile(tile(2, 3, 3));

        // lifting stops at the first common ancestor, level 0
        assert_eq!(tileset.root().unwrap().level(), 0);
        assert_eq!(tileset.first_tile_at_level(2), Some(&tile(2, 0, 0)));
        let root = tileset.root.as_ref().unwrap();
        assert_eq!(root.children.len(), 2);
    }

    #[test]
    fn test_insert_adopts_covered_children() {
        let mut tileset = Tileset::default();
        tileset.insert_tile(tile(0, 0, 0));
        tileset.insert_tile(tile(2, 3, 3));
        // the intermediate arrives late and must adopt (2,3,3)
        tileset.insert_tile(tile(1, 1, 1));

        let root = tileset.root.as_ref().unwrap();
        assert_eq!(root.children.len(), 1);
        assert_eq!(root.children[0].tile, tile(1, 1, 1));
        assert_eq!(root.children[0].children[0].tile, tile(2, 3, 3));
    }

    #[test]
    fn test_reinsert_updates_payload_in_place() {
        let mut tileset = Tileset::default();
        tileset.insert_tile(tile(0, 0, 0));
        tileset.insert_tile(tile(1, 0, 0));

        let mut updated = tile(0, 0, 0);
        updated.set_custom_content_uri(PathBuf::from("content.glb"));
        tileset.insert_tile(updated);

        let root = tileset.root.as_ref().unwrap();
        assert_eq!(root.children.len(), 1);
        assert!(root.tile.custom_content_uri().is_some());
    }

    #[test]
    fn test_max_populated_level() {
        let mut tileset = Tileset::default();
        tileset.insert_tile(tile(-2, 0, 0));
        tileset.insert_tile(tile(0, 0, 0));
        tileset.insert_tile(tile(3, 1, 5));
        assert_eq!(tileset.max_populated_level(), 3);
    }

    #[test]
    fn test_tileset_json_shape() {
        let mut tileset = Tileset::default();
        let mut root = tile(0, 0, 0);
        root.set_custom_content_uri(PathBuf::from("root.b3dm"));
        tileset.insert_tile(root);
        tileset.insert_tile(tile(1, 1, 1));

        let mut out = Vec::new();
        write_tileset_json(&tileset, true, &mut out, false, 7, 1).unwrap();
        let v: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v["asset"]["version"], json!("1.0"));
        assert_eq!(v["root"]["refine"], json!("REPLACE"));
        assert_eq!(v["root"]["content"]["uri"], json!("root.b3dm"));
        let region = v["root"]["boundingVolume"]["region"].as_array().unwrap();
        assert_eq!(region.len(), 6);
        assert!(v["root"]["children"].as_array().unwrap().len() == 1);
        assert!(v.get("extensionsUsed").is_none());
    }

    #[test]
    fn test_tileset_json_advertises_implicit_tiling_in_next_mode() {
        let mut tileset = Tileset::default();
        tileset.insert_tile(tile(0, 0, 0));

        let mut out = Vec::new();
        write_tileset_json(&tileset, true, &mut out, true, 7, 3).unwrap();
        let v: Value = serde_json::from_slice(&out).unwrap();
        let ext = &v["root"]["extensions"]["3DTILES_implicit_tiling"];
        assert_eq!(ext["subdivisionScheme"], json!("QUADTREE"));
        assert_eq!(ext["subtreeLevels"], json!(7));
        assert_eq!(ext["availableLevels"], json!(4));
        assert_eq!(
            ext["subtrees"]["uri"],
            json!("subtrees/{level}_{x}_{y}.subtree")
        );
        assert_eq!(v["extensionsUsed"], json!(["3DTILES_implicit_tiling"]));
    }

    #[test]
    fn test_combine_tileset_json_unions_regions() {
        let region_a = *tile(0, 0, 0).bound_region();
        let b = Tile::new(GeoCell::new(0, 1), Dataset::Elevation, 1, 1, 0, 0, 0);
        let region_b = *b.bound_region();

        let mut out = Vec::new();
        combine_tileset_json(
            &["N00E000/Elevation/1_1/N00E000_D001.json".into(),
              "N00E001/Elevation/1_1/N00E001_D001.json".into()],
            &[region_a, region_b],
            &mut out,
        )
        .unwrap();
        let v: Value = serde_json::from_slice(&out).unwrap();
        let children = v["root"]["children"].as_array().unwrap();
        assert_eq!(children.len(), 2);
        let union = v["root"]["boundingVolume"]["region"].as_array().unwrap();
        // spans two degrees of longitude
        let west = union[0].as_f64().unwrap();
        let east = union[2].as_f64().unwrap();
        assert!((east - west - 2f64.to_radians()).abs() < 1e-9);
        assert_eq!(v["root"]["refine"], json!("ADD"));
    }
}
