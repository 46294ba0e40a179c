// src/tile.rs
//! CDB tile identity.
//!
//! A [`Tile`] addresses one entry of the CDB quadtree:
//! `(geocell, dataset, CS1, CS2, level, UREF, RREF)`. At `level >= 0` a
//! geocell is split into `2^level × 2^level` tiles, UREF counting rows from
//! the south edge and RREF columns from the west edge. Negative levels are
//! single tiles covering the whole geocell at decreasing resolution.
//!
//! Everything here is pure derivation; no I/O.

use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use crate::dataset::Dataset;
use crate::geocell::GeoCell;
use crate::math::Ellipsoid;

/// Deepest LOD the converter will traverse.
pub const MAX_LEVEL: i32 = 23;

/// Coarsest negative LOD; `parent` returns `None` below this.
pub const MIN_LEVEL: i32 = -10;

/// A WGS-84 rectangle (radians) with a height interval (meters).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingRegion {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
    pub min_height: f64,
    pub max_height: f64,
}

impl BoundingRegion {
    /// The whole rectangle of a geocell with a zero height interval.
    pub fn whole_geocell(geocell: &GeoCell) -> Self {
        Self {
            west: (geocell.longitude as f64).to_radians(),
            south: (geocell.latitude as f64).to_radians(),
            east: (geocell.longitude as f64 + 1.0).to_radians(),
            north: (geocell.latitude as f64 + 1.0).to_radians(),
            min_height: 0.0,
            max_height: 0.0,
        }
    }

    pub fn union(&self, other: &BoundingRegion) -> Self {
        Self {
            west: self.west.min(other.west),
            south: self.south.min(other.south),
            east: self.east.max(other.east),
            north: self.north.max(other.north),
            min_height: self.min_height.min(other.min_height),
            max_height: self.max_height.max(other.max_height),
        }
    }

    /// The six-element `boundingVolume.region` array of 3D Tiles.
    pub fn to_tileset_region(&self) -> [f64; 6] {
        [
            self.west,
            self.south,
            self.east,
            self.north,
            self.min_height,
            self.max_height,
        ]
    }

    /// Approximate surface diagonal in meters, used for geometric error.
    pub fn diagonal_meters(&self) -> f64 {
        let r = Ellipsoid::WGS84.maximum_radius();
        let dx = (self.east - self.west) * r * ((self.south + self.north) * 0.5).cos();
        let dy = (self.north - self.south) * r;
        (dx * dx + dy * dy).sqrt()
    }
}

/// One CDB tile coordinate plus its derived bounding region.
#[derive(Debug, Clone)]
pub struct Tile {
    geocell: GeoCell,
    dataset: Dataset,
    cs_1: u32,
    cs_2: u32,
    level: i32,
    uref: u32,
    rref: u32,
    bound_region: BoundingRegion,
    custom_content_uri: Option<PathBuf>,
}

impl PartialEq for Tile {
    fn eq(&self, other: &Self) -> bool {
        // identity only; the bound region and content URI are derived state
        self.geocell == other.geocell
            && self.dataset == other.dataset
            && self.cs_1 == other.cs_1
            && self.cs_2 == other.cs_2
            && self.level == other.level
            && self.uref == other.uref
            && self.rref == other.rref
    }
}

impl Eq for Tile {}

impl Hash for Tile {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.geocell.hash(state);
        self.dataset.hash(state);
        self.cs_1.hash(state);
        self.cs_2.hash(state);
        self.level.hash(state);
        self.uref.hash(state);
        self.rref.hash(state);
    }
}

impl Tile {
    pub fn new(
        geocell: GeoCell,
        dataset: Dataset,
        cs_1: u32,
        cs_2: u32,
        level: i32,
        uref: u32,
        rref: u32,
    ) -> Self {
        debug_assert!((MIN_LEVEL..=MAX_LEVEL).contains(&level));
        if level >= 0 {
            debug_assert!(uref < 1 << level && rref < 1 << level);
        } else {
            debug_assert!(uref == 0 && rref == 0);
        }
        let bound_region = Self::calc_bound_region(&geocell, level, uref, rref);
        Self {
            geocell,
            dataset,
            cs_1,
            cs_2,
            level,
            uref,
            rref,
            bound_region,
            custom_content_uri: None,
        }
    }

    pub fn geocell(&self) -> &GeoCell {
        &self.geocell
    }

    pub fn dataset(&self) -> Dataset {
        self.dataset
    }

    pub fn cs_1(&self) -> u32 {
        self.cs_1
    }

    pub fn cs_2(&self) -> u32 {
        self.cs_2
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn uref(&self) -> u32 {
        self.uref
    }

    pub fn rref(&self) -> u32 {
        self.rref
    }

    pub fn bound_region(&self) -> &BoundingRegion {
        &self.bound_region
    }

    /// Overrides the derived region, typically to carry real terrain
    /// min/max heights.
    pub fn set_bound_region(&mut self, region: BoundingRegion) {
        self.bound_region = region;
    }

    pub fn custom_content_uri(&self) -> Option<&PathBuf> {
        self.custom_content_uri.as_ref()
    }

    pub fn set_custom_content_uri(&mut self, uri: PathBuf) {
        self.custom_content_uri = Some(uri);
    }

    /// Rectangle of `(level, uref, rref)` within a geocell. Negative
    /// levels cover the whole cell.
    pub fn calc_bound_region(
        geocell: &GeoCell,
        level: i32,
        uref: u32,
        rref: u32,
    ) -> BoundingRegion {
        let whole = BoundingRegion::whole_geocell(geocell);
        if level < 0 {
            return whole;
        }
        let divisions = (1u32 << level) as f64;
        let width = (whole.east - whole.west) / divisions;
        let height = (whole.north - whole.south) / divisions;
        BoundingRegion {
            west: whole.west + rref as f64 * width,
            south: whole.south + uref as f64 * height,
            east: whole.west + (rref + 1) as f64 * width,
            north: whole.south + (uref + 1) as f64 * height,
            min_height: 0.0,
            max_height: 0.0,
        }
    }

    /// Parent tile, or `None` at the negative-level floor.
    pub fn parent(&self) -> Option<Tile> {
        if self.level > 0 {
            Some(Tile::new(
                self.geocell,
                self.dataset,
                self.cs_1,
                self.cs_2,
                self.level - 1,
                self.uref / 2,
                self.rref / 2,
            ))
        } else if self.level > MIN_LEVEL {
            Some(Tile::new(
                self.geocell,
                self.dataset,
                self.cs_1,
                self.cs_2,
                self.level - 1,
                0,
                0,
            ))
        } else {
            None
        }
    }

    fn child_for_positive_lod(&self, north: u32, east: u32) -> Tile {
        debug_assert!(self.level >= 0);
        Tile::new(
            self.geocell,
            self.dataset,
            self.cs_1,
            self.cs_2,
            self.level + 1,
            2 * self.uref + north,
            2 * self.rref + east,
        )
    }

    pub fn nw_for_positive_lod(&self) -> Tile {
        self.child_for_positive_lod(1, 0)
    }

    pub fn ne_for_positive_lod(&self) -> Tile {
        self.child_for_positive_lod(1, 1)
    }

    pub fn sw_for_positive_lod(&self) -> Tile {
        self.child_for_positive_lod(0, 0)
    }

    pub fn se_for_positive_lod(&self) -> Tile {
        self.child_for_positive_lod(0, 1)
    }

    /// The single child of a negative-level tile.
    pub fn child_for_negative_lod(&self) -> Tile {
        debug_assert!(self.level < 0);
        Tile::new(
            self.geocell,
            self.dataset,
            self.cs_1,
            self.cs_2,
            self.level + 1,
            0,
            0,
        )
    }

    /// True when `other` sits strictly below `self` in the quadtree.
    pub fn is_ancestor_of(&self, other: &Tile) -> bool {
        if self.geocell != other.geocell
            || self.dataset != other.dataset
            || self.cs_1 != other.cs_1
            || self.cs_2 != other.cs_2
            || self.level >= other.level
        {
            return false;
        }
        if self.level < 0 {
            // the negative chain is linear and covers the whole cell
            return true;
        }
        let shift = other.level - self.level;
        other.uref >> shift == self.uref && other.rref >> shift == self.rref
    }

    /// Level token of the tile file name, zero padded (`L03`, `LC07`).
    fn level_token_padded(&self) -> String {
        if self.level < 0 {
            format!("LC{:02}", -self.level)
        } else {
            format!("L{:02}", self.level)
        }
    }

    /// Level token without zero padding (`L3`, `LC7`), used for output
    /// file naming.
    fn level_token_plain(&self) -> String {
        if self.level < 0 {
            format!("LC{}", -self.level)
        } else {
            format!("L{}", self.level)
        }
    }

    fn file_name_with_level_token(&self, level_token: &str) -> String {
        format!(
            "{}_D{:03}_S{:03}_T{:03}_{}_U{}_R{}",
            self.geocell.name(),
            self.dataset.code(),
            self.cs_1,
            self.cs_2,
            level_token,
            self.uref,
            self.rref
        )
    }

    /// Canonical CDB-layout relative path of this tile:
    /// `<geocell>/<dataset-dir>/<LOD>/<UREF>/<file>`.
    pub fn relative_path(&self) -> PathBuf {
        let lod_dir = if self.level < 0 {
            "LC".to_string()
        } else {
            self.level_token_padded()
        };
        self.geocell
            .relative_path()
            .join(self.dataset.directory_name())
            .join(lod_dir)
            .join(format!("U{}", self.uref))
            .join(self.file_name_with_level_token(&self.level_token_padded()))
    }

    /// File name variant with a non-zero-padded level, used when naming
    /// emitted content files.
    pub fn file_name_with_non_zero_padded_level(&self) -> String {
        self.file_name_with_level_token(&self.level_token_plain())
    }

    /// `<geocell>_D<code>` name shared by every tile of one geocell and
    /// dataset; names the per-geocell tileset JSON.
    pub fn geocell_dataset_name(&self) -> String {
        format!("{}_D{:03}", self.geocell.name(), self.dataset.code())
    }
}
