// src/elevation.rs
//! Elevation tiles: a uniform grid mesh over a tile's rectangle.
//!
//! The grid is row major with row 0 on the south edge and column 0 on the
//! west edge, matching the UREF/RREF axes, so UV `v = 0` is south. The
//! reconciliation pipeline trims quadrant sub-regions out of the grid and
//! rebases UVs when a tile borrows an ancestor's imagery.

use glam::{Vec2, Vec3};

use crate::math::{Cartographic, Ellipsoid};
use crate::mesh::Mesh;
use crate::tile::Tile;

const EPSILON10: f32 = 1e-10;

/// A loaded elevation tile.
#[derive(Debug, Clone)]
pub struct Elevation {
    tile: Tile,
    uniform_grid_mesh: Mesh,
    /// Vertex columns in the grid.
    grid_width: u32,
    /// Vertex rows in the grid.
    grid_height: u32,
    min_elevation: f64,
    max_elevation: f64,
}

impl Elevation {
    pub fn new(
        tile: Tile,
        uniform_grid_mesh: Mesh,
        grid_width: u32,
        grid_height: u32,
        min_elevation: f64,
        max_elevation: f64,
    ) -> Self {
        debug_assert_eq!(
            uniform_grid_mesh.vertex_count(),
            (grid_width * grid_height) as usize
        );
        Self {
            tile,
            uniform_grid_mesh,
            grid_width,
            grid_height,
            min_elevation,
            max_elevation,
        }
    }

    /// Builds an elevation tile from a row-major height grid (row 0 south),
    /// sampling the tile rectangle uniformly.
    pub fn from_height_grid(tile: Tile, width: u32, height: u32, heights: &[f64]) -> Self {
        debug_assert_eq!(heights.len(), (width * height) as usize);
        let region = *tile.bound_region();
        let ellipsoid = Ellipsoid::WGS84;

        let mut mesh = Mesh::default();
        let mut min_elevation = f64::MAX;
        let mut max_elevation = f64::MIN;
        for r in 0..height {
            for c in 0..width {
                let h = heights[(r * width + c) as usize];
                min_elevation = min_elevation.min(h);
                max_elevation = max_elevation.max(h);
                let longitude = region.west
                    + (region.east - region.west) * c as f64 / (width - 1).max(1) as f64;
                let latitude = region.south
                    + (region.north - region.south) * r as f64 / (height - 1).max(1) as f64;
                mesh.positions.push(
                    ellipsoid.cartographic_to_cartesian(&Cartographic::new(longitude, latitude, h)),
                );
                mesh.uvs.push(Vec2::new(
                    c as f32 / (width - 1).max(1) as f32,
                    r as f32 / (height - 1).max(1) as f32,
                ));
            }
        }
        for r in 0..height.saturating_sub(1) {
            for c in 0..width.saturating_sub(1) {
                let sw = r * width + c;
                let se = sw + 1;
                let nw = sw + width;
                let ne = nw + 1;
                // counter-clockwise seen from outside the ellipsoid
                mesh.indices.extend_from_slice(&[sw, se, nw, se, ne, nw]);
            }
        }
        mesh.recompute_rtc();

        Self::new(tile, mesh, width, height, min_elevation, max_elevation)
    }

    pub fn tile(&self) -> &Tile {
        &self.tile
    }

    pub fn set_tile(&mut self, tile: Tile) {
        self.tile = tile;
    }

    pub fn uniform_grid_mesh(&self) -> &Mesh {
        &self.uniform_grid_mesh
    }

    pub fn min_elevation(&self) -> f64 {
        self.min_elevation
    }

    pub fn max_elevation(&self) -> f64 {
        self.max_elevation
    }

    /// Decimates the uniform grid down to roughly `target_index_count`
    /// indices by subsampling rows and columns.
    ///
    /// A zero error budget disables decimation. Returns an empty mesh when
    /// the target cannot be met; the caller falls back to the full grid.
    pub fn create_simplified_mesh(&self, target_index_count: usize, target_error: f32) -> Mesh {
        let mesh = &self.uniform_grid_mesh;
        if target_error <= 0.0 || target_index_count >= mesh.indices.len() {
            return mesh.clone();
        }
        if target_index_count == 0 {
            return Mesh::default();
        }

        // halving the grid pitch quarters the index count
        let ratio = mesh.indices.len() as f64 / target_index_count as f64;
        let stride = ratio.sqrt().ceil() as u32;
        let cols = sampled_axis(self.grid_width, stride);
        let rows = sampled_axis(self.grid_height, stride);
        if cols.len() < 2 || rows.len() < 2 {
            return Mesh::default();
        }

        self.extract_grid(&rows, &cols, None).uniform_grid_mesh
    }

    /// North-west quadrant sub-region (north half rows, west half columns).
    pub fn create_north_west_sub_region(&self, reindex_uv: bool) -> Option<Elevation> {
        self.create_sub_region(self.tile.nw_for_positive_lod(), true, false, reindex_uv)
    }

    pub fn create_north_east_sub_region(&self, reindex_uv: bool) -> Option<Elevation> {
        self.create_sub_region(self.tile.ne_for_positive_lod(), true, true, reindex_uv)
    }

    pub fn create_south_west_sub_region(&self, reindex_uv: bool) -> Option<Elevation> {
        self.create_sub_region(self.tile.sw_for_positive_lod(), false, false, reindex_uv)
    }

    pub fn create_south_east_sub_region(&self, reindex_uv: bool) -> Option<Elevation> {
        self.create_sub_region(self.tile.se_for_positive_lod(), false, true, reindex_uv)
    }

    fn create_sub_region(
        &self,
        child_tile: Tile,
        north: bool,
        east: bool,
        reindex_uv: bool,
    ) -> Option<Elevation> {
        let (w, h) = (self.grid_width, self.grid_height);
        if w < 3 || h < 3 {
            return None;
        }

        // halves share the seam row/column so quadrants stay watertight
        let mid_r = (h - 1) / 2;
        let mid_c = (w - 1) / 2;
        let rows: Vec<u32> = if north {
            (mid_r..h).collect()
        } else {
            (0..=mid_r).collect()
        };
        let cols: Vec<u32> = if east {
            (mid_c..w).collect()
        } else {
            (0..=mid_c).collect()
        };

        let mut sub = self.extract_grid(&rows, &cols, Some(child_tile));
        if reindex_uv {
            // quadrant carries its own imagery; stretch UVs back to [0, 1]
            let sub_w = sub.grid_width;
            let sub_h = sub.grid_height;
            sub.uniform_grid_mesh.uvs.clear();
            for r in 0..sub_h {
                for c in 0..sub_w {
                    sub.uniform_grid_mesh.uvs.push(Vec2::new(
                        c as f32 / (sub_w - 1) as f32,
                        r as f32 / (sub_h - 1) as f32,
                    ));
                }
            }
        }
        Some(sub)
    }

    /// Copies the vertices at the given row/column samples into a fresh
    /// grid mesh, preserving per-vertex UVs.
    fn extract_grid(&self, rows: &[u32], cols: &[u32], tile: Option<Tile>) -> Elevation {
        let src = &self.uniform_grid_mesh;
        let mut mesh = Mesh {
            material: src.material,
            ..Default::default()
        };
        for &r in rows {
            for &c in cols {
                let i = (r * self.grid_width + c) as usize;
                mesh.positions.push(src.positions[i]);
                if !src.uvs.is_empty() {
                    mesh.uvs.push(src.uvs[i]);
                }
            }
        }
        let w = cols.len() as u32;
        let h = rows.len() as u32;
        for r in 0..h - 1 {
            for c in 0..w - 1 {
                let sw = r * w + c;
                let se = sw + 1;
                let nw = sw + w;
                let ne = nw + 1;
                mesh.indices.extend_from_slice(&[sw, se, nw, se, ne, nw]);
            }
        }
        mesh.recompute_rtc();

        Elevation::new(
            tile.unwrap_or_else(|| self.tile.clone()),
            mesh,
            w,
            h,
            self.min_elevation,
            self.max_elevation,
        )
    }

    /// Rewrites the UVs so they address the sub-rectangle of `ancestor`'s
    /// texture that this tile covers. Only meaningful at positive levels;
    /// at `level <= 0` both tiles cover the whole geocell.
    pub fn index_uv_relative_to_parent(&mut self, ancestor: &Tile) {
        let level_diff = self.tile.level() - ancestor.level();
        debug_assert!(level_diff > 0);
        let scale = (1u32 << level_diff) as f32;
        let uref_rel = (self.tile.uref() - (ancestor.uref() << level_diff)) as f32;
        let rref_rel = (self.tile.rref() - (ancestor.rref() << level_diff)) as f32;
        for uv in &mut self.uniform_grid_mesh.uvs {
            uv.x = (rref_rel + uv.x) / scale;
            uv.y = (uref_rel + uv.y) / scale;
        }
    }
}

/// Accumulates triangle cross products into per-vertex normals, replacing
/// degenerate accumulations with the WGS-84 geodetic surface normal.
pub fn generate_normals(mesh: &mut Mesh) {
    let ellipsoid = Ellipsoid::WGS84;
    let total_vertices = mesh.position_rtcs.len();
    mesh.normals.clear();
    mesh.normals.resize(total_vertices, Vec3::ZERO);

    for tri in mesh.indices.chunks_exact(3) {
        let (i0, i1, i2) = (tri[0] as usize, tri[1] as usize, tri[2] as usize);
        let p0 = mesh.position_rtcs[i0];
        let p1 = mesh.position_rtcs[i1];
        let p2 = mesh.position_rtcs[i2];
        let normal = (p1 - p0).cross(p2 - p0);
        mesh.normals[i0] += normal;
        mesh.normals[i1] += normal;
        mesh.normals[i2] += normal;
    }

    for i in 0..total_vertices {
        let normal = mesh.normals[i];
        if normal.dot(normal).abs() > EPSILON10 {
            mesh.normals[i] = normal.normalize();
        } else if let Some(carto) = ellipsoid.cartesian_to_cartographic(mesh.positions[i]) {
            mesh.normals[i] = ellipsoid.geodetic_surface_normal(&carto).as_vec3();
        }
    }
}

fn sampled_axis(len: u32, stride: u32) -> Vec<u32> {
    let mut samples: Vec<u32> = (0..len).step_by(stride as usize).collect();
    if samples.last() != Some(&(len - 1)) {
        samples.push(len - 1);
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;
    use crate::geocell::GeoCell;

    fn elevation(level: i32, uref: u32, rref: u32, grid: u32) -> Elevation {
        let tile = Tile::new(
            GeoCell::new(0, 0),
            Dataset::Elevation,
            1,
            1,
            level,
            uref,
            rref,
        );
        let heights = vec![100.0; (grid * grid) as usize];
        Elevation::from_height_grid(tile, grid, grid, &heights)
    }

    #[test]
    fn test_height_grid_shape() {
        let e = elevation(0, 0, 0, 5);
        assert_eq!(e.uniform_grid_mesh().vertex_count(), 25);
        assert_eq!(e.uniform_grid_mesh().triangle_count(), 32);
        assert_eq!(e.min_elevation(), 100.0);
        assert_eq!(e.max_elevation(), 100.0);
    }

    #[test]
    fn test_simplify_reduces_and_falls_back() {
        let e = elevation(0, 0, 0, 9);
        let full = e.uniform_grid_mesh().indices.len();

        let simplified = e.create_simplified_mesh(full / 4, 0.01);
        assert!(!simplified.is_empty());
        assert!(simplified.indices.len() <= full / 2);

        // zero error budget disables decimation
        let untouched = e.create_simplified_mesh(full / 4, 0.0);
        assert_eq!(untouched.indices.len(), full);

        // impossible target empties the mesh; the caller falls back
        assert!(e.create_simplified_mesh(0, 0.01).is_empty());
    }

    #[test]
    fn test_sub_regions_cover_quadrants() {
        let e = elevation(1, 0, 0, 5);
        let nw = e.create_north_west_sub_region(false).unwrap();
        assert_eq!(nw.tile().level(), 2);
        assert_eq!((nw.tile().uref(), nw.tile().rref()), (1, 0));
        assert_eq!(nw.uniform_grid_mesh().vertex_count(), 9);

        // without reindexing the sub-region keeps the parent's UV window
        let uvs = &nw.uniform_grid_mesh().uvs;
        assert!(uvs.iter().all(|uv| uv.x <= 0.5 + 1e-6));
        assert!(uvs.iter().all(|uv| uv.y >= 0.5 - 1e-6));

        // with reindexing the quadrant spans the full texture
        let nw_own = e.create_north_west_sub_region(true).unwrap();
        let uvs = &nw_own.uniform_grid_mesh().uvs;
        assert!(uvs.iter().any(|uv| uv.x > 0.99));
        assert!(uvs.iter().any(|uv| uv.y < 0.01));
    }

    #[test]
    fn test_sub_region_rejects_tiny_grid() {
        let e = elevation(1, 0, 0, 2);
        assert!(e.create_north_west_sub_region(false).is_none());
    }

    #[test]
    fn test_uv_reindex_relative_to_parent() {
        let mut e = elevation(2, 3, 1, 3);
        let ancestor = Tile::new(GeoCell::new(0, 0), Dataset::Elevation, 1, 1, 0, 0, 0);
        e.index_uv_relative_to_parent(&ancestor);
        let uvs = &e.uniform_grid_mesh().uvs;
        // tile (2, u=3, r=1) covers u in [0.25, 0.5], v in [0.75, 1.0]
        assert!((uvs[0].x - 0.25).abs() < 1e-6);
        assert!((uvs[0].y - 0.75).abs() < 1e-6);
        let last = uvs.last().unwrap();
        assert!((last.x - 0.5).abs() < 1e-6);
        assert!((last.y - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_generate_normals_point_away_from_earth_center() {
        let e = elevation(0, 0, 0, 4);
        let mut mesh = e.uniform_grid_mesh().clone();
        generate_normals(&mut mesh);
        assert_eq!(mesh.normals.len(), mesh.vertex_count());
        for (normal, position) in mesh.normals.iter().zip(&mesh.positions) {
            let up = position.normalize().as_vec3();
            assert!(normal.dot(up) > 0.5, "normal {normal:?} vs up {up:?}");
        }
    }
}
