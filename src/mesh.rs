// src/mesh.rs
//! In-memory triangle mesh shared by every content pipeline.
//!
//! Positions are kept twice: full-precision ECEF doubles for geometric
//! derivations, and single-precision positions relative to a center point
//! (RTC) as they are written into content files.

use glam::{DVec3, Vec2, Vec3};

#[derive(Debug, Clone, Default)]
pub struct Mesh {
    /// RTC center in ECEF meters.
    pub center: DVec3,
    /// Full-precision ECEF positions.
    pub positions: Vec<DVec3>,
    /// Positions relative to `center`, written to content files.
    pub position_rtcs: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub uvs: Vec<Vec2>,
    pub indices: Vec<u32>,
    /// Index into the material list of the owning model, if any.
    pub material: Option<usize>,
}

impl Mesh {
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.position_rtcs.is_empty()
    }

    pub fn has_uvs(&self) -> bool {
        !self.uvs.is_empty()
    }

    /// Recenters the RTC positions on the midpoint of the position AABB.
    pub fn recompute_rtc(&mut self) {
        if self.positions.is_empty() {
            self.center = DVec3::ZERO;
            self.position_rtcs.clear();
            return;
        }
        let mut min = self.positions[0];
        let mut max = self.positions[0];
        for p in &self.positions[1..] {
            min = min.min(*p);
            max = max.max(*p);
        }
        self.center = (min + max) * 0.5;
        self.position_rtcs = self
            .positions
            .iter()
            .map(|p| (*p - self.center).as_vec3())
            .collect();
    }

    /// Min/max corners of the RTC positions, as written to accessors.
    pub fn rtc_aabb(&self) -> (Vec3, Vec3) {
        let mut min = Vec3::splat(f32::MAX);
        let mut max = Vec3::splat(f32::MIN);
        for p in &self.position_rtcs {
            min = min.min(*p);
            max = max.max(*p);
        }
        (min, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recompute_rtc_centers_on_aabb_midpoint() {
        let mut mesh = Mesh {
            positions: vec![
                DVec3::new(0.0, 0.0, 0.0),
                DVec3::new(2.0, 4.0, 6.0),
                DVec3::new(1.0, 1.0, 1.0),
            ],
            ..Default::default()
        };
        mesh.recompute_rtc();
        assert_eq!(mesh.center, DVec3::new(1.0, 2.0, 3.0));
        assert_eq!(mesh.position_rtcs[0], Vec3::new(-1.0, -2.0, -3.0));
        assert_eq!(mesh.position_rtcs[1], Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_empty_mesh() {
        let mut mesh = Mesh::default();
        mesh.recompute_rtc();
        assert!(mesh.is_empty());
        assert_eq!(mesh.triangle_count(), 0);
    }
}
