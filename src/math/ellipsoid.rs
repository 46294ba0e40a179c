// src/math/ellipsoid.rs
//! WGS-84 ellipsoid math.
//!
//! Only the pieces the elevation pipeline needs: cartographic/cartesian
//! conversion and geodetic surface normals, all in double precision.

use glam::DVec3;

/// Geodetic position: longitude/latitude in radians, height in meters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cartographic {
    pub longitude: f64,
    pub latitude: f64,
    pub height: f64,
}

impl Cartographic {
    pub fn new(longitude: f64, latitude: f64, height: f64) -> Self {
        Self {
            longitude,
            latitude,
            height,
        }
    }

    pub fn from_degrees(longitude_deg: f64, latitude_deg: f64, height: f64) -> Self {
        Self::new(longitude_deg.to_radians(), latitude_deg.to_radians(), height)
    }
}

/// An oblate ellipsoid of revolution centered at the origin.
#[derive(Debug, Clone, Copy)]
pub struct Ellipsoid {
    /// Equatorial radius in meters.
    semi_major: f64,
    /// Polar radius in meters.
    semi_minor: f64,
    /// First eccentricity squared.
    e2: f64,
    /// Second eccentricity squared.
    ep2: f64,
}

impl Ellipsoid {
    pub const WGS84: Ellipsoid = Ellipsoid::new(6378137.0, 6356752.314245179);

    pub const fn new(semi_major: f64, semi_minor: f64) -> Self {
        let a2 = semi_major * semi_major;
        let b2 = semi_minor * semi_minor;
        Self {
            semi_major,
            semi_minor,
            e2: (a2 - b2) / a2,
            ep2: (a2 - b2) / b2,
        }
    }

    pub fn maximum_radius(&self) -> f64 {
        self.semi_major
    }

    /// Outward unit normal of the ellipsoid surface at a geodetic position.
    pub fn geodetic_surface_normal(&self, carto: &Cartographic) -> DVec3 {
        let cos_lat = carto.latitude.cos();
        DVec3::new(
            cos_lat * carto.longitude.cos(),
            cos_lat * carto.longitude.sin(),
            carto.latitude.sin(),
        )
    }

    /// Converts a geodetic position to earth-centered cartesian coordinates.
    pub fn cartographic_to_cartesian(&self, carto: &Cartographic) -> DVec3 {
        let sin_lat = carto.latitude.sin();
        let cos_lat = carto.latitude.cos();
        // prime vertical radius of curvature
        let n = self.semi_major / (1.0 - self.e2 * sin_lat * sin_lat).sqrt();
        DVec3::new(
            (n + carto.height) * cos_lat * carto.longitude.cos(),
            (n + carto.height) * cos_lat * carto.longitude.sin(),
            (n * (1.0 - self.e2) + carto.height) * sin_lat,
        )
    }

    /// Converts a cartesian point to geodetic longitude/latitude/height
    /// using Bowring's method.
    ///
    /// Returns `None` for points too close to the ellipsoid center, where
    /// the geodetic coordinates are not defined.
    pub fn cartesian_to_cartographic(&self, position: DVec3) -> Option<Cartographic> {
        let p = position.truncate().length();
        if p < 1e-9 && position.z.abs() < 1e-9 {
            return None;
        }

        let longitude = position.y.atan2(position.x);
        let theta = (position.z * self.semi_major).atan2(p * self.semi_minor);
        let (sin_t, cos_t) = theta.sin_cos();
        let latitude = (position.z + self.ep2 * self.semi_minor * sin_t.powi(3))
            .atan2(p - self.e2 * self.semi_major * cos_t.powi(3));

        let sin_lat = latitude.sin();
        let n = self.semi_major / (1.0 - self.e2 * sin_lat * sin_lat).sqrt();
        // the planar form of the height degenerates near the poles
        let height = if latitude.cos().abs() > 1e-6 {
            p / latitude.cos() - n
        } else {
            position.z / sin_lat - n * (1.0 - self.e2)
        };

        Some(Cartographic::new(longitude, latitude, height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-6;

    #[test]
    fn test_surface_normal_at_poles_and_equator() {
        let e = Ellipsoid::WGS84;
        let north = e.geodetic_surface_normal(&Cartographic::from_degrees(0.0, 90.0, 0.0));
        assert!((north - DVec3::Z).length() < EPS);

        let equator = e.geodetic_surface_normal(&Cartographic::from_degrees(0.0, 0.0, 0.0));
        assert!((equator - DVec3::X).length() < EPS);
    }

    #[test]
    fn test_cartographic_round_trip() {
        let e = Ellipsoid::WGS84;
        for &(lon, lat, h) in &[
            (0.0, 0.0, 0.0),
            (12.5, 47.25, 1234.0),
            (-122.3, 37.8, -20.0),
            (179.9, -89.5, 4000.0),
        ] {
            let carto = Cartographic::from_degrees(lon, lat, h);
            let cartesian = e.cartographic_to_cartesian(&carto);
            let back = e.cartesian_to_cartographic(cartesian).unwrap();
            assert!((back.longitude - carto.longitude).abs() < 1e-9, "lon {lon}");
            assert!((back.latitude - carto.latitude).abs() < 1e-9, "lat {lat}");
            assert!((back.height - carto.height).abs() < 1e-3, "height {h}");
        }
    }

    #[test]
    fn test_center_has_no_cartographic() {
        let e = Ellipsoid::WGS84;
        assert!(e.cartesian_to_cartographic(DVec3::ZERO).is_none());
    }
}
