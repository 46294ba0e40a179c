// src/geocell.rs
//! 1°×1° WGS-84 geocells, the roots of the CDB tile hierarchy.

use std::fmt;
use std::path::PathBuf;

/// A 1°×1° cell identified by the integer degrees of its south-west corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeoCell {
    pub latitude: i32,
    pub longitude: i32,
}

impl GeoCell {
    pub fn new(latitude: i32, longitude: i32) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Hemisphere-prefixed latitude token, e.g. `N32` or `S09`.
    pub fn latitude_name(&self) -> String {
        if self.latitude < 0 {
            format!("S{:02}", -self.latitude)
        } else {
            format!("N{:02}", self.latitude)
        }
    }

    /// Hemisphere-prefixed longitude token, e.g. `E117` or `W005`.
    pub fn longitude_name(&self) -> String {
        if self.longitude < 0 {
            format!("W{:03}", -self.longitude)
        } else {
            format!("E{:03}", self.longitude)
        }
    }

    /// Combined cell name, e.g. `N32W118`.
    pub fn name(&self) -> String {
        format!("{}{}", self.latitude_name(), self.longitude_name())
    }

    /// Relative output path for this cell, `<lat><lon>` as one component.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(self.name())
    }
}

impl fmt::Display for GeoCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
