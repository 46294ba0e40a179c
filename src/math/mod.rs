// src/math/mod.rs
//! Mathematical utilities for the converter.
//!
//! This module provides reusable mathematical components including:
//! - 2D Morton (Z-order) indexing for availability bitstreams
//! - WGS-84 ellipsoid conversions and surface normals

pub mod ellipsoid;
pub mod morton;

pub use self::ellipsoid::{Cartographic, Ellipsoid};
pub use self::morton::{morton2d_decode, morton2d_encode};
