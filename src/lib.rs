// src/lib.rs
//! Batch converter from OGC CDB stores to Cesium 3D Tiles tilesets.
//!
//! The [`converter::Converter`] walks a CDB tree (behind the
//! [`cdb::CdbSource`] trait), reconciles elevation and imagery LODs,
//! collects per-geocell tileset trees, and records implicit-tiling
//! availability serialized as `.subtree` blobs.

pub mod builder;
pub mod cdb;
pub mod converter;
pub mod dataset;
pub mod elevation;
pub mod error;
pub mod geocell;
pub mod materials;
pub mod math;
pub mod mesh;
pub mod subtree;
pub mod tile;
pub mod tileio;
pub mod tileset;

pub use builder::{ConverterOptions, TilesetBuilder};
pub use converter::Converter;
pub use error::{Error, Result};
pub use geocell::GeoCell;
pub use tile::{BoundingRegion, Tile, MAX_LEVEL, MIN_LEVEL};
