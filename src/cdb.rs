// src/cdb.rs
//! The consumed CDB reader interface.
//!
//! Reading a CDB tree off disk (GeoTIFF, Shapefile, OpenFlight decoding,
//! tile discovery) is an external collaborator. The converter only sees
//! this trait and the loaded payload types below: iterators of typed tiles
//! and rasters already decoded to encoded image bytes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use glam::DVec3;

use crate::elevation::Elevation;
use crate::error::Result;
use crate::geocell::GeoCell;
use crate::mesh::Mesh;
use crate::tile::Tile;

/// Encoded raster payload handed over by the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterFormat {
    Jpeg,
    Png,
}

impl RasterFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            RasterFormat::Jpeg => "jpeg",
            RasterFormat::Png => "png",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncodedRaster {
    pub format: RasterFormat,
    pub bytes: Vec<u8>,
}

/// An imagery tile: encoded pixels plus the tile they belong to.
#[derive(Debug, Clone)]
pub struct Imagery {
    pub tile: Tile,
    pub data: EncodedRaster,
}

/// A raster-material (feature-ID) tile.
#[derive(Debug, Clone)]
pub struct RmTexture {
    pub tile: Tile,
    pub data: EncodedRaster,
}

/// One composite material of an RM descriptor: a name plus weighted
/// base-material substrates.
#[derive(Debug, Clone)]
pub struct CompositeMaterial {
    pub name: String,
    pub substrates: Vec<(String, u8)>,
}

/// Raster-material descriptor attribution for one tile.
#[derive(Debug, Clone)]
pub struct RmDescriptor {
    pub tile: Tile,
    pub composite_materials: Vec<CompositeMaterial>,
}

/// Per-instance attribute tables of a vector or model tile.
#[derive(Debug, Clone, Default)]
pub struct InstancesAttributes {
    pub integer_attributes: BTreeMap<String, Vec<i32>>,
    pub double_attributes: BTreeMap<String, Vec<f64>>,
    pub string_attributes: BTreeMap<String, Vec<String>>,
}

impl InstancesAttributes {
    pub fn instances_count(&self) -> usize {
        self.integer_attributes
            .values()
            .map(Vec::len)
            .chain(self.double_attributes.values().map(Vec::len))
            .chain(self.string_attributes.values().map(Vec::len))
            .max()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.integer_attributes.is_empty()
            && self.double_attributes.is_empty()
            && self.string_attributes.is_empty()
    }
}

/// A vector-network tile (roads, rails, powerlines, hydrography) already
/// triangulated/stripped into a mesh by the reader.
#[derive(Debug, Clone)]
pub struct GeometryVectors {
    pub tile: Tile,
    pub mesh: Mesh,
    pub instances: InstancesAttributes,
}

/// Texture sampling filters carried into the emitted glTF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFilter {
    Nearest,
    Linear,
    NearestMipmapNearest,
    LinearMipmapNearest,
}

/// A texture reference written into content files: a URI relative to the
/// tileset directory plus sampler filters.
#[derive(Debug, Clone)]
pub struct Texture {
    pub uri: PathBuf,
    pub mag_filter: TextureFilter,
    pub min_filter: TextureFilter,
}

/// Simple PBR-ish material description for model meshes.
#[derive(Debug, Clone, Default)]
pub struct MaterialSpec {
    pub double_sided: bool,
    pub unlit: bool,
    /// Index into the model's texture list.
    pub texture: Option<usize>,
}

/// A 3D model payload: meshes, materials, and textures with their encoded
/// images, as loaded by the reader.
#[derive(Debug, Clone, Default)]
pub struct Model3D {
    pub meshes: Vec<Mesh>,
    pub materials: Vec<MaterialSpec>,
    pub textures: Vec<Texture>,
    pub images: Vec<EncodedRaster>,
}

/// Instance placements shared by every model of a tile.
#[derive(Debug, Clone)]
pub struct ModelsAttributes {
    pub tile: Tile,
    /// Cartographic positions converted to ECEF by the reader.
    pub positions: Vec<DVec3>,
    /// Heading in radians per instance.
    pub orientations: Vec<f64>,
    pub scales: Vec<f64>,
    pub instances: InstancesAttributes,
}

/// A geotypical-model tile: instances referencing a shared model library.
#[derive(Debug, Clone)]
pub struct GtModels {
    pub attributes: ModelsAttributes,
    /// Per instance, the key of the referenced library model (if resolved).
    pub model_keys: Vec<Option<String>>,
    /// The library models themselves, keyed as above.
    pub models: BTreeMap<String, Model3D>,
}

impl GtModels {
    pub fn tile(&self) -> &Tile {
        &self.attributes.tile
    }

    /// Resolves instance `index` to its model key and payload.
    pub fn locate_model_3d(&self, index: usize) -> Option<(&str, &Model3D)> {
        let key = self.model_keys.get(index)?.as_deref()?;
        self.models.get(key).map(|model| (key, model))
    }
}

/// A geospecific-model tile: one unique model with instance attribution.
#[derive(Debug, Clone)]
pub struct GsModels {
    pub tile: Tile,
    pub model: Model3D,
    pub instances: InstancesAttributes,
}

/// Access to one CDB tree, produced by the external reader.
///
/// The converter walks every geocell once and, inside a geocell, drains one
/// dataset stream at a time. Presence probes (`is_*_exist`) and random
/// imagery access drive the LOD reconciliation branches.
pub trait CdbSource {
    fn for_each_geo_cell(&self, f: &mut dyn FnMut(GeoCell) -> Result<()>) -> Result<()>;

    fn for_each_elevation_tile(
        &self,
        geocell: &GeoCell,
        f: &mut dyn FnMut(Elevation) -> Result<()>,
    ) -> Result<()>;

    fn for_each_road_network_tile(
        &self,
        geocell: &GeoCell,
        f: &mut dyn FnMut(GeometryVectors) -> Result<()>,
    ) -> Result<()>;

    fn for_each_railroad_network_tile(
        &self,
        geocell: &GeoCell,
        f: &mut dyn FnMut(GeometryVectors) -> Result<()>,
    ) -> Result<()>;

    fn for_each_powerline_network_tile(
        &self,
        geocell: &GeoCell,
        f: &mut dyn FnMut(GeometryVectors) -> Result<()>,
    ) -> Result<()>;

    fn for_each_hydrography_network_tile(
        &self,
        geocell: &GeoCell,
        f: &mut dyn FnMut(GeometryVectors) -> Result<()>,
    ) -> Result<()>;

    fn for_each_gt_model_tile(
        &self,
        geocell: &GeoCell,
        f: &mut dyn FnMut(GtModels) -> Result<()>,
    ) -> Result<()>;

    fn for_each_gs_model_tile(
        &self,
        geocell: &GeoCell,
        f: &mut dyn FnMut(GsModels) -> Result<()>,
    ) -> Result<()>;

    fn get_imagery(&self, tile: &Tile) -> Option<Imagery>;

    fn get_rm_texture(&self, tile: &Tile) -> Option<RmTexture>;

    fn get_rm_descriptor(&self, tile: &Tile) -> Option<RmDescriptor>;

    fn is_elevation_exist(&self, tile: &Tile) -> bool;

    fn is_imagery_exist(&self, tile: &Tile) -> bool;

    /// Path of `Metadata/Materials.xml` when the store carries one.
    fn materials_xml_path(&self) -> Option<PathBuf> {
        None
    }
}
