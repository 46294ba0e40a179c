// src/builder.rs
//! Tileset collection and content emission.
//!
//! One `TilesetBuilder` lives for the duration of a conversion. Per
//! geocell it accumulates tileset trees per `(dataset group, CS)`, emits
//! content files next to them, and records implicit-tiling availability.
//! The driver flushes one dataset group at a time so memory stays bounded
//! by the current geocell's working set.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use hashbrown::HashMap as FastHashMap;
use log::{debug, info};
use nohash_hasher::BuildNoHashHasher;

use crate::cdb::{
    CdbSource, GeometryVectors, GsModels, GtModels, Imagery, InstancesAttributes, MaterialSpec,
    RmDescriptor, RmTexture, Texture, TextureFilter,
};
use crate::dataset::{
    Dataset, ELEVATIONS_PATH, GSMODEL_PATH, GTMODEL_PATH, HYDROGRAPHY_NETWORK_PATH,
    POWERLINE_NETWORK_PATH, RAILROAD_NETWORK_PATH, ROAD_NETWORK_PATH,
};
use crate::elevation::{generate_normals, Elevation};
use crate::error::{Error, Result};
use crate::geocell::GeoCell;
use crate::materials::MaterialsIndex;
use crate::subtree::{AvailabilityIndex, ImplicitTilingParams};
use crate::tile::{Tile, MAX_LEVEL};
use crate::tileio::{self, Gltf};
use crate::tileset::{write_tileset_json, Tileset};

const MODEL_TEXTURE_SUB_DIR: &str = "Textures";
const MODEL_GLTF_SUB_DIR: &str = "Gltf";

/// Converter tunables, set before `convert()` runs.
#[derive(Debug, Clone)]
pub struct ConverterOptions {
    /// Emit glTF + implicit tiling instead of B3DM/CMPT.
    pub use_3d_tiles_next: bool,
    /// Write the materials schema as a sidecar instead of inline.
    pub external_schema: bool,
    /// Generate per-vertex normals on simplified elevation meshes.
    pub elevation_normal: bool,
    /// Suppress imagery-driven hole filling.
    pub elevation_lod: bool,
    /// Implicit-tiling subtree depth.
    pub subtree_levels: u32,
    /// Elevation decimation fraction, in (0, 1].
    pub elevation_threshold_indices: f32,
    /// Elevation decimation error budget.
    pub elevation_decimate_error: f32,
}

impl Default for ConverterOptions {
    fn default() -> Self {
        Self {
            use_3d_tiles_next: false,
            external_schema: false,
            elevation_normal: false,
            elevation_lod: false,
            subtree_levels: 7,
            elevation_threshold_indices: 0.3,
            elevation_decimate_error: 1.0,
        }
    }
}

/// The dataset groups that own tileset collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    Elevation,
    RoadNetwork,
    RailRoadNetwork,
    PowerlineNetwork,
    HydrographyNetwork,
    GtModel,
    GsModel,
}

impl CollectionKind {
    pub fn path_name(&self) -> &'static str {
        match self {
            CollectionKind::Elevation => ELEVATIONS_PATH,
            CollectionKind::RoadNetwork => ROAD_NETWORK_PATH,
            CollectionKind::RailRoadNetwork => RAILROAD_NETWORK_PATH,
            CollectionKind::PowerlineNetwork => POWERLINE_NETWORK_PATH,
            CollectionKind::HydrographyNetwork => HYDROGRAPHY_NETWORK_PATH,
            CollectionKind::GtModel => GTMODEL_PATH,
            CollectionKind::GsModel => GSMODEL_PATH,
        }
    }
}

/// The collection a dataset's tiles land in, if any.
fn collection_kind_for_dataset(dataset: Dataset) -> Option<CollectionKind> {
    match dataset {
        Dataset::Elevation => Some(CollectionKind::Elevation),
        Dataset::RoadNetwork => Some(CollectionKind::RoadNetwork),
        Dataset::RailRoadNetwork => Some(CollectionKind::RailRoadNetwork),
        Dataset::PowerlineNetwork => Some(CollectionKind::PowerlineNetwork),
        Dataset::HydrographyNetwork => Some(CollectionKind::HydrographyNetwork),
        Dataset::GTFeature | Dataset::GTModelGeometry500 | Dataset::GTModelTexture => {
            Some(CollectionKind::GtModel)
        }
        Dataset::GSFeature | Dataset::GSModelGeometry | Dataset::GSModelTexture => {
            Some(CollectionKind::GsModel)
        }
        Dataset::Imagery | Dataset::RMTexture | Dataset::RMDescriptor => None,
    }
}

type CsHashMap<V> = FastHashMap<u64, V, BuildNoHashHasher<u64>>;

fn hash_component_selectors(cs_1: u32, cs_2: u32) -> u64 {
    (cs_1 as u64) << 32 | cs_2 as u64
}

fn cs_directory(cs_1: u32, cs_2: u32, collection_output_directory: &Path) -> PathBuf {
    collection_output_directory.join(format!("{cs_1}_{cs_2}"))
}

/// Per-geocell tilesets and output directories, keyed by the CS hash.
#[derive(Default)]
struct TilesetCollection {
    cs_to_tilesets: CsHashMap<Tileset>,
    cs_to_paths: CsHashMap<PathBuf>,
}

pub struct TilesetBuilder {
    output_path: PathBuf,
    options: ConverterOptions,
    availability: AvailabilityIndex,
    materials: MaterialsIndex,

    dataset_dirs: HashMap<Dataset, PathBuf>,

    elevation_tilesets: HashMap<GeoCell, TilesetCollection>,
    road_network_tilesets: HashMap<GeoCell, TilesetCollection>,
    railroad_network_tilesets: HashMap<GeoCell, TilesetCollection>,
    powerline_network_tilesets: HashMap<GeoCell, TilesetCollection>,
    hydrography_network_tilesets: HashMap<GeoCell, TilesetCollection>,
    gt_model_tilesets: HashMap<GeoCell, TilesetCollection>,
    gs_model_tilesets: HashMap<GeoCell, TilesetCollection>,

    /// Ancestor imagery adopted by orphan elevation tiles, reused across
    /// siblings until the geocell's elevation stream is flushed.
    processed_parent_imagery: HashMap<Tile, Texture>,
    /// Model texture files already on disk.
    processed_model_textures: HashSet<PathBuf>,
    /// Unique GT library models already emitted, key to glb URI.
    gt_models_to_gltf: HashMap<String, PathBuf>,

    /// Per-geocell tileset JSONs awaiting global combination.
    default_dataset_to_combine: Vec<PathBuf>,
}

impl TilesetBuilder {
    pub fn new(output_path: &Path, options: ConverterOptions) -> Result<Self> {
        if !(0.0..=1.0).contains(&options.elevation_threshold_indices)
            || options.elevation_threshold_indices == 0.0
        {
            return Err(Error::InvalidConfiguration(format!(
                "elevation threshold indices must be in (0, 1], got {}",
                options.elevation_threshold_indices
            )));
        }
        if options.elevation_decimate_error < 0.0 {
            return Err(Error::InvalidConfiguration(format!(
                "elevation decimate error must be non-negative, got {}",
                options.elevation_decimate_error
            )));
        }
        let params = ImplicitTilingParams::new(options.subtree_levels)?;
        Ok(Self {
            output_path: output_path.to_path_buf(),
            options,
            availability: AvailabilityIndex::new(params),
            materials: MaterialsIndex::default(),
            dataset_dirs: HashMap::new(),
            elevation_tilesets: HashMap::new(),
            road_network_tilesets: HashMap::new(),
            railroad_network_tilesets: HashMap::new(),
            powerline_network_tilesets: HashMap::new(),
            hydrography_network_tilesets: HashMap::new(),
            gt_model_tilesets: HashMap::new(),
            gs_model_tilesets: HashMap::new(),
            processed_parent_imagery: HashMap::new(),
            processed_model_textures: HashSet::new(),
            gt_models_to_gltf: HashMap::new(),
            default_dataset_to_combine: Vec::new(),
        })
    }

    pub fn options(&self) -> &ConverterOptions {
        &self.options
    }

    pub fn materials_mut(&mut self) -> &mut MaterialsIndex {
        &mut self.materials
    }

    pub fn materials(&self) -> &MaterialsIndex {
        &self.materials
    }

    /// Registers the output directories of every dataset for `geocell` and
    /// resets the per-geocell availability state.
    pub fn begin_geo_cell(&mut self, geocell: &GeoCell) {
        self.availability.clear();
        self.dataset_dirs.clear();

        let geocell_dir = self.output_path.join(geocell.relative_path());
        let elevation = geocell_dir.join(ELEVATIONS_PATH);
        let gt_model = geocell_dir.join(GTMODEL_PATH);
        let gs_model = geocell_dir.join(GSMODEL_PATH);
        let road = geocell_dir.join(ROAD_NETWORK_PATH);
        let railroad = geocell_dir.join(RAILROAD_NETWORK_PATH);
        let powerline = geocell_dir.join(POWERLINE_NETWORK_PATH);
        let hydrography = geocell_dir.join(HYDROGRAPHY_NETWORK_PATH);

        self.dataset_dirs.insert(Dataset::Elevation, elevation);
        self.dataset_dirs.insert(Dataset::GSFeature, gs_model.clone());
        self.dataset_dirs
            .insert(Dataset::GSModelGeometry, gs_model.clone());
        self.dataset_dirs.insert(Dataset::GSModelTexture, gs_model);
        self.dataset_dirs.insert(Dataset::GTFeature, gt_model.clone());
        self.dataset_dirs
            .insert(Dataset::GTModelGeometry500, gt_model.clone());
        self.dataset_dirs.insert(Dataset::GTModelTexture, gt_model);
        self.dataset_dirs.insert(Dataset::RoadNetwork, road);
        self.dataset_dirs.insert(Dataset::RailRoadNetwork, railroad);
        self.dataset_dirs
            .insert(Dataset::PowerlineNetwork, powerline);
        self.dataset_dirs
            .insert(Dataset::HydrographyNetwork, hydrography);
    }

    pub fn dataset_dir(&self, dataset: Dataset) -> Option<PathBuf> {
        self.dataset_dirs.get(&dataset).cloned()
    }

    /// Forgets the adopted ancestor imagery; called once the geocell's
    /// elevation stream is flushed.
    pub fn clear_parent_imagery_cache(&mut self) {
        self.processed_parent_imagery.clear();
    }

    pub fn take_default_datasets_to_combine(&mut self) -> Vec<PathBuf> {
        std::mem::take(&mut self.default_dataset_to_combine)
    }

    fn collections_mut(&mut self, kind: CollectionKind) -> &mut HashMap<GeoCell, TilesetCollection> {
        match kind {
            CollectionKind::Elevation => &mut self.elevation_tilesets,
            CollectionKind::RoadNetwork => &mut self.road_network_tilesets,
            CollectionKind::RailRoadNetwork => &mut self.railroad_network_tilesets,
            CollectionKind::PowerlineNetwork => &mut self.powerline_network_tilesets,
            CollectionKind::HydrographyNetwork => &mut self.hydrography_network_tilesets,
            CollectionKind::GtModel => &mut self.gt_model_tilesets,
            CollectionKind::GsModel => &mut self.gs_model_tilesets,
        }
    }

    /// Resolves (lazily creating) the CS output directory and hands the
    /// tileset out by value; `put_tileset` returns it.
    fn take_tileset(
        &mut self,
        kind: CollectionKind,
        tile: &Tile,
        collection_output_directory: &Path,
    ) -> Result<(Tileset, PathBuf)> {
        let collection = self
            .collections_mut(kind)
            .entry(*tile.geocell())
            .or_default();
        let cs_hash = hash_component_selectors(tile.cs_1(), tile.cs_2());

        let path = match collection.cs_to_paths.get(&cs_hash) {
            Some(path) => path.clone(),
            None => {
                let path = cs_directory(tile.cs_1(), tile.cs_2(), collection_output_directory);
                fs::create_dir_all(&path)?;
                collection.cs_to_paths.insert(cs_hash, path.clone());
                path
            }
        };
        let tileset = collection.cs_to_tilesets.remove(&cs_hash).unwrap_or_default();
        Ok((tileset, path))
    }

    fn put_tileset(&mut self, kind: CollectionKind, geocell: GeoCell, tile: &Tile, tileset: Tileset) {
        let cs_hash = hash_component_selectors(tile.cs_1(), tile.cs_2());
        self.collections_mut(kind)
            .entry(geocell)
            .or_default()
            .cs_to_tilesets
            .insert(cs_hash, tileset);
    }

    /// Records `tile` in the availability index. Errors when the tile's
    /// dataset has no tileset collection.
    pub fn add_availability(&mut self, tile: &Tile) -> Result<()> {
        if collection_kind_for_dataset(tile.dataset()).is_none() {
            return Err(Error::UnsupportedDataset(tile.dataset()));
        }
        self.availability.add_availability(tile)
    }

    /// Writes this geocell's `.bin` sidecars and `.subtree` files.
    pub fn flush_availabilities_and_write_subtrees(&mut self) -> Result<()> {
        self.availability.flush_subtrees(&self.dataset_dirs)
    }

    // ---------------- Elevation ----------------

    pub fn add_elevation_to_tileset_collection(
        &mut self,
        mut elevation: Elevation,
        cdb: &dyn CdbSource,
        collection_output_directory: &Path,
    ) -> Result<()> {
        let tile = elevation.tile().clone();
        let (mut tileset, tileset_directory) =
            self.take_tileset(CollectionKind::Elevation, &tile, collection_output_directory)?;
        let result =
            self.dispatch_elevation(&mut elevation, cdb, &tileset_directory, &mut tileset);
        self.put_tileset(CollectionKind::Elevation, *tile.geocell(), &tile, tileset);
        result
    }

    fn dispatch_elevation(
        &mut self,
        elevation: &mut Elevation,
        cdb: &dyn CdbSource,
        tileset_directory: &Path,
        tileset: &mut Tileset,
    ) -> Result<()> {
        let tile = elevation.tile().clone();
        if let Some(imagery) = cdb.get_imagery(&tile) {
            let imagery_texture = self.create_imagery_texture(&imagery, tileset_directory)?;
            if let Some(rm_texture) = cdb.get_rm_texture(&tile) {
                let feature_id_texture =
                    self.create_feature_id_texture(&rm_texture, tileset_directory)?;
                let descriptor = cdb.get_rm_descriptor(&tile);
                return self.add_elevation_to_tileset(
                    elevation,
                    Some(&imagery_texture),
                    cdb,
                    tileset_directory,
                    tileset,
                    Some(&feature_id_texture),
                    descriptor.as_ref(),
                );
            }
            return self.add_elevation_to_tileset(
                elevation,
                Some(&imagery_texture),
                cdb,
                tileset_directory,
                tileset,
                None,
                None,
            );
        }

        // no imagery of our own: adopt the nearest ancestor's, memoized
        // across siblings
        let mut parent_texture: Option<Texture> = None;
        let mut adopted: Option<Tile> = None;
        let mut current = tile.parent();
        while let Some(ancestor) = current {
            if let Some(texture) = self.processed_parent_imagery.get(&ancestor) {
                parent_texture = Some(texture.clone());
                adopted = Some(ancestor);
                break;
            }
            if let Some(parent_imagery) = cdb.get_imagery(&ancestor) {
                let texture = self.create_imagery_texture(&parent_imagery, tileset_directory)?;
                self.processed_parent_imagery
                    .insert(ancestor.clone(), texture.clone());
                parent_texture = Some(texture);
                adopted = Some(ancestor);
                break;
            }
            current = ancestor.parent();
        }

        // re-index the mesh UVs into the adopted texture's UV space; not
        // needed at negative levels where both cover the whole geocell
        if let Some(ancestor) = &adopted {
            if parent_texture.is_some() && tile.level() > 0 {
                elevation.index_uv_relative_to_parent(ancestor);
            }
        }

        self.add_elevation_to_tileset(
            elevation,
            parent_texture.as_ref(),
            cdb,
            tileset_directory,
            tileset,
            None,
            None,
        )
    }

    fn add_elevation_to_tileset(
        &mut self,
        elevation: &mut Elevation,
        imagery: Option<&Texture>,
        cdb: &dyn CdbSource,
        tileset_directory: &Path,
        tileset: &mut Tileset,
        feature_id_texture: Option<&Texture>,
        material_descriptor: Option<&RmDescriptor>,
    ) -> Result<()> {
        let mesh = elevation.uniform_grid_mesh();
        if mesh.is_empty() {
            return Ok(());
        }

        let target_index_count =
            (mesh.indices.len() as f32 * self.options.elevation_threshold_indices) as usize;
        let mut simplified = elevation
            .create_simplified_mesh(target_index_count, self.options.elevation_decimate_error);
        if simplified.is_empty() {
            simplified = mesh.clone();
        }

        if self.options.elevation_normal {
            generate_normals(&mut simplified);
        }

        // carry the real height interval on the emitted tile
        let mut tile = elevation.tile().clone();
        let mut region = *tile.bound_region();
        region.min_height = elevation.min_elevation();
        region.max_height = elevation.max_elevation();
        tile.set_bound_region(region);
        elevation.set_tile(tile.clone());

        let gltf = if let Some(imagery) = imagery {
            let material = MaterialSpec {
                double_sided: true,
                unlit: !self.options.elevation_normal,
                texture: Some(0),
            };
            simplified.material = Some(0);
            let mut gltf = tileio::create_gltf(
                &simplified,
                Some(&material),
                Some(imagery),
                self.options.use_3d_tiles_next,
                feature_id_texture,
            );
            if let (Some(_), Some(descriptor)) = (feature_id_texture, material_descriptor) {
                self.materials.add_feature_table_to_gltf(
                    descriptor,
                    &mut gltf,
                    self.options.external_schema,
                );
            }
            gltf
        } else {
            tileio::create_gltf(&simplified, None, None, self.options.use_3d_tiles_next, None)
        };

        if self.options.use_3d_tiles_next {
            self.create_gltf_for_tileset(&gltf, tile, None, tileset_directory, tileset)?;
        } else {
            self.create_b3dm_for_tileset(&gltf, tile, None, tileset_directory, tileset)?;
        }

        if elevation.tile().level() < 0 {
            self.fill_missing_negative_lod_elevation(elevation, cdb, tileset_directory, tileset)
        } else {
            self.fill_missing_positive_lod_elevation(
                elevation,
                imagery,
                cdb,
                tileset_directory,
                tileset,
            )
        }
    }

    /// Quadrant hole filling: where child elevation is absent but either a
    /// sibling's elevation or finer imagery exists, synthesize sub-region
    /// tiles trimmed out of the current mesh.
    fn fill_missing_positive_lod_elevation(
        &mut self,
        elevation: &Elevation,
        current_imagery: Option<&Texture>,
        cdb: &dyn CdbSource,
        tileset_directory: &Path,
        tileset: &mut Tileset,
    ) -> Result<()> {
        let tile = elevation.tile().clone();
        if tile.level() >= MAX_LEVEL {
            return Ok(());
        }
        let nw = tile.nw_for_positive_lod();
        let ne = tile.ne_for_positive_lod();
        let sw = tile.sw_for_positive_lod();
        let se = tile.se_for_positive_lod();

        let nw_exist = cdb.is_elevation_exist(&nw);
        let ne_exist = cdb.is_elevation_exist(&ne);
        let sw_exist = cdb.is_elevation_exist(&sw);
        let se_exist = cdb.is_elevation_exist(&se);
        let should_fill_hole = nw_exist || ne_exist || sw_exist || se_exist;

        // when only elevation LOD matters, finer imagery alone does not
        // force synthesis
        let has_more_imagery = if self.options.elevation_lod {
            false
        } else {
            cdb.is_imagery_exist(&nw)
                || cdb.is_imagery_exist(&ne)
                || cdb.is_imagery_exist(&sw)
                || cdb.is_imagery_exist(&se)
        };

        if !(should_fill_hole || has_more_imagery) {
            return Ok(());
        }

        type SubRegionFn = fn(&Elevation, bool) -> Option<Elevation>;
        let quadrants: [(&Tile, bool, SubRegionFn); 4] = [
            (&nw, nw_exist, Elevation::create_north_west_sub_region),
            (&ne, ne_exist, Elevation::create_north_east_sub_region),
            (&se, se_exist, Elevation::create_south_east_sub_region),
            (&sw, sw_exist, Elevation::create_south_west_sub_region),
        ];
        for (quadrant_tile, exists, create_sub_region) in quadrants {
            if exists {
                continue;
            }
            let sub_region_imagery = cdb.get_imagery(quadrant_tile);
            let reindex_uv = sub_region_imagery.is_some();
            if let Some(mut sub_region) = create_sub_region(elevation, reindex_uv) {
                self.add_sub_region_elevation_to_tileset(
                    &mut sub_region,
                    cdb,
                    sub_region_imagery,
                    current_imagery,
                    tileset_directory,
                    tileset,
                )?;
            }
        }
        Ok(())
    }

    /// Negative-LOD hole filling: when imagery continues below the coarsest
    /// elevation, reuse the current mesh retitled to the child coordinate.
    fn fill_missing_negative_lod_elevation(
        &mut self,
        elevation: &mut Elevation,
        cdb: &dyn CdbSource,
        output_directory: &Path,
        tileset: &mut Tileset,
    ) -> Result<()> {
        let child = elevation.tile().child_for_negative_lod();
        if cdb.is_elevation_exist(&child) || self.options.elevation_lod {
            return Ok(());
        }
        if let Some(child_imagery) = cdb.get_imagery(&child) {
            let imagery_texture = self.create_imagery_texture(&child_imagery, output_directory)?;
            elevation.set_tile(child);
            self.add_elevation_to_tileset(
                elevation,
                Some(&imagery_texture),
                cdb,
                output_directory,
                tileset,
                None,
                None,
            )?;
        }
        Ok(())
    }

    /// A synthesized quadrant uses its own imagery when it has one, else
    /// the parent's texture, else goes untextured.
    fn add_sub_region_elevation_to_tileset(
        &mut self,
        sub_region: &mut Elevation,
        cdb: &dyn CdbSource,
        sub_region_imagery: Option<Imagery>,
        parent_texture: Option<&Texture>,
        output_directory: &Path,
        tileset: &mut Tileset,
    ) -> Result<()> {
        if let Some(imagery) = sub_region_imagery {
            let sub_region_texture = self.create_imagery_texture(&imagery, output_directory)?;
            self.add_elevation_to_tileset(
                sub_region,
                Some(&sub_region_texture),
                cdb,
                output_directory,
                tileset,
                None,
                None,
            )
        } else {
            self.add_elevation_to_tileset(
                sub_region,
                parent_texture,
                cdb,
                output_directory,
                tileset,
                None,
                None,
            )
        }
    }

    fn create_imagery_texture(
        &self,
        imagery: &Imagery,
        tileset_output_directory: &Path,
    ) -> Result<Texture> {
        let file_name = format!(
            "{}.{}",
            imagery.tile.file_name_with_non_zero_padded_level(),
            imagery.data.format.extension()
        );
        let relative_path = PathBuf::from(MODEL_TEXTURE_SUB_DIR).join(file_name);
        fs::create_dir_all(tileset_output_directory.join(MODEL_TEXTURE_SUB_DIR))?;
        fs::write(
            tileset_output_directory.join(&relative_path),
            &imagery.data.bytes,
        )?;

        Ok(Texture {
            uri: relative_path,
            mag_filter: TextureFilter::Linear,
            min_filter: TextureFilter::LinearMipmapNearest,
        })
    }

    fn create_feature_id_texture(
        &self,
        rm_texture: &RmTexture,
        tileset_output_directory: &Path,
    ) -> Result<Texture> {
        let file_name = format!(
            "{}.{}",
            rm_texture.tile.file_name_with_non_zero_padded_level(),
            rm_texture.data.format.extension()
        );
        let relative_path = PathBuf::from(MODEL_TEXTURE_SUB_DIR).join(file_name);
        fs::create_dir_all(tileset_output_directory.join(MODEL_TEXTURE_SUB_DIR))?;
        fs::write(
            tileset_output_directory.join(&relative_path),
            &rm_texture.data.bytes,
        )?;

        // feature IDs must not be interpolated
        Ok(Texture {
            uri: relative_path,
            mag_filter: TextureFilter::Nearest,
            min_filter: TextureFilter::NearestMipmapNearest,
        })
    }

    // ---------------- Vector networks ----------------

    pub fn add_vector_to_tileset_collection(
        &mut self,
        vectors: &GeometryVectors,
        collection_output_directory: &Path,
        kind: CollectionKind,
    ) -> Result<()> {
        if vectors.mesh.is_empty() {
            return Ok(());
        }
        let tile = vectors.tile.clone();
        let (mut tileset, tileset_directory) =
            self.take_tileset(kind, &tile, collection_output_directory)?;

        let gltf =
            tileio::create_gltf(&vectors.mesh, None, None, self.options.use_3d_tiles_next, None);
        let result = if self.options.use_3d_tiles_next {
            self.create_gltf_for_tileset(
                &gltf,
                tile.clone(),
                Some(&vectors.instances),
                &tileset_directory,
                &mut tileset,
            )
        } else {
            self.create_b3dm_for_tileset(
                &gltf,
                tile.clone(),
                Some(&vectors.instances),
                &tileset_directory,
                &mut tileset,
            )
        };
        self.put_tileset(kind, *tile.geocell(), &tile, tileset);
        result
    }

    // ---------------- GT models ----------------

    pub fn add_gt_model_to_tileset_collection(
        &mut self,
        model: &GtModels,
        collection_output_directory: &Path,
    ) -> Result<()> {
        let tile = model.tile().clone();
        let (mut tileset, tileset_directory) =
            self.take_tileset(CollectionKind::GtModel, &tile, collection_output_directory)?;
        let result =
            self.emit_gt_model_tile(model, tile.clone(), &tileset_directory, &mut tileset);
        self.put_tileset(CollectionKind::GtModel, *tile.geocell(), &tile, tileset);
        result
    }

    fn emit_gt_model_tile(
        &mut self,
        model: &GtModels,
        mut tile: Tile,
        tileset_directory: &Path,
        tileset: &mut Tileset,
    ) -> Result<()> {
        let gltf_output_dir = tileset_directory.join(MODEL_GLTF_SUB_DIR);
        fs::create_dir_all(&gltf_output_dir)?;

        // emit each unique library model once, group instances by model
        let mut instances: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for index in 0..model.model_keys.len() {
            let Some((key, model_3d)) = model.locate_model_3d(index) else {
                continue;
            };
            if !self.gt_models_to_gltf.contains_key(key) {
                let textures = self.write_model_textures(
                    &model_3d.textures,
                    &model_3d.images,
                    Path::new(MODEL_TEXTURE_SUB_DIR),
                    &gltf_output_dir,
                )?;
                let mut textured = model_3d.clone();
                textured.textures = textures;
                let gltf =
                    tileio::create_gltf_from_model(&textured, self.options.use_3d_tiles_next);

                let model_gltf_uri = PathBuf::from(MODEL_GLTF_SUB_DIR).join(format!("{key}.glb"));
                let file = fs::File::create(tileset_directory.join(&model_gltf_uri))?;
                let mut writer = BufWriter::new(file);
                tileio::write_glb(&gltf, &mut writer)?;
                self.gt_models_to_gltf
                    .insert(key.to_string(), model_gltf_uri);
                debug!("emitted GT library model {key}");
            }
            instances.entry(key.to_string()).or_default().push(index);
        }

        let tile_file_name = tile.file_name_with_non_zero_padded_level();
        if self.options.use_3d_tiles_next {
            // one glTF per tile, instancing each referenced model
            let groups: Vec<(&crate::cdb::Model3D, Vec<glam::DVec3>)> = instances
                .iter()
                .filter_map(|(key, indices)| {
                    model.models.get(key).map(|m| {
                        let positions = indices
                            .iter()
                            .filter_map(|&i| model.attributes.positions.get(i).copied())
                            .collect();
                        (m, positions)
                    })
                })
                .collect();
            let gltf = tileio::create_instanced_gltf(&groups);

            let gltf_path = PathBuf::from(format!("{tile_file_name}.glb"));
            let file = fs::File::create(tileset_directory.join(&gltf_path))?;
            let mut writer = BufWriter::new(file);
            tileio::write_glb(&gltf, &mut writer)?;
            tile.set_custom_content_uri(gltf_path);
        } else {
            // I3DM per model, composed into one CMPT
            let mut inner_tiles = Vec::with_capacity(instances.len());
            for (key, indices) in &instances {
                let gltf_uri = self.gt_models_to_gltf[key].to_string_lossy().into_owned();
                let mut bytes = Vec::new();
                tileio::write_i3dm(&gltf_uri, &model.attributes, indices, &mut bytes)?;
                inner_tiles.push(bytes);
            }
            let cmpt_path = PathBuf::from(format!("{tile_file_name}.cmpt"));
            let file = fs::File::create(tileset_directory.join(&cmpt_path))?;
            let mut writer = BufWriter::new(file);
            tileio::write_cmpt(&inner_tiles, &mut writer)?;
            tile.set_custom_content_uri(cmpt_path);
        }

        if self.options.use_3d_tiles_next && tile.level() >= 0 {
            self.add_availability(&tile)?;
        }
        tileset.insert_tile(tile);
        Ok(())
    }

    // ---------------- GS models ----------------

    pub fn add_gs_model_to_tileset_collection(
        &mut self,
        model: &GsModels,
        collection_output_directory: &Path,
    ) -> Result<()> {
        let tile = model.tile.clone();
        let (mut tileset, tileset_directory) =
            self.take_tileset(CollectionKind::GsModel, &tile, collection_output_directory)?;

        let result = (|| {
            let textures = self.write_model_textures(
                &model.model.textures,
                &model.model.images,
                Path::new(MODEL_TEXTURE_SUB_DIR),
                &tileset_directory,
            )?;
            let mut textured = model.model.clone();
            textured.textures = textures;
            let gltf = tileio::create_gltf_from_model(&textured, self.options.use_3d_tiles_next);
            if self.options.use_3d_tiles_next {
                self.create_gltf_for_tileset(
                    &gltf,
                    tile.clone(),
                    Some(&model.instances),
                    &tileset_directory,
                    &mut tileset,
                )
            } else {
                self.create_b3dm_for_tileset(
                    &gltf,
                    tile.clone(),
                    Some(&model.instances),
                    &tileset_directory,
                    &mut tileset,
                )
            }
        })();
        self.put_tileset(CollectionKind::GsModel, *tile.geocell(), &tile, tileset);
        result
    }

    /// Writes a model's texture images next to the glTF, skipping files
    /// already emitted, and rebases the texture URIs.
    fn write_model_textures(
        &mut self,
        model_textures: &[Texture],
        images: &[crate::cdb::EncodedRaster],
        texture_sub_dir: &Path,
        gltf_path: &Path,
    ) -> Result<Vec<Texture>> {
        debug_assert_eq!(model_textures.len(), images.len());
        fs::create_dir_all(gltf_path.join(texture_sub_dir))?;

        let mut textures = model_textures.to_vec();
        for (texture, image) in textures.iter_mut().zip(images) {
            let relative_path = texture_sub_dir.join(&texture.uri);
            let absolute_path = gltf_path.join(&relative_path);
            if self.processed_model_textures.insert(absolute_path.clone()) {
                fs::write(&absolute_path, &image.bytes)?;
            }
            texture.uri = relative_path;
        }
        Ok(textures)
    }

    // ---------------- Content registration ----------------

    fn create_b3dm_for_tileset(
        &mut self,
        gltf: &Gltf,
        mut tile: Tile,
        instances: Option<&InstancesAttributes>,
        output_directory: &Path,
        tileset: &mut Tileset,
    ) -> Result<()> {
        let b3dm = format!("{}.b3dm", tile.file_name_with_non_zero_padded_level());
        let file = fs::File::create(output_directory.join(&b3dm))?;
        let mut writer = BufWriter::new(file);
        tileio::write_b3dm(gltf, instances, &mut writer)?;
        tile.set_custom_content_uri(PathBuf::from(b3dm));

        if self.options.use_3d_tiles_next && tile.level() >= 0 {
            self.add_availability(&tile)?;
        }
        tileset.insert_tile(tile);
        Ok(())
    }

    fn create_gltf_for_tileset(
        &mut self,
        gltf: &Gltf,
        mut tile: Tile,
        instances: Option<&InstancesAttributes>,
        output_directory: &Path,
        tileset: &mut Tileset,
    ) -> Result<()> {
        let gltf_file = format!("{}.glb", tile.file_name_with_non_zero_padded_level());
        let file = fs::File::create(output_directory.join(&gltf_file))?;
        let mut writer = BufWriter::new(file);
        tileio::write_gltf(gltf, instances, &mut writer)?;
        tile.set_custom_content_uri(PathBuf::from(gltf_file));

        if self.options.use_3d_tiles_next && tile.level() >= 0 {
            self.add_availability(&tile)?;
        }
        tileset.insert_tile(tile);
        Ok(())
    }

    // ---------------- Flush ----------------

    /// Serializes every CS tileset of `geocell` in `kind`'s collection to
    /// its `<geocell>_<dataset>.json`, records the path for the global
    /// combination step, and drops the collection.
    pub fn flush_tileset_collection(
        &mut self,
        geocell: &GeoCell,
        kind: CollectionKind,
        replace: bool,
    ) -> Result<()> {
        let Some(collection) = self.collections_mut(kind).remove(geocell) else {
            return Ok(());
        };

        for (cs_hash, tileset) in &collection.cs_to_tilesets {
            let Some(root) = tileset.root() else {
                continue;
            };
            let max_level = tileset.max_populated_level();

            let tileset_directory = &collection.cs_to_paths[cs_hash];
            let tileset_json_path =
                tileset_directory.join(format!("{}.json", root.geocell_dataset_name()));

            let file = fs::File::create(&tileset_json_path)?;
            let mut writer = BufWriter::new(file);
            write_tileset_json(
                tileset,
                replace,
                &mut writer,
                self.options.use_3d_tiles_next,
                self.options.subtree_levels,
                max_level,
            )?;

            // store relative to the output root for the combination step
            let relative = tileset_json_path
                .strip_prefix(&self.output_path)
                .unwrap_or(&tileset_json_path)
                .to_path_buf();
            info!("wrote tileset {}", relative.display());
            self.default_dataset_to_combine.push(relative);
        }
        Ok(())
    }
}
