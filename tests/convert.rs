//! Driver-level scenarios: a small in-memory CDB store run through the
//! full conversion, asserting on the emitted output tree.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

use cdb_to_3dtiles::cdb::{
    CdbSource, EncodedRaster, GeometryVectors, GsModels, GtModels, Imagery, RasterFormat,
    RmDescriptor, RmTexture,
};
use cdb_to_3dtiles::dataset::Dataset;
use cdb_to_3dtiles::elevation::Elevation;
use cdb_to_3dtiles::error::Result;
use cdb_to_3dtiles::{Converter, GeoCell, Tile};

/// Coordinates within one geocell, dataset-agnostic.
type TileKey = (i32, u32, u32);

#[derive(Default)]
struct MemoryCdb {
    geocells: Vec<GeoCell>,
    elevations: Vec<Elevation>,
    imagery: HashMap<TileKey, Imagery>,
}

impl MemoryCdb {
    fn add_elevation(&mut self, level: i32, uref: u32, rref: u32, height: f64) {
        let geocell = self.geocells[0];
        let tile = Tile::new(geocell, Dataset::Elevation, 1, 1, level, uref, rref);
        let heights = vec![height; 25];
        self.elevations
            .push(Elevation::from_height_grid(tile, 5, 5, &heights));
    }

    fn add_imagery(&mut self, level: i32, uref: u32, rref: u32) {
        let geocell = self.geocells[0];
        let tile = Tile::new(geocell, Dataset::Imagery, 1, 1, level, uref, rref);
        self.imagery.insert(
            (level, uref, rref),
            Imagery {
                tile,
                data: EncodedRaster {
                    format: RasterFormat::Jpeg,
                    // not decoded by the converter; any payload will do
                    bytes: vec![0xff, 0xd8, 0xff, 0xd9],
                },
            },
        );
    }
}

fn key_of(tile: &Tile) -> TileKey {
    (tile.level(), tile.uref(), tile.rref())
}

impl CdbSource for MemoryCdb {
    fn for_each_geo_cell(&self, f: &mut dyn FnMut(GeoCell) -> Result<()>) -> Result<()> {
        for geocell in &self.geocells {
            f(*geocell)?;
        }
        Ok(())
    }

    fn for_each_elevation_tile(
        &self,
        geocell: &GeoCell,
        f: &mut dyn FnMut(Elevation) -> Result<()>,
    ) -> Result<()> {
        for elevation in &self.elevations {
            if elevation.tile().geocell() == geocell {
                f(elevation.clone())?;
            }
        }
        Ok(())
    }

    fn for_each_road_network_tile(
        &self,
        _geocell: &GeoCell,
        _f: &mut dyn FnMut(GeometryVectors) -> Result<()>,
    ) -> Result<()> {
        Ok(())
    }

    fn for_each_railroad_network_tile(
        &self,
        _geocell: &GeoCell,
        _f: &mut dyn FnMut(GeometryVectors) -> Result<()>,
    ) -> Result<()> {
        Ok(())
    }

    fn for_each_powerline_network_tile(
        &self,
        _geocell: &GeoCell,
        _f: &mut dyn FnMut(GeometryVectors) -> Result<()>,
    ) -> Result<()> {
        Ok(())
    }

    fn for_each_hydrography_network_tile(
        &self,
        _geocell: &GeoCell,
        _f: &mut dyn FnMut(GeometryVectors) -> Result<()>,
    ) -> Result<()> {
        Ok(())
    }

    fn for_each_gt_model_tile(
        &self,
        _geocell: &GeoCell,
        _f: &mut dyn FnMut(GtModels) -> Result<()>,
    ) -> Result<()> {
        Ok(())
    }

    fn for_each_gs_model_tile(
        &self,
        _geocell: &GeoCell,
        _f: &mut dyn FnMut(GsModels) -> Result<()>,
    ) -> Result<()> {
        Ok(())
    }

    fn get_imagery(&self, tile: &Tile) -> Option<Imagery> {
        self.imagery.get(&key_of(tile)).cloned()
    }

    fn get_rm_texture(&self, _tile: &Tile) -> Option<RmTexture> {
        None
    }

    fn get_rm_descriptor(&self, _tile: &Tile) -> Option<RmDescriptor> {
        None
    }

    fn is_elevation_exist(&self, tile: &Tile) -> bool {
        let key = key_of(tile);
        self.elevations.iter().any(|e| key_of(e.tile()) == key)
    }

    fn is_imagery_exist(&self, tile: &Tile) -> bool {
        self.imagery.contains_key(&key_of(tile))
    }
}

/// JSON chunk of a GLB on disk.
fn glb_json(path: &Path) -> Value {
    let bytes = fs::read(path).unwrap();
    assert_eq!(&bytes[0..4], b"glTF", "{} is not a GLB", path.display());
    let json_len = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
    serde_json::from_slice(&bytes[20..20 + json_len]).unwrap()
}

fn count_files_with_extension(root: &Path, extension: &str) -> usize {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry.file_type().is_file()
                && entry.path().extension().is_some_and(|e| e == extension)
        })
        .count()
}

#[test]
fn single_elevation_tile_next_mode() -> anyhow::Result<()> {
    let mut cdb = MemoryCdb {
        geocells: vec![GeoCell::new(0, 0)],
        ..Default::default()
    };
    cdb.add_elevation(0, 0, 0, 50.0);

    let out = tempfile::tempdir()?;
    let mut converter = Converter::new(out.path());
    converter.set_use_3d_tiles_next(true);
    converter.set_subtree_levels(7);
    converter.convert(&cdb)?;

    let cs_dir = out.path().join("N00E000/Elevation/1_1");
    assert!(cs_dir
        .join("N00E000_D001_S001_T001_L0_U0_R0.glb")
        .is_file());
    assert!(cs_dir.join("subtrees/0_0_0.subtree").is_file());
    assert!(cs_dir.join("availability/0_0_0.bin").is_file());
    assert!(cs_dir.join("N00E000_D001.json").is_file());
    assert!(out.path().join("Elevation_1_1.json").is_file());

    // exactly one content tile: no imagery anywhere, no hole to fill
    assert_eq!(count_files_with_extension(out.path(), "glb"), 1);

    let tileset: Value = serde_json::from_slice(&fs::read(cs_dir.join("N00E000_D001.json"))?)?;
    assert_eq!(tileset["asset"]["version"], "1.0");
    assert_eq!(
        tileset["root"]["content"]["uri"],
        "N00E000_D001_S001_T001_L0_U0_R0.glb"
    );
    // height interval carried onto the region
    let region = tileset["root"]["boundingVolume"]["region"]
        .as_array()
        .unwrap();
    assert_eq!(region[4].as_f64().unwrap(), 50.0);
    assert_eq!(region[5].as_f64().unwrap(), 50.0);
    assert!(tileset["root"]["extensions"]["3DTILES_implicit_tiling"].is_object());

    let combined: Value = serde_json::from_slice(&fs::read(out.path().join("Elevation_1_1.json"))?)?;
    assert_eq!(
        combined["root"]["children"][0]["content"]["uri"],
        "N00E000/Elevation/1_1/N00E000_D001.json"
    );
    Ok(())
}

#[test]
fn hole_filling_synthesizes_quadrants_with_correct_imagery() {
    let mut cdb = MemoryCdb {
        geocells: vec![GeoCell::new(0, 0)],
        ..Default::default()
    };
    cdb.add_elevation(0, 0, 0, 10.0);
    cdb.add_imagery(0, 0, 0); // the parent's own imagery
    cdb.add_imagery(1, 1, 1); // only the NE quadrant has finer imagery

    let out = tempfile::tempdir().unwrap();
    let mut converter = Converter::new(out.path());
    converter.convert(&cdb).unwrap();

    let cs_dir = out.path().join("N00E000/Elevation/1_1");
    // parent + four synthesized quadrants, classic mode
    assert_eq!(count_files_with_extension(out.path(), "b3dm"), 5);
    for (uref, rref) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
        assert!(
            cs_dir
                .join(format!("N00E000_D001_S001_T001_L1_U{uref}_R{rref}.b3dm"))
                .is_file(),
            "missing quadrant U{uref} R{rref}"
        );
    }

    // both imagery files were written
    assert!(cs_dir
        .join("Textures/N00E000_D004_S001_T001_L0_U0_R0.jpeg")
        .is_file());
    assert!(cs_dir
        .join("Textures/N00E000_D004_S001_T001_L1_U1_R1.jpeg")
        .is_file());

    // NE references its own imagery, the other quadrants reuse the parent's
    let b3dm_gltf = |name: &str| -> Value {
        let bytes = fs::read(cs_dir.join(name)).unwrap();
        let ft_len = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
        let glb = &bytes[28 + ft_len..];
        let json_len = u32::from_le_bytes(glb[12..16].try_into().unwrap()) as usize;
        serde_json::from_slice(&glb[20..20 + json_len]).unwrap()
    };
    let ne = b3dm_gltf("N00E000_D001_S001_T001_L1_U1_R1.b3dm");
    assert_eq!(
        ne["images"][0]["uri"],
        "Textures/N00E000_D004_S001_T001_L1_U1_R1.jpeg"
    );
    for name in [
        "N00E000_D001_S001_T001_L1_U1_R0.b3dm",
        "N00E000_D001_S001_T001_L1_U0_R0.b3dm",
        "N00E000_D001_S001_T001_L1_U0_R1.b3dm",
    ] {
        let quadrant = b3dm_gltf(name);
        assert_eq!(
            quadrant["images"][0]["uri"],
            "Textures/N00E000_D004_S001_T001_L0_U0_R0.jpeg",
            "{name} should reuse the parent texture"
        );
    }

    // the tileset tree has the parent as root with four children
    let tileset: Value =
        serde_json::from_slice(&fs::read(cs_dir.join("N00E000_D001.json")).unwrap()).unwrap();
    assert_eq!(tileset["root"]["children"].as_array().unwrap().len(), 4);
    assert_eq!(tileset["root"]["refine"], "REPLACE");
}

#[test]
fn elevation_lod_only_suppresses_imagery_driven_filling() {
    let mut cdb = MemoryCdb {
        geocells: vec![GeoCell::new(0, 0)],
        ..Default::default()
    };
    cdb.add_elevation(0, 0, 0, 10.0);
    cdb.add_imagery(1, 1, 1);

    let out = tempfile::tempdir().unwrap();
    let mut converter = Converter::new(out.path());
    converter.set_elevation_lod_only(true);
    converter.convert(&cdb).unwrap();

    // no child elevation exists, and imagery alone must not trigger filling
    assert_eq!(count_files_with_extension(out.path(), "b3dm"), 1);
}

#[test]
fn sibling_elevation_triggers_hole_filling_without_imagery() {
    let mut cdb = MemoryCdb {
        geocells: vec![GeoCell::new(0, 0)],
        ..Default::default()
    };
    cdb.add_elevation(0, 0, 0, 10.0);
    cdb.add_elevation(1, 1, 1, 12.0); // NE child exists; other three are holes

    let out = tempfile::tempdir().unwrap();
    let mut converter = Converter::new(out.path());
    converter.convert(&cdb).unwrap();

    // parent, real NE child, three synthesized quadrants
    assert_eq!(count_files_with_extension(out.path(), "b3dm"), 5);
    let cs_dir = out.path().join("N00E000/Elevation/1_1");
    // everything is untextured: no imagery exists at all
    assert!(!cs_dir.join("Textures").exists());
}

#[test]
fn negative_lod_duplicates_mesh_down_to_imagery() {
    let mut cdb = MemoryCdb {
        geocells: vec![GeoCell::new(0, 0)],
        ..Default::default()
    };
    cdb.add_elevation(-2, 0, 0, 5.0);
    cdb.add_imagery(-1, 0, 0);

    let out = tempfile::tempdir().unwrap();
    let mut converter = Converter::new(out.path());
    converter.convert(&cdb).unwrap();

    let cs_dir = out.path().join("N00E000/Elevation/1_1");
    assert!(cs_dir
        .join("N00E000_D001_S001_T001_LC2_U0_R0.b3dm")
        .is_file());
    // the level -1 child reuses the mesh with the finer imagery
    assert!(cs_dir
        .join("N00E000_D001_S001_T001_LC1_U0_R0.b3dm")
        .is_file());
    // imagery stops at level -1, level 0 is not synthesized
    assert!(!cs_dir
        .join("N00E000_D001_S001_T001_L0_U0_R0.b3dm")
        .exists());
}

#[test]
fn single_combine_request_emits_tileset_json() {
    let mut cdb = MemoryCdb {
        geocells: vec![GeoCell::new(0, 0)],
        ..Default::default()
    };
    cdb.add_elevation(0, 0, 0, 10.0);

    let out = tempfile::tempdir().unwrap();
    let mut converter = Converter::new(out.path());
    converter
        .combine_dataset(&["Elevation_1_1".into(), "RoadNetwork_1_1".into()])
        .unwrap();
    converter.convert(&cdb).unwrap();

    let combined: Value =
        serde_json::from_slice(&fs::read(out.path().join("tileset.json")).unwrap()).unwrap();
    let children = combined["root"]["children"].as_array().unwrap();
    // only the elevation group produced output
    assert_eq!(children.len(), 1);
    assert_eq!(children[0]["content"]["uri"], "Elevation_1_1.json");
}

#[test]
fn next_mode_emits_glb_and_availability_for_filled_quadrants() {
    let mut cdb = MemoryCdb {
        geocells: vec![GeoCell::new(0, 0)],
        ..Default::default()
    };
    cdb.add_elevation(0, 0, 0, 10.0);
    cdb.add_imagery(1, 0, 0); // SW quadrant imagery forces synthesis

    let out = tempfile::tempdir().unwrap();
    let mut converter = Converter::new(out.path());
    converter.set_use_3d_tiles_next(true);
    converter.convert(&cdb).unwrap();

    assert_eq!(count_files_with_extension(out.path(), "glb"), 5);

    // five availability bits: the root and its four quadrants
    let cs_dir = out.path().join("N00E000/Elevation/1_1");
    let sidecar = fs::read(cs_dir.join("availability/0_0_0.bin")).unwrap();
    let set_bits: u32 = sidecar.iter().map(|b| b.count_ones()).sum();
    assert_eq!(set_bits, 5);

    // a next-mode tile glb anchors via node translation, not CESIUM_RTC
    let gltf = glb_json(&cs_dir.join("N00E000_D001_S001_T001_L0_U0_R0.glb"));
    assert!(gltf["nodes"][1]["translation"].is_array());
    assert!(gltf.get("extensions").is_none());
}

#[test]
fn b3dm_classic_mode_writes_no_subtrees() {
    let mut cdb = MemoryCdb {
        geocells: vec![GeoCell::new(0, 0)],
        ..Default::default()
    };
    cdb.add_elevation(0, 0, 0, 10.0);

    let out = tempfile::tempdir().unwrap();
    let mut converter = Converter::new(out.path());
    converter.convert(&cdb).unwrap();

    assert_eq!(count_files_with_extension(out.path(), "b3dm"), 1);
    assert_eq!(count_files_with_extension(out.path(), "subtree"), 0);
    assert_eq!(count_files_with_extension(out.path(), "glb"), 0);
}

#[test]
fn two_geocells_combine_into_one_global_tileset() {
    let mut cdb = MemoryCdb {
        geocells: vec![GeoCell::new(0, 0), GeoCell::new(0, 1)],
        ..Default::default()
    };
    cdb.add_elevation(0, 0, 0, 10.0);
    // second geocell's tile
    let tile = Tile::new(GeoCell::new(0, 1), Dataset::Elevation, 1, 1, 0, 0, 0);
    cdb.elevations
        .push(Elevation::from_height_grid(tile, 5, 5, &vec![20.0; 25]));

    let out = tempfile::tempdir().unwrap();
    let mut converter = Converter::new(out.path());
    converter.convert(&cdb).unwrap();

    let combined: Value =
        serde_json::from_slice(&fs::read(out.path().join("Elevation_1_1.json")).unwrap()).unwrap();
    let children = combined["root"]["children"].as_array().unwrap();
    assert_eq!(children.len(), 2);

    let uris: Vec<&str> = children
        .iter()
        .map(|child| child["content"]["uri"].as_str().unwrap())
        .collect();
    assert!(uris.contains(&"N00E000/Elevation/1_1/N00E000_D001.json"));
    assert!(uris.contains(&"N00E001/Elevation/1_1/N00E001_D001.json"));

    // union region spans both cells
    let region = combined["root"]["boundingVolume"]["region"]
        .as_array()
        .unwrap();
    let west = region[0].as_f64().unwrap();
    let east = region[2].as_f64().unwrap();
    assert!((east - west - 2f64.to_radians()).abs() < 1e-9);
}

#[test]
fn output_paths_follow_cdb_layout() {
    let mut cdb = MemoryCdb {
        geocells: vec![GeoCell::new(32, -118)],
        ..Default::default()
    };
    let tile = Tile::new(GeoCell::new(32, -118), Dataset::Elevation, 2, 3, 1, 1, 0);
    cdb.elevations
        .push(Elevation::from_height_grid(tile, 5, 5, &vec![0.0; 25]));

    let out = tempfile::tempdir().unwrap();
    let mut converter = Converter::new(out.path());
    converter.convert(&cdb).unwrap();

    let expected: PathBuf = out
        .path()
        .join("N32W118/Elevation/2_3/N32W118_D001_S002_T003_L1_U1_R0.b3dm");
    assert!(expected.is_file(), "missing {}", expected.display());
}
