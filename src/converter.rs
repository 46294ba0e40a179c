// src/converter.rs
//! Single entry point of the conversion: walk every geocell, drain the
//! dataset streams in order, flush per dataset, then stitch the
//! per-geocell tilesets into global combined tilesets.

use std::collections::BTreeMap;
use std::fs;
use std::io::BufWriter;
use std::path::PathBuf;

use log::info;

use crate::builder::{CollectionKind, ConverterOptions, TilesetBuilder};
use crate::cdb::CdbSource;
use crate::dataset::{parse_combine_token, Dataset};
use crate::error::Result;
use crate::materials::MATERIALS_SCHEMA_NAME;
use crate::tile::BoundingRegion;
use crate::tileset::combine_tileset_json;

pub struct Converter {
    output_path: PathBuf,
    options: ConverterOptions,
    requested_datasets_to_combine: Vec<Vec<String>>,
}

impl Converter {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
            options: ConverterOptions::default(),
            requested_datasets_to_combine: Vec::new(),
        }
    }

    pub fn set_use_3d_tiles_next(&mut self, use_3d_tiles_next: bool) {
        self.options.use_3d_tiles_next = use_3d_tiles_next;
    }

    pub fn set_external_schema(&mut self, external_schema: bool) {
        self.options.external_schema = external_schema;
    }

    pub fn set_generate_elevation_normal(&mut self, elevation_normal: bool) {
        self.options.elevation_normal = elevation_normal;
    }

    pub fn set_elevation_lod_only(&mut self, elevation_lod: bool) {
        self.options.elevation_lod = elevation_lod;
    }

    pub fn set_subtree_levels(&mut self, subtree_levels: u32) {
        self.options.subtree_levels = subtree_levels;
    }

    pub fn set_elevation_threshold_indices(&mut self, threshold: f32) {
        self.options.elevation_threshold_indices = threshold;
    }

    pub fn set_elevation_decimate_error(&mut self, error: f32) {
        self.options.elevation_decimate_error = error;
    }

    /// Requests the listed `{DatasetName}_{CS1}_{CS2}` tilesets to be
    /// combined into one. Every token is validated; a single-element
    /// request is a no-op since per-dataset combination happens anyway.
    pub fn combine_dataset(&mut self, datasets: &[String]) -> Result<()> {
        for token in datasets {
            parse_combine_token(token)?;
        }
        if datasets.len() == 1 {
            return Ok(());
        }
        self.requested_datasets_to_combine.push(datasets.to_vec());
        Ok(())
    }

    /// Runs the conversion against `cdb`, writing under the output path.
    pub fn convert(&mut self, cdb: &dyn CdbSource) -> Result<()> {
        let mut builder = TilesetBuilder::new(&self.output_path, self.options.clone())?;

        let mut combined_tilesets: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut combined_tilesets_regions: BTreeMap<String, Vec<BoundingRegion>> = BTreeMap::new();
        let mut aggregate_tilesets_region: BTreeMap<String, BoundingRegion> = BTreeMap::new();

        let materials_xml_path = cdb.materials_xml_path();
        if self.options.use_3d_tiles_next {
            if let Some(path) = materials_xml_path.as_deref().filter(|p| p.exists()) {
                builder.materials_mut().read_base_materials_file(path)?;
            }
        }

        cdb.for_each_geo_cell(&mut |geocell| {
            info!("converting geocell {geocell}");
            builder.begin_geo_cell(&geocell);

            let streams: [(CollectionKind, Dataset, bool); 7] = [
                (CollectionKind::Elevation, Dataset::Elevation, true),
                (CollectionKind::RoadNetwork, Dataset::RoadNetwork, true),
                (CollectionKind::RailRoadNetwork, Dataset::RailRoadNetwork, true),
                (CollectionKind::PowerlineNetwork, Dataset::PowerlineNetwork, true),
                (CollectionKind::HydrographyNetwork, Dataset::HydrographyNetwork, true),
                (CollectionKind::GtModel, Dataset::GTFeature, true),
                (CollectionKind::GsModel, Dataset::GSModelGeometry, false),
            ];
            for (kind, dataset, replace) in streams {
                let Some(dir) = builder.dataset_dir(dataset) else {
                    continue;
                };
                match kind {
                    CollectionKind::Elevation => {
                        cdb.for_each_elevation_tile(&geocell, &mut |elevation| {
                            builder.add_elevation_to_tileset_collection(elevation, cdb, &dir)
                        })?;
                    }
                    CollectionKind::RoadNetwork => {
                        cdb.for_each_road_network_tile(&geocell, &mut |vectors| {
                            builder.add_vector_to_tileset_collection(&vectors, &dir, kind)
                        })?;
                    }
                    CollectionKind::RailRoadNetwork => {
                        cdb.for_each_railroad_network_tile(&geocell, &mut |vectors| {
                            builder.add_vector_to_tileset_collection(&vectors, &dir, kind)
                        })?;
                    }
                    CollectionKind::PowerlineNetwork => {
                        cdb.for_each_powerline_network_tile(&geocell, &mut |vectors| {
                            builder.add_vector_to_tileset_collection(&vectors, &dir, kind)
                        })?;
                    }
                    CollectionKind::HydrographyNetwork => {
                        cdb.for_each_hydrography_network_tile(&geocell, &mut |vectors| {
                            builder.add_vector_to_tileset_collection(&vectors, &dir, kind)
                        })?;
                    }
                    CollectionKind::GtModel => {
                        cdb.for_each_gt_model_tile(&geocell, &mut |model| {
                            builder.add_gt_model_to_tileset_collection(&model, &dir)
                        })?;
                    }
                    CollectionKind::GsModel => {
                        cdb.for_each_gs_model_tile(&geocell, &mut |model| {
                            builder.add_gs_model_to_tileset_collection(&model, &dir)
                        })?;
                    }
                }
                builder.flush_tileset_collection(&geocell, kind, replace)?;
                if kind == CollectionKind::Elevation {
                    builder.clear_parent_imagery_cache();
                }
            }

            builder.flush_availabilities_and_write_subtrees()?;

            // book-keep this geocell's tilesets for the combination pass
            let geocell_region = BoundingRegion::whole_geocell(&geocell);
            for tileset_json_path in builder.take_default_datasets_to_combine() {
                let Some(combined_name) = combined_tileset_name(&tileset_json_path) else {
                    continue;
                };
                combined_tilesets
                    .entry(combined_name.clone())
                    .or_default()
                    .push(tileset_json_path.to_string_lossy().into_owned());
                combined_tilesets_regions
                    .entry(combined_name.clone())
                    .or_default()
                    .push(geocell_region);
                aggregate_tilesets_region
                    .entry(combined_name)
                    .and_modify(|region| *region = region.union(&geocell_region))
                    .or_insert(geocell_region);
            }
            Ok(())
        })?;

        // combine the per-geocell tilesets of each dataset_CS group
        for (combined_name, uris) in &combined_tilesets {
            let file = fs::File::create(self.output_path.join(format!("{combined_name}.json")))?;
            let mut writer = BufWriter::new(file);
            combine_tileset_json(uris, &combined_tilesets_regions[combined_name], &mut writer)?;
        }

        // combine the user-requested groups
        for requested in &self.requested_datasets_to_combine {
            let combined_file_name = if self.requested_datasets_to_combine.len() > 1 {
                format!("{}.json", requested.concat())
            } else {
                "tileset.json".to_string()
            };

            let mut existing = Vec::new();
            let mut regions = Vec::new();
            for token in requested {
                if let Some(region) = aggregate_tilesets_region.get(token) {
                    existing.push(format!("{token}.json"));
                    regions.push(*region);
                }
            }

            let file = fs::File::create(self.output_path.join(combined_file_name))?;
            let mut writer = BufWriter::new(file);
            combine_tileset_json(&existing, &regions, &mut writer)?;
        }

        if self.options.external_schema {
            if materials_xml_path.as_deref().is_some_and(|p| p.exists()) {
                let schema = builder.materials().generate_schema();
                fs::write(
                    self.output_path.join(MATERIALS_SCHEMA_NAME),
                    serde_json::to_vec(&schema)?,
                )?;
            }
        }

        Ok(())
    }
}

/// `<geocell>/<dataset>/<CS1_CS2>/<name>.json` to `<dataset>_<CS1_CS2>`.
fn combined_tileset_name(tileset_json_path: &std::path::Path) -> Option<String> {
    let cs_dir = tileset_json_path.parent()?.file_name()?.to_str()?;
    let dataset_dir = tileset_json_path.parent()?.parent()?.file_name()?.to_str()?;
    Some(format!("{dataset_dir}_{cs_dir}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_tileset_name_from_path() {
        let path = std::path::Path::new("N32W118/Elevation/1_1/N32W118_D001.json");
        assert_eq!(
            combined_tileset_name(path).as_deref(),
            Some("Elevation_1_1")
        );
    }

    #[test]
    fn test_combine_dataset_validation() {
        let mut converter = Converter::new("out");
        assert!(converter
            .combine_dataset(&["Elevation_1_1".into()])
            .is_ok());
        // single requests are validated but not queued
        assert!(converter.requested_datasets_to_combine.is_empty());

        assert!(converter
            .combine_dataset(&["Unknown_1_1".into(), "Elevation_1_1".into()])
            .is_err());
        assert!(converter
            .combine_dataset(&["Elevation_1_x".into(), "Elevation_1_1".into()])
            .is_err());

        assert!(converter
            .combine_dataset(&["Elevation_1_1".into(), "RoadNetwork_2_3".into()])
            .is_ok());
        assert_eq!(converter.requested_datasets_to_combine.len(), 1);
    }
}
