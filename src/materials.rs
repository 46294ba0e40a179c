// src/materials.rs
//! Boundary to the CDB Materials metadata.
//!
//! `Metadata/Materials.xml` enumerates the base materials a store's
//! raster-material descriptors compose. The converter only needs the
//! ordered name list: composite materials reference base materials by
//! index in the emitted metadata, and the schema sidecar spells the
//! enumeration out for clients.

use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use crate::cdb::RmDescriptor;
use crate::error::Result;
use crate::tileio::Gltf;

pub const MATERIALS_SCHEMA_NAME: &str = "materials.json";

/// Index of the base materials declared by a CDB store.
#[derive(Debug, Clone, Default)]
pub struct MaterialsIndex {
    base_materials: Vec<String>,
}

static BASE_MATERIAL_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<Name>\s*([A-Za-z0-9_]+)\s*</Name>").unwrap());

impl MaterialsIndex {
    pub fn is_empty(&self) -> bool {
        self.base_materials.is_empty()
    }

    pub fn base_materials(&self) -> &[String] {
        &self.base_materials
    }

    fn base_material_index(&self, name: &str) -> Option<usize> {
        self.base_materials.iter().position(|m| m == name)
    }

    /// Scans a `Materials.xml` for its base-material names, in file order.
    pub fn read_base_materials_file(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)?;
        for capture in BASE_MATERIAL_NAME.captures_iter(&text) {
            let name = capture[1].to_string();
            if self.base_material_index(&name).is_none() {
                self.base_materials.push(name);
            }
        }
        Ok(())
    }

    /// The metadata schema describing base and composite materials.
    pub fn generate_schema(&self) -> Value {
        let values: Vec<Value> = self
            .base_materials
            .iter()
            .enumerate()
            .map(|(value, name)| json!({ "name": name, "value": value }))
            .collect();
        json!({
            "id": "CDBMaterials",
            "enums": {
                "CDBBaseMaterial": {
                    "valueType": "UINT8",
                    "values": values,
                }
            },
            "classes": {
                "CDBCompositeMaterial": {
                    "properties": {
                        "name": { "type": "STRING" },
                        "substrates": {
                            "type": "ENUM",
                            "enumType": "CDBBaseMaterial",
                            "array": true,
                        },
                        "weights": {
                            "type": "SCALAR",
                            "componentType": "UINT8",
                            "array": true,
                        },
                    }
                }
            }
        })
    }

    /// Merges a descriptor's composite-material table into an assembled
    /// glTF, inlining the schema or pointing at the sidecar.
    pub fn add_feature_table_to_gltf(
        &self,
        descriptor: &RmDescriptor,
        gltf: &mut Gltf,
        external_schema: bool,
    ) {
        let mut names = Vec::new();
        let mut substrates = Vec::new();
        let mut weights = Vec::new();
        for composite in &descriptor.composite_materials {
            names.push(composite.name.clone());
            let (mut bases, mut ws): (Vec<Value>, Vec<Value>) = (Vec::new(), Vec::new());
            for (base, weight) in &composite.substrates {
                bases.push(json!(self.base_material_index(base)));
                ws.push(json!(weight));
            }
            substrates.push(Value::Array(bases));
            weights.push(Value::Array(ws));
        }

        let mut metadata = json!({
            "propertyTables": [{
                "class": "CDBCompositeMaterial",
                "count": names.len(),
                "properties": {
                    "name": names,
                    "substrates": substrates,
                    "weights": weights,
                }
            }]
        });
        if external_schema {
            metadata["schemaUri"] = json!(MATERIALS_SCHEMA_NAME);
        } else {
            metadata["schema"] = self.generate_schema();
        }

        gltf.json["extensions"]["EXT_structural_metadata"] = metadata;
        let mut used = gltf.json["extensionsUsed"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        if !used.iter().any(|e| e == "EXT_structural_metadata") {
            used.push(json!("EXT_structural_metadata"));
        }
        gltf.json["extensionsUsed"] = json!(used);
    }
}
