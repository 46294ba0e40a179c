// src/tileio.rs
//! Content container writers: GLB, B3DM, I3DM, CMPT.
//!
//! All containers share the same discipline: a fixed little-endian header,
//! a JSON section right-padded with ASCII space, and binary sections
//! zero-padded to the container's alignment (4 bytes inside GLB, 8 bytes
//! for the 3D Tiles containers).
//!
//! GLB layout:
//!   b"glTF"            (4)
//!   version: u32       (4) = 2
//!   length: u32        (4) total container length
//!   JSON chunk: u32 len, u32 0x4E4F534A, payload (space padded to 4)
//!   BIN  chunk: u32 len, u32 0x004E4942, payload (zero padded to 4)
//!
//! The in-memory glTF is a `serde_json::Value` plus one binary buffer;
//! scene-graph assembly happens in [`create_gltf`] and friends.

use std::io::Write;

use serde_json::{json, Value};

use crate::cdb::{InstancesAttributes, MaterialSpec, Model3D, ModelsAttributes, Texture,
                 TextureFilter};
use crate::error::Result;
use crate::mesh::Mesh;

const GLTF_COMPONENT_F32: u32 = 5126;
const GLTF_COMPONENT_U32: u32 = 5125;
const GLTF_TARGET_ARRAY_BUFFER: u32 = 34962;
const GLTF_TARGET_ELEMENT_ARRAY_BUFFER: u32 = 34963;

/// z-up (ECEF) to glTF y-up.
const ZUP_TO_YUP_MATRIX: [i32; 16] = [1, 0, 0, 0, 0, 0, -1, 0, 0, 1, 0, 0, 0, 0, 0, 1];

pub(crate) fn align_to_8(v: usize) -> usize {
    (v + 7) & !7
}

fn align_to_4(v: usize) -> usize {
    (v + 3) & !3
}

/// An assembled glTF: the JSON tree plus its single binary buffer.
#[derive(Debug, Clone)]
pub struct Gltf {
    pub json: Value,
    pub bin: Vec<u8>,
}

fn texture_filter_code(filter: TextureFilter) -> u32 {
    match filter {
        TextureFilter::Nearest => 9728,
        TextureFilter::Linear => 9729,
        TextureFilter::NearestMipmapNearest => 9984,
        TextureFilter::LinearMipmapNearest => 9985,
    }
}

/// Serializes one mesh into buffer views/accessors, returning the mesh
/// entry's primitive JSON. `bin` grows by the mesh payload.
fn push_mesh_primitive(
    mesh: &Mesh,
    material_index: Option<usize>,
    bin: &mut Vec<u8>,
    buffer_views: &mut Vec<Value>,
    accessors: &mut Vec<Value>,
) -> Value {
    let mut attributes = serde_json::Map::new();

    // indices
    let offset = bin.len();
    for index in &mesh.indices {
        bin.extend_from_slice(&index.to_le_bytes());
    }
    buffer_views.push(json!({
        "buffer": 0,
        "byteOffset": offset,
        "byteLength": bin.len() - offset,
        "target": GLTF_TARGET_ELEMENT_ARRAY_BUFFER,
    }));
    accessors.push(json!({
        "bufferView": buffer_views.len() - 1,
        "componentType": GLTF_COMPONENT_U32,
        "count": mesh.indices.len(),
        "type": "SCALAR",
    }));
    let indices_accessor = accessors.len() - 1;

    // positions; POSITION accessors must carry min/max
    let offset = bin.len();
    for p in &mesh.position_rtcs {
        for v in p.to_array() {
            bin.extend_from_slice(&v.to_le_bytes());
        }
    }
    let (min, max) = mesh.rtc_aabb();
    buffer_views.push(json!({
        "buffer": 0,
        "byteOffset": offset,
        "byteLength": bin.len() - offset,
        "target": GLTF_TARGET_ARRAY_BUFFER,
    }));
    accessors.push(json!({
        "bufferView": buffer_views.len() - 1,
        "componentType": GLTF_COMPONENT_F32,
        "count": mesh.position_rtcs.len(),
        "type": "VEC3",
        "min": min.to_array(),
        "max": max.to_array(),
    }));
    attributes.insert("POSITION".into(), json!(accessors.len() - 1));

    if !mesh.normals.is_empty() {
        let offset = bin.len();
        for n in &mesh.normals {
            for v in n.to_array() {
                bin.extend_from_slice(&v.to_le_bytes());
            }
        }
        buffer_views.push(json!({
            "buffer": 0,
            "byteOffset": offset,
            "byteLength": bin.len() - offset,
            "target": GLTF_TARGET_ARRAY_BUFFER,
        }));
        accessors.push(json!({
            "bufferView": buffer_views.len() - 1,
            "componentType": GLTF_COMPONENT_F32,
            "count": mesh.normals.len(),
            "type": "VEC3",
        }));
        attributes.insert("NORMAL".into(), json!(accessors.len() - 1));
    }

    if !mesh.uvs.is_empty() {
        let offset = bin.len();
        for uv in &mesh.uvs {
            // glTF images have v = 0 at the top; our grids count from south
            bin.extend_from_slice(&uv.x.to_le_bytes());
            bin.extend_from_slice(&(1.0f32 - uv.y).to_le_bytes());
        }
        buffer_views.push(json!({
            "buffer": 0,
            "byteOffset": offset,
            "byteLength": bin.len() - offset,
            "target": GLTF_TARGET_ARRAY_BUFFER,
        }));
        accessors.push(json!({
            "bufferView": buffer_views.len() - 1,
            "componentType": GLTF_COMPONENT_F32,
            "count": mesh.uvs.len(),
            "type": "VEC2",
        }));
        attributes.insert("TEXCOORD_0".into(), json!(accessors.len() - 1));
    }

    let mut primitive = json!({
        "attributes": Value::Object(attributes),
        "indices": indices_accessor,
        "mode": 4,
    });
    if let Some(material) = material_index {
        primitive["material"] = json!(material);
    }
    primitive
}

fn material_json(spec: &MaterialSpec, extensions_used: &mut Vec<String>) -> Value {
    let mut material = json!({ "doubleSided": spec.double_sided });
    if let Some(texture) = spec.texture {
        material["pbrMetallicRoughness"] = json!({
            "baseColorTexture": { "index": texture },
            "metallicFactor": 0.0,
        });
    }
    if spec.unlit {
        material["extensions"] = json!({ "KHR_materials_unlit": {} });
        if !extensions_used.iter().any(|e| e == "KHR_materials_unlit") {
            extensions_used.push("KHR_materials_unlit".into());
        }
    }
    material
}

fn texture_json(texture: &Texture, sampler_index: usize, image_index: usize) -> (Value, Value, Value) {
    let sampler = json!({
        "magFilter": texture_filter_code(texture.mag_filter),
        "minFilter": texture_filter_code(texture.min_filter),
        "wrapS": 10497,
        "wrapT": 10497,
    });
    let image = json!({ "uri": texture.uri.to_string_lossy() });
    let tex = json!({ "sampler": sampler_index, "source": image_index });
    (sampler, image, tex)
}

/// Builds a single-mesh glTF.
///
/// Classic output anchors the mesh with the `CESIUM_RTC` extension; next
/// output uses a plain node translation. When a feature-ID texture is
/// present it is appended as the second texture and referenced from the
/// primitive.
pub fn create_gltf(
    mesh: &Mesh,
    material: Option<&MaterialSpec>,
    imagery: Option<&Texture>,
    use_3d_tiles_next: bool,
    feature_id_texture: Option<&Texture>,
) -> Gltf {
    let mut bin = Vec::new();
    let mut buffer_views = Vec::new();
    let mut accessors = Vec::new();
    let mut extensions_used: Vec<String> = Vec::new();

    let mut primitive = push_mesh_primitive(
        mesh,
        material.map(|_| 0),
        &mut bin,
        &mut buffer_views,
        &mut accessors,
    );

    let mut samplers = Vec::new();
    let mut images = Vec::new();
    let mut textures = Vec::new();
    if let Some(texture) = imagery {
        let (sampler, image, tex) = texture_json(texture, samplers.len(), images.len());
        samplers.push(sampler);
        images.push(image);
        textures.push(tex);
    }
    if let Some(texture) = feature_id_texture {
        let (sampler, image, tex) = texture_json(texture, samplers.len(), images.len());
        samplers.push(sampler);
        images.push(image);
        textures.push(tex);
        primitive["extensions"] = json!({
            "EXT_mesh_features": {
                "featureIds": [{ "texture": { "index": textures.len() - 1 } }],
            }
        });
        extensions_used.push("EXT_mesh_features".into());
    }

    let materials: Vec<Value> = material
        .map(|spec| vec![material_json(spec, &mut extensions_used)])
        .unwrap_or_default();

    let mut mesh_node = json!({ "mesh": 0 });
    let mut root_extensions = json!({});
    if use_3d_tiles_next {
        mesh_node["translation"] = json!(mesh.center.to_array());
    } else {
        root_extensions = json!({ "CESIUM_RTC": { "center": mesh.center.to_array() } });
        extensions_used.push("CESIUM_RTC".into());
    }

    let mut gltf_json = json!({
        "asset": { "version": "2.0" },
        "scene": 0,
        "scenes": [{ "nodes": [0] }],
        "nodes": [
            { "matrix": ZUP_TO_YUP_MATRIX, "children": [1] },
            mesh_node,
        ],
        "meshes": [{ "primitives": [primitive] }],
        "buffers": [{ "byteLength": bin.len() }],
        "bufferViews": buffer_views,
        "accessors": accessors,
    });
    if !materials.is_empty() {
        gltf_json["materials"] = json!(materials);
    }
    if !textures.is_empty() {
        gltf_json["samplers"] = json!(samplers);
        gltf_json["images"] = json!(images);
        gltf_json["textures"] = json!(textures);
    }
    if !extensions_used.is_empty() {
        gltf_json["extensionsUsed"] = json!(extensions_used);
    }
    if !root_extensions.as_object().map(|o| o.is_empty()).unwrap_or(true) {
        gltf_json["extensions"] = root_extensions;
    }

    Gltf {
        json: gltf_json,
        bin,
    }
}

/// Builds a multi-mesh glTF out of a loaded 3D model.
pub fn create_gltf_from_model(model: &Model3D, use_3d_tiles_next: bool) -> Gltf {
    let mut bin = Vec::new();
    let mut buffer_views = Vec::new();
    let mut accessors = Vec::new();
    let mut extensions_used: Vec<String> = Vec::new();

    let mut primitives = Vec::new();
    for mesh in &model.meshes {
        primitives.push(push_mesh_primitive(
            mesh,
            mesh.material,
            &mut bin,
            &mut buffer_views,
            &mut accessors,
        ));
    }

    let materials: Vec<Value> = model
        .materials
        .iter()
        .map(|spec| material_json(spec, &mut extensions_used))
        .collect();

    let mut samplers = Vec::new();
    let mut images = Vec::new();
    let mut textures = Vec::new();
    for texture in &model.textures {
        let (sampler, image, tex) = texture_json(texture, samplers.len(), images.len());
        samplers.push(sampler);
        images.push(image);
        textures.push(tex);
    }

    let center = model
        .meshes
        .first()
        .map(|m| m.center)
        .unwrap_or_default();
    let mut mesh_node = json!({ "mesh": 0 });
    if use_3d_tiles_next {
        mesh_node["translation"] = json!(center.to_array());
    } else {
        extensions_used.push("CESIUM_RTC".into());
    }

    let mut gltf_json = json!({
        "asset": { "version": "2.0" },
        "scene": 0,
        "scenes": [{ "nodes": [0] }],
        "nodes": [
            { "matrix": ZUP_TO_YUP_MATRIX, "children": [1] },
            mesh_node,
        ],
        "meshes": [{ "primitives": primitives }],
        "buffers": [{ "byteLength": bin.len() }],
        "bufferViews": buffer_views,
        "accessors": accessors,
    });
    if !materials.is_empty() {
        gltf_json["materials"] = json!(materials);
    }
    if !textures.is_empty() {
        gltf_json["samplers"] = json!(samplers);
        gltf_json["images"] = json!(images);
        gltf_json["textures"] = json!(textures);
    }
    if !use_3d_tiles_next {
        gltf_json["extensions"] = json!({ "CESIUM_RTC": { "center": center.to_array() } });
    }
    if !extensions_used.is_empty() {
        gltf_json["extensionsUsed"] = json!(extensions_used);
    }

    Gltf {
        json: gltf_json,
        bin,
    }
}

/// Builds one glTF out of several model/instance groups: each group's
/// meshes become one glTF mesh whose node carries an
/// `EXT_mesh_gpu_instancing` TRANSLATION stream, everything sharing one
/// binary buffer and a common center.
pub fn create_instanced_gltf(groups: &[(&Model3D, Vec<glam::DVec3>)]) -> Gltf {
    let mut bin = Vec::new();
    let mut buffer_views = Vec::new();
    let mut accessors = Vec::new();
    let mut extensions_used = vec!["EXT_mesh_gpu_instancing".to_string()];

    let total: usize = groups.iter().map(|(_, p)| p.len()).sum();
    let center = groups
        .iter()
        .flat_map(|(_, positions)| positions.iter().copied())
        .sum::<glam::DVec3>()
        / (total.max(1) as f64);

    let mut materials = Vec::new();
    let mut samplers = Vec::new();
    let mut images = Vec::new();
    let mut textures = Vec::new();
    let mut meshes = Vec::new();
    let mut nodes = vec![json!({
        "matrix": ZUP_TO_YUP_MATRIX,
        "children": (1..=groups.len()).collect::<Vec<usize>>(),
    })];

    for (model, positions) in groups {
        let material_offset = materials.len();
        let texture_offset = textures.len();
        for spec in &model.materials {
            let mut adjusted = spec.clone();
            adjusted.texture = spec.texture.map(|t| t + texture_offset);
            materials.push(material_json(&adjusted, &mut extensions_used));
        }
        for texture in &model.textures {
            let (sampler, image, tex) = texture_json(texture, samplers.len(), images.len());
            samplers.push(sampler);
            images.push(image);
            textures.push(tex);
        }

        let primitives: Vec<Value> = model
            .meshes
            .iter()
            .map(|mesh| {
                push_mesh_primitive(
                    mesh,
                    mesh.material.map(|m| m + material_offset),
                    &mut bin,
                    &mut buffer_views,
                    &mut accessors,
                )
            })
            .collect();
        meshes.push(json!({ "primitives": primitives }));

        // TRANSLATION stream relative to the shared center
        let offset = bin.len();
        for p in positions {
            let rtc = (*p - center).as_vec3();
            for v in rtc.to_array() {
                bin.extend_from_slice(&v.to_le_bytes());
            }
        }
        buffer_views.push(json!({
            "buffer": 0,
            "byteOffset": offset,
            "byteLength": bin.len() - offset,
        }));
        accessors.push(json!({
            "bufferView": buffer_views.len() - 1,
            "componentType": GLTF_COMPONENT_F32,
            "count": positions.len(),
            "type": "VEC3",
        }));

        nodes.push(json!({
            "mesh": meshes.len() - 1,
            "translation": center.to_array(),
            "extensions": {
                "EXT_mesh_gpu_instancing": {
                    "attributes": { "TRANSLATION": accessors.len() - 1 },
                }
            },
        }));
    }

    let mut gltf_json = json!({
        "asset": { "version": "2.0" },
        "scene": 0,
        "scenes": [{ "nodes": [0] }],
        "nodes": nodes,
        "meshes": meshes,
        "buffers": [{ "byteLength": bin.len() }],
        "bufferViews": buffer_views,
        "accessors": accessors,
        "extensionsUsed": extensions_used,
    });
    if !materials.is_empty() {
        gltf_json["materials"] = json!(materials);
    }
    if !textures.is_empty() {
        gltf_json["samplers"] = json!(samplers);
        gltf_json["images"] = json!(images);
        gltf_json["textures"] = json!(textures);
    }

    Gltf {
        json: gltf_json,
        bin,
    }
}

/// Flattens the attribute tables into one `name -> array` JSON object
/// (the legacy batch-table layout). `filter` selects a subset of
/// instances; `None` keeps them all.
fn attributes_to_json(attributes: &InstancesAttributes, filter: Option<&[usize]>) -> Value {
    fn pick<T: Clone + serde::Serialize>(values: &[T], filter: Option<&[usize]>) -> Value {
        match filter {
            Some(indices) => json!(indices
                .iter()
                .filter_map(|&i| values.get(i).cloned())
                .collect::<Vec<_>>()),
            None => json!(values),
        }
    }

    let mut table = serde_json::Map::new();
    for (name, values) in &attributes.integer_attributes {
        table.insert(name.clone(), pick(values, filter));
    }
    for (name, values) in &attributes.double_attributes {
        table.insert(name.clone(), pick(values, filter));
    }
    for (name, values) in &attributes.string_attributes {
        table.insert(name.clone(), pick(values, filter));
    }
    Value::Object(table)
}

/// Writes a GLB container.
pub fn write_glb(gltf: &Gltf, w: &mut dyn Write) -> Result<()> {
    let mut json_bytes = serde_json::to_vec(&gltf.json)?;
    let json_padded = align_to_4(json_bytes.len());
    json_bytes.resize(json_padded, b' ');

    let bin_padded = align_to_4(gltf.bin.len());
    let has_bin = bin_padded > 0;

    let mut total = 12 + 8 + json_padded;
    if has_bin {
        total += 8 + bin_padded;
    }

    w.write_all(b"glTF")?;
    w.write_all(&2u32.to_le_bytes())?;
    w.write_all(&(total as u32).to_le_bytes())?;

    w.write_all(&(json_padded as u32).to_le_bytes())?;
    w.write_all(&0x4E4F_534Au32.to_le_bytes())?; // "JSON"
    w.write_all(&json_bytes)?;

    if has_bin {
        w.write_all(&(bin_padded as u32).to_le_bytes())?;
        w.write_all(&0x004E_4942u32.to_le_bytes())?; // "BIN"
        w.write_all(&gltf.bin)?;
        w.write_all(&vec![0u8; bin_padded - gltf.bin.len()])?;
    }
    Ok(())
}

/// Writes a standalone glTF content file (GLB), attaching the per-instance
/// attribute tables as structural metadata when present.
pub fn write_gltf(
    gltf: &Gltf,
    instances: Option<&InstancesAttributes>,
    w: &mut dyn Write,
) -> Result<()> {
    match instances {
        Some(attributes) if !attributes.is_empty() => {
            let mut tagged = gltf.clone();
            tagged.json["extensions"]["EXT_structural_metadata"] = json!({
                "propertyTables": [attributes_to_json(attributes, None)],
            });
            let used = tagged.json["extensionsUsed"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            let mut used: Vec<Value> = used;
            used.push(json!("EXT_structural_metadata"));
            tagged.json["extensionsUsed"] = json!(used);
            write_glb(&tagged, w)
        }
        _ => write_glb(gltf, w),
    }
}

/// Writes a B3DM wrapper around the glTF.
///
/// Header (28 bytes): magic `b3dm`, version 1, total length, feature table
/// JSON/binary lengths, batch table JSON/binary lengths. Both tables are
/// space padded to 8 bytes; the GLB payload is zero padded to 8.
pub fn write_b3dm(
    gltf: &Gltf,
    instances: Option<&InstancesAttributes>,
    w: &mut dyn Write,
) -> Result<()> {
    let batch_length = instances.map(|a| a.instances_count()).unwrap_or(0);
    let mut feature_table = serde_json::to_vec(&json!({ "BATCH_LENGTH": batch_length }))?;
    feature_table.resize(align_to_8(feature_table.len()), b' ');

    let mut batch_table = Vec::new();
    if let Some(attributes) = instances {
        if !attributes.is_empty() {
            batch_table = serde_json::to_vec(&attributes_to_json(attributes, None))?;
            batch_table.resize(align_to_8(batch_table.len()), b' ');
        }
    }

    let mut glb = Vec::new();
    write_glb(gltf, &mut glb)?;
    glb.resize(align_to_8(glb.len()), 0);

    let total = 28 + feature_table.len() + batch_table.len() + glb.len();
    w.write_all(b"b3dm")?;
    w.write_all(&1u32.to_le_bytes())?;
    w.write_all(&(total as u32).to_le_bytes())?;
    w.write_all(&(feature_table.len() as u32).to_le_bytes())?;
    w.write_all(&0u32.to_le_bytes())?;
    w.write_all(&(batch_table.len() as u32).to_le_bytes())?;
    w.write_all(&0u32.to_le_bytes())?;
    w.write_all(&feature_table)?;
    w.write_all(&batch_table)?;
    w.write_all(&glb)?;
    Ok(())
}

/// Writes an I3DM that references an external glTF by URI (`gltfFormat 0`)
/// and places the selected instances via a feature-table `POSITION` stream
/// around an `RTC_CENTER`.
pub fn write_i3dm(
    gltf_uri: &str,
    attributes: &ModelsAttributes,
    instance_indices: &[usize],
    w: &mut dyn Write,
) -> Result<usize> {
    let positions: Vec<_> = instance_indices
        .iter()
        .filter_map(|&i| attributes.positions.get(i).copied())
        .collect();
    let center = positions.iter().copied().sum::<glam::DVec3>()
        / (positions.len().max(1) as f64);

    let mut feature_table_bin = Vec::new();
    for p in &positions {
        let rtc = (*p - center).as_vec3();
        for v in rtc.to_array() {
            feature_table_bin.extend_from_slice(&v.to_le_bytes());
        }
    }
    feature_table_bin.resize(align_to_8(feature_table_bin.len()), 0);

    let mut feature_table = serde_json::to_vec(&json!({
        "INSTANCES_LENGTH": positions.len(),
        "RTC_CENTER": center.to_array(),
        "POSITION": { "byteOffset": 0 },
        "EAST_NORTH_UP": true,
    }))?;
    feature_table.resize(align_to_8(feature_table.len()), b' ');

    let mut batch_table = Vec::new();
    if !attributes.instances.is_empty() {
        batch_table =
            serde_json::to_vec(&attributes_to_json(&attributes.instances, Some(instance_indices)))?;
        batch_table.resize(align_to_8(batch_table.len()), b' ');
    }

    let mut payload = gltf_uri.as_bytes().to_vec();
    payload.resize(align_to_8(payload.len()), b' ');

    let total = 32 + feature_table.len() + feature_table_bin.len() + batch_table.len()
        + payload.len();
    w.write_all(b"i3dm")?;
    w.write_all(&1u32.to_le_bytes())?;
    w.write_all(&(total as u32).to_le_bytes())?;
    w.write_all(&(feature_table.len() as u32).to_le_bytes())?;
    w.write_all(&(feature_table_bin.len() as u32).to_le_bytes())?;
    w.write_all(&(batch_table.len() as u32).to_le_bytes())?;
    w.write_all(&0u32.to_le_bytes())?;
    w.write_all(&0u32.to_le_bytes())?; // gltfFormat: uri
    w.write_all(&feature_table)?;
    w.write_all(&feature_table_bin)?;
    w.write_all(&batch_table)?;
    w.write_all(&payload)?;
    Ok(total)
}

/// Writes a CMPT composite around already-serialized inner tiles.
pub fn write_cmpt(inner_tiles: &[Vec<u8>], w: &mut dyn Write) -> Result<()> {
    let total: usize = 16 + inner_tiles.iter().map(|t| align_to_8(t.len())).sum::<usize>();
    w.write_all(b"cmpt")?;
    w.write_all(&1u32.to_le_bytes())?;
    w.write_all(&(total as u32).to_le_bytes())?;
    w.write_all(&(inner_tiles.len() as u32).to_le_bytes())?;
    for tile in inner_tiles {
        w.write_all(tile)?;
        w.write_all(&vec![0u8; align_to_8(tile.len()) - tile.len()])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::DVec3;

    fn triangle_mesh() -> Mesh {
        let mut mesh = Mesh {
            positions: vec![
                DVec3::new(0.0, 0.0, 0.0),
                DVec3::new(1.0, 0.0, 0.0),
                DVec3::new(0.0, 1.0, 0.0),
            ],
            indices: vec![0, 1, 2],
            ..Default::default()
        };
        mesh.recompute_rtc();
        mesh
    }

    #[test]
    fn test_glb_header_and_alignment() {
        let gltf = create_gltf(&triangle_mesh(), None, None, true, None);
        let mut out = Vec::new();
        write_glb(&gltf, &mut out).unwrap();

        assert_eq!(&out[0..4], b"glTF");
        assert_eq!(u32::from_le_bytes(out[4..8].try_into().unwrap()), 2);
        let total = u32::from_le_bytes(out[8..12].try_into().unwrap()) as usize;
        assert_eq!(total, out.len());
        assert_eq!(out.len() % 4, 0);
        // JSON chunk type
        assert_eq!(&out[16..20], b"JSON");
    }

    #[test]
    fn test_b3dm_wraps_glb() {
        let gltf = create_gltf(&triangle_mesh(), None, None, false, None);
        let mut out = Vec::new();
        write_b3dm(&gltf, None, &mut out).unwrap();

        assert_eq!(&out[0..4], b"b3dm");
        let total = u32::from_le_bytes(out[8..12].try_into().unwrap()) as usize;
        assert_eq!(total, out.len());
        let ft_len = u32::from_le_bytes(out[12..16].try_into().unwrap()) as usize;
        assert_eq!(ft_len % 8, 0);
        // the GLB payload follows the tables
        assert_eq!(&out[28 + ft_len..28 + ft_len + 4], b"glTF");
    }

    #[test]
    fn test_b3dm_batch_table_carries_attributes() {
        let gltf = create_gltf(&triangle_mesh(), None, None, false, None);
        let mut attributes = InstancesAttributes::default();
        attributes
            .integer_attributes
            .insert("CNAM".into(), vec![1, 2, 3]);
        let mut out = Vec::new();
        write_b3dm(&gltf, Some(&attributes), &mut out).unwrap();

        let ft_len = u32::from_le_bytes(out[12..16].try_into().unwrap()) as usize;
        let bt_len = u32::from_le_bytes(out[20..24].try_into().unwrap()) as usize;
        assert!(bt_len > 0);
        let ft: Value =
            serde_json::from_slice(&out[28..28 + ft_len]).unwrap();
        assert_eq!(ft["BATCH_LENGTH"], json!(3));
        let bt: Value =
            serde_json::from_slice(&out[28 + ft_len..28 + ft_len + bt_len]).unwrap();
        assert_eq!(bt["CNAM"], json!([1, 2, 3]));
    }

    #[test]
    fn test_cmpt_inner_tile_count() {
        let gltf = create_gltf(&triangle_mesh(), None, None, false, None);
        let mut inner = Vec::new();
        write_b3dm(&gltf, None, &mut inner).unwrap();
        let mut out = Vec::new();
        write_cmpt(&[inner.clone(), inner], &mut out).unwrap();

        assert_eq!(&out[0..4], b"cmpt");
        assert_eq!(u32::from_le_bytes(out[12..16].try_into().unwrap()), 2);
        let total = u32::from_le_bytes(out[8..12].try_into().unwrap()) as usize;
        assert_eq!(total, out.len());
    }

    #[test]
    fn test_gltf_carries_rtc_center_per_mode() {
        let mesh = triangle_mesh();
        let classic = create_gltf(&mesh, None, None, false, None);
        assert!(classic.json["extensions"]["CESIUM_RTC"]["center"].is_array());

        let next = create_gltf(&mesh, None, None, true, None);
        assert!(next.json.get("extensions").is_none());
        assert!(next.json["nodes"][1]["translation"].is_array());
    }
}
