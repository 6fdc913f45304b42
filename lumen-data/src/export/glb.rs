//! Binary glTF 2.0 (`.glb`) encoding.
//!
//! One buffer holds positions, optional normals, and `u32` indices, each in
//! its own buffer view. The document has a single scene with a single node
//! referencing a single triangle primitive.

use crate::error::MeshError;
use crate::types::Mesh;
use serde::Serialize;

// Buffers are cast with bytemuck, which uses host byte order; glTF is little-endian.
const _: () = assert!(cfg!(target_endian = "little"), "GLB encoding assumes a little-endian host");

const GLB_MAGIC: u32 = 0x4654_6C67; // "glTF"
const GLB_VERSION: u32 = 2;
const CHUNK_JSON: u32 = 0x4E4F_534A; // "JSON"
const CHUNK_BIN: u32 = 0x004E_4942; // "BIN\0"

const ARRAY_BUFFER: u32 = 34962;
const ELEMENT_ARRAY_BUFFER: u32 = 34963;
const COMPONENT_FLOAT: u32 = 5126;
const COMPONENT_UNSIGNED_INT: u32 = 5125;
const MODE_TRIANGLES: u32 = 4;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    asset: Asset,
    scene: u32,
    scenes: Vec<Scene>,
    nodes: Vec<Node>,
    meshes: Vec<MeshDef>,
    buffers: Vec<Buffer>,
    buffer_views: Vec<BufferView>,
    accessors: Vec<Accessor>,
}

#[derive(Serialize)]
struct Asset {
    version: &'static str,
    generator: &'static str,
}

#[derive(Serialize)]
struct Scene {
    nodes: Vec<u32>,
}

#[derive(Serialize)]
struct Node {
    mesh: u32,
}

#[derive(Serialize)]
struct MeshDef {
    primitives: Vec<Primitive>,
}

#[derive(Serialize)]
struct Primitive {
    attributes: Attributes,
    indices: u32,
    mode: u32,
}

#[derive(Serialize)]
struct Attributes {
    #[serde(rename = "POSITION")]
    position: u32,
    #[serde(rename = "NORMAL", skip_serializing_if = "Option::is_none")]
    normal: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Buffer {
    byte_length: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BufferView {
    buffer: u32,
    byte_offset: usize,
    byte_length: usize,
    target: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Accessor {
    buffer_view: u32,
    component_type: u32,
    count: usize,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    min: Option<[f32; 3]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max: Option<[f32; 3]>,
}

/// Accumulates buffer views into one binary blob.
#[derive(Default)]
struct BinaryBuilder {
    data: Vec<u8>,
    views: Vec<BufferView>,
}

impl BinaryBuilder {
    fn push(&mut self, bytes: &[u8], target: u32) -> u32 {
        pad_to_four(&mut self.data, 0);
        let view = self.views.len() as u32;
        self.views.push(BufferView {
            buffer: 0,
            byte_offset: self.data.len(),
            byte_length: bytes.len(),
            target,
        });
        self.data.extend_from_slice(bytes);
        view
    }
}

fn pad_to_four(bytes: &mut Vec<u8>, fill: u8) {
    while bytes.len() % 4 != 0 {
        bytes.push(fill);
    }
}

/// Encode `mesh` as a self-contained GLB file.
pub fn mesh_to_glb_bytes(mesh: &Mesh) -> Result<Vec<u8>, MeshError> {
    mesh.validate()?;
    if mesh.is_empty() {
        return Err(MeshError::EmptyMesh);
    }

    let positions: Vec<[f32; 3]> = mesh.vertices.iter().map(|v| v.to_array()).collect();
    let (min, max) = mesh.bounds().ok_or(MeshError::EmptyMesh)?;

    let mut binary = BinaryBuilder::default();
    let mut accessors = Vec::new();

    let position_view = binary.push(bytemuck::cast_slice(&positions), ARRAY_BUFFER);
    accessors.push(Accessor {
        buffer_view: position_view,
        component_type: COMPONENT_FLOAT,
        count: positions.len(),
        kind: "VEC3",
        min: Some(min.to_array()),
        max: Some(max.to_array()),
    });
    let position_accessor = 0;

    let normal_accessor = match &mesh.normals {
        Some(normals) => {
            let normals: Vec<[f32; 3]> = normals.iter().map(|n| n.to_array()).collect();
            let view = binary.push(bytemuck::cast_slice(&normals), ARRAY_BUFFER);
            accessors.push(Accessor {
                buffer_view: view,
                component_type: COMPONENT_FLOAT,
                count: normals.len(),
                kind: "VEC3",
                min: None,
                max: None,
            });
            Some(accessors.len() as u32 - 1)
        }
        None => None,
    };

    let index_view = binary.push(bytemuck::cast_slice(&mesh.faces), ELEMENT_ARRAY_BUFFER);
    accessors.push(Accessor {
        buffer_view: index_view,
        component_type: COMPONENT_UNSIGNED_INT,
        count: mesh.faces.len() * 3,
        kind: "SCALAR",
        min: None,
        max: None,
    });
    let index_accessor = accessors.len() as u32 - 1;

    let BinaryBuilder {
        data: mut bin,
        views,
    } = binary;
    pad_to_four(&mut bin, 0);

    let document = Document {
        asset: Asset {
            version: "2.0",
            generator: concat!("lumen-data ", env!("CARGO_PKG_VERSION")),
        },
        scene: 0,
        scenes: vec![Scene { nodes: vec![0] }],
        nodes: vec![Node { mesh: 0 }],
        meshes: vec![MeshDef {
            primitives: vec![Primitive {
                attributes: Attributes {
                    position: position_accessor,
                    normal: normal_accessor,
                },
                indices: index_accessor,
                mode: MODE_TRIANGLES,
            }],
        }],
        buffers: vec![Buffer {
            byte_length: bin.len(),
        }],
        buffer_views: views,
        accessors,
    };

    let mut json = serde_json::to_vec(&document)?;
    pad_to_four(&mut json, b' ');

    let total = 12 + 8 + json.len() + 8 + bin.len();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&GLB_MAGIC.to_le_bytes());
    out.extend_from_slice(&GLB_VERSION.to_le_bytes());
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&(json.len() as u32).to_le_bytes());
    out.extend_from_slice(&CHUNK_JSON.to_le_bytes());
    out.extend_from_slice(&json);
    out.extend_from_slice(&(bin.len() as u32).to_le_bytes());
    out.extend_from_slice(&CHUNK_BIN.to_le_bytes());
    out.extend_from_slice(&bin);
    Ok(out)
}
