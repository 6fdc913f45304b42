//! Wavefront `.obj` encoding.

use crate::error::MeshError;
use crate::types::Mesh;
use std::io::Write;

/// Write `mesh` as Wavefront OBJ text.
///
/// Indices are 1-based. Faces reference normals (`f a//a ...`) when the mesh has them.
pub fn write_obj<W: Write>(mesh: &Mesh, mut out: W) -> Result<(), MeshError> {
    mesh.validate()?;
    if mesh.is_empty() {
        return Err(MeshError::EmptyMesh);
    }

    writeln!(
        out,
        "# lumen mesh: {} vertices, {} faces",
        mesh.vertex_count(),
        mesh.face_count()
    )?;
    for v in &mesh.vertices {
        writeln!(out, "v {} {} {}", v.x, v.y, v.z)?;
    }
    if let Some(normals) = &mesh.normals {
        for n in normals {
            writeln!(out, "vn {} {} {}", n.x, n.y, n.z)?;
        }
    }

    let with_normals = mesh.normals.is_some();
    for &[a, b, c] in &mesh.faces {
        let (a, b, c) = (a + 1, b + 1, c + 1);
        if with_normals {
            writeln!(out, "f {a}//{a} {b}//{b} {c}//{c}")?;
        } else {
            writeln!(out, "f {a} {b} {c}")?;
        }
    }
    out.flush()?;
    Ok(())
}

/// Encode `mesh` as OBJ into memory.
pub fn mesh_to_obj_bytes(mesh: &Mesh) -> Result<Vec<u8>, MeshError> {
    let mut bytes = Vec::with_capacity(32 * (mesh.vertex_count() * 2 + mesh.face_count()));
    write_obj(mesh, &mut bytes)?;
    Ok(bytes)
}
