//! Core data types for density lattices and meshes.
//!
//! These are CPU-side representations shared by the extractor and the writers.
//! Lattice coordinates are grid indices; world units only appear after a
//! mesh has been scaled.

use crate::error::MeshError;
use glam::Vec3;

/// A regular 3D lattice of scalar density values.
///
/// Values are stored with the last axis varying fastest:
/// `index = (x * ny + y) * nz + z`.
#[derive(Debug, Clone, PartialEq)]
pub struct DensityGrid {
    dims: [usize; 3],
    values: Vec<f32>,
}

impl DensityGrid {
    /// Create a grid from raw values in x-major order.
    pub fn new(dims: [usize; 3], values: Vec<f32>) -> Result<Self, MeshError> {
        if dims.iter().any(|&d| d < 2) {
            return Err(MeshError::GridTooSmall { dims });
        }
        let expected = dims[0] * dims[1] * dims[2];
        if values.len() != expected {
            return Err(MeshError::GridSize {
                dims,
                expected,
                actual: values.len(),
            });
        }
        Ok(Self { dims, values })
    }

    /// Create a grid by evaluating `f(x, y, z)` at every lattice point.
    pub fn from_fn(
        dims: [usize; 3],
        mut f: impl FnMut(usize, usize, usize) -> f32,
    ) -> Result<Self, MeshError> {
        let mut values = Vec::with_capacity(dims[0] * dims[1] * dims[2]);
        for x in 0..dims[0] {
            for y in 0..dims[1] {
                for z in 0..dims[2] {
                    values.push(f(x, y, z));
                }
            }
        }
        Self::new(dims, values)
    }

    /// Create a cubic grid with `n` samples per axis.
    pub fn cube(n: usize, values: Vec<f32>) -> Result<Self, MeshError> {
        Self::new([n, n, n], values)
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Linear index of lattice point `(x, y, z)`.
    #[inline]
    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        (x * self.dims[1] + y) * self.dims[2] + z
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize) -> f32 {
        self.values[self.index(x, y, z)]
    }

    /// Minimum and maximum finite values in the grid.
    pub fn range(&self) -> (f32, f32) {
        self.values
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v), hi.max(v))
            })
    }

    /// Whether any pair of values lies on opposite sides of `level`.
    pub fn crosses(&self, level: f32) -> bool {
        let mut above = false;
        let mut below = false;
        for &v in &self.values {
            if v > level {
                above = true;
            } else {
                below = true;
            }
            if above && below {
                return true;
            }
        }
        false
    }

    /// Density gradient at a lattice point.
    ///
    /// Central differences in the interior, one-sided differences on the boundary.
    pub fn gradient(&self, x: usize, y: usize, z: usize) -> Vec3 {
        let axis = |i: usize, n: usize, sample: &dyn Fn(usize) -> f32| -> f32 {
            let lo = i.saturating_sub(1);
            let hi = (i + 1).min(n - 1);
            let span = (hi - lo) as f32;
            (sample(hi) - sample(lo)) / span
        };
        let [nx, ny, nz] = self.dims;
        Vec3::new(
            axis(x, nx, &|i| self.get(i, y, z)),
            axis(y, ny, &|i| self.get(x, i, z)),
            axis(z, nz, &|i| self.get(x, y, i)),
        )
    }
}

/// An indexed triangle mesh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<Vec3>,
    pub faces: Vec<[u32; 3]>,
    /// Optional per-vertex unit normals, same length as `vertices`.
    pub normals: Option<Vec<Vec3>>,
}

impl Mesh {
    pub fn new(vertices: Vec<Vec3>, faces: Vec<[u32; 3]>) -> Self {
        Self {
            vertices,
            faces,
            normals: None,
        }
    }

    pub fn with_normals(vertices: Vec<Vec3>, faces: Vec<[u32; 3]>, normals: Vec<Vec3>) -> Self {
        Self {
            vertices,
            faces,
            normals: Some(normals),
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// Axis-aligned bounds of the vertices, if any.
    pub fn bounds(&self) -> Option<(Vec3, Vec3)> {
        let first = *self.vertices.first()?;
        Some(
            self.vertices
                .iter()
                .fold((first, first), |(lo, hi), v| (lo.min(*v), hi.max(*v))),
        )
    }

    /// Multiply every vertex by `factor` (voxel-to-world scaling).
    pub fn scale(&mut self, factor: f32) {
        for v in &mut self.vertices {
            *v *= factor;
        }
    }

    /// Unnormalized normal of face `i`; its length is twice the face area.
    pub fn face_normal(&self, i: usize) -> Vec3 {
        let [a, b, c] = self.faces[i].map(|v| self.vertices[v as usize]);
        (b - a).cross(c - a)
    }

    /// Check that every face index is in range and normals match vertices.
    pub fn validate(&self) -> Result<(), MeshError> {
        let count = self.vertices.len();
        if count > u32::MAX as usize {
            return Err(MeshError::TooManyVertices(count));
        }
        for (face, tri) in self.faces.iter().enumerate() {
            if let Some(&index) = tri.iter().find(|&&i| i as usize >= count) {
                return Err(MeshError::InvalidFace { face, index, count });
            }
        }
        if let Some(normals) = &self.normals {
            if normals.len() != count {
                return Err(MeshError::NormalCount {
                    vertices: count,
                    normals: normals.len(),
                });
            }
        }
        Ok(())
    }
}
