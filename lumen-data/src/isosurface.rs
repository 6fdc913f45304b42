//! Iso-surface extraction from density lattices.
//!
//! Each lattice cell is split into six tetrahedra around its main diagonal
//! (the Kuhn decomposition). Neighbouring cells then agree on every shared
//! face, so the extracted surface is watertight. Inside a tetrahedron the
//! surface is planar: one triangle when a single corner is separated from the
//! other three, a quad when the corners split two and two.
//!
//! Vertices are produced in grid-index space and shared between faces through
//! a map keyed by the lattice edge they sit on.

use crate::error::MeshError;
use crate::types::{DensityGrid, Mesh};
use glam::Vec3;
use std::collections::HashMap;
use tracing::{debug, info};

/// Cell corner offsets in a consistent order.
const CORNERS: [[usize; 3]; 8] = [
    [0, 0, 0],
    [1, 0, 0],
    [1, 1, 0],
    [0, 1, 0],
    [0, 0, 1],
    [1, 0, 1],
    [1, 1, 1],
    [0, 1, 1],
];

/// Six tetrahedra sharing the diagonal from corner 0 to corner 6.
const TETRAHEDRA: [[usize; 4]; 6] = [
    [0, 1, 2, 6],
    [0, 1, 5, 6],
    [0, 3, 2, 6],
    [0, 3, 7, 6],
    [0, 4, 5, 6],
    [0, 4, 7, 6],
];

#[derive(Debug, Clone, Copy)]
struct Corner {
    index: usize,
    lattice: [usize; 3],
    value: f32,
}

impl Corner {
    fn position(&self) -> Vec3 {
        Vec3::new(
            self.lattice[0] as f32,
            self.lattice[1] as f32,
            self.lattice[2] as f32,
        )
    }
}

/// Extract the surface where the grid crosses `level`.
///
/// Values strictly greater than `level` count as inside. Faces are wound
/// counter-clockwise when seen from outside, and vertex normals point from
/// dense towards empty space.
#[tracing::instrument(skip_all, fields(dims = ?grid.dims(), level))]
pub fn extract_isosurface(grid: &DensityGrid, level: f32) -> Result<Mesh, MeshError> {
    let (min, max) = grid.range();
    if !grid.crosses(level) {
        return Err(MeshError::EmptySurface { level, min, max });
    }

    let [nx, ny, nz] = grid.dims();
    let mut builder = SurfaceBuilder::new(grid, level);
    for x in 0..nx - 1 {
        for y in 0..ny - 1 {
            for z in 0..nz - 1 {
                builder.march_cell([x, y, z]);
            }
        }
    }

    let mesh = builder.finish();
    if mesh.is_empty() {
        return Err(MeshError::EmptySurface { level, min, max });
    }

    info!(
        "Extracted iso-surface: {} vertices, {} faces",
        mesh.vertex_count(),
        mesh.face_count()
    );
    Ok(mesh)
}

/// Extract the surface and map it from grid indices to world units.
pub fn extract_scaled(grid: &DensityGrid, level: f32, voxel_size: f32) -> Result<Mesh, MeshError> {
    let mut mesh = extract_isosurface(grid, level)?;
    mesh.scale(voxel_size);
    Ok(mesh)
}

struct SurfaceBuilder<'a> {
    grid: &'a DensityGrid,
    level: f32,
    edge_vertices: HashMap<(usize, usize), u32>,
    vertices: Vec<Vec3>,
    normals: Vec<Vec3>,
    faces: Vec<[u32; 3]>,
}

impl<'a> SurfaceBuilder<'a> {
    fn new(grid: &'a DensityGrid, level: f32) -> Self {
        Self {
            grid,
            level,
            edge_vertices: HashMap::new(),
            vertices: Vec::new(),
            normals: Vec::new(),
            faces: Vec::new(),
        }
    }

    fn march_cell(&mut self, origin: [usize; 3]) {
        let corners: [Corner; 8] = std::array::from_fn(|i| {
            let [dx, dy, dz] = CORNERS[i];
            let lattice = [origin[0] + dx, origin[1] + dy, origin[2] + dz];
            let index = self.grid.index(lattice[0], lattice[1], lattice[2]);
            Corner {
                index,
                lattice,
                value: self.grid.values()[index],
            }
        });

        let inside = corners.iter().filter(|c| c.value > self.level).count();
        if inside == 0 || inside == corners.len() {
            return;
        }

        for tet in TETRAHEDRA {
            self.march_tetrahedron(tet.map(|i| corners[i]));
        }
    }

    fn march_tetrahedron(&mut self, tet: [Corner; 4]) {
        let mut inside = [tet[0]; 4];
        let mut outside = [tet[0]; 4];
        let (mut n_in, mut n_out) = (0, 0);
        for corner in tet {
            if corner.value > self.level {
                inside[n_in] = corner;
                n_in += 1;
            } else {
                outside[n_out] = corner;
                n_out += 1;
            }
        }
        let ins = &inside[..n_in];
        let outs = &outside[..n_out];

        // Each polygon is wound from the exact lattice orientation of its
        // tetrahedron so that its normal points from inside corners to outside ones.
        match n_in {
            1 => {
                let mut polygon = [
                    self.edge_vertex(ins[0], outs[0]),
                    self.edge_vertex(ins[0], outs[1]),
                    self.edge_vertex(ins[0], outs[2]),
                ];
                if !positively_oriented(ins[0], outs[0], outs[1], outs[2]) {
                    polygon.reverse();
                }
                self.faces.push(polygon);
            }
            3 => {
                let mut polygon = [
                    self.edge_vertex(ins[0], outs[0]),
                    self.edge_vertex(ins[1], outs[0]),
                    self.edge_vertex(ins[2], outs[0]),
                ];
                if positively_oriented(outs[0], ins[0], ins[1], ins[2]) {
                    polygon.reverse();
                }
                self.faces.push(polygon);
            }
            2 => {
                // Cycle around the four crossing edges: each neighbour pair shares a corner.
                let mut polygon = [
                    self.edge_vertex(ins[0], outs[0]),
                    self.edge_vertex(ins[0], outs[1]),
                    self.edge_vertex(ins[1], outs[1]),
                    self.edge_vertex(ins[1], outs[0]),
                ];
                if !positively_oriented(ins[0], ins[1], outs[0], outs[1]) {
                    polygon.reverse();
                }
                self.faces.push([polygon[0], polygon[1], polygon[2]]);
                self.faces.push([polygon[0], polygon[2], polygon[3]]);
            }
            _ => {}
        }
    }

    /// Vertex where the surface crosses the edge from `inner` to `outer`.
    fn edge_vertex(&mut self, inner: Corner, outer: Corner) -> u32 {
        let key = if inner.index < outer.index {
            (inner.index, outer.index)
        } else {
            (outer.index, inner.index)
        };
        if let Some(&existing) = self.edge_vertices.get(&key) {
            return existing;
        }

        let t = crossing(inner.value, outer.value, self.level);
        let (a, b) = (inner.position(), outer.position());
        // Stay on the edge even when rounding would step past an end point.
        let position = (a + (b - a) * t).clamp(a.min(b), a.max(b));
        let [ix, iy, iz] = inner.lattice;
        let [ox, oy, oz] = outer.lattice;
        let gradient = self
            .grid
            .gradient(ix, iy, iz)
            .lerp(self.grid.gradient(ox, oy, oz), t);

        let id = self.vertices.len() as u32;
        self.vertices.push(position);
        self.normals.push((-gradient).normalize_or_zero());
        self.edge_vertices.insert(key, id);
        id
    }

    fn finish(self) -> Mesh {
        debug!(
            "Surface builder visited {} crossing edges",
            self.edge_vertices.len()
        );
        let mut mesh = Mesh::with_normals(self.vertices, self.faces, self.normals);
        fill_flat_normals(&mut mesh);
        mesh
    }
}

/// Replace zero-length vertex normals (flat density around the vertex) with
/// the direction of the adjacent faces.
fn fill_flat_normals(mesh: &mut Mesh) {
    let Some(normals) = &mesh.normals else {
        return;
    };
    if normals.iter().all(|n| *n != Vec3::ZERO) {
        return;
    }

    let mut face_sums = vec![Vec3::ZERO; mesh.vertices.len()];
    for (i, face) in mesh.faces.iter().enumerate() {
        let normal = mesh.face_normal(i);
        for &v in face {
            face_sums[v as usize] += normal;
        }
    }
    let mut filled = 0;
    if let Some(normals) = &mut mesh.normals {
        for (normal, sum) in normals.iter_mut().zip(face_sums) {
            if *normal == Vec3::ZERO {
                *normal = sum.normalize_or(Vec3::Z);
                filled += 1;
            }
        }
    }
    debug!("Filled {} flat vertex normals from faces", filled);
}

/// Interpolation parameter of `level` between `a` and `b`.
fn crossing(a: f32, b: f32, level: f32) -> f32 {
    let span = b - a;
    if !span.is_finite() || span.abs() <= f32::EPSILON {
        return 0.5;
    }
    ((level - a) / span).clamp(0.0, 1.0)
}

/// Whether `det(b - a, c - a, d - a) > 0` on the lattice coordinates.
fn positively_oriented(a: Corner, b: Corner, c: Corner, d: Corner) -> bool {
    let offset = |p: Corner| -> [i64; 3] {
        std::array::from_fn(|k| p.lattice[k] as i64 - a.lattice[k] as i64)
    };
    let (u, v, w) = (offset(b), offset(c), offset(d));
    let det = u[0] * (v[1] * w[2] - v[2] * w[1]) - u[1] * (v[0] * w[2] - v[2] * w[0])
        + u[2] * (v[0] * w[1] - v[1] * w[0]);
    det > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::distr::{Distribution, StandardUniform};
    use rand::rngs::StdRng;

    const CENTER: Vec3 = Vec3::new(12.1, 11.9, 12.3);

    fn blob_grid(n: usize, sigma: f32) -> DensityGrid {
        DensityGrid::from_fn([n, n, n], |x, y, z| {
            let d = Vec3::new(x as f32, y as f32, z as f32) - CENTER;
            (-d.length_squared() / (2.0 * sigma * sigma)).exp()
        })
        .unwrap()
    }

    fn edge_counts(mesh: &Mesh) -> HashMap<(u32, u32), usize> {
        let mut counts = HashMap::new();
        for &[a, b, c] in &mesh.faces {
            for (u, v) in [(a, b), (b, c), (c, a)] {
                *counts.entry((u, v)).or_insert(0) += 1;
            }
        }
        counts
    }

    #[test]
    fn test_single_corner_cell() {
        let grid = DensityGrid::from_fn([2, 2, 2], |x, y, z| {
            if (x, y, z) == (0, 0, 0) { 1.0 } else { 0.0 }
        })
        .unwrap();
        let mesh = extract_isosurface(&grid, 0.5).unwrap();
        // Corner 0 belongs to all six tetrahedra and touches seven lattice edges.
        assert_eq!(mesh.face_count(), 6);
        assert_eq!(mesh.vertex_count(), 7);
        // Every vertex sits at the midpoint of an edge leaving the origin.
        for v in &mesh.vertices {
            assert!(v.to_array().iter().all(|&c| c == 0.0 || c == 0.5));
            assert_eq!(v.max_element(), 0.5);
        }
    }

    #[test]
    fn test_off_diagonal_corner_cell() {
        // Corner (0, 1, 1) is shared by two tetrahedra only.
        let grid = DensityGrid::from_fn([2, 2, 2], |x, y, z| {
            if (x, y, z) == (0, 1, 1) { 1.0 } else { 0.0 }
        })
        .unwrap();
        let mesh = extract_isosurface(&grid, 0.5).unwrap();
        assert_eq!(mesh.face_count(), 2);
        assert_eq!(mesh.vertex_count(), 4);
    }

    #[test]
    fn test_uniform_grid_is_empty_surface() {
        let grid = DensityGrid::cube(4, vec![1.0; 64]).unwrap();
        match extract_isosurface(&grid, 0.5) {
            Err(MeshError::EmptySurface { level, min, max }) => {
                assert_eq!(level, 0.5);
                assert_eq!(min, 1.0);
                assert_eq!(max, 1.0);
            }
            other => panic!("expected EmptySurface, got {other:?}"),
        }

        let grid = DensityGrid::cube(4, vec![0.0; 64]).unwrap();
        assert!(matches!(
            extract_isosurface(&grid, 0.5),
            Err(MeshError::EmptySurface { .. })
        ));
    }

    #[test]
    fn test_sphere_is_closed_and_consistently_wound() {
        let mesh = extract_isosurface(&blob_grid(25, 4.5), 0.5).unwrap();
        assert!(mesh.vertex_count() > 0);
        assert!(mesh.face_count() > 0);
        mesh.validate().unwrap();

        let counts = edge_counts(&mesh);
        for (&(u, v), &n) in &counts {
            // Every directed edge appears once and its twin runs the other way.
            assert_eq!(n, 1, "directed edge ({u}, {v}) used {n} times");
            assert_eq!(counts.get(&(v, u)), Some(&1), "edge ({u}, {v}) has no twin");
        }
    }

    #[test]
    fn test_sphere_normals_point_outward() {
        let mesh = extract_isosurface(&blob_grid(25, 4.5), 0.5).unwrap();
        for (i, face) in mesh.faces.iter().enumerate() {
            let normal = mesh.face_normal(i);
            if normal.length() < 2e-6 {
                continue;
            }
            let center = face.iter().map(|&v| mesh.vertices[v as usize]).sum::<Vec3>() / 3.0;
            assert!(normal.dot(center - CENTER) > 0.0, "face {i} faces inward");
        }
        let normals = mesh.normals.as_ref().unwrap();
        for (v, n) in mesh.vertices.iter().zip(normals) {
            assert!(n.dot((*v - CENTER).normalize()) > 0.5);
        }
    }

    #[test]
    fn test_sphere_radius_matches_level() {
        // exp(-r^2 / 2s^2) = 0.5  =>  r = s * sqrt(2 ln 2)
        let sigma = 4.5;
        let expected = sigma * (2.0 * std::f32::consts::LN_2).sqrt();
        let mesh = extract_isosurface(&blob_grid(25, sigma), 0.5).unwrap();
        for v in &mesh.vertices {
            let r = (*v - CENTER).length();
            assert!((r - expected).abs() < 0.35, "vertex radius {r} vs {expected}");
        }
    }

    #[test]
    fn test_scaled_vertices_stay_in_bounds() {
        let voxel = 0.25;
        let mesh = extract_scaled(&blob_grid(25, 4.5), 0.5, voxel).unwrap();
        let (lo, hi) = mesh.bounds().unwrap();
        assert!(lo.min_element() >= 0.0);
        assert!(hi.max_element() <= 24.0 * voxel);
    }

    #[test]
    fn test_random_grid_produces_mesh() {
        let mut rng = StdRng::seed_from_u64(7);
        let n = 32;
        let values = (0..n * n * n)
            .map(|_| -> f32 { StandardUniform.sample(&mut rng) })
            .collect();
        let grid = DensityGrid::cube(n, values).unwrap();
        let mesh = extract_scaled(&grid, 0.5, 1.0).unwrap();
        assert!(mesh.vertex_count() > 0);
        assert!(mesh.face_count() > 0);
        mesh.validate().unwrap();
        let (lo, hi) = mesh.bounds().unwrap();
        assert!(lo.min_element() >= 0.0);
        assert!(hi.max_element() <= (n - 1) as f32, "max coordinate {hi}");

        // The surface is open at the grid boundary but still consistently wound.
        for (&(u, v), &count) in &edge_counts(&mesh) {
            assert_eq!(count, 1, "directed edge ({u}, {v}) used {count} times");
        }
    }

    #[test]
    fn test_vertex_at_edge_end_is_exact() {
        // The crossing sits exactly on the outside corners.
        let grid = DensityGrid::from_fn([2, 2, 2], |x, y, z| {
            if (x, y, z) == (0, 0, 0) { 1.0 } else { 0.5 }
        })
        .unwrap();
        let mesh = extract_isosurface(&grid, 0.5).unwrap();
        for v in &mesh.vertices {
            assert!(v.to_array().iter().all(|&c| c == 0.0 || c == 1.0), "{v}");
        }
    }

    #[test]
    fn test_flat_density_normals_are_unit_length() {
        // Central differences vanish on both ends of the edges between x = 1 and x = 2.
        let grid = DensityGrid::from_fn([5, 2, 2], |x, _, _| [0.0, 1.0, 0.0, 1.0, 0.0][x]).unwrap();
        let mesh = extract_isosurface(&grid, 0.5).unwrap();
        let normals = mesh.normals.as_ref().unwrap();
        for (v, n) in mesh.vertices.iter().zip(normals) {
            assert!((n.length() - 1.0).abs() < 1e-5, "normal {n} at {v}");
        }
        // The plane at x = 1.5 bounds the slab around x = 1 from the right.
        let right = mesh
            .vertices
            .iter()
            .position(|v| (v.x - 1.5).abs() < 1e-6)
            .unwrap();
        assert!(normals[right].x > 0.9);
    }

    #[test]
    fn test_crossing_guards_flat_edges() {
        assert_eq!(crossing(1.0, 1.0, 0.5), 0.5);
        assert_eq!(crossing(1.0, f32::NAN, 0.5), 0.5);
        assert!((crossing(1.0, 0.0, 0.5) - 0.5).abs() < 1e-6);
        assert!((crossing(1.0, 0.0, 0.75) - 0.25).abs() < 1e-6);
    }
}
