use nalgebra::Vector3;
use raycloud_core::{CloudChunk, Normals};
use raycloud_spatial::{KdTreeIndex, NeighborIndex};
use rayon::prelude::*;

/// Minimum neighborhood for a plane fit; below this the estimate is
/// emitted as the zero-length "unreliable" sentinel.
const MIN_PLANE_NEIGHBORS: usize = 3;

/// Estimate a surface normal for every record of the chunk using PCA over
/// its `k` nearest neighbors (the query point included).
///
/// A covariance matrix is built from the neighbor positions and the
/// eigenvector of the smallest eigenvalue is taken as the normal. The sign
/// ambiguity is resolved per record by orienting the normal back toward the
/// ray's sensor origin (the end→start direction). Points with fewer than
/// three neighbors, or whose neighborhood degenerates the eigensolve, get
/// the all-zero sentinel; consumers must check
/// [`Normals::is_unreliable`] before trusting a row.
///
/// Neighbors are taken from the chunk alone. Near chunk boundaries the
/// neighborhood is therefore clipped; this is the accepted accuracy
/// trade-off of streaming in bounded chunks.
///
/// The per-point loop is parallelized with rayon.
///
/// # Panics
///
/// Panics if the chunk carries no origins; call
/// [`CloudChunk::ensure_origins`] first for plain point clouds.
pub fn estimate_chunk_normals(chunk: &CloudChunk, k: usize) -> Normals {
    let points = chunk.points_array();
    let index = KdTreeIndex::build(&points);
    estimate_normals_with_index(chunk, &index, k)
}

/// Same as [`estimate_chunk_normals`] but with a caller-supplied
/// [`NeighborIndex`] built over this chunk's return points.
pub fn estimate_normals_with_index<I: NeighborIndex>(
    chunk: &CloudChunk,
    index: &I,
    k: usize,
) -> Normals {
    assert!(
        chunk.has_origins(),
        "normal estimation needs ray origins for orientation"
    );

    let n = chunk.len();
    let points = chunk.points_array();

    let rows: Vec<Vector3<f64>> = (0..n)
        .into_par_iter()
        .map(|i| {
            let neighbors = index.knn(&points[i], k);
            if neighbors.len() < MIN_PLANE_NEIGHBORS {
                return Vector3::zeros();
            }

            // Centroid of the neighborhood.
            let count = neighbors.len() as f64;
            let mut cx = 0.0;
            let mut cy = 0.0;
            let mut cz = 0.0;
            for &j in &neighbors {
                cx += points[j][0];
                cy += points[j][1];
                cz += points[j][2];
            }
            cx /= count;
            cy /= count;
            cz /= count;

            // Upper triangle of the 3x3 covariance matrix (symmetric).
            let mut c00 = 0.0;
            let mut c01 = 0.0;
            let mut c02 = 0.0;
            let mut c11 = 0.0;
            let mut c12 = 0.0;
            let mut c22 = 0.0;
            for &j in &neighbors {
                let dx = points[j][0] - cx;
                let dy = points[j][1] - cy;
                let dz = points[j][2] - cz;
                c00 += dx * dx;
                c01 += dx * dy;
                c02 += dx * dz;
                c11 += dy * dy;
                c12 += dy * dz;
                c22 += dz * dz;
            }

            let mut normal = match smallest_eigenvector_3x3(c00, c01, c02, c11, c12, c22) {
                Some(v) => v,
                None => return Vector3::zeros(),
            };

            let len = normal.norm();
            if len < 1e-12 {
                return Vector3::zeros();
            }
            normal /= len;

            // Orient back toward the sensor.
            let to_sensor = chunk.origin(i) - chunk.point(i);
            if normal.dot(&to_sensor) < 0.0 {
                normal = -normal;
            }
            normal
        })
        .collect();

    let mut normals = Normals::with_capacity(n);
    for row in rows {
        normals.push(row);
    }
    normals
}

/// Eigenvector of the smallest eigenvalue of a 3x3 symmetric matrix, via
/// Cardano's analytical formula for the eigenvalues and a cross-product
/// trick for the eigenvector:
///
///   | a00  a01  a02 |
///   | a01  a11  a12 |
///   | a02  a12  a22 |
///
/// Returns `None` for (near-)isotropic or fully degenerate matrices where
/// no single null direction exists. Avoids a general iterative eigensolver
/// and its heap allocations in this inner loop.
fn smallest_eigenvector_3x3(
    a00: f64,
    a01: f64,
    a02: f64,
    a11: f64,
    a12: f64,
    a22: f64,
) -> Option<Vector3<f64>> {
    let m = (a00 + a11 + a22) / 3.0;

    // Shift: B = A - mI
    let b00 = a00 - m;
    let b11 = a11 - m;
    let b22 = a22 - m;

    // q = det(B) / 2
    let q = (b00 * (b11 * b22 - a12 * a12) - a01 * (a01 * b22 - a12 * a02)
        + a02 * (a01 * a12 - b11 * a02))
        / 2.0;

    // p = sum of squares of B entries / 6
    let p = (b00 * b00 + b11 * b11 + b22 * b22 + 2.0 * (a01 * a01 + a02 * a02 + a12 * a12)) / 6.0;
    let pp = p.max(0.0);

    if pp < 1e-30 {
        // Zero or a scalar multiple of the identity: every direction is an
        // eigenvector, none is a surface normal.
        return None;
    }

    let det_ratio = (q / (pp * pp.sqrt())).clamp(-1.0, 1.0);
    let phi = det_ratio.acos() / 3.0;

    // Eigenvalues, eig0 <= eig1 <= eig2.
    let sqrt_p = pp.sqrt();
    let eig0 = m + 2.0 * sqrt_p * (phi + 2.0 * std::f64::consts::FRAC_PI_3).cos();
    let eig2 = m + 2.0 * sqrt_p * phi.cos();
    let eig1 = 3.0 * m - eig0 - eig2;

    let lambda = if eig0.abs() <= eig1.abs() && eig0.abs() <= eig2.abs() {
        eig0
    } else if eig1.abs() <= eig2.abs() {
        eig1
    } else {
        eig2
    };

    // (A - λI) has rank <= 2; the cross product of two independent rows
    // spans its null space, which is the eigenvector.
    let r00 = a00 - lambda;
    let r11 = a11 - lambda;
    let r22 = a22 - lambda;

    let candidates = [
        Vector3::new(
            a01 * a12 - r11 * a02,
            a02 * a01 - a12 * r00,
            r00 * r11 - a01 * a01,
        ),
        Vector3::new(
            a01 * r22 - a12 * a02,
            a02 * a02 - r22 * r00,
            r00 * a12 - a01 * a02,
        ),
        Vector3::new(
            r11 * r22 - a12 * a12,
            a12 * a02 - r22 * a01,
            a01 * a12 - r11 * a02,
        ),
    ];
    candidates
        .into_iter()
        .find(|v| v.norm_squared() >= 1e-30)
}
