use nalgebra::Vector3;
use raycloud_core::{CloudChunk, Variances};
use raycloud_spatial::{KdTreeIndex, NeighborIndex};
use rayon::prelude::*;

use crate::params::UncertaintyParameters;

/// One record's variance decomposition before aggregation.
struct VarianceRow {
    range: f64,
    angular: f64,
    aoi: f64,
    mixed: f64,
    degenerate_normal: bool,
}

/// Pass 2 session: computes the four-component variance decomposition for
/// each record of each chunk.
///
/// Owns the per-run "already warned" state for degenerate normals, so the
/// fallback diagnostic is emitted at most once per pass no matter how many
/// records fall back.
pub struct UncertaintyPass {
    params: UncertaintyParameters,
    warned_degenerate: bool,
}

impl UncertaintyPass {
    pub fn new(params: UncertaintyParameters) -> Self {
        Self {
            params,
            warned_degenerate: false,
        }
    }

    pub fn params(&self) -> &UncertaintyParameters {
        &self.params
    }

    /// Compute variances for every record of `chunk`.
    ///
    /// The mixed-pixel check sees neighbors within this chunk only, an
    /// accepted accuracy loss versus full-cloud visibility that grows as
    /// the chunk size approaches `k_mixed`.
    ///
    /// # Panics
    ///
    /// Panics if the chunk carries no origins; call
    /// [`CloudChunk::ensure_origins`] first for plain point clouds.
    pub fn process_chunk(&mut self, chunk: &CloudChunk) -> Variances {
        assert!(
            chunk.has_origins(),
            "variance computation needs ray origins"
        );
        let n = chunk.len();
        let points = chunk.points_array();
        let index = KdTreeIndex::build(&points);

        let rows: Vec<VarianceRow> = (0..n)
            .into_par_iter()
            .map(|i| self.point_variance(chunk, &points, &index, i))
            .collect();

        let mut variances = Variances::with_capacity(n);
        let mut any_degenerate = false;
        for row in rows {
            any_degenerate |= row.degenerate_normal;
            variances.push(row.range, row.angular, row.aoi, row.mixed);
        }
        if any_degenerate && !self.warned_degenerate {
            log::warn!(
                "unreliable surface normals encountered; using the worst-case \
                 angle-of-incidence term for those points"
            );
            self.warned_degenerate = true;
        }
        variances
    }

    fn point_variance(
        &self,
        chunk: &CloudChunk,
        points: &[[f64; 3]],
        index: &KdTreeIndex,
        i: usize,
    ) -> VarianceRow {
        let p = &self.params;
        let end = chunk.point(i);
        let start = chunk.origin(i);
        let d = end - start;
        let range_sq = d.norm_squared();

        let base_range_variance = p.base_range_accuracy * p.base_range_accuracy;
        let base_angle_variance = p.base_angle_accuracy * p.base_angle_accuracy;

        let intensity = chunk.intensity(i).unwrap_or(0.5);
        let range = base_range_variance * (1.0 + p.c_intensity / (intensity + p.epsilon));
        let angular = range_sq * base_angle_variance;

        let (aoi, degenerate_normal) = self.aoi_variance(chunk, i, d, range_sq);
        let mixed = self.mixed_pixel_variance(points, index, i, d, range_sq);

        VarianceRow {
            range,
            angular,
            aoi,
            mixed,
            degenerate_normal,
        }
    }

    /// Angle-of-incidence term. Falls back to the conservative worst case
    /// `c_aoi / epsilon_aoi` (the grazing-incidence value) when the stored
    /// normal is the unreliable sentinel, the ray has zero length, or the
    /// normal faces away from the sensor.
    fn aoi_variance(
        &self,
        chunk: &CloudChunk,
        i: usize,
        d: Vector3<f64>,
        range_sq: f64,
    ) -> (f64, bool) {
        let p = &self.params;
        let fallback = p.c_aoi / p.epsilon_aoi;

        let normal = match chunk.normal(i) {
            Some(n) if n.norm_squared() > 0.0 => n,
            _ => return (fallback, true),
        };
        if range_sq <= 0.0 {
            return (fallback, true);
        }

        let to_sensor = -d / range_sq.sqrt();
        let cos_theta = to_sensor.dot(&normal);
        if cos_theta <= 0.0 {
            return (fallback, true);
        }
        (p.c_aoi / (cos_theta + p.epsilon_aoi), false)
    }

    /// Mixed-pixel term: a point whose chunk-local neighborhood splits into
    /// clusters in front of and behind it along the ray straddles a depth
    /// discontinuity and gets the penalty variance.
    fn mixed_pixel_variance(
        &self,
        points: &[[f64; 3]],
        index: &KdTreeIndex,
        i: usize,
        d: Vector3<f64>,
        range_sq: f64,
    ) -> f64 {
        let p = &self.params;
        if p.penalty_mixed == 0.0 || range_sq <= 0.0 {
            return 0.0;
        }

        let ray_dir = d / range_sq.sqrt();
        let mut front = 0usize;
        let mut behind = 0usize;
        // One extra neighbor so dropping the query point itself still
        // leaves k_mixed candidates.
        for j in index.knn(&points[i], p.k_mixed + 1) {
            if j == i {
                continue;
            }
            let offset = Vector3::new(
                points[j][0] - points[i][0],
                points[j][1] - points[i][1],
                points[j][2] - points[i][2],
            );
            let depth = offset.dot(&ray_dir);
            if depth < -p.depth_thresh_mixed {
                front += 1;
            } else if depth > p.depth_thresh_mixed {
                behind += 1;
            }
        }

        if front >= p.min_front_mixed && behind >= p.min_behind_mixed {
            p.penalty_mixed
        } else {
            0.0
        }
    }
}
