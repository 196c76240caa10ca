/// Sensor model and pipeline parameters, immutable for one run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UncertaintyParameters {
    /// Sensor base 1-sigma range accuracy, in metres.
    pub base_range_accuracy: f64,
    /// Sensor base 1-sigma angular accuracy, in radians.
    pub base_angle_accuracy: f64,
    /// Coefficient of the intensity effect on range uncertainty.
    pub c_intensity: f64,
    /// Guard against division by zero in the intensity term.
    pub epsilon: f64,
    /// Coefficient of the angle-of-incidence term.
    pub c_aoi: f64,
    /// Guard against division by zero in the angle-of-incidence term; also
    /// sets the conservative worst case `c_aoi / epsilon_aoi` used when the
    /// surface normal is unreliable.
    pub epsilon_aoi: f64,
    /// Variance penalty assigned to suspected mixed pixels.
    pub penalty_mixed: f64,
    /// Neighborhood size of the mixed-pixel check.
    pub k_mixed: usize,
    /// Along-ray depth offset beyond which a neighbor counts as in front
    /// of / behind the point.
    pub depth_thresh_mixed: f64,
    /// Minimum in-front neighbor count for the mixed-pixel flag.
    pub min_front_mixed: usize,
    /// Minimum behind neighbor count for the mixed-pixel flag.
    pub min_behind_mixed: usize,
    /// Records per streaming chunk; bounds peak memory.
    pub chunk_size: usize,
    /// Neighborhood size of the Pass 1 plane fit.
    pub k_normals: usize,
}

impl Default for UncertaintyParameters {
    fn default() -> Self {
        Self {
            base_range_accuracy: 0.02,
            base_angle_accuracy: 0.0035,
            c_intensity: 0.5,
            epsilon: 0.01,
            c_aoi: 0.1,
            epsilon_aoi: 0.01,
            penalty_mixed: 0.5,
            k_mixed: 8,
            depth_thresh_mixed: 0.05,
            min_front_mixed: 1,
            min_behind_mixed: 1,
            chunk_size: 1_000_000,
            k_normals: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_sensor_model() {
        let p = UncertaintyParameters::default();
        assert_eq!(p.base_range_accuracy, 0.02);
        assert_eq!(p.base_angle_accuracy, 0.0035);
        assert_eq!(p.k_mixed, 8);
        assert_eq!(p.chunk_size, 1_000_000);
    }
}
