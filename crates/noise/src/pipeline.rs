use std::fs;
use std::path::{Path, PathBuf};

use raycloud_io::{ChunkedReader, ChunkedWriter, CloudSchema, Result};
use raycloud_normals::estimate_chunk_normals;

use crate::params::UncertaintyParameters;
use crate::variance::UncertaintyPass;

/// Progress of one two-pass run. Any I/O failure moves to `Failed` and
/// aborts; partially written files are left on disk for inspection.
/// Cleanup after a failure is the caller's policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Idle,
    Pass1Streaming,
    Pass1Finalize,
    Pass2Streaming,
    Pass2Finalize,
    Done,
    Failed,
}

/// Counts reported by a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoiseSummary {
    /// Records in the final output.
    pub records: u64,
    /// The Pass 1 file, when retained.
    pub intermediate: Option<PathBuf>,
}

/// The two-pass uncertainty pipeline.
///
/// Pass 1 streams the raw cloud and writes an intermediate file with
/// per-point surface normals; Pass 2 streams the intermediate file and
/// writes the final cloud with the four-component variance decomposition.
/// The intermediate file is the explicit checkpoint between the passes:
/// normal estimation needs a larger neighborhood than any single bounded
/// chunk can guarantee, so the estimate is persisted rather than carried
/// in memory. Peak memory stays O(chunk_size) throughout.
///
/// The intermediate file is owned by the pipeline; after a successful run
/// it is deleted unless [`keep_intermediate`] was requested.
///
/// [`keep_intermediate`]: NoisePipeline::keep_intermediate
#[derive(Debug, Clone)]
pub struct NoisePipeline {
    params: UncertaintyParameters,
    keep_intermediate: bool,
    stage: PipelineStage,
}

/// Path of the Pass 1 checkpoint for a given output path.
pub fn intermediate_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("cloud");
    output.with_file_name(format!("{stem}_normals.ply"))
}

impl NoisePipeline {
    pub fn new(params: UncertaintyParameters) -> Self {
        Self {
            params,
            keep_intermediate: false,
            stage: PipelineStage::Idle,
        }
    }

    /// Retain the intermediate file after a successful run.
    pub fn keep_intermediate(mut self, keep: bool) -> Self {
        self.keep_intermediate = keep;
        self
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    /// Run both passes, input to output.
    pub fn run(&mut self, input: &Path, output: &Path) -> Result<NoiseSummary> {
        let intermediate = intermediate_path(output);
        match self.run_inner(input, output, &intermediate) {
            Ok(summary) => Ok(summary),
            Err(err) => {
                self.stage = PipelineStage::Failed;
                Err(err)
            }
        }
    }

    fn run_inner(
        &mut self,
        input: &Path,
        output: &Path,
        intermediate: &Path,
    ) -> Result<NoiseSummary> {
        let pass1_records = self.run_pass1(input, intermediate)?;
        log::info!(
            "pass 1 complete: {} records, normals written to {}",
            pass1_records,
            intermediate.display()
        );

        let records = self.run_pass2(intermediate, output)?;
        log::info!("pass 2 complete: {} records written to {}", records, output.display());

        let kept = if self.keep_intermediate {
            Some(intermediate.to_path_buf())
        } else {
            if let Err(err) = fs::remove_file(intermediate) {
                // Not fatal: the output is already complete.
                log::warn!(
                    "{}: could not remove intermediate file: {}",
                    intermediate.display(),
                    err
                );
            }
            None
        };

        self.stage = PipelineStage::Done;
        Ok(NoiseSummary {
            records,
            intermediate: kept,
        })
    }

    /// Pass 1: stream the raw cloud, estimate chunk-local surface normals,
    /// write the intermediate file.
    fn run_pass1(&mut self, input: &Path, intermediate: &Path) -> Result<u64> {
        self.stage = PipelineStage::Pass1Streaming;
        let reader = ChunkedReader::open(input)?;
        if !reader.is_ray_cloud() {
            log::warn!(
                "{}: no per-record ray origins; assuming a sensor at the coordinate origin",
                input.display()
            );
        }

        let mut writer =
            ChunkedWriter::create(intermediate, CloudSchema::ray_cloud().with_normals())?;
        let k = self.params.k_normals;
        reader.for_each_chunk(self.params.chunk_size, |mut chunk| {
            chunk.ensure_origins();
            chunk.normals = Some(estimate_chunk_normals(&chunk, k));
            writer.append(&chunk)
        })?;

        self.stage = PipelineStage::Pass1Finalize;
        writer.finish()
    }

    /// Pass 2: stream the intermediate file, compute the variance
    /// decomposition, write the final cloud.
    fn run_pass2(&mut self, intermediate: &Path, output: &Path) -> Result<u64> {
        self.stage = PipelineStage::Pass2Streaming;
        let reader = ChunkedReader::open(intermediate)?;
        let mut writer =
            ChunkedWriter::create(output, CloudSchema::ray_cloud().with_variances())?;
        let mut pass = UncertaintyPass::new(self.params);
        reader.for_each_chunk(self.params.chunk_size, |mut chunk| {
            chunk.variances = Some(pass.process_chunk(&chunk));
            writer.append(&chunk)
        })?;

        self.stage = PipelineStage::Pass2Finalize;
        writer.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::Vector3;
    use raycloud_core::CloudChunk;
    use raycloud_io::{read_record, ChunkedWriter, CloudSchema, Error};
    use tempfile::tempdir;

    fn write_ray_fixture(path: &Path, chunk: &CloudChunk) {
        let mut writer = ChunkedWriter::create(path, CloudSchema::ray_cloud()).unwrap();
        writer.append(chunk).unwrap();
        writer.finish().unwrap();
    }

    fn run(params: UncertaintyParameters, input: &Path, output: &Path) -> NoiseSummary {
        let mut pipeline = NoisePipeline::new(params);
        let summary = pipeline.run(input, output).unwrap();
        assert_eq!(pipeline.stage(), PipelineStage::Done);
        summary
    }

    /// Two isolated rays from the origin: range 1 with intensity 204/255
    /// and range 2 with intensity 77/255.
    fn basic_fixture() -> CloudChunk {
        let mut chunk = CloudChunk::new();
        chunk.push_ray(
            Vector3::zeros(),
            Vector3::new(1.0, 0.0, 0.0),
            0.0,
            [120, 120, 120, 204],
        );
        chunk.push_ray(
            Vector3::zeros(),
            Vector3::new(0.0, 2.0, 0.0),
            0.1,
            [90, 90, 90, 77],
        );
        chunk
    }

    /// Two planar patches, far apart. Record 0 sits on a 45-degree plane
    /// and is hit from straight above at range sqrt(2); record 1 sits on a
    /// horizontal plane and is hit head-on at range 1.
    fn aoi_fixture() -> CloudChunk {
        let mut chunk = CloudChunk::new();
        let p0 = Vector3::new(0.0, 0.0, 1.0);
        chunk.push_ray(p0 + Vector3::new(0.0, 0.0, 2f64.sqrt()), p0, 0.0, [0, 0, 0, 255]);
        let p1 = Vector3::new(10.0, 0.0, 0.0);
        chunk.push_ray(p1 + Vector3::new(0.0, 0.0, 1.0), p1, 0.1, [0, 0, 0, 255]);

        let grid = [-0.5, -0.25, 0.0, 0.25, 0.5];
        for &u in &grid {
            for &v in &grid {
                if u == 0.0 && v == 0.0 {
                    continue;
                }
                // Tilted patch: z = x + 1.
                let end = Vector3::new(u, v, u + 1.0);
                chunk.push_ray(end + Vector3::new(0.0, 0.0, 2.0), end, 0.2, [0, 0, 0, 255]);
                // Flat patch: z = 0 around x = 10.
                let end = Vector3::new(10.0 + u, v, 0.0);
                chunk.push_ray(end + Vector3::new(0.0, 0.0, 2.0), end, 0.3, [0, 0, 0, 255]);
            }
        }
        chunk
    }

    /// Record 0 straddles a depth discontinuity between a wall at z = 1
    /// and a wall at z = 2; record 1 sits on a flat wall near x = 10 at
    /// range sqrt(1.01). Record order matters: with a small chunk size the
    /// straddler's chunk no longer spans both walls.
    fn mixed_fixture() -> CloudChunk {
        let mut chunk = CloudChunk::new();
        chunk.push_ray(Vector3::zeros(), Vector3::new(0.0, 0.0, 1.5), 0.0, [0, 0, 0, 255]);
        chunk.push_ray(
            Vector3::new(10.0, 0.0, 0.0),
            Vector3::new(10.1, 0.0, 1.0),
            0.1,
            [0, 0, 0, 255],
        );

        let corners = [(0.25, 0.25), (0.25, -0.25), (-0.25, 0.25), (-0.25, -0.25)];
        for &(dx, dy) in &corners {
            chunk.push_ray(Vector3::zeros(), Vector3::new(dx, dy, 1.0), 0.2, [0, 0, 0, 255]);
        }
        for &(dx, dy) in &corners {
            chunk.push_ray(Vector3::zeros(), Vector3::new(dx, dy, 2.0), 0.3, [0, 0, 0, 255]);
        }
        let grid = [-0.25, 0.0, 0.25];
        for &u in &grid {
            for &v in &grid {
                if u == 0.0 && v == 0.0 {
                    continue;
                }
                let end = Vector3::new(10.0 + u, v, 1.0);
                chunk.push_ray(end - Vector3::new(0.1, 0.0, 1.0), end, 0.4, [0, 0, 0, 255]);
            }
        }
        chunk
    }

    #[test]
    fn basic_fixture_range_and_angular_terms() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("basic.ply");
        let output = dir.path().join("out.ply");
        write_ray_fixture(&input, &basic_fixture());

        let params = UncertaintyParameters {
            c_aoi: 0.0,
            penalty_mixed: 0.0,
            c_intensity: 0.5,
            epsilon: 0.01,
            ..Default::default()
        };
        let summary = run(params, &input, &output);
        assert_eq!(summary.records, 2);

        let rec = read_record(&output, 0).unwrap();
        let v = rec.variances.as_ref().unwrap();
        assert_abs_diff_eq!(v.range[0], 0.0006469135802469136, epsilon = 1e-6);
        assert_abs_diff_eq!(v.angular[0], 0.00001225, epsilon = 1e-6);
        assert_abs_diff_eq!(v.total[0], 0.0006591635802469136, epsilon = 1e-6);
        assert_eq!(v.aoi[0], 0.0);
        assert_eq!(v.mixed[0], 0.0);

        let rec = read_record(&output, 1).unwrap();
        let v = rec.variances.as_ref().unwrap();
        assert_abs_diff_eq!(v.range[0], 0.001041108682800641, epsilon = 1e-6);
        assert_abs_diff_eq!(v.angular[0], 0.000049, epsilon = 1e-6);
        assert_abs_diff_eq!(v.total[0], 0.001090108682800641, epsilon = 1e-6);
    }

    #[test]
    fn aoi_fixture_angle_of_incidence_terms() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("aoi.ply");
        let output = dir.path().join("out.ply");
        write_ray_fixture(&input, &aoi_fixture());

        let params = UncertaintyParameters {
            c_intensity: 0.0,
            penalty_mixed: 0.0,
            ..Default::default()
        };
        run(params, &input, &output);

        // 45-degree incidence: cos = 1/sqrt(2).
        let rec = read_record(&output, 0).unwrap();
        let v = rec.variances.as_ref().unwrap();
        assert_abs_diff_eq!(v.range[0], 0.0004, epsilon = 1e-9);
        assert_abs_diff_eq!(v.angular[0], 0.0000245, epsilon = 1e-9);
        assert_abs_diff_eq!(v.aoi[0], 0.1394483609039869, epsilon = 1e-6);
        assert_abs_diff_eq!(v.total[0], 0.1398728609039869, epsilon = 1e-6);

        // Head-on incidence: cos = 1.
        let rec = read_record(&output, 1).unwrap();
        let v = rec.variances.as_ref().unwrap();
        assert_abs_diff_eq!(v.angular[0], 0.00001225, epsilon = 1e-9);
        assert_abs_diff_eq!(v.aoi[0], 0.09900990099009901, epsilon = 1e-9);
        assert_abs_diff_eq!(v.total[0], 0.09942215099009901, epsilon = 1e-9);
    }

    #[test]
    fn mixed_fixture_flags_only_the_straddler() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("mixed.ply");
        let output = dir.path().join("out.ply");
        write_ray_fixture(&input, &mixed_fixture());

        let params = UncertaintyParameters {
            c_intensity: 0.0,
            c_aoi: 0.0,
            ..Default::default()
        };
        run(params, &input, &output);

        let rec = read_record(&output, 0).unwrap();
        let v = rec.variances.as_ref().unwrap();
        assert_eq!(v.mixed[0], 0.5);
        assert_abs_diff_eq!(v.total[0], 0.5004275625, epsilon = 1e-6);

        let rec = read_record(&output, 1).unwrap();
        let v = rec.variances.as_ref().unwrap();
        assert_eq!(v.mixed[0], 0.0);
        assert_abs_diff_eq!(v.total[0], 0.0004123725, epsilon = 1e-6);
    }

    #[test]
    fn mixed_flag_disappears_when_chunks_shrink_below_k() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("mixed.ply");
        let output = dir.path().join("out.ply");
        write_ray_fixture(&input, &mixed_fixture());

        // chunk_size < k_mixed: the straddler's chunk no longer contains
        // both walls, so the discontinuity is invisible.
        let params = UncertaintyParameters {
            c_intensity: 0.0,
            c_aoi: 0.0,
            chunk_size: 4,
            ..Default::default()
        };
        run(params, &input, &output);

        let rec = read_record(&output, 0).unwrap();
        assert_eq!(rec.variances.as_ref().unwrap().mixed[0], 0.0);
        let rec = read_record(&output, 1).unwrap();
        assert_eq!(rec.variances.as_ref().unwrap().mixed[0], 0.0);
    }

    #[test]
    fn total_variance_invariant_holds_for_every_record() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("mixed.ply");
        let output = dir.path().join("out.ply");
        write_ray_fixture(&input, &mixed_fixture());

        run(UncertaintyParameters::default(), &input, &output);

        let mut checked = 0;
        raycloud_io::ChunkedReader::open(&output)
            .unwrap()
            .for_each_chunk(5, |chunk| {
                let v = chunk.variances.as_ref().unwrap();
                for i in 0..chunk.len() {
                    let sum = v.range[i] + v.angular[i] + v.aoi[i] + v.mixed[i];
                    assert!((v.total[i] - sum).abs() < 1e-9);
                    checked += 1;
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(checked, mixed_fixture().len());
    }

    #[test]
    fn intermediate_file_is_removed_by_default() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("basic.ply");
        let output = dir.path().join("out.ply");
        write_ray_fixture(&input, &basic_fixture());

        let summary = run(UncertaintyParameters::default(), &input, &output);
        assert!(summary.intermediate.is_none());
        assert!(!intermediate_path(&output).exists());
    }

    #[test]
    fn intermediate_file_can_be_kept() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("basic.ply");
        let output = dir.path().join("out.ply");
        write_ray_fixture(&input, &basic_fixture());

        let mut pipeline =
            NoisePipeline::new(UncertaintyParameters::default()).keep_intermediate(true);
        let summary = pipeline.run(&input, &output).unwrap();
        let kept = summary.intermediate.unwrap();
        assert_eq!(kept, intermediate_path(&output));
        assert!(kept.exists());

        // The checkpoint is itself a readable ray cloud with normals.
        let rec = read_record(&kept, 0).unwrap();
        assert!(rec.normals.is_some());
    }

    #[test]
    fn missing_input_fails_and_marks_the_pipeline() {
        let dir = tempdir().unwrap();
        let mut pipeline = NoisePipeline::new(UncertaintyParameters::default());
        let err = pipeline
            .run(&dir.path().join("nope.ply"), &dir.path().join("out.ply"))
            .unwrap_err();
        assert!(matches!(err, Error::Io { .. }), "{err:?}");
        assert_eq!(pipeline.stage(), PipelineStage::Failed);
    }

    #[test]
    fn point_cloud_input_assumes_origin_sensors() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("points.ply");
        let output = dir.path().join("out.ply");

        let mut chunk = CloudChunk::new();
        chunk.push_point(Vector3::new(3.0, 4.0, 0.0), 0.0, [0, 0, 0, 255]);
        let mut writer = ChunkedWriter::create(&input, CloudSchema::point_cloud()).unwrap();
        writer.append(&chunk).unwrap();
        writer.finish().unwrap();

        let params = UncertaintyParameters {
            c_intensity: 0.0,
            c_aoi: 0.0,
            penalty_mixed: 0.0,
            ..Default::default()
        };
        run(params, &input, &output);

        // Range is |end - (0,0,0)| = 5.
        let rec = read_record(&output, 0).unwrap();
        let v = rec.variances.as_ref().unwrap();
        assert_abs_diff_eq!(v.angular[0], 25.0 * 0.0035 * 0.0035, epsilon = 1e-12);
    }

    #[test]
    fn empty_input_produces_an_empty_output() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("empty.ply");
        let output = dir.path().join("out.ply");
        let writer = ChunkedWriter::create(&input, CloudSchema::ray_cloud()).unwrap();
        writer.finish().unwrap();

        let summary = run(UncertaintyParameters::default(), &input, &output);
        assert_eq!(summary.records, 0);
        assert_eq!(
            raycloud_io::ChunkedReader::open(&output).unwrap().record_count(),
            0
        );
    }
}
