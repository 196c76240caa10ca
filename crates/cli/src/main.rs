//! Derive per-point positional uncertainty for a ray cloud.
//!
//! Usage:
//!   raynoise input.ply output.ply
//!   raynoise input.ply output.ply --base_range_accuracy 0.03 --chunk_size 500000
//!
//! Enable progress logging with RUST_LOG=info.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use raycloud_noise::{NoisePipeline, UncertaintyParameters};

/// Attach a per-point positional-uncertainty estimate to a ray cloud.
///
/// Runs two streaming passes over the input: the first estimates surface
/// normals and checkpoints them to an intermediate file, the second
/// computes a four-component variance decomposition per point and writes
/// the final cloud. Memory stays bounded by --chunk_size throughout.
#[derive(Parser, Debug)]
#[command(name = "raynoise", version)]
struct Args {
    /// Input cloud (binary little-endian PLY)
    input: PathBuf,

    /// Output cloud with per-point variance fields
    output: PathBuf,

    /// Sensor base 1-sigma range accuracy (metres)
    #[arg(long = "base_range_accuracy", default_value_t = 0.02)]
    base_range_accuracy: f64,

    /// Sensor base 1-sigma angular accuracy (radians)
    #[arg(long = "base_angle_accuracy", default_value_t = 0.0035)]
    base_angle_accuracy: f64,

    /// Coefficient for the intensity effect on range uncertainty
    #[arg(long = "c_intensity", default_value_t = 0.5)]
    c_intensity: f64,

    /// Small value to prevent division by zero with intensity
    #[arg(long = "epsilon", default_value_t = 0.01)]
    epsilon: f64,

    /// Coefficient for the angle-of-incidence term
    #[arg(long = "c_aoi", default_value_t = 0.1)]
    c_aoi: f64,

    /// Small value to prevent division by zero at grazing incidence
    #[arg(long = "epsilon_aoi", default_value_t = 0.01)]
    epsilon_aoi: f64,

    /// Variance penalty assigned to suspected mixed pixels
    #[arg(long = "penalty_mixed", default_value_t = 0.5)]
    penalty_mixed: f64,

    /// Neighborhood size of the mixed-pixel check
    #[arg(long = "k_mixed", default_value_t = 8)]
    k_mixed: usize,

    /// Along-ray depth threshold of the mixed-pixel check (metres)
    #[arg(long = "depth_thresh_mixed", default_value_t = 0.05)]
    depth_thresh_mixed: f64,

    /// Minimum in-front neighbors for the mixed-pixel flag
    #[arg(long = "min_front_mixed", default_value_t = 1)]
    min_front_mixed: usize,

    /// Minimum behind neighbors for the mixed-pixel flag
    #[arg(long = "min_behind_mixed", default_value_t = 1)]
    min_behind_mixed: usize,

    /// Records per streaming chunk; bounds peak memory
    #[arg(long = "chunk_size", default_value_t = 1_000_000)]
    chunk_size: usize,

    /// Neighborhood size of the surface-normal fit
    #[arg(long = "k_normals", default_value_t = 16)]
    k_normals: usize,

    /// Retain the intermediate normals file after a successful run
    #[arg(long = "keep-intermediate")]
    keep_intermediate: bool,
}

impl Args {
    fn params(&self) -> UncertaintyParameters {
        UncertaintyParameters {
            base_range_accuracy: self.base_range_accuracy,
            base_angle_accuracy: self.base_angle_accuracy,
            c_intensity: self.c_intensity,
            epsilon: self.epsilon,
            c_aoi: self.c_aoi,
            epsilon_aoi: self.epsilon_aoi,
            penalty_mixed: self.penalty_mixed,
            k_mixed: self.k_mixed,
            depth_thresh_mixed: self.depth_thresh_mixed,
            min_front_mixed: self.min_front_mixed,
            min_behind_mixed: self.min_behind_mixed,
            chunk_size: self.chunk_size,
            k_normals: self.k_normals,
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    if args.chunk_size == 0 {
        eprintln!("raynoise: --chunk_size must be at least 1");
        return ExitCode::FAILURE;
    }

    let mut pipeline =
        NoisePipeline::new(args.params()).keep_intermediate(args.keep_intermediate);
    match pipeline.run(&args.input, &args.output) {
        Ok(summary) => {
            println!(
                "wrote {} records to {}",
                summary.records,
                args.output.display()
            );
            if let Some(kept) = summary.intermediate {
                println!("kept intermediate normals file {}", kept.display());
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("raynoise: {err}");
            ExitCode::FAILURE
        }
    }
}
