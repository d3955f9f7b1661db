// demos/reconstruct.rs
//
// Run one reconstruction problem against a dense folder and export the
// results.
//
// Usage:
//   cargo run --example reconstruct --release -- <dense_folder> <ref_id> [src_id ...] [options]
//
// Options:
//   --gpu              use the wgpu backend (default: host)
//   --geom             geometric consistency against previous depth/normal maps
//   --multi-geometry   geometric consistency against the *_geom maps
//   --hierarchy        seed from a coarser pass; upsamples its depth first
//   --max-size N       longest image side (default 3200)
//
// Dense folder layout:
//   <dense>/images/%08d.jpg, <dense>/cams/%08d_cam.txt
//
// Output, under <dense>/CNVR/2333_<ref_id>/:
//   depths.dmb | depths_geom.dmb, normals.dmb, costs.dmb
//   points.ply, depth_preview.png, normal_preview.png, cost_preview.png
//
// The propagation kernel is not part of this crate. The demo plugs in a
// stand-in that keeps any seeded prior and otherwise fills fronto-parallel
// planes at the middle of the depth range.
//
// Set RUST_LOG=info (or debug) for progress output.

use patchmvs::backend::ComputeBackend;
use patchmvs::camera::{fit_within, rescale_image_and_camera};
use patchmvs::config::{JbuConfig, ModeFlags, PassParams, ReconstructionConfig};
use patchmvs::dmb::{read_depth, result_dir, result_path, MapKind, NormalMap};
use patchmvs::gpu::GpuBackend;
use patchmvs::host::HostBackend;
use patchmvs::image::Image;
use patchmvs::jbu::{JointBilateralUpsampler, UpsampleOutcome};
use patchmvs::ply::write_ply;
use patchmvs::preview::{cost_preview, depth_preview, normal_preview, save_preview};
use patchmvs::problem::{DenseFolder, ImageSource, Problem};
use patchmvs::state::{DeviceResources, PlaneHypothesis, ReconstructionState};
use patchmvs::{MvsError, Result};

use image::DynamicImage;
use std::env;
use std::path::PathBuf;

struct Options {
    dense: PathBuf,
    problem: Problem,
    gpu: bool,
    config: ReconstructionConfig,
}

fn parse_args() -> Option<Options> {
    let args: Vec<String> = env::args().collect();
    let mut positional = Vec::new();
    let mut gpu = false;
    let mut modes = ModeFlags::default();
    let mut max_size = 3200u32;

    let mut it = args.iter().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--gpu" => gpu = true,
            "--geom" => modes.geom_consistency = true,
            "--multi-geometry" => {
                modes.geom_consistency = true;
                modes.multi_geometry = true;
            }
            "--hierarchy" => modes.hierarchy = true,
            "--max-size" => max_size = it.next()?.parse().ok()?,
            other => positional.push(other.to_string()),
        }
    }
    if positional.len() < 2 {
        return None;
    }

    let dense = PathBuf::from(&positional[0]);
    let ref_id: u32 = positional[1].parse().ok()?;
    let src_ids: Vec<u32> = positional[2..].iter().map(|s| s.parse().ok()).collect::<Option<_>>()?;

    let mut config = ReconstructionConfig::default();
    if modes.geom_consistency {
        config = config.with_geom_consistency(modes.multi_geometry);
    }
    if modes.hierarchy {
        config = config.with_hierarchy();
    }

    Some(Options {
        dense,
        problem: Problem::new(ref_id, src_ids, max_size),
        gpu,
        config,
    })
}

fn main() {
    env_logger::init();

    let Some(opts) = parse_args() else {
        let prog = env::args().next().unwrap_or_else(|| "reconstruct".into());
        eprintln!("Usage: {prog} <dense_folder> <ref_id> [src_id ...] [--gpu] [--geom] [--multi-geometry] [--hierarchy] [--max-size N]");
        std::process::exit(1);
    };

    let result = if opts.gpu {
        GpuBackend::new().and_then(|backend| run(&backend, &opts))
    } else {
        run(&HostBackend::new(), &opts)
    };

    match result {
        Ok(()) => {}
        Err(MvsError::Recoverable(e)) => {
            eprintln!("problem {} skipped: {e}", opts.problem.ref_image_id);
            std::process::exit(1);
        }
        Err(fatal) => {
            eprintln!("aborting: {fatal}");
            std::process::exit(2);
        }
    }
}

fn run<B: ComputeBackend>(backend: &B, opts: &Options) -> Result<()> {
    let folder = DenseFolder::new(&opts.dense);
    let ref_id = opts.problem.ref_image_id;
    let layout = &opts.config.layout;

    if opts.config.modes.hierarchy {
        upsample_coarse_depth(backend, opts, &folder)?;
    }

    let mut state = ReconstructionState::new(backend, opts.config.clone(), &opts.dense);
    state.input_initialization(&opts.problem, &folder)?;
    state.device_initialization()?;

    let (w, h) = (state.reference_width(), state.reference_height());
    let seeded = opts.config.modes.geom_consistency || opts.config.modes.hierarchy;
    let mut kernel = |b: &B, res: &DeviceResources<B>, p: &PassParams| -> Result<()> {
        if seeded {
            return Ok(());
        }
        let mid = 2.0 * p.depth_min * p.depth_max / (p.depth_min + p.depth_max);
        let hyps = vec![PlaneHypothesis::new([0.0, 0.0, -1.0], mid); w * h];
        b.write_buffer(res.hypotheses(), 0, bytemuck::cast_slice(&hyps))?;
        b.synchronize()
    };
    state.run_pass(&mut kernel)?;

    for path in state.persist_results()? {
        println!("wrote {}", path.display());
    }

    let dir = result_dir(&opts.dense, ref_id, layout);
    let ply = dir.join("points.ply");
    write_ply(&ply, &state.point_records())?;
    println!("wrote {}", ply.display());

    let mut depth = Image::new(w, h);
    let mut normals = NormalMap::new(w, h);
    for (i, hyp) in state.plane_hypotheses().iter().enumerate() {
        depth.set(i % w, i / w, hyp.depth);
        normals.set(i % w, i / w, hyp.normal());
    }
    let cost = Image::from_vec(w, h, state.costs().to_vec());
    save_preview(
        &dir.join("depth_preview.png"),
        DynamicImage::ImageLuma8(depth_preview(&depth, state.depth_range())),
    )?;
    save_preview(&dir.join("normal_preview.png"), DynamicImage::ImageRgb8(normal_preview(&normals)))?;
    save_preview(&dir.join("cost_preview.png"), DynamicImage::ImageLuma8(cost_preview(&cost)))?;

    let snap = state.ledger();
    println!(
        "{}: {} allocations, {} barriers",
        backend.name(),
        snap.allocations(),
        snap.barriers
    );
    Ok(())
}

/// Bring the coarse pass's depth up to the reference resolution so the
/// hierarchical pass can read it.
fn upsample_coarse_depth<B: ComputeBackend>(backend: &B, opts: &Options, folder: &DenseFolder) -> Result<()> {
    let ref_id = opts.problem.ref_image_id;
    let guide = folder.load_image(ref_id)?;
    let camera = folder.load_camera(ref_id)?;
    let guide = match fit_within(opts.problem.cur_image_size as usize, guide.width(), guide.height()) {
        Some(target) => rescale_image_and_camera(&guide, target, &camera).0,
        None => guide,
    };

    let coarse = read_depth(&result_path(&opts.dense, ref_id, MapKind::Depth, &opts.config.layout))?;
    let upsampler = JointBilateralUpsampler::new(backend, JbuConfig::default(), opts.config.layout.clone());
    match upsampler.run(&guide, &coarse, &opts.dense, ref_id)? {
        UpsampleOutcome::SameResolution => println!("coarse depth already at {}x{}", guide.width(), guide.height()),
        UpsampleOutcome::Upsampled(report) => {
            println!("upsampled x{} to {}", report.scale, report.path.display());
            if !report.is_clean() {
                println!("  {} NaN depths", report.nan_pixels);
            }
        }
    }
    Ok(())
}
