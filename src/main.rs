use std::io::Write as _;
use std::path::PathBuf;

use atomgrid::compute::ComputeBackend as _;
use atomgrid::{Atom, FramePipeline, Options, RadiusTable};
use clap::Parser;
use glam::Vec3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Parser)]
#[command(name = "atomgrid")]
#[command(about = "Build the per-frame sparse voxel index over a synthetic trajectory")]
struct Args {
    /// Options TOML file (defaults apply to missing fields)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Atoms per frame
    #[arg(short, long, default_value = "20000")]
    atoms: usize,

    /// Frames to build
    #[arg(short, long, default_value = "30")]
    frames: u64,

    /// Half-width of the cube atoms start in (nm)
    #[arg(long, default_value = "4.0")]
    spread: f32,

    /// Per-frame displacement of each atom (nm)
    #[arg(long, default_value = "0.02")]
    step: f32,

    /// Random seed for the initial positions
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Write the options JSON schema to stdout and exit
    #[arg(long)]
    print_schema: bool,
}

fn random_atoms(rng: &mut StdRng, count: usize, spread: f32) -> Vec<Atom> {
    (0..count)
        .map(|_| {
            let position = Vec3::new(
                rng.random_range(-spread..spread),
                rng.random_range(-spread..spread),
                rng.random_range(-spread..spread),
            );
            // Mostly carbon, nitrogen and oxygen.
            let element = match rng.random_range(0..10) {
                0..=5 => 6,
                6..=7 => 7,
                8 => 8,
                _ => 16,
            };
            Atom::new(position, element)
        })
        .collect()
}

fn jitter(rng: &mut StdRng, atoms: &mut [Atom], step: f32) {
    for atom in atoms {
        let delta = Vec3::new(
            rng.random_range(-step..=step),
            rng.random_range(-step..=step),
            rng.random_range(-step..=step),
        );
        atom.position = (atom.position() + delta).to_array();
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if args.print_schema {
        let schema = serde_json::to_string_pretty(&Options::json_schema())?;
        writeln!(std::io::stdout(), "{schema}")?;
        return Ok(());
    }

    let options = match &args.config {
        Some(path) => Options::load(path)?,
        None => Options::default(),
    };
    let mut pipeline = FramePipeline::new(options, RadiusTable::covalent())?;
    log::info!(
        "building {} frames of {} atoms on {} workers",
        args.frames,
        args.atoms,
        pipeline.builder().backend().parallelism()
    );

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut atoms = random_atoms(&mut rng, args.atoms, args.spread);
    for _ in 0..args.frames {
        let _ = pipeline.submit(&atoms)?;
        if let Some(index) = pipeline.try_latest()? {
            log::debug!(
                "frame {} ready: {} occupied large cells",
                index.frame_id(),
                index.occupied_large_cells()
            );
        }
        jitter(&mut rng, &mut atoms, args.step);
    }

    if let Some(index) = pipeline.wait_latest()? {
        index.validate()?;
        log::info!(
            "last frame {}: {} small references in {} occupied cells",
            index.frame_id(),
            index.dispatch().small_reference_count,
            index.occupied_large_cells()
        );
    }
    let means = pipeline.reporter().mean();
    log::info!(
        "mean over {} frames (us): reduce | upload | large | small",
        means.frames
    );
    log::info!("{}", means.summary_line());
    if let Some(summary) = pipeline.latest_summary() {
        log::info!("summary {}", serde_json::to_string(&summary)?);
    }
    Ok(())
}

fn main() {
    env_logger::init();

    let args = Args::parse();
    if let Err(e) = run(&args) {
        log::error!("{e}");
        std::process::exit(1);
    }
}
