use anyhow::Result;
use driftfield_core::{DensitySample, DensitySink, DriftFieldConfig, FieldEngine, Step};
use rand::Rng;
use tracing::{debug, info};

/// Presentation frames between simulation steps.
const STEP_EVERY: u64 = 2;
/// Presentation frames between pointer perturbations in the demo loop.
const POINTER_EVERY: u64 = 240;

fn main() -> Result<()> {
    init_tracing();
    let frames = std::env::var("DRIFTFIELD_FRAMES")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(1_800);
    let mut engine = bootstrap_engine()?;
    info!(frames, "Starting driftfield headless host loop");
    run_loop(&mut engine, frames);
    report(&engine);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Logs each density emission the way the audio layer would consume it.
struct LogSink;

impl DensitySink for LogSink {
    fn on_sample(&mut self, step: Step, sample: &DensitySample) {
        debug!(
            step = step.0,
            density = sample.density,
            cell_count = sample.cell_count,
            "density emission",
        );
    }
}

fn bootstrap_engine() -> Result<FieldEngine> {
    let config = DriftFieldConfig {
        rng_seed: std::env::var("DRIFTFIELD_SEED")
            .ok()
            .and_then(|s| s.parse::<u64>().ok()),
        ..DriftFieldConfig::default()
    };
    let engine = FieldEngine::with_sink(config, Box::new(LogSink))?;
    info!(
        grid = engine.config().grid_size,
        kernel_taps = engine.kernel().len(),
        seeded_mass = engine.field().mass(),
        "Engine bootstrapped",
    );
    Ok(engine)
}

/// Fixed-cadence host loop: the simulation advances every `STEP_EVERY`th
/// frame while a renderer would read the field every frame. Density
/// emission runs on the engine's own step cadence.
fn run_loop(engine: &mut FieldEngine, frames: u64) {
    for frame in 1..=frames {
        if frame.is_multiple_of(POINTER_EVERY) {
            let extent = engine.config().grid_size as f32;
            let x = engine.rng().random_range(0.0..extent);
            let y = engine.rng().random_range(0.0..extent);
            engine.inject_pointer(x, y);
            debug!(frame, x, y, "pointer perturbation");
        }
        if frame.is_multiple_of(STEP_EVERY) {
            let events = engine.advance();
            if events.stagnation_blob.is_some() || events.turbulence_applied {
                debug!(
                    step = events.step.0,
                    stagnation = ?events.stagnation_blob,
                    turbulence = events.turbulence_applied,
                    "spontaneous perturbation",
                );
            }
        }
        // A presentation layer would blit engine.cells() here.
    }
}

fn report(engine: &FieldEngine) {
    let sample = engine.sample_density();
    if let Some(summary) = engine.history().last() {
        info!(
            step = summary.step.0,
            mass = summary.mass,
            peak = summary.peak_cell,
            density = sample.density,
            cell_count = sample.cell_count,
            "Run complete",
        );
    } else {
        info!(
            step = engine.step().0,
            density = sample.density,
            "Run complete without recorded history",
        );
    }
}
