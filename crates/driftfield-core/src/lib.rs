//! Continuous-state cellular automaton engine driving the ambient field.
//!
//! The engine integrates a Lenia-style growth rule over a toroidal grid:
//! each step the field is advected along a flow vector, convolved with a
//! ring kernel, and nudged by a Gaussian growth function whose parameters
//! drift slowly over simulated time. Stochastic blob injections keep the
//! pattern from collapsing into a fixed point. Presentation and audio
//! layers are external: they read the field and consume density samples
//! through the interfaces exposed here.

use rand::{Rng, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use thiserror::Error;

const FULL_TURN: f32 = std::f32::consts::TAU;

/// Raw kernel weights below this threshold are discarded before
/// normalisation.
const KERNEL_EPSILON: f32 = 0.001;

/// Gaussian ring peak sits at this fraction of the kernel radius.
const KERNEL_PEAK_FRACTION: f32 = 0.5;
/// Ring standard deviation as a fraction of the kernel radius.
const KERNEL_SIGMA_FRACTION: f32 = 0.15;

/// Blob standard deviation as a fraction of the blob radius.
const BLOB_SIGMA_FRACTION: f32 = 0.4;

// Growth parameter schedule: quasi-periodic drift built from a few sine
// terms at incommensurate frequencies (units are simulated time).
const MU_SWING_PRIMARY: f32 = 0.04;
const MU_FREQ_PRIMARY: f32 = 0.11;
const MU_SWING_SECONDARY: f32 = 0.02;
const MU_FREQ_SECONDARY: f32 = 0.047;
const MU_PHASE_SECONDARY: f32 = 1.7;
const SIGMA_SWING: f32 = 0.012;
const SIGMA_FREQ: f32 = 0.073;
const SIGMA_PHASE: f32 = 0.9;

/// Frequency of the auto-drift speed oscillation.
const DRIFT_SPEED_FREQ: f32 = 0.35;

/// Orientation components beyond this magnitude are treated as sensor
/// glitches and clamped.
const ORIENTATION_LIMIT: f32 = 2.0;

/// Cells at or above this value count as alive in the discrete rule.
const LIFE_THRESHOLD: f32 = 0.5;

fn clamp01(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

fn wrap_unsigned_angle(mut angle: f32) -> f32 {
    if angle.is_nan() {
        return 0.0;
    }
    while angle < 0.0 {
        angle += FULL_TURN;
    }
    while angle >= FULL_TURN {
        angle -= FULL_TURN;
    }
    angle
}

/// Monotonic step counter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Step(pub u64);

impl Step {
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Errors surfaced while building an engine.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldEngineError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Neighbor-count rule for the discrete (binary) variant.
///
/// Index `n` of each table answers "does a cell with `n` live Moore
/// neighbors end up alive?". Defaults to Conway's B3/S23.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LifeRule {
    pub born: [bool; 9],
    pub survives: [bool; 9],
}

impl Default for LifeRule {
    fn default() -> Self {
        let mut born = [false; 9];
        born[3] = true;
        let mut survives = [false; 9];
        survives[2] = true;
        survives[3] = true;
        Self { born, survives }
    }
}

/// Selects the update rule applied each step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub enum GrowthMode {
    /// Lenia-style continuous rule: advection, ring convolution, Gaussian
    /// growth.
    #[default]
    Continuous,
    /// Binary neighbor-counting rule; advection and convolution are
    /// skipped.
    Discrete(LifeRule),
}

/// Static configuration for a driftfield engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftFieldConfig {
    /// Side length of the square grid.
    pub grid_size: u32,
    /// Convolution kernel radius in cells.
    pub kernel_radius: u32,
    /// Integration timestep.
    pub dt: f32,
    /// Base value of the growth target potential `mu`.
    pub mu_base: f32,
    /// Base value of the growth tolerance `sigma`; the schedule swings
    /// this by at most [`SIGMA_SWING`], and the floor must stay positive.
    pub sigma_base: f32,
    /// Steps between spontaneous anti-stagnation blobs; 0 disables them.
    pub stagnation_interval: u32,
    /// Fraction of cells mutated each step.
    pub mutation_fraction: f32,
    /// Smallest increment applied by a mutation.
    pub mutation_min: f32,
    /// Largest increment applied by a mutation.
    pub mutation_max: f32,
    /// Steps between turbulence kicks added to the flow vector; 0
    /// disables them.
    pub turbulence_interval: u32,
    /// Per-axis bound of a turbulence kick.
    pub turbulence_strength: f32,
    /// Gain applied to each orientation axis.
    pub orientation_gain: f32,
    /// Auto-drift angle increment per step (radians).
    pub drift_step: f32,
    /// Base auto-drift speed in cells per step.
    pub drift_speed: f32,
    /// Amplitude of the auto-drift speed oscillation.
    pub drift_speed_swing: f32,
    /// Blob radius used for pointer injections.
    pub pointer_radius: f32,
    /// Blob peak amplitude used for pointer injections.
    pub pointer_peak: f32,
    /// Fewest blobs placed by the seeding routine.
    pub seed_blob_count_min: u32,
    /// Most blobs placed by the seeding routine; 0 starts the field
    /// empty.
    pub seed_blob_count_max: u32,
    /// Smallest seed blob radius.
    pub seed_blob_radius_min: f32,
    /// Largest seed blob radius.
    pub seed_blob_radius_max: f32,
    /// Smallest seed blob peak amplitude.
    pub seed_blob_peak_min: f32,
    /// Largest seed blob peak amplitude.
    pub seed_blob_peak_max: f32,
    /// Multiplier applied to the mean cell value when sampling density.
    pub density_scale: f32,
    /// Ceiling applied to the scaled density.
    pub density_cap: f32,
    /// Steps between density emissions to the sink; 0 disables
    /// emissions. The default of 3 matches the reference cadence of one
    /// emission per six presentation frames with a step every second
    /// frame.
    pub emission_interval: u32,
    /// Maximum number of step summaries retained in-memory.
    pub history_capacity: usize,
    /// Update rule applied each step.
    pub growth: GrowthMode,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
}

impl Default for DriftFieldConfig {
    fn default() -> Self {
        Self {
            grid_size: 128,
            kernel_radius: 12,
            dt: 0.15,
            mu_base: 0.30,
            sigma_base: 0.07,
            stagnation_interval: 90,
            mutation_fraction: 0.003,
            mutation_min: 0.05,
            mutation_max: 0.15,
            turbulence_interval: 40,
            turbulence_strength: 1.5,
            orientation_gain: 2.0,
            drift_step: 0.013,
            drift_speed: 0.15,
            drift_speed_swing: 0.1,
            pointer_radius: 6.0,
            pointer_peak: 0.9,
            seed_blob_count_min: 8,
            seed_blob_count_max: 16,
            seed_blob_radius_min: 4.0,
            seed_blob_radius_max: 10.0,
            seed_blob_peak_min: 0.5,
            seed_blob_peak_max: 1.0,
            density_scale: 4.0,
            density_cap: 0.35,
            emission_interval: 3,
            history_capacity: 256,
            growth: GrowthMode::Continuous,
            rng_seed: None,
        }
    }
}

impl DriftFieldConfig {
    /// Validates the configuration.
    fn validate(&self) -> Result<(), FieldEngineError> {
        if self.grid_size == 0 {
            return Err(FieldEngineError::InvalidConfig(
                "grid_size must be non-zero",
            ));
        }
        if self.kernel_radius == 0 {
            return Err(FieldEngineError::InvalidConfig(
                "kernel_radius must be non-zero",
            ));
        }
        if !self.dt.is_finite() || self.dt <= 0.0 {
            return Err(FieldEngineError::InvalidConfig("dt must be positive"));
        }
        if !self.mu_base.is_finite() || !self.sigma_base.is_finite() {
            return Err(FieldEngineError::InvalidConfig(
                "growth parameters must be finite",
            ));
        }
        if self.sigma_base - SIGMA_SWING <= 0.0 {
            return Err(FieldEngineError::InvalidConfig(
                "sigma_base must exceed the schedule swing",
            ));
        }
        if !(0.0..=1.0).contains(&self.mutation_fraction) {
            return Err(FieldEngineError::InvalidConfig(
                "mutation_fraction must lie in [0, 1]",
            ));
        }
        if self.mutation_min < 0.0 || self.mutation_max < self.mutation_min {
            return Err(FieldEngineError::InvalidConfig(
                "mutation increments must be non-negative and ordered",
            ));
        }
        if self.turbulence_strength < 0.0
            || self.orientation_gain < 0.0
            || self.drift_step < 0.0
            || self.drift_speed < 0.0
            || self.drift_speed_swing < 0.0
        {
            return Err(FieldEngineError::InvalidConfig(
                "flow parameters must be non-negative",
            ));
        }
        if self.pointer_radius <= 0.0 || !(0.0..=1.0).contains(&self.pointer_peak) {
            return Err(FieldEngineError::InvalidConfig(
                "pointer_radius must be positive and pointer_peak in [0, 1]",
            ));
        }
        if self.seed_blob_count_max < self.seed_blob_count_min {
            return Err(FieldEngineError::InvalidConfig(
                "seed blob count range is inverted",
            ));
        }
        if self.seed_blob_radius_min <= 0.0
            || self.seed_blob_radius_max < self.seed_blob_radius_min
            || self.seed_blob_peak_min < 0.0
            || self.seed_blob_peak_max < self.seed_blob_peak_min
        {
            return Err(FieldEngineError::InvalidConfig(
                "seed blob radius/peak ranges must be positive and ordered",
            ));
        }
        if self.density_scale <= 0.0 || self.density_cap <= 0.0 {
            return Err(FieldEngineError::InvalidConfig(
                "density scale and cap must be positive",
            ));
        }
        if self.history_capacity == 0 {
            return Err(FieldEngineError::InvalidConfig(
                "history_capacity must be non-zero",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG, seeding from entropy if no seed is set.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Growth rule parameters for one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrowthParams {
    /// Potential at which growth peaks.
    pub mu: f32,
    /// Tolerance around the peak.
    pub sigma: f32,
}

impl GrowthParams {
    /// Evaluate the schedule at the given simulated time.
    #[must_use]
    pub fn at(config: &DriftFieldConfig, sim_time: f32) -> Self {
        let mu = config.mu_base
            + MU_SWING_PRIMARY * (sim_time * MU_FREQ_PRIMARY).sin()
            + MU_SWING_SECONDARY * (sim_time * MU_FREQ_SECONDARY + MU_PHASE_SECONDARY).sin();
        let sigma = config.sigma_base + SIGMA_SWING * (sim_time * SIGMA_FREQ + SIGMA_PHASE).sin();
        Self { mu, sigma }
    }

    /// Growth delta for a local potential, in (-1, 1].
    #[must_use]
    pub fn delta(&self, potential: f32) -> f32 {
        let diff = potential - self.mu;
        2.0 * (-(diff * diff) / (2.0 * self.sigma * self.sigma)).exp() - 1.0
    }
}

/// One weighted neighbor offset of the convolution kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelTap {
    pub dx: i32,
    pub dy: i32,
    pub weight: f32,
}

/// Precomputed ring kernel: immutable for the engine's lifetime.
#[derive(Debug, Clone)]
pub struct Kernel {
    radius: u32,
    taps: Vec<KernelTap>,
}

impl Kernel {
    /// Build the normalized Gaussian ring kernel for `radius`.
    pub fn build(radius: u32) -> Result<Self, FieldEngineError> {
        if radius == 0 {
            return Err(FieldEngineError::InvalidConfig(
                "kernel_radius must be non-zero",
            ));
        }
        let r = radius as i32;
        let peak = radius as f32 * KERNEL_PEAK_FRACTION;
        let sigma = radius as f32 * KERNEL_SIGMA_FRACTION;
        let mut taps = Vec::new();
        let mut total = 0.0f32;
        for dy in -r..=r {
            for dx in -r..=r {
                let dist = ((dx * dx + dy * dy) as f32).sqrt();
                if dist < 1.0 || dist > radius as f32 {
                    continue;
                }
                let diff = dist - peak;
                let weight = (-(diff * diff) / (2.0 * sigma * sigma)).exp();
                if weight < KERNEL_EPSILON {
                    continue;
                }
                taps.push(KernelTap { dx, dy, weight });
                total += weight;
            }
        }
        if taps.is_empty() || total <= 0.0 {
            return Err(FieldEngineError::InvalidConfig(
                "kernel_radius produced an empty kernel",
            ));
        }
        for tap in &mut taps {
            tap.weight /= total;
        }
        Ok(Self { radius, taps })
    }

    #[must_use]
    pub const fn radius(&self) -> u32 {
        self.radius
    }

    #[must_use]
    pub fn taps(&self) -> &[KernelTap] {
        &self.taps
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.taps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.taps.is_empty()
    }
}

/// Square toroidal grid of scalar cell values in `[0, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    size: u32,
    cells: Vec<f32>,
}

impl Field {
    /// Construct an all-zero grid with `size * size` cells.
    pub fn new(size: u32) -> Result<Self, FieldEngineError> {
        if size == 0 {
            return Err(FieldEngineError::InvalidConfig(
                "grid_size must be non-zero",
            ));
        }
        Ok(Self {
            size,
            cells: vec![0.0; (size as usize) * (size as usize)],
        })
    }

    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    #[must_use]
    pub fn cells(&self) -> &[f32] {
        &self.cells
    }

    #[must_use]
    pub fn cells_mut(&mut self) -> &mut [f32] {
        &mut self.cells
    }

    /// Returns the flat index for `(x, y)` without bounds checks.
    #[inline]
    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize) * (self.size as usize) + (x as usize)
    }

    #[inline]
    fn wrap(&self, v: i64) -> usize {
        v.rem_euclid(self.size as i64) as usize
    }

    /// Immutable access to a specific cell.
    pub fn get(&self, x: u32, y: u32) -> Option<f32> {
        if x < self.size && y < self.size {
            Some(self.cells[self.offset(x, y)])
        } else {
            None
        }
    }

    /// Read a cell with both axes wrapping modulo the grid size.
    #[must_use]
    #[inline]
    pub fn get_wrapped(&self, x: i64, y: i64) -> f32 {
        let xi = self.wrap(x);
        let yi = self.wrap(y);
        self.cells[yi * self.size as usize + xi]
    }

    /// Write a cell with both axes wrapping modulo the grid size.
    pub fn set_wrapped(&mut self, x: i64, y: i64, value: f32) {
        let xi = self.wrap(x);
        let yi = self.wrap(y);
        let size = self.size as usize;
        self.cells[yi * size + xi] = value;
    }

    /// Resets every cell to zero.
    pub fn clear(&mut self) {
        self.cells.fill(0.0);
    }

    /// Total mass of the field.
    #[must_use]
    pub fn mass(&self) -> f32 {
        self.cells.iter().map(|&c| f64::from(c)).sum::<f64>() as f32
    }

    /// Largest cell value.
    #[must_use]
    pub fn peak(&self) -> f32 {
        self.cells.iter().copied().fold(0.0, f32::max)
    }

    /// Bilinear toroidal resample of `source` shifted by `(fx, fy)`.
    ///
    /// Each output cell samples the four source cells around
    /// `(x - fx, y - fy)` weighted by fractional distance; a zero offset
    /// reproduces the source exactly. Sizes must match.
    pub fn advect_from(&mut self, source: &Field, fx: f32, fy: f32) {
        debug_assert_eq!(self.size, source.size);
        let size = self.size as usize;
        for y in 0..size {
            let sy = y as f32 - fy;
            let y0 = sy.floor();
            let ty = sy - y0;
            let y0 = y0 as i64;
            for x in 0..size {
                let sx = x as f32 - fx;
                let x0 = sx.floor();
                let tx = sx - x0;
                let x0 = x0 as i64;
                let c00 = source.get_wrapped(x0, y0);
                let c10 = source.get_wrapped(x0 + 1, y0);
                let c01 = source.get_wrapped(x0, y0 + 1);
                let c11 = source.get_wrapped(x0 + 1, y0 + 1);
                let top = c00 + tx * (c10 - c00);
                let bottom = c01 + tx * (c11 - c01);
                self.cells[y * size + x] = top + ty * (bottom - top);
            }
        }
    }

    /// Additively deposit a Gaussian blob centred at `(cx, cy)`.
    ///
    /// Cells saturate at 1.0 and never decrease; non-finite or
    /// non-positive inputs are rejected as a no-op.
    pub fn deposit_blob(&mut self, cx: f32, cy: f32, radius: f32, peak: f32) {
        if !cx.is_finite() || !cy.is_finite() || !radius.is_finite() || !peak.is_finite() {
            return;
        }
        if radius <= 0.0 || peak <= 0.0 {
            return;
        }
        let reach = radius.ceil() as i64;
        let sigma = radius * BLOB_SIGMA_FRACTION;
        let inv_two_sigma_sq = 1.0 / (2.0 * sigma * sigma);
        let base_x = cx.floor() as i64;
        let base_y = cy.floor() as i64;
        let size = self.size as usize;
        for dy in -reach..=reach {
            let y = base_y + dy;
            let off_y = y as f32 - cy;
            let yi = self.wrap(y);
            for dx in -reach..=reach {
                let x = base_x + dx;
                let off_x = x as f32 - cx;
                let dist_sq = off_x * off_x + off_y * off_y;
                let xi = self.wrap(x);
                let idx = yi * size + xi;
                let bump = peak * (-dist_sq * inv_two_sigma_sq).exp();
                self.cells[idx] = (self.cells[idx] + bump).min(1.0);
            }
        }
    }
}

/// Scaled density reading handed to the audio collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DensitySample {
    /// Mean cell value times [`DriftFieldConfig::density_scale`], capped
    /// at [`DriftFieldConfig::density_cap`].
    pub density: f32,
    /// Rounded raw sum of cell values.
    pub cell_count: u64,
}

/// Sink receiving density emissions on the configured cadence.
pub trait DensitySink: Send {
    fn on_sample(&mut self, step: Step, sample: &DensitySample);
}

/// Sink that discards every emission.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DensitySink for NullSink {
    fn on_sample(&mut self, _step: Step, _sample: &DensitySample) {}
}

/// Aggregate measurements recorded on the emission cadence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    pub step: Step,
    pub mass: f32,
    pub density: f32,
    pub peak_cell: f32,
}

/// Events emitted by one [`FieldEngine::advance`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepEvents {
    /// Step counter after the advance.
    pub step: Step,
    /// Grid coordinate of the spontaneous blob, when one fired.
    pub stagnation_blob: Option<(u32, u32)>,
    /// Whether a turbulence kick perturbed this step's flow.
    pub turbulence_applied: bool,
    /// Flow vector applied this step.
    pub flow: (f32, f32),
    /// Whether a density sample was delivered to the sink.
    pub density_emitted: bool,
}

/// Owns the double-buffered field and runs the per-step pipeline.
pub struct FieldEngine {
    config: DriftFieldConfig,
    step: Step,
    rng: SmallRng,
    kernel: Kernel,
    field: Field,
    next: Field,
    shifted: Field,
    orientation: Option<(f32, f32)>,
    drift_angle: f32,
    sink: Box<dyn DensitySink>,
    history: VecDeque<StepSummary>,
}

impl fmt::Debug for FieldEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldEngine")
            .field("config", &self.config)
            .field("step", &self.step)
            .field("kernel_taps", &self.kernel.len())
            .field("orientation", &self.orientation)
            .field("drift_angle", &self.drift_angle)
            .finish()
    }
}

impl FieldEngine {
    /// Instantiate a new engine using the supplied configuration.
    pub fn new(config: DriftFieldConfig) -> Result<Self, FieldEngineError> {
        Self::with_sink(config, Box::new(NullSink))
    }

    /// Instantiate a new engine delivering density emissions to `sink`.
    pub fn with_sink(
        config: DriftFieldConfig,
        sink: Box<dyn DensitySink>,
    ) -> Result<Self, FieldEngineError> {
        config.validate()?;
        let kernel = Kernel::build(config.kernel_radius)?;
        let rng = config.seeded_rng();
        let history_capacity = config.history_capacity;
        let size = config.grid_size;
        let mut engine = Self {
            field: Field::new(size)?,
            next: Field::new(size)?,
            shifted: Field::new(size)?,
            config,
            step: Step::zero(),
            rng,
            kernel,
            orientation: None,
            drift_angle: 0.0,
            sink,
            history: VecDeque::with_capacity(history_capacity),
        };
        engine.reseed();
        Ok(engine)
    }

    /// Clear the field and scatter the initial random blobs.
    ///
    /// This is the only operation that starts the field non-empty; a
    /// `seed_blob_count_max` of zero leaves it blank.
    pub fn reseed(&mut self) {
        self.field.clear();
        if self.config.seed_blob_count_max == 0 {
            return;
        }
        let count = self
            .rng
            .random_range(self.config.seed_blob_count_min..=self.config.seed_blob_count_max);
        let extent = self.config.grid_size as f32;
        for _ in 0..count {
            let cx = self.rng.random_range(0.0..extent);
            let cy = self.rng.random_range(0.0..extent);
            let radius = self
                .rng
                .random_range(self.config.seed_blob_radius_min..=self.config.seed_blob_radius_max);
            let peak = self
                .rng
                .random_range(self.config.seed_blob_peak_min..=self.config.seed_blob_peak_max);
            self.field.deposit_blob(cx, cy, radius, peak);
        }
    }

    /// Execute one simulation step, returning the emitted events.
    pub fn advance(&mut self) -> StepEvents {
        let next_step = self.step.next();
        let sim_time = next_step.0 as f32 * self.config.dt;

        let stagnation_blob = self.stage_stagnation(next_step);
        self.stage_mutation();
        let (flow, turbulence_applied) = self.stage_flow(next_step, sim_time);
        match self.config.growth {
            GrowthMode::Continuous => {
                let params = GrowthParams::at(&self.config, sim_time);
                self.shifted.advect_from(&self.field, flow.0, flow.1);
                self.stage_convolve_grow(params);
            }
            GrowthMode::Discrete(rule) => self.stage_life(rule),
        }
        mem::swap(&mut self.field, &mut self.next);
        self.step = next_step;
        let density_emitted = self.stage_emission();

        StepEvents {
            step: self.step,
            stagnation_blob,
            turbulence_applied,
            flow,
            density_emitted,
        }
    }

    fn stage_stagnation(&mut self, next_step: Step) -> Option<(u32, u32)> {
        let interval = self.config.stagnation_interval;
        if interval == 0 {
            return None;
        }
        if !next_step.0.is_multiple_of(interval as u64) {
            return None;
        }
        let size = self.config.grid_size;
        let x = self.rng.random_range(0..size);
        let y = self.rng.random_range(0..size);
        let radius = self.rng.random_range(4.0..=8.0f32);
        let peak = self.rng.random_range(0.4..=0.8f32);
        self.field.deposit_blob(x as f32, y as f32, radius, peak);
        Some((x, y))
    }

    fn stage_mutation(&mut self) {
        let fraction = self.config.mutation_fraction;
        if fraction <= 0.0 {
            return;
        }
        let len = self.field.cells().len();
        let count = ((len as f32) * fraction).round() as usize;
        let min = self.config.mutation_min;
        let max = self.config.mutation_max;
        for _ in 0..count {
            let idx = self.rng.random_range(0..len);
            let boost = self.rng.random_range(min..=max);
            let cells = self.field.cells_mut();
            cells[idx] = (cells[idx] + boost).min(1.0);
        }
    }

    fn stage_flow(&mut self, next_step: Step, sim_time: f32) -> ((f32, f32), bool) {
        let (mut fx, mut fy) = match self.orientation {
            Some((ox, oy)) => (
                ox * self.config.orientation_gain,
                oy * self.config.orientation_gain,
            ),
            None => {
                self.drift_angle =
                    wrap_unsigned_angle(self.drift_angle + self.config.drift_step);
                let speed = self.config.drift_speed
                    + self.config.drift_speed_swing * (sim_time * DRIFT_SPEED_FREQ).sin();
                (self.drift_angle.cos() * speed, self.drift_angle.sin() * speed)
            }
        };
        let mut turbulence_applied = false;
        let interval = self.config.turbulence_interval;
        if interval > 0
            && self.config.turbulence_strength > 0.0
            && next_step.0.is_multiple_of(interval as u64)
        {
            let strength = self.config.turbulence_strength;
            fx += self.rng.random_range(-strength..=strength);
            fy += self.rng.random_range(-strength..=strength);
            turbulence_applied = true;
        }
        ((fx, fy), turbulence_applied)
    }

    fn stage_convolve_grow(&mut self, params: GrowthParams) {
        let size = self.config.grid_size as usize;
        let dt = self.config.dt;
        let shifted = &self.shifted;
        let taps = self.kernel.taps();
        self.next
            .cells_mut()
            .par_chunks_mut(size)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, cell) in row.iter_mut().enumerate() {
                    let mut potential = 0.0f32;
                    for tap in taps {
                        potential += tap.weight
                            * shifted
                                .get_wrapped(x as i64 + tap.dx as i64, y as i64 + tap.dy as i64);
                    }
                    let value = shifted.cells()[y * size + x] + dt * params.delta(potential);
                    *cell = clamp01(value);
                }
            });
    }

    fn stage_life(&mut self, rule: LifeRule) {
        let size = self.config.grid_size as usize;
        let field = &self.field;
        self.next
            .cells_mut()
            .par_chunks_mut(size)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, cell) in row.iter_mut().enumerate() {
                    let mut neighbors = 0usize;
                    for dy in -1i64..=1 {
                        for dx in -1i64..=1 {
                            if dx == 0 && dy == 0 {
                                continue;
                            }
                            if field.get_wrapped(x as i64 + dx, y as i64 + dy) >= LIFE_THRESHOLD {
                                neighbors += 1;
                            }
                        }
                    }
                    let alive = field.cells()[y * size + x] >= LIFE_THRESHOLD;
                    let lives = if alive {
                        rule.survives[neighbors]
                    } else {
                        rule.born[neighbors]
                    };
                    *cell = if lives { 1.0 } else { 0.0 };
                }
            });
    }

    fn stage_emission(&mut self) -> bool {
        let interval = self.config.emission_interval;
        if interval == 0 || !self.step.0.is_multiple_of(interval as u64) {
            return false;
        }
        let sample = self.sample_density();
        let summary = StepSummary {
            step: self.step,
            mass: self.field.mass(),
            density: sample.density,
            peak_cell: self.field.peak(),
        };
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
        self.sink.on_sample(self.step, &sample);
        true
    }

    /// Compute the current density sample; pure read of the field.
    #[must_use]
    pub fn sample_density(&self) -> DensitySample {
        let cells = self.field.cells();
        let raw_sum: f64 = cells.iter().map(|&c| f64::from(c)).sum();
        let mean = (raw_sum / cells.len() as f64) as f32;
        DensitySample {
            density: (mean * self.config.density_scale).min(self.config.density_cap),
            cell_count: raw_sum.round() as u64,
        }
    }

    /// Feed a normalized orientation vector; values are clamped and
    /// non-finite input is ignored.
    pub fn set_orientation(&mut self, tilt_x: f32, tilt_y: f32) {
        if !tilt_x.is_finite() || !tilt_y.is_finite() {
            return;
        }
        self.orientation = Some((
            tilt_x.clamp(-ORIENTATION_LIMIT, ORIENTATION_LIMIT),
            tilt_y.clamp(-ORIENTATION_LIMIT, ORIENTATION_LIMIT),
        ));
    }

    /// Drop orientation input, falling back to auto-drift.
    pub fn clear_orientation(&mut self) {
        self.orientation = None;
    }

    /// Deposit an interaction blob at a continuous grid coordinate.
    ///
    /// Safe to call at arbitrary frequency; each call is a bounded local
    /// write, and non-finite coordinates are a no-op.
    pub fn inject_pointer(&mut self, x: f32, y: f32) {
        self.field
            .deposit_blob(x, y, self.config.pointer_radius, self.config.pointer_peak);
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &DriftFieldConfig {
        &self.config
    }

    /// Mutable access to the configuration (for hot edits).
    #[must_use]
    pub fn config_mut(&mut self) -> &mut DriftFieldConfig {
        &mut self.config
    }

    /// Replace the density sink.
    pub fn set_sink(&mut self, sink: Box<dyn DensitySink>) {
        self.sink = sink;
    }

    /// Current step counter.
    #[must_use]
    pub const fn step(&self) -> Step {
        self.step
    }

    /// Read-only access to the live field, for the presentation layer.
    #[must_use]
    pub fn field(&self) -> &Field {
        &self.field
    }

    /// Mutable access to the live field.
    #[must_use]
    pub fn field_mut(&mut self) -> &mut Field {
        &mut self.field
    }

    /// Read-only view of the live field's cell values.
    #[must_use]
    pub fn cells(&self) -> &[f32] {
        self.field.cells()
    }

    /// The precomputed convolution kernel.
    #[must_use]
    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Borrow the engine RNG mutably for deterministic sampling.
    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// Iterate over retained step summaries.
    pub fn history(&self) -> impl Iterator<Item = &StepSummary> {
        self.history.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_config() -> DriftFieldConfig {
        DriftFieldConfig {
            grid_size: 32,
            kernel_radius: 6,
            stagnation_interval: 0,
            mutation_fraction: 0.0,
            turbulence_interval: 0,
            drift_speed: 0.0,
            drift_speed_swing: 0.0,
            seed_blob_count_min: 0,
            seed_blob_count_max: 0,
            rng_seed: Some(7),
            ..DriftFieldConfig::default()
        }
    }

    #[test]
    fn kernel_weights_are_normalized() {
        for radius in [3u32, 6, 12, 20] {
            let kernel = Kernel::build(radius).expect("kernel");
            let total: f32 = kernel.taps().iter().map(|tap| tap.weight).sum();
            assert!(
                (total - 1.0).abs() < 1e-5,
                "radius {radius}: kernel mass {total}"
            );
            for tap in kernel.taps() {
                let dist = ((tap.dx * tap.dx + tap.dy * tap.dy) as f32).sqrt();
                assert!(dist >= 1.0 && dist <= radius as f32);
                assert!(tap.weight > 0.0);
            }
        }
    }

    #[test]
    fn kernel_rejects_zero_radius() {
        assert_eq!(
            Kernel::build(0).err(),
            Some(FieldEngineError::InvalidConfig(
                "kernel_radius must be non-zero"
            ))
        );
    }

    #[test]
    fn kernel_build_is_deterministic() {
        let a = Kernel::build(12).expect("kernel");
        let b = Kernel::build(12).expect("kernel");
        assert_eq!(a.taps(), b.taps());
        assert_eq!(a.radius(), b.radius());
    }

    #[test]
    fn field_accessors_and_wrapping() {
        let mut field = Field::new(4).expect("field");
        field.set_wrapped(1, 2, 0.5);
        assert_eq!(field.get(1, 2), Some(0.5));
        assert_eq!(field.get_wrapped(5, 2), 0.5);
        assert_eq!(field.get_wrapped(-3, 2), 0.5);
        assert_eq!(field.get_wrapped(1, -2), 0.5);
        assert!(field.get(4, 0).is_none());
        assert!((field.mass() - 0.5).abs() < 1e-6);
        field.clear();
        assert_eq!(field.mass(), 0.0);
    }

    #[test]
    fn advection_with_zero_flow_is_identity() {
        let mut source = Field::new(8).expect("field");
        for (i, cell) in source.cells_mut().iter_mut().enumerate() {
            *cell = (i as f32 * 0.37).fract();
        }
        let mut target = Field::new(8).expect("field");
        target.advect_from(&source, 0.0, 0.0);
        assert_eq!(target.cells(), source.cells());
    }

    #[test]
    fn advection_by_whole_cells_is_a_toroidal_shift() {
        let mut source = Field::new(8).expect("field");
        source.set_wrapped(0, 0, 1.0);
        let mut target = Field::new(8).expect("field");
        target.advect_from(&source, 2.0, 3.0);
        assert_eq!(target.get(2, 3), Some(1.0));
        assert_eq!(target.get(0, 0), Some(0.0));

        // Wraps off the far edge.
        target.advect_from(&source, -1.0, -1.0);
        assert_eq!(target.get(7, 7), Some(1.0));
    }

    #[test]
    fn advection_stays_within_input_hull() {
        let mut source = Field::new(16).expect("field");
        source.deposit_blob(8.0, 8.0, 4.0, 0.9);
        let mut target = Field::new(16).expect("field");
        target.advect_from(&source, 0.4, -0.7);
        let max_in = source.peak();
        for &cell in target.cells() {
            assert!(cell >= 0.0 && cell <= max_in + 1e-6);
        }
        assert!((target.mass() - source.mass()).abs() < 1e-3);
    }

    #[test]
    fn blob_deposit_is_monotonic_and_saturating() {
        let mut field = Field::new(32).expect("field");
        field.deposit_blob(10.0, 10.0, 5.0, 0.6);
        let before = field.cells().to_vec();
        field.deposit_blob(12.0, 10.0, 5.0, 0.8);
        for (after, before) in field.cells().iter().zip(&before) {
            assert!(after >= before);
            assert!(*after <= 1.0);
        }
    }

    #[test]
    fn blob_center_receives_full_peak() {
        let mut field = Field::new(128).expect("field");
        field.deposit_blob(64.0, 64.0, 6.0, 0.9);
        let center = field.get(64, 64).expect("cell");
        assert!((center - 0.9).abs() < 1e-6);

        // Six cells out: peak * exp(-36 / (2 * (6 * 0.4)^2)).
        let expected = 0.9 * (-36.0f32 / (2.0 * 2.4 * 2.4)).exp();
        let edge = field.get(64, 70).expect("cell");
        assert!((edge - expected).abs() < 1e-4);
    }

    #[test]
    fn blob_at_origin_wraps_symmetrically() {
        let mut field = Field::new(64).expect("field");
        field.deposit_blob(0.0, 0.0, 6.0, 0.9);
        let near = field.get(1, 1).expect("cell");
        let far = field.get(63, 63).expect("cell");
        assert!((near - far).abs() < 1e-6);
        assert!(near > 0.0);
        assert_eq!(field.get(1, 63), field.get(63, 1));
    }

    #[test]
    fn blob_rejects_non_finite_input() {
        let mut field = Field::new(16).expect("field");
        field.deposit_blob(f32::NAN, 4.0, 5.0, 0.9);
        field.deposit_blob(4.0, f32::INFINITY, 5.0, 0.9);
        field.deposit_blob(4.0, 4.0, f32::NAN, 0.9);
        field.deposit_blob(4.0, 4.0, 5.0, f32::NAN);
        assert_eq!(field.mass(), 0.0);
    }

    #[test]
    fn growth_delta_peaks_at_mu() {
        let params = GrowthParams { mu: 0.3, sigma: 0.05 };
        assert!((params.delta(0.3) - 1.0).abs() < 1e-6);
        assert!(params.delta(0.0) < 0.0);
        assert!(params.delta(1.0) < 0.0);
        assert!(params.delta(0.3) > params.delta(0.32));
    }

    #[test]
    fn growth_schedule_keeps_sigma_positive() {
        let config = DriftFieldConfig::default();
        for step in 0..2_000u64 {
            let params = GrowthParams::at(&config, step as f32 * config.dt);
            assert!(params.sigma > 0.0, "sigma collapsed at step {step}");
        }
    }

    #[test]
    fn config_validation_rejects_misuse() {
        let cases: Vec<(DriftFieldConfig, &str)> = vec![
            (
                DriftFieldConfig {
                    grid_size: 0,
                    ..DriftFieldConfig::default()
                },
                "grid",
            ),
            (
                DriftFieldConfig {
                    kernel_radius: 0,
                    ..DriftFieldConfig::default()
                },
                "kernel",
            ),
            (
                DriftFieldConfig {
                    dt: 0.0,
                    ..DriftFieldConfig::default()
                },
                "dt",
            ),
            (
                DriftFieldConfig {
                    sigma_base: 0.01,
                    ..DriftFieldConfig::default()
                },
                "sigma",
            ),
            (
                DriftFieldConfig {
                    mutation_fraction: 1.5,
                    ..DriftFieldConfig::default()
                },
                "mutation",
            ),
            (
                DriftFieldConfig {
                    density_cap: 0.0,
                    ..DriftFieldConfig::default()
                },
                "density",
            ),
            (
                DriftFieldConfig {
                    history_capacity: 0,
                    ..DriftFieldConfig::default()
                },
                "history",
            ),
            (
                DriftFieldConfig {
                    seed_blob_count_min: 9,
                    seed_blob_count_max: 3,
                    ..DriftFieldConfig::default()
                },
                "seed count",
            ),
        ];
        for (config, what) in cases {
            assert!(
                FieldEngine::new(config).is_err(),
                "expected {what} misuse to be rejected"
            );
        }
    }

    #[test]
    fn engine_starts_empty_without_seed_blobs() {
        let engine = FieldEngine::new(quiet_config()).expect("engine");
        assert_eq!(engine.field().mass(), 0.0);
        assert_eq!(engine.step(), Step::zero());
    }

    #[test]
    fn reseed_populates_the_field() {
        let config = DriftFieldConfig {
            rng_seed: Some(11),
            ..DriftFieldConfig::default()
        };
        let engine = FieldEngine::new(config).expect("engine");
        assert!(engine.field().mass() > 0.0);
        assert!(engine.field().peak() <= 1.0);
    }

    #[test]
    fn field_stays_bounded_after_steps() {
        let config = DriftFieldConfig {
            grid_size: 48,
            rng_seed: Some(3),
            ..DriftFieldConfig::default()
        };
        let mut engine = FieldEngine::new(config).expect("engine");
        for _ in 0..50 {
            engine.advance();
            for &cell in engine.cells() {
                assert!(cell.is_finite());
                assert!((0.0..=1.0).contains(&cell));
            }
        }
    }

    #[test]
    fn density_sampling_is_deterministic_and_capped() {
        let mut engine = FieldEngine::new(quiet_config()).expect("engine");
        engine.field_mut().cells_mut().fill(0.5);
        let a = engine.sample_density();
        let b = engine.sample_density();
        assert_eq!(a, b);
        // mean 0.5 * scale 4.0 = 2.0, capped at 0.35.
        assert!((a.density - 0.35).abs() < 1e-6);
        assert_eq!(a.cell_count, 32 * 32 / 2);
    }

    #[test]
    fn stagnation_fires_exactly_on_the_interval() {
        let config = DriftFieldConfig {
            stagnation_interval: 90,
            ..quiet_config()
        };
        let mut engine = FieldEngine::new(config).expect("engine");
        for expected_step in 1..=180u64 {
            let events = engine.advance();
            let fired = events.stagnation_blob.is_some();
            assert_eq!(
                fired,
                expected_step % 90 == 0,
                "unexpected stagnation at step {expected_step}"
            );
        }
    }

    #[test]
    fn turbulence_fires_on_cadence() {
        let config = DriftFieldConfig {
            turbulence_interval: 40,
            ..quiet_config()
        };
        let mut engine = FieldEngine::new(config).expect("engine");
        for expected_step in 1..=80u64 {
            let events = engine.advance();
            assert_eq!(events.turbulence_applied, expected_step % 40 == 0);
        }
    }

    #[test]
    fn mutation_raises_mass_by_bounded_amount() {
        let config = DriftFieldConfig {
            mutation_fraction: 0.01,
            ..quiet_config()
        };
        let mut engine = FieldEngine::new(config).expect("engine");
        let cell_total = engine.cells().len();
        let expected_hits = (cell_total as f32 * 0.01).round();
        engine.stage_mutation();
        let mass = engine.field().mass();
        assert!(mass > 0.0);
        // Each mutation adds between 0.05 and 0.15 to a zero cell.
        assert!(mass >= expected_hits * 0.05 - 1e-3);
        assert!(mass <= expected_hits * 0.15 + 1e-3);
    }

    #[test]
    fn orientation_overrides_auto_drift() {
        let config = DriftFieldConfig {
            drift_speed: 0.2,
            drift_speed_swing: 0.0,
            ..quiet_config()
        };
        let mut engine = FieldEngine::new(config).expect("engine");
        engine.set_orientation(0.5, -0.25);
        let events = engine.advance();
        assert!((events.flow.0 - 1.0).abs() < 1e-6);
        assert!((events.flow.1 + 0.5).abs() < 1e-6);

        engine.clear_orientation();
        let events = engine.advance();
        let magnitude = (events.flow.0 * events.flow.0 + events.flow.1 * events.flow.1).sqrt();
        assert!((magnitude - 0.2).abs() < 1e-3);
    }

    #[test]
    fn orientation_clamps_extreme_and_ignores_non_finite_input() {
        let mut engine = FieldEngine::new(quiet_config()).expect("engine");
        engine.set_orientation(40.0, -40.0);
        let events = engine.advance();
        // Clamped to the limit, then scaled by the default gain of 2.0.
        let expected = ORIENTATION_LIMIT * engine.config().orientation_gain;
        assert!((events.flow.0 - expected).abs() < 1e-6);
        assert!((events.flow.1 + expected).abs() < 1e-6);

        engine.set_orientation(f32::NAN, 0.0);
        let events = engine.advance();
        // Previous clamped orientation still applies.
        assert!((events.flow.0 - expected).abs() < 1e-6);
    }

    #[test]
    fn pointer_injection_is_a_bounded_local_write() {
        let mut engine = FieldEngine::new(quiet_config()).expect("engine");
        engine.inject_pointer(16.0, 16.0);
        let center = engine.field().get(16, 16).expect("cell");
        assert!((center - 0.9).abs() < 1e-6);

        engine.inject_pointer(f32::NAN, 16.0);
        engine.inject_pointer(16.0, f32::NEG_INFINITY);
        let untouched = engine.field().get(16, 16).expect("cell");
        assert!((untouched - center).abs() < 1e-6);
    }

    #[test]
    fn discrete_blinker_oscillates() {
        let config = DriftFieldConfig {
            growth: GrowthMode::Discrete(LifeRule::default()),
            grid_size: 16,
            ..quiet_config()
        };
        let mut engine = FieldEngine::new(config).expect("engine");
        for x in 4..7i64 {
            engine.field_mut().set_wrapped(x, 5, 1.0);
        }
        engine.advance();
        for y in 4..7u32 {
            assert_eq!(engine.field().get(5, y), Some(1.0));
        }
        assert_eq!(engine.field().get(4, 5), Some(0.0));
        assert_eq!(engine.field().get(6, 5), Some(0.0));
        engine.advance();
        for x in 4..7u32 {
            assert_eq!(engine.field().get(x, 5), Some(1.0));
        }
    }

    #[test]
    fn discrete_block_is_stable() {
        let config = DriftFieldConfig {
            growth: GrowthMode::Discrete(LifeRule::default()),
            grid_size: 8,
            ..quiet_config()
        };
        let mut engine = FieldEngine::new(config).expect("engine");
        for y in 2..4i64 {
            for x in 2..4i64 {
                engine.field_mut().set_wrapped(x, y, 1.0);
            }
        }
        let before = engine.cells().to_vec();
        engine.advance();
        engine.advance();
        assert_eq!(engine.cells(), &before[..]);
    }
}
