// stance_sim/src/simulation/data_generator.rs

//! Synthetic quiet-standing experiments: a perturbed platform, the simulated
//! closed-loop response, and noisy measurements of both.

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use std::f64::consts::PI;
use tracing::debug;

use stance_core::models::ClosedLoopModel;
use stance_core::types::{linspace, Signal, State, StateTrajectory, NUM_STATES};
use stance_core::utils::integrators::IntegratorKind;

use crate::simulation::core::error::SimError;
use crate::simulation::core::prng::SimulationRng;

/// Frequency numbers of the platform's sum of sines, in cycles per 240 s.
const FREQUENCY_NUMBERS: [f64; 12] = [
    7.0, 11.0, 16.0, 25.0, 38.0, 61.0, 103.0, 131.0, 151.0, 181.0, 313.0, 523.0,
];

/// Standard deviations of the Gaussian measurement noise, per channel.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NoiseLevels {
    /// [m/s^2]
    pub platform_accel: f64,
    /// Joint angles [rad].
    pub coordinate: f64,
    /// Joint rates [rad/s].
    pub speed: f64,
    /// Joint torques [N m].
    pub torque: f64,
}

impl NoiseLevels {
    pub fn noiseless() -> Self {
        Self::default()
    }

    /// Every channel multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            platform_accel: self.platform_accel * factor,
            coordinate: self.coordinate * factor,
            speed: self.speed * factor,
            torque: self.torque * factor,
        }
    }
}

/// One set of the three recorded signals.
#[derive(Debug, Clone, PartialEq)]
pub struct Signals {
    /// `N x 4`.
    pub states: StateTrajectory,
    /// `N x 2`, ankle then hip.
    pub torques: DMatrix<f64>,
    pub accel: Signal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub time: DVector<f64>,
    pub interval: f64,
    pub actual: Signals,
    pub measured: Signals,
    /// `N x 4` noise on the controller's zero reference.
    pub reference_noise: DMatrix<f64>,
}

impl Dataset {
    pub fn num_samples(&self) -> usize {
        self.time.len()
    }
}

/// Produces [`Dataset`]s for one model, time grid and excitation level.
///
/// The platform phases and every noise sample are drawn from the supplied
/// [`SimulationRng`], so a seeded generator is fully reproducible.
#[derive(Debug, Clone)]
pub struct DataGenerator {
    duration: f64,
    num_samples: usize,
    ref_noise_std: f64,
    platform_pos_mag: f64,
    model: Box<dyn ClosedLoopModel>,
    integrator: IntegratorKind,
    substeps: usize,
}

impl DataGenerator {
    pub fn new(
        duration: f64,
        num_samples: usize,
        ref_noise_std: f64,
        platform_pos_mag: f64,
        model: &(dyn ClosedLoopModel + 'static),
    ) -> Result<Self, SimError> {
        if num_samples < 2 || !(duration > 0.0 && duration.is_finite()) {
            return Err(SimError::InvalidGrid {
                duration,
                num_samples,
            });
        }
        Ok(Self {
            duration,
            num_samples,
            ref_noise_std,
            platform_pos_mag,
            model: dyn_clone::clone_box(model),
            integrator: IntegratorKind::Rk4,
            substeps: 4,
        })
    }

    pub fn with_integrator(mut self, integrator: IntegratorKind, substeps: usize) -> Self {
        self.integrator = integrator;
        self.substeps = substeps.max(1);
        self
    }

    pub fn model(&self) -> &dyn ClosedLoopModel {
        self.model.as_ref()
    }

    pub fn interval(&self) -> f64 {
        self.duration / (self.num_samples - 1) as f64
    }

    pub fn generate(&self, noise: &NoiseLevels, rng: &mut SimulationRng) -> Result<Dataset, SimError> {
        let n = self.num_samples;
        let time = linspace(0.0, self.duration, n);
        let reference_noise = gaussian(rng, "reference", self.ref_noise_std, n, NUM_STATES)?;
        let accel = self.platform_acceleration(&time, rng);

        let ode = self.model.closed_loop_ode(&time, &reference_noise, &accel)?;
        let gains = self.model.gains();
        let states = ode
            .simulate(
                &State::zeros(),
                time.as_slice(),
                &gains,
                self.integrator.integrator().as_ref(),
                self.substeps,
            )
            .map_err(stance_core::error::IdentificationError::from)?;
        let torques = ode.torques(time.as_slice(), &states, &gains);
        debug!(
            samples = n,
            max_ankle_angle = states.column(0).amax(),
            max_hip_angle = states.column(1).amax(),
            "simulated closed-loop response"
        );

        let measured_accel = &accel + gaussian(rng, "platform acceleration", noise.platform_accel, n, 1)?.column(0);
        let mut state_noise = DMatrix::zeros(n, NUM_STATES);
        state_noise
            .columns_mut(0, 2)
            .copy_from(&gaussian(rng, "coordinate", noise.coordinate, n, 2)?);
        state_noise
            .columns_mut(2, 2)
            .copy_from(&gaussian(rng, "speed", noise.speed, n, 2)?);
        let measured_torques = &torques + gaussian(rng, "torque", noise.torque, n, 2)?;

        Ok(Dataset {
            interval: self.interval(),
            measured: Signals {
                states: &states + state_noise,
                torques: measured_torques,
                accel: measured_accel,
            },
            actual: Signals {
                states,
                torques,
                accel,
            },
            time,
            reference_noise,
        })
    }

    /// `-mag * w^2 * sin(w t + phi)` summed over the platform frequencies,
    /// with phases uniform in `[-pi, pi)`.
    fn platform_acceleration(&self, time: &DVector<f64>, rng: &mut SimulationRng) -> Signal {
        let components: Vec<(f64, f64)> = FREQUENCY_NUMBERS
            .iter()
            .map(|n| (2.0 * PI * n / 240.0, rng.0.gen_range(-PI..PI)))
            .collect();
        time.map(|t| {
            components
                .iter()
                .map(|&(omega, phase)| -self.platform_pos_mag * omega * omega * (omega * t + phase).sin())
                .sum()
        })
    }
}

/// Zero-mean Gaussian samples. A zero deviation yields zeros without touching the generator.
fn gaussian(
    rng: &mut SimulationRng,
    what: &'static str,
    std: f64,
    rows: usize,
    cols: usize,
) -> Result<DMatrix<f64>, SimError> {
    if std == 0.0 {
        return Ok(DMatrix::zeros(rows, cols));
    }
    let normal = Normal::new(0.0, std)
        .ok()
        .filter(|_| std > 0.0)
        .ok_or(SimError::InvalidNoise { what, std })?;
    Ok(DMatrix::from_fn(rows, cols, |_, _| normal.sample(&mut rng.0)))
}
