// stance_sim/src/simulation/config/mod.rs

//! Scenario files: what to simulate, how noisy to measure it, and which
//! identifiers to run on the result.

mod catalog;

use figment::{
    providers::{Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::path::Path;

use stance_core::error::ConfigError;
use stance_core::identification::collocation::{GainGuess, InitialGuess, StateGuess};
use stance_core::identification::shooting::ShootingOptions;
use stance_core::models::quiet_standing::{BodyParameters, QuietStandingModel};
use stance_core::nlp::{IntegrationMethod, OptionMap};
use stance_core::optimize::Method;
use stance_core::trajectory::GainBounds;
use stance_core::types::GainMatrix;
use stance_core::utils::integrators::IntegratorKind;

use crate::simulation::core::error::SimError;
use crate::simulation::data_generator::NoiseLevels;

pub use catalog::discover_scenarios;

// =========================================================================
// == Top-Level Configuration ==
// =========================================================================

/// # ScenarioConfig
/// The root of the data parsed from a `scenario.toml` file.
#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
#[serde(deny_unknown_fields)] // Fail if the TOML has fields not in our struct
pub struct ScenarioConfig {
    #[serde(default)] // Use default if the [simulation] section is missing
    pub simulation: Simulation,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub noise: NoiseConfig,

    // The TOML has `[[identifiers]]`, which becomes a Vec of IdentifierConfig.
    #[serde(default)]
    pub identifiers: Vec<IdentifierConfig>,
}

impl ScenarioConfig {
    pub fn load(path: &Path) -> Result<Self, SimError> {
        // figment treats a missing file as an empty one.
        if !path.is_file() {
            return Err(SimError::MissingScenario(path.to_path_buf()));
        }
        Ok(Figment::new().merge(Toml::file(path)).extract()?)
    }

    pub fn from_toml_str(source: &str) -> Result<Self, SimError> {
        Ok(Figment::new().merge(Toml::string(source)).extract()?)
    }
}

// =========================================================================
// == Configuration Sub-Structs ==
// =========================================================================

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Simulation {
    /// Optional seed for the pseudo-random number generator for determinism.
    pub seed: Option<u64>,
    /// Length of the recording in seconds.
    pub duration: f64,
    pub num_samples: usize,
    /// Integrator used to produce the data.
    pub integrator: IntegratorKind,
    /// Integrator steps per sample interval.
    pub substeps: usize,
}

impl Default for Simulation {
    fn default() -> Self {
        Self {
            seed: None,
            duration: 20.0,
            num_samples: 2001,
            integrator: IntegratorKind::Rk4,
            substeps: 4,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct ModelConfig {
    pub body: BodyParameters,
    /// Physical gains, one row per joint torque.
    pub gains: [[f64; 4]; 2],
    pub scale_factors: [[f64; 4]; 2],
}

impl Default for ModelConfig {
    fn default() -> Self {
        let gains = QuietStandingModel::default_gains();
        Self {
            body: BodyParameters::default(),
            gains: [0, 1].map(|r| [0, 1, 2, 3].map(|c| gains[(r, c)])),
            scale_factors: [[1000.0; 4]; 2],
        }
    }
}

impl ModelConfig {
    pub fn build(&self) -> Result<QuietStandingModel, ConfigError> {
        QuietStandingModel::new(self.body, gain_matrix(&self.gains), gain_matrix(&self.scale_factors))
    }
}

fn gain_matrix(rows: &[[f64; 4]; 2]) -> GainMatrix {
    GainMatrix::from_fn(|r, c| rows[r][c])
}

/// Noise standard deviations and the platform excitation.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct NoiseConfig {
    /// On the controller's zero reference [rad, rad/s].
    pub reference: f64,
    pub platform_accel: f64,
    pub coordinate: f64,
    pub speed: f64,
    pub torque: f64,
    /// Amplitude of each platform sine [m].
    pub platform_pos_mag: f64,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            reference: 0.0,
            platform_accel: 0.0,
            coordinate: 0.0,
            speed: 0.0,
            torque: 0.0,
            platform_pos_mag: 0.01,
        }
    }
}

impl NoiseConfig {
    pub fn measurement_levels(&self) -> NoiseLevels {
        NoiseLevels {
            platform_accel: self.platform_accel,
            coordinate: self.coordinate,
            speed: self.speed,
            torque: self.torque,
        }
    }
}

// =========================================================================
// == Identifiers ==
// =========================================================================

// The `type` field in TOML decides which variant to parse.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IdentifierConfig {
    Direct,
    Collocation(CollocationConfig),
    Shooting(ShootingConfig),
}

impl IdentifierConfig {
    pub fn get_type_str(&self) -> &str {
        match self {
            IdentifierConfig::Direct => "direct",
            IdentifierConfig::Collocation(_) => "collocation",
            IdentifierConfig::Shooting(_) => "shooting",
        }
    }
}

/// Where an identifier starts its gain search.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GuessKind {
    #[default]
    Zeros,
    Random,
    /// The model's own gains.
    Known,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct CollocationConfig {
    pub initial_guess: GuessKind,
    /// Seed for `initial_guess = "random"`.
    pub seed: u64,
    /// Start the state trajectory at the measurements instead of zeros.
    pub seed_states: bool,
    /// Nodes to use from the start of the recording. All samples when unset.
    pub num_nodes: Option<usize>,
    pub integration_method: IntegrationMethod,
    pub bounds: GainBounds,
    /// Passed to the NLP engine verbatim.
    pub solver_options: OptionMap,
}

impl Default for CollocationConfig {
    fn default() -> Self {
        Self {
            initial_guess: GuessKind::Zeros,
            seed: 0,
            seed_states: false,
            num_nodes: None,
            integration_method: IntegrationMethod::Midpoint,
            bounds: GainBounds::default(),
            solver_options: OptionMap::new(),
        }
    }
}

impl CollocationConfig {
    pub fn initial_guess(&self, known_gains: GainMatrix) -> InitialGuess {
        InitialGuess {
            gains: match self.initial_guess {
                GuessKind::Zeros => GainGuess::Zeros,
                GuessKind::Random => GainGuess::Random { seed: self.seed },
                GuessKind::Known => GainGuess::Known(known_gains),
            },
            states: if self.seed_states {
                StateGuess::Measured
            } else {
                StateGuess::Zeros
            },
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct ShootingConfig {
    pub method: Method,
    pub tolerance: f64,
    pub initial_guess: GuessKind,
    pub strict: bool,
    pub integrator: IntegratorKind,
    pub substeps: usize,
    pub max_evaluations: Option<usize>,
    pub max_iterations: Option<usize>,
    /// Seeds both CMA-ES sampling and `initial_guess = "random"`.
    pub seed: u64,
}

impl Default for ShootingConfig {
    fn default() -> Self {
        Self {
            method: Method::Cma,
            tolerance: 1e-6,
            initial_guess: GuessKind::Zeros,
            strict: false,
            integrator: IntegratorKind::Rk4,
            substeps: 1,
            max_evaluations: None,
            max_iterations: None,
            seed: 0,
        }
    }
}

impl ShootingConfig {
    pub fn options(&self) -> ShootingOptions {
        ShootingOptions {
            integrator: self.integrator,
            substeps: self.substeps,
            strict: self.strict,
            max_evaluations: self.max_evaluations,
            max_iterations: self.max_iterations,
            seed: self.seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stance_core::models::ClosedLoopModel;
    use stance_core::nlp::OptionValue;

    #[test]
    fn empty_file_gives_defaults() {
        let config = ScenarioConfig::from_toml_str("").unwrap();
        assert_eq!(config, ScenarioConfig::default());
        assert_eq!(config.simulation.num_samples, 2001);
        assert_eq!(
            config.model.build().unwrap(),
            QuietStandingModel::default()
        );
    }

    #[test]
    fn full_scenario_parses() {
        let config = ScenarioConfig::from_toml_str(
            r#"
            [simulation]
            seed = 42
            duration = 5.0
            num_samples = 501

            [model]
            gains = [[900.0, 170.0, 180.0, 45.0], [40.0, 280.0, 55.0, 25.0]]

            [model.body]
            trunk_mass = 50.0

            [noise]
            torque = 2.0
            platform_pos_mag = 0.05

            [[identifiers]]
            type = "direct"

            [[identifiers]]
            type = "collocation"
            initial_guess = "random"
            seed = 3
            seed_states = true
            solver_options = { print_level = 0, sb = "yes", tol = 1e-6 }

            [[identifiers]]
            type = "shooting"
            method = "nelder_mead"
            tolerance = 1e-4
            "#,
        )
        .unwrap();

        assert_eq!(config.simulation.seed, Some(42));
        assert_eq!(config.model.body.trunk_mass, 50.0);
        assert_eq!(config.model.body.gravity, 9.81);
        assert_eq!(config.model.build().unwrap().gains()[(1, 3)], 25.0);
        assert_eq!(config.noise.measurement_levels().torque, 2.0);
        assert_eq!(config.noise.speed, 0.0);

        let types: Vec<&str> = config.identifiers.iter().map(|i| i.get_type_str()).collect();
        assert_eq!(types, ["direct", "collocation", "shooting"]);

        let IdentifierConfig::Collocation(collocation) = &config.identifiers[1] else {
            panic!("expected a collocation identifier");
        };
        assert_eq!(
            collocation.initial_guess(GainMatrix::zeros()),
            InitialGuess {
                gains: GainGuess::Random { seed: 3 },
                states: StateGuess::Measured,
            }
        );
        assert_eq!(collocation.solver_options["print_level"], OptionValue::Int(0));
        assert_eq!(collocation.solver_options["tol"], OptionValue::Num(1e-6));
        assert_eq!(collocation.bounds, GainBounds::default());

        let IdentifierConfig::Shooting(shooting) = &config.identifiers[2] else {
            panic!("expected a shooting identifier");
        };
        assert_eq!(shooting.method, Method::NelderMead);
        assert_eq!(shooting.options().substeps, 1);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        for source in [
            "[simulation]\nsample_rate = 100.0",
            "[noise]\nplatform = 0.1",
            "[model.body]\nfoot_mass = 1.0",
            "[[identifiers]]\ntype = \"collocation\"\nguess = \"zeros\"",
            "[[identifiers]]\ntype = \"kalman\"",
            "[world]\ngravity = 9.81",
        ] {
            assert!(
                matches!(ScenarioConfig::from_toml_str(source), Err(SimError::Figment(_))),
                "accepted {source:?}"
            );
        }
    }

    #[test]
    fn invalid_scale_factors_fail_model_construction() {
        let config = ScenarioConfig::from_toml_str(
            "[model]\nscale_factors = [[1000.0, 1000.0, 0.0, 1000.0], [1000.0, 1000.0, 1000.0, 1000.0]]",
        )
        .unwrap();
        assert!(matches!(
            config.model.build(),
            Err(ConfigError::NonPositiveScaleFactor { row: 0, col: 2, .. })
        ));
    }

    #[test]
    fn bundled_scenarios_parse() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("assets/scenarios");
        let scenarios = discover_scenarios(&dir).unwrap();
        assert!(scenarios.len() >= 3);
        for path in scenarios {
            let config = ScenarioConfig::load(&path).unwrap();
            assert!(!config.identifiers.is_empty(), "{path:?}");
            config.model.build().unwrap();
        }
    }

    #[test]
    fn missing_file_is_reported() {
        let result = ScenarioConfig::load(Path::new("does/not/exist.toml"));
        assert!(matches!(result, Err(SimError::MissingScenario(_))));
    }
}
