// stance_sim/src/simulation/runner.rs

//! Runs a scenario end to end: generate data, identify the gains every
//! configured way, and tabulate the results.

use nalgebra::DMatrix;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::path::Path;
use tracing::{error, info, info_span, warn};

use stance_core::identification::direct::DirectIdentifier;
use stance_core::identification::{collocation, shooting};
use stance_core::models::closed_loop::ClosedLoopOde;
use stance_core::models::quiet_standing::QuietStandingModel;
use stance_core::models::ClosedLoopModel;
use stance_core::scaling::to_scaled;
use stance_core::trajectory::TrajectoryProblem;
use stance_core::types::{GainMatrix, NUM_STATES};

use crate::simulation::config::{
    discover_scenarios, CollocationConfig, GuessKind, IdentifierConfig, ScenarioConfig, ShootingConfig,
};
use crate::simulation::core::error::SimError;
use crate::simulation::core::prng::SimulationRng;
use crate::simulation::data_generator::{DataGenerator, Dataset};
use crate::simulation::report::{Convergence, GainsReport};

/// Runs one parsed scenario and returns its gains table.
pub fn run_scenario(config: &ScenarioConfig) -> Result<GainsReport, SimError> {
    let model = config.model.build()?;
    let mut rng = SimulationRng::from_config(config.simulation.seed);

    let generator = DataGenerator::new(
        config.simulation.duration,
        config.simulation.num_samples,
        config.noise.reference,
        config.noise.platform_pos_mag,
        &model,
    )?
    .with_integrator(config.simulation.integrator, config.simulation.substeps);
    let data = generator.generate(&config.noise.measurement_levels(), &mut rng)?;
    info!(
        samples = data.num_samples(),
        interval = data.interval,
        "generated measurements"
    );

    let mut report = GainsReport::new(model.gains());
    for (i, identifier) in config.identifiers.iter().enumerate() {
        let label = format!("{} {}", i, identifier.get_type_str());
        let _span = info_span!("identifier", %label).entered();
        let (gains, convergence) = match identifier {
            IdentifierConfig::Direct => (
                DirectIdentifier::new(data.measured.torques.clone(), data.measured.states.clone())?.identify()?,
                Convergence::exact(),
            ),
            IdentifierConfig::Collocation(settings) => identify_by_collocation(settings, &data, &model)?,
            IdentifierConfig::Shooting(settings) => identify_by_shooting(settings, &data, &model)?,
        };
        report.push(label, gains, convergence);
    }
    Ok(report)
}

fn identify_by_collocation(
    settings: &CollocationConfig,
    data: &Dataset,
    model: &QuietStandingModel,
) -> Result<(GainMatrix, Convergence), SimError> {
    let num_nodes = settings
        .num_nodes
        .unwrap_or(data.num_samples())
        .min(data.num_samples());
    let states = data.measured.states.rows(0, num_nodes).clone_owned();
    let accel = data.measured.accel.rows(0, num_nodes).clone_owned();

    let mut problem = TrajectoryProblem::build_with(
        num_nodes,
        data.interval,
        &states,
        &accel,
        model,
        settings.bounds,
        settings.integration_method,
    )?;
    let guess = settings.initial_guess(model.gains()).build(&problem);
    let (gains, outcome) =
        collocation::identify_with_problem(&mut problem, &settings.solver_options, Some(&guess))?;
    let active = outcome.boundary_active_gains();
    if !active.is_empty() {
        info!(?active, "gains on their bounds");
    }
    Ok((gains, Convergence::new(outcome.is_success(), format!("{:?}", outcome.info.status))))
}

fn identify_by_shooting(
    settings: &ShootingConfig,
    data: &Dataset,
    model: &QuietStandingModel,
) -> Result<(GainMatrix, Convergence), SimError> {
    // The reference noise is not observable, so the controller tracks zero.
    let reference = DMatrix::zeros(data.num_samples(), NUM_STATES);
    let ode = ClosedLoopOde::new(model, &data.time, &reference, &data.measured.accel)?;
    let initial_guess = match settings.initial_guess {
        GuessKind::Zeros => None,
        GuessKind::Random => {
            let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
            Some(GainMatrix::from_fn(|_, _| rng.gen::<f64>()))
        }
        GuessKind::Known => Some(to_scaled(&model.gains(), &model.gain_scale_factors())),
    };
    let (gains, outcome) = shooting::identify(
        &data.time,
        &data.measured.states,
        &ode,
        settings.method,
        initial_guess.as_ref(),
        settings.tolerance,
        settings.options(),
    )?;
    Ok((gains, Convergence::new(outcome.result.success, outcome.result.message)))
}

/// Runs every scenario under `path`, a file or a directory.
///
/// A failing scenario is logged and skipped. Returns the number of failures.
/// Identifiers that finish without converging are reported per set but do not
/// count as failures.
pub fn run_path(path: &Path) -> Result<usize, SimError> {
    let mut failures = 0;
    for scenario in discover_scenarios(path)? {
        info!("Running scenario: {:?}", scenario);
        match ScenarioConfig::load(&scenario).and_then(|config| run_scenario(&config)) {
            Ok(report) => {
                info!("\n{report}");
                for (set, (_, error)) in report.sets().iter().zip(report.relative_errors()) {
                    let Convergence { converged, status } = &set.convergence;
                    if *converged {
                        info!(label = %set.label, relative_error = error, %status, "identified gains");
                    } else {
                        warn!(label = %set.label, relative_error = error, %status, "identifier did not converge");
                    }
                }
            }
            Err(e) => {
                error!("Scenario {:?} failed: {}", scenario, e);
                failures += 1;
            }
        }
    }
    Ok(failures)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_and_collocation_agree_on_noiseless_data() {
        let config = ScenarioConfig::from_toml_str(
            r#"
            [simulation]
            seed = 9
            duration = 1.0
            num_samples = 101

            [[identifiers]]
            type = "direct"

            [[identifiers]]
            type = "collocation"
            initial_guess = "known"
            seed_states = true
            solver_options = { print_level = 0, sb = "yes" }
            "#,
        )
        .unwrap();
        let report = run_scenario(&config).unwrap();

        assert_eq!(report.actual(), &QuietStandingModel::default_gains());
        let errors = report.relative_errors();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].0, "0 direct");
        assert!(errors[0].1 < 1e-8, "{errors:?}");
        assert_eq!(errors[1].0, "1 collocation");
        assert!(errors[1].1 < 0.05, "{errors:?}");
        assert!(report.unconverged().is_empty(), "{:?}", report.sets());
        assert_eq!(report.sets()[0].convergence, Convergence::exact());
    }

    #[test]
    fn collocation_error_does_not_shrink_as_noise_grows() {
        let mean_error = |coordinate: f64| -> f64 {
            (0..3)
                .map(|seed| {
                    let config = ScenarioConfig::from_toml_str(&format!(
                        r#"
                        [simulation]
                        seed = {seed}
                        duration = 2.0
                        num_samples = 201

                        [noise]
                        coordinate = {coordinate:?}
                        speed = {speed:?}

                        [[identifiers]]
                        type = "collocation"
                        initial_guess = "known"
                        seed_states = true
                        solver_options = {{ print_level = 0, sb = "yes", max_iter = 300 }}
                        "#,
                        speed = 10.0 * coordinate,
                    ))
                    .unwrap();
                    run_scenario(&config).unwrap().relative_errors()[0].1
                })
                .sum::<f64>()
                / 3.0
        };
        let errors: Vec<f64> = [0.0, 2e-3, 2e-2].into_iter().map(mean_error).collect();
        assert!(errors[0] <= errors[1] && errors[1] <= errors[2], "{errors:?}");
    }

    #[test]
    fn shooting_from_the_true_gains() {
        let config = ScenarioConfig::from_toml_str(
            r#"
            [simulation]
            seed = 2
            duration = 1.0
            num_samples = 101
            substeps = 4

            [[identifiers]]
            type = "shooting"
            method = "bfgs"
            initial_guess = "known"
            substeps = 4
            "#,
        )
        .unwrap();
        let report = run_scenario(&config).unwrap();
        assert!(report.relative_errors()[0].1 < 0.02);
        assert!(report.sets()[0].convergence.converged, "{:?}", report.sets()[0]);
    }

    #[test]
    fn failing_scenarios_are_counted() {
        let root = std::env::temp_dir().join(format!("stance_runner_{}", std::process::id()));
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("bad.toml"), "[noise]\nunknown = 1.0").unwrap();
        std::fs::write(
            root.join("good.toml"),
            "[simulation]\nseed = 1\nduration = 0.5\nnum_samples = 51\n[[identifiers]]\ntype = \"direct\"",
        )
        .unwrap();

        assert_eq!(run_path(&root).unwrap(), 1);
        std::fs::remove_dir_all(&root).unwrap();
    }
}
