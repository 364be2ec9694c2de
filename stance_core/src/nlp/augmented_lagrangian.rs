// stance_core/src/nlp/augmented_lagrangian.rs

//! Bound-constrained augmented Lagrangian with a projected Levenberg-Marquardt inner loop.
//!
//! The outer loop minimizes `phi = f + lambda' c + rho/2 |c|^2` over the box, then either
//! updates the multipliers (`lambda += rho c`) once the constraints are small enough or
//! raises the penalty. The inner Newton-type system `(B + rho J'J + mu diag) h = -grad phi`
//! keeps the collocation block structure, so it goes through [`BorderedBlockTridiagonal`].

use nalgebra::{DMatrix, DVector, Matrix4};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::nlp::collocation::{DirectCollocation, IntervalBlocks};
use crate::nlp::linalg::BorderedBlockTridiagonal;
use crate::nlp::status::{SolveInfo, SolverStatus};
use crate::types::{State, NUM_STATES};

// --- Algorithm constants ---
const INITIAL_DAMPING: f64 = 1e-3;
const MIN_DAMPING: f64 = 1e-10;
const MAX_DAMPING: f64 = 1e10;
const MAX_PENALTY: f64 = 1e20;
const DAMPING_FLOOR: f64 = 1e-8;
const ACCEPT_RATIO: f64 = 1e-4;
const INITIAL_CONSTRAINT_TARGET: f64 = 1e-2;
const INITIAL_STATIONARITY_TARGET: f64 = 1e-2;

pub(crate) fn solve(problem: &DirectCollocation, initial_guess: &DVector<f64>) -> (DVector<f64>, SolveInfo) {
    let start = Instant::now();
    let options = problem.options();
    let (lower, upper) = problem.bounds();

    if !options.suppress_banner {
        info!(
            "stance collocation engine: {} variables ({} states x {} nodes + {} parameters), {} equality constraints",
            problem.num_free(),
            problem.num_states(),
            problem.num_nodes(),
            problem.num_parameters(),
            problem.num_constraints()
        );
    }

    let mut z = project(initial_guess, lower, upper);
    let mut iterations = 0;

    let objective = problem.objective(&z);
    let constraints = problem.constraints(&z);
    if !objective.is_finite() || constraints.iter().any(|c| !c.is_finite()) {
        warn!("non-finite objective or constraints at the initial guess");
        return finish(problem, z, SolverStatus::InvalidNumberDetected, iterations, start);
    }

    let mut rho = options.penalty_init.unwrap_or_else(|| {
        ((objective + 1e-12) / (constraints.norm_squared() + 1e-12)).clamp(1e-8, 1e2)
    });
    let mut lambda = DVector::zeros(problem.num_constraints());
    let mut mu = INITIAL_DAMPING;
    let mut eta = INITIAL_CONSTRAINT_TARGET.max(options.constr_viol_tol);
    let mut omega = INITIAL_STATIONARITY_TARGET.max(options.tol);

    let status = 'outer: loop {
        // --- Inner loop: projected Levenberg-Marquardt on phi ---
        let mut stalled = false;
        let mut stationarity;
        loop {
            if iterations >= options.max_iter {
                break 'outer SolverStatus::MaximumIterationsExceeded;
            }
            if start.elapsed().as_secs_f64() > options.max_cpu_time {
                break 'outer SolverStatus::MaximumCpuTimeExceeded;
            }
            iterations += 1;

            let blocks = problem.constraint_jacobian_blocks(&z);
            let c = stack_residuals(&blocks);
            let multipliers = &lambda + &c * rho;
            let mut gradient = problem.objective_gradient(&z);
            add_transpose_product(problem, &blocks, &multipliers, &mut gradient);
            let phi = merit(problem.objective(&z), &lambda, &c, rho);
            if !phi.is_finite() || gradient.iter().any(|g| !g.is_finite()) {
                break 'outer SolverStatus::InvalidNumberDetected;
            }

            let (pg, active) = projected_gradient(&z, &gradient, lower, upper);
            stationarity = pg;
            if options.print_level >= 5 {
                debug!(
                    iter = iterations,
                    phi,
                    pg,
                    inf_pr = c.amax(),
                    rho,
                    mu,
                    "inner iteration"
                );
            }
            if pg <= omega {
                break;
            }

            let hessian_diagonal = problem.objective_hessian_diagonal(&z);
            let normal = assemble_normal_matrix(problem, &blocks, &hessian_diagonal, rho);
            let mut rhs = to_node_major(&(-&gradient), problem);
            for &i in &active {
                rhs[node_major_index(problem, i)] = 0.0;
            }

            // Step search: raise the damping until the gain ratio accepts the step.
            loop {
                let mut system = normal.damped(mu, DAMPING_FLOOR);
                for &i in &active {
                    fix_variable(problem, &mut system, i);
                }
                let accepted = system
                    .solve(&rhs, options.linear_solver)
                    .and_then(|step| {
                        let trial = project(&(&z + from_node_major(&step, problem)), lower, upper);
                        let h = &trial - &z;
                        let jh = jacobian_product(problem, &blocks, &h);
                        let curvature: f64 = h
                            .iter()
                            .zip(hessian_diagonal.iter())
                            .map(|(hi, di)| di * hi * hi)
                            .sum();
                        let predicted = -(gradient.dot(&h) + 0.5 * curvature + 0.5 * rho * jh.norm_squared());
                        let trial_phi =
                            merit(problem.objective(&trial), &lambda, &problem.constraints(&trial), rho);
                        let ratio = if predicted > 0.0 && trial_phi.is_finite() {
                            (phi - trial_phi) / predicted
                        } else {
                            -1.0
                        };
                        if options.print_level >= 12 {
                            trace!(mu, predicted, actual = phi - trial_phi, ratio, "step");
                        }
                        (ratio > ACCEPT_RATIO).then_some((trial, ratio))
                    });

                match accepted {
                    Some((trial, ratio)) => {
                        z = trial;
                        let shrink = (1.0 / 3.0_f64).max(1.0 - (2.0 * ratio - 1.0).powi(3));
                        mu = (mu * shrink).max(MIN_DAMPING);
                        break;
                    }
                    None => {
                        mu *= 4.0;
                        if mu > MAX_DAMPING {
                            stalled = true;
                            break;
                        }
                    }
                }
            }
            if stalled {
                break;
            }
        }

        // --- Outer update ---
        let c = problem.constraints(&z);
        let violation = c.amax();
        if options.print_level >= 3 {
            debug!(iter = iterations, violation, stationarity, rho, stalled, "outer iteration");
        }
        if violation <= options.constr_viol_tol && stationarity <= options.tol {
            break SolverStatus::SolveSucceeded;
        }
        if stalled || rho > MAX_PENALTY {
            break if violation <= options.acceptable_constr_viol_tol
                && stationarity <= options.acceptable_tol
            {
                SolverStatus::SolvedToAcceptableLevel
            } else {
                SolverStatus::SearchDirectionTooSmall
            };
        }
        if violation <= eta {
            lambda += &c * rho;
            eta = (eta / 10.0).max(0.1 * options.constr_viol_tol);
            omega = (omega / 10.0).max(options.tol);
        } else {
            rho *= 10.0;
        }
    };

    finish(problem, z, status, iterations, start)
}

fn finish(
    problem: &DirectCollocation,
    z: DVector<f64>,
    status: SolverStatus,
    iterations: usize,
    start: Instant,
) -> (DVector<f64>, SolveInfo) {
    let (lower, upper) = problem.bounds();
    let objective = problem.objective(&z);
    let constraint_violation = problem.constraints(&z).amax();
    let active_bounds = (0..z.len())
        .filter(|&i| on_bound(z[i], lower[i]) || on_bound(z[i], upper[i]))
        .collect();
    let info = SolveInfo {
        status,
        message: status.message().to_string(),
        elapsed: start.elapsed(),
        iterations,
        objective,
        constraint_violation,
        active_bounds,
    };
    if problem.options().print_level >= 1 {
        info!(
            status = status.code(),
            iterations,
            objective,
            constraint_violation,
            elapsed = ?info.elapsed,
            "{}",
            status.message()
        );
    }
    (z, info)
}

fn on_bound(value: f64, bound: f64) -> bool {
    bound.is_finite() && (value - bound).abs() <= 1e-10 * bound.abs().max(1.0)
}

// --- Vector helpers ---

fn merit(objective: f64, lambda: &DVector<f64>, c: &DVector<f64>, rho: f64) -> f64 {
    objective + lambda.dot(c) + 0.5 * rho * c.norm_squared()
}

fn project(z: &DVector<f64>, lower: &DVector<f64>, upper: &DVector<f64>) -> DVector<f64> {
    DVector::from_fn(z.len(), |i, _| z[i].clamp(lower[i], upper[i]))
}

/// Infinity norm of the gradient over the free variables, and the indices held at a bound.
fn projected_gradient(
    z: &DVector<f64>,
    gradient: &DVector<f64>,
    lower: &DVector<f64>,
    upper: &DVector<f64>,
) -> (f64, Vec<usize>) {
    let mut norm = 0.0_f64;
    let mut active = Vec::new();
    for i in 0..z.len() {
        let g = gradient[i];
        if (z[i] <= lower[i] && g > 0.0) || (z[i] >= upper[i] && g < 0.0) {
            active.push(i);
        } else {
            norm = norm.max(g.abs());
        }
    }
    (norm, active)
}

fn stack_residuals(blocks: &[IntervalBlocks]) -> DVector<f64> {
    DVector::from_iterator(
        blocks.len() * NUM_STATES,
        blocks.iter().flat_map(|b| b.residual.iter().copied()),
    )
}

fn node_state(problem: &DirectCollocation, v: &DVector<f64>, k: usize) -> State {
    State::from_fn(|i, _| v[problem.state_index(i, k)])
}

/// `out += J' y` in decision-vector order.
fn add_transpose_product(
    problem: &DirectCollocation,
    blocks: &[IntervalBlocks],
    y: &DVector<f64>,
    out: &mut DVector<f64>,
) {
    let offset = NUM_STATES * problem.num_nodes();
    for (k, b) in blocks.iter().enumerate() {
        let yk = State::from_fn(|i, _| y[NUM_STATES * k + i]);
        let left = b.wrt_left.transpose() * yk;
        let right = b.wrt_right.transpose() * yk;
        let parameters = b.wrt_parameters.transpose() * DVector::from_column_slice(yk.as_slice());
        for i in 0..NUM_STATES {
            out[problem.state_index(i, k)] += left[i];
            out[problem.state_index(i, k + 1)] += right[i];
        }
        for (q, value) in parameters.iter().enumerate() {
            out[offset + q] += value;
        }
    }
}

/// `J h`, interval-major.
fn jacobian_product(problem: &DirectCollocation, blocks: &[IntervalBlocks], h: &DVector<f64>) -> DVector<f64> {
    let offset = NUM_STATES * problem.num_nodes();
    let h_parameters = h.rows(offset, problem.num_parameters());
    let mut out = DVector::zeros(blocks.len() * NUM_STATES);
    for (k, b) in blocks.iter().enumerate() {
        let states = b.wrt_left * node_state(problem, h, k) + b.wrt_right * node_state(problem, h, k + 1);
        let parameters = &b.wrt_parameters * h_parameters;
        for i in 0..NUM_STATES {
            out[NUM_STATES * k + i] = states[i] + parameters[i];
        }
    }
    out
}

// --- Node-major layout for the linear system ---

fn node_major_index(problem: &DirectCollocation, decision_index: usize) -> usize {
    let nodes = problem.num_nodes();
    let offset = NUM_STATES * nodes;
    if decision_index < offset {
        let (i, k) = (decision_index / nodes, decision_index % nodes);
        k * NUM_STATES + i
    } else {
        decision_index
    }
}

fn to_node_major(v: &DVector<f64>, problem: &DirectCollocation) -> DVector<f64> {
    let mut out = v.clone();
    for (i, value) in v.iter().enumerate() {
        out[node_major_index(problem, i)] = *value;
    }
    out
}

fn from_node_major(v: &DVector<f64>, problem: &DirectCollocation) -> DVector<f64> {
    let mut out = v.clone();
    for i in 0..v.len() {
        out[i] = v[node_major_index(problem, i)];
    }
    out
}

fn fix_variable(problem: &DirectCollocation, system: &mut BorderedBlockTridiagonal, decision_index: usize) {
    let offset = NUM_STATES * problem.num_nodes();
    if decision_index < offset {
        let nodes = problem.num_nodes();
        system.fix_state(decision_index % nodes, decision_index / nodes);
    } else {
        system.fix_parameter(decision_index - offset);
    }
}

fn dynamic(block: &Matrix4<f64>) -> DMatrix<f64> {
    DMatrix::from_column_slice(NUM_STATES, NUM_STATES, block.as_slice())
}

/// `B + rho J'J`, node-major.
fn assemble_normal_matrix(
    problem: &DirectCollocation,
    blocks: &[IntervalBlocks],
    hessian_diagonal: &DVector<f64>,
    rho: f64,
) -> BorderedBlockTridiagonal {
    let nodes = problem.num_nodes();
    let offset = NUM_STATES * nodes;
    let mut system = BorderedBlockTridiagonal::zeros(nodes, NUM_STATES, problem.num_parameters());

    for (k, b) in blocks.iter().enumerate() {
        let left = dynamic(&b.wrt_left);
        let right = dynamic(&b.wrt_right);
        let parameters = &b.wrt_parameters;
        let left_t = left.transpose() * rho;
        let right_t = right.transpose() * rho;

        system.diagonal[k] += &left_t * &left;
        system.diagonal[k + 1] += &right_t * &right;
        system.off_diagonal[k] += &left_t * &right;
        system.border[k] += &left_t * parameters;
        system.border[k + 1] += &right_t * parameters;
        system.corner += parameters.transpose() * parameters * rho;
    }

    for k in 0..nodes {
        for i in 0..NUM_STATES {
            system.diagonal[k][(i, i)] += hessian_diagonal[problem.state_index(i, k)];
        }
    }
    for q in 0..problem.num_parameters() {
        system.corner[(q, q)] += hessian_diagonal[offset + q];
    }
    system
}
