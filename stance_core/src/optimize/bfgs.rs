// stance_core/src/optimize/bfgs.rs

//! Quasi-Newton BFGS with central finite-difference gradients.

use nalgebra::{DMatrix, DVector};

use super::{MinimizeOptions, MinimizeResult};

// Armijo sufficient-decrease constant.
const C1: f64 = 1e-4;
const MIN_STEP: f64 = 1e-12;
/// Relative reduction of `f` below which the iteration counts as converged.
pub const FTOL: f64 = 2.220446049250313e-9;

/// `reduction <= FTOL * max(|f|, 1)`.
fn negligible_reduction(reduction: f64, fx: f64) -> bool {
    reduction <= FTOL * fx.abs().max(1.0)
}

/// Gradient test relaxed to the accuracy of a finite-difference gradient:
/// `max|g| <= max(gtol, sqrt(FTOL) * max(|f|, 1))`.
fn near_stationary(gradient: &DVector<f64>, fx: f64, gtol: f64) -> bool {
    gradient.amax() <= gtol.max(FTOL.sqrt() * fx.abs().max(1.0))
}

struct Counted<F> {
    f: F,
    nfev: usize,
}

impl<F, E> Counted<F>
where
    F: Fn(&DVector<f64>) -> Result<f64, E>,
{
    fn eval(&mut self, x: &DVector<f64>) -> Result<f64, E> {
        self.nfev += 1;
        (self.f)(x)
    }

    fn gradient(&mut self, x: &DVector<f64>) -> Result<DVector<f64>, E> {
        let mut gradient = DVector::zeros(x.len());
        let mut shifted = x.clone();
        for i in 0..x.len() {
            let h = f64::EPSILON.cbrt() * x[i].abs().max(1.0);
            shifted[i] = x[i] + h;
            let plus = self.eval(&shifted)?;
            shifted[i] = x[i] - h;
            let minus = self.eval(&shifted)?;
            shifted[i] = x[i];
            gradient[i] = (plus - minus) / (2.0 * h);
        }
        Ok(gradient)
    }
}

pub fn minimize<F, E>(
    f: F,
    x0: &DVector<f64>,
    gtol: f64,
    options: &MinimizeOptions,
) -> Result<MinimizeResult, E>
where
    F: Fn(&DVector<f64>) -> Result<f64, E>,
{
    let n = x0.len();
    let max_iterations = options.max_iterations.unwrap_or(200 * n);
    let mut objective = Counted { f, nfev: 0 };

    let mut x = x0.clone();
    let mut fx = objective.eval(&x)?;
    // Reaching `FTOL * max(|f0|, 1)` counts as having reached the floor of the objective.
    let floor = FTOL * fx.abs().max(1.0);
    let mut gradient = objective.gradient(&x)?;
    let mut inverse_hessian = DMatrix::identity(n, n);

    let mut nit = 0;
    let (success, message) = loop {
        if !fx.is_finite() {
            break (false, "NaN result encountered.");
        }
        if gradient.amax() <= gtol {
            break (true, "Optimization terminated successfully.");
        }
        if nit >= max_iterations {
            break (false, "Maximum number of iterations has been exceeded.");
        }
        if options.max_evaluations.is_some_and(|cap| objective.nfev >= cap) {
            break (false, "Maximum number of function evaluations has been exceeded.");
        }
        nit += 1;

        let mut direction = -(&inverse_hessian * &gradient);
        let mut slope = gradient.dot(&direction);
        if slope >= 0.0 {
            // Lost descent, restart from steepest descent.
            inverse_hessian = DMatrix::identity(n, n);
            direction = -&gradient;
            slope = -gradient.norm_squared();
        }

        // Backtracking with quadratic interpolation.
        let mut alpha = 1.0;
        let mut accepted = None;
        while alpha >= MIN_STEP {
            let candidate = &x + &direction * alpha;
            let f_candidate = objective.eval(&candidate)?;
            if f_candidate.is_finite() && f_candidate <= fx + C1 * alpha * slope {
                accepted = Some((candidate, f_candidate));
                break;
            }
            let curvature = f_candidate - fx - alpha * slope;
            let interpolated = if f_candidate.is_finite() && curvature > 0.0 {
                -slope * alpha * alpha / (2.0 * curvature)
            } else {
                0.5 * alpha
            };
            alpha = interpolated.clamp(0.1 * alpha, 0.5 * alpha);
        }
        let Some((x_new, f_new)) = accepted else {
            // At the floor of the objective the finite-difference gradient is noise and
            // no step can satisfy the decrease condition.
            if fx.abs() <= floor {
                break (true, "Optimization terminated successfully: objective at its floor.");
            }
            if negligible_reduction(-slope, fx) && near_stationary(&gradient, fx, gtol) {
                break (true, "Optimization terminated successfully: predicted reduction below ftol.");
            }
            break (false, "Desired error not necessarily achieved due to precision loss.");
        };

        let gradient_new = objective.gradient(&x_new)?;
        // A backtracked step can reduce f by almost nothing far from a minimum, so a
        // small reduction only counts together with a small gradient.
        let stalled = negligible_reduction(fx - f_new, fx) && near_stationary(&gradient_new, f_new, gtol);
        let s = &x_new - &x;
        let y = &gradient_new - &gradient;
        let sy = s.dot(&y);
        if sy > 1e-12 * s.norm() * y.norm() {
            let rho = 1.0 / sy;
            let identity = DMatrix::<f64>::identity(n, n);
            let left = &identity - (&s * y.transpose()) * rho;
            let right = &identity - (&y * s.transpose()) * rho;
            inverse_hessian = &left * &inverse_hessian * &right + (&s * s.transpose()) * rho;
        }

        x = x_new;
        fx = f_new;
        gradient = gradient_new;
        if stalled {
            break (true, "Optimization terminated successfully: relative reduction of f below ftol.");
        }
    };

    Ok(MinimizeResult {
        x,
        fun: fx,
        success,
        message: message.to_string(),
        nit,
        nfev: objective.nfev,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimize::test_functions::rosenbrock;
    use approx::assert_abs_diff_eq;

    #[test]
    fn solves_rosenbrock() {
        let x0 = DVector::from_vec(vec![-1.2, 1.0]);
        let result = minimize(rosenbrock, &x0, 1e-6, &MinimizeOptions::default()).unwrap();
        assert!(result.success, "{}", result.message);
        assert_abs_diff_eq!(result.x, DVector::from_vec(vec![1.0, 1.0]), epsilon = 1e-4);
        assert!(result.fun < 1e-8);
    }

    #[test]
    fn starting_at_the_minimum_converges_immediately() {
        let x0 = DVector::from_vec(vec![1.0, 1.0]);
        let result = minimize(rosenbrock, &x0, 1e-6, &MinimizeOptions::default()).unwrap();
        assert!(result.success);
        assert_eq!(result.nit, 0);
    }

    #[test]
    fn flat_objective_stops_on_the_reduction_test() {
        // Far from the minimum of a tiny objective the gradient is above gtol, but no
        // step can reduce f by more than round-off relative to 1.
        let tiny = |x: &DVector<f64>| -> Result<f64, std::convert::Infallible> { Ok(1e-12 * x.norm_squared()) };
        let x0 = DVector::from_vec(vec![3.0, -4.0]);
        let result = minimize(tiny, &x0, 1e-14, &MinimizeOptions::default()).unwrap();
        assert!(result.success, "{}", result.message);
        assert!(result.message.contains("ftol"));
        assert!(result.nit <= 2);
    }

    #[test]
    fn a_tiny_backtracked_step_on_a_steep_valley_is_not_convergence() {
        // Rosenbrock with a stiff valley, started on the valley floor: the line search
        // backtracks to a step of about 1e-9 whose reduction is below ftol while the
        // gradient along the floor is still about 4.
        let stiff = |x: &DVector<f64>| -> Result<f64, std::convert::Infallible> {
            Ok((1.0 - x[0]).powi(2) + 1e9 * (x[1] - x[0] * x[0]).powi(2))
        };
        let x0 = DVector::from_vec(vec![-1.2, 1.44]);
        let options = MinimizeOptions {
            max_iterations: Some(5),
            ..MinimizeOptions::default()
        };
        let result = minimize(stiff, &x0, 1e-6, &options).unwrap();
        assert!(!result.success, "{}", result.message);
        assert!(!result.message.contains("ftol"), "{}", result.message);
        assert!(result.fun > 0.1);
    }

    #[test]
    fn zero_objective_with_a_kinked_gradient_stops_at_the_floor() {
        // Zero around the origin and steep past a kink just beside it: the central
        // difference at the origin is about 3 per axis, yet no step can reduce f.
        let kinked = |x: &DVector<f64>| -> Result<f64, std::convert::Infallible> {
            Ok(((x[0] - 1e-7).max(0.0) * 1e3).powi(2) + ((x[1] + 1e-7).min(0.0) * 1e3).powi(2))
        };
        let x0 = DVector::from_vec(vec![0.0, 0.0]);
        let result = minimize(kinked, &x0, 1e-6, &MinimizeOptions::default()).unwrap();
        assert!(result.success, "{}", result.message);
        assert!(result.message.contains("floor"), "{}", result.message);
        assert_eq!(result.fun, 0.0);
        assert_eq!(result.nit, 1);
    }

    #[test]
    fn iteration_cap_is_reported() {
        let x0 = DVector::from_vec(vec![-1.2, 1.0]);
        let options = MinimizeOptions {
            max_iterations: Some(3),
            ..MinimizeOptions::default()
        };
        let result = minimize(rosenbrock, &x0, 1e-12, &options).unwrap();
        assert!(!result.success);
        assert_eq!(result.nit, 3);
    }
}
