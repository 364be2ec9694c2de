// stance_core/src/optimize/nelder_mead.rs

use nalgebra::DVector;
use std::cell::Cell;

use super::{MinimizeOptions, MinimizeResult};

// Reflection, expansion, contraction and shrink coefficients.
const RHO: f64 = 1.0;
const CHI: f64 = 2.0;
const PSI: f64 = 0.5;
const SIGMA: f64 = 0.5;

/// Downhill simplex. Converges once both the spread of the simplex values and
/// the distance of every vertex to the best one are within `tol`.
pub fn minimize<F, E>(
    f: F,
    x0: &DVector<f64>,
    tol: f64,
    options: &MinimizeOptions,
) -> Result<MinimizeResult, E>
where
    F: Fn(&DVector<f64>) -> Result<f64, E>,
{
    let n = x0.len();
    let (max_iterations, max_evaluations) = match (options.max_iterations, options.max_evaluations) {
        (None, None) => (200 * n, 200 * n),
        (Some(iterations), None) => (iterations, usize::MAX),
        (None, Some(evaluations)) => (usize::MAX, evaluations),
        (Some(iterations), Some(evaluations)) => (iterations, evaluations),
    };

    let nfev = Cell::new(0);
    let eval = |x: &DVector<f64>| -> Result<f64, E> {
        nfev.set(nfev.get() + 1);
        let value = f(x)?;
        Ok(if value.is_nan() { f64::INFINITY } else { value })
    };

    // Initial simplex: 5% along each axis, or a small absolute step for zero entries.
    let mut simplex = vec![x0.clone()];
    for i in 0..n {
        let mut vertex = x0.clone();
        vertex[i] = if vertex[i] != 0.0 { 1.05 * vertex[i] } else { 0.00025 };
        simplex.push(vertex);
    }
    let mut values = Vec::with_capacity(n + 1);
    for vertex in &simplex {
        values.push(eval(vertex)?);
    }

    let mut nit = 0;
    let (success, message) = loop {
        sort_simplex(&mut simplex, &mut values);
        let spread = values.iter().map(|v| (v - values[0]).abs()).fold(0.0, f64::max);
        let size = simplex
            .iter()
            .skip(1)
            .map(|v| (v - &simplex[0]).amax())
            .fold(0.0, f64::max);
        if spread <= tol && size <= tol {
            break (true, "Optimization terminated successfully.");
        }
        if nit >= max_iterations {
            break (false, "Maximum number of iterations has been exceeded.");
        }
        if nfev.get() >= max_evaluations {
            break (false, "Maximum number of function evaluations has been exceeded.");
        }
        nit += 1;

        let centroid = simplex[..n]
            .iter()
            .fold(DVector::zeros(n), |acc, v| acc + v)
            / n as f64;
        let worst = simplex[n].clone();

        let reflected = &centroid * (1.0 + RHO) - &worst * RHO;
        let f_reflected = eval(&reflected)?;

        let mut shrink = false;
        if f_reflected < values[0] {
            let expanded = &centroid * (1.0 + RHO * CHI) - &worst * (RHO * CHI);
            let f_expanded = eval(&expanded)?;
            if f_expanded < f_reflected {
                simplex[n] = expanded;
                values[n] = f_expanded;
            } else {
                simplex[n] = reflected;
                values[n] = f_reflected;
            }
        } else if f_reflected < values[n - 1] {
            simplex[n] = reflected;
            values[n] = f_reflected;
        } else if f_reflected < values[n] {
            let contracted = &centroid * (1.0 + PSI * RHO) - &worst * (PSI * RHO);
            let f_contracted = eval(&contracted)?;
            if f_contracted <= f_reflected {
                simplex[n] = contracted;
                values[n] = f_contracted;
            } else {
                shrink = true;
            }
        } else {
            let contracted = &centroid * (1.0 - PSI) + &worst * PSI;
            let f_contracted = eval(&contracted)?;
            if f_contracted < values[n] {
                simplex[n] = contracted;
                values[n] = f_contracted;
            } else {
                shrink = true;
            }
        }

        if shrink {
            let best = simplex[0].clone();
            for j in 1..=n {
                simplex[j] = &best + (&simplex[j] - &best) * SIGMA;
                values[j] = eval(&simplex[j])?;
            }
        }
    };

    Ok(MinimizeResult {
        x: simplex[0].clone(),
        fun: values[0],
        success,
        message: message.to_string(),
        nit,
        nfev: nfev.get(),
    })
}

fn sort_simplex(simplex: &mut Vec<DVector<f64>>, values: &mut Vec<f64>) {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    *simplex = order.iter().map(|&i| simplex[i].clone()).collect();
    *values = order.iter().map(|&i| values[i]).collect();
}
