// stance_core/src/utils/integrators.rs

use nalgebra::DVector;
use serde::Deserialize;

use crate::error::IntegrationError;

pub trait Integrator<T>: Send + Sync {
    fn step(
        &self,
        func: &dyn Fn(&DVector<T>, T) -> DVector<T>,
        x0: &DVector<T>,
        t0: T,
        tf: T,
    ) -> DVector<T>;
}

// Runge-Kutta methods
#[derive(Debug, Default, Clone, Copy)]
pub struct RK1;

impl<T> Integrator<T> for RK1
where
    T: num_traits::Float + Send + Sync + std::ops::Mul<DVector<T>, Output = DVector<T>>,
    DVector<T>: std::ops::Add<Output = DVector<T>>,
{
    fn step(
        &self,
        func: &dyn Fn(&DVector<T>, T) -> DVector<T>,
        x0: &DVector<T>,
        t0: T,
        tf: T,
    ) -> DVector<T> {
        let dt = tf - t0;
        x0.clone() + dt * func(x0, t0) // Euler's method
    }
}

/// Heun's method.
#[derive(Debug, Default, Clone, Copy)]
pub struct RK2;

impl<T> Integrator<T> for RK2
where
    T: num_traits::Float + Send + Sync + std::ops::Mul<DVector<T>, Output = DVector<T>>,
    DVector<T>: std::ops::Add<Output = DVector<T>>,
{
    fn step(
        &self,
        func: &dyn Fn(&DVector<T>, T) -> DVector<T>,
        x0: &DVector<T>,
        t0: T,
        tf: T,
    ) -> DVector<T> {
        let dt = tf - t0;
        let half = T::one() / (T::one() + T::one());
        let k1 = func(x0, t0);
        let k2 = func(&(x0.clone() + dt * k1.clone()), tf);

        x0.clone() + half * dt * (k1 + k2)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RK4;

impl<T> Integrator<T> for RK4
where
    T: num_traits::Float + Send + Sync + std::ops::Mul<DVector<T>, Output = DVector<T>>,
    DVector<T>: std::ops::Add<Output = DVector<T>>,
{
    fn step(
        &self,
        func: &dyn Fn(&DVector<T>, T) -> DVector<T>,
        x0: &DVector<T>,
        t0: T,
        tf: T,
    ) -> DVector<T> {
        let dt = tf - t0;
        let two = T::one() + T::one();
        let half = T::one() / two;
        let sixth = T::one() / (two + two + two);

        let k1 = func(x0, t0);
        let k2 = func(&(x0.clone() + half * dt * k1.clone()), t0 + half * dt);
        let k3 = func(&(x0.clone() + half * dt * k2.clone()), t0 + half * dt);
        let k4 = func(&(x0.clone() + dt * k3.clone()), tf);

        x0.clone() + dt * sixth * (k1 + two * k2 + two * k3 + k4)
    }
}

/// Selects one of the fixed-step schemes above from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegratorKind {
    Euler,
    Heun,
    #[default]
    Rk4,
}

impl IntegratorKind {
    pub fn integrator(&self) -> Box<dyn Integrator<f64>> {
        match self {
            IntegratorKind::Euler => Box::new(RK1),
            IntegratorKind::Heun => Box::new(RK2),
            IntegratorKind::Rk4 => Box::new(RK4),
        }
    }
}

/// Integrates `x' = func(x, t)` and records the state at every entry of `times`.
///
/// Each sample interval is split into `substeps` equal steps. Row `i` of the
/// output is the state at `times[i]`; row 0 is `x0`.
pub fn integrate_fixed_step(
    integrator: &dyn Integrator<f64>,
    func: &dyn Fn(&DVector<f64>, f64) -> DVector<f64>,
    x0: &DVector<f64>,
    times: &[f64],
    substeps: usize,
) -> Result<Vec<DVector<f64>>, IntegrationError> {
    let substeps = substeps.max(1);
    let mut samples = Vec::with_capacity(times.len());
    let Some(&first) = times.first() else {
        return Ok(samples);
    };
    if x0.iter().any(|v| !v.is_finite()) {
        return Err(IntegrationError::NonFinite { time: first });
    }

    let mut x = x0.clone();
    samples.push(x.clone());
    for window in times.windows(2) {
        let (t_start, t_end) = (window[0], window[1]);
        let h = (t_end - t_start) / substeps as f64;
        for s in 0..substeps {
            let t0 = t_start + h * s as f64;
            let tf = if s + 1 == substeps { t_end } else { t0 + h };
            x = integrator.step(func, &x, t0, tf);
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(IntegrationError::NonFinite { time: t_end });
        }
        samples.push(x.clone());
    }
    Ok(samples)
}
