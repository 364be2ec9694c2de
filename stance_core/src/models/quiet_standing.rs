// stance_core/src/models/quiet_standing.rs

use nalgebra::{DMatrix, Matrix4};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::models::{ClosedLoopModel, ResidualJacobians};
use crate::scaling::{to_physical, validate_scale_factors};
use crate::types::{GainMatrix, ParameterMap, State, Symbol, NUM_GAINS, NUM_STATES};

// --- Body Parameters ---
/// Anthropometric constants of the two-link standing model.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BodyParameters {
    /// Ankle to hip distance [m].
    pub leg_length: f64,
    /// Ankle to leg mass center [m].
    pub leg_com_length: f64,
    /// Hip to trunk mass center [m].
    pub trunk_com_length: f64,
    pub leg_mass: f64,
    pub trunk_mass: f64,
    /// Leg inertia about its mass center [kg m^2].
    pub leg_inertia: f64,
    /// Trunk inertia about its mass center [kg m^2].
    pub trunk_inertia: f64,
    pub gravity: f64,
}

impl Default for BodyParameters {
    fn default() -> Self {
        Self {
            leg_length: 0.875,
            leg_com_length: 0.484,
            trunk_com_length: 0.315,
            leg_mass: 27.5,
            trunk_mass: 45.0,
            leg_inertia: 1.8,
            trunk_inertia: 2.5,
            gravity: 9.81,
        }
    }
}

// Symbol names of the constants, in the same order as `BodyParameters::as_array`.
const CONSTANT_NAMES: [&str; 8] = ["l_L", "d_L", "d_T", "m_L", "m_T", "I_L", "I_T", "g"];

impl BodyParameters {
    fn as_array(&self) -> [f64; 8] {
        [
            self.leg_length,
            self.leg_com_length,
            self.trunk_com_length,
            self.leg_mass,
            self.trunk_mass,
            self.leg_inertia,
            self.trunk_inertia,
            self.gravity,
        ]
    }

    fn set_by_index(&mut self, index: usize, value: f64) {
        match index {
            0 => self.leg_length = value,
            1 => self.leg_com_length = value,
            2 => self.trunk_com_length = value,
            3 => self.leg_mass = value,
            4 => self.trunk_mass = value,
            5 => self.leg_inertia = value,
            6 => self.trunk_inertia = value,
            _ => self.gravity = value,
        }
    }
}

/// Configuration-independent terms of the equations of motion at one state.
struct Terms {
    m00: f64,
    m01: f64,
    m11: f64,
    /// `d_T l_L m_T sin(theta_h)`, the Coriolis/centripetal coefficient.
    coriolis: f64,
    /// Trunk gravity and platform terms shared by both joints.
    trunk: f64,
    /// Ankle-only gravity and platform term.
    ankle: f64,
}

// --- Quiet Standing Model ---
/// Two-link inverted pendulum (legs and trunk) standing on a platform that
/// accelerates horizontally, stabilized by full-state feedback at the ankle
/// and the hip.
#[derive(Debug, Clone, PartialEq)]
pub struct QuietStandingModel {
    pub body: BodyParameters,
    gains: GainMatrix,
    scale_factors: GainMatrix,
}

impl Default for QuietStandingModel {
    fn default() -> Self {
        Self {
            body: BodyParameters::default(),
            gains: Self::default_gains(),
            scale_factors: GainMatrix::from_element(1000.0),
        }
    }
}

impl QuietStandingModel {
    pub fn new(
        body: BodyParameters,
        gains: GainMatrix,
        scale_factors: GainMatrix,
    ) -> Result<Self, ConfigError> {
        validate_scale_factors(&scale_factors)?;
        Ok(Self {
            body,
            gains,
            scale_factors,
        })
    }

    pub fn default_gains() -> GainMatrix {
        GainMatrix::new(950.0, 175.0, 185.0, 50.0, 45.0, 290.0, 60.0, 26.0)
    }

    fn terms(&self, theta_a: f64, theta_h: f64, accel: f64) -> Terms {
        let b = &self.body;
        let (l_l, d_t, m_t) = (b.leg_length, b.trunk_com_length, b.trunk_mass);
        let cos_h = theta_h.cos();
        let m11 = b.trunk_inertia + m_t * d_t * d_t;
        let m01 = m11 + m_t * d_t * l_l * cos_h;
        let m00 = b.leg_inertia
            + b.trunk_inertia
            + b.leg_com_length * b.leg_com_length * b.leg_mass
            + m_t * (l_l * l_l + d_t * d_t + 2.0 * d_t * l_l * cos_h);
        let lumped = b.leg_com_length * b.leg_mass + l_l * m_t;
        let sum = theta_a + theta_h;
        Terms {
            m00,
            m01,
            m11,
            coriolis: d_t * l_l * m_t * theta_h.sin(),
            trunk: d_t * m_t * (accel * sum.cos() + b.gravity * sum.sin()),
            ankle: lumped * (accel * theta_a.cos() + b.gravity * theta_a.sin()),
        }
    }

    /// Generalized forces excluding the joint torques.
    fn passive_forces(terms: &Terms, omega_a: f64, omega_h: f64) -> (f64, f64) {
        (
            (2.0 * omega_a * omega_h + omega_h * omega_h) * terms.coriolis + terms.trunk + terms.ankle,
            -omega_a * omega_a * terms.coriolis + terms.trunk,
        )
    }
}

impl ClosedLoopModel for QuietStandingModel {
    fn state_symbols(&self) -> Vec<Symbol> {
        ["theta_a", "theta_h", "omega_a", "omega_h"]
            .into_iter()
            .map(Symbol::new)
            .collect()
    }

    fn gain_symbols(&self) -> Vec<Symbol> {
        (0..NUM_GAINS)
            .map(|i| Symbol::new(format!("k_{}{}", i / 4, i % 4)))
            .collect()
    }

    fn exogenous_symbol(&self) -> Symbol {
        Symbol::new("platform_acceleration")
    }

    fn known_parameters(&self) -> ParameterMap {
        let mut map: ParameterMap = CONSTANT_NAMES
            .iter()
            .zip(self.body.as_array())
            .map(|(name, value)| (Symbol::new(*name), value))
            .collect();
        for i in 0..NUM_GAINS {
            map.insert(
                Symbol::new(format!("s_{}{}", i / 4, i % 4)),
                self.scale_factors[(i / 4, i % 4)],
            );
        }
        map
    }

    fn apply_known_parameters(&mut self, parameters: &ParameterMap) -> Result<(), ConfigError> {
        let mut body = self.body;
        let mut scale_factors = self.scale_factors;
        for (symbol, &value) in parameters {
            let name = symbol.name();
            if let Some(index) = CONSTANT_NAMES.iter().position(|c| *c == name) {
                body.set_by_index(index, value);
            } else if let Some(i) = self.gain_index(name, "s_") {
                scale_factors[(i / 4, i % 4)] = value;
            } else {
                return Err(ConfigError::UnknownSymbol(name.to_string()));
            }
        }
        validate_scale_factors(&scale_factors)?;
        self.body = body;
        self.scale_factors = scale_factors;
        Ok(())
    }

    fn gains(&self) -> GainMatrix {
        self.gains
    }

    fn set_gains(&mut self, gains: GainMatrix) {
        self.gains = gains;
    }

    fn gain_scale_factors(&self) -> GainMatrix {
        self.scale_factors
    }

    fn derivatives(&self, x: &State, reference: &State, accel: f64, gains: &GainMatrix) -> State {
        let terms = self.terms(x[0], x[1], accel);
        let torque = gains * (reference - x);
        let (p0, p1) = Self::passive_forces(&terms, x[2], x[3]);
        let (f0, f1) = (torque[0] + p0, torque[1] + p1);

        // The mass matrix is symmetric positive definite for any hip angle.
        let det = terms.m00 * terms.m11 - terms.m01 * terms.m01;
        State::new(
            x[2],
            x[3],
            (terms.m11 * f0 - terms.m01 * f1) / det,
            (terms.m00 * f1 - terms.m01 * f0) / det,
        )
    }

    fn implicit_residual(
        &self,
        x: &State,
        x_dot: &State,
        accel: f64,
        scaled_gains: &GainMatrix,
    ) -> State {
        let gains = to_physical(scaled_gains, &self.scale_factors);
        let terms = self.terms(x[0], x[1], accel);
        let torque = -(gains * x);
        let (p0, p1) = Self::passive_forces(&terms, x[2], x[3]);
        State::new(
            x_dot[0] - x[2],
            x_dot[1] - x[3],
            terms.m00 * x_dot[2] + terms.m01 * x_dot[3] - torque[0] - p0,
            terms.m01 * x_dot[2] + terms.m11 * x_dot[3] - torque[1] - p1,
        )
    }

    fn residual_jacobians(
        &self,
        x: &State,
        x_dot: &State,
        accel: f64,
        scaled_gains: &GainMatrix,
    ) -> ResidualJacobians {
        let b = &self.body;
        let gains = to_physical(scaled_gains, &self.scale_factors);
        let (theta_a, theta_h, omega_a, omega_h) = (x[0], x[1], x[2], x[3]);
        let terms = self.terms(theta_a, theta_h, accel);

        let (l_l, d_t, m_t) = (b.leg_length, b.trunk_com_length, b.trunk_mass);
        let sin_h = theta_h.sin();
        let sum = theta_a + theta_h;
        let lumped = b.leg_com_length * b.leg_mass + l_l * m_t;

        // Derivatives of the configuration-dependent terms.
        let dm00_dh = -2.0 * m_t * d_t * l_l * sin_h;
        let dm01_dh = -m_t * d_t * l_l * sin_h;
        let dcoriolis_dh = d_t * l_l * m_t * theta_h.cos();
        let dtrunk = d_t * m_t * (-accel * sum.sin() + b.gravity * sum.cos());
        let dankle_da = lumped * (-accel * theta_a.sin() + b.gravity * theta_a.cos());

        // Partials of the generalized forces (torques included, torque = -K x).
        let velocity_term = 2.0 * omega_a * omega_h + omega_h * omega_h;
        let df0 = [
            -gains[(0, 0)] + dtrunk + dankle_da,
            -gains[(0, 1)] + velocity_term * dcoriolis_dh + dtrunk,
            -gains[(0, 2)] + 2.0 * omega_h * terms.coriolis,
            -gains[(0, 3)] + (2.0 * omega_a + 2.0 * omega_h) * terms.coriolis,
        ];
        let df1 = [
            -gains[(1, 0)] + dtrunk,
            -gains[(1, 1)] - omega_a * omega_a * dcoriolis_dh + dtrunk,
            -gains[(1, 2)] - 2.0 * omega_a * terms.coriolis,
            -gains[(1, 3)],
        ];

        let mut wrt_state = Matrix4::zeros();
        wrt_state[(0, 2)] = -1.0;
        wrt_state[(1, 3)] = -1.0;
        for j in 0..NUM_STATES {
            wrt_state[(2, j)] = -df0[j];
            wrt_state[(3, j)] = -df1[j];
        }
        wrt_state[(2, 1)] += dm00_dh * x_dot[2] + dm01_dh * x_dot[3];
        wrt_state[(3, 1)] += dm01_dh * x_dot[2];

        let mut wrt_state_derivative = Matrix4::zeros();
        wrt_state_derivative[(0, 0)] = 1.0;
        wrt_state_derivative[(1, 1)] = 1.0;
        wrt_state_derivative[(2, 2)] = terms.m00;
        wrt_state_derivative[(2, 3)] = terms.m01;
        wrt_state_derivative[(3, 2)] = terms.m01;
        wrt_state_derivative[(3, 3)] = terms.m11;

        // Torque row r is -sum_j s_rj k_rj x_j, and it enters the residual with a minus sign.
        let mut wrt_gains = DMatrix::zeros(NUM_STATES, NUM_GAINS);
        for i in 0..NUM_GAINS {
            let (row, col) = (i / 4, i % 4);
            wrt_gains[(2 + row, i)] = self.scale_factors[(row, col)] * x[col];
        }

        ResidualJacobians {
            wrt_state,
            wrt_state_derivative,
            wrt_gains,
        }
    }
}

impl QuietStandingModel {
    /// Index into the row-major gains for symbols like `k_12` or `s_03`.
    fn gain_index(&self, name: &str, prefix: &str) -> Option<usize> {
        let digits = name.strip_prefix(prefix)?.as_bytes();
        match digits {
            [r @ b'0'..=b'1', c @ b'0'..=b'3'] => Some(((r - b'0') * 4 + (c - b'0')) as usize),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::finite_difference_jacobians;
    use crate::scaling::to_scaled;
    use approx::assert_abs_diff_eq;

    fn sample_points() -> Vec<(State, State, f64)> {
        vec![
            (State::new(0.05, -0.1, 0.3, -0.7), State::new(0.3, -0.7, 1.2, -2.0), 0.8),
            (State::new(-0.2, 0.4, -1.1, 0.6), State::new(-1.1, 0.6, 0.5, 3.0), -1.5),
            (State::new(0.0, 0.0, 0.0, 0.0), State::new(0.1, 0.2, 0.3, 0.4), 0.0),
        ]
    }

    #[test]
    fn residual_vanishes_along_the_explicit_dynamics() {
        let model = QuietStandingModel::default();
        let scaled = to_scaled(&model.gains(), &model.gain_scale_factors());
        for (x, _, accel) in sample_points() {
            let x_dot = model.derivatives(&x, &State::zeros(), accel, &model.gains());
            let residual = model.implicit_residual(&x, &x_dot, accel, &scaled);
            assert_abs_diff_eq!(residual.amax(), 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn analytic_jacobians_match_finite_differences() {
        let model = QuietStandingModel::default();
        let scaled = GainMatrix::new(0.9, 0.2, 0.15, 0.05, 0.04, 0.3, 0.06, 0.03);
        for (x, x_dot, accel) in sample_points() {
            let analytic = model.residual_jacobians(&x, &x_dot, accel, &scaled);
            let numeric = finite_difference_jacobians(&model, &x, &x_dot, accel, &scaled);
            assert_abs_diff_eq!(analytic.wrt_state, numeric.wrt_state, epsilon = 1e-5);
            assert_abs_diff_eq!(
                analytic.wrt_state_derivative,
                numeric.wrt_state_derivative,
                epsilon = 1e-5
            );
            assert_abs_diff_eq!(analytic.wrt_gains, numeric.wrt_gains, epsilon = 1e-4);
        }
    }

    #[test]
    fn reference_error_drives_the_torques() {
        let model = QuietStandingModel::default();
        let gains = model.gains();
        let reference = State::new(0.01, 0.0, 0.0, 0.0);
        let pushed = model.derivatives(&State::zeros(), &reference, 0.0, &gains);
        let still = model.derivatives(&State::zeros(), &State::zeros(), 0.0, &gains);
        assert_abs_diff_eq!(still.amax(), 0.0);
        assert!(pushed[2].abs() > 0.0);
    }

    #[test]
    fn known_parameters_round_trip() {
        let mut model = QuietStandingModel::default();
        let mut params = model.known_parameters();
        assert_eq!(params.len(), 16);
        assert_abs_diff_eq!(params[&Symbol::new("m_T")], 45.0);
        params.insert(Symbol::new("m_T"), 50.0);
        params.insert(Symbol::new("s_13"), 100.0);
        model.apply_known_parameters(&params).unwrap();
        assert_abs_diff_eq!(model.body.trunk_mass, 50.0);
        assert_abs_diff_eq!(model.gain_scale_factors()[(1, 3)], 100.0);
    }

    #[test]
    fn rejects_foreign_parameters() {
        let mut model = QuietStandingModel::default();
        let mut params = ParameterMap::new();
        params.insert(Symbol::new("wheel_base"), 2.0);
        assert_eq!(
            model.apply_known_parameters(&params),
            Err(ConfigError::UnknownSymbol("wheel_base".into()))
        );
        params.clear();
        params.insert(Symbol::new("s_00"), -1.0);
        assert!(model.apply_known_parameters(&params).is_err());
        assert_abs_diff_eq!(model.gain_scale_factors()[(0, 0)], 1000.0);
    }

    #[test]
    fn gain_symbols_are_row_major() {
        let names: Vec<String> = QuietStandingModel::default()
            .gain_symbols()
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(names[0], "k_00");
        assert_eq!(names[3], "k_03");
        assert_eq!(names[4], "k_10");
        assert_eq!(names[7], "k_13");
    }
}
