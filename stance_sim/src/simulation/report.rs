// stance_sim/src/simulation/report.rs

use std::fmt;

use stance_core::scaling::flatten_gains;
use stance_core::types::GainMatrix;

const GAIN_LABELS: [&str; 8] = ["g_00", "g_01", "g_02", "g_03", "g_10", "g_11", "g_12", "g_13"];

/// How an identifier finished: whether it reports convergence, and its status text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Convergence {
    pub converged: bool,
    pub status: String,
}

impl Convergence {
    pub fn new(converged: bool, status: impl Into<String>) -> Self {
        Self {
            converged,
            status: status.into(),
        }
    }

    /// For closed-form identifiers that cannot fail to converge.
    pub fn exact() -> Self {
        Self::new(true, "closed form")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentifiedSet {
    pub label: String,
    pub gains: GainMatrix,
    pub convergence: Convergence,
}

/// Side-by-side table of the true gains and every identified set.
#[derive(Debug, Clone, PartialEq)]
pub struct GainsReport {
    actual: GainMatrix,
    sets: Vec<IdentifiedSet>,
}

impl GainsReport {
    pub fn new(actual: GainMatrix) -> Self {
        Self {
            actual,
            sets: Vec::new(),
        }
    }

    pub fn push(&mut self, label: impl Into<String>, gains: GainMatrix, convergence: Convergence) {
        self.sets.push(IdentifiedSet {
            label: label.into(),
            gains,
            convergence,
        });
    }

    pub fn actual(&self) -> &GainMatrix {
        &self.actual
    }

    pub fn sets(&self) -> &[IdentifiedSet] {
        &self.sets
    }

    /// `||K - G||_F / ||G||_F` per identified set.
    pub fn relative_errors(&self) -> Vec<(&str, f64)> {
        let norm = self.actual.norm();
        self.sets
            .iter()
            .map(|set| (set.label.as_str(), (set.gains - self.actual).norm() / norm))
            .collect()
    }

    /// Labels of the sets whose identifier did not report convergence.
    pub fn unconverged(&self) -> Vec<&str> {
        self.sets
            .iter()
            .filter(|set| !set.convergence.converged)
            .map(|set| set.label.as_str())
            .collect()
    }
}

impl fmt::Display for GainsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut header = vec!["Gains".to_string(), "Actual".to_string()];
        header.extend(self.sets.iter().map(|set| set.label.clone()));

        let mut columns: Vec<Vec<String>> = vec![GAIN_LABELS.iter().map(|s| s.to_string()).collect()];
        for gains in std::iter::once(&self.actual).chain(self.sets.iter().map(|set| &set.gains)) {
            columns.push(flatten_gains(gains).iter().map(|g| format!("{g:.3}")).collect());
        }

        let mut footer = vec!["rel. err".to_string(), "-".to_string()];
        footer.extend(self.relative_errors().iter().map(|(_, e)| format!("{e:.3e}")));
        let mut converged = vec!["converged".to_string(), "-".to_string()];
        converged.extend(
            self.sets
                .iter()
                .map(|set| if set.convergence.converged { "yes" } else { "no" }.to_string()),
        );

        let widths: Vec<usize> = header
            .iter()
            .zip(&footer)
            .zip(&converged)
            .zip(&columns)
            .map(|(((h, t), c), column)| {
                column
                    .iter()
                    .map(String::len)
                    .chain([h.len(), t.len(), c.len()])
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let rule = widths
            .iter()
            .map(|w| "-".repeat(w + 2))
            .collect::<Vec<_>>()
            .join("+");
        writeln!(f, "+{rule}+")?;
        write_row(f, &widths, &header.iter().map(String::as_str).collect::<Vec<_>>())?;
        writeln!(f, "+{rule}+")?;
        for i in 0..GAIN_LABELS.len() {
            write_row(f, &widths, &columns.iter().map(|c| c[i].as_str()).collect::<Vec<_>>())?;
        }
        writeln!(f, "+{rule}+")?;
        write_row(f, &widths, &footer.iter().map(String::as_str).collect::<Vec<_>>())?;
        write_row(f, &widths, &converged.iter().map(String::as_str).collect::<Vec<_>>())?;
        write!(f, "+{rule}+")
    }
}

fn write_row(f: &mut fmt::Formatter<'_>, widths: &[usize], cells: &[&str]) -> fmt::Result {
    let line = cells
        .iter()
        .zip(widths)
        .map(|(cell, &w)| format!(" {cell:>w$} "))
        .collect::<Vec<_>>()
        .join("|");
    writeln!(f, "|{line}|")
}
