//! # Substitution Model
//!
//! Time-reversible nucleotide model (GTR and its special cases) with
//! equal-weight rate categories.
//!
//! ## Transition Probabilities
//! With exchangeabilities `r_ij` and base frequencies `π`, the rate matrix is
//! `Q_ij = r_ij · π_j` (normalised to one expected substitution per site).
//! The symmetrised matrix `S = D^½ Q D^-½` (with `D = diag(π)`) is
//! decomposed once as `S = U Λ Uᵀ`, so that
//!
//! ```text
//! P_ij(t) = sqrt(π_j / π_i) · Σ_k U_ik · exp(λ_k · t) · U_jk
//! ```
//!
//! Exchangeabilities are ordered `AC, AG, AT, CG, CT, GT`.

use crate::data::Msa;
use crate::error::{EpaError, Result};

/// Nucleotide alphabet size
pub const STATES: usize = 4;

/// Number of exchangeability parameters of a 4-state reversible model
pub const N_RATES: usize = 6;

/// Row-major transition probability matrices, one per rate category
#[derive(Clone, Debug, PartialEq)]
pub struct PMatrix {
    values: Vec<f64>,
    rate_cats: usize,
}

impl PMatrix {
    pub fn identity(rate_cats: usize) -> Self {
        let mut values = vec![0.0; rate_cats * STATES * STATES];
        for c in 0..rate_cats {
            for i in 0..STATES {
                values[c * STATES * STATES + i * STATES + i] = 1.0;
            }
        }
        Self { values, rate_cats }
    }

    pub fn rate_cats(&self) -> usize {
        self.rate_cats
    }

    /// The 4x4 block of one rate category
    #[inline]
    pub fn category(&self, cat: usize) -> &[f64] {
        &self.values[cat * STATES * STATES..(cat + 1) * STATES * STATES]
    }

    #[inline]
    pub fn get(&self, cat: usize, from: usize, to: usize) -> f64 {
        self.values[cat * STATES * STATES + from * STATES + to]
    }
}

#[derive(Clone, Debug)]
pub struct SubstitutionModel {
    name: String,
    freqs: [f64; STATES],
    rates: [f64; N_RATES],
    rate_cats: Vec<f64>,
    eigenvalues: [f64; STATES],
    eigenvectors: [[f64; STATES]; STATES],
    sqrt_freqs: [f64; STATES],
}

impl SubstitutionModel {
    /// General time-reversible model
    pub fn gtr(freqs: [f64; STATES], rates: [f64; N_RATES]) -> Result<Self> {
        Self::build("GTR", freqs, rates)
    }

    /// Jukes-Cantor: equal frequencies, equal rates
    pub fn jc69() -> Self {
        Self::assemble("JC69", [0.25; STATES], [1.0; N_RATES])
    }

    /// Kimura 2-parameter: equal frequencies, transition/transversion ratio `kappa`
    pub fn k80(kappa: f64) -> Result<Self> {
        Self::build("K80", [0.25; STATES], kappa_rates(kappa))
    }

    /// Felsenstein 81: equal rates, arbitrary frequencies
    pub fn f81(freqs: [f64; STATES]) -> Result<Self> {
        Self::build("F81", freqs, [1.0; N_RATES])
    }

    /// Hasegawa-Kishino-Yano: arbitrary frequencies plus `kappa`
    pub fn hky(kappa: f64, freqs: [f64; STATES]) -> Result<Self> {
        Self::build("HKY", freqs, kappa_rates(kappa))
    }

    fn build(name: &str, freqs: [f64; STATES], rates: [f64; N_RATES]) -> Result<Self> {
        if freqs.iter().any(|f| !f.is_finite() || *f <= 0.0) {
            return Err(EpaError::numerical(format!(
                "base frequencies must be positive, got {:?}",
                freqs
            )));
        }
        if rates.iter().any(|r| !r.is_finite() || *r <= 0.0) {
            return Err(EpaError::numerical(format!(
                "substitution rates must be positive, got {:?}",
                rates
            )));
        }
        Ok(Self::assemble(name, freqs, rates))
    }

    /// Decompose already validated parameters
    fn assemble(name: &str, freqs: [f64; STATES], rates: [f64; N_RATES]) -> Self {
        let total: f64 = freqs.iter().sum();
        let freqs = freqs.map(|f| f / total);
        let sqrt_freqs = freqs.map(f64::sqrt);

        // Symmetrised rate matrix
        let mut s = [[0.0; STATES]; STATES];
        let mut k = 0;
        for i in 0..STATES {
            for j in (i + 1)..STATES {
                let v = rates[k] * sqrt_freqs[i] * sqrt_freqs[j];
                s[i][j] = v;
                s[j][i] = v;
                k += 1;
            }
        }
        for i in 0..STATES {
            // Q_ii = -Σ_j r_ij π_j; the diagonal is unchanged by symmetrisation
            s[i][i] = -(0..STATES)
                .filter(|&j| j != i)
                .map(|j| s[i][j] * sqrt_freqs[j] / sqrt_freqs[i])
                .sum::<f64>();
        }

        let mu: f64 = -(0..STATES).map(|i| freqs[i] * s[i][i]).sum::<f64>();
        for row in s.iter_mut() {
            for v in row.iter_mut() {
                *v /= mu;
            }
        }

        let (eigenvalues, eigenvectors) = jacobi_eigen(s);

        Self {
            name: name.to_string(),
            freqs,
            rates,
            rate_cats: vec![1.0],
            eigenvalues,
            eigenvectors,
            sqrt_freqs,
        }
    }

    /// Replace the rate categories (equal weights). Rates are rescaled to mean 1.
    pub fn with_rate_categories(mut self, rates: Vec<f64>) -> Result<Self> {
        if rates.is_empty() || rates.iter().any(|r| !r.is_finite() || *r <= 0.0) {
            return Err(EpaError::numerical(format!(
                "rate categories must be a non-empty list of positive values, got {:?}",
                rates
            )));
        }
        let mean = rates.iter().sum::<f64>() / rates.len() as f64;
        self.rate_cats = rates.into_iter().map(|r| r / mean).collect();
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn freqs(&self) -> &[f64; STATES] {
        &self.freqs
    }

    pub fn rates(&self) -> &[f64; N_RATES] {
        &self.rates
    }

    pub fn rate_cats(&self) -> &[f64] {
        &self.rate_cats
    }

    pub fn n_rate_cats(&self) -> usize {
        self.rate_cats.len()
    }

    /// Weight of each rate category
    pub fn category_weight(&self) -> f64 {
        1.0 / self.rate_cats.len() as f64
    }

    /// Transition probabilities for a branch of length `t`
    pub fn prob_matrix(&self, t: f64) -> PMatrix {
        let mut pm = PMatrix::identity(self.rate_cats.len());
        self.update_prob_matrix(&mut pm, t);
        pm
    }

    /// Recompute `pm` in place for branch length `t`
    pub fn update_prob_matrix(&self, pm: &mut PMatrix, t: f64) {
        let n_cats = self.rate_cats.len();
        if pm.rate_cats != n_cats {
            *pm = PMatrix::identity(n_cats);
        }
        let u = &self.eigenvectors;
        for (c, &rate) in self.rate_cats.iter().enumerate() {
            let exps = self.eigenvalues.map(|l| (l * t * rate).exp());
            let block = &mut pm.values[c * STATES * STATES..(c + 1) * STATES * STATES];
            for i in 0..STATES {
                for j in 0..STATES {
                    let mut sum = 0.0;
                    for k in 0..STATES {
                        sum += u[i][k] * exps[k] * u[j][k];
                    }
                    // Clamp tiny negative round-off
                    block[i * STATES + j] =
                        (sum * self.sqrt_freqs[j] / self.sqrt_freqs[i]).max(0.0);
                }
            }
        }
    }
}

/// Exchangeabilities with transitions (AG, CT) weighted by `kappa`
fn kappa_rates(kappa: f64) -> [f64; N_RATES] {
    [1.0, kappa, 1.0, 1.0, kappa, 1.0]
}

/// Base frequencies observed in an alignment (unambiguous symbols only, with a
/// pseudocount of one per state)
pub fn empirical_frequencies(msa: &Msa) -> [f64; STATES] {
    let mut counts = [1.0f64; STATES];
    for seq in msa {
        for &s in seq.sites() {
            match s {
                b'A' => counts[0] += 1.0,
                b'C' => counts[1] += 1.0,
                b'G' => counts[2] += 1.0,
                b'T' | b'U' => counts[3] += 1.0,
                _ => {}
            }
        }
    }
    let total: f64 = counts.iter().sum();
    counts.map(|c| c / total)
}

/// Cyclic Jacobi eigen-decomposition of a symmetric 4x4 matrix.
/// Returns eigenvalues and eigenvectors (as columns).
fn jacobi_eigen(mut a: [[f64; STATES]; STATES]) -> ([f64; STATES], [[f64; STATES]; STATES]) {
    let mut v = [[0.0; STATES]; STATES];
    for (i, row) in v.iter_mut().enumerate() {
        row[i] = 1.0;
    }

    for _sweep in 0..64 {
        let mut off = 0.0;
        for p in 0..STATES {
            for q in (p + 1)..STATES {
                off += a[p][q] * a[p][q];
            }
        }
        if off < 1e-30 {
            break;
        }

        for p in 0..STATES {
            for q in (p + 1)..STATES {
                if a[p][q].abs() < 1e-300 {
                    continue;
                }
                let theta = (a[q][q] - a[p][p]) / (2.0 * a[p][q]);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..STATES {
                    let akp = a[k][p];
                    let akq = a[k][q];
                    a[k][p] = c * akp - s * akq;
                    a[k][q] = s * akp + c * akq;
                }
                for k in 0..STATES {
                    let apk = a[p][k];
                    let aqk = a[q][k];
                    a[p][k] = c * apk - s * aqk;
                    a[q][k] = s * apk + c * aqk;
                }
                for row in v.iter_mut() {
                    let vkp = row[p];
                    let vkq = row[q];
                    row[p] = c * vkp - s * vkq;
                    row[q] = s * vkp + c * vkq;
                }
            }
        }
    }

    let eigenvalues = [a[0][0], a[1][1], a[2][2], a[3][3]];
    (eigenvalues, v)
}
