//! # Conditional Likelihood Kernels
//!
//! CLV storage and the three numerical kernels of the likelihood engine:
//! setting tip states, combining child vectors into a parent vector, and
//! evaluating the log-likelihood across one edge.
//!
//! ## Layout
//! A CLV is `sites × rate_cats × STATES` doubles. Each site carries a `u32`
//! scale counter; whenever all entries of a site drop below `2^-256` they are
//! multiplied by `2^256` and the counter is incremented. Counters add up along
//! the tree and are subtracted back out in `edge_loglikelihood`.
//!
//! The inner product over states is vectorised with `wide::f64x4`: with four
//! nucleotide states one CLV entry is exactly one vector lane group.

use wide::f64x4;

use crate::error::{EpaError, Result};
use crate::model::parameters::{PMatrix, SubstitutionModel, STATES};

/// `2^256`
pub const SCALE_FACTOR: f64 =
    115792089237316195423570985008687907853269984665640564039457584007913129639936.0;
/// `2^-256`
pub const SCALE_THRESHOLD: f64 = 1.0 / SCALE_FACTOR;
/// `ln(2^256)`
pub const LN_SCALE_FACTOR: f64 = 256.0 * std::f64::consts::LN_2;

/// Tip state vector for an IUPAC nucleotide code (order A, C, G, T)
pub fn tip_states(symbol: u8) -> Result<[f64; STATES]> {
    let bits: u8 = match symbol.to_ascii_uppercase() {
        b'A' => 0b0001,
        b'C' => 0b0010,
        b'G' => 0b0100,
        b'T' | b'U' => 0b1000,
        b'M' => 0b0011,
        b'R' => 0b0101,
        b'W' => 0b1001,
        b'S' => 0b0110,
        b'Y' => 0b1010,
        b'K' => 0b1100,
        b'V' => 0b0111,
        b'H' => 0b1011,
        b'D' => 0b1101,
        b'B' => 0b1110,
        b'N' | b'X' | b'?' | b'-' | b'.' | b'O' => 0b1111,
        other => {
            return Err(EpaError::format(format!(
                "illegal nucleotide symbol '{}'",
                other as char
            )))
        }
    };
    let mut states = [0.0; STATES];
    for (i, s) in states.iter_mut().enumerate() {
        if bits & (1 << i) != 0 {
            *s = 1.0;
        }
    }
    Ok(states)
}

/// Borrowed conditional likelihood vector. Tips have no scaler.
#[derive(Clone, Copy, Debug)]
pub struct ClvView<'a> {
    pub clv: &'a [f64],
    pub scaler: Option<&'a [u32]>,
}

impl<'a> ClvView<'a> {
    #[inline]
    fn scale_at(&self, site: usize) -> u32 {
        self.scaler.map_or(0, |s| s[site])
    }
}

/// Owned conditional likelihood vector plus per-site scale counters
#[derive(Clone, Debug, Default)]
pub struct ClvBuffer {
    clv: Vec<f64>,
    scaler: Vec<u32>,
    sites: usize,
    rate_cats: usize,
}

impl ClvBuffer {
    pub fn new(sites: usize, rate_cats: usize) -> Self {
        Self {
            clv: vec![0.0; sites * rate_cats * STATES],
            scaler: vec![0; sites],
            sites,
            rate_cats,
        }
    }

    /// Tip vector from aligned symbols
    pub fn from_tip(sites: &[u8], rate_cats: usize) -> Result<Self> {
        let mut buf = Self::new(sites.len(), rate_cats);
        buf.set_tip(sites)?;
        Ok(buf)
    }

    /// Resize in place, reusing the allocation
    pub fn reset(&mut self, sites: usize, rate_cats: usize) {
        self.sites = sites;
        self.rate_cats = rate_cats;
        self.clv.resize(sites * rate_cats * STATES, 0.0);
        self.scaler.resize(sites, 0);
    }

    pub fn sites(&self) -> usize {
        self.sites
    }

    pub fn rate_cats(&self) -> usize {
        self.rate_cats
    }

    pub fn values(&self) -> &[f64] {
        &self.clv
    }

    pub fn scaler(&self) -> &[u32] {
        &self.scaler
    }

    pub fn view(&self) -> ClvView<'_> {
        ClvView {
            clv: &self.clv,
            scaler: Some(&self.scaler),
        }
    }

    /// Overwrite with the observed states of a tip
    pub fn set_tip(&mut self, sites: &[u8]) -> Result<()> {
        if sites.len() != self.sites {
            return Err(EpaError::format(format!(
                "tip has {} sites, partition expects {}",
                sites.len(),
                self.sites
            )));
        }
        let stride = self.rate_cats * STATES;
        for (site, &symbol) in sites.iter().enumerate() {
            let states = tip_states(symbol)?;
            let block = &mut self.clv[site * stride..(site + 1) * stride];
            for chunk in block.chunks_exact_mut(STATES) {
                chunk.copy_from_slice(&states);
            }
        }
        self.scaler.fill(0);
        Ok(())
    }
}

/// One child contribution to a parent CLV: the child's vector and the
/// transition matrix of the branch leading to it
#[derive(Clone, Copy, Debug)]
pub struct ChildTerm<'a> {
    pub clv: ClvView<'a>,
    pub pmatrix: &'a PMatrix,
}

/// Columns of a 4x4 block as SIMD vectors, so that `P · v = Σ_j col_j · v_j`
#[inline]
fn pmatrix_columns(block: &[f64]) -> [f64x4; STATES] {
    let mut cols = [f64x4::splat(0.0); STATES];
    for (j, col) in cols.iter_mut().enumerate() {
        *col = f64x4::from([block[j], block[STATES + j], block[2 * STATES + j], block[3 * STATES + j]]);
    }
    cols
}

#[inline]
fn load(values: &[f64]) -> [f64; STATES] {
    [values[0], values[1], values[2], values[3]]
}

/// Compute `parent` from its children.
///
/// Each parent entry is the product over children of `Σ_j P_ij · child_j`.
pub fn update_partials(parent: &mut ClvBuffer, children: &[ChildTerm<'_>]) -> Result<()> {
    let sites = parent.sites;
    let rate_cats = parent.rate_cats;
    let stride = rate_cats * STATES;
    let expected = sites * stride;

    if children.is_empty() {
        return Err(EpaError::invalid_input("update_partials needs at least one child"));
    }
    for child in children {
        if child.clv.clv.len() != expected || child.pmatrix.rate_cats() != rate_cats {
            return Err(EpaError::invalid_input(format!(
                "child CLV of {} values / {} rate categories does not match parent ({} / {})",
                child.clv.clv.len(),
                child.pmatrix.rate_cats(),
                expected,
                rate_cats
            )));
        }
    }

    // Per child, per category: matrix columns as vectors
    let columns: Vec<Vec<[f64x4; STATES]>> = children
        .iter()
        .map(|c| (0..rate_cats).map(|k| pmatrix_columns(c.pmatrix.category(k))).collect())
        .collect();

    for site in 0..sites {
        let mut scale: u32 = children.iter().map(|c| c.clv.scale_at(site)).sum();
        let mut site_max = 0.0f64;
        let base = site * stride;

        for cat in 0..rate_cats {
            let offset = base + cat * STATES;
            let mut acc = f64x4::splat(1.0);
            for (child, cols) in children.iter().zip(&columns) {
                let v = load(&child.clv.clv[offset..offset + STATES]);
                let c = &cols[cat];
                let term = c[0] * f64x4::splat(v[0])
                    + c[1] * f64x4::splat(v[1])
                    + c[2] * f64x4::splat(v[2])
                    + c[3] * f64x4::splat(v[3]);
                acc *= term;
            }
            let out: [f64; STATES] = acc.into();
            for &x in &out {
                site_max = site_max.max(x);
            }
            parent.clv[offset..offset + STATES].copy_from_slice(&out);
        }

        if site_max < SCALE_THRESHOLD {
            for x in &mut parent.clv[base..base + stride] {
                *x *= SCALE_FACTOR;
            }
            scale += 1;
        }
        parent.scaler[site] = scale;
    }

    Ok(())
}

/// Log-likelihood across the edge joining `a` and `b` with transition matrix `pmatrix`
pub fn edge_loglikelihood(
    a: ClvView<'_>,
    b: ClvView<'_>,
    pmatrix: &PMatrix,
    model: &SubstitutionModel,
) -> Result<f64> {
    let rate_cats = model.n_rate_cats();
    let stride = rate_cats * STATES;
    if a.clv.len() != b.clv.len() || a.clv.len() % stride != 0 || pmatrix.rate_cats() != rate_cats {
        return Err(EpaError::invalid_input(format!(
            "edge CLVs of {} and {} values incompatible with {} rate categories",
            a.clv.len(),
            b.clv.len(),
            rate_cats
        )));
    }
    let sites = a.clv.len() / stride;
    let freqs = f64x4::from(*model.freqs());
    let weight = model.category_weight();
    let columns: Vec<[f64x4; STATES]> =
        (0..rate_cats).map(|k| pmatrix_columns(pmatrix.category(k))).collect();

    let mut loglik = 0.0;
    for site in 0..sites {
        let base = site * stride;
        let mut site_lh = 0.0;
        for (cat, c) in columns.iter().enumerate() {
            let offset = base + cat * STATES;
            let vb = load(&b.clv[offset..offset + STATES]);
            let pb = c[0] * f64x4::splat(vb[0])
                + c[1] * f64x4::splat(vb[1])
                + c[2] * f64x4::splat(vb[2])
                + c[3] * f64x4::splat(vb[3]);
            let va = f64x4::from(load(&a.clv[offset..offset + STATES]));
            site_lh += (freqs * va * pb).reduce_add();
        }
        site_lh *= weight;

        if !(site_lh > 0.0) || !site_lh.is_finite() {
            return Err(EpaError::numerical(format!(
                "site {} has likelihood {}",
                site, site_lh
            )));
        }
        let scale = a.scale_at(site) + b.scale_at(site);
        loglik += site_lh.ln() - scale as f64 * LN_SCALE_FACTOR;
    }

    Ok(loglik)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tip_states() {
        assert_eq!(tip_states(b'A').unwrap(), [1.0, 0.0, 0.0, 0.0]);
        assert_eq!(tip_states(b't').unwrap(), [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(tip_states(b'R').unwrap(), [1.0, 0.0, 1.0, 0.0]);
        assert_eq!(tip_states(b'-').unwrap(), [1.0; 4]);
        assert!(tip_states(b'Z').is_err());
    }

    #[test]
    fn test_two_tip_likelihood_matches_closed_form() {
        // JC69, one site A vs C at distance t:
        // L = 1/4 * P_AC(t)
        let model = SubstitutionModel::jc69();
        let t = 0.2;
        let a = ClvBuffer::from_tip(b"A", 1).unwrap();
        let c = ClvBuffer::from_tip(b"C", 1).unwrap();
        let pm = model.prob_matrix(t);
        let ll = edge_loglikelihood(a.view(), c.view(), &pm, &model).unwrap();
        let expected = (0.25 * (0.25 - 0.25 * (-4.0 * t / 3.0f64).exp())).ln();
        assert!((ll - expected).abs() < 1e-12);
    }

    #[test]
    fn test_partials_are_consistent_with_edge_likelihood() {
        // Cherry (a, b) below an inner node, joined to c by a zero-length edge
        let model = SubstitutionModel::k80(2.0).unwrap();
        let a = ClvBuffer::from_tip(b"ACGT", 1).unwrap();
        let b = ClvBuffer::from_tip(b"ACGA", 1).unwrap();
        let c = ClvBuffer::from_tip(b"ACTT", 1).unwrap();
        let p1 = model.prob_matrix(0.1);
        let p2 = model.prob_matrix(0.3);
        let p0 = model.prob_matrix(0.0);

        let mut inner = ClvBuffer::new(4, 1);
        update_partials(
            &mut inner,
            &[
                ChildTerm { clv: a.view(), pmatrix: &p1 },
                ChildTerm { clv: b.view(), pmatrix: &p2 },
            ],
        )
        .unwrap();
        let via_inner = edge_loglikelihood(inner.view(), c.view(), &p0, &model).unwrap();

        // Same tree rooted on the edge to a
        let mut other = ClvBuffer::new(4, 1);
        update_partials(
            &mut other,
            &[
                ChildTerm { clv: b.view(), pmatrix: &p2 },
                ChildTerm { clv: c.view(), pmatrix: &p0 },
            ],
        )
        .unwrap();
        let via_a = edge_loglikelihood(other.view(), a.view(), &p1, &model).unwrap();
        assert!((via_inner - via_a).abs() < 1e-10, "{} vs {}", via_inner, via_a);
    }

    #[test]
    fn test_scaling_preserves_likelihood() {
        // A long caterpillar of identical mismatching tips underflows without scaling
        let model = SubstitutionModel::jc69();
        let pm = model.prob_matrix(2.0);
        let tip_a = ClvBuffer::from_tip(b"A", 1).unwrap();
        let tip_c = ClvBuffer::from_tip(b"C", 1).unwrap();

        let mut current = ClvBuffer::from_tip(b"A", 1).unwrap();
        let mut expected_scaled = false;
        for i in 0..400 {
            let tip = if i % 2 == 0 { &tip_c } else { &tip_a };
            let mut next = ClvBuffer::new(1, 1);
            update_partials(
                &mut next,
                &[
                    ChildTerm { clv: current.view(), pmatrix: &pm },
                    ChildTerm { clv: tip.view(), pmatrix: &pm },
                ],
            )
            .unwrap();
            expected_scaled |= next.scaler()[0] > 0;
            current = next;
        }
        assert!(expected_scaled);
        let ll = edge_loglikelihood(current.view(), tip_a.view(), &pm, &model).unwrap();
        assert!(ll.is_finite());
        assert!(ll < -300.0);
    }

    #[test]
    fn test_mismatched_lengths_are_rejected() {
        let model = SubstitutionModel::jc69();
        let a = ClvBuffer::from_tip(b"AC", 1).unwrap();
        let b = ClvBuffer::from_tip(b"A", 1).unwrap();
        let pm = model.prob_matrix(0.1);
        assert!(edge_loglikelihood(a.view(), b.view(), &pm, &model).is_err());
        let mut buf = ClvBuffer::new(2, 1);
        assert!(matches!(buf.set_tip(b"ACG"), Err(EpaError::Format { .. })));
    }
}
