//! # Aggregation and Filtering
//!
//! Turns raw per-branch log-likelihoods into likelihood weight ratios and
//! prunes low-support records.
//!
//! All filters keep surviving records in their original (branch-index)
//! order and never renormalise. The count and accumulated filters keep at
//! least one record per placement; the support filter may empty one.
//! Ranking is by weight, descending; equal weights rank the lower original
//! position first.

use crate::data::{Placement, Sample};
use crate::error::{EpaError, Result};

/// Set `lwr_i = exp(L_i - L_max) / Σ_j exp(L_j - L_max)` on every record
pub fn compute_lwr(placement: &mut Placement) {
    let records = placement.records_mut();
    let max = records
        .iter()
        .map(|r| r.likelihood())
        .fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return;
    }
    let total: f64 = records.iter().map(|r| (r.likelihood() - max).exp()).sum();
    for record in records.iter_mut() {
        let weight = (record.likelihood() - max).exp() / total;
        record.set_lwr(weight);
    }
}

pub fn compute_and_set_lwr(sample: &mut Sample) {
    for placement in sample.iter_mut() {
        compute_lwr(placement);
    }
}

/// Record positions sorted by weight, best first
fn ranking(placement: &Placement) -> Vec<usize> {
    let records = placement.records();
    let mut order: Vec<usize> = (0..records.len()).collect();
    order.sort_by(|&a, &b| {
        records[b]
            .lwr()
            .total_cmp(&records[a].lwr())
            .then(a.cmp(&b))
    });
    order
}

/// Keep only the records at the first `n` ranks, in their original order
fn retain_top(placement: &mut Placement, n: usize) {
    let len = placement.len();
    if n >= len {
        return;
    }
    let mut keep = vec![false; len];
    for &i in ranking(placement).iter().take(n) {
        keep[i] = true;
    }
    let mut idx = 0;
    placement.records_mut().retain(|_| {
        let k = keep[idx];
        idx += 1;
        k
    });
}

/// Number of records kept when discarding the bottom `x` percent of `n`
pub fn bottom_percent_keep_count(n: usize, x: f64) -> usize {
    if n == 0 {
        return 0;
    }
    let keep = (n as f64 * (100.0 - x) / 100.0).ceil() as usize;
    keep.clamp(1, n)
}

/// Drop the lowest-weight `x` percent of each placement's records, by count.
///
/// Keeps `ceil(n · (100 - x) / 100)` records, at least one.
pub fn discard_bottom_x_percent(sample: &mut Sample, x: f64) -> Result<()> {
    if !(0.0..100.0).contains(&x) {
        return Err(EpaError::invalid_input(format!(
            "bottom percentage must be in [0, 100), got {}",
            x
        )));
    }
    for placement in sample.iter_mut() {
        let keep = bottom_percent_keep_count(placement.len(), x);
        retain_top(placement, keep);
    }
    Ok(())
}

/// Drop every record whose weight is below `thresh`
pub fn discard_by_support_threshold(sample: &mut Sample, thresh: f64) -> Result<()> {
    check_threshold(thresh)?;
    for placement in sample.iter_mut() {
        placement.records_mut().retain(|r| r.lwr() >= thresh);
    }
    Ok(())
}

/// Keep the smallest best-first prefix whose cumulative weight reaches `thresh`.
///
/// `thresh >= 1.0` keeps everything; `thresh == 0` keeps only the best record.
pub fn discard_by_accumulated_threshold(sample: &mut Sample, thresh: f64) -> Result<()> {
    check_threshold(thresh)?;
    if thresh >= 1.0 {
        return Ok(());
    }
    for placement in sample.iter_mut() {
        let order = ranking(placement);
        let records = placement.records();
        let mut sum = 0.0;
        let mut n = 0;
        for &i in &order {
            sum += records[i].lwr();
            n += 1;
            if sum >= thresh {
                break;
            }
        }
        retain_top(placement, n.max(1));
    }
    Ok(())
}

fn check_threshold(thresh: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&thresh) {
        return Err(EpaError::invalid_input(format!(
            "weight threshold must be in [0, 1], got {}",
            thresh
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{BranchIdx, InsertionRecord};

    fn placement(id: usize, logliks: &[f64]) -> Placement {
        let mut p = Placement::new(id, format!("q{}", id), logliks.len());
        for (b, &ll) in logliks.iter().enumerate() {
            p.push(InsertionRecord::new(BranchIdx::new(b as u32), ll, 0.0, 0.1));
        }
        compute_lwr(&mut p);
        p
    }

    fn sample(logliks: &[f64]) -> Sample {
        let mut s = Sample::new("");
        s.push(placement(0, logliks));
        s
    }

    fn branches(sample: &Sample) -> Vec<u32> {
        sample.placements()[0].records().iter().map(|r| r.branch().0).collect()
    }

    #[test]
    fn test_lwr_sums_to_one() {
        let p = placement(0, &[-1000.0, -1001.5, -1003.0, -999.2, -2000.0]);
        let total: f64 = p.records().iter().map(|r| r.lwr()).sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert_eq!(p.best().unwrap().branch(), BranchIdx::new(3));
    }

    #[test]
    fn test_lwr_is_stable_for_huge_magnitudes() {
        let p = placement(0, &[-1e6, -1e6 - 1.0]);
        let w: Vec<f64> = p.records().iter().map(|r| r.lwr()).collect();
        assert!((w[0] - 1.0 / (1.0 + (-1.0f64).exp())).abs() < 1e-12);
        assert!(w.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_bottom_percent_zero_is_noop() {
        let mut s = sample(&[-3.0, -1.0, -2.0, -4.0]);
        let before = s.clone();
        discard_bottom_x_percent(&mut s, 0.0).unwrap();
        assert_eq!(s, before);
    }

    #[test]
    fn test_bottom_percent_rounds_up() {
        assert_eq!(bottom_percent_keep_count(4, 50.0), 2);
        assert_eq!(bottom_percent_keep_count(5, 50.0), 3);
        assert_eq!(bottom_percent_keep_count(3, 99.0), 1);
        assert_eq!(bottom_percent_keep_count(10, 25.0), 8);

        let mut s = sample(&[-3.0, -1.0, -2.0, -4.0, -5.0]);
        discard_bottom_x_percent(&mut s, 50.0).unwrap();
        // Top three by weight, original order preserved
        assert_eq!(branches(&s), vec![0, 1, 2]);

        assert!(discard_bottom_x_percent(&mut s, 100.0).is_err());
        assert!(discard_bottom_x_percent(&mut s, -1.0).is_err());
    }

    #[test]
    fn test_support_threshold() {
        let mut s = sample(&[-1.0, -1.1, -8.0, -9.0]);
        discard_by_support_threshold(&mut s, 0.01).unwrap();
        assert_eq!(branches(&s), vec![0, 1]);

        // Four equal weights of 0.25: nothing reaches 0.9
        let mut all_low = sample(&[-1.0, -1.0, -1.0, -1.0]);
        discard_by_support_threshold(&mut all_low, 0.9).unwrap();
        assert!(all_low.placements()[0].is_empty());

        let mut exact = sample(&[-1.0, -1.0, -1.0, -1.0]);
        discard_by_support_threshold(&mut exact, 0.25).unwrap();
        assert_eq!(branches(&exact), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_accumulated_threshold() {
        let mut full = sample(&[-2.0, -1.0, -3.0]);
        let before = full.clone();
        discard_by_accumulated_threshold(&mut full, 1.0).unwrap();
        assert_eq!(full, before);

        let mut zero = sample(&[-2.0, -1.0, -3.0]);
        discard_by_accumulated_threshold(&mut zero, 0.0).unwrap();
        assert_eq!(branches(&zero), vec![1]);

        let mut conf = sample(&[-2.0, -1.0, -3.0, -10.0]);
        discard_by_accumulated_threshold(&mut conf, 0.9).unwrap();
        let kept: f64 = conf.placements()[0].records().iter().map(|r| r.lwr()).sum();
        assert!(kept >= 0.9);
        assert_eq!(branches(&conf), vec![0, 1]);
    }

    #[test]
    fn test_filters_are_idempotent() {
        let mut s = sample(&[-2.0, -1.0, -3.0, -1.5, -6.0, -2.5]);
        discard_by_accumulated_threshold(&mut s, 0.8).unwrap();
        let once = s.clone();
        discard_by_accumulated_threshold(&mut s, 0.8).unwrap();
        discard_by_support_threshold(&mut s, 0.0).unwrap();
        assert_eq!(s, once);
    }

    #[test]
    fn test_ties_keep_lower_position() {
        let mut s = sample(&[-1.0, -1.0, -1.0, -1.0]);
        discard_bottom_x_percent(&mut s, 50.0).unwrap();
        assert_eq!(branches(&s), vec![0, 1]);
    }
}
