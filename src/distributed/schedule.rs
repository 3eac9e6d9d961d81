//! # Difficulty-Aware Scheduler
//!
//! One-shot allocation of a fixed number of work units (workers) across the
//! stages of a pipeline, from measured per-unit stage costs.

use crate::error::{EpaError, Result};

/// Normalise per-stage average costs in place so the cheapest stage is 1.0
pub fn to_difficulty(perstage_avg: &mut [f64]) -> Result<()> {
    let min = perstage_avg.iter().copied().fold(f64::INFINITY, f64::min);
    if perstage_avg.is_empty() || !(min > 0.0) || !min.is_finite() {
        return Err(EpaError::invalid_input(
            "stage costs must be non-empty, finite and positive",
        ));
    }
    for cost in perstage_avg.iter_mut() {
        *cost /= min;
    }
    Ok(())
}

/// Allocate `total_units` across `stages`, inversely proportional to cost.
///
/// Every stage receives one unit up front; the rest is shared by weight
/// `1 / cost`. Units left over after flooring go to the largest fractional
/// shares, lower stage index first on ties. The result sums to `total_units`.
pub fn solve(stages: usize, total_units: usize, perstage_cost: &[f64]) -> Result<Vec<usize>> {
    if stages == 0 || perstage_cost.len() != stages {
        return Err(EpaError::invalid_input(format!(
            "{} stage costs given for {} stages",
            perstage_cost.len(),
            stages
        )));
    }
    if total_units < stages {
        return Err(EpaError::invalid_input(format!(
            "cannot give each of {} stages a unit with only {} units",
            stages, total_units
        )));
    }
    if perstage_cost.iter().any(|&c| !(c > 0.0) || !c.is_finite()) {
        return Err(EpaError::invalid_input("stage costs must be finite and positive"));
    }

    let weights: Vec<f64> = perstage_cost.iter().map(|c| 1.0 / c).collect();
    let weight_sum: f64 = weights.iter().sum();
    let spare = total_units - stages;

    let shares: Vec<f64> = weights
        .iter()
        .map(|w| spare as f64 * w / weight_sum)
        .collect();
    let mut allocation: Vec<usize> = shares.iter().map(|s| 1 + s.floor() as usize).collect();

    let assigned: usize = allocation.iter().sum();
    let remainder = total_units.saturating_sub(assigned);

    let mut order: Vec<usize> = (0..stages).collect();
    // Stable sort keeps lower indices first among equal fractions
    order.sort_by(|&a, &b| {
        let fa = shares[a] - shares[a].floor();
        let fb = shares[b] - shares[b].floor();
        fb.total_cmp(&fa)
    });
    for &stage in order.iter().cycle().take(remainder) {
        allocation[stage] += 1;
    }

    Ok(allocation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_difficulty() {
        let mut avg = vec![20.0, 2.0, 10.0, 3.0];
        to_difficulty(&mut avg).unwrap();
        assert_eq!(avg, vec![10.0, 1.0, 5.0, 1.5]);
    }

    #[test]
    fn test_to_difficulty_rejects_zero() {
        assert!(to_difficulty(&mut [1.0, 0.0]).is_err());
        assert!(to_difficulty(&mut []).is_err());
    }

    #[test]
    fn test_solve_favours_cheap_stages() {
        let nps = solve(4, 32, &[1000.0, 1.0, 1000.0, 1.0]).unwrap();
        assert_eq!(nps.iter().sum::<usize>(), 32);
        assert!(nps.iter().all(|&n| n >= 1));
        assert!(nps[1] > nps[0] && nps[1] > nps[2]);
        assert!(nps[3] > nps[0] && nps[3] > nps[2]);
        assert_eq!(nps, vec![1, 15, 1, 15]);
    }

    #[test]
    fn test_solve_remainder_tie_goes_to_lower_index() {
        // Three equal stages, one spare unit after the minimum
        assert_eq!(solve(3, 4, &[1.0, 1.0, 1.0]).unwrap(), vec![2, 1, 1]);
        assert_eq!(solve(3, 5, &[2.0, 2.0, 2.0]).unwrap(), vec![2, 2, 1]);
    }

    #[test]
    fn test_solve_exact_minimum() {
        assert_eq!(solve(2, 2, &[1.0, 50.0]).unwrap(), vec![1, 1]);
    }

    #[test]
    fn test_solve_invalid() {
        assert!(solve(3, 2, &[1.0, 1.0, 1.0]).is_err());
        assert!(solve(2, 4, &[1.0]).is_err());
        assert!(solve(2, 4, &[1.0, -1.0]).is_err());
        assert!(solve(0, 4, &[]).is_err());
    }

    #[test]
    fn test_solve_is_monotone_in_cost() {
        let nps = solve(3, 20, &[1.0, 2.0, 4.0]).unwrap();
        assert_eq!(nps.iter().sum::<usize>(), 20);
        assert!(nps[0] >= nps[1] && nps[1] >= nps[2]);
    }
}
