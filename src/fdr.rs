//! Permutation p-values, false-discovery-rate control, and effect sizes.
//!
//! The conventions here are the usual neuroimaging ones: permutation
//! p-values include the observed statistic in the null (so the smallest
//! attainable p is `1/(n_perms+1)`), q-values preserve the rank order of
//! the p-values, and NaN p-values pass through as NaN without ever being
//! declared significant.

use ndarray::{Array1, Array2, Axis};

/// FDR procedure. Benjamini–Yekutieli divides α by the harmonic number
/// `H_m`, buying validity under arbitrary dependence at the price of
/// power.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FdrMethod {
    #[default]
    BenjaminiHochberg,
    BenjaminiYekutieli,
}

/// Result of an FDR pass over a p-value vector.
#[derive(Debug, Clone)]
pub struct FdrOutcome {
    /// Adjusted q-values, indexed like the input p-values.
    pub q_values: Array1<f64>,
    /// Largest p-value rejected; 0.0 when nothing is rejected.
    pub threshold: f64,
    /// Per-element rejection mask.
    pub significant: Vec<bool>,
}

/// Benjamini–Hochberg / Benjamini–Yekutieli step-up control at level α.
pub fn fdr_correction(p_values: &Array1<f64>, alpha: f64, method: FdrMethod) -> FdrOutcome {
    let n = p_values.len();
    let mut q_values = Array1::from_elem(n, f64::NAN);
    let mut significant = vec![false; n];

    // NaNs are excluded from the multiplicity count entirely.
    let mut order: Vec<usize> = (0..n).filter(|&i| !p_values[i].is_nan()).collect();
    order.sort_by(|&a, &b| p_values[a].partial_cmp(&p_values[b]).unwrap());
    let m = order.len();
    if m == 0 {
        return FdrOutcome {
            q_values,
            threshold: 0.0,
            significant,
        };
    }

    let penalty = match method {
        FdrMethod::BenjaminiHochberg => 1.0,
        FdrMethod::BenjaminiYekutieli => (1..=m).map(|k| 1.0 / k as f64).sum(),
    };

    // Step-up rejection: the largest i with p_(i) ≤ i·α/(m·penalty).
    let mut cutoff_rank = None;
    for (rank, &idx) in order.iter().enumerate() {
        let bound = (rank + 1) as f64 * alpha / (m as f64 * penalty);
        if p_values[idx] <= bound {
            cutoff_rank = Some(rank);
        }
    }
    let threshold = match cutoff_rank {
        Some(rank) => {
            for &idx in &order[..=rank] {
                significant[idx] = true;
            }
            p_values[order[rank]]
        }
        None => 0.0,
    };

    // q_(i) = min_{j≥i} m·penalty·p_(j)/j, monotone from the top.
    let mut running_min = f64::INFINITY;
    for rank in (0..m).rev() {
        let idx = order[rank];
        let raw = m as f64 * penalty * p_values[idx] / (rank + 1) as f64;
        running_min = running_min.min(raw).min(1.0);
        q_values[idx] = running_min;
    }

    FdrOutcome {
        q_values,
        threshold,
        significant,
    }
}

/// Tail of the permutation test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tail {
    #[default]
    Right,
    TwoSided,
}

/// Permutation p-values of `observed` against a null distribution with one
/// row per permutation: `p = (1 + #{null as extreme}) / (n_perms + 1)`.
pub fn permutation_p_values(
    observed: &Array1<f64>,
    null_distribution: &Array2<f64>,
    tail: Tail,
) -> Array1<f64> {
    let n_perms = null_distribution.nrows();
    Array1::from_shape_fn(observed.len(), |v| {
        let obs = observed[v];
        if obs.is_nan() {
            return f64::NAN;
        }
        let column = null_distribution.index_axis(Axis(1), v);
        let exceed = column
            .iter()
            .filter(|&&null| match tail {
                Tail::Right => null >= obs,
                Tail::TwoSided => null.abs() >= obs.abs(),
            })
            .count();
        (1 + exceed) as f64 / (n_perms + 1) as f64
    })
}

/// Partial η² per voxel: between-site sum of squares over total sum of
/// squares.
pub fn partial_eta_squared(data: &Array2<f64>, site_labels: &[String]) -> Array1<f64> {
    let n = data.nrows();
    assert_eq!(
        site_labels.len(),
        n,
        "one site label per data row is required"
    );
    let mut sites: Vec<&String> = site_labels.iter().collect();
    sites.sort();
    sites.dedup();

    let grand_mean = data.mean_axis(Axis(0)).expect("data has at least one row");
    let n_voxels = data.ncols();
    let mut ss_between = Array1::<f64>::zeros(n_voxels);
    for site in &sites {
        let rows: Vec<usize> = site_labels
            .iter()
            .enumerate()
            .filter(|(_, label)| *label == *site)
            .map(|(i, _)| i)
            .collect();
        let n_g = rows.len() as f64;
        for v in 0..n_voxels {
            let mean_g = rows.iter().map(|&i| data[[i, v]]).sum::<f64>() / n_g;
            let delta = mean_g - grand_mean[v];
            ss_between[v] += n_g * delta * delta;
        }
    }

    let mut eta = Array1::<f64>::zeros(n_voxels);
    for v in 0..n_voxels {
        let ss_total: f64 = (0..n)
            .map(|i| {
                let delta = data[[i, v]] - grand_mean[v];
                delta * delta
            })
            .sum();
        eta[v] = if ss_total > 0.0 {
            (ss_between[v] / ss_total).clamp(0.0, 1.0)
        } else {
            0.0
        };
    }
    eta
}

/// Cohen's f from partial η²: √(η²/(1−η²)), saturating at η² = 1.
pub fn cohens_f(eta_squared: &Array1<f64>) -> Array1<f64> {
    eta_squared.mapv(|eta| {
        if eta >= 1.0 {
            f64::INFINITY
        } else {
            (eta / (1.0 - eta)).sqrt()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    #[test]
    fn all_tiny_p_values_rejected() {
        let p = array![0.001, 0.002, 0.003, 0.004, 0.005];
        let outcome = fdr_correction(&p, 0.05, FdrMethod::BenjaminiHochberg);
        assert!(outcome.significant.iter().all(|&s| s));
        assert!(outcome.threshold > 0.0);
    }

    #[test]
    fn all_large_p_values_kept() {
        let p = array![0.5, 0.6, 0.7, 0.8, 0.9];
        let outcome = fdr_correction(&p, 0.05, FdrMethod::BenjaminiHochberg);
        assert!(outcome.significant.iter().all(|&s| !s));
        assert_eq!(outcome.threshold, 0.0);
    }

    #[test]
    fn mixed_p_values_split_correctly() {
        let p = array![0.001, 0.01, 0.05, 0.1, 0.5];
        let outcome = fdr_correction(&p, 0.05, FdrMethod::BenjaminiHochberg);
        assert!(outcome.significant[0]);
        assert!(!outcome.significant[4]);
    }

    #[test]
    fn q_values_preserve_p_ordering() {
        let p = array![0.01, 0.05, 0.001, 0.1, 0.03];
        let outcome = fdr_correction(&p, 0.05, FdrMethod::BenjaminiHochberg);
        let mut p_order: Vec<usize> = (0..5).collect();
        p_order.sort_by(|&a, &b| p[a].partial_cmp(&p[b]).unwrap());
        let mut q_order: Vec<usize> = (0..5).collect();
        q_order.sort_by(|&a, &b| outcome.q_values[a].partial_cmp(&outcome.q_values[b]).unwrap());
        assert_eq!(p_order, q_order);
    }

    #[test]
    fn nan_p_propagates_to_nan_q() {
        let p = array![0.01, f64::NAN, 0.05, 0.1];
        let outcome = fdr_correction(&p, 0.05, FdrMethod::BenjaminiHochberg);
        assert!(outcome.q_values[1].is_nan());
        assert!(!outcome.significant[1]);
        assert!(!outcome.q_values[0].is_nan());
    }

    #[test]
    fn benjamini_yekutieli_is_more_conservative() {
        let p = array![0.001, 0.01, 0.02, 0.03, 0.04];
        let bh = fdr_correction(&p, 0.05, FdrMethod::BenjaminiHochberg);
        let by = fdr_correction(&p, 0.05, FdrMethod::BenjaminiYekutieli);
        let bh_count = bh.significant.iter().filter(|&&s| s).count();
        let by_count = by.significant.iter().filter(|&&s| s).count();
        assert!(by_count <= bh_count);
    }

    #[test]
    fn extreme_observation_has_small_p() {
        let mut rng = StdRng::seed_from_u64(42);
        let noise = Normal::new(0.0, 10.0).unwrap();
        let null = Array2::from_shape_fn((1000, 1), |_| noise.sample(&mut rng));
        let p = permutation_p_values(&array![100.0], &null, Tail::Right);
        assert!(p[0] < 0.01);
    }

    #[test]
    fn central_observation_has_middling_p() {
        let mut rng = StdRng::seed_from_u64(42);
        let noise = Normal::new(0.0, 1.0).unwrap();
        let null = Array2::from_shape_fn((1000, 1), |_| noise.sample(&mut rng));
        let p = permutation_p_values(&array![0.0], &null, Tail::Right);
        assert!(p[0] > 0.3 && p[0] < 0.7);
    }

    #[test]
    fn two_sided_tail_catches_both_extremes() {
        let mut rng = StdRng::seed_from_u64(42);
        let noise = Normal::new(0.0, 2.0).unwrap();
        let null = Array2::from_shape_fn((1000, 2), |_| noise.sample(&mut rng));
        let p = permutation_p_values(&array![-10.0, 10.0], &null, Tail::TwoSided);
        assert!(p[0] < 0.01);
        assert!(p[1] < 0.01);
    }

    #[test]
    fn smallest_attainable_p_is_one_over_n_plus_one() {
        let null = Array2::<f64>::zeros((100, 1));
        let p = permutation_p_values(&array![1000.0], &null, Tail::Right);
        assert_abs_diff_eq!(p[0], 1.0 / 101.0, epsilon = 1e-12);
    }

    fn two_site_labels(n_per_site: usize) -> Vec<String> {
        let mut labels = vec!["A".to_string(); n_per_site];
        labels.extend(vec!["B".to_string(); n_per_site]);
        labels
    }

    #[test]
    fn eta_squared_large_for_strong_effect() {
        let mut rng = StdRng::seed_from_u64(42);
        let noise = Normal::new(0.0, 1.0).unwrap();
        let data = Array2::from_shape_fn((100, 10), |(i, _)| {
            let shift = if i >= 50 { 5.0 } else { 0.0 };
            shift + noise.sample(&mut rng)
        });
        let eta = partial_eta_squared(&data, &two_site_labels(50));
        assert!(eta.mean().unwrap() > 0.5);
    }

    #[test]
    fn eta_squared_small_without_effect() {
        let mut rng = StdRng::seed_from_u64(42);
        let noise = Normal::new(0.0, 1.0).unwrap();
        let data = Array2::from_shape_fn((100, 10), |_| noise.sample(&mut rng));
        let eta = partial_eta_squared(&data, &two_site_labels(50));
        assert!(eta.mean().unwrap() < 0.1);
        assert!(eta.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn cohens_f_matches_closed_form() {
        let eta = array![0.04, 0.09, 0.16];
        let f = cohens_f(&eta);
        for (i, &e) in eta.iter().enumerate() {
            assert_abs_diff_eq!(f[i], (e / (1.0 - e)).sqrt(), epsilon = 1e-12);
        }
        // Cohen's conventional anchors.
        let f = cohens_f(&array![0.01, 0.06, 0.14, 0.25]);
        assert!(f[0] <= 0.11);
        assert!(f[1] > 0.20 && f[1] < 0.30);
        assert!(f[2] > 0.35 && f[2] < 0.45);
        assert!(f[3] > 0.5);
    }
}
