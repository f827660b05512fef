//! End-to-end harmonization scenarios on synthetic data.

use std::collections::BTreeMap;

use approx::assert_abs_diff_eq;
use ndarray::{Array3, Array4};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use tempfile::TempDir;

use rish_harmonize::covariates;
use rish_harmonize::harmonize::{self, Harmonizer};
use rish_harmonize::image_io;
use rish_harmonize::model::{self, HarmonizationModel};
use rish_harmonize::rish::{self, RishFeatures};
use rish_harmonize::rish_glm;
use rish_harmonize::scale::{ScaleMapOptions, ScaleMode};
use rish_harmonize::volume::{Geometry, ShImage, Volume};

const GRID: (usize, usize, usize) = (5, 5, 5);

fn flat_rish(levels: &[(usize, f64)], rng: &mut StdRng, sigma: f64) -> RishFeatures {
    let noise = Normal::new(0.0, sigma).unwrap();
    let mut rish = RishFeatures::new();
    for &(l, value) in levels {
        rish.insert(
            l,
            Volume::new(
                Array3::from_shape_fn(GRID, |_| value + noise.sample(rng)),
                Geometry::unit(),
            ),
        );
    }
    rish
}

fn raw_options(mode: ScaleMode) -> ScaleMapOptions {
    ScaleMapOptions {
        smoothing_fwhm: 0.0,
        mode,
        ..ScaleMapOptions::default()
    }
}

fn median(values: &mut Vec<f64>) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    values[values.len() / 2]
}

/// Two scanners whose RISH energies differ by a factor of two: the fitted
/// scale map recovers the ratio almost exactly.
#[test]
fn perfect_scanner_ratio_recovery() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut subjects = Vec::new();
    let mut labels = Vec::new();
    for _ in 0..20 {
        subjects.push(flat_rish(&[(0, 1.0)], &mut rng, 0.02));
        labels.push("reference".to_string());
    }
    for _ in 0..20 {
        subjects.push(flat_rish(&[(0, 0.5)], &mut rng, 0.02));
        labels.push("target".to_string());
    }

    let fitted = rish_glm::fit_rish_glm(&subjects, &labels, None, None).unwrap();
    let maps = fitted
        .scale_maps("target", "reference", &raw_options(ScaleMode::Ratio))
        .unwrap();

    let mut values: Vec<f64> = maps[&0].data.iter().copied().collect();
    let med = median(&mut values);
    assert!((med - 2.0).abs() < 0.1, "median scale {med}");
}

/// An age confound that tracks site: modeling age recovers the true
/// scanner ratio, ignoring it visibly does not.
#[test]
fn confound_removal_with_age_covariate() {
    let mut rng = StdRng::seed_from_u64(42);
    let age_effect = 0.01;
    let young = Normal::new(30.0, 5.0).unwrap();
    let old = Normal::new(50.0, 5.0).unwrap();

    let mut subjects = Vec::new();
    let mut labels = Vec::new();
    let mut ages = Vec::new();
    for _ in 0..15 {
        let age: f64 = young.sample(&mut rng);
        subjects.push(flat_rish(&[(0, 1.0 + age_effect * age)], &mut rng, 0.02));
        labels.push("reference".to_string());
        ages.push(age);
    }
    for _ in 0..15 {
        let age: f64 = old.sample(&mut rng);
        subjects.push(flat_rish(&[(0, 0.8 + age_effect * age)], &mut rng, 0.02));
        labels.push("target".to_string());
        ages.push(age);
    }
    let pop_mean_age = ages.iter().sum::<f64>() / ages.len() as f64;
    let expected_scale =
        (1.0 + age_effect * pop_mean_age) / (0.8 + age_effect * pop_mean_age);

    let mut covs = BTreeMap::new();
    covs.insert("age".to_string(), ages);

    let with_age = rish_glm::fit_rish_glm(&subjects, &labels, Some(&covs), None).unwrap();
    let without_age = rish_glm::fit_rish_glm(&subjects, &labels, None, None).unwrap();

    let mean_scale = |model: &rish_glm::RishGlmModel| {
        let maps = model
            .scale_maps("target", "reference", &raw_options(ScaleMode::Ratio))
            .unwrap();
        maps[&0].data.iter().sum::<f64>() / maps[&0].data.len() as f64
    };

    let adjusted = mean_scale(&with_age);
    let confounded = mean_scale(&without_age);
    assert!((adjusted - expected_scale).abs() < 0.05, "{adjusted} vs {expected_scale}");
    assert!(
        (confounded - expected_scale).abs() >= 0.05,
        "unadjusted scale {confounded} should miss {expected_scale}"
    );
}

/// With balanced sites and no covariate imbalance the two estimators are
/// the same computation in different clothes.
#[test]
fn two_stage_and_joint_estimators_agree() {
    let mut rng = StdRng::seed_from_u64(7);
    let n_per_site = 20;
    let mut reference_rish = Vec::new();
    let mut all_rish = Vec::new();
    let mut labels = Vec::new();
    for _ in 0..n_per_site {
        let rish = flat_rish(&[(0, 1.2), (2, 0.9)], &mut rng, 0.03);
        reference_rish.push(rish.clone());
        all_rish.push(rish);
        labels.push("reference".to_string());
    }
    let mut target_rish_subjects = Vec::new();
    for _ in 0..n_per_site {
        let rish = flat_rish(&[(0, 0.7), (2, 0.6)], &mut rng, 0.03);
        target_rish_subjects.push(rish.clone());
        all_rish.push(rish);
        labels.push("target".to_string());
    }

    // Joint estimator.
    let joint = rish_glm::fit_rish_glm(&all_rish, &labels, None, None).unwrap();
    let joint_maps = joint
        .scale_maps("target", "reference", &raw_options(ScaleMode::Ratio))
        .unwrap();

    // Two-stage estimator: template = reference mean, target = target mean.
    let orders = [0usize, 2];
    let mut template = RishFeatures::new();
    let mut target_mean = RishFeatures::new();
    for &l in &orders {
        let ref_maps: Vec<Volume> =
            reference_rish.iter().map(|r| r[&l].clone()).collect();
        let tar_maps: Vec<Volume> =
            target_rish_subjects.iter().map(|r| r[&l].clone()).collect();
        template.insert(l, Volume::mean_of(&ref_maps).unwrap());
        target_mean.insert(l, Volume::mean_of(&tar_maps).unwrap());
    }
    let two_stage_maps = rish_harmonize::scale::compute_scale_maps(
        &template,
        &target_mean,
        None,
        &raw_options(ScaleMode::Ratio),
    )
    .unwrap();

    for &l in &orders {
        for (a, b) in joint_maps[&l].data.iter().zip(two_stage_maps[&l].data.iter()) {
            let rel = (a - b).abs() / b.abs();
            assert!(rel < 1e-3, "order {l}: joint {a} vs two-stage {b}");
        }
    }
}

/// Full pipeline through the filesystem: synthetic SH images on disk,
/// template build, harmonization, and energy equalization at the end.
#[test]
fn harmonizer_round_trip_through_nifti() {
    let dir = TempDir::new().unwrap();
    let amplitude = |scale: f64| {
        ShImage::new(
            Array4::from_shape_fn((4, 4, 4, 6), |(_, _, _, v)| {
                if v == 0 { scale } else { 0.5 * scale }
            }),
            Geometry::unit(),
        )
    };

    // Reference subjects at unit amplitude, written and re-read to prove
    // the pipeline survives the f32 storage round trip.
    let mut reference = Vec::new();
    for i in 0..3 {
        let path = dir.path().join(format!("ref_{i}.nii.gz"));
        image_io::write_sh_image(&path, &amplitude(1.0)).unwrap();
        reference.push(image_io::read_sh_image(&path).unwrap());
    }

    let mut harmonizer = Harmonizer::new(2, raw_options(ScaleMode::SqrtRatio)).unwrap();
    harmonizer.create_template(&reference, None, None).unwrap();

    let target = amplitude(0.6);
    let result = harmonizer.harmonize(&target, None, None).unwrap();

    // Harmonized coefficients land on the reference amplitude.
    assert_abs_diff_eq!(result.harmonized_sh.data[[2, 2, 2, 0]], 1.0, epsilon = 1e-3);
    assert_abs_diff_eq!(result.harmonized_sh.data[[2, 2, 2, 3]], 0.5, epsilon = 1e-3);

    // And their RISH energy matches the template's.
    let harmonized_rish =
        rish::extract_rish(&result.harmonized_sh, None, None).unwrap();
    let template = harmonizer.template().unwrap();
    for l in [0usize, 2] {
        assert_abs_diff_eq!(
            harmonized_rish[&l].data[[1, 1, 1]],
            template[&l].data[[1, 1, 1]],
            epsilon = 1e-2
        );
    }
}

/// Identity rescale: all-ones scale maps change nothing, bit for bit.
#[test]
fn unit_scale_maps_are_the_identity() {
    let mut rng = StdRng::seed_from_u64(3);
    let noise = Normal::new(0.0, 1.0).unwrap();
    let image = ShImage::new(
        Array4::from_shape_fn((3, 3, 3, 15), |_| noise.sample(&mut rng)),
        Geometry::unit(),
    );
    let mut maps = BTreeMap::new();
    for l in [0usize, 2, 4] {
        maps.insert(
            l,
            Volume::new(Array3::from_elem((3, 3, 3), 1.0), Geometry::unit()),
        );
    }
    let rescaled = harmonize::rescale_sh(&image, &maps, None).unwrap();
    assert_eq!(rescaled.data, image.data);
    assert_eq!(rescaled.n_volumes(), image.n_volumes());
}

/// Fit → save → load → apply: metadata survives identically and the β
/// paths resolve to real files.
#[test]
fn model_persistence_round_trip() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut subjects = Vec::new();
    let mut labels = Vec::new();
    let mut ages = Vec::new();
    for i in 0..10 {
        subjects.push(flat_rish(&[(0, 1.0), (2, 0.8)], &mut rng, 0.02));
        labels.push("reference".to_string());
        ages.push(25.0 + i as f64);
    }
    for i in 0..10 {
        subjects.push(flat_rish(&[(0, 0.5), (2, 0.4)], &mut rng, 0.02));
        labels.push("target".to_string());
        ages.push(30.0 + i as f64);
    }
    let mut covs = BTreeMap::new();
    covs.insert("age".to_string(), ages);

    let fitted = rish_glm::fit_rish_glm(&subjects, &labels, Some(&covs), None).unwrap();
    let original_means = fitted.cov_means.clone();
    let original_stds = fitted.cov_stds.clone();
    let original_columns = fitted.design_columns.clone();

    let dir = TempDir::new().unwrap();
    let json_path = dir.path().join("model").join("model.json");
    model::save_model(
        &HarmonizationModel::RishGlm {
            model: fitted,
            reference_site: "reference".to_string(),
        },
        &json_path,
    )
    .unwrap();

    let loaded = model::load_model(&json_path).unwrap();
    let model = match &loaded {
        HarmonizationModel::RishGlm { model, reference_site } => {
            assert_eq!(reference_site, "reference");
            model
        }
        _ => panic!("wrong model kind after load"),
    };
    assert_eq!(model.site_names, vec!["reference", "target"]);
    assert_eq!(model.orders, vec![0, 2]);
    assert_eq!(model.cov_means, original_means);
    assert_eq!(model.cov_stds, original_stds);
    assert_eq!(model.design_columns, original_columns);
    assert_eq!(model.n_subjects, 20);

    // β paths in the JSON exist on disk.
    let text = std::fs::read_to_string(&json_path).unwrap();
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    for (_, rel) in value["beta_paths"].as_object().unwrap() {
        assert!(json_path
            .parent()
            .unwrap()
            .join(rel.as_str().unwrap())
            .exists());
    }

    // The loaded model still produces the right scale maps.
    let maps = loaded
        .scale_maps(None, Some("target"), None, &raw_options(ScaleMode::Ratio))
        .unwrap();
    let mean = maps[&0].data.iter().sum::<f64>() / maps[&0].data.len() as f64;
    assert!((mean - 2.0).abs() < 0.1, "scale after reload {mean}");
}

/// Two-stage counterpart of the persistence scenario.
#[test]
fn two_stage_model_persistence() {
    let mut rng = StdRng::seed_from_u64(11);
    let subjects: Vec<RishFeatures> = (0..8)
        .map(|i| flat_rish(&[(0, 1.0 + 0.02 * i as f64)], &mut rng, 0.01))
        .collect();
    let mut covs = BTreeMap::new();
    covs.insert(
        "age".to_string(),
        (0..8).map(|i| 30.0 + i as f64).collect::<Vec<f64>>(),
    );
    let fitted = covariates::fit_covariate_model(&subjects, &covs, None).unwrap();

    let dir = TempDir::new().unwrap();
    let json_path = dir.path().join("covariate_model.json");
    model::save_model(&HarmonizationModel::TwoStage(fitted.clone()), &json_path).unwrap();
    let loaded = model::load_model(&json_path).unwrap();
    match loaded {
        HarmonizationModel::TwoStage(model) => {
            assert_eq!(model.covariate_names, fitted.covariate_names);
            assert_eq!(model.orders, fitted.orders);
            assert_eq!(model.cov_means, fitted.cov_means);
            assert_eq!(model.cov_stds, fitted.cov_stds);
            assert_eq!(model.n_subjects, fitted.n_subjects);
        }
        _ => panic!("wrong model kind after load"),
    }
}
