//! End-to-end inference checks on simulated surveillance data.

use approx::assert_abs_diff_eq;
use rand::rngs::StdRng;
use rand::SeedableRng;

use lineage_growth::dataset::{simulate, SimulateConfig};
use lineage_growth::guide::{Guide, GuideType};
use lineage_growth::init::{InitOverrides, InitializationPolicy};
use lineage_growth::model::{GrowthModel, ModelType};
use lineage_growth::svi::{fit_svi, FitConfig, InitData};
use lineage_growth::candle_nn::VarMap;

#[test]
fn every_model_variant_has_a_finite_joint_density() {
    let mut rng = StdRng::seed_from_u64(31);
    let ds = simulate(&SimulateConfig::default(), &mut rng).unwrap();
    for model_type in [
        "",
        "reparam",
        "biased",
        "reparam-biased",
        "reparam-biased-locally",
        "overdispersed",
        "reparam-overdispersed",
        "dirichlet",
    ] {
        let varmap = VarMap::new();
        let model =
            GrowthModel::new(&ds, ModelType::parse(model_type).unwrap(), &varmap).unwrap();
        let init = InitializationPolicy::new(&ds, InitOverrides::default()).unwrap();
        let guide =
            Guide::new(&model, GuideType::Composite, 10, &init, &varmap, &mut rng).unwrap();
        let draw = guide.draw(&mut rng).unwrap();
        let trace = model.eval(&draw.latents, true).unwrap();
        let lp = trace.log_joint.to_scalar::<f64>().unwrap();
        assert!(lp.is_finite(), "model '{model_type}' gave log_joint {lp}");
        for name in ["rate", "probs"] {
            assert!(
                trace.sites.contains_key(name),
                "model '{model_type}' missing derived site {name}"
            );
        }
    }
}

#[test]
fn recovers_a_strongly_growing_mutation() {
    // Strain 2 carries the only consequential mutation; its coefficient
    // should come out positive and clearly separated from zero.
    let mut rng = StdRng::seed_from_u64(20210319);
    let ds = simulate(
        &SimulateConfig {
            num_times: 12,
            num_places: 3,
            num_strains: 3,
            num_features: 2,
            counts_per_bin: 1000,
            rate_coef: Some(vec![0.0, 50.0]),
            features: Some(vec![
                vec![1.0, 0.0],
                vec![0.0, 0.0],
                vec![0.0, 1.0],
            ]),
        },
        &mut rng,
    )
    .unwrap();

    let fit = fit_svi(
        &ds,
        &FitConfig {
            guide_type: "normal".to_string(),
            num_steps: 2001,
            num_samples: 200,
            log_every: 500,
            ..FitConfig::default()
        },
    )
    .unwrap();

    let mean = fit.mean["rate_coef"].to_vec1::<f64>().unwrap();
    let std = fit.std["rate_coef"].to_vec1::<f64>().unwrap();
    assert!(mean[1] > 0.0, "rate_coef[1] mean = {}", mean[1]);
    assert!(
        mean[1] / std[1] > 2.0,
        "significance = {}",
        mean[1] / std[1]
    );
    assert!(
        mean[1] > mean[0],
        "growing mutation should outrank the neutral one"
    );

    // Loss settles well below its starting value.
    let first = fit.losses[0];
    let last = fit.losses[fit.losses.len() - 1];
    assert!(last < first, "loss went from {first} to {last}");
}

#[test]
fn warm_start_seeds_a_full_guide_fit() {
    let mut rng = StdRng::seed_from_u64(8);
    let ds = simulate(
        &SimulateConfig {
            num_times: 6,
            num_places: 2,
            num_strains: 3,
            num_features: 2,
            counts_per_bin: 200,
            ..SimulateConfig::default()
        },
        &mut rng,
    )
    .unwrap();

    let fit = fit_svi(
        &ds,
        &FitConfig {
            guide_type: "full".to_string(),
            init_data: InitData::WarmStart(String::new()),
            num_steps: 50,
            num_samples: 4,
            log_every: 1000,
            ..FitConfig::default()
        },
    )
    .unwrap();
    assert_eq!(fit.losses.len(), 50);
    assert!(fit.losses.iter().all(|l| l.is_finite()));
    assert!(fit.median.contains_key("probs"));
}

#[test]
fn divergence_heuristic_passes_on_a_healthy_fit() {
    let mut rng = StdRng::seed_from_u64(12);
    let ds = simulate(&SimulateConfig::default(), &mut rng).unwrap();
    let fit = fit_svi(
        &ds,
        &FitConfig {
            guide_type: "map".to_string(),
            num_steps: 120,
            num_samples: 1,
            log_every: 1000,
            check_loss: true,
            ..FitConfig::default()
        },
    )
    .unwrap();
    assert_eq!(fit.losses.len(), 120);
}

#[test]
fn posterior_probabilities_are_normalized() {
    let mut rng = StdRng::seed_from_u64(21);
    let ds = simulate(&SimulateConfig::default(), &mut rng).unwrap();
    let fit = fit_svi(
        &ds,
        &FitConfig {
            guide_type: "map".to_string(),
            num_steps: 30,
            num_samples: 1,
            log_every: 1000,
            ..FitConfig::default()
        },
    )
    .unwrap();
    let probs = fit.median["probs"].to_vec3::<f64>().unwrap();
    for plane in probs {
        for row in plane {
            let total: f64 = row.iter().sum();
            assert_abs_diff_eq!(total, 1.0, epsilon = 1e-9);
            assert!(row.iter().all(|p| *p >= 0.0));
        }
    }
}
