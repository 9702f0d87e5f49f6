//! Dataset subsetting and reweighting behavior.

use approx::assert_abs_diff_eq;
use rand::rngs::StdRng;
use rand::SeedableRng;

use lineage_growth::dataset::{simulate, SimulateConfig, SubsetQuery};

fn example() -> lineage_growth::Dataset {
    let mut rng = StdRng::seed_from_u64(77);
    simulate(
        &SimulateConfig {
            num_times: 8,
            num_places: 5,
            num_strains: 6,
            num_features: 3,
            counts_per_bin: 100,
            rate_coef: Some(vec![10.0, -10.0, 5.0]),
            features: Some(vec![
                vec![1.0, 0.0, 0.0],
                vec![0.0, 1.0, 0.0],
                vec![0.0, 0.0, 1.0],
                vec![1.0, 1.0, 0.0],
                vec![0.0, 1.0, 1.0],
                vec![0.0, 0.0, 0.0],
            ]),
        },
        &mut rng,
    )
    .unwrap()
}

#[test]
fn location_queries_filter_and_sort_by_name() {
    let ds = example();
    let query = SubsetQuery {
        location_queries: Some(vec!["place/1".to_string(), "place/3".to_string()]),
        max_strains: None,
    };
    let sub = ds.subset(&query).unwrap();
    let (t, p, s, _f) = sub.dims();
    assert_eq!((t, p, s), (8, 2, 6));
    let names: Vec<&str> = sub.locations().iter().map(|s| s.as_ref()).collect();
    assert_eq!(names, vec!["place/1", "place/3"]);
    assert_eq!(sub.location_id("place/3"), Some(1));
}

#[test]
fn max_strains_keeps_the_most_counted() {
    let ds = example();
    let query = SubsetQuery {
        location_queries: None,
        max_strains: Some(3),
    };
    let sub = ds.subset(&query).unwrap();
    let (_t, _p, s, _f) = sub.dims();
    assert_eq!(s, 3);

    // Every kept strain outcounts every dropped one.
    let kept_total = sub
        .weekly_strains()
        .sum_all()
        .unwrap()
        .to_scalar::<f64>()
        .unwrap();
    let full_total = ds
        .weekly_strains()
        .sum_all()
        .unwrap()
        .to_scalar::<f64>()
        .unwrap();
    assert!(kept_total > full_total / 2.0);
}

#[test]
fn subsetting_is_idempotent() {
    let ds = example();
    let query = SubsetQuery {
        location_queries: Some(vec!["place/".to_string()]),
        max_strains: Some(4),
    };
    let once = ds.subset(&query).unwrap();
    let twice = once.subset(&query).unwrap();
    assert_eq!(once.dims(), twice.dims());
    assert_eq!(once.lineages(), twice.lineages());
    assert_eq!(once.mutations(), twice.mutations());
    assert_eq!(
        once.weekly_strains().to_vec3::<f64>().unwrap(),
        twice.weekly_strains().to_vec3::<f64>().unwrap()
    );
}

#[test]
fn reweighting_scales_whole_places() {
    let ds = example();
    let weights = vec![0.0, 2.0, 1.0, 1.0, 1.0];
    let rw = ds.with_reweighted_counts(&weights).unwrap();
    let orig = ds.weekly_strains().to_vec3::<f64>().unwrap();
    let got = rw.weekly_strains().to_vec3::<f64>().unwrap();
    for t in 0..orig.len() {
        for p in 0..orig[t].len() {
            for s in 0..orig[t][p].len() {
                assert_abs_diff_eq!(got[t][p][s], orig[t][p][s] * weights[p], epsilon = 1e-12);
            }
        }
    }
    assert!(ds.with_reweighted_counts(&[1.0, 1.0]).is_err());
}
