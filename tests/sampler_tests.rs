use citefold::config::{LoaderConfig, SamplerConfig, SamplingMode};
use citefold::ingestion::Pipeline;
use citefold::sampler::{SamplerError, WeightedSampler};
use citefold::store::{DocumentStore, SledStore, Stratum, StratumLevel};
use citefold::testing::write_dump_file;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

#[tokio::test]
async fn test_small_and_huge_prefix_are_drawn_equally_often() {
    let store = Arc::new(SledStore::temporary().unwrap());
    store.put_stratum(Stratum::prefix("10.1000", 1)).await.unwrap();
    store
        .put_stratum(Stratum::prefix("10.5281", 1_000_000))
        .await
        .unwrap();
    let sampler = WeightedSampler::new(
        store,
        SamplerConfig {
            seed: Some(2024),
            mode: SamplingMode::Ordinal,
            ..Default::default()
        },
    );

    let draws = 4000;
    let mut picks: HashMap<String, usize> = HashMap::new();
    for _ in 0..draws {
        let stratum = sampler.pick_stratum(&StratumLevel::Prefix).await.unwrap();
        *picks.entry(stratum.prefix).or_default() += 1;
    }
    for prefix in ["10.1000", "10.5281"] {
        let share = picks[prefix] as f64 / draws as f64;
        assert!((0.45..=0.55).contains(&share), "{}: {}", prefix, share);
    }
}

#[tokio::test]
async fn test_loaded_population_is_sampled_by_year() {
    let dir = tempfile::tempdir().unwrap();
    let documents: Vec<_> = [
        ("10.1/a", 2001, "Dataset"),
        ("10.1/b", 2002, "Dataset"),
        ("10.1/c", 2002, "Text"),
        ("10.2/a", 2002, "Dataset"),
    ]
    .iter()
    .map(|(id, year, kind)| {
        json!({
            "id": id,
            "attributes": {
                "updated": "2020-01-01T00:00:00Z",
                "publicationYear": year.to_string(),
                "types": {"resourceTypeGeneral": kind}
            }
        })
        .to_string()
    })
    .collect();
    write_dump_file(dir.path(), "dump.ndjson", &documents).unwrap();

    let store = Arc::new(SledStore::temporary().unwrap());
    Pipeline::new(LoaderConfig::new(dir.path()), store.clone())
        .unwrap()
        .run()
        .await
        .unwrap();

    let sampler = WeightedSampler::new(
        store.clone(),
        SamplerConfig {
            stratify_by_year: true,
            seed: Some(5),
            ..Default::default()
        },
    );
    let strata = store.refresh_strata(sampler.filter()).await.unwrap();
    assert_eq!(strata.documents_scanned, 4);
    assert_eq!(strata.documents_counted, 3);
    assert_eq!(strata.prefix_strata, 2);
    assert_eq!(strata.year_strata, 3);

    let mut seen: HashMap<String, usize> = HashMap::new();
    for _ in 0..300 {
        *seen.entry(sampler.sample().await.unwrap()).or_default() += 1;
    }
    assert!(!seen.contains_key("10.1/c"));
    assert_eq!(seen.len(), 3);
}

#[tokio::test]
async fn test_no_candidate_is_never_a_default_identifier() {
    let store = Arc::new(SledStore::temporary().unwrap());
    store.put_stratum(Stratum::prefix("10.3", 0)).await.unwrap();
    let sampler = WeightedSampler::new(store, SamplerConfig::default());
    match sampler.sample().await {
        Err(SamplerError::NoCandidate(_)) => {}
        other => panic!("expected no candidate, got {:?}", other),
    }
}
