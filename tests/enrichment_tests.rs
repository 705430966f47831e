use citefold::config::{EnrichmentConfig, SamplerConfig};
use citefold::enrichment::{EnrichmentClient, EnrichmentError, EnrichmentRunner};
use citefold::sampler::WeightedSampler;
use citefold::store::{DocumentStore, PopulationFilter, SledStore};
use citefold::testing::dataset_intent;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Serve `status` with `body` to every connection; each request is sent back
/// through the returned channel, lower-cased
async fn serve(status: &'static str, body: &'static str) -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/fuji/api/v1/evaluate", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let request = read_request(&mut socket).await;
                let _ = tx.send(request);
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    (url, rx)
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&buffer).to_lowercase();
        if let Some(end) = text.find("\r\n\r\n") {
            let length = text[..end]
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buffer.len() >= end + 4 + length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buffer).to_lowercase()
}

fn config_for(url: String) -> EnrichmentConfig {
    EnrichmentConfig {
        url,
        concurrency: 2,
        timeout_secs: 5,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_client_posts_identifier_with_basic_auth() {
    let (url, mut requests) = serve("200 OK", r#"{"summary":{"score_percent":{"FAIR":50.0}}}"#).await;
    let client = EnrichmentClient::new(config_for(url)).unwrap();

    let result = client.evaluate("10.5281/zenodo.1", true).await.unwrap();
    assert_eq!(
        result.pointer("/summary/score_percent/FAIR").and_then(Value::as_f64),
        Some(50.0)
    );

    let request = requests.recv().await.unwrap();
    assert!(request.starts_with("post /fuji/api/v1/evaluate"));
    // fuji:fuji
    assert!(request.contains("authorization: basic znvqatpmdwpp"));
    assert!(request.contains("content-type: application/json"));
    assert!(request.contains("accept: application/json"));
    assert!(request.contains(r#""object_identifier":"https://doi.org/10.5281/zenodo.1""#));
    assert!(request.contains(r#""test_debug":true"#));
    assert!(request.contains(r#""use_datacite":true"#));
}

#[tokio::test]
async fn test_client_rejects_non_200() {
    let (url, _requests) = serve("503 Service Unavailable", r#"{"detail":"busy"}"#).await;
    let client = EnrichmentClient::new(config_for(url)).unwrap();
    let err = client.evaluate("10.1/a", false).await.unwrap_err();
    assert!(matches!(err, EnrichmentError::Status { status: 503, .. }));
}

#[tokio::test]
async fn test_client_rejects_non_object_body() {
    let (url, _requests) = serve("200 OK", "[1,2,3]").await;
    let client = EnrichmentClient::new(config_for(url)).unwrap();
    let err = client.evaluate("10.1/a", false).await.unwrap_err();
    assert!(matches!(err, EnrichmentError::InvalidResponse(_)));
}

#[tokio::test]
async fn test_runner_stores_every_variant_once() {
    let (url, _requests) = serve("200 OK", r#"{"summary":{}}"#).await;
    let store = Arc::new(SledStore::temporary().unwrap());
    store
        .bulk_upsert(vec![dataset_intent("10.7/only", "2020-01-01")])
        .await
        .unwrap();
    store
        .refresh_strata(&PopulationFilter::resource_type("Dataset"))
        .await
        .unwrap();

    let config = config_for(url);
    let sampler = Arc::new(WeightedSampler::new(
        store.clone(),
        SamplerConfig {
            seed: Some(11),
            ..Default::default()
        },
    ));
    let client = Arc::new(EnrichmentClient::new(config.clone()).unwrap());
    let runner = EnrichmentRunner::new(sampler, store.clone(), client, &config).unwrap();

    let stats = runner.run(Some(4)).await;
    assert_eq!(stats.draws(), 4);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.no_candidate, 0);
    assert!(stats.evaluated >= 1);
    assert_eq!(stats.evaluated + stats.skipped, 4);
    assert!(runner.permits().high_water() <= 2);

    for variant in [true, false] {
        let stored = store.get_enrichment("10.7/only", variant).await.unwrap().unwrap();
        assert_eq!(stored["_id"], "10.7/only");
        assert_eq!(stored["use_datacite"], variant);
    }
}

#[tokio::test]
async fn test_runner_counts_failed_calls() {
    let (url, _requests) = serve("500 Internal Server Error", "{}").await;
    let store = Arc::new(SledStore::temporary().unwrap());
    store
        .bulk_upsert(vec![dataset_intent("10.7/a", "2020-01-01")])
        .await
        .unwrap();
    store
        .refresh_strata(&PopulationFilter::resource_type("Dataset"))
        .await
        .unwrap();

    let config = config_for(url);
    let sampler = Arc::new(WeightedSampler::new(store.clone(), SamplerConfig::default()));
    let client = Arc::new(EnrichmentClient::new(config.clone()).unwrap());
    let runner = EnrichmentRunner::new(sampler, store.clone(), client, &config).unwrap();

    let stats = runner.run(Some(3)).await;
    assert_eq!(stats.failed, 3);
    assert!(!store.has_enrichment("10.7/a").await.unwrap());
}
