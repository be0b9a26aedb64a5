use anidl::download::{DownloadState, TransferEngine, TransferOptions};
use anidl::source::{ByteRange, HttpSource, Source, SourceError};
use futures_util::StreamExt;
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::watch;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Serves `body`, honouring a single `Range: bytes=a-b` request header.
struct RangeResponder {
    body: Vec<u8>,
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="))
            .and_then(|v| v.split_once('-'))
            .and_then(|(a, b)| Some((a.parse::<usize>().ok()?, b.parse::<usize>().ok()?)));

        match range {
            Some((start, end)) if start <= end && end < self.body.len() => {
                ResponseTemplate::new(206)
                    .insert_header(
                        "content-range",
                        format!("bytes {}-{}/{}", start, end, self.body.len()).as_str(),
                    )
                    .set_body_bytes(self.body[start..=end].to_vec())
            }
            Some(_) => ResponseTemplate::new(416),
            None => ResponseTemplate::new(200).set_body_bytes(self.body.clone()),
        }
    }
}

fn body() -> Vec<u8> {
    (0..10_000u32).map(|i| (i % 251) as u8).collect()
}

async fn collect(source: &HttpSource, url: &str, range: Option<ByteRange>) -> Vec<u8> {
    let mut stream = source.fetch(url, &BTreeMap::new(), range).await.unwrap();
    let mut data = Vec::new();
    while let Some(chunk) = stream.next().await {
        data.extend_from_slice(&chunk.unwrap());
    }
    data
}

#[tokio::test]
async fn test_probe_and_ranged_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/video.mp4"))
        .respond_with(RangeResponder { body: body() })
        .mount(&server)
        .await;

    let source = HttpSource::new(1, "Local", "anidl-test").unwrap();
    let url = format!("{}/video.mp4", server.uri());

    let remote = source.probe(&url, &BTreeMap::new()).await.unwrap();
    assert_eq!(remote.length, Some(10_000));
    assert!(remote.accepts_ranges);

    let part = collect(&source, &url, Some(ByteRange::new(100, 199))).await;
    assert_eq!(part, body()[100..200].to_vec());
    assert_eq!(collect(&source, &url, None).await, body());
}

#[tokio::test]
async fn test_server_without_ranges() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/plain.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body()))
        .mount(&server)
        .await;

    let source = HttpSource::new(1, "Local", "anidl-test").unwrap();
    let url = format!("{}/plain.mp4", server.uri());

    let remote = source.probe(&url, &BTreeMap::new()).await.unwrap();
    assert!(!remote.accepts_ranges);
    assert_eq!(remote.length, Some(10_000));

    let err = source
        .fetch(&url, &BTreeMap::new(), Some(ByteRange::new(0, 9)))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, SourceError::RangeNotHonoured { .. }));
}

#[tokio::test]
async fn test_status_errors_are_classified() {
    let server = MockServer::start().await;
    Mock::given(path("/missing.mp4"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(path("/busy.mp4"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let source = HttpSource::new(1, "Local", "anidl-test").unwrap();

    let missing = source
        .probe(&format!("{}/missing.mp4", server.uri()), &BTreeMap::new())
        .await
        .unwrap_err();
    assert!(!missing.is_transient());

    let busy = source
        .probe(&format!("{}/busy.mp4", server.uri()), &BTreeMap::new())
        .await
        .unwrap_err();
    assert!(busy.is_transient());
}

#[tokio::test]
async fn test_segmented_transfer_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/video.mp4"))
        .respond_with(RangeResponder { body: body() })
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let source: Arc<dyn Source> = Arc::new(HttpSource::new(1, "Local", "anidl-test").unwrap());
    let url = format!("{}/video.mp4", server.uri());
    let output = dir.path().join("video.mp4");

    let engine = TransferEngine::new(TransferOptions {
        parts_per_video: 4,
        min_part_size: 1000,
        ..TransferOptions::default()
    });
    let (_state, cancel) = watch::channel(DownloadState::Downloading);

    let mut transfer = engine
        .plan(
            source.as_ref(),
            &url,
            &BTreeMap::new(),
            &dir.path().join("parts"),
            &output,
            true,
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(transfer.parts.len(), 4);

    engine
        .run(Arc::clone(&source), &transfer, cancel.clone())
        .await
        .unwrap();
    assert_eq!(engine.merge(&mut transfer).await.unwrap(), 10_000);

    assert_eq!(fs::read(&output).unwrap(), body());
    assert!(!dir.path().join("parts").exists());

    // Each part was requested as its own range, plus the probe.
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 5);
    assert!(requests.iter().all(|r| r.headers.contains_key("range")));
}
