// tests/client_http.rs
use std::time::Duration;

use feed_digest::ingest::{FeedClient, FetchError, FetchResult, HttpFeedClient, Validator};
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const RSS: &str = include_str!("fixtures/rss_sample.xml");
const TRUNCATED: &str = include_str!("fixtures/truncated_rss.xml");

fn client() -> HttpFeedClient {
    HttpFeedClient::new("feed-digest-test/0.1", Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn success_returns_items_and_validator() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/rss+xml")
                .insert_header("etag", "\"abc\"")
                .insert_header("last-modified", "Tue, 20 May 2025 09:00:00 GMT")
                .set_body_string(RSS),
        )
        .mount(&server)
        .await;

    let url = format!("{}/feed", server.uri());
    match client().fetch(&url, None).await {
        FetchResult::Success { items, validator } => {
            assert_eq!(items.len(), 3);
            assert!(items.iter().all(|i| i.source_id == url));
            let v = validator.expect("validator");
            assert_eq!(v.etag.as_deref(), Some("\"abc\""));
            assert_eq!(
                v.last_modified.as_deref(),
                Some("Tue, 20 May 2025 09:00:00 GMT")
            );
        }
        other => panic!("expected success, got {other:?}"),
    }
}

#[tokio::test]
async fn validator_is_sent_and_304_is_not_modified() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .and(header("if-none-match", "\"abc\""))
        .and(header_exists("if-modified-since"))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&server)
        .await;

    let v = Validator {
        etag: Some("\"abc\"".into()),
        last_modified: Some("Tue, 20 May 2025 09:00:00 GMT".into()),
    };
    let url = format!("{}/feed", server.uri());
    assert!(matches!(
        client().fetch(&url, Some(&v)).await,
        FetchResult::NotModified
    ));
}

#[tokio::test]
async fn server_error_is_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let url = format!("{}/feed", server.uri());
    assert!(matches!(
        client().fetch(&url, None).await,
        FetchResult::Failure(FetchError::Status(503))
    ));
}

#[tokio::test]
async fn truncated_feed_keeps_complete_entries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(TRUNCATED))
        .mount(&server)
        .await;

    let url = format!("{}/feed", server.uri());
    match client().fetch(&url, None).await {
        FetchResult::Success { items, validator } => {
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].title, "Complete entry");
            assert!(validator.is_none());
        }
        other => panic!("expected partial success, got {other:?}"),
    }
}

#[tokio::test]
async fn html_page_is_parse_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("<html><body>Moved!</body></html>"),
        )
        .mount(&server)
        .await;

    let url = format!("{}/feed", server.uri());
    assert!(matches!(
        client().fetch(&url, None).await,
        FetchResult::Failure(FetchError::Parse(_))
    ));
}

#[tokio::test]
async fn connection_refused_is_transport_failure() {
    // Bind then drop to get a port with nothing listening.
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };
    let url = format!("http://127.0.0.1:{port}/feed");
    assert!(matches!(
        client().fetch(&url, None).await,
        FetchResult::Failure(FetchError::Transport(_))
    ));
}
