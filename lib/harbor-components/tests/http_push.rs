use std::{sync::Arc, time::Duration};

use axum::{body::Body, Router};
use harbor_components::sources::{HttpPushConfiguration, HttpPushSource};
use harbor_config::ConfigurationLoader;
use harbor_core::{
    data_model::FieldValue,
    ingest::{CompletionSignal, IngestHandle},
    tracking::{self, TrackedGroup},
};
use http::{header, Request, StatusCode};
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tower::ServiceExt as _;

struct Server {
    router: Router,
    handle: IngestHandle<CompletionSignal>,
    groups: mpsc::Receiver<TrackedGroup>,
}

impl Server {
    fn from_toml(contents: &str) -> Self {
        let config = ConfigurationLoader::default().from_toml_str(contents).into_generic();
        let push = HttpPushConfiguration::from_configuration(&config).unwrap();

        let (tracker, groups, outcomes) = tracking::channel(16);
        let source = HttpPushSource::new(&push, Arc::new(tracker), outcomes).unwrap();
        let (router, handle) = source.into_router();

        Self { router, handle, groups }
    }

    fn send(&self, request: Request<Body>) -> JoinHandle<StatusCode> {
        let router = self.router.clone();
        tokio::spawn(async move { router.oneshot(request).await.unwrap().status() })
    }

    async fn next_group(&mut self) -> TrackedGroup {
        timeout(Duration::from_secs(5), self.groups.recv())
            .await
            .expect("timed out waiting for a metric group")
            .expect("group channel closed")
    }

    async fn assert_no_group(&mut self) {
        assert!(timeout(Duration::from_millis(100), self.groups.recv()).await.is_err());
    }
}

fn write(body: &'static str) -> Request<Body> {
    Request::post("/write").body(Body::from(body)).unwrap()
}

#[tokio::test]
async fn delivered_payload_gets_no_content() {
    let mut server = Server::from_toml("");

    let response = server.send(write("cpu,host=a value=1\nmem used=2i"));
    let tracked = server.next_group().await;
    assert_eq!(tracked.group().len(), 2);
    assert!(!response.is_finished());

    let (_, ticket) = tracked.into_parts();
    ticket.delivered();
    assert_eq!(response.await.unwrap(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn failed_delivery_asks_sender_to_retry() {
    let mut server = Server::from_toml("");

    let response = server.send(write("cpu value=1"));
    let (_, ticket) = server.next_group().await.into_parts();
    ticket.failed();

    assert_eq!(response.await.unwrap(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn malformed_and_empty_payloads_are_not_tracked() {
    let mut server = Server::from_toml("");

    assert_eq!(server.send(write("cpu")).await.unwrap(), StatusCode::BAD_REQUEST);
    assert_eq!(server.send(write("# only a comment\n")).await.unwrap(), StatusCode::NO_CONTENT);
    server.assert_no_group().await;
    assert_eq!(server.handle.in_flight(), 0);
}

#[tokio::test]
async fn oversized_payload_is_rejected() {
    let mut server = Server::from_toml("[http_push]\nmax_message_len = 16");

    let body = "cpu,host=a-rather-long-host-name value=1";
    assert_eq!(server.send(write(body)).await.unwrap(), StatusCode::PAYLOAD_TOO_LARGE);
    server.assert_no_group().await;
}

#[tokio::test]
async fn token_is_required_when_configured() {
    let mut server = Server::from_toml("[http_push]\ntoken = \"s3cret\"");

    assert_eq!(server.send(write("cpu value=1")).await.unwrap(), StatusCode::UNAUTHORIZED);

    let wrong = Request::post("/write")
        .header(header::AUTHORIZATION, "Token nope")
        .body(Body::from("cpu value=1"))
        .unwrap();
    assert_eq!(server.send(wrong).await.unwrap(), StatusCode::UNAUTHORIZED);
    server.assert_no_group().await;

    let right = Request::post("/write")
        .header(header::AUTHORIZATION, "Bearer s3cret")
        .body(Body::from("cpu value=1"))
        .unwrap();
    let response = server.send(right);
    let (_, ticket) = server.next_group().await.into_parts();
    ticket.delivered();
    assert_eq!(response.await.unwrap(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn content_encoding_and_headers_shape_metrics() {
    let mut server = Server::from_toml(
        r#"
        [http_push]
        attributes_as_tags = ["x-region"]
        "#,
    );

    let request = Request::post("/write")
        .header(header::CONTENT_ENCODING, "base64")
        .header("x-region", "eu")
        .body(Body::from("Y3B1LGhvc3Q9YSB2YWx1ZT0x"))
        .unwrap();
    let response = server.send(request);

    let (group, ticket) = server.next_group().await.into_parts();
    let metric = group.iter().next().unwrap();
    assert_eq!(metric.name(), "cpu");
    assert_eq!(metric.tags().get("host").map(String::as_str), Some("a"));
    assert_eq!(metric.tags().get("x-region").map(String::as_str), Some("eu"));
    assert_eq!(metric.fields().get("value"), Some(&FieldValue::Float(1.0)));

    ticket.delivered();
    assert_eq!(response.await.unwrap(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn shutdown_rejects_new_requests_and_fails_health() {
    let server = Server::from_toml("[http_push]\nshutdown_grace_period_secs = 0");

    let health = || Request::get("/health").body(Body::empty()).unwrap();
    assert_eq!(server.send(health()).await.unwrap(), StatusCode::OK);

    let Server { router, handle, groups } = server;
    let report = handle.shutdown().await;
    assert!(report.drained);
    drop(groups);

    let status = router.clone().oneshot(health()).await.unwrap().status();
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let status = router.oneshot(write("cpu value=1")).await.unwrap().status();
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
