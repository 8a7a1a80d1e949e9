use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use pilotctl_crypto::{generate_key_files, KeyMaterial, KeySource, SignedEnvelope};
use pilotctl_events::{EventPublisher, PublisherConfig, RetryPolicy};
use pilotctl_server::auth::encode_token;
use pilotctl_server::config::ServiceConfig;
use pilotctl_server::routes::ServiceContext;
use pilotctl_server::server;
use pilotctl_server::storage::{HostRecord, JobStatus, SqliteStore};
use pilotctl_types::{now, AuthToken, Command, Event, EventReceiver, PingEnvelope};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Service {
    url: String,
    store: SqliteStore,
    _dir: tempfile::TempDir,
}

/// Spin up the service on a random port and return its URL.
async fn start_service(with_keys: bool, receivers: Vec<EventReceiver>) -> Service {
    let dir = tempfile::tempdir().unwrap();
    if with_keys {
        generate_key_files(dir.path(), None).unwrap();
    }
    let db_path = dir.path().join("pilotctl.db");
    let store = SqliteStore::open(db_path.to_str().unwrap()).await.unwrap();

    let config = ServiceConfig {
        bind_addr: ([127, 0, 0, 1], 0).into(),
        db_path: db_path.to_string_lossy().into_owned(),
        ping_interval: Duration::from_secs(5),
        key_sources: vec![KeySource::Dir(dir.path().to_path_buf())],
        publisher: PublisherConfig {
            policy: RetryPolicy::new(3, Duration::from_millis(1)),
            ..Default::default()
        },
        ..Default::default()
    };
    let publisher = EventPublisher::new(receivers, config.publisher.clone()).unwrap();
    let state = Arc::new(ServiceContext::new(
        config,
        Arc::new(store.clone()),
        publisher,
    ));

    let app = server::router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Service {
        url: format!("http://{addr}"),
        store,
        _dir: dir,
    }
}

fn token_for(host_uuid: &str, issued_at: i64) -> String {
    encode_token(&AuthToken {
        host_uuid: host_uuid.into(),
        host_ip: "10.0.0.5".into(),
        hostname: "myhost".into(),
        issued_at,
    })
}

async fn ping(
    client: &reqwest::Client,
    service: &Service,
    token: &str,
    body: serde_json::Value,
) -> reqwest::Response {
    client
        .post(format!("{}/ping", service.url))
        .header("Authorization", token)
        .json(&body)
        .send()
        .await
        .unwrap()
}

/// Fetch `/pub` and open a ping response with it.
async fn open_envelope(
    client: &reqwest::Client,
    service: &Service,
    resp: reqwest::Response,
) -> PingEnvelope {
    let signed: SignedEnvelope<PingEnvelope> = resp.json().await.unwrap();
    let armored = client
        .get(format!("{}/pub", service.url))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let key = KeyMaterial::from_armored(armored.as_bytes()).unwrap();
    signed.open(&key).unwrap()
}

#[tokio::test]
async fn health_check() {
    let service = start_service(true, vec![]).await;
    let resp: serde_json::Value = reqwest::get(format!("{}/health", service.url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["status"], "ok");
    assert_eq!(resp["service"], "pilotctl");
}

#[tokio::test]
async fn idle_ping_returns_signed_empty_command() {
    let service = start_service(true, vec![]).await;
    service.store.admit("HOST-1", true).await.unwrap();
    let client = reqwest::Client::new();

    let resp = ping(&client, &service, &token_for("HOST-1", now() - 10), json!({})).await;
    assert_eq!(resp.status(), 200);

    let envelope = open_envelope(&client, &service, resp).await;
    assert!(envelope.command.is_empty());
    assert_eq!(envelope.interval, Duration::from_secs(5));
}

#[tokio::test]
async fn job_is_assigned_then_completed() {
    let service = start_service(true, vec![]).await;
    service.store.admit("HOST-1", true).await.unwrap();
    service
        .store
        .put_command(
            "backup",
            &Command {
                package: "ops/backup".into(),
                function: "run".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let job_id = service.store.enqueue_job("HOST-1", "backup").await.unwrap();
    let client = reqwest::Client::new();
    let token = token_for("HOST-1", now());

    let resp = ping(&client, &service, &token, json!({})).await;
    assert_eq!(resp.status(), 200);
    let envelope = open_envelope(&client, &service, resp).await;
    assert_eq!(envelope.command.job_id, job_id);
    assert_eq!(envelope.command.package, "ops/backup");
    assert_eq!(envelope.command.function, "run");

    let resp = ping(
        &client,
        &service,
        &token,
        json!({"result": {
            "JobId": job_id,
            "Success": false,
            "Log": "copied 3 of 5 files",
            "Err": "disk full"
        }}),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let envelope = open_envelope(&client, &service, resp).await;
    assert!(envelope.command.is_empty());

    let job = service.store.job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.log, "copied 3 of 5 files !!! ERROR: disk full\n");
}

#[tokio::test]
async fn job_result_from_another_host_is_ignored() {
    let service = start_service(true, vec![]).await;
    service.store.admit("HOST-1", true).await.unwrap();
    service.store.admit("HOST-2", true).await.unwrap();
    service
        .store
        .put_command(
            "backup",
            &Command {
                package: "ops/backup".into(),
                function: "run".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let job_id = service.store.enqueue_job("HOST-1", "backup").await.unwrap();
    let client = reqwest::Client::new();

    let resp = ping(&client, &service, &token_for("HOST-1", now()), json!({})).await;
    assert_eq!(resp.status(), 200);

    let resp = ping(
        &client,
        &service,
        &token_for("HOST-2", now()),
        json!({"result": {"JobId": job_id, "Success": true, "Log": "forged", "Err": ""}}),
    )
    .await;
    assert_eq!(resp.status(), 200);

    let job = service.store.job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.log, "");
}

#[tokio::test]
async fn expired_token_rejected() {
    let service = start_service(true, vec![]).await;
    service.store.admit("HOST-1", true).await.unwrap();
    let client = reqwest::Client::new();

    let resp = ping(&client, &service, &token_for("HOST-1", now() - 301), json!({})).await;
    assert_eq!(resp.status(), 401);
    let expired: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(expired["error"], "authentication failed");

    let resp = ping(&client, &service, &token_for("HOST-2", now()), json!({})).await;
    assert_eq!(resp.status(), 401);
    let unadmitted: serde_json::Value = resp.json().await.unwrap();

    assert_eq!(expired, unadmitted);
    assert!(!expired.to_string().contains("HOST-1"));
    assert!(!unadmitted.to_string().contains("HOST-2"));
}

#[tokio::test]
async fn missing_or_garbage_token_rejected() {
    let service = start_service(true, vec![]).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/ping", service.url))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = ping(&client, &service, "not-a-token", json!({})).await;
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn unadmitted_host_rejected() {
    let service = start_service(true, vec![]).await;
    service.store.admit("HOST-1", false).await.unwrap();
    let client = reqwest::Client::new();

    let resp = ping(&client, &service, &token_for("HOST-1", now()), json!({})).await;
    assert_eq!(resp.status(), 401);
    let resp = ping(&client, &service, &token_for("HOST-2", now()), json!({})).await;
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn missing_signing_key_blocks_response() {
    let service = start_service(false, vec![]).await;
    service.store.admit("HOST-1", true).await.unwrap();
    let client = reqwest::Client::new();

    let resp = ping(&client, &service, &token_for("HOST-1", now()), json!({})).await;
    assert_eq!(resp.status(), 500);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body.get("signature").is_none());

    let resp = client
        .get(format!("{}/pub", service.url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
}

async fn receive(State(recorder): State<Arc<Recorder>>, Json(events): Json<Vec<Event>>) {
    recorder.events.lock().unwrap().extend(events);
}

#[tokio::test]
async fn events_are_accepted_and_relayed() {
    let recorder = Arc::new(Recorder::default());
    let app = Router::new()
        .route("/ingest", post(receive))
        .with_state(recorder.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let service = start_service(
        true,
        vec![EventReceiver::new(format!("http://{addr}/ingest"))],
    )
    .await;
    service.store.admit("HOST-1", true).await.unwrap();
    service
        .store
        .put_host(
            "HOST-1",
            &HostRecord {
                organisation: "acme".into(),
                organisation_group: "retail".into(),
                area: "emea".into(),
                location: "london-01".into(),
                labels: vec!["edge".into(), "pos".into()],
            },
        )
        .await
        .unwrap();
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/events", service.url))
        .header("Authorization", token_for("HOST-1", now()))
        .json(&json!([{"event_id": "ev-1", "content": "disk almost full", "severity": 2}]))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);

    let mut relayed = Vec::new();
    for _ in 0..100 {
        relayed = recorder.events.lock().unwrap().clone();
        if !relayed.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(relayed.len(), 1);
    assert_eq!(relayed[0].event_id, "ev-1");
    assert_eq!(relayed[0].host_uuid, "HOST-1");
    assert_eq!(relayed[0].hostname, "myhost");
    assert_eq!(relayed[0].host_address, "10.0.0.5");
    assert_eq!(relayed[0].organisation, "acme");
    assert_eq!(relayed[0].organisation_group, "retail");
    assert_eq!(relayed[0].area, "emea");
    assert_eq!(relayed[0].location, "london-01");
    assert_eq!(relayed[0].host_label, vec!["edge".to_string(), "pos".to_string()]);
}

#[tokio::test]
async fn events_require_authentication() {
    let service = start_service(true, vec![]).await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/events", service.url))
        .json(&json!([]))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}
