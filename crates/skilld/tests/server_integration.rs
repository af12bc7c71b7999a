//! HTTP bus integration tests.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use skill_core::messages::{Command, SkillListPayload};
use skill_core::types::{SkillInventory, SkillRecord, TriggerReason};
use skill_core::{Config, Message};
use skilld::backend::{PackageBackend, Result as BackendResult};
use skilld::bus::MessageBus;
use skilld::commands::{run_dispatcher, CommandContext, CommandTable};
use skilld::config_source::StaticConfig;
use skilld::manifest::{Identity, IdentityError, Result as IdentityResult};
use skilld::registry::{DirectoryLoader, LoadedSkills};
use skilld::scheduler::{Scheduler, SchedulerDeps, SystemClock};
use skilld::server::{create_router, AppState, PublishResponse, StatusResponse};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// Every directory under the root is an installed catalog skill.
struct DirBackend(PathBuf);

impl PackageBackend for DirBackend {
    fn list(&self) -> BackendResult<Vec<SkillRecord>> {
        let mut records: Vec<SkillRecord> = fs::read_dir(&self.0)?
            .flatten()
            .map(|e| SkillRecord::new(e.file_name().to_string_lossy().to_string(), e.path(), true))
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }
    fn install(&self, _id: &str) -> BackendResult<()> {
        Ok(())
    }
    fn update(&self, _id: &str) -> BackendResult<()> {
        Ok(())
    }
    fn remove(&self, _id: &str) -> BackendResult<()> {
        Ok(())
    }
    fn inventory(&self) -> BackendResult<SkillInventory> {
        Ok(SkillInventory::new(Vec::new(), Vec::new()))
    }
}

struct Unpaired;

impl Identity for Unpaired {
    fn is_paired(&self) -> bool {
        false
    }
    fn upload_inventory(&self, _inventory: &SkillInventory) -> IdentityResult<()> {
        Err(IdentityError::NotPaired)
    }
}

struct TestApp {
    state: Arc<AppState>,
    router: Router,
    _dir: TempDir,
}

fn create_test_app(auth_token: Option<&str>, skills: &[&str]) -> TestApp {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.data_dir = dir.path().to_path_buf();
    config.priority_skills = Vec::new();
    config.upload_skill_manifest = false;
    let root = config.skills_dir();
    fs::create_dir_all(&root).unwrap();
    for id in skills {
        fs::create_dir_all(root.join(id)).unwrap();
        fs::write(root.join(id).join("__init__.py"), "").unwrap();
    }

    let bus = Arc::new(MessageBus::default());
    let loader = Arc::new(DirectoryLoader::new(
        Arc::new(LoadedSkills::new()),
        Arc::clone(&bus),
    ));
    let scheduler = Arc::new(Scheduler::new(SchedulerDeps {
        backend: Arc::new(DirBackend(root)),
        config: Arc::new(StaticConfig(config)),
        bus: Arc::clone(&bus),
        clock: Arc::new(SystemClock),
        identity: Arc::new(Unpaired),
        loader: Arc::clone(&loader),
    }));

    let state = Arc::new(AppState {
        bus,
        scheduler,
        loader,
        auth_token: auth_token.map(str::to_string),
    });
    TestApp {
        router: create_router(Arc::clone(&state)),
        state,
        _dir: dir,
    }
}

async fn body_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_check_returns_ok() {
    let app = create_test_app(None, &[]);

    let response = app.router.oneshot(get("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"status": "ok"}));
}

#[tokio::test]
async fn publish_puts_message_on_bus() {
    let app = create_test_app(None, &[]);
    let mut rx = app.state.bus.subscribe();

    let response = app
        .router
        .oneshot(post("/bus/skillmanager.keep", r#"{"skill": "skill-joke"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let published: PublishResponse = serde_json::from_value(body_json(response).await).unwrap();
    assert_eq!(published.event, "skillmanager.keep");
    assert_eq!(published.delivered, 1);

    let msg = rx.try_recv().unwrap();
    assert_eq!(msg.msg_type, "skillmanager.keep");
    assert_eq!(msg.data, json!({"skill": "skill-joke"}));
}

#[tokio::test]
async fn publish_with_empty_body_sends_null_data() {
    let app = create_test_app(None, &[]);
    let mut rx = app.state.bus.subscribe();

    let response = app
        .router
        .oneshot(post("/bus/skillmanager.update", ""))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(rx.try_recv().unwrap().data.is_null());
}

#[tokio::test]
async fn publish_rejects_malformed_json() {
    let app = create_test_app(None, &[]);

    let response = app
        .router
        .oneshot(post("/bus/skillmanager.keep", "{not json"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn auth_token_is_enforced() {
    let app = create_test_app(Some("secret"), &[]);

    let response = app
        .router
        .clone()
        .oneshot(post("/bus/skillmanager.update", ""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "missing auth token");

    let mut request = post("/bus/skillmanager.update", "");
    request
        .headers_mut()
        .insert("authorization", "Bearer wrong".parse().unwrap());
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "invalid auth token");

    let mut request = post("/bus/skillmanager.update", "");
    request
        .headers_mut()
        .insert("authorization", "Bearer secret".parse().unwrap());
    let response = app.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn health_check_skips_auth() {
    let app = create_test_app(Some("secret"), &[]);
    let response = app.router.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn status_reports_scheduler_and_last_pass() {
    let app = create_test_app(None, &["skill-joke"]);

    let response = app.router.clone().oneshot(get("/status")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let status: StatusResponse = serde_json::from_value(body_json(response).await).unwrap();
    assert_eq!(status.scheduler.passes_completed, 0);
    assert!(status.last_pass.is_none());

    let scheduler = Arc::clone(&app.state.scheduler);
    tokio::task::spawn_blocking(move || scheduler.run_pass(TriggerReason::UpdateCommand))
        .await
        .unwrap()
        .unwrap();

    let response = app.router.oneshot(get("/status")).await.unwrap();
    let status: StatusResponse = serde_json::from_value(body_json(response).await).unwrap();
    assert_eq!(status.scheduler.passes_completed, 1);
    let report = status.last_pass.unwrap();
    assert_eq!(report.reason, TriggerReason::UpdateCommand);
    assert_eq!(report.loaded, vec!["skill-joke"]);
}

#[tokio::test]
async fn skills_lists_loaded_skills() {
    let app = create_test_app(None, &["skill-joke", "skill-timer"]);
    app.state.scheduler.run_pass(TriggerReason::Timer).unwrap();

    let response = app.router.oneshot(get("/skills")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let list: SkillListPayload = serde_json::from_value(body_json(response).await).unwrap();
    assert_eq!(list.installed, vec!["skill-joke", "skill-timer"]);
    assert!(list.skills["skill-timer"].loaded);
}

#[tokio::test]
async fn event_stream_forwards_bus_messages() {
    let app = create_test_app(None, &[]);

    let response = app
        .router
        .oneshot(get("/bus/events?prefix=mycroft."))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "text/event-stream"
    );

    app.state
        .bus
        .emit(Message::new("skillmanager.pass.started", json!({})));
    app.state
        .bus
        .emit(Message::new("mycroft.skills.initialized", json!({})));

    let mut body = response.into_body();
    let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let text = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();
    assert!(text.contains("event: mycroft.skills.initialized"));
    assert!(!text.contains("skillmanager.pass.started"));
}

#[tokio::test]
async fn published_list_command_is_answered() {
    let app = create_test_app(None, &["skill-joke"]);
    let mut rx = app.state.bus.subscribe();
    let cancel = CancellationToken::new();
    let dispatcher = tokio::spawn(run_dispatcher(
        CommandTable::new(),
        CommandContext {
            scheduler: Arc::clone(&app.state.scheduler),
            loader: Arc::clone(&app.state.loader),
            bus: Arc::clone(&app.state.bus),
        },
        app.state.bus.subscribe(),
        cancel.clone(),
    ));

    let response = app
        .router
        .oneshot(post(&format!("/bus/{}", Command::List.as_str()), ""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let reply = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let msg = rx.recv().await.unwrap();
            if msg.msg_type == "mycroft.skills.list" {
                return msg;
            }
        }
    })
    .await
    .unwrap();
    assert!(reply.data["skills"].is_object());

    cancel.cancel();
    dispatcher.await.unwrap();
}
