use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use axum::{body::Body, Router};
use chatbot_web::{
    build_app,
    inference::{EngineSlot, SamplingParams, TextGenerator},
    AppState,
};
use http::{header::CONTENT_TYPE, Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

/// Returns a canned reply and records every call.
struct ScriptedGenerator {
    reply: String,
    calls: AtomicUsize,
    last: Mutex<Option<(String, SamplingParams)>>,
}

impl ScriptedGenerator {
    fn new(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            calls: AtomicUsize::new(0),
            last: Mutex::new(None),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TextGenerator for ScriptedGenerator {
    fn generate(&self, prompt: &str, params: &SamplingParams) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some((prompt.to_string(), *params));
        Ok(self.reply.clone())
    }
}

struct FailingGenerator;

impl TextGenerator for FailingGenerator {
    fn generate(&self, _prompt: &str, _params: &SamplingParams) -> anyhow::Result<String> {
        Err(anyhow::anyhow!("CUDA out of memory"))
    }
}

struct PanickingGenerator;

impl TextGenerator for PanickingGenerator {
    fn generate(&self, _prompt: &str, _params: &SamplingParams) -> anyhow::Result<String> {
        panic!("sampler exploded")
    }
}

fn app_with(engine: EngineSlot) -> Router {
    build_app(AppState::new(engine), std::path::Path::new("static"))
}

fn loaded(generator: Arc<dyn TextGenerator>) -> Router {
    app_with(EngineSlot::loaded(generator))
}

fn post_as(content_type: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder().method(Method::POST).uri("/");
    if let Some(content_type) = content_type {
        builder = builder.header(CONTENT_TYPE, content_type);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn json_post(body: &str) -> Request<Body> {
    post_as(Some("application/json"), body)
}

fn form_post(body: &str) -> Request<Body> {
    post_as(Some("application/x-www-form-urlencoded"), body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn send(app: Router, req: Request<Body>) -> (StatusCode, String) {
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

async fn send_json(app: Router, req: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = send(app, req).await;
    (status, serde_json::from_str(&body).unwrap())
}

#[tokio::test]
async fn json_chat_returns_trimmed_reply() {
    let generator = ScriptedGenerator::new("Hello there. How are you");
    let app = loaded(generator.clone());

    let (status, body) = send_json(app, json_post(r#"{"message":"  hi  "}"#)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"], "Hello there.");
    assert_eq!(body["user_message"], "hi");
    assert_eq!(generator.calls(), 1);
}

#[tokio::test]
async fn reply_without_punctuation_gets_ellipsis() {
    let app = loaded(ScriptedGenerator::new("no punctuation at all"));

    let (status, body) = send_json(app, json_post(r#"{"message":"go"}"#)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"], "no punctuation at all...");
}

#[tokio::test]
async fn default_sampling_params_reach_the_engine() {
    let generator = ScriptedGenerator::new("Sure.");
    let app = loaded(generator.clone());

    send(app, json_post(r#"{"message":"hi"}"#)).await;

    let (prompt, params) = generator.last.lock().unwrap().clone().unwrap();
    assert_eq!(prompt, "hi");
    assert_eq!(params, SamplingParams::default());
}

#[tokio::test]
async fn explicit_sampling_params_are_forwarded() {
    let generator = ScriptedGenerator::new("Sure.");
    let app = loaded(generator.clone());

    send(
        app,
        json_post(r#"{"message":"hi","temperature":0.3,"max_tokens":42}"#),
    )
    .await;

    let (_, params) = generator.last.lock().unwrap().clone().unwrap();
    assert_eq!(
        params,
        SamplingParams {
            temperature: 0.3,
            max_new_tokens: 42
        }
    );
}

#[tokio::test]
async fn numeric_strings_and_whole_floats_are_accepted() {
    let generator = ScriptedGenerator::new("Sure.");
    let app = loaded(generator.clone());

    let (status, _) = send_json(
        app,
        json_post(r#"{"message":"hi","temperature":"0.5","max_tokens":50.0}"#),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let (_, params) = generator.last.lock().unwrap().clone().unwrap();
    assert_eq!(
        params,
        SamplingParams {
            temperature: 0.5,
            max_new_tokens: 50
        }
    );
}

#[tokio::test]
async fn unconvertible_max_tokens_is_a_generation_error() {
    let generator = ScriptedGenerator::new("unused.");
    let app = loaded(generator.clone());

    let (status, json) =
        send_json(app, json_post(r#"{"message":"hi","max_tokens":-1}"#)).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let error = json["error"].as_str().unwrap();
    assert!(error.starts_with("Error generating response:"), "{error}");
    assert!(error.contains("-1"), "{error}");
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn message_and_model_checks_come_before_params() {
    let generator = ScriptedGenerator::new("unused.");
    let (status, json) = send_json(
        loaded(generator.clone()),
        json_post(r#"{"message":"","max_tokens":-1}"#),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "Message cannot be empty");
    assert_eq!(generator.calls(), 0);

    let (status, json) = send_json(
        app_with(EngineSlot::failed("Model path not found: missing-model")),
        json_post(r#"{"message":"hi","temperature":"hot"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["error"], "Chatbot model not loaded");
}

#[tokio::test]
async fn blank_message_is_rejected_before_generation() {
    for body in [r#"{"message":""}"#, r#"{"message":"   \n "}"#, r#"{}"#] {
        let generator = ScriptedGenerator::new("never used.");
        let app = loaded(generator.clone());

        let (status, json) = send_json(app, json_post(body)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST, "body {body}");
        assert_eq!(json["error"], "Message cannot be empty");
        assert_eq!(generator.calls(), 0);
    }
}

#[tokio::test]
async fn malformed_json_is_a_validation_error() {
    let app = loaded(ScriptedGenerator::new("unused."));

    let (status, json) = send_json(app, json_post(r#"{"message": "#)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!json["error"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn unloaded_engine_answers_500() {
    let app = app_with(EngineSlot::failed("Model path not found: missing-model"));

    let (status, json) = send_json(app, json_post(r#"{"message":"hello"}"#)).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["error"], "Chatbot model not loaded");
}

#[tokio::test]
async fn generation_failure_is_reported() {
    let app = loaded(Arc::new(FailingGenerator));

    let (status, json) = send_json(app, json_post(r#"{"message":"hello"}"#)).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["error"], "Error generating response: CUDA out of memory");
}

#[tokio::test]
async fn generator_panic_does_not_escape() {
    let app = loaded(Arc::new(PanickingGenerator));

    let (status, json) = send_json(app, json_post(r#"{"message":"hello"}"#)).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json["error"]
        .as_str()
        .unwrap()
        .starts_with("Error generating response:"));
}

#[tokio::test]
async fn index_reports_loaded_model() {
    let app = loaded(ScriptedGenerator::new("unused."));

    let (status, html) = send(app, get("/")).await;

    assert_eq!(status, StatusCode::OK);
    assert!(html.contains("Model loaded"));
}

#[tokio::test]
async fn index_shows_startup_error() {
    let app = app_with(EngineSlot::failed("Model path not found: missing-model"));

    let (status, html) = send(app, get("/")).await;

    assert_eq!(status, StatusCode::OK);
    assert!(html.contains("Model not loaded"));
    assert!(html.contains("Model path not found: missing-model"));
}

#[tokio::test]
async fn form_post_renders_reply_inline() {
    let generator = ScriptedGenerator::new("I love music! And you");
    let app = loaded(generator.clone());

    let (status, html) = send(app, form_post("message=Tell+me&temperature=0.5&max_tokens=30")).await;

    assert_eq!(status, StatusCode::OK);
    assert!(html.contains("Tell me"));
    assert!(html.contains("I love music!"));
    assert!(!html.contains("And you"));

    let (_, params) = generator.last.lock().unwrap().clone().unwrap();
    assert_eq!(params.temperature, 0.5);
    assert_eq!(params.max_new_tokens, 30);
}

#[tokio::test]
async fn form_post_with_bad_number_shows_error() {
    let generator = ScriptedGenerator::new("unused.");
    let app = loaded(generator.clone());

    let (status, html) = send(app, form_post("message=hi&temperature=hot")).await;

    assert_eq!(status, StatusCode::OK);
    assert!(html.contains("hot"));
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn form_post_generation_failure_shows_only_the_cause() {
    let app = loaded(Arc::new(FailingGenerator));

    let (status, html) = send(app, form_post("message=hi")).await;

    assert_eq!(status, StatusCode::OK);
    assert!(html.contains("CUDA out of memory"));
    assert!(!html.contains("Error generating response"));
}

#[tokio::test]
async fn json_content_type_variants_reach_the_api() {
    for content_type in ["application/json; charset=utf-8", "application/vnd.api+json"] {
        let generator = ScriptedGenerator::new("Fine.");
        let app = loaded(generator.clone());

        let (status, json) =
            send_json(app, post_as(Some(content_type), r#"{"message":"hi"}"#)).await;

        assert_eq!(status, StatusCode::OK, "{content_type}");
        assert_eq!(json["response"], "Fine.");
        assert_eq!(generator.calls(), 1);
    }
}

#[tokio::test]
async fn undeclared_body_renders_the_status_page() {
    let generator = ScriptedGenerator::new("unused.");
    let app = loaded(generator.clone());

    let (status, html) = send(app, post_as(None, r#"{"message":"hi"}"#)).await;

    assert_eq!(status, StatusCode::OK);
    assert!(html.contains("Model loaded"));
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn form_post_without_model_falls_back_to_status_page() {
    let app = app_with(EngineSlot::failed("Model weight file missing."));

    let (status, html) = send(app, form_post("message=hi")).await;

    assert_eq!(status, StatusCode::OK);
    assert!(html.contains("Model weight file missing."));
}

#[tokio::test]
async fn unknown_route_is_json_404() {
    let app = loaded(ScriptedGenerator::new("unused."));

    let (status, json) = send_json(app, get("/nope")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "Not found");
}
