use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::{rejection::JsonRejection, FromRequest, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Form, Json,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    api::{
        error::ChatError,
        page::{render_page, PageContext},
        types::{ChatForm, ChatRequest, ChatResponse, ErrorResponse},
        AppState,
    },
    conversation::trim_to_sentence,
    inference::{SamplingParams, TextGenerator},
};

/// `GET /` — status page.
pub async fn index(State(state): State<AppState>) -> Response {
    render_page(&PageContext::status(&state.engine))
}

/// `POST /` — JSON API, or the HTML form fallback when the body is not
/// declared as JSON.
pub async fn submit(State(state): State<AppState>, request: Request) -> Response {
    // buffered once so the form fallback can re-read it
    let (parts, body) = request.into_parts();
    let body = match Bytes::from_request(Request::from_parts(parts.clone(), body), &state).await {
        Ok(body) => body,
        Err(rejection) => return ChatError::Validation(rejection.body_text()).into_response(),
    };
    let replay = |body: Bytes| Request::from_parts(parts.clone(), Body::from(body));

    match Json::<ChatRequest>::from_request(replay(body.clone()), &state).await {
        Ok(Json(payload)) => chat(&state, payload).await.into_response(),
        Err(JsonRejection::MissingJsonContentType(_)) => {
            match Form::<ChatForm>::from_request(replay(body), &state).await {
                Ok(Form(form)) => form_chat(&state, form).await,
                Err(rejection) => {
                    debug!(reason = %rejection.body_text(), "unreadable form body");
                    render_page(&PageContext::status(&state.engine))
                }
            }
        }
        Err(rejection) => ChatError::Validation(rejection.body_text()).into_response(),
    }
}

pub async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: "Not found".to_string(),
        }),
    )
        .into_response()
}

#[tracing::instrument(skip_all, fields(request_id = %Uuid::new_v4()))]
async fn chat(state: &AppState, payload: ChatRequest) -> Result<Json<ChatResponse>, ChatError> {
    let user_message = payload.message.trim().to_string();
    if user_message.is_empty() {
        return Err(ChatError::empty_message());
    }

    let generator = state
        .engine
        .generator()
        .ok_or(ChatError::ServiceUnavailable)?;

    let params = payload.sampling().map_err(ChatError::Generation)?;
    let response = generate_reply(generator, user_message.clone(), params).await?;

    Ok(Json(ChatResponse {
        response,
        user_message,
    }))
}

#[tracing::instrument(skip_all, fields(request_id = %Uuid::new_v4()))]
async fn form_chat(state: &AppState, form: ChatForm) -> Response {
    let user_message = form.message.trim().to_string();
    let generator = match state.engine.generator() {
        Some(generator) if !user_message.is_empty() => generator,
        _ => return render_page(&PageContext::status(&state.engine)),
    };

    let outcome = match form.sampling() {
        Ok(params) => generate_reply(generator, user_message.clone(), params)
            .await
            .map_err(ChatError::into_cause),
        Err(reason) => Err(reason),
    };

    let mut ctx = PageContext {
        model_loaded: true,
        ..Default::default()
    };
    match outcome {
        Ok(reply) => {
            ctx.user_message = Some(user_message);
            ctx.bot_response = Some(reply);
        }
        Err(reason) => {
            warn!(%reason, "form chat failed");
            ctx.error = Some(reason);
        }
    }
    render_page(&ctx)
}

/// Runs the generator off the async executor and trims the reply to a
/// sentence boundary. Panics inside the generator become errors.
async fn generate_reply(
    generator: Arc<dyn TextGenerator>,
    prompt: String,
    params: SamplingParams,
) -> Result<String, ChatError> {
    let started = Instant::now();

    let raw = tokio::task::spawn_blocking(move || generator.generate(&prompt, &params))
        .await
        .map_err(|join_err| ChatError::Generation(join_err.to_string()))?
        .map_err(|err| ChatError::Generation(format!("{err:#}")))?;

    let reply = trim_to_sentence(&raw);
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        raw_chars = raw.chars().count(),
        reply_chars = reply.chars().count(),
        "reply generated"
    );
    Ok(reply)
}
