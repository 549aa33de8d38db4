//! Status page, passkey form and metrics endpoint.
//!
//! # Endpoints
//!
//! - `GET /` - HTML status page, with a passkey form while pairing waits
//! - `POST /` - Submit a passkey (`passkey` form field)
//! - `POST /refresh` - Run a refresh cycle now
//! - `GET /metrics` - Prometheus text exposition
//! - `GET /api/health` - Health check
//! - `GET /api/status` - Collector status as JSON

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Form, Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{error, info, warn};

use crate::passkey::{PasskeyError, parse_passkey};
use crate::state::AppState;

/// Create the router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(status_page).post(submit_passkey))
        .route("/refresh", post(trigger_refresh))
        .route("/metrics", get(metrics))
        .route("/api/health", get(health))
        .route("/api/status", get(get_status))
}

/// Human-readable age, e.g. "5 minutes ago".
pub fn format_age(age: Duration) -> String {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;

    let secs = age.as_secs();
    let (count, unit) = if secs < MINUTE {
        return format!("{:.0} seconds ago", age.as_secs_f64());
    } else if secs < HOUR {
        (secs / MINUTE, "minute")
    } else if secs < DAY {
        (secs / HOUR, "hour")
    } else {
        (secs / DAY, "day")
    };
    if count == 1 {
        format!("1 {unit} ago")
    } else {
        format!("{count} {unit}s ago")
    }
}

fn age_since(ts: OffsetDateTime, now: OffsetDateTime) -> Duration {
    Duration::try_from(now - ts).unwrap_or(Duration::ZERO)
}

fn format_time(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_else(|_| ts.to_string())
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Render the status page.
fn render_status(state: &AppState, now: OffsetDateTime) -> String {
    let collector = &state.collector;
    let interval = state.config.collector.interval();
    let last_success = collector.last_success();
    let stale = last_success.is_none_or(|ts| age_since(ts, now) > interval * 2);

    let mut html = String::from(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
         <title>Aranet4 collector</title>\n</head>\n<body>\n<h1>Aranet4 collector</h1>\n",
    );
    let _ = writeln!(
        html,
        "<p>Device: <code>{}</code></p>",
        escape_html(&state.config.device.address)
    );

    if stale {
        html.push_str("<p class=\"warning\"><strong>No recent success.</strong></p>\n");
    }

    html.push_str("<table>\n");
    for (label, ts) in [
        ("Last success", last_success),
        ("Last reported sample", collector.last_reported()),
    ] {
        let value = match ts {
            Some(ts) => format!(
                "{} ({})",
                format_time(ts),
                format_age(age_since(ts, now))
            ),
            None => "never".to_string(),
        };
        let _ = writeln!(html, "<tr><th>{label}</th><td>{value}</td></tr>");
    }
    if let Some(error) = collector.last_error() {
        let _ = writeln!(
            html,
            "<tr><th>Last error</th><td>{}</td></tr>",
            escape_html(&error)
        );
    }
    let _ = writeln!(
        html,
        "<tr><th>Current time</th><td>{}</td></tr>\n</table>",
        format_time(now)
    );

    if state.mediator.is_awaiting() {
        html.push_str(
            "<h2>Pairing</h2>\n\
             <p>The device is waiting for the passkey shown on its display.</p>\n\
             <form method=\"post\" action=\"/\">\n\
             <input type=\"text\" name=\"passkey\" inputmode=\"numeric\" \
             pattern=\"[0-9]{1,6}\" autocomplete=\"off\" autofocus>\n\
             <button type=\"submit\">Pair</button>\n</form>\n",
        );
    }

    html.push_str(
        "<form method=\"post\" action=\"/refresh\">\
         <button type=\"submit\">Refresh now</button></form>\n\
         <p><a href=\"/metrics\">Metrics</a></p>\n</body>\n</html>\n",
    );
    html
}

async fn status_page(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(render_status(&state, OffsetDateTime::now_utc()))
}

/// Passkey form body.
#[derive(Debug, Deserialize)]
pub struct PasskeyForm {
    #[serde(default)]
    pub passkey: String,
}

async fn submit_passkey(
    State(state): State<Arc<AppState>>,
    Form(form): Form<PasskeyForm>,
) -> Result<Redirect, AppError> {
    let passkey = parse_passkey(&form.passkey)?;
    state.mediator.submit(passkey).await?;
    info!("passkey received via web interface");
    Ok(Redirect::to("/"))
}

async fn trigger_refresh(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.collector.trigger_refresh();
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "message": "refresh requested" })),
    )
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&state.registry.gather(), &mut buffer)
        .map_err(|e| AppError::Internal(format!("encoding metrics: {e}")))?;
    Ok((
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response())
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: OffsetDateTime::now_utc(),
    })
}

/// Collector status response.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub running: bool,
    pub device: String,
    pub interval_secs: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_success: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_reported: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    pub success_count: u64,
    pub failure_count: u64,
    pub awaiting_passkey: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub passkey_requested_at: Option<OffsetDateTime>,
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let collector = &state.collector;
    Json(StatusResponse {
        running: collector.is_running(),
        device: state.config.device.address.clone(),
        interval_secs: state.config.collector.interval_secs,
        last_success: collector.last_success(),
        last_reported: collector.last_reported(),
        last_error: collector.last_error(),
        success_count: collector.success_count(),
        failure_count: collector.failure_count(),
        awaiting_passkey: state.mediator.is_awaiting(),
        passkey_requested_at: state.mediator.requested_at(),
    })
}

/// Application error type.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Internal(String),
}

impl From<PasskeyError> for AppError {
    fn from(e: PasskeyError) -> Self {
        match e {
            PasskeyError::PasskeyDeliveryTimeout(_) => {
                error!(error = %e, "failed to deliver passkey");
                AppError::Internal(e.to_string())
            }
            e => {
                warn!(error = %e, "rejected passkey submission");
                AppError::BadRequest(e.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::passkey::PasskeyMediator;

    fn create_test_state() -> Arc<AppState> {
        let mut config = Config::default();
        config.device.address = "Aranet4 <17C3C>".to_string();
        AppState::new(config)
    }

    async fn response_body(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn passkey_post(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn test_format_age() {
        let cases = [
            (0, "0 seconds ago"),
            (59, "59 seconds ago"),
            (60, "1 minute ago"),
            (119, "1 minute ago"),
            (300, "5 minutes ago"),
            (3600, "1 hour ago"),
            (7 * 3600 + 59, "7 hours ago"),
            (86400, "1 day ago"),
            (3 * 86400, "3 days ago"),
        ];
        for (secs, expected) in cases {
            assert_eq!(format_age(Duration::from_secs(secs)), expected);
        }
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<a href="x">'&'</a>"#),
            "&lt;a href=&quot;x&quot;&gt;&#39;&amp;&#39;&lt;/a&gt;"
        );
    }

    #[test]
    fn test_status_page_never_succeeded() {
        let state = create_test_state();
        let html = render_status(&state, OffsetDateTime::now_utc());
        assert!(html.contains("No recent success"));
        assert!(html.contains("Aranet4 &lt;17C3C&gt;"));
        assert!(html.contains("<td>never</td>"));
        assert!(!html.contains("name=\"passkey\""));
    }

    #[test]
    fn test_status_page_recent_and_stale() {
        let state = create_test_state();
        let now = OffsetDateTime::now_utc();
        state.collector.record_success(
            now - Duration::from_secs(300),
            Some(now - Duration::from_secs(600)),
        );
        let html = render_status(&state, now);
        assert!(!html.contains("No recent success"));
        assert!(html.contains("(5 minutes ago)"));
        assert!(html.contains("(10 minutes ago)"));

        // Two intervals without a success.
        let later = now + Duration::from_secs(2 * 3600);
        assert!(render_status(&state, later).contains("No recent success"));
    }

    #[tokio::test]
    async fn test_status_page_shows_passkey_form_while_awaiting() {
        let state = create_test_state();
        let app = router().with_state(state.clone());

        let request = state.mediator.begin().unwrap();
        let response = app.clone().oneshot(get("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response_body(response).await.contains("name=\"passkey\""));

        drop(request);
        let response = app.oneshot(get("/")).await.unwrap();
        assert!(!response_body(response).await.contains("name=\"passkey\""));
    }

    #[tokio::test]
    async fn test_submit_passkey_redirects() {
        let state = create_test_state();
        let app = router().with_state(state.clone());

        let request = state.mediator.begin().unwrap();
        let waiter = tokio::spawn(request.wait(Duration::from_secs(60)));

        let response = app.oneshot(passkey_post("passkey=123456")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[header::LOCATION], "/");
        assert_eq!(waiter.await.unwrap(), Ok(123456));
    }

    #[tokio::test]
    async fn test_submit_passkey_rejections() {
        let state = create_test_state();
        let app = router().with_state(state.clone());

        // No request pending.
        let response = app.clone().oneshot(passkey_post("passkey=1234")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response_body(response).await;
        assert!(body.contains("no passkey request pending"));

        let _request = state.mediator.begin().unwrap();
        for body in ["", "passkey=", "passkey=abc", "passkey=1234567"] {
            let response = app.clone().oneshot(passkey_post(body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body {body:?}");
        }
        // Malformed input does not consume the request.
        assert!(state.mediator.is_awaiting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_passkey_delivery_timeout() {
        let mut config = Config::default();
        config.device.address = "dev".to_string();
        let state = AppState::with_mediator(config, PasskeyMediator::new());
        let app = router().with_state(state.clone());

        // Pending but never claimed.
        let _request = state.mediator.begin().unwrap();
        let response = app.oneshot(passkey_post("passkey=42")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json: serde_json::Value =
            serde_json::from_str(&response_body(response).await).unwrap();
        assert!(json["error"].as_str().unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn test_refresh_trigger() {
        let state = create_test_state();
        let app = router().with_state(state.clone());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/refresh")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        tokio::time::timeout(Duration::from_secs(1), state.collector.refresh_requested())
            .await
            .expect("refresh requested");
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let state = create_test_state();
        let counter = prometheus::IntCounter::new("test_total", "help").unwrap();
        counter.inc();
        state.registry.register(Box::new(counter)).unwrap();

        let app = router().with_state(state);
        let response = app.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/plain")
        );
        assert!(response_body(response).await.contains("test_total 1"));
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = router().with_state(create_test_state());
        let response = app.oneshot(get("/api/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json: serde_json::Value =
            serde_json::from_str(&response_body(response).await).unwrap();
        assert_eq!(json["status"], "ok");
        assert!(json["version"].is_string());
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let state = create_test_state();
        state.collector.record_failure("device not found".to_string());
        let app = router().with_state(state);

        let response = app.oneshot(get("/api/status")).await.unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&response_body(response).await).unwrap();
        assert_eq!(json["running"], false);
        assert_eq!(json["interval_secs"], 3600);
        assert!(json["last_success"].is_null());
        assert_eq!(json["last_error"], "device not found");
        assert_eq!(json["failure_count"], 1);
        assert_eq!(json["awaiting_passkey"], false);
    }
}
