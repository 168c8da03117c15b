//! Local HTTP API for the capture controller, calibration and the throw store.
//!
//! One background thread accepts loopback connections and serves them one at
//! a time. Requests are small JSON documents; responses are JSON except for
//! the JPEG frame endpoints and the PNG heatmap.

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::capture::{CaptureController, DEFAULT_FPS};
use crate::checkout::suggest_checkout;
use crate::error::CaptureError;
use crate::frame::Frame;
use crate::heatmap::{render_heatmap, DEFAULT_HEATMAP_SIZE};
use crate::storage::SqliteThrowStore;

const MAX_HEADER_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 64 * 1024;
const CHECKOUT_DARTS: u32 = 3;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8800".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

/// Everything a request handler can reach.
#[derive(Clone)]
pub struct ApiState {
    pub controller: Arc<CaptureController>,
    pub store: Arc<SqliteThrowStore>,
}

pub struct ApiServer {
    cfg: ApiConfig,
    state: ApiState,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, state: ApiState) -> Self {
        Self { cfg, state }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let state = self.state;
        let join = std::thread::Builder::new()
            .name("dartboard-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, state, shutdown_thread) {
                    log::error!("api: server stopped: {}", err);
                }
            })?;
        log::info!("api: listening on {}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, state: ApiState, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &state) {
                    log::warn!("api: request rejected: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, state: &ApiState) -> Result<()> {
    // Accepted sockets can inherit non-blocking mode from the listener.
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        Response::error(403, "forbidden").write_to(&mut stream)?;
        return Ok(());
    }

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            Response::error(400, "bad_request").write_to(&mut stream)?;
            return Err(err);
        }
    };
    let response = route(state, &request);
    log::debug!(
        "api: {} {} -> {}",
        request.method,
        request.path,
        response.status
    );
    response.write_to(&mut stream)
}

// ----------------------------------------------------------------------------
// Routing
// ----------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct PreviewRequest {
    camera_index: Option<u32>,
    fps: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    user_id: String,
    session_id: String,
    camera_index: Option<u32>,
    fps: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CalibrationRequest {
    src_points: Vec<[f64; 2]>,
}

#[derive(Debug, Deserialize)]
struct CreateUserRequest {
    user_id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    session_id: String,
    user_id: String,
    source_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddThrowRequest {
    user_id: String,
    session_id: String,
    x_norm: f64,
    y_norm: f64,
    confidence: Option<f64>,
}

fn route(state: &ApiState, request: &HttpRequest) -> Response {
    let method = request.method.as_str();
    let path = request.path.as_str();
    let result = match (method, path) {
        ("GET", "/health") => Ok(Response::json(200, &json!({"status": "ok"}))),
        ("GET", "/capture/status") => Ok(Response::json(200, &state.controller.status())),
        ("POST", "/capture/preview") => capture_preview(state, request),
        ("POST", "/capture/start") => capture_start(state, request),
        ("POST", "/capture/stop") => Ok(Response::json(200, &state.controller.stop())),
        ("GET", "/capture/frame.jpg") => Ok(match state.controller.latest_frame() {
            Some(frame) => Response::jpeg(frame.jpeg.to_vec()),
            None => Response::error(404, "no_frame"),
        }),
        ("GET", "/calibration") => Ok(Response::json(
            200,
            &state.controller.calibrator().status(),
        )),
        ("POST", "/calibration") => set_calibration(state, request),
        ("DELETE", "/calibration") => clear_calibration(state),
        ("GET", "/calibration/warp.jpg") => warped_frame(state),
        ("POST", "/users") => create_user(state, request),
        ("POST", "/sessions") => create_session(state, request),
        ("POST", "/throws") => add_throw(state, request),
        _ => match (method, ResourcePath::parse(path)) {
            ("GET", Some(ResourcePath::UserThrows(user_id))) => list_throws(state, user_id),
            ("DELETE", Some(ResourcePath::UserThrows(user_id))) => clear_throws(state, user_id),
            ("GET", Some(ResourcePath::Checkout(score))) => checkout(score),
            ("GET", Some(ResourcePath::Advice(user_id, score))) => advice(state, user_id, score),
            ("GET", Some(ResourcePath::Heatmap(user_id))) => heatmap_points(state, user_id),
            ("GET", Some(ResourcePath::HeatmapPng(user_id))) => heatmap_png(state, user_id),
            (_, Some(_)) => Ok(Response::error(405, "method_not_allowed")),
            (_, None) if is_known_path(path) => Ok(Response::error(405, "method_not_allowed")),
            (_, None) => Ok(Response::error(404, "not_found")),
        },
    };
    result.unwrap_or_else(|err| {
        log::error!("api: {} {} failed: {:#}", method, path, err);
        Response::error(500, "internal_error")
    })
}

fn is_known_path(path: &str) -> bool {
    matches!(
        path,
        "/health"
            | "/capture/status"
            | "/capture/preview"
            | "/capture/start"
            | "/capture/stop"
            | "/capture/frame.jpg"
            | "/calibration"
            | "/calibration/warp.jpg"
            | "/users"
            | "/sessions"
            | "/throws"
    )
}

/// Routes that carry an identifier in the path.
#[derive(Debug, PartialEq, Eq)]
enum ResourcePath<'a> {
    UserThrows(&'a str),
    Checkout(&'a str),
    Advice(&'a str, &'a str),
    Heatmap(&'a str),
    HeatmapPng(&'a str),
}

impl<'a> ResourcePath<'a> {
    fn parse(path: &'a str) -> Option<Self> {
        let (root, rest) = path.strip_prefix('/')?.split_once('/')?;
        let segments: Vec<&str> = rest.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return None;
        }
        match (root, &segments[..]) {
            ("users", &[user_id, "throws"]) => Some(Self::UserThrows(user_id)),
            ("checkout", &[score]) => Some(Self::Checkout(score)),
            ("advice", &[user_id, score]) => Some(Self::Advice(user_id, score)),
            ("heatmap", &[user_id]) => match user_id.strip_suffix(".png") {
                Some(user_id) if !user_id.is_empty() => Some(Self::HeatmapPng(user_id)),
                _ => Some(Self::Heatmap(user_id)),
            },
            _ => None,
        }
    }
}

fn capture_preview(state: &ApiState, request: &HttpRequest) -> Result<Response> {
    let body: PreviewRequest = if request.body.iter().all(u8::is_ascii_whitespace) {
        PreviewRequest::default()
    } else {
        match request.json() {
            Ok(body) => body,
            Err(response) => return Ok(response),
        }
    };
    let started = state.controller.start_preview(
        body.camera_index.unwrap_or(0),
        body.fps.unwrap_or(DEFAULT_FPS),
    );
    Ok(capture_started(started))
}

fn capture_start(state: &ApiState, request: &HttpRequest) -> Result<Response> {
    let body: StartRequest = match request.json() {
        Ok(body) => body,
        Err(response) => return Ok(response),
    };
    if state.store.get_user(&body.user_id)?.is_none() {
        return Ok(Response::error(404, "user not found"));
    }
    let Some(session) = state.store.get_session(&body.session_id)? else {
        return Ok(Response::error(404, "session not found"));
    };
    if session.user_id != body.user_id {
        return Ok(Response::error(400, "session does not belong to user"));
    }
    let started = state.controller.start_recording(
        &body.user_id,
        &body.session_id,
        body.camera_index.unwrap_or(0),
        body.fps.unwrap_or(DEFAULT_FPS),
    );
    Ok(capture_started(started))
}

fn capture_started(
    started: std::result::Result<crate::capture::CaptureStatus, CaptureError>,
) -> Response {
    match started {
        Ok(status) => Response::json(200, &status),
        Err(err @ CaptureError::AlreadyRunning) => Response::error(409, &err.to_string()),
        Err(err) => Response::error(500, &err.to_string()),
    }
}

fn set_calibration(state: &ApiState, request: &HttpRequest) -> Result<Response> {
    let body: CalibrationRequest = match request.json() {
        Ok(body) => body,
        Err(response) => return Ok(response),
    };
    Ok(calibration_result(
        state.controller.calibrator().set_source_points(&body.src_points),
    ))
}

fn clear_calibration(state: &ApiState) -> Result<Response> {
    Ok(calibration_result(state.controller.calibrator().clear()))
}

fn calibration_result(
    result: std::result::Result<crate::calibration::CalibrationStatus, CaptureError>,
) -> Response {
    match result {
        Ok(status) => Response::json(200, &status),
        Err(err @ CaptureError::InvalidCalibration(_)) => Response::error(400, &err.to_string()),
        Err(err) => {
            log::error!("api: calibration update failed: {}", err);
            Response::error(500, &err.to_string())
        }
    }
}

fn warped_frame(state: &ApiState) -> Result<Response> {
    let Some(cached) = state.controller.latest_frame() else {
        return Ok(Response::error(404, "no_frame"));
    };
    let frame = Frame::decode_jpeg(&cached.jpeg)?;
    let warped = state.controller.calibrator().warp_frame(frame);
    let jpeg = warped.encode_jpeg(state.controller.settings().jpeg_quality)?;
    Ok(Response::jpeg(jpeg))
}

fn create_user(state: &ApiState, request: &HttpRequest) -> Result<Response> {
    let body: CreateUserRequest = match request.json() {
        Ok(body) => body,
        Err(response) => return Ok(response),
    };
    if state.store.get_user(&body.user_id)?.is_some() {
        return Ok(Response::error(409, "user_id already exists"));
    }
    let user = state.store.create_user(&body.user_id, &body.name)?;
    Ok(Response::json(201, &user))
}

fn create_session(state: &ApiState, request: &HttpRequest) -> Result<Response> {
    let body: CreateSessionRequest = match request.json() {
        Ok(body) => body,
        Err(response) => return Ok(response),
    };
    if state.store.get_user(&body.user_id)?.is_none() {
        return Ok(Response::error(404, "user not found"));
    }
    if state.store.get_session(&body.session_id)?.is_some() {
        return Ok(Response::error(409, "session_id already exists"));
    }
    let session =
        state
            .store
            .create_session(&body.session_id, &body.user_id, body.source_ref.as_deref())?;
    Ok(Response::json(201, &session))
}

fn add_throw(state: &ApiState, request: &HttpRequest) -> Result<Response> {
    let body: AddThrowRequest = match request.json() {
        Ok(body) => body,
        Err(response) => return Ok(response),
    };
    let in_unit = |v: f64| (0.0..=1.0).contains(&v);
    let confidence = body.confidence.unwrap_or(1.0);
    if !in_unit(body.x_norm) || !in_unit(body.y_norm) || !in_unit(confidence) {
        return Ok(Response::error(400, "coordinates and confidence must be within [0, 1]"));
    }
    if state.store.get_user(&body.user_id)?.is_none() {
        return Ok(Response::error(404, "user not found"));
    }
    let Some(session) = state.store.get_session(&body.session_id)? else {
        return Ok(Response::error(404, "session not found"));
    };
    if session.user_id != body.user_id {
        return Ok(Response::error(400, "session does not belong to user"));
    }
    let throw = state.store.add_throw(
        &body.user_id,
        &body.session_id,
        body.x_norm,
        body.y_norm,
        confidence,
    )?;
    Ok(Response::json(201, &throw))
}

fn list_throws(state: &ApiState, user_id: &str) -> Result<Response> {
    if state.store.get_user(user_id)?.is_none() {
        return Ok(Response::error(404, "user not found"));
    }
    let throws = state.store.list_throws_for_user(user_id)?;
    Ok(Response::json(200, &throws))
}

fn clear_throws(state: &ApiState, user_id: &str) -> Result<Response> {
    if state.store.get_user(user_id)?.is_none() {
        return Ok(Response::error(404, "user not found"));
    }
    let removed = state.store.clear_throws_for_user(user_id)?;
    log::info!("api: cleared {} throws for user {}", removed, user_id);
    Ok(Response::json(200, &json!({ "removed": removed })))
}

fn parse_score(raw: &str) -> std::result::Result<i32, Response> {
    raw.parse()
        .map_err(|_| Response::error(400, &format!("invalid score: {}", raw)))
}

fn checkout(raw_score: &str) -> Result<Response> {
    let score = match parse_score(raw_score) {
        Ok(score) => score,
        Err(response) => return Ok(response),
    };
    let combinations = suggest_checkout(score, CHECKOUT_DARTS);
    if combinations.is_empty() {
        return Ok(Response::error(404, "No checkout combinations for score"));
    }
    Ok(Response::json(
        200,
        &json!({ "score": score, "combinations": combinations }),
    ))
}

fn advice(state: &ApiState, user_id: &str, raw_score: &str) -> Result<Response> {
    let score = match parse_score(raw_score) {
        Ok(score) => score,
        Err(response) => return Ok(response),
    };
    if state.store.get_user(user_id)?.is_none() {
        return Ok(Response::error(404, "user not found"));
    }
    let combinations = suggest_checkout(score, CHECKOUT_DARTS);
    Ok(Response::json(
        200,
        &json!({
            "user_id": user_id,
            "current_score": score,
            "can_finish": !combinations.is_empty(),
            "combinations": combinations,
        }),
    ))
}

fn heatmap_points(state: &ApiState, user_id: &str) -> Result<Response> {
    if state.store.get_user(user_id)?.is_none() {
        return Ok(Response::error(404, "user not found"));
    }
    let points: Vec<_> = state
        .store
        .list_throws_for_user(user_id)?
        .into_iter()
        .map(|t| {
            json!({
                "x_norm": t.x_norm,
                "y_norm": t.y_norm,
                "confidence": t.confidence,
                "session_id": t.session_id,
                "ts": t.ts,
            })
        })
        .collect();
    Ok(Response::json(
        200,
        &json!({
            "user_id": user_id,
            "throw_count": points.len(),
            "points": points,
            "heatmap_png": format!("/heatmap/{}.png", user_id),
        }),
    ))
}

fn heatmap_png(state: &ApiState, user_id: &str) -> Result<Response> {
    if state.store.get_user(user_id)?.is_none() {
        return Ok(Response::error(404, "user not found"));
    }
    let points: Vec<(f64, f64)> = state
        .store
        .list_throws_for_user(user_id)?
        .iter()
        .map(|t| (t.x_norm, t.y_norm))
        .collect();
    let png = render_heatmap(&points, DEFAULT_HEATMAP_SIZE)?;
    Ok(Response::png(png))
}

// ----------------------------------------------------------------------------
// HTTP plumbing
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpRequest {
    /// Parse the body as JSON, or produce the 400 response to send instead.
    fn json<T: DeserializeOwned>(&self) -> std::result::Result<T, Response> {
        serde_json::from_slice(&self.body)
            .map_err(|err| Response::error(400, &format!("invalid request body: {}", err)))
    }

    fn content_length(&self) -> Result<usize> {
        match self.headers.get("content-length") {
            Some(value) => value
                .parse()
                .map_err(|_| anyhow!("invalid content-length")),
            None => Ok(0),
        }
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_HEADER_BYTES + MAX_BODY_BYTES {
            return Err(anyhow!("request too large"));
        }
    };
    if header_end > MAX_HEADER_BYTES {
        return Err(anyhow!("request headers too large"));
    }

    let text = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    let mut request = HttpRequest {
        method: method.to_ascii_uppercase(),
        path,
        headers,
        body: Vec::new(),
    };

    let content_length = request.content_length()?;
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data.split_off(header_end);
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);
    request.body = body;
    Ok(request)
}

#[derive(Debug)]
struct Response {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Response {
    fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status,
                content_type: "application/json",
                body,
            },
            Err(err) => {
                log::error!("api: failed to serialize response: {}", err);
                Self::error(500, "internal_error")
            }
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: json!({ "error": message }).to_string().into_bytes(),
        }
    }

    fn jpeg(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: "image/jpeg",
            body,
        }
    }

    fn png(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: "image/png",
            body,
        }
    }

    fn write_to(&self, stream: &mut TcpStream) -> Result<()> {
        let status_line = match self.status {
            200 => "HTTP/1.1 200 OK",
            201 => "HTTP/1.1 201 Created",
            400 => "HTTP/1.1 400 Bad Request",
            403 => "HTTP/1.1 403 Forbidden",
            404 => "HTTP/1.1 404 Not Found",
            405 => "HTTP/1.1 405 Method Not Allowed",
            409 => "HTTP/1.1 409 Conflict",
            _ => "HTTP/1.1 500 Internal Server Error",
        };
        let header = format!(
            "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
            status_line = status_line,
            content_type = self.content_type,
            len = self.body.len()
        );
        stream.write_all(header.as_bytes())?;
        stream.write_all(&self.body)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_paths_extract_ids() {
        use ResourcePath::*;
        assert_eq!(ResourcePath::parse("/users/u1/throws"), Some(UserThrows("u1")));
        assert_eq!(ResourcePath::parse("/users//throws"), None);
        assert_eq!(ResourcePath::parse("/users/a/b/throws"), None);
        assert_eq!(ResourcePath::parse("/users/u1"), None);
        assert_eq!(ResourcePath::parse("/checkout/170"), Some(Checkout("170")));
        assert_eq!(ResourcePath::parse("/advice/u1/40"), Some(Advice("u1", "40")));
        assert_eq!(ResourcePath::parse("/heatmap/u1"), Some(Heatmap("u1")));
        assert_eq!(ResourcePath::parse("/heatmap/u1.png"), Some(HeatmapPng("u1")));
        assert_eq!(ResourcePath::parse("/heatmap/.png"), Some(Heatmap(".png")));
        assert_eq!(ResourcePath::parse("/health"), None);
    }

    #[test]
    fn checkout_rejects_non_numeric_scores() -> Result<()> {
        assert_eq!(checkout("abc")?.status, 400);
        assert_eq!(checkout("169")?.status, 404);
        let response = checkout("170")?;
        assert_eq!(response.status, 200);
        let body: serde_json::Value = serde_json::from_slice(&response.body)?;
        assert_eq!(body["score"], 170);
        assert!(body["combinations"]
            .as_array()
            .is_some_and(|c| c.contains(&json!(["T20", "T20", "DB"]))));
        Ok(())
    }

    #[test]
    fn error_responses_are_json() {
        let response = Response::error(409, "capture already running");
        assert_eq!(response.status, 409);
        let body: serde_json::Value = serde_json::from_slice(&response.body).expect("json body");
        assert_eq!(body["error"], "capture already running");
    }
}
