use super::AppState;
use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

fn json_response(status: StatusCode, body: String) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body))
        .unwrap()
}

/// Query parameter lookup; admin URLs are flat enough that a hand-rolled
/// split beats pulling in a form decoder.
fn query_param<'a>(req: &'a Request<Incoming>, name: &str) -> Option<&'a str> {
    req.uri().query()?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then_some(value)
    })
}

pub async fn handle_admin(
    req: Request<Incoming>,
    state: AppState,
) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => {
            let backend = state.gate.store().backend_name();
            match state.gate.store().ping().await {
                Ok(()) => Ok(json_response(
                    StatusCode::OK,
                    format!(r#"{{"status":"ok","backend":"{}"}}"#, backend),
                )),
                Err(e) => Ok(json_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    serde_json::json!({
                        "status": "unreachable",
                        "backend": backend,
                        "error": e.to_string(),
                    })
                    .to_string(),
                )),
            }
        }

        "/backend" => {
            let info = state.gate.backend_info().await;
            let body = serde_json::to_string_pretty(&info).unwrap_or_default();
            Ok(json_response(StatusCode::OK, body))
        }

        "/status" => {
            let Some(resource) = query_param(&req, "resource") else {
                return Ok(json_response(
                    StatusCode::BAD_REQUEST,
                    r#"{"error":"missing resource parameter"}"#.to_string(),
                ));
            };
            let user = query_param(&req, "user");

            match state.gate.status(resource, user).await {
                Ok(status) => {
                    let body = serde_json::to_string_pretty(&status).unwrap_or_default();
                    Ok(json_response(StatusCode::OK, body))
                }
                Err(e) => Ok(json_response(
                    StatusCode::BAD_GATEWAY,
                    serde_json::json!({"error": e.to_string()}).to_string(),
                )),
            }
        }

        "/resources" => {
            let manager = state.gate.manager();
            let mut names = manager.resource_names();
            names.sort();
            let resources: Vec<serde_json::Value> = names
                .iter()
                .filter_map(|name| {
                    manager.configuration(name).map(|limits| {
                        serde_json::json!({
                            "name": name,
                            "limits": limits,
                        })
                    })
                })
                .collect();

            let body = serde_json::to_string_pretty(&resources).unwrap_or_default();
            Ok(json_response(StatusCode::OK, body))
        }

        "/config" => {
            let settings = state.settings.load();
            let body = serde_json::to_string_pretty(&**settings).unwrap_or_default();
            Ok(json_response(StatusCode::OK, body))
        }

        "/metrics" => {
            let body = state.metrics.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        _ => Ok(json_response(
            StatusCode::NOT_FOUND,
            r#"{"error":"not found"}"#.to_string(),
        )),
    }
}
