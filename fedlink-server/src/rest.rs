//! The HTTP API of the coordination protocol.
//!
//! Worker routes speak the plain-text/binary wire contract (sentinel bodies,
//! compressed artifact frames); the admin control plane is JSON end to end
//! and guarded by HTTP basic auth with credentials injected through the
//! environment, entirely separate from worker public-key authentication.
//! Every response carries permissive CORS headers since admin and worker
//! clients run in varied network contexts.

use std::convert::Infallible;

use bytes::BufMut;
use futures::TryStreamExt;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, warn};
use warp::{
    http::{Response, StatusCode},
    multipart::{FormData, Part},
    reply::Reply,
    Filter,
    Rejection,
};

use fedlink_core::wire::{self, AdminError, SIGNED_PHRASE_PART, WORKER_MODEL_UPDATE_PART};

use crate::{
    services::ProtocolHandler,
    settings::{AdminSettings, ApiSettings},
};

/// Upper bound on an update submission form, large enough for sizeable
/// model blobs while bounding memory per request.
const MAX_UPDATE_FORM_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug, Error)]
/// Errors of the rest server.
pub enum RestError {
    #[error("invalid TLS configuration was provided")]
    InvalidTlsConfig,
}

impl From<Infallible> for RestError {
    fn from(infallible: Infallible) -> RestError {
        match infallible {}
    }
}

/// Starts the HTTP server at the configured address.
///
/// * `api_settings`: address of the server and, with the `tls` feature,
///   optional certificate and key for TLS server authentication.
/// * `admin`: credentials guarding the admin routes; `None` rejects every
///   admin request.
/// * `handler`: the protocol service stack.
///
/// # Errors
/// Fails if the TLS settings are invalid.
pub async fn serve(
    api_settings: ApiSettings,
    admin: Option<AdminSettings>,
    handler: ProtocolHandler,
) -> Result<(), RestError> {
    if admin.is_none() {
        warn!("admin credentials are not configured: the admin API will reject every request");
    }
    let filter = routes(handler, admin);

    #[cfg(not(feature = "tls"))]
    return run_http(filter, api_settings).await.map_err(RestError::from);
    #[cfg(feature = "tls")]
    return run_https(filter, api_settings).await;
}

/// Assembles the full route filter. Exposed for in-process testing.
pub fn routes(
    handler: ProtocolHandler,
    admin: Option<AdminSettings>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let register = warp::path!("register_worker")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_handler(handler.clone()))
        .and_then(handle_register);

    let challenge = warp::path!("challenge_phrase" / String)
        .and(warp::get())
        .and(with_handler(handler.clone()))
        .and_then(handle_challenge);

    let global_model = warp::path!("return_global_model")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_handler(handler.clone()))
        .and_then(handle_global_model);

    let update = warp::path!("receive_worker_update" / String)
        .and(warp::post())
        .and(warp::multipart::form().max_length(MAX_UPDATE_FORM_BYTES))
        .and(with_handler(handler.clone()))
        .and_then(handle_update);

    let admin_list = warp::path!("workers")
        .and(warp::get())
        .and(admin_auth(admin.clone()))
        .and(with_handler(handler.clone()))
        .and_then(handle_admin_list);

    let admin_add = warp::path!("workers")
        .and(warp::post())
        .and(admin_auth(admin.clone()))
        .and(warp::body::json())
        .and(with_handler(handler.clone()))
        .and_then(handle_admin_add);

    let admin_set_status = warp::path!("workers" / String)
        .and(warp::put())
        .and(admin_auth(admin.clone()))
        .and(warp::body::json())
        .and(with_handler(handler.clone()))
        .and_then(handle_admin_set_status);

    let admin_delete = warp::path!("workers" / String)
        .and(warp::delete())
        .and(admin_auth(admin))
        .and(with_handler(handler))
        .and_then(handle_admin_delete);

    let cors = warp::cors()
        .allow_any_origin()
        .allow_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"])
        .allow_headers(vec![
            "Origin",
            "Accept",
            "Content-Type",
            "X-Requested-With",
            "X-CSRF-Token",
            "Authorization",
        ]);

    register
        .or(challenge)
        .or(global_model)
        .or(update)
        .or(admin_list)
        .or(admin_add)
        .or(admin_set_status)
        .or(admin_delete)
        .recover(handle_reject)
        .with(cors)
        .with(warp::log("http"))
}

/// Handles and responds to a worker registration.
async fn handle_register(body: Value, handler: ProtocolHandler) -> Result<impl Reply, Infallible> {
    Ok(match handler.register(body).await {
        Ok(worker_id) => text_response(worker_id.to_string()),
        Err(e) => text_response(e.response_body()),
    })
}

/// Handles and responds to a challenge phrase request.
async fn handle_challenge(
    context: String,
    handler: ProtocolHandler,
) -> Result<impl Reply, Infallible> {
    Ok(octet_response(handler.challenge_phrase(&context)))
}

/// Handles a long-poll for the global model; the response is held open
/// until a newer artifact version exists.
async fn handle_global_model(
    body: Value,
    handler: ProtocolHandler,
) -> Result<impl Reply, Infallible> {
    let pending = match handler.poll_model(body).await {
        Ok(pending) => pending,
        Err(e) => return Ok(text_response(e.response_body())),
    };
    Ok(match pending.await {
        Ok(bundle) => match wire::seal_frame(&bundle) {
            Ok(frame) => octet_response(frame),
            Err(e) => {
                error!("failed to seal the artifact frame: {}", e);
                text_response(e.to_string())
            }
        },
        Err(_) => {
            error!("long-poll task dropped before delivering the artifact");
            text_response("global model delivery failed".to_string())
        }
    })
}

/// Handles and responds to an update submission.
async fn handle_update(
    worker_id: String,
    form: FormData,
    handler: ProtocolHandler,
) -> Result<impl Reply, Infallible> {
    let (payload, signed_phrase) = match read_update_form(form).await {
        Ok(parts) => parts,
        Err(message) => {
            warn!("failed to read update submission: {}", message);
            return Ok(text_response(message));
        }
    };
    Ok(
        match handler
            .submit_update(&worker_id, &payload, &signed_phrase)
            .await
        {
            Ok(result) => text_response(result),
            Err(e) => text_response(e.response_body()),
        },
    )
}

/// Handles and responds to an admin request for the worker listing.
async fn handle_admin_list(handler: ProtocolHandler) -> Result<impl Reply, Infallible> {
    Ok(warp::reply::json(&handler.admin_list().await))
}

/// Handles and responds to an admin request to admit a worker.
async fn handle_admin_add(body: Value, handler: ProtocolHandler) -> Result<impl Reply, Infallible> {
    Ok(match handler.admin_add(body).await {
        Ok(record) => warp::reply::json(&record),
        Err(error) => {
            warn!("admin add failed: {}", error);
            warp::reply::json(&AdminError { error })
        }
    })
}

/// Handles and responds to an admin registration status change.
async fn handle_admin_set_status(
    worker_id: String,
    body: Value,
    handler: ProtocolHandler,
) -> Result<impl Reply, Infallible> {
    Ok(match handler.admin_set_status(&worker_id, body).await {
        Ok(record) => warp::reply::json(&record),
        Err(error) => {
            warn!("admin status change failed: {}", error);
            warp::reply::json(&AdminError { error })
        }
    })
}

/// Handles and responds to an admin worker deletion.
async fn handle_admin_delete(
    worker_id: String,
    handler: ProtocolHandler,
) -> Result<impl Reply, Infallible> {
    Ok(match handler.admin_remove(&worker_id).await {
        Ok(removed) => warp::reply::json(&removed),
        Err(error) => {
            warn!("admin delete failed: {}", error);
            warp::reply::json(&AdminError { error })
        }
    })
}

fn text_response(body: String) -> Response<Vec<u8>> {
    // sentinel strings and callback results are served as plain text
    Response::builder()
        .status(StatusCode::OK)
        .body(body.into_bytes())
        .unwrap()
}

fn octet_response(body: Vec<u8>) -> Response<Vec<u8>> {
    Response::builder()
        .header("Content-Type", "application/octet-stream")
        .status(StatusCode::OK)
        .body(body)
        .unwrap()
}

/// Converts the protocol handler into a `warp` filter.
fn with_handler(
    handler: ProtocolHandler,
) -> impl Filter<Extract = (ProtocolHandler,), Error = Infallible> + Clone {
    warp::any().map(move || handler.clone())
}

/// Extracts the compressed payload and its signature from an update
/// submission form. Any read failure is reported as the response body.
async fn read_update_form(form: FormData) -> Result<(Vec<u8>, String), String> {
    let parts: Vec<Part> = form.try_collect().await.map_err(|e| e.to_string())?;
    let mut payload = None;
    let mut signed_phrase = None;
    for part in parts {
        match part.name() {
            WORKER_MODEL_UPDATE_PART => {
                payload = Some(part_bytes(part).await.map_err(|e| e.to_string())?);
            }
            SIGNED_PHRASE_PART => {
                let bytes = part_bytes(part).await.map_err(|e| e.to_string())?;
                signed_phrase = Some(String::from_utf8_lossy(&bytes).into_owned());
            }
            _ => {}
        }
    }
    match (payload, signed_phrase) {
        (Some(payload), Some(signed_phrase)) => Ok((payload, signed_phrase)),
        _ => Err(format!(
            "Invalid input: multipart form requires the parts {:?}",
            [WORKER_MODEL_UPDATE_PART, SIGNED_PHRASE_PART]
        )),
    }
}

/// Buffers one multipart part into memory.
async fn part_bytes(part: Part) -> Result<Vec<u8>, warp::Error> {
    part.stream()
        .try_fold(Vec::new(), |mut acc, buf| {
            acc.put(buf);
            async move { Ok(acc) }
        })
        .await
}

#[derive(Debug)]
struct Unauthorized;

impl warp::reject::Reject for Unauthorized {}

/// Requires HTTP basic auth matching the configured admin credentials.
fn admin_auth(
    admin: Option<AdminSettings>,
) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and_then(move |header: Option<String>| {
            let admin = admin.clone();
            async move {
                if credentials_match(admin.as_ref(), header.as_deref()) {
                    Ok(())
                } else {
                    Err(warp::reject::custom(Unauthorized))
                }
            }
        })
        .untuple_one()
}

fn credentials_match(admin: Option<&AdminSettings>, header: Option<&str>) -> bool {
    let admin = match admin {
        Some(admin) => admin,
        None => return false,
    };
    let encoded = match header.and_then(|h| h.strip_prefix("Basic ")) {
        Some(encoded) => encoded,
        None => return false,
    };
    let decoded = match base64::decode(encoded.trim()) {
        Ok(decoded) => decoded,
        Err(_) => return false,
    };
    let decoded = match String::from_utf8(decoded) {
        Ok(decoded) => decoded,
        Err(_) => return false,
    };
    let mut credentials = decoded.splitn(2, ':');
    match (credentials.next(), credentials.next()) {
        (Some(username), Some(password)) => {
            username == admin.username && password == admin.password
        }
        _ => false,
    }
}

/// Handles `warp` rejections of bad requests.
async fn handle_reject(err: Rejection) -> Result<impl Reply, Infallible> {
    let code = if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if err.find::<Unauthorized>().is_some() {
        StatusCode::UNAUTHORIZED
    } else if err.find::<warp::body::BodyDeserializeError>().is_some() {
        StatusCode::BAD_REQUEST
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        StatusCode::PAYLOAD_TOO_LARGE
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        StatusCode::METHOD_NOT_ALLOWED
    } else {
        error!("unhandled rejection: {:?}", err);
        StatusCode::INTERNAL_SERVER_ERROR
    };
    // reply with empty body; the status code is the interesting part
    Ok(warp::reply::with_status(Vec::new(), code))
}

#[cfg(not(feature = "tls"))]
/// Runs a server with the provided filter routes.
async fn run_http<F>(filter: F, api_settings: ApiSettings) -> Result<(), Infallible>
where
    F: Filter + Clone + Send + Sync + 'static,
    F::Extract: Reply,
{
    warp::serve(filter).run(api_settings.bind_address).await;
    Ok(())
}

#[cfg(feature = "tls")]
/// Runs a TLS server with the provided filter routes, falling back to plain
/// HTTP when no certificate material is configured.
///
/// # Errors
/// Fails fast if only one of certificate/key is set or either file is
/// missing.
async fn run_https<F>(filter: F, api_settings: ApiSettings) -> Result<(), RestError>
where
    F: Filter + Clone + Send + Sync + 'static,
    F::Extract: Reply,
{
    match (&api_settings.tls_certificate, &api_settings.tls_key) {
        (Some(certificate), Some(key)) => {
            if !certificate.is_file() || !key.is_file() {
                return Err(RestError::InvalidTlsConfig);
            }
            warp::serve(filter)
                .tls()
                .cert_path(certificate)
                .key_path(key)
                .run(api_settings.bind_address)
                .await;
            Ok(())
        }
        (None, None) => {
            warp::serve(filter).run(api_settings.bind_address).await;
            Ok(())
        }
        _ => Err(RestError::InvalidTlsConfig),
    }
}
