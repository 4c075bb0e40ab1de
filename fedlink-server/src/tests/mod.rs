//! End-to-end tests of the protocol surface, driven through the warp
//! filters without binding a socket.


use std::{sync::atomic::Ordering, sync::Arc, time::Duration};

use serde_json::{json, Value};
use warp::http::StatusCode;

use fedlink_core::{
    crypto::{ByteObject, Sha256, SigningKeyPair},
    wire::{self, WorkerRecord, SIGNED_PHRASE_PART, WORKER_MODEL_UPDATE_PART},
    WorkerId,
    INVALID_WORKER,
    UNREGISTERED_WORKER,
};

use self::mock::MockFederation;
use crate::{
    auth::Authenticator,
    poll::LongPollCoordinator,
    registry::{store::IdentityStore, WorkerRegistry},
    rest,
    services::ProtocolHandler,
    settings::AdminSettings,
};

const CHECK_INTERVAL: Duration = Duration::from_millis(10);

fn admin_settings() -> AdminSettings {
    AdminSettings {
        username: "admin".to_string(),
        password: "str0ng_s3cr3t".to_string(),
    }
}

fn admin_header() -> String {
    format!("Basic {}", base64::encode("admin:str0ng_s3cr3t"))
}

fn handler(
    federation: Arc<MockFederation>,
    safe_mode: bool,
    key_list: &[String],
) -> ProtocolHandler {
    handler_with_store(federation, safe_mode, key_list, None, false)
}

fn handler_with_store(
    federation: Arc<MockFederation>,
    safe_mode: bool,
    key_list: &[String],
    store: Option<IdentityStore>,
    load_last_session: bool,
) -> ProtocolHandler {
    let authenticator = Arc::new(Authenticator::new(safe_mode));
    let registry = Arc::new(
        WorkerRegistry::new(
            federation.clone(),
            authenticator.clone(),
            store,
            load_last_session,
            key_list,
        )
        .unwrap(),
    );
    let coordinator = LongPollCoordinator::new(federation.clone(), CHECK_INTERVAL);
    ProtocolHandler::from_parts(registry, authenticator, coordinator, federation)
}

/// Runs the full challenge/sign/register exchange and returns the response
/// body (the worker id on success, a sentinel otherwise).
async fn register_worker<F>(filter: &F, keys: &SigningKeyPair) -> String
where
    F: warp::Filter + 'static,
    F::Extract: warp::Reply + Send,
{
    let pk_hex = keys.public.to_hex();
    let challenge = warp::test::request()
        .method("GET")
        .path(&format!("/challenge_phrase/{}", pk_hex))
        .reply(filter)
        .await;
    let signed = keys.secret.sign_detached(challenge.body()).to_hex();
    let response = warp::test::request()
        .method("POST")
        .path("/register_worker")
        .json(&json!({ "public_key_str": pk_hex, "signed_phrase": signed }))
        .reply(filter)
        .await;
    String::from_utf8(response.body().to_vec()).unwrap()
}

fn multipart_body(boundary: &str, parts: &[(&str, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, data) in parts {
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            format!("content-disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
    body
}

/// Submits `payload` for `worker_id`, signed with `keys`, and returns the
/// response body.
async fn submit_update<F>(
    filter: &F,
    worker_id: &str,
    keys: &SigningKeyPair,
    payload: &[u8],
) -> String
where
    F: warp::Filter + 'static,
    F::Extract: warp::Reply + Send,
{
    let compressed = wire::compress(payload).unwrap();
    let signed = keys
        .secret
        .sign_detached(Sha256::hash(payload).as_slice())
        .to_hex();
    let body = multipart_body(
        "fedlink-test-boundary",
        &[
            (WORKER_MODEL_UPDATE_PART, &compressed),
            (SIGNED_PHRASE_PART, signed.as_bytes()),
        ],
    );
    let response = warp::test::request()
        .method("POST")
        .path(&format!("/receive_worker_update/{}", worker_id))
        .header(
            "content-type",
            "multipart/form-data; boundary=fedlink-test-boundary",
        )
        .body(body)
        .reply(filter)
        .await;
    String::from_utf8(response.body().to_vec()).unwrap()
}

#[tokio::test]
async fn test_challenge_phrases_are_opaque_and_fresh() {
    let federation = MockFederation::new("1", b"artifact");
    let filter = rest::routes(handler(federation, true, &[]), None);

    let first = warp::test::request()
        .method("GET")
        .path("/challenge_phrase/some_worker")
        .reply(&filter)
        .await;
    let second = warp::test::request()
        .method("GET")
        .path("/challenge_phrase/some_worker")
        .reply(&filter)
        .await;

    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()["content-type"], "application/octet-stream");
    assert_eq!(first.body().len(), crate::auth::CHALLENGE_LENGTH);
    assert_ne!(first.body(), second.body());
}

#[tokio::test]
async fn test_reregistration_is_idempotent() {
    let federation = MockFederation::new("1", b"artifact");
    let keys = SigningKeyPair::generate();
    let filter = rest::routes(
        handler(federation.clone(), true, &[keys.public.to_hex()]),
        None,
    );

    let first = register_worker(&filter, &keys).await;
    assert_eq!(first, keys.public.to_hex());
    assert_eq!(federation.register_events.load(Ordering::SeqCst), 1);

    let second = register_worker(&filter, &keys).await;
    assert_eq!(second, first);
    // no second register event for an already-registered identity
    assert_eq!(federation.register_events.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_captured_registration_cannot_be_replayed() {
    let federation = MockFederation::new("1", b"artifact");
    let keys = SigningKeyPair::generate();
    let filter = rest::routes(
        handler(federation, true, &[keys.public.to_hex()]),
        None,
    );
    let pk_hex = keys.public.to_hex();

    let challenge = warp::test::request()
        .method("GET")
        .path(&format!("/challenge_phrase/{}", pk_hex))
        .reply(&filter)
        .await;
    let signed = keys.secret.sign_detached(challenge.body()).to_hex();
    let body = json!({ "public_key_str": pk_hex, "signed_phrase": signed });

    let response = warp::test::request()
        .method("POST")
        .path("/register_worker")
        .json(&body)
        .reply(&filter)
        .await;
    assert_eq!(response.body().as_ref(), pk_hex.as_bytes());

    // the captured pair resubmitted verbatim: the phrase was consumed
    let replay = warp::test::request()
        .method("POST")
        .path("/register_worker")
        .json(&body)
        .reply(&filter)
        .await;
    assert_eq!(replay.body().as_ref(), INVALID_WORKER.as_bytes());

    // even a freshly issued challenge does not resurrect the old signature
    warp::test::request()
        .method("GET")
        .path(&format!("/challenge_phrase/{}", pk_hex))
        .reply(&filter)
        .await;
    let replay = warp::test::request()
        .method("POST")
        .path("/register_worker")
        .json(&body)
        .reply(&filter)
        .await;
    assert_eq!(replay.body().as_ref(), INVALID_WORKER.as_bytes());
}

#[tokio::test]
async fn test_safe_mode_rejects_keys_outside_the_allow_list() {
    let federation = MockFederation::new("1", b"artifact");

    // empty allow-list: everybody is rejected
    let filter = rest::routes(handler(federation.clone(), true, &[]), None);
    let outsider = SigningKeyPair::generate();
    assert_eq!(register_worker(&filter, &outsider).await, INVALID_WORKER);

    // two admitted keys, a third one stays rejected
    let admitted: Vec<_> = (0..2).map(|_| SigningKeyPair::generate()).collect();
    let key_list: Vec<_> = admitted.iter().map(|k| k.public.to_hex()).collect();
    let filter = rest::routes(handler(federation, true, &key_list), None);
    for keys in &admitted {
        assert_eq!(register_worker(&filter, keys).await, keys.public.to_hex());
    }
    assert_eq!(register_worker(&filter, &outsider).await, INVALID_WORKER);
}

#[tokio::test]
async fn test_unsafe_mode_allocates_unauthenticated_ids() {
    let federation = MockFederation::new("1", b"artifact");
    let filter = rest::routes(handler(federation, false, &[]), None);

    let register = || async {
        let response = warp::test::request()
            .method("POST")
            .path("/register_worker")
            .json(&json!({
                "public_key_str": "dummy_public_key",
                "signed_phrase": "dummy_signed_phrase"
            }))
            .reply(&filter)
            .await;
        String::from_utf8(response.body().to_vec()).unwrap()
    };

    let first = register().await;
    let second = register().await;
    assert!(first.contains("unauthenticated"));
    // client-submitted identity strings are never trusted, so equal inputs
    // still yield distinct workers
    assert_ne!(first, second);
}

#[tokio::test]
async fn test_registration_validates_fields_before_touching_state() {
    let federation = MockFederation::new("1", b"artifact");
    let filter = rest::routes(handler(federation.clone(), false, &[]), None);

    let response = warp::test::request()
        .method("POST")
        .path("/register_worker")
        .json(&json!({ "signed_phrase": "sig" }))
        .reply(&filter)
        .await;
    let body = String::from_utf8(response.body().to_vec()).unwrap();
    assert!(body.contains("public_key_str"));
    assert_eq!(federation.register_events.load(Ordering::SeqCst), 0);

    // wrong type is reported the same way as absence
    let response = warp::test::request()
        .method("POST")
        .path("/register_worker")
        .json(&json!({ "public_key_str": 42 }))
        .reply(&filter)
        .await;
    let body = String::from_utf8(response.body().to_vec()).unwrap();
    assert!(body.contains("public_key_str"));
}

#[tokio::test]
async fn test_long_poll_delivers_the_bumped_version_to_all_waiters() {
    let federation = MockFederation::new("1", b"artifact");
    let filter = rest::routes(handler(federation.clone(), false, &[]), None);

    let register = || async {
        let response = warp::test::request()
            .method("POST")
            .path("/register_worker")
            .json(&json!({ "public_key_str": "ignored" }))
            .reply(&filter)
            .await;
        String::from_utf8(response.body().to_vec()).unwrap()
    };
    let first = register().await;
    let second = register().await;

    let poll = |worker_id: String| {
        let filter = filter.clone();
        async move {
            warp::test::request()
                .method("POST")
                .path("/return_global_model")
                .json(&json!({
                    "worker_id": worker_id,
                    "last_worker_model_version": "1"
                }))
                .reply(&filter)
                .await
        }
    };
    let bump = async {
        tokio::time::delay_for(CHECK_INTERVAL * 3).await;
        federation.set_version("2");
    };

    let (first_reply, second_reply, _) = tokio::join!(poll(first), poll(second), bump);
    for reply in &[first_reply, second_reply] {
        let bundle = wire::open_frame(reply.body()).unwrap();
        assert_eq!(bundle.version, "2".into());
        assert_eq!(bundle.model, b"artifact".to_vec());
    }
}

#[tokio::test]
async fn test_poll_with_stale_version_returns_immediately() {
    let federation = MockFederation::new("2", b"artifact");
    let filter = rest::routes(handler(federation, false, &[]), None);

    let response = warp::test::request()
        .method("POST")
        .path("/register_worker")
        .json(&json!({ "public_key_str": "ignored" }))
        .reply(&filter)
        .await;
    let worker_id = String::from_utf8(response.body().to_vec()).unwrap();

    let reply = warp::test::request()
        .method("POST")
        .path("/return_global_model")
        .json(&json!({
            "worker_id": worker_id,
            "last_worker_model_version": "1"
        }))
        .reply(&filter)
        .await;
    assert_eq!(wire::open_frame(reply.body()).unwrap().version, "2".into());
}

#[tokio::test]
async fn test_update_roundtrip_then_admin_delete_invalidates() {
    let federation = MockFederation::new("1", b"artifact");
    let keys = SigningKeyPair::generate();
    let filter = rest::routes(
        handler(federation.clone(), true, &[keys.public.to_hex()]),
        Some(admin_settings()),
    );

    let worker_id = register_worker(&filter, &keys).await;
    let response = submit_update(&filter, &worker_id, &keys, b"payload").await;
    assert_eq!(response, format!("Update received for worker {}", worker_id));
    assert_eq!(
        federation.update_for(&WorkerId::from(worker_id.as_str())),
        Some(b"payload".to_vec())
    );

    let deleted = warp::test::request()
        .method("DELETE")
        .path(&format!("/workers/{}", worker_id))
        .header("authorization", admin_header())
        .reply(&filter)
        .await;
    assert_eq!(deleted.status(), StatusCode::OK);
    let removed: wire::AdminRemoved = serde_json::from_slice(deleted.body()).unwrap();
    assert!(removed.success);

    // the very same submission now reports an unknown worker
    let response = submit_update(&filter, &worker_id, &keys, b"payload").await;
    assert_eq!(response, INVALID_WORKER);
}

#[tokio::test]
async fn test_update_with_wrong_signature_is_rejected() {
    let federation = MockFederation::new("1", b"artifact");
    let keys = SigningKeyPair::generate();
    let filter = rest::routes(
        handler(federation.clone(), true, &[keys.public.to_hex()]),
        None,
    );
    let worker_id = register_worker(&filter, &keys).await;

    // signed by somebody else
    let impostor = SigningKeyPair::generate();
    let response = submit_update(&filter, &worker_id, &impostor, b"payload").await;
    assert_eq!(response, INVALID_WORKER);
    assert_eq!(
        federation.update_for(&WorkerId::from(worker_id.as_str())),
        None
    );
}

#[tokio::test]
async fn test_corrupt_update_payload_reports_the_failure() {
    let federation = MockFederation::new("1", b"artifact");
    let keys = SigningKeyPair::generate();
    let filter = rest::routes(
        handler(federation, true, &[keys.public.to_hex()]),
        None,
    );
    let worker_id = register_worker(&filter, &keys).await;

    let signed = keys
        .secret
        .sign_detached(Sha256::hash(b"junk").as_slice())
        .to_hex();
    let body = multipart_body(
        "fedlink-test-boundary",
        &[
            (WORKER_MODEL_UPDATE_PART, b"definitely not zlib"),
            (SIGNED_PHRASE_PART, signed.as_bytes()),
        ],
    );
    let response = warp::test::request()
        .method("POST")
        .path(&format!("/receive_worker_update/{}", worker_id))
        .header(
            "content-type",
            "multipart/form-data; boundary=fedlink-test-boundary",
        )
        .body(body)
        .reply(&filter)
        .await;
    let text = String::from_utf8(response.body().to_vec()).unwrap();
    assert!(text.contains("decompress"));
}

#[tokio::test]
async fn test_unregistered_worker_is_rejected_on_both_paths() {
    let federation = MockFederation::new("1", b"artifact");
    let keys = SigningKeyPair::generate();
    let filter = rest::routes(
        handler(federation.clone(), true, &[keys.public.to_hex()]),
        Some(admin_settings()),
    );
    let worker_id = register_worker(&filter, &keys).await;

    let set_status = |registered: bool| {
        let filter = filter.clone();
        let worker_id = worker_id.clone();
        async move {
            warp::test::request()
                .method("PUT")
                .path(&format!("/workers/{}", worker_id))
                .header("authorization", admin_header())
                .json(&json!({ "registered": registered }))
                .reply(&filter)
                .await
        }
    };

    let reply = set_status(false).await;
    let record: WorkerRecord = serde_json::from_slice(reply.body()).unwrap();
    assert!(!record.registered);

    assert_eq!(
        submit_update(&filter, &worker_id, &keys, b"payload").await,
        UNREGISTERED_WORKER
    );
    let poll = warp::test::request()
        .method("POST")
        .path("/return_global_model")
        .json(&json!({
            "worker_id": worker_id,
            "last_worker_model_version": "0"
        }))
        .reply(&filter)
        .await;
    assert_eq!(poll.body().as_ref(), UNREGISTERED_WORKER.as_bytes());

    // re-enabling restores both paths without re-authentication
    let reply = set_status(true).await;
    let record: WorkerRecord = serde_json::from_slice(reply.body()).unwrap();
    assert!(record.registered);
    assert_eq!(
        submit_update(&filter, &worker_id, &keys, b"payload").await,
        format!("Update received for worker {}", worker_id)
    );
    assert_eq!(federation.register_events.load(Ordering::SeqCst), 2);
    assert_eq!(federation.unregister_events.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_admin_workers_crud_and_persistence_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let keys: Vec<_> = (0..3).map(|_| SigningKeyPair::generate()).collect();

    let listing_before = {
        let federation = MockFederation::new("1", b"artifact");
        let filter = rest::routes(
            handler_with_store(
                federation,
                true,
                &[],
                Some(IdentityStore::open(dir.path()).unwrap()),
                true,
            ),
            Some(admin_settings()),
        );

        for (n, key) in keys.iter().enumerate() {
            let reply = warp::test::request()
                .method("POST")
                .path("/workers")
                .header("authorization", admin_header())
                .json(&json!({
                    "public_key_str": key.public.to_hex(),
                    "registered": n != 2
                }))
                .reply(&filter)
                .await;
            let record: WorkerRecord = serde_json::from_slice(reply.body()).unwrap();
            assert_eq!(record.worker_id, WorkerId::from_public_key(&key.public));
            assert_eq!(record.registered, n != 2);
        }

        // adding the same key again is refused
        let reply = warp::test::request()
            .method("POST")
            .path("/workers")
            .header("authorization", admin_header())
            .json(&json!({
                "public_key_str": keys[0].public.to_hex(),
                "registered": true
            }))
            .reply(&filter)
            .await;
        let body: Value = serde_json::from_slice(reply.body()).unwrap();
        assert!(body["error"].as_str().unwrap().contains("already exists"));

        let listing = warp::test::request()
            .method("GET")
            .path("/workers")
            .header("authorization", admin_header())
            .reply(&filter)
            .await;
        let listing: Vec<WorkerRecord> = serde_json::from_slice(listing.body()).unwrap();
        assert_eq!(listing.len(), 3);
        listing
    };

    // a restarted server reloads the identical allow-list and registration set
    let federation = MockFederation::new("1", b"artifact");
    let filter = rest::routes(
        handler_with_store(
            federation,
            true,
            &[],
            Some(IdentityStore::open(dir.path()).unwrap()),
            true,
        ),
        Some(admin_settings()),
    );
    let listing = warp::test::request()
        .method("GET")
        .path("/workers")
        .header("authorization", admin_header())
        .reply(&filter)
        .await;
    let listing: Vec<WorkerRecord> = serde_json::from_slice(listing.body()).unwrap();
    assert_eq!(listing, listing_before);
}

#[tokio::test]
async fn test_admin_add_rejects_undecodable_keys_in_safe_mode() {
    let federation = MockFederation::new("1", b"artifact");
    let filter = rest::routes(handler(federation, true, &[]), Some(admin_settings()));

    let reply = warp::test::request()
        .method("POST")
        .path("/workers")
        .header("authorization", admin_header())
        .json(&json!({ "public_key_str": "dummy public key", "registered": true }))
        .reply(&filter)
        .await;
    let body: Value = serde_json::from_slice(reply.body()).unwrap();
    assert_eq!(
        body["error"].as_str().unwrap(),
        "Unable to validate public key for dummy public key - worker not added."
    );
}

#[tokio::test]
async fn test_admin_body_validation_names_the_fields() {
    let federation = MockFederation::new("1", b"artifact");
    let filter = rest::routes(handler(federation, true, &[]), Some(admin_settings()));

    let reply = warp::test::request()
        .method("POST")
        .path("/workers")
        .header("authorization", admin_header())
        .json(&json!({ "public_key_str": "aa" }))
        .reply(&filter)
        .await;
    let body: Value = serde_json::from_slice(reply.body()).unwrap();
    assert!(body["error"].as_str().unwrap().contains("registered"));
}

#[tokio::test]
async fn test_admin_routes_require_credentials() {
    let federation = MockFederation::new("1", b"artifact");
    let filter = rest::routes(
        handler(federation.clone(), true, &[]),
        Some(admin_settings()),
    );

    let reply = warp::test::request()
        .method("GET")
        .path("/workers")
        .reply(&filter)
        .await;
    assert_eq!(reply.status(), StatusCode::UNAUTHORIZED);

    let reply = warp::test::request()
        .method("GET")
        .path("/workers")
        .header(
            "authorization",
            format!("Basic {}", base64::encode("admin:wrong")),
        )
        .reply(&filter)
        .await;
    assert_eq!(reply.status(), StatusCode::UNAUTHORIZED);

    let reply = warp::test::request()
        .method("GET")
        .path("/workers")
        .header("authorization", admin_header())
        .reply(&filter)
        .await;
    assert_eq!(reply.status(), StatusCode::OK);

    // without configured credentials everything is rejected
    let filter = rest::routes(handler(federation, true, &[]), None);
    let reply = warp::test::request()
        .method("GET")
        .path("/workers")
        .header("authorization", admin_header())
        .reply(&filter)
        .await;
    assert_eq!(reply.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_admin_set_status_on_unknown_worker_reports_error() {
    let federation = MockFederation::new("1", b"artifact");
    let filter = rest::routes(handler(federation, true, &[]), Some(admin_settings()));

    let reply = warp::test::request()
        .method("PUT")
        .path("/workers/nobody")
        .header("authorization", admin_header())
        .json(&json!({ "registered": true }))
        .reply(&filter)
        .await;
    let body: Value = serde_json::from_slice(reply.body()).unwrap();
    assert!(body["error"].as_str().unwrap().contains("nobody"));
}

#[tokio::test]
async fn test_responses_permit_cross_origin_access() {
    let federation = MockFederation::new("1", b"artifact");
    let filter = rest::routes(handler(federation, false, &[]), None);

    let reply = warp::test::request()
        .method("OPTIONS")
        .path("/register_worker")
        .header("origin", "https://dashboard.example")
        .header("access-control-request-method", "POST")
        .reply(&filter)
        .await;
    assert_eq!(reply.status(), StatusCode::OK);
    assert!(reply.headers().contains_key("access-control-allow-origin"));
}
