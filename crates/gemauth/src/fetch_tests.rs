// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use axum::http::{HeaderMap as AxumHeaders, StatusCode as AxumStatus, Uri};
use axum::routing::{any, post};
use axum::Router;
use tokio::net::TcpListener;

use super::*;
use crate::config::BrokerConfig;
use crate::credential::store::MemoryStore;

const SCOPE_BODY: &str = r#"{"error":{"code":403,"message":"Request had insufficient authentication scopes.","status":"PERMISSION_DENIED"}}"#;

/// What the mock upstream saw for one request.
#[derive(Debug, Clone)]
struct Seen {
    authorization: Option<String>,
    api_key: Option<String>,
    user_project: Option<String>,
    query: Option<String>,
}

struct Upstream {
    url: String,
    calls: Arc<AtomicU32>,
    seen: Arc<std::sync::Mutex<Vec<Seen>>>,
}

/// API server answering per bearer token via `respond`.
async fn mock_api(respond: fn(Option<&str>) -> (u16, &'static str)) -> Upstream {
    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

    let count = Arc::clone(&calls);
    let log = Arc::clone(&seen);
    let app = Router::new().route(
        "/v1/models",
        any(move |headers: AxumHeaders, uri: Uri| {
            let count = Arc::clone(&count);
            let log = Arc::clone(&log);
            async move {
                count.fetch_add(1, Ordering::Relaxed);
                let header = |name: &str| {
                    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_owned)
                };
                let seen = Seen {
                    authorization: header("authorization"),
                    api_key: header(API_KEY_HEADER),
                    user_project: header(USER_PROJECT_HEADER),
                    query: uri.query().map(str::to_owned),
                };
                let bearer = seen.authorization.clone();
                log.lock().expect("lock").push(seen);
                let (status, body) = respond(bearer.as_deref());
                (AxumStatus::from_u16(status).unwrap_or(AxumStatus::INTERNAL_SERVER_ERROR), body)
            }
        }),
    );
    let addr = serve(app).await;
    Upstream { url: format!("http://{addr}/v1/models"), calls, seen }
}

/// Token endpoint that always answers `(status, body)`.
async fn mock_token(status: u16, body: String) -> (String, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let count = Arc::clone(&calls);
    let app = Router::new().route(
        "/token",
        post(move |_form: String| {
            let count = Arc::clone(&count);
            let body = body.clone();
            async move {
                count.fetch_add(1, Ordering::Relaxed);
                (AxumStatus::from_u16(status).unwrap_or(AxumStatus::INTERNAL_SERVER_ERROR), body)
            }
        }),
    );
    let addr = serve(app).await;
    (format!("http://{addr}/token"), calls)
}

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    addr
}

fn fresh_token(access: &str) -> String {
    serde_json::json!({ "access_token": access, "expires_in": 3600 }).to_string()
}

fn cred(access: Option<&str>, refresh: &str, expires_at: u64) -> Credential {
    Credential {
        access: access.map(String::from),
        refresh: refresh.to_owned(),
        expires_at,
        client_id: None,
        client_secret: None,
        quota_project_id: None,
    }
}

fn far_future() -> u64 {
    epoch_ms() + 3_600_000
}

fn fetcher(
    token_url: &str,
    store: Arc<MemoryStore>,
    sources: Vec<ExternalSource>,
    force_expiry: bool,
) -> AuthenticatedFetch<MemoryStore> {
    crate::ensure_crypto();
    let http = reqwest::Client::new();
    let config = BrokerConfig { token_url: token_url.to_owned(), ..Default::default() };
    AuthenticatedFetch::new(http.clone(), TokenClient::new(http, &config), store, sources, force_expiry)
}

fn no_sources() -> Vec<ExternalSource> {
    vec![ExternalSource::GeminiCli(Vec::new()), ExternalSource::Adc(None)]
}

fn write_adc(dir: &tempfile::TempDir, refresh: &str, quota: Option<&str>) -> anyhow::Result<PathBuf> {
    let path = dir.path().join("application_default_credentials.json");
    let mut json = serde_json::json!({
        "type": "authorized_user",
        "refresh_token": refresh,
        "client_id": "adc-client",
        "client_secret": "adc-secret",
    });
    if let Some(quota) = quota {
        json["quota_project_id"] = serde_json::Value::from(quota);
    }
    std::fs::write(&path, json.to_string())?;
    Ok(path)
}

// -- request shaping -------------------------------------------------------

#[test]
fn prepare_strips_caller_auth_and_injects_bearer() -> anyhow::Result<()> {
    let request = ApiRequest::parse(Method::GET, "https://example.test/v1?key=AIza&alt=json")?
        .with_header(AUTHORIZATION, HeaderValue::from_static("Bearer caller"))
        .with_header(AUTHORIZATION, HeaderValue::from_static("Basic other"))
        .with_header(HeaderName::from_static(API_KEY_HEADER), HeaderValue::from_static("AIza"));

    let mut c = cred(Some("ya29.t"), "r", far_future());
    c.quota_project_id = Some("my-proj".into());
    let prepared = prepare(&request, &c)?;

    let auth: Vec<_> = prepared.headers.get_all(AUTHORIZATION).iter().collect();
    assert_eq!(auth, vec![&HeaderValue::from_static("Bearer ya29.t")]);
    assert!(prepared.headers.get(API_KEY_HEADER).is_none());
    assert_eq!(
        prepared.headers.get(USER_PROJECT_HEADER).and_then(|v| v.to_str().ok()),
        Some("my-proj")
    );
    assert_eq!(prepared.url.query(), Some("alt=json"));
    // The original is left alone for replays.
    assert!(request.headers.get(API_KEY_HEADER).is_some());
    Ok(())
}

#[test]
fn prepare_drops_empty_query() -> anyhow::Result<()> {
    let request = ApiRequest::parse(Method::POST, "https://example.test/v1?key=AIza")?;
    let prepared = prepare(&request, &cred(Some("a"), "r", 0))?;
    assert_eq!(prepared.url.as_str(), "https://example.test/v1");
    Ok(())
}

#[test]
fn prepare_without_access_sends_no_bearer() -> anyhow::Result<()> {
    let request = ApiRequest::parse(Method::GET, "https://example.test/v1")?
        .with_header(AUTHORIZATION, HeaderValue::from_static("Bearer caller"));
    let prepared = prepare(&request, &cred(None, "r", 0))?;
    assert!(prepared.headers.get(AUTHORIZATION).is_none());
    Ok(())
}

#[yare::parameterized(
    scope_403 = { 403, SCOPE_BODY, true },
    uppercase_marker = { 403, "INSUFFICIENT AUTHENTICATION SCOPES", true },
    other_403 = { 403, "permission denied on resource", false },
    scope_text_on_400 = { 400, SCOPE_BODY, false },
    ok = { 200, "{}", false },
)]
fn detects_scope_errors(status: u16, body: &'static str, expected: bool) {
    let response = ApiResponse {
        status: StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
        headers: HeaderMap::new(),
        body: Bytes::from_static(body.as_bytes()),
    };
    assert_eq!(is_scope_error(&response), expected);
}

// -- state machine ---------------------------------------------------------

#[tokio::test]
async fn scope_error_recovers_via_adc_with_one_retry() -> anyhow::Result<()> {
    let api = mock_api(|bearer| match bearer {
        Some("Bearer adc-fresh") => (200, r#"{"models":[]}"#),
        _ => (403, SCOPE_BODY),
    })
    .await;
    let (token_url, token_calls) = mock_token(200, fresh_token("adc-fresh")).await;
    let dir = tempfile::tempdir()?;
    let adc = write_adc(&dir, "adc-refresh", Some("quota-proj"))?;

    let store = Arc::new(MemoryStore::with(PROVIDER_ID, cred(Some("narrow"), "r", far_future())));
    let fetch = fetcher(
        &token_url,
        Arc::clone(&store),
        vec![ExternalSource::GeminiCli(Vec::new()), ExternalSource::Adc(Some(adc))],
        false,
    );

    let response = fetch.execute(&ApiRequest::parse(Method::GET, &api.url)?).await?;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(api.calls.load(Ordering::Relaxed), 2);
    assert_eq!(token_calls.load(Ordering::Relaxed), 1);

    let seen = api.seen.lock().expect("lock").clone();
    assert_eq!(seen[0].authorization.as_deref(), Some("Bearer narrow"));
    assert_eq!(seen[1].authorization.as_deref(), Some("Bearer adc-fresh"));
    assert_eq!(seen[1].user_project.as_deref(), Some("quota-proj"));

    let stored = store.get(PROVIDER_ID).await?.ok_or_else(|| anyhow::anyhow!("not persisted"))?;
    assert_eq!(stored.access.as_deref(), Some("adc-fresh"));
    assert_eq!(stored.refresh, "adc-refresh");
    assert_eq!(stored.client_id.as_deref(), Some("adc-client"));
    Ok(())
}

#[tokio::test]
async fn scope_error_without_recovery_returns_original() -> anyhow::Result<()> {
    let api = mock_api(|_| (403, SCOPE_BODY)).await;
    let (token_url, token_calls) = mock_token(200, fresh_token("unused")).await;
    let store = Arc::new(MemoryStore::with(PROVIDER_ID, cred(Some("narrow"), "r", far_future())));
    let fetch = fetcher(&token_url, Arc::clone(&store), no_sources(), false);

    let response = fetch.execute(&ApiRequest::parse(Method::GET, &api.url)?).await?;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert_eq!(response.text(), SCOPE_BODY);
    assert_eq!(api.calls.load(Ordering::Relaxed), 1);
    assert_eq!(token_calls.load(Ordering::Relaxed), 0);
    assert_eq!(store.writes(), 0);
    Ok(())
}

#[tokio::test]
async fn scope_error_persisting_through_every_source_returns_original() -> anyhow::Result<()> {
    let api = mock_api(|_| (403, SCOPE_BODY)).await;
    let (token_url, token_calls) = mock_token(200, fresh_token("still-narrow")).await;
    let dir = tempfile::tempdir()?;
    let adc = write_adc(&dir, "adc-refresh", None)?;

    let store = Arc::new(MemoryStore::with(PROVIDER_ID, cred(Some("narrow"), "r", far_future())));
    let fetch = fetcher(
        &token_url,
        store,
        vec![ExternalSource::GeminiCli(Vec::new()), ExternalSource::Adc(Some(adc))],
        false,
    );

    let response = fetch.execute(&ApiRequest::parse(Method::GET, &api.url)?).await?;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert_eq!(api.calls.load(Ordering::Relaxed), 2);
    assert_eq!(token_calls.load(Ordering::Relaxed), 1);
    Ok(())
}

#[tokio::test]
async fn unauthorized_with_failed_refresh_returns_original() -> anyhow::Result<()> {
    let api = mock_api(|_| (401, r#"{"error":"unauthenticated"}"#)).await;
    let (token_url, token_calls) = mock_token(400, r#"{"error":"invalid_grant"}"#.into()).await;
    let store = Arc::new(MemoryStore::with(PROVIDER_ID, cred(Some("dead"), "r", far_future())));
    let fetch = fetcher(&token_url, Arc::clone(&store), no_sources(), false);

    let response = fetch.execute(&ApiRequest::parse(Method::GET, &api.url)?).await?;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.text(), r#"{"error":"unauthenticated"}"#);
    assert_eq!(api.calls.load(Ordering::Relaxed), 1);
    assert_eq!(token_calls.load(Ordering::Relaxed), 1);
    assert_eq!(store.writes(), 0);
    Ok(())
}

#[tokio::test]
async fn unauthorized_retries_exactly_once() -> anyhow::Result<()> {
    let api = mock_api(|_| (401, "nope")).await;
    let (token_url, token_calls) = mock_token(200, fresh_token("renewed")).await;
    let store = Arc::new(MemoryStore::with(PROVIDER_ID, cred(Some("dead"), "r", far_future())));
    let fetch = fetcher(&token_url, Arc::clone(&store), no_sources(), false);

    let response = fetch.execute(&ApiRequest::parse(Method::GET, &api.url)?).await?;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(api.calls.load(Ordering::Relaxed), 2);
    assert_eq!(token_calls.load(Ordering::Relaxed), 1);

    let seen = api.seen.lock().expect("lock").clone();
    assert_eq!(seen[1].authorization.as_deref(), Some("Bearer renewed"));
    assert_eq!(store.writes(), 1);
    Ok(())
}

#[tokio::test]
async fn expired_token_is_refreshed_before_sending() -> anyhow::Result<()> {
    let api = mock_api(|_| (200, "{}")).await;
    let (token_url, token_calls) = mock_token(200, fresh_token("renewed")).await;
    let store = Arc::new(MemoryStore::with(PROVIDER_ID, cred(Some("old"), "r", 1)));
    let fetch = fetcher(&token_url, Arc::clone(&store), no_sources(), false);

    let response = fetch.execute(&ApiRequest::parse(Method::GET, &api.url)?).await?;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(token_calls.load(Ordering::Relaxed), 1);
    let seen = api.seen.lock().expect("lock").clone();
    assert_eq!(seen[0].authorization.as_deref(), Some("Bearer renewed"));

    let stored = store.get(PROVIDER_ID).await?.ok_or_else(|| anyhow::anyhow!("missing"))?;
    assert_eq!(stored.access.as_deref(), Some("renewed"));
    assert_eq!(stored.refresh, "r");
    assert!(stored.expires_at > epoch_ms());
    Ok(())
}

#[tokio::test]
async fn forced_expiry_refreshes_fresh_tokens() -> anyhow::Result<()> {
    let api = mock_api(|_| (200, "{}")).await;
    let (token_url, token_calls) = mock_token(200, fresh_token("forced")).await;
    let store = Arc::new(MemoryStore::with(PROVIDER_ID, cred(Some("fine"), "r", far_future())));
    let fetch = fetcher(&token_url, store, no_sources(), true);

    fetch.execute(&ApiRequest::parse(Method::GET, &api.url)?).await?;
    assert_eq!(token_calls.load(Ordering::Relaxed), 1);
    let seen = api.seen.lock().expect("lock").clone();
    assert_eq!(seen[0].authorization.as_deref(), Some("Bearer forced"));
    Ok(())
}

#[tokio::test]
async fn access_only_credential_is_used_without_refresh() -> anyhow::Result<()> {
    let api = mock_api(|_| (200, "{}")).await;
    let (token_url, token_calls) = mock_token(200, fresh_token("never")).await;
    let store = Arc::new(MemoryStore::with(PROVIDER_ID, Credential::access_only("imported".into(), 1)));
    let fetch = fetcher(&token_url, store, no_sources(), false);

    let response = fetch.execute(&ApiRequest::parse(Method::GET, &api.url)?).await?;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(token_calls.load(Ordering::Relaxed), 0);
    let seen = api.seen.lock().expect("lock").clone();
    assert_eq!(seen[0].authorization.as_deref(), Some("Bearer imported"));
    Ok(())
}

#[tokio::test]
async fn outbound_request_drops_api_key() -> anyhow::Result<()> {
    let api = mock_api(|_| (200, "{}")).await;
    let (token_url, _) = mock_token(200, fresh_token("unused")).await;
    let store = Arc::new(MemoryStore::with(PROVIDER_ID, cred(Some("tok"), "r", far_future())));
    let fetch = fetcher(&token_url, store, no_sources(), false);

    let request = ApiRequest::parse(Method::GET, &format!("{}?key=AIza&pageSize=5", api.url))?
        .with_header(HeaderName::from_static(API_KEY_HEADER), HeaderValue::from_static("AIza"));
    fetch.execute(&request).await?;

    let seen = api.seen.lock().expect("lock").clone();
    assert_eq!(seen[0].api_key, None);
    assert_eq!(seen[0].query.as_deref(), Some("pageSize=5"));
    assert_eq!(seen[0].authorization.as_deref(), Some("Bearer tok"));
    Ok(())
}

#[tokio::test]
async fn no_credential_passes_request_through() -> anyhow::Result<()> {
    let api = mock_api(|_| (200, "{}")).await;
    let (token_url, token_calls) = mock_token(200, fresh_token("unused")).await;
    let fetch = fetcher(&token_url, Arc::new(MemoryStore::new()), no_sources(), false);

    let request = ApiRequest::parse(Method::GET, &format!("{}?key=AIza", api.url))?
        .with_header(HeaderName::from_static(API_KEY_HEADER), HeaderValue::from_static("AIza"));
    let response = fetch.execute(&request).await?;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(token_calls.load(Ordering::Relaxed), 0);

    let seen = api.seen.lock().expect("lock").clone();
    assert_eq!(seen[0].api_key.as_deref(), Some("AIza"));
    assert_eq!(seen[0].query.as_deref(), Some("key=AIza"));
    assert_eq!(seen[0].authorization, None);
    Ok(())
}

#[tokio::test]
async fn other_errors_are_returned_untouched() -> anyhow::Result<()> {
    let api = mock_api(|_| (500, "boom")).await;
    let (token_url, token_calls) = mock_token(200, fresh_token("unused")).await;
    let store = Arc::new(MemoryStore::with(PROVIDER_ID, cred(Some("tok"), "r", far_future())));
    let fetch = fetcher(&token_url, store, no_sources(), false);

    let response = fetch.execute(&ApiRequest::parse(Method::GET, &api.url)?).await?;
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.text(), "boom");
    assert_eq!(api.calls.load(Ordering::Relaxed), 1);
    assert_eq!(token_calls.load(Ordering::Relaxed), 0);
    Ok(())
}
