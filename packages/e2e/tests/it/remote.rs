//! Remote cache tier against an in-process artifact server.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::get,
};
use color_eyre::Result;
use mason::{
    hash::hash_bytes,
    store::{ObjectStore as _, RemoteConfig, RemoteStore},
};
use pretty_assertions::assert_eq;
use url::Url;

const TOKEN: &str = "e2e-bearer-token";

type Objects = Arc<Mutex<HashMap<String, Vec<u8>>>>;

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        == Some(&format!("Bearer {TOKEN}"))
}

async fn get_artifact(
    State(objects): State<Objects>,
    Path(digest): Path<String>,
    headers: HeaderMap,
) -> (StatusCode, Vec<u8>) {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Vec::new());
    }
    match objects.lock().unwrap().get(&digest) {
        Some(bytes) => (StatusCode::OK, bytes.clone()),
        None => (StatusCode::NOT_FOUND, Vec::new()),
    }
}

async fn put_artifact(
    State(objects): State<Objects>,
    Path(digest): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED;
    }
    objects.lock().unwrap().insert(digest, body.to_vec());
    StatusCode::CREATED
}

async fn delete_artifact(
    State(objects): State<Objects>,
    Path(digest): Path<String>,
    headers: HeaderMap,
) -> StatusCode {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED;
    }
    match objects.lock().unwrap().remove(&digest) {
        Some(_) => StatusCode::OK,
        None => StatusCode::NOT_FOUND,
    }
}

/// Serve the artifact API on an ephemeral port from a background thread;
/// returns the bound address and the shared object map.
fn spawn_server() -> Result<(SocketAddr, Objects)> {
    let objects: Objects = Arc::new(Mutex::new(HashMap::new()));
    let app = Router::new()
        .route(
            "/artifacts/{digest}",
            get(get_artifact).put(put_artifact).delete(delete_artifact),
        )
        .with_state(objects.clone());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let listener = runtime.block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))?;
    let addr = listener.local_addr()?;
    std::thread::spawn(move || {
        runtime.block_on(async move {
            let _ = axum::serve(listener, app).await;
        });
    });
    Ok((addr, objects))
}

fn remote(addr: SocketAddr, token: Option<&str>) -> Result<RemoteStore> {
    let config = RemoteConfig::builder()
        .base_url(Url::parse(&format!("http://{addr}/"))?)
        .maybe_token(token.map(String::from))
        .attempts(2)
        .build();
    Ok(RemoteStore::new(config)?)
}

#[test_log::test]
fn remote_round_trip() -> Result<()> {
    let (addr, _objects) = spawn_server()?;
    let store = remote(addr, Some(TOKEN))?;

    let digest = store.put(b"remote artifact bytes")?;
    assert!(store.has(&digest)?);
    assert_eq!(store.get(&digest)?.unwrap(), b"remote artifact bytes");

    store.delete(&digest)?;
    assert!(!store.has(&digest)?);
    assert_eq!(store.get(&digest)?, None);
    Ok(())
}

#[test_log::test]
fn missing_artifact_is_a_miss_not_an_error() -> Result<()> {
    let (addr, _objects) = spawn_server()?;
    let store = remote(addr, Some(TOKEN))?;
    assert_eq!(store.get(&hash_bytes(b"never uploaded"))?, None);
    assert!(!store.has(&hash_bytes(b"never uploaded"))?);
    Ok(())
}

#[test_log::test]
fn bad_token_is_unauthorized() -> Result<()> {
    let (addr, _objects) = spawn_server()?;
    let store = remote(addr, Some("wrong-token"))?;
    let err = store.put(b"nope").unwrap_err();
    assert!(matches!(
        err.kind(),
        mason::BuildErrorKind::CacheUnauthorized
    ));
    Ok(())
}

#[test_log::test]
fn tampered_remote_bytes_fail_digest_verification() -> Result<()> {
    let (addr, objects) = spawn_server()?;
    let store = remote(addr, Some(TOKEN))?;

    let digest = store.put(b"genuine")?;
    // A hostile or broken server swaps the content under the same name.
    objects
        .lock()
        .unwrap()
        .insert(digest.to_hex(), b"swapped".to_vec());

    let err = store.get(&digest).unwrap_err();
    assert!(matches!(
        err.kind(),
        mason::BuildErrorKind::CacheCorrupted { .. }
    ));
    Ok(())
}
