//! API Handlers
//!
//! HTTP request handlers for each worker endpoint. Every handler works on a
//! request-scoped view of the shared cache, so TTL accounting within one
//! request sees a single timestamp.

use axum::{
    extract::{Path, State},
    Json,
};

use crate::cache::CacheStore;
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::models::{
    CasRequest, ExistsResponse, FetchResponse, HealthResponse, KeyResponse, MessageResponse,
    StatsResponse, StepRequest, StoreRequest, UpdateResponse,
};

/// Application state shared across all handlers.
///
/// The cache synchronizes through locks living in the shared arena, so the
/// handle is cloned into each handler as is.
#[derive(Clone)]
pub struct AppState {
    /// Handle on the shared cache
    pub cache: CacheStore,
}

impl AppState {
    /// Creates a new AppState with the given cache store.
    pub fn new(cache: CacheStore) -> Self {
        Self { cache }
    }

    /// Creates a new AppState from configuration.
    ///
    /// Creates the named arena or attaches to the one another worker set up.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(CacheStore::from_config(config)?))
    }
}

/// Runs a cache call on the blocking pool.
///
/// Arena locks park the calling thread, for up to the lock timeout when a
/// holder died, so they are never taken on a runtime worker. The request
/// clock starts before the hop.
async fn blocking<T, F>(cache: &CacheStore, call: F) -> Result<T>
where
    F: FnOnce(CacheStore) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let cache = cache.begin_request();
    tokio::task::spawn_blocking(move || call(cache)).await?
}

/// Handler for PUT /store
///
/// Stores a key-value pair, replacing any existing entry.
pub async fn store_handler(
    State(state): State<AppState>,
    Json(req): Json<StoreRequest>,
) -> Result<Json<KeyResponse>> {
    if let Some(error_msg) = req.validate() {
        return Err(CacheError::InvalidKey(error_msg));
    }

    let StoreRequest { key, value, ttl } = req;
    let key = blocking(&state.cache, move |cache| {
        cache.store(&key, &value, ttl.unwrap_or(0)).map(|()| key)
    })
    .await?;

    Ok(Json(KeyResponse::stored(key)))
}

/// Handler for PUT /add
///
/// Stores a key-value pair only if no live entry holds the key.
pub async fn add_handler(
    State(state): State<AppState>,
    Json(req): Json<StoreRequest>,
) -> Result<Json<KeyResponse>> {
    if let Some(error_msg) = req.validate() {
        return Err(CacheError::InvalidKey(error_msg));
    }

    let StoreRequest { key, value, ttl } = req;
    let key = blocking(&state.cache, move |cache| {
        cache.add(&key, &value, ttl.unwrap_or(0)).map(|()| key)
    })
    .await?;

    Ok(Json(KeyResponse::stored(key)))
}

/// Handler for GET /fetch/:key
pub async fn fetch_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<FetchResponse>> {
    let (key, value) = blocking(&state.cache, move |cache| {
        cache.fetch(&key).map(|value| (key, value))
    })
    .await?;

    Ok(Json(FetchResponse::new(key, value)))
}

/// Handler for GET /exists/:key
///
/// An invalid key simply does not exist.
pub async fn exists_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<ExistsResponse>> {
    let response = blocking(&state.cache, move |cache| {
        let exists = cache.exists(&key);
        Ok(ExistsResponse { key, exists })
    })
    .await?;

    Ok(Json(response))
}

/// Handler for DELETE /delete/:key
pub async fn delete_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<KeyResponse>> {
    let key = blocking(&state.cache, move |cache| cache.delete(&key).map(|()| key)).await?;

    Ok(Json(KeyResponse::deleted(key)))
}

/// Handler for POST /inc/:key
///
/// The body is optional; without one the counter moves by 1.
pub async fn inc_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Option<Json<StepRequest>>,
) -> Result<Json<UpdateResponse>> {
    let step = body.map(|Json(req)| req.step()).unwrap_or(1);
    let response = blocking(&state.cache, move |cache| {
        let value = cache.inc(&key, step)?;
        Ok(UpdateResponse { key, value })
    })
    .await?;

    Ok(Json(response))
}

/// Handler for POST /dec/:key
pub async fn dec_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Option<Json<StepRequest>>,
) -> Result<Json<UpdateResponse>> {
    let step = body.map(|Json(req)| req.step()).unwrap_or(1);
    let response = blocking(&state.cache, move |cache| {
        let value = cache.dec(&key, step)?;
        Ok(UpdateResponse { key, value })
    })
    .await?;

    Ok(Json(response))
}

/// Handler for POST /cas/:key
pub async fn cas_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(req): Json<CasRequest>,
) -> Result<Json<MessageResponse>> {
    let CasRequest { old, new } = req;
    let key = blocking(&state.cache, move |cache| {
        cache.cas(&key, old, new).map(|()| key)
    })
    .await?;

    Ok(Json(MessageResponse::new(format!(
        "Key '{}' swapped from {} to {}",
        key, old, new
    ))))
}

/// Handler for POST /clear
///
/// Drops every entry for every attached worker.
pub async fn clear_handler(State(state): State<AppState>) -> Result<Json<MessageResponse>> {
    blocking(&state.cache, |cache| {
        cache.clear();
        Ok(())
    })
    .await?;

    Ok(Json(MessageResponse::new("Cache cleared")))
}

/// Handler for GET /stats
///
/// Returns cache counters and a limited arena report. Neither takes a lock.
pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    let stats = state.cache.stats();
    let sma = state.cache.sma_info(true);

    Json(StatsResponse::new(stats, sma))
}

/// Handler for GET /health
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse::healthy(state.cache.arena().attached()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Value;

    fn test_state() -> AppState {
        let config = Config {
            shm_size: 1024 * 1024,
            entries_hint: 64,
            ..Config::default()
        };
        AppState::new(CacheStore::in_memory(&config).unwrap())
    }

    fn store_request(key: &str, value: Value) -> StoreRequest {
        StoreRequest {
            key: key.to_string(),
            value,
            ttl: None,
        }
    }

    #[tokio::test]
    async fn test_store_and_fetch_handler() {
        let state = test_state();

        let req = store_request("test_key", Value::from("test_value"));
        let result = store_handler(State(state.clone()), Json(req)).await;
        assert!(result.is_ok());

        let result = fetch_handler(State(state.clone()), Path("test_key".to_string())).await;
        let response = result.unwrap();
        assert_eq!(response.value, Value::from("test_value"));
    }

    #[tokio::test]
    async fn test_fetch_nonexistent_key() {
        let state = test_state();

        let result = fetch_handler(State(state), Path("nonexistent".to_string())).await;
        assert!(matches!(result, Err(CacheError::KeyNotFound(_))));
    }

    #[tokio::test]
    async fn test_add_handler_conflict() {
        let state = test_state();

        let req = store_request("once", Value::Long(1));
        add_handler(State(state.clone()), Json(req.clone())).await.unwrap();

        let result = add_handler(State(state), Json(req)).await;
        assert!(matches!(result, Err(CacheError::ExclusivityConflict(_))));
    }

    #[tokio::test]
    async fn test_delete_handler() {
        let state = test_state();

        let req = store_request("to_delete", Value::from("value"));
        store_handler(State(state.clone()), Json(req)).await.unwrap();

        let result = delete_handler(State(state.clone()), Path("to_delete".to_string())).await;
        assert!(result.is_ok());

        let response = exists_handler(State(state), Path("to_delete".to_string()))
            .await
            .unwrap();
        assert!(!response.exists);
    }

    #[tokio::test]
    async fn test_inc_dec_handlers() {
        let state = test_state();
        state.cache.store("counter", &Value::Long(10), 0).unwrap();

        let response = inc_handler(State(state.clone()), Path("counter".to_string()), None)
            .await
            .unwrap();
        assert_eq!(response.value, 11);

        let body = Some(Json(StepRequest { step: Some(5) }));
        let response = dec_handler(State(state), Path("counter".to_string()), body)
            .await
            .unwrap();
        assert_eq!(response.value, 6);
    }

    #[tokio::test]
    async fn test_cas_handler_mismatch() {
        let state = test_state();
        state.cache.store("n", &Value::Long(3), 0).unwrap();

        let req = CasRequest { old: 4, new: 9 };
        let result = cas_handler(State(state.clone()), Path("n".to_string()), Json(req)).await;
        assert!(matches!(result, Err(CacheError::TypeMismatch(_))));

        let req = CasRequest { old: 3, new: 9 };
        cas_handler(State(state.clone()), Path("n".to_string()), Json(req))
            .await
            .unwrap();
        assert_eq!(state.cache.fetch("n").unwrap(), Value::Long(9));
    }

    #[tokio::test]
    async fn test_clear_and_stats_handler() {
        let state = test_state();
        state.cache.store("a", &Value::Long(1), 0).unwrap();
        let _ = state.cache.fetch("a");

        let response = stats_handler(State(state.clone())).await;
        assert_eq!(response.cache.num_entries, 1);
        assert_eq!(response.cache.hits, 1);
        assert!(response.sma.block_lists.is_none());

        clear_handler(State(state.clone())).await.unwrap();
        let response = stats_handler(State(state)).await;
        assert_eq!(response.cache.num_entries, 0);
        assert_eq!(response.cache.hits, 0);
    }

    #[tokio::test]
    async fn test_health_handler() {
        let response = health_handler(State(test_state())).await;
        assert_eq!(response.status, "healthy");
    }

    #[tokio::test]
    async fn test_store_invalid_request() {
        let state = test_state();

        let req = store_request("", Value::from("value"));
        let result = store_handler(State(state), Json(req)).await;
        assert!(matches!(result, Err(CacheError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_stuck_lock_fails_request_not_worker() {
        let config = Config {
            shm_size: 1024 * 1024,
            entries_hint: 64,
            lock_timeout_ms: 100,
            ..Config::default()
        };
        let state = AppState::new(CacheStore::in_memory(&config).unwrap());
        std::mem::forget(state.cache.shard_lock(0).write());

        let result = clear_handler(State(state.clone())).await;
        assert!(matches!(result, Err(CacheError::Task(_))));

        // the runtime is still serving
        let response = health_handler(State(state)).await;
        assert_eq!(response.status, "healthy");
    }
}
