mod http;
mod kv;

use std::sync::Arc;

pub use self::http::{
    HttpError, HttpHeaders, HttpMethod, HttpRequest, HttpResponse, HttpResult, HttpShell,
    ValidatedUrl, JSON_CONTENT_TYPE, MAX_REQUEST_BODY_SIZE, MAX_RESPONSE_BODY_SIZE,
    MAX_TIMEOUT_MS,
};
pub use self::kv::{
    load_json, store_json, KeyValueStore, KvError, MemoryKvStore, StorageErrorCode, StorageKey,
    MAX_VALUE_SIZE,
};

#[cfg(feature = "native-http")]
pub use self::http::ReqwestShell;

#[cfg(not(target_arch = "wasm32"))]
pub use self::kv::SqliteKvStore;

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    #[error("Storage error: {0}")]
    Kv(#[from] KvError),
}

/// The two side-effecting seams the core depends on.
#[derive(Clone)]
pub struct Capabilities {
    pub http: Arc<dyn HttpShell>,
    pub kv: Arc<dyn KeyValueStore>,
}

impl Capabilities {
    pub fn new(http: Arc<dyn HttpShell>, kv: Arc<dyn KeyValueStore>) -> Self {
        Self { http, kv }
    }

    /// HTTP shell with volatile storage; sessions do not survive a restart.
    pub fn with_memory_store(http: Arc<dyn HttpShell>) -> Self {
        Self::new(http, Arc::new(MemoryKvStore::new()))
    }

    #[cfg(all(feature = "native-http", not(target_arch = "wasm32")))]
    pub fn native(db_path: impl AsRef<std::path::Path>) -> Result<Self, CapabilityError> {
        let http = ReqwestShell::new()?;
        let kv = SqliteKvStore::open(db_path)?;
        Ok(Self::new(Arc::new(http), Arc::new(kv)))
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities").finish_non_exhaustive()
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;

    pub type Responder = Arc<dyn Fn(&HttpRequest) -> HttpResult + Send + Sync>;

    pub fn json_response(status: u16, body: &serde_json::Value) -> HttpResponse {
        let mut headers = HttpHeaders::new();
        headers
            .insert("Content-Type", "application/json")
            .expect("static header is valid");
        HttpResponse::new(
            status,
            headers,
            serde_json::to_vec(body).expect("json value serializes"),
            uuid::Uuid::new_v4().to_string(),
            1,
        )
    }

    /// Scripted backend: hosts are unreachable until marked reachable, every
    /// reachable host answers `GET /health`, other routes are registered per
    /// method and path.
    #[derive(Default)]
    pub struct MockHttpShell {
        reachable: Mutex<HashSet<String>>,
        routes: Mutex<HashMap<(HttpMethod, String), Responder>>,
        requests: Mutex<Vec<HttpRequest>>,
        latency: Mutex<Duration>,
    }

    impl MockHttpShell {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_reachable_host(self, host: &str) -> Self {
            self.set_reachable(host, true);
            self
        }

        pub fn set_reachable(&self, host: &str, reachable: bool) {
            let mut hosts = self.reachable.lock().unwrap();
            if reachable {
                hosts.insert(host.to_lowercase());
            } else {
                hosts.remove(&host.to_lowercase());
            }
        }

        pub fn set_latency(&self, latency: Duration) {
            *self.latency.lock().unwrap() = latency;
        }

        pub fn respond_json(
            &self,
            method: HttpMethod,
            path: &str,
            status: u16,
            body: serde_json::Value,
        ) {
            self.respond_with(method, path, move |_| Ok(json_response(status, &body)));
        }

        pub fn respond_with<F>(&self, method: HttpMethod, path: &str, responder: F)
        where
            F: Fn(&HttpRequest) -> HttpResult + Send + Sync + 'static,
        {
            self.routes
                .lock()
                .unwrap()
                .insert((method, path.to_string()), Arc::new(responder));
        }

        pub fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().unwrap().clone()
        }

        pub fn count(&self, method: HttpMethod, path: &str) -> usize {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.method() == method && r.url().path() == path)
                .count()
        }

        pub fn probes_to(&self, host: &str) -> usize {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.url().host() == host && r.url().path() == "/health")
                .count()
        }

        pub fn probed_hosts(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.url().path() == "/health")
                .map(|r| r.url().host().to_string())
                .collect()
        }
    }

    #[async_trait]
    impl HttpShell for MockHttpShell {
        async fn execute(&self, request: HttpRequest) -> HttpResult {
            self.requests.lock().unwrap().push(request.clone());

            let latency = *self.latency.lock().unwrap();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }

            let host = request.url().host().to_string();
            if !self.reachable.lock().unwrap().contains(&host) {
                return Err(HttpError::ConnectionError {
                    host,
                    message: "connection refused".to_string(),
                });
            }

            let path = request.url().path().to_string();
            let responder = self
                .routes
                .lock()
                .unwrap()
                .get(&(request.method(), path.clone()))
                .cloned();

            match responder {
                Some(responder) => responder(&request),
                None if request.method() == HttpMethod::Get && path == "/health" => {
                    Ok(json_response(200, &serde_json::json!({"status": "ok"})))
                }
                None => Ok(json_response(
                    404,
                    &serde_json::json!({"success": false, "message": "Not found"}),
                )),
            }
        }
    }

    pub fn mock_capabilities(
        http: MockHttpShell,
    ) -> (Capabilities, Arc<MockHttpShell>, Arc<MemoryKvStore>) {
        let http = Arc::new(http);
        let kv = Arc::new(MemoryKvStore::new());
        let caps = Capabilities::new(http.clone(), kv.clone());
        (caps, http, kv)
    }
}
