#![allow(dead_code)]

use async_trait::async_trait;
use portal_shared::capabilities::{
    Capabilities, HttpError, HttpHeaders, HttpMethod, HttpRequest, HttpResponse, HttpResult,
    HttpShell, MemoryKvStore,
};
use portal_shared::ClientConfig;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// In-process stand-in for the portal backend: users, bearer tokens and
/// document requests kept in memory, served only on reachable hosts.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    reachable: HashSet<String>,
    users: Vec<StoredUser>,
    tokens: HashMap<String, String>,
    documents: Vec<Value>,
    probes: Vec<String>,
    next_id: u32,
}

struct StoredUser {
    id: String,
    email: String,
    password: String,
    first_name: String,
    last_name: String,
}

impl StoredUser {
    fn to_json(&self, id_key: &str) -> Value {
        let mut user = json!({
            "firstName": self.first_name,
            "lastName": self.last_name,
            "email": self.email,
            "department": "Non spécifié",
            "position": "Non spécifié",
        });
        user[id_key] = json!(self.id);
        user
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reachable(self, host: &str) -> Self {
        self.set_reachable(host, true);
        self
    }

    pub fn with_user(self, email: &str, password: &str, first_name: &str, last_name: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.next_id += 1;
            let id = format!("user-{}", state.next_id);
            state.users.push(StoredUser {
                id,
                email: email.to_string(),
                password: password.to_string(),
                first_name: first_name.to_string(),
                last_name: last_name.to_string(),
            });
        }
        self
    }

    pub fn set_reachable(&self, host: &str, reachable: bool) {
        let mut state = self.state.lock().unwrap();
        if reachable {
            state.reachable.insert(host.to_string());
        } else {
            state.reachable.remove(host);
        }
    }

    /// What an administrator changing a request in the back office does.
    pub fn set_document_status(&self, id: &str, status: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(doc) = state.documents.iter_mut().find(|d| d["_id"] == id) {
            doc["status"] = json!(status);
            doc["updatedAt"] = json!("2024-05-02T09:00:00");
        }
    }

    pub fn document_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .documents
            .iter()
            .filter_map(|d| d["_id"].as_str().map(str::to_string))
            .collect()
    }

    pub fn revoke_tokens(&self) {
        self.state.lock().unwrap().tokens.clear();
    }

    pub fn probed_hosts(&self) -> Vec<String> {
        self.state.lock().unwrap().probes.clone()
    }

    fn handle(&self, request: &HttpRequest) -> (u16, Value) {
        let mut state = self.state.lock().unwrap();
        let path = request.url().path().to_string();
        let body: Value = request
            .body()
            .and_then(|b| serde_json::from_slice(b).ok())
            .unwrap_or(Value::Null);
        let caller = request
            .header("Authorization")
            .and_then(|h| h.strip_prefix("Bearer "))
            .and_then(|token| state.tokens.get(token).cloned());

        match (request.method(), path.as_str()) {
            (HttpMethod::Get, "/health") => (200, json!({"status": "ok"})),
            (HttpMethod::Post, "/login") => {
                let found = state
                    .users
                    .iter()
                    .find(|u| u.email == body["email"] && u.password == body["password"])
                    .map(|u| (u.id.clone(), u.to_json("id")));
                match found {
                    Some((id, user)) => {
                        state.next_id += 1;
                        let token = format!("token-{}", state.next_id);
                        state.tokens.insert(token.clone(), id);
                        (200, json!({"success": true, "token": token, "user": user}))
                    }
                    None => (
                        401,
                        json!({"success": false, "message": "Email ou mot de passe incorrect"}),
                    ),
                }
            }
            (HttpMethod::Get, "/me") => match caller {
                Some(id) => {
                    let user = state.users.iter().find(|u| u.id == id).map(|u| u.to_json("_id"));
                    (200, json!({"success": true, "user": user}))
                }
                None => (401, json!({"success": false, "message": "Token manquant"})),
            },
            (HttpMethod::Post, "/document-request") => {
                let user_id = body["userId"].as_str().unwrap_or_default().to_string();
                let document_type = body["documentType"].as_str().unwrap_or_default().to_string();
                if user_id.is_empty() || document_type.is_empty() {
                    return (400, json!({"success": false, "message": "Champs manquants"}));
                }
                if !state.users.iter().any(|u| u.id == user_id) {
                    return (404, json!({"success": false, "message": "Utilisateur non trouvé"}));
                }
                state.next_id += 1;
                let id = format!("doc-{}", state.next_id);
                state.documents.push(json!({
                    "_id": id,
                    "userId": user_id,
                    "documentType": document_type,
                    "description": body["description"],
                    "status": "en attente",
                    "createdAt": "2024-05-01T08:00:00",
                    "updatedAt": "2024-05-01T08:00:00",
                }));
                (201, json!({"success": true, "message": "Demande envoyée avec succès"}))
            }
            (HttpMethod::Get, "/document-requests") => match caller {
                Some(id) => {
                    let requests: Vec<Value> = state
                        .documents
                        .iter()
                        .filter(|d| d["userId"] == id.as_str())
                        .cloned()
                        .collect();
                    (200, json!({"success": true, "requests": requests}))
                }
                None => (401, json!({"success": false, "message": "Token manquant"})),
            },
            _ => (404, json!({"success": false, "message": "Not found"})),
        }
    }
}

#[async_trait]
impl HttpShell for FakeBackend {
    async fn execute(&self, request: HttpRequest) -> HttpResult {
        let host = request.url().host().to_string();
        {
            let mut state = self.state.lock().unwrap();
            if request.url().path() == "/health" {
                state.probes.push(host.clone());
            }
            if !state.reachable.contains(&host) {
                return Err(HttpError::ConnectionError {
                    host,
                    message: "connection refused".into(),
                });
            }
        }

        let (status, body) = self.handle(&request);
        let mut headers = HttpHeaders::new();
        headers.insert("Content-Type", "application/json").unwrap();
        Ok(HttpResponse::new(
            status,
            headers,
            serde_json::to_vec(&body).unwrap(),
            request.request_id().to_string(),
            1,
        ))
    }
}

pub fn capabilities(backend: &Arc<FakeBackend>) -> (Capabilities, Arc<MemoryKvStore>) {
    let kv = Arc::new(MemoryKvStore::new());
    (Capabilities::new(backend.clone(), kv.clone()), kv)
}

pub fn config(hosts: &[&str]) -> ClientConfig {
    ClientConfig {
        candidate_hosts: hosts.iter().map(|h| (*h).to_string()).collect(),
        ..ClientConfig::default()
    }
}
