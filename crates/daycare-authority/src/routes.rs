use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use daycare_spec::DaycareRegistration;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::registry::{DaycareRegistry, RegistryError};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid registration: {0}")]
    InvalidRegistration(#[from] serde_json::Error),
    #[error("registration refused: {0}")]
    Refused(#[from] RegistryError),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::InvalidRegistration(_) => StatusCode::BAD_REQUEST,
            ApiError::Refused(_) => StatusCode::BAD_REQUEST,
        };
        let body = Json(ErrorBody {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}

/// Registration endpoints backed by `registry`.
pub fn router(registry: Arc<DaycareRegistry>) -> Router {
    Router::new()
        .route(
            "/v2/daycare_registrations",
            get(list_registrations).post(register),
        )
        .with_state(registry)
}

async fn list_registrations(
    State(registry): State<Arc<DaycareRegistry>>,
) -> Json<Vec<DaycareRegistration>> {
    registry.expire(Utc::now());
    Json(registry.list())
}

async fn register(
    State(registry): State<Arc<DaycareRegistry>>,
    body: Bytes,
) -> Result<Json<DaycareRegistration>, ApiError> {
    let registration: DaycareRegistration = serde_json::from_slice(&body)?;
    let now = Utc::now();
    registry.expire(now);
    let hostname = registration.hostname.clone();
    registry.insert(registration, now).map(Json).map_err(|err| {
        warn!(hostname = %hostname, error = %err, "rejected daycare registration");
        ApiError::from(err)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use daycare_spec::VERSION;

    const SECRET: &[u8] = b"routes-secret";

    async fn serve() -> (String, Arc<DaycareRegistry>) {
        let registry = Arc::new(DaycareRegistry::new(SECRET.to_vec()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(registry.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/v2/daycare_registrations"), registry)
    }

    fn registration() -> DaycareRegistration {
        let mut registration = DaycareRegistration {
            hostname: "d1.example.edu".into(),
            problem_types: vec!["gotest".into()],
            capacity: 3,
            time: Utc::now(),
            version: VERSION.into(),
            signature: String::new(),
        };
        registration.sign(SECRET);
        registration
    }

    #[tokio::test]
    async fn test_register_then_list() {
        let (url, _registry) = serve().await;
        let client = reqwest::Client::new();
        let response = client.post(&url).json(&registration()).send().await.unwrap();
        assert_eq!(response.status(), 200);

        let listed: Vec<DaycareRegistration> =
            client.get(&url).send().await.unwrap().json().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].hostname, "d1.example.edu");
        assert!(listed[0].signature.is_empty());
    }

    #[tokio::test]
    async fn test_bad_registration_is_400_with_error_body() {
        let (url, registry) = serve().await;
        let client = reqwest::Client::new();
        let mut forged = registration();
        forged.capacity = 50;
        let response = client.post(&url).json(&forged).send().await.unwrap();
        assert_eq!(response.status(), 400);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(
            body["error"],
            "registration refused: registration signature mismatch"
        );

        let response = client.post(&url).body("not json").send().await.unwrap();
        assert_eq!(response.status(), 400);
        assert!(registry.list().is_empty());
    }
}
