//! HTTP delivery of JSON batches.

use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use snafu::prelude::*;
use std::collections::HashMap;
use std::time::Duration;

use super::batch::JsonBatch;
use crate::error::{ClientBuildSnafu, DeliveryError, SerializeSnafu, TransportSnafu};

/// Longest response body kept in a status error.
const MAX_ERROR_BODY: usize = 512;

/// POSTs batches to a single endpoint over a shared client.
#[derive(Debug, Clone)]
pub struct HttpDelivery {
    client: reqwest::Client,
    endpoint_url: String,
}

impl HttpDelivery {
    /// Build a client with the given request timeout and static headers.
    pub fn new(
        endpoint_url: impl Into<String>,
        timeout: Duration,
        headers: &HashMap<String, String>,
    ) -> Result<Self, DeliveryError> {
        let mut default_headers = HeaderMap::new();
        for (name, value) in headers {
            let invalid = || DeliveryError::InvalidHeader { name: name.clone() };
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
            let header_value = HeaderValue::from_str(value).map_err(|_| invalid())?;
            default_headers.insert(header_name, header_value);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(default_headers)
            .build()
            .context(ClientBuildSnafu)?;

        Ok(Self {
            client,
            endpoint_url: endpoint_url.into(),
        })
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    /// POST one batch. Returns the response status on 2xx.
    pub async fn deliver(&self, batch: &JsonBatch) -> Result<u16, DeliveryError> {
        let body = serde_json::to_vec(batch).context(SerializeSnafu)?;

        let response = self
            .client
            .post(&self.endpoint_url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .context(TransportSnafu)?;

        let status = response.status();
        if status.is_success() {
            return Ok(status.as_u16());
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut end = MAX_ERROR_BODY;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }

        Err(DeliveryError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::routing::post;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    type Captured = Arc<Mutex<Vec<(Option<String>, Option<String>, String)>>>;

    /// Serve `status` on `/ingest`, recording content type, api key and body.
    async fn serve(status: StatusCode) -> (String, Captured) {
        let captured: Captured = Arc::default();
        let sink = captured.clone();
        let app = Router::new().route(
            "/ingest",
            post(move |headers: AxumHeaders, body: String| {
                let sink = sink.clone();
                async move {
                    let header = |name: &str| {
                        headers
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string)
                    };
                    sink.lock()
                        .unwrap()
                        .push((header("content-type"), header("x-api-key"), body));
                    (status, "rejected by test server")
                }
            }),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        (format!("http://{addr}/ingest"), captured)
    }

    #[tokio::test]
    async fn test_delivers_batch_as_json() {
        let (url, captured) = serve(StatusCode::OK).await;
        let headers = HashMap::from([("X-Api-Key".to_string(), "secret".to_string())]);
        let delivery = HttpDelivery::new(url, Duration::from_secs(5), &headers).unwrap();

        let batch = JsonBatch {
            events: vec![json!({"a": 1})],
        };
        assert_eq!(delivery.deliver(&batch).await.unwrap(), 200);

        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        let (content_type, api_key, body) = &captured[0];
        assert_eq!(content_type.as_deref(), Some("application/json"));
        assert_eq!(api_key.as_deref(), Some("secret"));
        assert_eq!(body, r#"{"events":[{"a":1}]}"#);
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let (url, _captured) = serve(StatusCode::SERVICE_UNAVAILABLE).await;
        let delivery = HttpDelivery::new(url, Duration::from_secs(5), &HashMap::new()).unwrap();

        let err = delivery.deliver(&JsonBatch::default()).await.unwrap_err();
        match err {
            DeliveryError::Status { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "rejected by test server");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let delivery = HttpDelivery::new(
            format!("http://{addr}/ingest"),
            Duration::from_secs(5),
            &HashMap::new(),
        )
        .unwrap();

        let err = delivery.deliver(&JsonBatch::default()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Transport { .. }));
    }

    #[test]
    fn test_invalid_header_rejected() {
        let headers = HashMap::from([("bad header".to_string(), "v".to_string())]);
        let err = HttpDelivery::new("http://localhost", Duration::from_secs(1), &headers).unwrap_err();
        assert!(matches!(err, DeliveryError::InvalidHeader { .. }));
    }
}
