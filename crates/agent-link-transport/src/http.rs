//! HTTP implementation of [`ChatBackend`].

use agent_link_core::{
    ClientConfig, TransportError,
    traits::{ChatBackend, EventStream, HistoryRecord, RemoteConfig, SessionSummary, StreamRequest},
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, header};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{endpoints::Endpoints, protocol::error_text, sse};

#[derive(Serialize)]
struct SendBody<'a> {
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    html: Option<&'a str>,
}

/// Talks to the backend over plain HTTP.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    endpoints: Endpoints,
    /// Sent on the config request, before any token was handed out.
    credential: Option<String>,
}

impl HttpBackend {
    /// # Errors
    /// Returns error if `api_base` is not a valid http(s) URL.
    pub fn new(api_base: &str) -> Result<Self, TransportError> {
        Ok(Self {
            client: Client::new(),
            endpoints: Endpoints::new(api_base)?,
            credential: None,
        })
    }

    /// Build from client configuration.
    ///
    /// # Errors
    /// Returns error if the API base is invalid or the HTTP client cannot be built.
    pub fn from_config(config: &ClientConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Self {
            client,
            endpoints: Endpoints::new(&config.api_base)?,
            credential: config.credential.clone(),
        })
    }

    #[must_use]
    pub const fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    async fn send(request: RequestBuilder, credential: Option<&str>) -> Result<Response, TransportError> {
        let request = match credential {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        request.send().await.map_err(map_reqwest)
    }

    /// Decode a JSON body, surfacing `{error: ...}` payloads and bad statuses.
    async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, TransportError> {
        let status = response.status();
        let body = response.text().await.map_err(map_reqwest)?;
        let value: Value = if body.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&body).map_err(|e| {
                if status.is_success() {
                    TransportError::Decode(e.to_string())
                } else {
                    TransportError::Http {
                        status: status.as_u16(),
                        message: body.clone(),
                    }
                }
            })?
        };

        if let Some(message) = error_text(&value) {
            tracing::warn!(status = status.as_u16(), "backend returned error payload");
            return Err(TransportError::Backend(message));
        }
        if !status.is_success() {
            return Err(TransportError::Http {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("request failed").to_string(),
            });
        }
        Ok(serde_json::from_value(value)?)
    }
}

fn map_reqwest(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Connect(format!("timed out: {e}"))
    } else if e.is_connect() || e.is_request() {
        TransportError::Connect(e.to_string())
    } else if let Some(status) = e.status() {
        TransportError::Http {
            status: status.as_u16(),
            message: e.to_string(),
        }
    } else {
        TransportError::Interrupted(e.to_string())
    }
}

/// Accept both a bare array and an object wrapping it under one of `keys`.
fn unwrap_list(value: Value, keys: &[&str]) -> Value {
    match value {
        Value::Object(mut map) => keys
            .iter()
            .find_map(|key| map.remove(*key))
            .unwrap_or(Value::Array(Vec::new())),
        Value::Null => Value::Array(Vec::new()),
        other => other,
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn fetch_config(&self) -> Result<RemoteConfig, TransportError> {
        let url = self.endpoints.config()?;
        tracing::debug!(%url, "fetching remote config");
        let response = Self::send(self.client.get(url), self.credential.as_deref()).await?;
        Self::read_json(response).await
    }

    async fn list_sessions(
        &self,
        external_id: &str,
        credential: Option<&str>,
    ) -> Result<Vec<SessionSummary>, TransportError> {
        let url = self.endpoints.sessions(external_id)?;
        let response = Self::send(self.client.get(url), credential).await?;
        let value: Value = Self::read_json(response).await?;
        Ok(serde_json::from_value(unwrap_list(value, &["sessions", "data"]))?)
    }

    async fn fetch_history(
        &self,
        session_id: &str,
        credential: Option<&str>,
    ) -> Result<Vec<HistoryRecord>, TransportError> {
        let url = self.endpoints.session(session_id)?;
        tracing::debug!(session_id, "fetching history");
        let response = Self::send(self.client.get(url), credential).await?;
        let value: Value = Self::read_json(response).await?;
        Ok(serde_json::from_value(unwrap_list(value, &["messages", "history", "data"]))?)
    }

    async fn open_stream(&self, request: StreamRequest) -> Result<EventStream, TransportError> {
        let url = self
            .endpoints
            .stream(request.session_id.as_deref(), request.request_id.as_deref())?;
        tracing::debug!(%url, "opening response stream");
        let body = SendBody {
            message: &request.message,
            html: request.html.as_deref(),
        };
        let builder = self
            .client
            .post(url)
            .header(header::ACCEPT, "text/event-stream")
            .json(&body);
        let response = Self::send(builder, request.credential.as_deref()).await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| error_text(&v))
                .unwrap_or(text);
            return Err(TransportError::Http {
                status: status.as_u16(),
                message,
            });
        }
        Ok(sse::event_stream(response.bytes_stream()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_unwrap_list_shapes() {
        assert_eq!(unwrap_list(json!([1]), &["messages"]), json!([1]));
        assert_eq!(unwrap_list(json!({"messages": [2]}), &["messages"]), json!([2]));
        assert_eq!(unwrap_list(json!({"other": 1}), &["messages"]), json!([]));
        assert_eq!(unwrap_list(Value::Null, &["messages"]), json!([]));
    }

    #[test]
    fn test_rejects_invalid_base() {
        assert!(HttpBackend::new("nope").is_err());
    }
}
