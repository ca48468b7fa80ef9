use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::Error;

/// Backend list responses arrive either as a bare array or wrapped in a
/// paginated `{"content": [...]}` envelope. Both shapes are normalized here,
/// at the HTTP boundary, so neither leaks into business logic.
#[derive(Deserialize)]
#[serde(untagged)]
enum ListEnvelope<T> {
    Plain(Vec<T>),
    Paged { content: Vec<T> },
}

impl<T> ListEnvelope<T> {
    fn into_rows(self) -> Vec<T> {
        match self {
            ListEnvelope::Plain(rows) => rows,
            ListEnvelope::Paged { content } => content,
        }
    }
}

/// Thin bearer-authenticated wrapper over the backend REST API
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        ApiClient {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    /// Same client, different bearer token. Used after a context switch.
    pub fn with_token(&self, token: impl Into<String>) -> Self {
        ApiClient {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            token: token.into(),
        }
    }

    /// Fetches a list endpoint, normalizing the envelope
    pub async fn get_list<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, Error> {
        let url = format!("{}{}", self.base_url, path);
        trace!("GET {}", url);
        let res = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?;
        let rows = res.json::<ListEnvelope<T>>().await?.into_rows();
        Ok(rows)
    }

    /// Posts a JSON body, returning the raw response so callers can map
    /// status codes to their own error taxonomy
    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, Error> {
        let url = format!("{}{}", self.base_url, path);
        trace!("POST {}", url);
        let res = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize, Debug, PartialEq)]
    struct Row {
        id: i64,
    }

    #[test]
    fn bare_array_normalizes() {
        let rows: ListEnvelope<Row> = serde_json::from_str(r#"[{"id": 1}, {"id": 2}]"#).unwrap();
        assert_eq!(rows.into_rows(), vec![Row { id: 1 }, Row { id: 2 }]);
    }

    #[test]
    fn paged_envelope_normalizes() {
        let rows: ListEnvelope<Row> =
            serde_json::from_str(r#"{"content": [{"id": 7}], "totalPages": 3}"#).unwrap();
        assert_eq!(rows.into_rows(), vec![Row { id: 7 }]);
    }
}
