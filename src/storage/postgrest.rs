//! PostgREST-backed data source.
//!
//! Queries use resource embedding so a note arrives with its replies and a
//! single interview arrives with its whole subtree in one round trip.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use super::{
    FetchError, FetchResult, Interview, InterviewId, Note, ProjectDataSource, Reply,
    INTERVIEWS_TABLE, NOTES_TABLE, REPLIES_TABLE,
};

/// Configuration for the REST data source
#[derive(Debug, Clone)]
pub struct PostgrestConfig {
    /// `https://<ref>.supabase.co/rest/v1`
    pub rest_url: String,
    pub api_key: String,
    /// User JWT; the API key is used when absent
    pub access_token: Option<String>,
    pub timeout: Duration,
}

impl PostgrestConfig {
    /// Build from the backend base URL
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Self {
        Self {
            rest_url: format!("{}/rest/v1", base_url.trim_end_matches('/')),
            api_key: api_key.into(),
            access_token: None,
            timeout: Duration::from_secs(15),
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// `select` clause for notes with their replies
fn note_select() -> String {
    format!("*,replies:{}(*)", REPLIES_TABLE)
}

/// `select` clause for an interview with its notes and their replies
fn interview_select() -> String {
    format!("*,notes:{}({})", NOTES_TABLE, note_select())
}

/// PostgREST `in.(...)` list
fn in_list(ids: &[InterviewId]) -> String {
    let quoted: Vec<String> = ids.iter().map(|id| format!("\"{}\"", id)).collect();
    format!("in.({})", quoted.join(","))
}

pub struct PostgrestDataSource {
    config: PostgrestConfig,
    client: reqwest::Client,
}

impl PostgrestDataSource {
    pub fn new(config: PostgrestConfig) -> FetchResult<Self> {
        let token = config.access_token.as_deref().unwrap_or(&config.api_key);

        let mut headers = HeaderMap::new();
        headers.insert(
            "apikey",
            HeaderValue::from_str(&config.api_key)
                .map_err(|e| FetchError::Http(format!("invalid api key header: {}", e)))?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| FetchError::Http(format!("invalid token header: {}", e)))?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;

        Ok(Self { config, client })
    }

    async fn get<T: DeserializeOwned>(&self, table: &str, query: &[(&str, String)]) -> FetchResult<Vec<T>> {
        let url = format!("{}/{}", self.config.rest_url, table);
        debug!("GET {} {:?}", url, query);

        let response = self.client.get(&url).query(query).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<Vec<T>>()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ProjectDataSource for PostgrestDataSource {
    async fn fetch_interviews(&self, project_id: &str) -> FetchResult<Vec<Interview>> {
        self.get(
            INTERVIEWS_TABLE,
            &[
                ("select", "*".to_string()),
                ("project_id", format!("eq.{}", project_id)),
                ("deleted_at", "is.null".to_string()),
                ("order", "created_at.desc".to_string()),
            ],
        )
        .await
    }

    async fn fetch_notes(&self, interview_ids: &[InterviewId]) -> FetchResult<Vec<Note>> {
        if interview_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.get(
            NOTES_TABLE,
            &[
                ("select", note_select()),
                ("interview_id", in_list(interview_ids)),
                ("deleted_at", "is.null".to_string()),
                ("order", "created_at.asc".to_string()),
            ],
        )
        .await
    }

    async fn fetch_interview(&self, id: &str) -> FetchResult<Option<Interview>> {
        let rows: Vec<Interview> = self
            .get(
                INTERVIEWS_TABLE,
                &[("select", interview_select()), ("id", format!("eq.{}", id))],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_note(&self, id: &str) -> FetchResult<Option<Note>> {
        let rows: Vec<Note> = self
            .get(
                NOTES_TABLE,
                &[("select", note_select()), ("id", format!("eq.{}", id))],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_reply(&self, id: &str) -> FetchResult<Option<Reply>> {
        let rows: Vec<Reply> = self
            .get(
                REPLIES_TABLE,
                &[("select", "*".to_string()), ("id", format!("eq.{}", id))],
            )
            .await?;
        Ok(rows.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rest_url() {
        let config = PostgrestConfig::new("https://abc.supabase.co/", "anon");
        assert_eq!(config.rest_url, "https://abc.supabase.co/rest/v1");
    }

    #[test]
    fn test_select_clauses_embed_children() {
        assert_eq!(note_select(), "*,replies:note_replies(*)");
        assert_eq!(
            interview_select(),
            "*,notes:interview_notes(*,replies:note_replies(*))"
        );
    }

    #[test]
    fn test_in_list_quotes_ids() {
        let ids = vec!["a".to_string(), "b".to_string()];
        assert_eq!(in_list(&ids), "in.(\"a\",\"b\")");
    }

    #[test]
    fn test_client_builds_with_token() {
        let config = PostgrestConfig::new("https://abc.supabase.co", "anon").with_access_token("jwt");
        assert!(PostgrestDataSource::new(config).is_ok());
    }
}
