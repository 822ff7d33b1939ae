// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! CouchDB over HTTP.
//!
//! | Operation | Request | Notes |
//! |-----------|---------|-------|
//! | `get` | `GET /{db}/{id}` | 404 → `None` |
//! | `put` | `PUT /{db}/{id}` | 409 → `Conflict` |
//! | `delete` | `DELETE /{db}/{id}?rev=` | 404 → `false`, 409 → `Conflict` |
//! | `changes` | `GET /{db}/_changes?include_docs=true&style=all_docs&since=` | |
//!
//! Document ids are percent-encoded as a single path segment, so the `/` of
//! `orders/1` goes over the wire as `orders%2F1`.

use super::{BoxFuture, Change, Document, DocumentStore, Sequence};
use crate::config::DocumentStoreConfig;
use crate::error::{ReplicationError, Result};
use crate::resilience::RetryConfig;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

#[derive(Debug, Deserialize)]
struct ChangesResponse {
    #[serde(default)]
    results: Vec<RawChange>,
}

#[derive(Debug, Deserialize)]
struct RawChange {
    seq: Value,
    id: String,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    doc: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WriteResponse {
    rev: String,
}

/// [`DocumentStore`] backed by one CouchDB database.
#[derive(Debug, Clone)]
pub struct CouchDbStore {
    client: Client,
    server: Url,
    database: String,
    create_database: bool,
    credentials: Option<(String, Option<String>)>,
}

impl CouchDbStore {
    /// Build the HTTP client. Does not touch the network.
    pub fn new(config: &DocumentStoreConfig) -> Result<Self> {
        let server = Url::parse(&config.url)
            .map_err(|e| ReplicationError::Config(format!("invalid document store url: {}", e)))?;
        if server.cannot_be_a_base() {
            return Err(ReplicationError::Config(format!(
                "document store url cannot be a base: {}",
                config.url
            )));
        }

        let client = Client::builder()
            .timeout(config.request_timeout_duration())
            .build()
            .map_err(|e| ReplicationError::transport("client", e))?;

        Ok(Self {
            client,
            server,
            database: config.database.clone(),
            create_database: config.create_database,
            credentials: config
                .username
                .clone()
                .map(|user| (user, config.password.clone())),
        })
    }

    /// Build the client and wait for the database to be usable.
    pub async fn connect(config: &DocumentStoreConfig, retry_config: &RetryConfig) -> Result<Self> {
        let store = Self::new(config)?;
        store.wait_ready(retry_config).await?;
        Ok(store)
    }

    /// Make sure the database is reachable, creating it when allowed.
    ///
    /// Retries with backoff: at startup the server may still be coming up.
    pub async fn wait_ready(&self, retry_config: &RetryConfig) -> Result<()> {
        info!(url = %self.server, database = %self.database, "Connecting to document store");

        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = timeout(
                retry_config.connection_timeout,
                self.ensure_database(self.create_database),
            )
            .await;

            let err = match result {
                Ok(Ok(())) => {
                    if attempt > 1 {
                        info!(database = %self.database, attempt, "Connected to document store after retry");
                    } else {
                        info!(database = %self.database, "Connected to document store");
                    }
                    return Ok(());
                }
                // Missing database without create permission won't fix itself
                Ok(Err(e)) if !e.is_retryable() => return Err(e),
                Ok(Err(e)) => e,
                Err(_) => ReplicationError::transport_msg(
                    "connect",
                    format!(
                        "timed out after {}ms",
                        retry_config.connection_timeout.as_millis()
                    ),
                ),
            };

            if attempt >= retry_config.max_attempts {
                error!(attempt, error = %err, "Failed to reach document store after max retries");
                return Err(ReplicationError::transport_msg(
                    "connect",
                    format!("failed after {} attempts: {}", attempt, err),
                ));
            }

            let delay = retry_config.delay_for_attempt(attempt);
            warn!(
                attempt,
                delay_ms = delay.as_millis(),
                error = %err,
                "Document store connection attempt failed, retrying"
            );

            tokio::time::sleep(delay).await;
        }
    }

    /// Check the database exists; create it if allowed.
    pub async fn ensure_database(&self, create: bool) -> Result<()> {
        let url = self.url(&[])?;
        let response = self.send(Method::HEAD, url.clone(), "db_info").await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND if create => {
                let response = self.send(Method::PUT, url, "create_db").await?;
                match response.status() {
                    // 412: somebody else created it in the meantime
                    status if status.is_success() || status == StatusCode::PRECONDITION_FAILED => {
                        info!(database = %self.database, "Created document database");
                        Ok(())
                    }
                    _ => Err(status_error("create_db", response).await),
                }
            }
            StatusCode::NOT_FOUND => Err(ReplicationError::Config(format!(
                "document database '{}' does not exist",
                self.database
            ))),
            _ => Err(status_error("db_info", response).await),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// `{server}/{database}/{segments...}`, each segment encoded.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.server.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                ReplicationError::Config(format!("document store url cannot be a base: {}", self.server))
            })?;
            path.pop_if_empty().push(&self.database);
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.credentials {
            Some((user, password)) => builder.basic_auth(user, password.as_ref()),
            None => builder,
        }
    }

    async fn send(&self, method: Method, url: Url, operation: &str) -> Result<Response> {
        self.request(method, url)
            .send()
            .await
            .map_err(|e| ReplicationError::transport(operation, e))
    }
}

/// Turn an unexpected HTTP status into a transport error, keeping the body
/// for diagnostics.
async fn status_error(operation: &str, response: Response) -> ReplicationError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    ReplicationError::transport_msg(operation, format!("HTTP {}: {}", status, body.trim()))
}

impl DocumentStore for CouchDbStore {
    fn get(&self, id: &str) -> BoxFuture<'_, Option<Document>> {
        let id = id.to_string();
        Box::pin(async move {
            let url = self.url(&[&id])?;
            let response = self.send(Method::GET, url, "get").await?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(None),
                status if status.is_success() => {
                    let body: Value = response
                        .json()
                        .await
                        .map_err(|e| ReplicationError::transport("get", e))?;
                    Document::from_value(body).map(Some)
                }
                _ => Err(status_error("get", response).await),
            }
        })
    }

    fn put(&self, doc: Document) -> BoxFuture<'_, String> {
        Box::pin(async move {
            let url = self.url(&[&doc.id])?;
            let response = self
                .request(Method::PUT, url)
                .json(&doc)
                .send()
                .await
                .map_err(|e| ReplicationError::transport("put", e))?;
            match response.status() {
                StatusCode::CONFLICT => Err(ReplicationError::Conflict { id: doc.id }),
                status if status.is_success() => {
                    let written: WriteResponse = response
                        .json()
                        .await
                        .map_err(|e| ReplicationError::transport("put", e))?;
                    debug!(id = %doc.id, rev = %written.rev, "Document written");
                    Ok(written.rev)
                }
                _ => Err(status_error("put", response).await),
            }
        })
    }

    fn delete(&self, id: &str, rev: &str) -> BoxFuture<'_, bool> {
        let id = id.to_string();
        let rev = rev.to_string();
        Box::pin(async move {
            let mut url = self.url(&[&id])?;
            url.query_pairs_mut().append_pair("rev", &rev);
            let response = self.send(Method::DELETE, url, "delete").await?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(false),
                StatusCode::CONFLICT => Err(ReplicationError::Conflict { id }),
                status if status.is_success() => Ok(true),
                _ => Err(status_error("delete", response).await),
            }
        })
    }

    fn ensure_ready<'a>(&'a self, retry: &'a RetryConfig) -> BoxFuture<'a, ()> {
        Box::pin(self.wait_ready(retry))
    }

    fn changes(&self, since: Option<&Sequence>) -> BoxFuture<'_, Vec<Change>> {
        let since = since.map(|s| s.token().to_string());
        Box::pin(async move {
            let mut url = self.url(&["_changes"])?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("include_docs", "true");
                query.append_pair("style", "all_docs");
                if let Some(since) = &since {
                    query.append_pair("since", since);
                }
            }

            let response = self.send(Method::GET, url, "changes").await?;
            if !response.status().is_success() {
                return Err(status_error("changes", response).await);
            }
            let feed: ChangesResponse = response
                .json()
                .await
                .map_err(|e| ReplicationError::transport("changes", e))?;

            feed.results
                .into_iter()
                .map(|raw| {
                    let seq = Sequence::from_json(&raw.seq).ok_or_else(|| {
                        ReplicationError::Decode(format!("unrecognised change sequence: {}", raw.seq))
                    })?;
                    Ok(Change {
                        seq,
                        id: raw.id,
                        deleted: raw.deleted,
                        doc: raw.doc,
                    })
                })
                .collect()
        })
    }
}
