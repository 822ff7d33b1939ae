// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for CouchDB.
//!
//! The container is considered started as soon as Docker reports it;
//! readiness is left to [`CouchDbStore::connect`], which retries until the
//! server answers.

use replicant::document::CouchDbStore;
use replicant::{DocumentStoreConfig, RetryConfig};
use testcontainers::{clients::Cli, Container, GenericImage};

pub const COUCH_USER: &str = "admin";
pub const COUCH_PASSWORD: &str = "secret";

/// Create a single-node CouchDB 3 container with an admin account.
pub fn couchdb_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("couchdb", "3")
        .with_env_var("COUCHDB_USER", COUCH_USER)
        .with_env_var("COUCHDB_PASSWORD", COUCH_PASSWORD)
        .with_exposed_port(5984);
    docker.run(image)
}

/// Get the server URL for a container.
pub fn couchdb_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(5984);
    format!("http://127.0.0.1:{}", port)
}

/// Store config for `database` on the container.
pub fn couchdb_config(container: &Container<'_, GenericImage>, database: &str) -> DocumentStoreConfig {
    DocumentStoreConfig {
        url: couchdb_url(container),
        database: database.to_string(),
        create_database: true,
        request_timeout: "10s".to_string(),
        username: Some(COUCH_USER.to_string()),
        password: Some(COUCH_PASSWORD.to_string()),
    }
}

/// Connect, waiting for the server to come up and creating the database.
pub async fn connect_couchdb(config: &DocumentStoreConfig) -> CouchDbStore {
    CouchDbStore::connect(config, &RetryConfig::startup())
        .await
        .expect("CouchDB did not become ready")
}
