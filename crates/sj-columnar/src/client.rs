// SPDX-License-Identifier: MIT OR Apache-2.0
//! Minimal ClickHouse HTTP client.

use serde::Serialize;
use sj_config::ClickhouseConfig;
use sj_error::{CoreError, CoreResult, ErrorCode};
use tracing::debug;

/// Thin wrapper over the ClickHouse HTTP interface.
#[derive(Clone)]
pub struct ClickhouseClient {
    http: reqwest::Client,
    base: String,
    database: String,
    user: String,
    password: String,
}

impl ClickhouseClient {
    /// Build a client from configuration.
    pub fn new(cfg: &ClickhouseConfig) -> CoreResult<Self> {
        let http = reqwest::Client::builder().build().map_err(|e| {
            CoreError::new(ErrorCode::Internal, "failed to build http client").with_source(e)
        })?;
        Ok(Self {
            http,
            base: cfg.url.trim_end_matches('/').to_string(),
            database: cfg.database.clone(),
            user: cfg.user.clone(),
            password: cfg.password.clone(),
        })
    }

    /// The configured database name.
    pub fn database(&self) -> &str {
        &self.database
    }

    fn request(&self, query: &str) -> reqwest::RequestBuilder {
        self.http
            .post(&self.base)
            .query(&[
                ("database", self.database.as_str()),
                ("query", query),
                ("date_time_input_format", "best_effort"),
            ])
            .header("X-ClickHouse-User", &self.user)
            .header("X-ClickHouse-Key", &self.password)
    }

    async fn send(&self, builder: reqwest::RequestBuilder, what: &str) -> CoreResult<String> {
        let response = builder.send().await.map_err(|e| {
            CoreError::new(ErrorCode::ColumnarUnavailable, format!("clickhouse {what} failed"))
                .with_source(e)
        })?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            CoreError::new(ErrorCode::ColumnarUnavailable, "clickhouse body read failed")
                .with_source(e)
        })?;

        if status == 200 {
            return Ok(body);
        }
        let code = if status >= 500 {
            ErrorCode::ColumnarUnavailable
        } else {
            ErrorCode::ColumnarQuery
        };
        Err(CoreError::new(code, format!("clickhouse {what} returned {status}"))
            .with_context("status", status)
            .with_context("detail", body.chars().take(300).collect::<String>()))
    }

    /// Run a statement with no meaningful result body.
    pub async fn execute(&self, sql: &str) -> CoreResult<()> {
        debug!(component = "columnar", sql_head = sql.lines().next().unwrap_or(""), "execute");
        self.send(self.request(sql).body(String::new()), "execute")
            .await
            .map(|_| ())
    }

    /// Run a query and return the raw response body.
    pub async fn query_raw(&self, sql: &str) -> CoreResult<String> {
        self.send(self.request(sql).body(String::new()), "query").await
    }

    /// Run a `SELECT count() … FORMAT TabSeparated`-style probe.
    pub async fn query_count(&self, sql: &str) -> CoreResult<u64> {
        let body = self.query_raw(sql).await?;
        body.trim().parse::<u64>().map_err(|e| {
            CoreError::new(ErrorCode::ColumnarQuery, "unexpected count response")
                .with_context("body", body.chars().take(100).collect::<String>())
                .with_source(e)
        })
    }

    /// Insert rows as a `JSONEachRow` body. Returns the row count sent.
    pub async fn insert_json_rows<T: Serialize>(&self, table: &str, rows: &[T]) -> CoreResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut body = String::new();
        for row in rows {
            let line = serde_json::to_string(row).map_err(|e| {
                CoreError::new(ErrorCode::Internal, "failed to serialize row").with_source(e)
            })?;
            body.push_str(&line);
            body.push('\n');
        }
        let query = format!("INSERT INTO {}.{} FORMAT JSONEachRow", self.database, table);
        self.send(self.request(&query).body(body), "insert").await?;
        Ok(rows.len() as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use wiremock::matchers::{body_string_contains, method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Serialize)]
    struct Row {
        a: u32,
        b: &'static str,
    }

    async fn client_for(server: &MockServer) -> ClickhouseClient {
        let pairs = [
            ("SERVICE_CLICKHOUSE_URL", server.uri()),
            ("SERVICE_CLICKHOUSE_DB", "swearjar".to_string()),
        ];
        let cfg = ClickhouseConfig::load(&move |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
        })
        .unwrap();
        ClickhouseClient::new(&cfg).unwrap()
    }

    #[tokio::test]
    async fn insert_sends_ndjson_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(query_param("database", "swearjar"))
            .and(query_param(
                "query",
                "INSERT INTO swearjar.hits FORMAT JSONEachRow",
            ))
            .and(body_string_contains("{\"a\":1,\"b\":\"x\"}"))
            .and(body_string_contains("{\"a\":2,\"b\":\"y\"}"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let sent = client
            .insert_json_rows("hits", &[Row { a: 1, b: "x" }, Row { a: 2, b: "y" }])
            .await
            .unwrap();
        assert_eq!(sent, 2);
    }

    #[tokio::test]
    async fn empty_insert_skips_the_request() {
        let server = MockServer::start().await;
        let client = client_for(&server).await;
        let sent = client.insert_json_rows::<Row>("hits", &[]).await.unwrap();
        assert_eq!(sent, 0);
    }

    #[tokio::test]
    async fn count_probe_parses_tsv() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("42\n"))
            .mount(&server)
            .await;
        let client = client_for(&server).await;
        let n = client
            .query_count("SELECT count() FROM hits FORMAT TabSeparated")
            .await
            .unwrap();
        assert_eq!(n, 42);
    }

    #[tokio::test]
    async fn server_errors_are_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;
        let client = client_for(&server).await;
        let err = client.execute("SELECT 1").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ColumnarUnavailable);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn query_errors_are_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("syntax error"))
            .mount(&server)
            .await;
        let client = client_for(&server).await;
        let err = client.execute("SELEC nope").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ColumnarQuery);
        assert!(!err.is_retryable());
    }
}
