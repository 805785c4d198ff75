// SPDX-License-Identifier: MIT OR Apache-2.0
//! Hourly archive fetching with a local cache.
//!
//! Cache entries are keyed by the hour (`YYYY-MM-DD-HH.json.gz`) and written
//! via temp-file + rename, so a concurrent miss never observes a partial
//! download. Retention is enforced after each store: entries older than the
//! day cap are deleted, then least-recently-modified entries go until the
//! byte cap holds.

use chrono::Utc;
use futures::StreamExt;
use sj_config::IngestConfig;
use sj_core::HourRef;
use sj_error::{classify_http_status, CoreError, CoreResult, ErrorCode};
use sj_retry::{retry_async, BackoffPolicy};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Recent-hour cache entries older than this are considered stale, since the
/// upstream may still be appending to the current window.
const REFRESH_WINDOW: Duration = Duration::from_secs(30 * 60);

/// A fetched hour, resident in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheFile {
    /// Path of the gzip archive on disk.
    pub path: PathBuf,
    /// Whether the file was served from cache without a download.
    pub from_cache: bool,
    /// Compressed size in bytes.
    pub bytes: u64,
}

/// Retrieves hourly archives from the upstream with a bounded local cache.
pub struct Fetcher {
    http: reqwest::Client,
    base_url: String,
    cache_dir: PathBuf,
    refresh_recent_hours: u32,
    retain_max_days: u32,
    retain_max_bytes: u64,
}

impl Fetcher {
    /// Build a fetcher from ingest configuration.
    pub fn new(cfg: &IngestConfig) -> CoreResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.http_timeout)
            .build()
            .map_err(|e| {
                CoreError::new(ErrorCode::Internal, "failed to build http client").with_source(e)
            })?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            cache_dir: PathBuf::from(&cfg.cache_dir),
            refresh_recent_hours: cfg.refresh_recent_hours,
            retain_max_days: cfg.retain_max_days,
            retain_max_bytes: cfg.retain_max_bytes,
        })
    }

    /// Upstream URL for an hour.
    pub fn url_for(&self, hour: HourRef) -> String {
        format!("{}/{}.json.gz", self.base_url, hour.archive_name())
    }

    /// Local cache path for an hour.
    pub fn cache_path(&self, hour: HourRef) -> PathBuf {
        self.cache_dir.join(format!("{}.json.gz", hour.cache_key()))
    }

    /// Fetch an hour's archive, serving from cache when fresh.
    ///
    /// A 404 is terminal for the hour; 429/5xx/transport errors retry inside
    /// the fetcher before surfacing as retryable.
    pub async fn fetch(&self, hour: HourRef) -> CoreResult<CacheFile> {
        let path = self.cache_path(hour);

        if let Some(meta) = fs_metadata(&path) {
            if self.cache_is_fresh(hour, &meta) {
                debug!(component = "fetch", hour = %hour, "cache hit");
                return Ok(CacheFile {
                    path,
                    from_cache: true,
                    bytes: meta.len(),
                });
            }
            debug!(component = "fetch", hour = %hour, "cache stale, refetching");
        }

        tokio::fs::create_dir_all(&self.cache_dir).await.map_err(|e| {
            CoreError::new(ErrorCode::Internal, "failed to create cache dir").with_source(e)
        })?;

        let url = self.url_for(hour);
        let bytes = retry_async(&BackoffPolicy::fetch(), "archive_fetch", |_| {
            self.download(&url, &path)
        })
        .await?;

        // Best-effort retention; a failed sweep never fails the fetch.
        if let Err(err) = self.apply_retention().await {
            warn!(component = "fetch", error = %err, "cache retention sweep failed");
        }

        info!(component = "fetch", hour = %hour, bytes, "archive downloaded");
        Ok(CacheFile {
            path,
            from_cache: false,
            bytes,
        })
    }

    /// Whether a cached entry may be served without refetching.
    fn cache_is_fresh(&self, hour: HourRef, meta: &std::fs::Metadata) -> bool {
        let recent_floor =
            HourRef::truncate(Utc::now() - chrono::Duration::hours(i64::from(self.refresh_recent_hours)));
        if hour < recent_floor {
            return true;
        }
        // Recent hour: trust the entry only while it is young.
        match meta.modified().ok().and_then(|m| m.elapsed().ok()) {
            Some(age) => age < REFRESH_WINDOW,
            None => false,
        }
    }

    /// Download to a temp file, then rename into place.
    async fn download(&self, url: &str, dest: &Path) -> CoreResult<u64> {
        let response = self.http.get(url).send().await.map_err(|e| {
            CoreError::new(ErrorCode::NetworkTransport, "archive request failed")
                .with_context("url", url)
                .with_source(e)
        })?;

        let status = response.status().as_u16();
        if status != 200 {
            let code = classify_http_status(status);
            return Err(CoreError::new(code, "unexpected archive status")
                .with_context("url", url)
                .with_context("status", status));
        }

        let tmp = dest.with_extension(format!("tmp.{}", std::process::id()));
        let mut file = tokio::fs::File::create(&tmp).await.map_err(|e| {
            CoreError::new(ErrorCode::Internal, "failed to create temp cache file").with_source(e)
        })?;

        let mut bytes = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                CoreError::new(ErrorCode::NetworkTransport, "archive body stream failed")
                    .with_context("url", url)
                    .with_source(e)
            })?;
            bytes += chunk.len() as u64;
            file.write_all(&chunk).await.map_err(|e| {
                CoreError::new(ErrorCode::Internal, "failed to write cache file").with_source(e)
            })?;
        }
        file.flush().await.map_err(|e| {
            CoreError::new(ErrorCode::Internal, "failed to flush cache file").with_source(e)
        })?;
        drop(file);

        tokio::fs::rename(&tmp, dest).await.map_err(|e| {
            CoreError::new(ErrorCode::Internal, "failed to move cache file into place").with_source(e)
        })?;
        Ok(bytes)
    }

    /// Delete entries past the day cap, then LRU-by-mtime down to the byte cap.
    async fn apply_retention(&self) -> CoreResult<()> {
        let mut entries = self.cache_entries().await?;
        let now = SystemTime::now();
        let max_age = Duration::from_secs(u64::from(self.retain_max_days) * 24 * 3600);

        let mut kept = Vec::new();
        for (path, mtime, len) in entries.drain(..) {
            let too_old = now
                .duration_since(mtime)
                .map(|age| age > max_age)
                .unwrap_or(false);
            if too_old {
                remove_quietly(&path).await;
            } else {
                kept.push((path, mtime, len));
            }
        }

        let mut total: u64 = kept.iter().map(|(_, _, len)| len).sum();
        if total <= self.retain_max_bytes {
            return Ok(());
        }
        // Oldest first.
        kept.sort_by_key(|(_, mtime, _)| *mtime);
        for (path, _, len) in kept {
            if total <= self.retain_max_bytes {
                break;
            }
            remove_quietly(&path).await;
            total = total.saturating_sub(len);
        }
        Ok(())
    }

    async fn cache_entries(&self) -> CoreResult<Vec<(PathBuf, SystemTime, u64)>> {
        let mut out = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.cache_dir).await {
            Ok(dir) => dir,
            Err(_) => return Ok(out),
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("gz") {
                continue;
            }
            if let Ok(meta) = entry.metadata().await {
                let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                out.push((path, mtime, meta.len()));
            }
        }
        Ok(out)
    }
}

fn fs_metadata(path: &Path) -> Option<std::fs::Metadata> {
    std::fs::metadata(path).ok()
}

async fn remove_quietly(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        warn!(component = "fetch", path = %path.display(), error = %err, "cache eviction failed");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write as _;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gz(body: &str) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(body.as_bytes()).unwrap();
        enc.finish().unwrap()
    }

    fn hour(s: &str) -> HourRef {
        HourRef::parse(s).unwrap()
    }

    fn config(server_url: &str, cache_dir: &Path) -> IngestConfig {
        let pairs = [
            ("CORE_INGEST_BASE_URL", server_url.to_string()),
            ("CORE_INGEST_CACHE_DIR", cache_dir.display().to_string()),
        ];
        IngestConfig::load(&move |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
        })
        .unwrap()
    }

    #[tokio::test]
    async fn downloads_and_caches_an_hour() {
        let server = MockServer::start().await;
        let body = gz("{\"line\":1}\n");
        Mock::given(method("GET"))
            .and(path("/2025-08-01-0.json.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = Fetcher::new(&config(&server.uri(), dir.path())).unwrap();

        let first = fetcher.fetch(hour("2025-08-01T00")).await.unwrap();
        assert!(!first.from_cache);
        assert_eq!(first.bytes, body.len() as u64);
        assert!(first.path.exists());

        // Historical hour: the second fetch is a cache hit; the mock's
        // expect(1) verifies no second request went out.
        let second = fetcher.fetch(hour("2025-08-01T00")).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.path, first.path);
    }

    #[tokio::test]
    async fn missing_hour_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = Fetcher::new(&config(&server.uri(), dir.path())).unwrap();
        let err = fetcher.fetch(hour("2025-08-01T00")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::HourArchiveMissing);
    }

    #[tokio::test]
    async fn transient_5xx_retries_then_succeeds() {
        let server = MockServer::start().await;
        let body = gz("{}\n");
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = Fetcher::new(&config(&server.uri(), dir.path())).unwrap();
        let out = fetcher.fetch(hour("2025-08-01T00")).await.unwrap();
        assert!(!out.from_cache);
    }

    #[tokio::test]
    async fn url_scheme_matches_upstream_naming() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Fetcher::new(&config("http://host", dir.path())).unwrap();
        assert_eq!(
            fetcher.url_for(hour("2025-08-01T07")),
            "http://host/2025-08-01-7.json.gz"
        );
        assert!(fetcher
            .cache_path(hour("2025-08-01T07"))
            .ends_with("2025-08-01-07.json.gz"));
    }
}
