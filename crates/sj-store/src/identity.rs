// SPDX-License-Identifier: MIT OR Apache-2.0
//! Principal identity upserts.
//!
//! Every batch of utterances ensures its repo/actor principals exist before
//! the insert transaction. Principal inserts are ordered by HID to keep lock
//! acquisition order consistent across workers, retried on serialization and
//! deadlock failures, and throttled by a small semaphore so a wide worker
//! pool cannot pile onto the same rows.

use crate::{map_db_err, PgStore};
use sj_error::CoreResult;
use sj_identity::Hid;
use sj_retry::{retry_async, BackoffPolicy};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

/// Upsert throttle width.
const UPSERT_PERMITS: usize = 2;

/// Repository over `principals` and `principal_ids`.
#[derive(Clone)]
pub struct IdentityStore {
    store: PgStore,
    permits: Arc<Semaphore>,
}

impl IdentityStore {
    /// Wrap a store handle.
    pub fn new(store: PgStore) -> Self {
        Self {
            store,
            permits: Arc::new(Semaphore::new(UPSERT_PERMITS)),
        }
    }

    /// Ensure principal and mapping rows for the given HID → numeric-ID sets.
    ///
    /// Uses `BTreeMap` inputs so the staged arrays arrive ordered by HID.
    pub async fn ensure_principals_and_maps(
        &self,
        repos: &BTreeMap<Hid, i64>,
        actors: &BTreeMap<Hid, i64>,
    ) -> CoreResult<()> {
        if repos.is_empty() && actors.is_empty() {
            return Ok(());
        }

        // Throttle: bounded concurrent upserts avoid deadlock storms.
        let _permit = self.permits.clone().acquire_owned().await.map_err(|_| {
            sj_error::CoreError::new(sj_error::ErrorCode::Internal, "identity semaphore closed")
        })?;

        retry_async(&BackoffPolicy::identity(), "ensure_principals", |_| async {
            self.upsert_once(repos, actors).await
        })
        .await?;

        debug!(
            component = "identity",
            repos = repos.len(),
            actors = actors.len(),
            "principals ensured"
        );
        Ok(())
    }

    async fn upsert_once(
        &self,
        repos: &BTreeMap<Hid, i64>,
        actors: &BTreeMap<Hid, i64>,
    ) -> CoreResult<()> {
        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(|e| map_db_err(e, "identity begin"))?;

        for (kind, set) in [("repo", repos), ("actor", actors)] {
            if set.is_empty() {
                continue;
            }
            // BTreeMap iteration gives ascending HID order.
            let hids: Vec<String> = set.keys().map(Hid::to_hex).collect();
            let ids: Vec<i64> = set.values().copied().collect();

            sqlx::query(
                r#"
                INSERT INTO principals (hid, kind)
                SELECT h, $2 FROM UNNEST($1::text[]) AS h
                ON CONFLICT (hid) DO NOTHING
                "#,
            )
            .bind(&hids)
            .bind(kind)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_db_err(e, "insert principals"))?;

            sqlx::query(
                r#"
                INSERT INTO principal_ids (hid, kind, numeric_id)
                SELECT h, $3, n
                FROM UNNEST($1::text[], $2::bigint[]) AS t(h, n)
                ON CONFLICT (hid) DO UPDATE SET numeric_id = EXCLUDED.numeric_id
                "#,
            )
            .bind(&hids)
            .bind(&ids)
            .bind(kind)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_db_err(e, "upsert principal_ids"))?;
        }

        tx.commit().await.map_err(|e| map_db_err(e, "identity commit"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sj_identity::repo_hid32;

    #[test]
    fn btreemap_orders_hids_ascending() {
        let mut set = BTreeMap::new();
        for id in [5i64, 1, 9, 3] {
            set.insert(repo_hid32(id), id);
        }
        let hids: Vec<String> = set.keys().map(Hid::to_hex).collect();
        let mut sorted = hids.clone();
        sorted.sort();
        assert_eq!(hids, sorted);
    }
}
