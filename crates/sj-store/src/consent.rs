// SPDX-License-Identifier: MIT OR Apache-2.0
//! Consent lookups the core depends on.
//!
//! Two capabilities only: deny-set membership (gates every raw read) and
//! opt-in receipts (gates the `repo_name` reveal at archive time). The
//! consent service itself is an external collaborator; these queries read
//! the views it maintains.

use crate::{map_db_err, PgStore};
use sj_error::CoreResult;
use sj_identity::Hid;
use sqlx::Row;

/// Read-only consent queries.
#[derive(Clone)]
pub struct ConsentStore {
    store: PgStore,
}

impl ConsentStore {
    /// Wrap a store handle.
    pub fn new(store: PgStore) -> Self {
        Self { store }
    }

    /// Whether a repo HID is currently denied.
    pub async fn repo_denied(&self, hid: Hid) -> CoreResult<bool> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM active_deny_repos WHERE repo_hid = $1) AS denied")
            .bind(hid.to_hex())
            .fetch_one(self.store.pool())
            .await
            .map_err(|e| map_db_err(e, "repo_denied"))?;
        Ok(row.get("denied"))
    }

    /// Whether an actor HID is currently denied.
    pub async fn actor_denied(&self, hid: Hid) -> CoreResult<bool> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM active_deny_actors WHERE actor_hid = $1) AS denied")
            .bind(hid.to_hex())
            .fetch_one(self.store.pool())
            .await
            .map_err(|e| map_db_err(e, "actor_denied"))?;
        Ok(row.get("denied"))
    }

    /// Repo HIDs (of the given set) holding an active opt-in receipt.
    ///
    /// Nightshift consults this at archive time; only these repos get their
    /// `repo_name` persisted into the archive.
    pub async fn optin_repos(&self, hids: &[Hid]) -> CoreResult<Vec<Hid>> {
        if hids.is_empty() {
            return Ok(Vec::new());
        }
        let hex: Vec<String> = hids.iter().map(Hid::to_hex).collect();
        let rows = sqlx::query(
            r#"
            SELECT repo_hid FROM optin_receipts
            WHERE repo_hid = ANY($1) AND revoked_at IS NULL
            "#,
        )
        .bind(&hex)
        .fetch_all(self.store.pool())
        .await
        .map_err(|e| map_db_err(e, "optin_repos"))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if let Ok(hid) = Hid::from_hex(&row.get::<String, _>("repo_hid")) {
                out.push(hid);
            }
        }
        Ok(out)
    }
}
