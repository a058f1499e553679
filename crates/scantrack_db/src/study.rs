//! Study, site and scantype operations.
//!
//! Studies, sites and scan types are normally registered by the dashboard
//! itself; the helpers here exist so a store can be stood up from a study
//! configuration file (and in tests).

use crate::error::{DbError, Result};
use crate::types::*;
use crate::DashboardDb;
use sqlx::Row;

impl DashboardDb {
    /// Look up a study by nickname.
    pub async fn get_study(&self, nickname: &str) -> Result<Study> {
        let row = sqlx::query("SELECT id, nickname FROM studies WHERE nickname = ?")
            .bind(nickname)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Study {
                id: row.get("id"),
                nickname: row.get("nickname"),
            }),
            None => Err(DbError::not_found(format!(
                "Study not found: {nickname}"
            ))),
        }
    }

    /// Register a study if it does not already exist.
    pub async fn add_study(&self, nickname: &str) -> Result<Study> {
        sqlx::query("INSERT INTO studies (nickname) VALUES (?) ON CONFLICT(nickname) DO NOTHING")
            .bind(nickname)
            .execute(&self.pool)
            .await?;

        self.get_study(nickname).await
    }

    /// Register a site for a study if it does not already exist.
    pub async fn add_site(&self, study: &Study, name: &str) -> Result<Site> {
        sqlx::query(
            "INSERT INTO sites (study_id, name) VALUES (?, ?) ON CONFLICT(study_id, name) DO NOTHING",
        )
        .bind(study.id)
        .bind(name)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT id, study_id, name FROM sites WHERE study_id = ? AND name = ?")
            .bind(study.id)
            .bind(name)
            .fetch_one(&self.pool)
            .await?;

        Ok(Site {
            id: row.get("id"),
            study_id: row.get("study_id"),
            name: row.get("name"),
        })
    }

    /// List the sites registered for a study.
    pub async fn study_sites(&self, study: &Study) -> Result<Vec<Site>> {
        let rows = sqlx::query("SELECT id, study_id, name FROM sites WHERE study_id = ? ORDER BY name")
            .bind(study.id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| Site {
                id: row.get("id"),
                study_id: row.get("study_id"),
                name: row.get("name"),
            })
            .collect())
    }

    /// Register a scan type and mark it valid for a study.
    pub async fn add_scantype(&self, study: &Study, name: &str, is_linked: bool) -> Result<ScanType> {
        sqlx::query(
            "INSERT INTO scantypes (name, is_linked) VALUES (?, ?) ON CONFLICT(name) DO UPDATE SET is_linked = excluded.is_linked",
        )
        .bind(name)
        .bind(is_linked)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT id, name, is_linked FROM scantypes WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;

        let scantype = ScanType {
            id: row.get("id"),
            name: row.get("name"),
            is_linked: row.get("is_linked"),
        };

        sqlx::query(
            "INSERT INTO study_scantypes (study_id, scantype_id) VALUES (?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(study.id)
        .bind(scantype.id)
        .execute(&self.pool)
        .await?;

        Ok(scantype)
    }

    /// Look up a scan type by tag, requiring it to be registered as valid
    /// for the study. Fails closed on unregistered tags.
    pub async fn get_study_scantype(&self, study: &Study, tag: &str) -> Result<ScanType> {
        let row = sqlx::query(
            r#"
            SELECT st.id, st.name, st.is_linked
            FROM scantypes st
            JOIN study_scantypes ss ON ss.scantype_id = st.id
            WHERE ss.study_id = ? AND st.name = ?
            "#,
        )
        .bind(study.id)
        .bind(tag)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(ScanType {
                id: row.get("id"),
                name: row.get("name"),
                is_linked: row.get("is_linked"),
            }),
            None => Err(DbError::InvalidScanType(format!(
                "Scantype '{tag}' not valid for study '{}'",
                study.nickname
            ))),
        }
    }
}
