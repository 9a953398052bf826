//! Sanctions list, entry and screening log queries.

use super::{enum_from, enum_text, from_json, parse_ts, to_json, ts, SanctionsStore, SqliteStore};
use crate::{
    error::ComplianceResult,
    screening::{ListSource, SanctionEntry, SanctionsList, ScreeningLogEntry},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

impl SanctionsStore for SqliteStore {
    fn load_active_lists(&self) -> ComplianceResult<Vec<SanctionsList>> {
        let conn = self.conn()?;
        let mut list_stmt = conn.prepare(
            "SELECT id, name, source, active, last_updated
             FROM sanctions_lists
             WHERE active = 1
             ORDER BY id ASC",
        )?;
        let mut lists = list_stmt
            .query_map([], |row| {
                Ok(SanctionsList {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    source: enum_from(2, row.get(2)?)?,
                    active: row.get(3)?,
                    last_updated: parse_ts(4, &row.get::<_, String>(4)?)?,
                    entries: Vec::new(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut entry_stmt = conn.prepare(
            "SELECT id, entry_type, names, aliases, identifiers, addresses, date_of_birth,
                    place_of_birth, nationality, programs, remarks, risk_score
             FROM sanctions_entries
             WHERE list_id = ?1
             ORDER BY id ASC",
        )?;
        for list in &mut lists {
            list.entries = entry_stmt
                .query_map(params![list.id], |row| {
                    Ok(SanctionEntry {
                        id: row.get(0)?,
                        entry_type: enum_from(1, row.get(1)?)?,
                        names: from_json(2, &row.get::<_, String>(2)?)?,
                        aliases: from_json(3, &row.get::<_, String>(3)?)?,
                        identifiers: from_json(4, &row.get::<_, String>(4)?)?,
                        addresses: from_json(5, &row.get::<_, String>(5)?)?,
                        date_of_birth: row.get(6)?,
                        place_of_birth: row.get(7)?,
                        nationality: from_json(8, &row.get::<_, String>(8)?)?,
                        programs: from_json(9, &row.get::<_, String>(9)?)?,
                        remarks: row.get(10)?,
                        risk_score: row.get(11)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
        }
        Ok(lists)
    }

    fn upsert_list(&self, list: &SanctionsList) -> ComplianceResult<()> {
        self.conn()?.execute(
            "INSERT INTO sanctions_lists (id, name, source, active, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                source = excluded.source,
                active = excluded.active,
                last_updated = excluded.last_updated",
            params![
                list.id,
                list.name,
                enum_text(&list.source)?,
                list.active,
                ts(&list.last_updated),
            ],
        )?;
        Ok(())
    }

    fn ensure_custom_list(&self, name: &str, now: DateTime<Utc>) -> ComplianceResult<String> {
        let conn = self.conn()?;
        let custom = enum_text(&ListSource::Custom)?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM sanctions_lists WHERE name = ?1 AND source = ?2",
                params![name, custom],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }

        let id = format!("custom-{}", uuid::Uuid::new_v4());
        conn.execute(
            "INSERT INTO sanctions_lists (id, name, source, active, last_updated)
             VALUES (?1, ?2, ?3, 1, ?4)",
            params![id, name, custom, ts(&now)],
        )?;
        Ok(id)
    }

    fn insert_entry(&self, list_id: &str, entry: &SanctionEntry) -> ComplianceResult<()> {
        self.conn()?.execute(
            "INSERT INTO sanctions_entries
                (id, list_id, entry_type, names, aliases, identifiers, addresses, date_of_birth,
                 place_of_birth, nationality, programs, remarks, risk_score)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                entry.id,
                list_id,
                enum_text(&entry.entry_type)?,
                to_json(&entry.names)?,
                to_json(&entry.aliases)?,
                to_json(&entry.identifiers)?,
                to_json(&entry.addresses)?,
                entry.date_of_birth,
                entry.place_of_birth,
                to_json(&entry.nationality)?,
                to_json(&entry.programs)?,
                entry.remarks,
                entry.risk_score,
            ],
        )?;
        Ok(())
    }

    fn delete_entry(&self, entry_id: &str) -> ComplianceResult<bool> {
        let deleted = self.conn()?.execute(
            "DELETE FROM sanctions_entries
             WHERE id = ?1
               AND list_id IN (SELECT id FROM sanctions_lists WHERE source = ?2)",
            params![entry_id, enum_text(&ListSource::Custom)?],
        )?;
        Ok(deleted > 0)
    }

    fn append_screening_log(&self, entry: &ScreeningLogEntry) -> ComplianceResult<()> {
        self.conn()?.execute(
            "INSERT INTO sanctions_screening_log
                (id, request, result, status, cache_hit, duration_ms, logged_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.id,
                to_json(&entry.request)?,
                to_json(&entry.result)?,
                enum_text(&entry.result.status)?,
                entry.cache_hit,
                i64::try_from(entry.duration_ms).unwrap_or(i64::MAX),
                ts(&entry.logged_at),
            ],
        )?;
        Ok(())
    }
}

impl SqliteStore {
    /// Number of screening calls recorded in the audit log.
    pub fn screening_log_count(&self) -> ComplianceResult<i64> {
        let count = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM sanctions_screening_log", [], |row| row.get(0))?;
        Ok(count)
    }
}
