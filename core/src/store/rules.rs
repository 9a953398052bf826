//! Compliance rule queries.

use super::{enum_from, enum_text, from_json, to_json, RuleStore, SqliteStore};
use crate::{error::ComplianceResult, rules::ComplianceRule};
use rusqlite::params;

impl RuleStore for SqliteStore {
    fn load_rules(&self) -> ComplianceResult<Vec<ComplianceRule>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, description, rule_type, priority, enabled, condition, action, metadata
             FROM compliance_rules
             ORDER BY priority DESC, id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ComplianceRule {
                id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                rule_type: enum_from(3, row.get(3)?)?,
                priority: row.get(4)?,
                enabled: row.get(5)?,
                condition: from_json(6, &row.get::<_, String>(6)?)?,
                action: enum_from(7, row.get(7)?)?,
                metadata: from_json(8, &row.get::<_, String>(8)?)?,
            })
        })?;

        let mut rules = Vec::new();
        for row in rows {
            match row {
                Ok(rule) => rules.push(rule),
                Err(e @ rusqlite::Error::FromSqlConversionFailure(..)) => {
                    log::warn!("skipping malformed stored compliance rule: {e}")
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(rules)
    }

    fn upsert_rule(&self, rule: &ComplianceRule) -> ComplianceResult<()> {
        self.conn()?.execute(
            "INSERT INTO compliance_rules
                (id, name, description, rule_type, priority, enabled, condition, action, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                rule_type = excluded.rule_type,
                priority = excluded.priority,
                enabled = excluded.enabled,
                condition = excluded.condition,
                action = excluded.action,
                metadata = excluded.metadata",
            params![
                rule.id,
                rule.name,
                rule.description,
                enum_text(&rule.rule_type)?,
                rule.priority,
                rule.enabled,
                to_json(&rule.condition)?,
                enum_text(&rule.action)?,
                to_json(&rule.metadata)?,
            ],
        )?;
        Ok(())
    }

    fn delete_rule(&self, id: &str) -> ComplianceResult<bool> {
        let deleted = self
            .conn()?
            .execute("DELETE FROM compliance_rules WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Condition, RuleAction, RuleType};

    fn rule(id: &str, enabled: bool) -> ComplianceRule {
        ComplianceRule {
            id: id.into(),
            name: id.into(),
            description: String::new(),
            rule_type: RuleType::Kyc,
            priority: 0,
            enabled,
            condition: Condition::Exists { field: "user.id".into() },
            action: RuleAction::Reject,
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn load_keeps_disabled_rules_and_skips_unreadable_rows() {
        let store = SqliteStore::in_memory().unwrap();
        store.migrate().unwrap();
        store.upsert_rule(&rule("on", true)).unwrap();
        store.upsert_rule(&rule("off", false)).unwrap();
        store
            .conn()
            .unwrap()
            .execute(
                "INSERT INTO compliance_rules (id, name, rule_type, condition, action)
                 VALUES ('broken', 'broken', 'kyc', '{\"between\":{}}', 'reject')",
                [],
            )
            .unwrap();

        let loaded = store.load_rules().unwrap();
        let ids: Vec<(&str, bool)> = loaded.iter().map(|r| (r.id.as_str(), r.enabled)).collect();
        assert_eq!(ids, vec![("off", false), ("on", true)]);
    }
}
