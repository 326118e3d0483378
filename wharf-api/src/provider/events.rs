//! Event rule and action persistence
//!
//! Rules reference actions by name through a mapping table carrying the
//! per-invocation order and flags.

use super::folders::map_db_err;
use crate::events::actions::{EventAction, EventActionOptions};
use crate::events::rules::{EventConditions, EventRule, EventTrigger, RuleAction, RuleActionOptions};
use crate::util;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use wharf_common::{Error, Result};

fn action_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<EventAction> {
    let options: String = row.get("options");
    Ok(EventAction {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        options: serde_json::from_str::<EventActionOptions>(&options)
            .map_err(|e| Error::Internal(format!("corrupt action options: {}", e)))?,
    })
}

pub async fn get_action(pool: &SqlitePool, name: &str) -> Result<EventAction> {
    let row = sqlx::query("SELECT * FROM event_actions WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| Error::NotFound(format!("event action {:?}", name)))?;
    action_from_row(&row)
}

pub async fn list_actions(
    pool: &SqlitePool,
    limit: i64,
    offset: i64,
    ascending: bool,
) -> Result<Vec<EventAction>> {
    let order = if ascending { "ASC" } else { "DESC" };
    let rows = sqlx::query(&format!(
        "SELECT * FROM event_actions ORDER BY name {} LIMIT ? OFFSET ?",
        order
    ))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .map_err(map_db_err)?;
    rows.iter().map(action_from_row).collect()
}

pub async fn add_action(pool: &SqlitePool, action: &EventAction) -> Result<i64> {
    let options =
        serde_json::to_string(&action.options).map_err(|e| Error::Internal(e.to_string()))?;
    let res = sqlx::query(
        "INSERT INTO event_actions (name, description, type, options) VALUES (?, ?, ?, ?)",
    )
    .bind(&action.name)
    .bind(&action.description)
    .bind(action.type_id())
    .bind(&options)
    .execute(pool)
    .await
    .map_err(map_db_err)?;
    Ok(res.last_insert_rowid())
}

pub async fn update_action(pool: &SqlitePool, action: &EventAction) -> Result<()> {
    let options =
        serde_json::to_string(&action.options).map_err(|e| Error::Internal(e.to_string()))?;
    let res = sqlx::query(
        "UPDATE event_actions SET description = ?, type = ?, options = ? WHERE name = ?",
    )
    .bind(&action.description)
    .bind(action.type_id())
    .bind(&options)
    .bind(&action.name)
    .execute(pool)
    .await
    .map_err(map_db_err)?;
    if res.rows_affected() == 0 {
        return Err(Error::NotFound(format!("event action {:?}", action.name)));
    }
    Ok(())
}

/// Delete an action; blocked while rules reference it.
pub async fn delete_action(pool: &SqlitePool, name: &str) -> Result<()> {
    let action_id: i64 = sqlx::query_scalar("SELECT id FROM event_actions WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| Error::NotFound(format!("event action {:?}", name)))?;
    let refs: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM rules_actions_mapping WHERE action_id = ?")
            .bind(action_id)
            .fetch_one(pool)
            .await
            .map_err(map_db_err)?;
    if refs > 0 {
        return Err(Error::Referenced(format!(
            "event action {:?} is referenced by {} rules",
            name, refs
        )));
    }
    sqlx::query("DELETE FROM event_actions WHERE id = ?")
        .bind(action_id)
        .execute(pool)
        .await
        .map_err(map_db_err)?;
    Ok(())
}

fn rule_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<EventRule> {
    let conditions: String = row.get("conditions");
    let trigger: i32 = row.get("trigger");
    Ok(EventRule {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        status: row.get("status"),
        trigger: match trigger {
            1 => EventTrigger::FsEvent,
            2 => EventTrigger::ProviderEvent,
            3 => EventTrigger::Schedule,
            4 => EventTrigger::IpBlocked,
            _ => EventTrigger::Certificate,
        },
        conditions: serde_json::from_str::<EventConditions>(&conditions)
            .map_err(|e| Error::Internal(format!("corrupt rule conditions: {}", e)))?,
        actions: Vec::new(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

async fn load_rule_actions(pool: &SqlitePool, rule: &mut EventRule) -> Result<()> {
    let rows = sqlx::query(
        "SELECT a.name, m.\"order\", m.options FROM rules_actions_mapping m
         JOIN event_actions a ON a.id = m.action_id
         WHERE m.rule_id = ? ORDER BY m.\"order\" ASC",
    )
    .bind(rule.id)
    .fetch_all(pool)
    .await
    .map_err(map_db_err)?;
    rule.actions = rows
        .iter()
        .map(|row| {
            let options: String = row.get("options");
            RuleAction {
                name: row.get("name"),
                order: row.get("order"),
                options: serde_json::from_str::<RuleActionOptions>(&options)
                    .unwrap_or_default(),
            }
        })
        .collect();
    Ok(())
}

pub async fn get_rule(pool: &SqlitePool, name: &str) -> Result<EventRule> {
    let row = sqlx::query("SELECT * FROM event_rules WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| Error::NotFound(format!("event rule {:?}", name)))?;
    let mut rule = rule_from_row(&row)?;
    load_rule_actions(pool, &mut rule).await?;
    Ok(rule)
}

/// Enabled rules for one trigger, actions loaded and ordered.
pub async fn list_rules(pool: &SqlitePool, trigger: EventTrigger) -> Result<Vec<EventRule>> {
    let rows = sqlx::query("SELECT * FROM event_rules WHERE trigger = ? AND status = 1")
        .bind(trigger as i32)
        .fetch_all(pool)
        .await
        .map_err(map_db_err)?;
    let mut rules = rows.iter().map(rule_from_row).collect::<Result<Vec<_>>>()?;
    for rule in &mut rules {
        load_rule_actions(pool, rule).await?;
    }
    Ok(rules)
}

pub async fn list_all_rules(
    pool: &SqlitePool,
    limit: i64,
    offset: i64,
    ascending: bool,
) -> Result<Vec<EventRule>> {
    let order = if ascending { "ASC" } else { "DESC" };
    let rows = sqlx::query(&format!(
        "SELECT * FROM event_rules ORDER BY name {} LIMIT ? OFFSET ?",
        order
    ))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .map_err(map_db_err)?;
    let mut rules = rows.iter().map(rule_from_row).collect::<Result<Vec<_>>>()?;
    for rule in &mut rules {
        load_rule_actions(pool, rule).await?;
    }
    Ok(rules)
}

async fn replace_rule_actions(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    rule_id: i64,
    actions: &[RuleAction],
) -> Result<()> {
    sqlx::query("DELETE FROM rules_actions_mapping WHERE rule_id = ?")
        .bind(rule_id)
        .execute(&mut **tx)
        .await
        .map_err(map_db_err)?;
    for action in actions {
        let action_id: i64 = sqlx::query_scalar("SELECT id FROM event_actions WHERE name = ?")
            .bind(&action.name)
            .fetch_optional(&mut **tx)
            .await
            .map_err(map_db_err)?
            .ok_or_else(|| Error::NotFound(format!("event action {:?}", action.name)))?;
        let options = serde_json::to_string(&action.options)
            .map_err(|e| Error::Internal(e.to_string()))?;
        sqlx::query(
            "INSERT INTO rules_actions_mapping (rule_id, action_id, \"order\", options)
             VALUES (?, ?, ?, ?)",
        )
        .bind(rule_id)
        .bind(action_id)
        .bind(action.order)
        .bind(&options)
        .execute(&mut **tx)
        .await
        .map_err(map_db_err)?;
    }
    Ok(())
}

pub async fn add_rule(pool: &SqlitePool, rule: &EventRule) -> Result<i64> {
    let now = util::now_ms();
    let conditions =
        serde_json::to_string(&rule.conditions).map_err(|e| Error::Internal(e.to_string()))?;
    let mut tx = pool.begin().await.map_err(map_db_err)?;
    let res = sqlx::query(
        "INSERT INTO event_rules (name, description, status, trigger, conditions, created_at,
         updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&rule.name)
    .bind(&rule.description)
    .bind(rule.status)
    .bind(rule.trigger as i32)
    .bind(&conditions)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(map_db_err)?;
    let rule_id = res.last_insert_rowid();
    replace_rule_actions(&mut tx, rule_id, &rule.actions).await?;
    tx.commit().await.map_err(map_db_err)?;
    Ok(rule_id)
}

pub async fn update_rule(pool: &SqlitePool, rule: &EventRule) -> Result<()> {
    let conditions =
        serde_json::to_string(&rule.conditions).map_err(|e| Error::Internal(e.to_string()))?;
    let mut tx = pool.begin().await.map_err(map_db_err)?;
    let res = sqlx::query(
        "UPDATE event_rules SET description = ?, status = ?, trigger = ?, conditions = ?,
         updated_at = ? WHERE id = ?",
    )
    .bind(&rule.description)
    .bind(rule.status)
    .bind(rule.trigger as i32)
    .bind(&conditions)
    .bind(util::now_ms())
    .bind(rule.id)
    .execute(&mut *tx)
    .await
    .map_err(map_db_err)?;
    if res.rows_affected() == 0 {
        return Err(Error::NotFound(format!("event rule {:?}", rule.name)));
    }
    replace_rule_actions(&mut tx, rule.id, &rule.actions).await?;
    tx.commit().await.map_err(map_db_err)?;
    Ok(())
}

pub async fn delete_rule(pool: &SqlitePool, name: &str) -> Result<()> {
    let res = sqlx::query("DELETE FROM event_rules WHERE name = ?")
        .bind(name)
        .execute(pool)
        .await
        .map_err(map_db_err)?;
    if res.rows_affected() == 0 {
        return Err(Error::NotFound(format!("event rule {:?}", name)));
    }
    Ok(())
}
