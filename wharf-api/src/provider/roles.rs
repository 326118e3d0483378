//! Roles
//!
//! A role is a named scope: role admins only see principals carrying the
//! same role. Roles cannot be deleted while referenced.

use super::folders::map_db_err;
use crate::util;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use wharf_common::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Role {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl Role {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Validation("field \"name\" is required".to_string()));
        }
        if !crate::validation::is_valid_object_name(&self.name) {
            return Err(Error::Validation(format!(
                "field \"name\" is invalid: {:?}",
                self.name
            )));
        }
        Ok(())
    }
}

fn role_from_row(row: &sqlx::sqlite::SqliteRow) -> Role {
    Role {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub async fn get_role(pool: &SqlitePool, name: &str) -> Result<Role> {
    let row = sqlx::query("SELECT * FROM roles WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| Error::NotFound(format!("role {:?}", name)))?;
    Ok(role_from_row(&row))
}

pub async fn list_roles(
    pool: &SqlitePool,
    limit: i64,
    offset: i64,
    ascending: bool,
) -> Result<Vec<Role>> {
    let order = if ascending { "ASC" } else { "DESC" };
    let rows = sqlx::query(&format!(
        "SELECT * FROM roles ORDER BY name {} LIMIT ? OFFSET ?",
        order
    ))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .map_err(map_db_err)?;
    Ok(rows.iter().map(role_from_row).collect())
}

pub async fn add_role(pool: &SqlitePool, role: &Role) -> Result<i64> {
    let now = util::now_ms();
    let res = sqlx::query(
        "INSERT INTO roles (name, description, created_at, updated_at) VALUES (?, ?, ?, ?)",
    )
    .bind(&role.name)
    .bind(&role.description)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .map_err(map_db_err)?;
    Ok(res.last_insert_rowid())
}

pub async fn update_role(pool: &SqlitePool, role: &Role, expected_updated_at: i64) -> Result<()> {
    let res = sqlx::query(
        "UPDATE roles SET description = ?, updated_at = ? WHERE id = ? AND updated_at = ?",
    )
    .bind(&role.description)
    .bind(util::now_ms())
    .bind(role.id)
    .bind(expected_updated_at)
    .execute(pool)
    .await
    .map_err(map_db_err)?;
    if res.rows_affected() == 0 {
        return Err(Error::Stale(format!("role {:?}", role.name)));
    }
    Ok(())
}

pub async fn delete_role(pool: &SqlitePool, name: &str) -> Result<()> {
    let role_id: i64 = sqlx::query_scalar("SELECT id FROM roles WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
        .map_err(map_db_err)?
        .ok_or_else(|| Error::NotFound(format!("role {:?}", name)))?;
    let user_refs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE role_id = ?")
        .bind(role_id)
        .fetch_one(pool)
        .await
        .map_err(map_db_err)?;
    let admin_refs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM admins WHERE role_id = ?")
        .bind(role_id)
        .fetch_one(pool)
        .await
        .map_err(map_db_err)?;
    if user_refs + admin_refs > 0 {
        return Err(Error::Referenced(format!(
            "role {:?} is referenced by {} principals",
            name,
            user_refs + admin_refs
        )));
    }
    sqlx::query("DELETE FROM roles WHERE id = ?")
        .bind(role_id)
        .execute(pool)
        .await
        .map_err(map_db_err)?;
    Ok(())
}
