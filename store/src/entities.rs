//! Tier-1 entity caches: planteurs, chef-planteurs, warehouses.
//!
//! All three tables share one shape; planteurs additionally carry their
//! chef assignment and cultivated surface. `name_norm` is recomputed on
//! every write so it stays a pure function of `name`.

use ct_core::types::{CachedEntity, CooperativeId, EntityTable};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::time::{fmt_ts, parse_opt_ts, parse_ts};

/// Chef-assignment statistics over planteurs (counts and surface sums).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanteurStats {
    pub total: u64,
    pub assigned: u64,
    pub orphan: u64,
    pub total_surface_ha: f64,
    pub assigned_surface_ha: f64,
    pub orphan_surface_ha: f64,
}

#[derive(Debug, Clone)]
pub struct EntityStore {
    pool: SqlitePool,
}

fn entity_table_name(table: EntityTable) -> StoreResult<&'static str> {
    match table {
        EntityTable::Planteurs => Ok("planteurs"),
        EntityTable::ChefPlanteurs => Ok("chef_planteurs"),
        EntityTable::Warehouses => Ok("warehouses"),
        EntityTable::Deliveries => Err(StoreError::InvalidTable("deliveries".to_string())),
    }
}

impl EntityStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn put(&self, table: EntityTable, entity: &CachedEntity) -> StoreResult<()> {
        let name = entity_table_name(table)?;
        let mut tx = self.pool.begin().await?;
        put_in_tx(&mut tx, name, entity).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Atomic multi-put: either the whole batch lands or none of it.
    pub async fn put_batch(&self, table: EntityTable, entities: &[CachedEntity]) -> StoreResult<()> {
        let name = entity_table_name(table)?;
        let mut tx = self.pool.begin().await?;
        for entity in entities {
            put_in_tx(&mut tx, name, entity).await?;
        }
        tx.commit().await?;
        debug!(table = name, count = entities.len(), "Entity batch persisted");
        Ok(())
    }

    pub async fn get(&self, table: EntityTable, id: &str) -> StoreResult<Option<CachedEntity>> {
        let name = entity_table_name(table)?;
        let row = sqlx::query(&format!("SELECT * FROM {name} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_row(name, &r)).transpose()
    }

    pub async fn get_by_code(
        &self,
        table: EntityTable,
        code: &str,
    ) -> StoreResult<Option<CachedEntity>> {
        let name = entity_table_name(table)?;
        let row = sqlx::query(&format!("SELECT * FROM {name} WHERE code = ?1"))
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_row(name, &r)).transpose()
    }

    pub async fn delete(&self, table: EntityTable, id: &str) -> StoreResult<bool> {
        let name = entity_table_name(table)?;
        let result = sqlx::query(&format!("DELETE FROM {name} WHERE id = ?1"))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count(&self, table: EntityTable) -> StoreResult<u64> {
        let name = entity_table_name(table)?;
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {name}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    pub async fn get_all(&self, table: EntityTable) -> StoreResult<Vec<CachedEntity>> {
        let name = entity_table_name(table)?;
        let rows = sqlx::query(&format!("SELECT * FROM {name} ORDER BY name_norm ASC"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|r| map_row(name, r)).collect()
    }

    pub async fn by_cooperative(
        &self,
        table: EntityTable,
        cooperative_id: &CooperativeId,
    ) -> StoreResult<Vec<CachedEntity>> {
        let name = entity_table_name(table)?;
        let rows = sqlx::query(&format!(
            "SELECT * FROM {name} WHERE cooperative_id = ?1 ORDER BY name_norm ASC"
        ))
        .bind(cooperative_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| map_row(name, r)).collect()
    }

    /// Prefix search over `name_norm`. The query is normalized the same
    /// way names are, so `"Kouamé"` finds `"kouame ..."`.
    pub async fn search_prefix(
        &self,
        table: EntityTable,
        query: &str,
        limit: usize,
    ) -> StoreResult<Vec<CachedEntity>> {
        let name = entity_table_name(table)?;
        let prefix = utils::normalize_name(query)
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let rows = sqlx::query(&format!(
            "SELECT * FROM {name} WHERE name_norm LIKE ?1 ESCAPE '\\'
             ORDER BY name_norm ASC LIMIT ?2"
        ))
        .bind(format!("{prefix}%"))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| map_row(name, r)).collect()
    }

    pub async fn planteurs_by_chef(&self, chef_id: &str) -> StoreResult<Vec<CachedEntity>> {
        let rows = sqlx::query(
            "SELECT * FROM planteurs WHERE chef_planteur_id = ?1 ORDER BY name_norm ASC",
        )
        .bind(chef_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| map_row("planteurs", r)).collect()
    }

    /// Assignment statistics: `total = assigned + orphan`, in counts and
    /// in surface hectares.
    pub async fn planteur_stats(
        &self,
        cooperative_id: Option<&CooperativeId>,
    ) -> StoreResult<PlanteurStats> {
        let (filter, bind) = match cooperative_id {
            Some(coop) => ("WHERE cooperative_id = ?1", Some(coop.as_str())),
            None => ("", None),
        };
        let sql = format!(
            "SELECT
                 COUNT(*) AS total,
                 COALESCE(SUM(chef_planteur_id IS NOT NULL), 0) AS assigned,
                 COALESCE(SUM(surface_ha), 0.0) AS total_surface,
                 COALESCE(SUM(CASE WHEN chef_planteur_id IS NOT NULL THEN surface_ha END), 0.0)
                     AS assigned_surface
             FROM planteurs {filter}"
        );
        let mut query = sqlx::query(&sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        let row = query.fetch_one(&self.pool).await?;

        let total = row.get::<i64, _>("total") as u64;
        let assigned = row.get::<i64, _>("assigned") as u64;
        let total_surface: f64 = row.get("total_surface");
        let assigned_surface: f64 = row.get("assigned_surface");
        Ok(PlanteurStats {
            total,
            assigned,
            orphan: total - assigned,
            total_surface_ha: total_surface,
            assigned_surface_ha: assigned_surface,
            orphan_surface_ha: total_surface - assigned_surface,
        })
    }

    /// Clear one entity cache. Returns rows removed.
    pub async fn clear(&self, table: EntityTable) -> StoreResult<u64> {
        let name = entity_table_name(table)?;
        let result = sqlx::query(&format!("DELETE FROM {name}"))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

pub(crate) async fn put_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    name: &str,
    entity: &CachedEntity,
) -> StoreResult<()> {
    let name_norm = utils::normalize_name(&entity.name);
    if name == "planteurs" {
        sqlx::query(
            "INSERT INTO planteurs (id, cooperative_id, code, name, name_norm, chef_planteur_id,
                 surface_ha, data, validation_warnings, updated_at, cached_at, synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                 cooperative_id = excluded.cooperative_id,
                 code = excluded.code,
                 name = excluded.name,
                 name_norm = excluded.name_norm,
                 chef_planteur_id = excluded.chef_planteur_id,
                 surface_ha = excluded.surface_ha,
                 data = excluded.data,
                 validation_warnings = excluded.validation_warnings,
                 updated_at = excluded.updated_at,
                 cached_at = excluded.cached_at,
                 synced_at = excluded.synced_at",
        )
        .bind(&entity.id)
        .bind(entity.cooperative_id.as_str())
        .bind(&entity.code)
        .bind(&entity.name)
        .bind(name_norm)
        .bind(&entity.chef_planteur_id)
        .bind(entity.surface_ha)
        .bind(entity.data.to_string())
        .bind(serde_json::to_string(&entity.validation_warnings)?)
        .bind(fmt_ts(entity.updated_at))
        .bind(fmt_ts(entity.cached_at))
        .bind(entity.synced_at.map(fmt_ts))
        .execute(&mut **tx)
        .await?;
    } else {
        sqlx::query(&format!(
            "INSERT INTO {name} (id, cooperative_id, code, name, name_norm, data,
                 validation_warnings, updated_at, cached_at, synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                 cooperative_id = excluded.cooperative_id,
                 code = excluded.code,
                 name = excluded.name,
                 name_norm = excluded.name_norm,
                 data = excluded.data,
                 validation_warnings = excluded.validation_warnings,
                 updated_at = excluded.updated_at,
                 cached_at = excluded.cached_at,
                 synced_at = excluded.synced_at"
        ))
        .bind(&entity.id)
        .bind(entity.cooperative_id.as_str())
        .bind(&entity.code)
        .bind(&entity.name)
        .bind(name_norm)
        .bind(entity.data.to_string())
        .bind(serde_json::to_string(&entity.validation_warnings)?)
        .bind(fmt_ts(entity.updated_at))
        .bind(fmt_ts(entity.cached_at))
        .bind(entity.synced_at.map(fmt_ts))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

fn map_row(table: &str, row: &SqliteRow) -> StoreResult<CachedEntity> {
    // The three entity tables share this mapper; the planteur-only columns
    // are absent elsewhere and fall back to None.
    let table_static: &'static str = match table {
        "planteurs" => "planteurs",
        "chef_planteurs" => "chef_planteurs",
        _ => "warehouses",
    };
    let cooperative_id: String = row.get("cooperative_id");
    let warnings: String = row.get("validation_warnings");
    let data: String = row.get("data");

    Ok(CachedEntity {
        id: row.get("id"),
        cooperative_id: cooperative_id.parse().map_err(|_| {
            StoreError::corrupt(table_static, "cooperative_id", cooperative_id.clone())
        })?,
        code: row.get("code"),
        name: row.get("name"),
        name_norm: row.get("name_norm"),
        chef_planteur_id: row.try_get("chef_planteur_id").ok().flatten(),
        surface_ha: row.try_get("surface_ha").ok().flatten(),
        data: serde_json::from_str(&data)?,
        validation_warnings: serde_json::from_str(&warnings)?,
        updated_at: parse_ts(table_static, "updated_at", &row.get::<String, _>("updated_at"))?,
        cached_at: parse_ts(table_static, "cached_at", &row.get::<String, _>("cached_at"))?,
        synced_at: parse_opt_ts(table_static, "synced_at", row.get("synced_at"))?,
    })
}
