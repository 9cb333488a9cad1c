//! Object store — the persistent home of shared objects.
//!
//! DESIGN
//! ======
//! The coordinator never owns object identity: objects are created and
//! deleted by the store, and the coordinator only patches geometry and
//! attribute fields once a lease is confirmed held. `ObjectStore` is the seam;
//! `MemoryObjectStore` backs tests and database-less deployments, and
//! `PgObjectStore` writes through to `canvas_objects`.
//!
//! Updates use versioned last-writer-wins: a patch carrying an
//! `expected_version` older than the stored version is a `Conflict`.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::frame::{Data, ErrorCode};
use crate::lease::now_ms;
use crate::state::SharedObject;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(Uuid),
    #[error("conflicting update on {object_id}: expected version {expected}, current {current}")]
    Conflict { object_id: Uuid, expected: i32, current: i32 },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_OBJECT_NOT_FOUND",
            Self::Conflict { .. } => "E_OBJECT_CONFLICT",
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// Partial update of the fields the coordinator may touch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectPatch {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub rotation: Option<f64>,
    pub z_index: Option<i32>,
    pub color: Option<String>,
    pub props: Option<serde_json::Value>,
    pub expected_version: Option<i32>,
}

impl ObjectPatch {
    /// Pull patch fields out of a frame payload. Unknown keys are ignored.
    #[must_use]
    pub fn from_data(data: &Data) -> Self {
        Self {
            x: data.get("x").and_then(serde_json::Value::as_f64),
            y: data.get("y").and_then(serde_json::Value::as_f64),
            width: data.get("width").and_then(serde_json::Value::as_f64),
            height: data.get("height").and_then(serde_json::Value::as_f64),
            rotation: data.get("rotation").and_then(serde_json::Value::as_f64),
            z_index: data
                .get("z_index")
                .and_then(serde_json::Value::as_i64)
                .and_then(|z| i32::try_from(z).ok()),
            color: data.get("color").and_then(|v| v.as_str()).map(str::to_owned),
            props: data.get("props").cloned(),
            expected_version: data
                .get("version")
                .and_then(serde_json::Value::as_i64)
                .and_then(|v| i32::try_from(v).ok()),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.x.is_none()
            && self.y.is_none()
            && self.width.is_none()
            && self.height.is_none()
            && self.rotation.is_none()
            && self.z_index.is_none()
            && self.color.is_none()
            && self.props.is_none()
    }

    /// Fold a later patch over this one; later fields win.
    #[must_use]
    pub fn merge(self, later: ObjectPatch) -> ObjectPatch {
        ObjectPatch {
            x: later.x.or(self.x),
            y: later.y.or(self.y),
            width: later.width.or(self.width),
            height: later.height.or(self.height),
            rotation: later.rotation.or(self.rotation),
            z_index: later.z_index.or(self.z_index),
            color: later.color.or(self.color),
            props: later.props.or(self.props),
            expected_version: self.expected_version.or(later.expected_version),
        }
    }

    /// Apply fields in place. Does not touch `version` or timestamps.
    pub fn apply_to(&self, obj: &mut SharedObject) {
        if let Some(x) = self.x {
            obj.x = x;
        }
        if let Some(y) = self.y {
            obj.y = y;
        }
        if let Some(w) = self.width {
            obj.width = Some(w);
        }
        if let Some(h) = self.height {
            obj.height = Some(h);
        }
        if let Some(r) = self.rotation {
            obj.rotation = r;
        }
        if let Some(z) = self.z_index {
            obj.z_index = z;
        }
        if let Some(c) = &self.color {
            obj.color = Some(c.clone());
        }
        if let Some(p) = &self.props {
            obj.props = p.clone();
        }
    }
}

fn check_version(obj: &SharedObject, patch: &ObjectPatch) -> Result<(), StoreError> {
    match patch.expected_version {
        Some(expected) if expected < obj.version => {
            Err(StoreError::Conflict { object_id: obj.id, expected, current: obj.version })
        }
        _ => Ok(()),
    }
}

// =============================================================================
// STORE SEAM
// =============================================================================

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_objects_by_ids(&self, ids: &[Uuid]) -> Result<Vec<SharedObject>, StoreError>;

    /// Patch one object. Fails with `NotFound` or `Conflict`.
    async fn update_object(&self, id: Uuid, patch: &ObjectPatch) -> Result<SharedObject, StoreError>;

    async fn delete_objects(&self, ids: &[Uuid]) -> Result<(), StoreError>;

    async fn list_objects(&self, canvas_id: Uuid) -> Result<Vec<SharedObject>, StoreError>;
}

// =============================================================================
// IN-MEMORY
// =============================================================================

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<Uuid, SharedObject>>,
}

impl MemoryObjectStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object. Creation belongs to whoever owns the store, not the
    /// coordinator.
    pub async fn insert(&self, obj: SharedObject) {
        self.objects.write().await.insert(obj.id, obj);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get_objects_by_ids(&self, ids: &[Uuid]) -> Result<Vec<SharedObject>, StoreError> {
        let objects = self.objects.read().await;
        Ok(ids.iter().filter_map(|id| objects.get(id).cloned()).collect())
    }

    async fn update_object(&self, id: Uuid, patch: &ObjectPatch) -> Result<SharedObject, StoreError> {
        let mut objects = self.objects.write().await;
        let obj = objects.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        check_version(obj, patch)?;
        patch.apply_to(obj);
        obj.version += 1;
        obj.updated_at = now_ms();
        Ok(obj.clone())
    }

    async fn delete_objects(&self, ids: &[Uuid]) -> Result<(), StoreError> {
        let mut objects = self.objects.write().await;
        for id in ids {
            objects.remove(id);
        }
        Ok(())
    }

    async fn list_objects(&self, canvas_id: Uuid) -> Result<Vec<SharedObject>, StoreError> {
        let objects = self.objects.read().await;
        let mut listed: Vec<SharedObject> = objects
            .values()
            .filter(|o| o.canvas_id == canvas_id)
            .cloned()
            .collect();
        listed.sort_by_key(|o| (o.z_index, o.id));
        Ok(listed)
    }
}

// =============================================================================
// POSTGRES
// =============================================================================

const OBJECT_COLUMNS: &str = "id, canvas_id, kind, x, y, width, height, rotation, z_index, color, props, \
                              created_by, created_at, updated_at, version";

pub struct PgObjectStore {
    pool: PgPool,
}

impl PgObjectStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ObjectStore for PgObjectStore {
    async fn get_objects_by_ids(&self, ids: &[Uuid]) -> Result<Vec<SharedObject>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, SharedObject>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM canvas_objects WHERE id = ANY($1)"
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn update_object(&self, id: Uuid, patch: &ObjectPatch) -> Result<SharedObject, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut obj = sqlx::query_as::<_, SharedObject>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM canvas_objects WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound(id))?;

        check_version(&obj, patch)?;
        patch.apply_to(&mut obj);
        obj.version += 1;
        obj.updated_at = now_ms();

        sqlx::query(
            "UPDATE canvas_objects SET x = $2, y = $3, width = $4, height = $5, rotation = $6, \
             z_index = $7, color = $8, props = $9, updated_at = $10, version = $11 WHERE id = $1",
        )
        .bind(obj.id)
        .bind(obj.x)
        .bind(obj.y)
        .bind(obj.width)
        .bind(obj.height)
        .bind(obj.rotation)
        .bind(obj.z_index)
        .bind(&obj.color)
        .bind(&obj.props)
        .bind(obj.updated_at)
        .bind(obj.version)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(obj)
    }

    async fn delete_objects(&self, ids: &[Uuid]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("DELETE FROM canvas_objects WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_objects(&self, canvas_id: Uuid) -> Result<Vec<SharedObject>, StoreError> {
        let rows = sqlx::query_as::<_, SharedObject>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM canvas_objects WHERE canvas_id = $1 ORDER BY z_index ASC, id ASC"
        ))
        .bind(canvas_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
#[path = "object_test.rs"]
mod tests;
