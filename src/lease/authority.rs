//! Arbitration authority — the single serialization point for leases.
//!
//! DESIGN
//! ======
//! The whole protocol needs exactly one strong primitive: an atomic
//! conditional write. `compare_and_swap_lease` replaces the stored lease for
//! an object only if it still equals `expected`; otherwise it reports the
//! current record so the caller can re-decide. Claims, extensions, releases
//! and expiries are all expressed through it.
//!
//! `MemoryAuthority` serializes through a mutex and is enough for a single
//! process. `PgLeaseAuthority` uses conditional `INSERT`/`UPDATE`/`DELETE`
//! statements on `object_leases`, so any number of processes can share it.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::Lease;
use crate::services::object::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    Swapped,
    /// The stored record no longer matched `expected`.
    Conflict { current: Option<Lease> },
}

#[async_trait]
pub trait LeaseAuthority: Send + Sync {
    async fn load(&self, object_id: Uuid) -> Result<Option<Lease>, StoreError>;

    async fn load_many(&self, object_ids: &[Uuid]) -> Result<Vec<Lease>, StoreError>;

    /// Atomically set the lease for `object_id` to `replacement` iff the
    /// stored lease equals `expected` (`None` meaning "no lease").
    async fn compare_and_swap_lease(
        &self,
        object_id: Uuid,
        expected: Option<&Lease>,
        replacement: Option<&Lease>,
    ) -> Result<CasOutcome, StoreError>;

    /// Unconditionally drop leases for objects that no longer exist.
    async fn purge(&self, object_ids: &[Uuid]) -> Result<(), StoreError>;
}

// =============================================================================
// IN-MEMORY
// =============================================================================

#[derive(Default)]
pub struct MemoryAuthority {
    leases: Mutex<HashMap<Uuid, Lease>>,
}

impl MemoryAuthority {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_leases<R>(&self, f: impl FnOnce(&mut HashMap<Uuid, Lease>) -> R) -> R {
        let mut leases = self
            .leases
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut leases)
    }
}

#[async_trait]
impl LeaseAuthority for MemoryAuthority {
    async fn load(&self, object_id: Uuid) -> Result<Option<Lease>, StoreError> {
        Ok(self.with_leases(|leases| leases.get(&object_id).cloned()))
    }

    async fn load_many(&self, object_ids: &[Uuid]) -> Result<Vec<Lease>, StoreError> {
        Ok(self.with_leases(|leases| {
            object_ids
                .iter()
                .filter_map(|id| leases.get(id).cloned())
                .collect()
        }))
    }

    async fn compare_and_swap_lease(
        &self,
        object_id: Uuid,
        expected: Option<&Lease>,
        replacement: Option<&Lease>,
    ) -> Result<CasOutcome, StoreError> {
        Ok(self.with_leases(|leases| {
            let current = leases.get(&object_id);
            if current != expected {
                return CasOutcome::Conflict { current: current.cloned() };
            }
            match replacement {
                Some(next) => {
                    leases.insert(object_id, next.clone());
                }
                None => {
                    leases.remove(&object_id);
                }
            }
            CasOutcome::Swapped
        }))
    }

    async fn purge(&self, object_ids: &[Uuid]) -> Result<(), StoreError> {
        self.with_leases(|leases| {
            for id in object_ids {
                leases.remove(id);
            }
        });
        Ok(())
    }
}

// =============================================================================
// POSTGRES
// =============================================================================

pub struct PgLeaseAuthority {
    pool: PgPool,
}

impl PgLeaseAuthority {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseAuthority for PgLeaseAuthority {
    async fn load(&self, object_id: Uuid) -> Result<Option<Lease>, StoreError> {
        let lease = sqlx::query_as::<_, Lease>(
            "SELECT object_id, owner_id, owner_name, claimed_at, expires_at FROM object_leases WHERE object_id = $1",
        )
        .bind(object_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(lease)
    }

    async fn load_many(&self, object_ids: &[Uuid]) -> Result<Vec<Lease>, StoreError> {
        if object_ids.is_empty() {
            return Ok(Vec::new());
        }
        let leases = sqlx::query_as::<_, Lease>(
            "SELECT object_id, owner_id, owner_name, claimed_at, expires_at FROM object_leases WHERE object_id = ANY($1)",
        )
        .bind(object_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(leases)
    }

    async fn compare_and_swap_lease(
        &self,
        object_id: Uuid,
        expected: Option<&Lease>,
        replacement: Option<&Lease>,
    ) -> Result<CasOutcome, StoreError> {
        let rows = match (expected, replacement) {
            (None, Some(next)) => sqlx::query(
                "INSERT INTO object_leases (object_id, owner_id, owner_name, claimed_at, expires_at) \
                 VALUES ($1, $2, $3, $4, $5) ON CONFLICT (object_id) DO NOTHING",
            )
            .bind(object_id)
            .bind(next.owner_id)
            .bind(&next.owner_name)
            .bind(next.claimed_at)
            .bind(next.expires_at)
            .execute(&self.pool)
            .await?
            .rows_affected(),
            (Some(prev), Some(next)) => sqlx::query(
                "UPDATE object_leases SET owner_id = $2, owner_name = $3, claimed_at = $4, expires_at = $5 \
                 WHERE object_id = $1 AND owner_id = $6 AND claimed_at = $7 AND expires_at = $8",
            )
            .bind(object_id)
            .bind(next.owner_id)
            .bind(&next.owner_name)
            .bind(next.claimed_at)
            .bind(next.expires_at)
            .bind(prev.owner_id)
            .bind(prev.claimed_at)
            .bind(prev.expires_at)
            .execute(&self.pool)
            .await?
            .rows_affected(),
            (Some(prev), None) => sqlx::query(
                "DELETE FROM object_leases \
                 WHERE object_id = $1 AND owner_id = $2 AND claimed_at = $3 AND expires_at = $4",
            )
            .bind(object_id)
            .bind(prev.owner_id)
            .bind(prev.claimed_at)
            .bind(prev.expires_at)
            .execute(&self.pool)
            .await?
            .rows_affected(),
            (None, None) => {
                let current = self.load(object_id).await?;
                return Ok(match current {
                    None => CasOutcome::Swapped,
                    Some(_) => CasOutcome::Conflict { current },
                });
            }
        };

        if rows == 1 {
            Ok(CasOutcome::Swapped)
        } else {
            Ok(CasOutcome::Conflict { current: self.load(object_id).await? })
        }
    }

    async fn purge(&self, object_ids: &[Uuid]) -> Result<(), StoreError> {
        if object_ids.is_empty() {
            return Ok(());
        }
        sqlx::query("DELETE FROM object_leases WHERE object_id = ANY($1)")
            .bind(object_ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "authority_test.rs"]
mod tests;
