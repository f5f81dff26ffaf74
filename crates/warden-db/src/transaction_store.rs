//! Ephemeral storage for in-flight ceremonies.
//!
//! A ceremony start writes a payload keyed by `hex(SHA-256(challenge))`;
//! the matching complete call retrieves it exactly once. Two backends
//! satisfy the same observable contract:
//!
//! * [`DbStore`] — rows in the relational store, manipulated inside the
//!   caller's open transaction. A user row is created lazily here so that
//!   the first ceremony of a brand-new user can proceed.
//! * [`CacheStore`] — Redis, for deployments that want ceremony state out
//!   of the database. Per-user id list under `"{client_id}/{user}"`, each
//!   payload under `"{client_id}/{user}_{id}"`, both with TTL.
//!
//! Either way: at most `max_per_user` live transactions per user (oldest
//! evicted first), entries expire after `ttl_secs`, a retrieve deletes, and
//! a transaction stored for one `(client, user)` is never handed to another.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sqlx::AnyConnection;
use warden_common::models::transaction::transaction_id;
use warden_common::WardenError;

use crate::repository::{transactions, users};

/// Which backend holds in-flight ceremonies.
pub enum TransactionStore {
    Db(DbStore),
    Cache(CacheStore),
}

impl TransactionStore {
    /// Store a ceremony payload under the challenge's transaction id.
    pub async fn store(
        &self,
        conn: &mut AnyConnection,
        client_id: i64,
        user_name: &str,
        challenge: &[u8],
        data: &serde_json::Value,
    ) -> Result<(), WardenError> {
        match self {
            TransactionStore::Db(store) => {
                store.store(conn, client_id, user_name, challenge, data).await
            }
            TransactionStore::Cache(store) => {
                store.store(client_id, user_name, challenge, data).await
            }
        }
    }

    /// Retrieve and delete the payload stored for this challenge.
    ///
    /// Fails with `BAD_INPUT` when the transaction is unknown, expired, or
    /// owned by a different `(client, user)`.
    pub async fn retrieve(
        &self,
        conn: &mut AnyConnection,
        client_id: i64,
        user_name: &str,
        challenge: &[u8],
    ) -> Result<serde_json::Value, WardenError> {
        match self {
            TransactionStore::Db(store) => {
                store.retrieve(conn, client_id, user_name, challenge).await
            }
            TransactionStore::Cache(store) => {
                store.retrieve(client_id, user_name, challenge).await
            }
        }
    }
}

// ============================================================
// Relational backend
// ============================================================

pub struct DbStore {
    max_per_user: i64,
    ttl_secs: u64,
}

impl DbStore {
    pub fn new(max_per_user: u32, ttl_secs: u64) -> Self {
        Self {
            max_per_user: i64::from(max_per_user),
            ttl_secs,
        }
    }

    async fn store(
        &self,
        conn: &mut AnyConnection,
        client_id: i64,
        user_name: &str,
        challenge: &[u8],
        data: &serde_json::Value,
    ) -> Result<(), WardenError> {
        transactions::purge_expired(&mut *conn, self.ttl_secs).await?;
        let user = users::get_or_create(&mut *conn, client_id, user_name).await?;
        // Delete oldest transactions until we have room for one more.
        transactions::evict_overflow(&mut *conn, user.id, self.max_per_user - 1).await?;
        transactions::insert(conn, user.id, &transaction_id(challenge), &data.to_string())
            .await?;
        Ok(())
    }

    async fn retrieve(
        &self,
        conn: &mut AnyConnection,
        client_id: i64,
        user_name: &str,
        challenge: &[u8],
    ) -> Result<serde_json::Value, WardenError> {
        transactions::purge_expired(&mut *conn, self.ttl_secs).await?;
        let transaction =
            transactions::find_by_transaction_id(&mut *conn, &transaction_id(challenge))
                .await?
                .ok_or_else(|| WardenError::BadInput("Invalid transaction".into()))?;
        let owner = sqlx::query_as::<_, warden_common::models::user::User>(
            "SELECT * FROM users WHERE id = ?",
        )
        .bind(transaction.user_id)
        .fetch_optional(&mut *conn)
        .await?;
        let owned = owner
            .map(|u| u.client_id == client_id && u.name == user_name)
            .unwrap_or(false);
        if !owned {
            return Err(WardenError::BadInput(format!(
                "Transaction not valid for user: {user_name}"
            )));
        }
        transactions::delete(conn, transaction.id).await?;
        serde_json::from_str(&transaction.data)
            .map_err(|e| WardenError::Internal(anyhow::anyhow!("corrupt transaction data: {e}")))
    }
}

// ============================================================
// Cache backend
// ============================================================

pub struct CacheStore {
    redis: ConnectionManager,
    max_per_user: usize,
    ttl_secs: u64,
}

impl CacheStore {
    pub fn new(redis: ConnectionManager, max_per_user: u32, ttl_secs: u64) -> Self {
        Self {
            redis,
            max_per_user: max_per_user as usize,
            ttl_secs,
        }
    }

    fn list_key(client_id: i64, user_name: &str) -> String {
        format!("{client_id}/{user_name}")
    }

    fn body_key(client_id: i64, user_name: &str, transaction_id: &str) -> String {
        format!("{client_id}/{user_name}_{transaction_id}")
    }

    async fn store(
        &self,
        client_id: i64,
        user_name: &str,
        challenge: &[u8],
        data: &serde_json::Value,
    ) -> Result<(), WardenError> {
        let mut redis = self.redis.clone();
        let tid = transaction_id(challenge);
        let list_key = Self::list_key(client_id, user_name);

        let mut ids: Vec<String> = match redis.get::<_, Option<String>>(&list_key).await? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            None => Vec::new(),
        };
        // Eviction and insert need not be atomic here; a short overshoot is
        // tolerated by the contract.
        while !ids.is_empty() && ids.len() + 1 >= self.max_per_user {
            let victim = ids.remove(0);
            let _: () = redis
                .del(Self::body_key(client_id, user_name, &victim))
                .await?;
        }
        ids.push(tid.clone());

        let ids_json = serde_json::to_string(&ids)
            .map_err(|e| WardenError::Internal(anyhow::anyhow!(e)))?;
        let _: () = redis.set_ex(&list_key, ids_json, self.ttl_secs).await?;
        let _: () = redis
            .set_ex(
                Self::body_key(client_id, user_name, &tid),
                data.to_string(),
                self.ttl_secs,
            )
            .await?;
        Ok(())
    }

    async fn retrieve(
        &self,
        client_id: i64,
        user_name: &str,
        challenge: &[u8],
    ) -> Result<serde_json::Value, WardenError> {
        let mut redis = self.redis.clone();
        let tid = transaction_id(challenge);
        let list_key = Self::list_key(client_id, user_name);
        let body_key = Self::body_key(client_id, user_name, &tid);

        // The key embeds (client, user), so a transaction stored for someone
        // else can never resolve here.
        let body: Option<String> = redis.get_del(&body_key).await?;
        let body = body.ok_or_else(|| WardenError::BadInput("Invalid transaction".into()))?;

        if let Some(raw) = redis.get::<_, Option<String>>(&list_key).await? {
            let mut ids: Vec<String> = serde_json::from_str(&raw).unwrap_or_default();
            ids.retain(|id| *id != tid);
            let ids_json = serde_json::to_string(&ids)
                .map_err(|e| WardenError::Internal(anyhow::anyhow!(e)))?;
            let _: () = redis.set_ex(&list_key, ids_json, self.ttl_secs).await?;
        }

        serde_json::from_str(&body)
            .map_err(|e| WardenError::Internal(anyhow::anyhow!("corrupt transaction data: {e}")))
    }
}
