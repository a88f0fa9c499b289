//! End-to-end session manager: key bundle bookkeeping, not cryptography.
//!
//! The engine stores public key material and hands out pre-key bundles;
//! clients run the actual key agreement.  The one rule that matters here is
//! exclusivity: a one-time pre-key goes to at most one requester, enforced by
//! the store's atomic take.  Exhaustion is a typed error, never a silent
//! downgrade to identity-key-only sessions.

use chrono::Utc;

use causerie_shared::constants::PREKEY_LOW_WATER_MARK;
use causerie_shared::{ChatError, KeyBundle, KeyStatus, OneTimePreKey, PreKeyBundle, SignedPreKey, UserId};

use crate::engine::SharedDb;
use crate::error::chat_err;

pub struct E2eSessionManager {
    db: SharedDb,
}

impl E2eSessionManager {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }

    /// Store (or replace) an identity's published key bundle.
    pub async fn store_initial_key_bundle(
        &self,
        user: UserId,
        bundle: KeyBundle,
    ) -> Result<KeyStatus, ChatError> {
        if bundle.identity_key.is_empty() || bundle.signed_pre_key.public_key.is_empty() {
            return Err(ChatError::Validation("key bundle is missing key material".to_string()));
        }

        let mut db = self.db.lock().await;
        db.store_key_bundle(user, &bundle, Utc::now()).map_err(chat_err)?;
        tracing::info!(
            user = %user.short(),
            one_time_keys = bundle.one_time_pre_keys.len(),
            "key bundle stored"
        );
        status_of(&db, user)
    }

    /// Hand a session initiator the target's bundle with exactly one freshly
    /// consumed one-time pre-key.  Concurrent requesters never share a key.
    pub async fn get_pre_key_bundle_for(
        &self,
        requester: UserId,
        target: UserId,
    ) -> Result<PreKeyBundle, ChatError> {
        let db = self.db.lock().await;
        let (registration_id, identity_key, signed_pre_key) =
            db.key_bundle_header(target).map_err(chat_err)?;

        let one_time_pre_key = db
            .take_one_time_prekey(target)
            .map_err(chat_err)?
            .ok_or(ChatError::NoUnusedPreKeys)?;

        tracing::debug!(
            requester = %requester.short(),
            target = %target.short(),
            key_id = one_time_pre_key.key_id,
            "one-time pre-key consumed"
        );
        Ok(PreKeyBundle { registration_id, identity_key, signed_pre_key, one_time_pre_key })
    }

    /// Periodic rotation of the medium-term signed pre-key.
    pub async fn rotate_signed_pre_key(
        &self,
        user: UserId,
        signed: SignedPreKey,
    ) -> Result<(), ChatError> {
        let db = self.db.lock().await;
        if !db.rotate_signed_prekey(user, &signed, Utc::now()).map_err(chat_err)? {
            return Err(ChatError::NotFound);
        }
        tracing::info!(user = %user.short(), key_id = signed.key_id, "signed pre-key rotated");
        Ok(())
    }

    /// Top up the one-time pre-key pool.  Already-known key ids are skipped,
    /// so a replayed replenish cannot resurrect a consumed key.
    pub async fn replenish_pre_keys(
        &self,
        user: UserId,
        keys: Vec<OneTimePreKey>,
    ) -> Result<KeyStatus, ChatError> {
        if keys.is_empty() {
            return Err(ChatError::Validation("no pre-keys supplied".to_string()));
        }

        let db = self.db.lock().await;
        // A replenish without a bundle is meaningless.
        db.key_bundle_header(user).map_err(chat_err)?;
        let added = db.add_one_time_prekeys(user, &keys).map_err(chat_err)?;
        tracing::info!(user = %user.short(), added, "pre-key pool replenished");
        status_of(&db, user)
    }

    /// Pool health for one identity; the client replenishes when told to.
    pub async fn key_status(&self, user: UserId) -> Result<KeyStatus, ChatError> {
        let db = self.db.lock().await;
        db.key_bundle_header(user).map_err(chat_err)?;
        status_of(&db, user)
    }
}

fn status_of(db: &causerie_store::Database, user: UserId) -> Result<KeyStatus, ChatError> {
    let unused_count = db.unused_prekey_count(user).map_err(chat_err)?;
    Ok(KeyStatus {
        unused_count,
        needs_replenish: unused_count < PREKEY_LOW_WATER_MARK,
    })
}
