//! Key-bundle persistence for end-to-end session bootstrap.
//!
//! One-time pre-keys are consumed through a single `UPDATE ... RETURNING`
//! that selects and marks an unused key in one statement: two concurrent
//! takers can never receive the same key id.  The engine stores only public
//! material; the cryptography lives with the clients.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use causerie_shared::{KeyBundle, OneTimePreKey, SignedPreKey, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    /// Store (or replace) a user's full key bundle.  Any previous one-time
    /// pre-keys are dropped with the old bundle.
    pub fn store_key_bundle(
        &mut self,
        user_id: UserId,
        bundle: &KeyBundle,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let tx = self.conn_mut().transaction()?;

        tx.execute(
            "INSERT INTO prekey_bundles
                (user_id, registration_id, identity_key,
                 signed_prekey_id, signed_prekey, signed_prekey_sig, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(user_id) DO UPDATE SET
                registration_id = excluded.registration_id,
                identity_key = excluded.identity_key,
                signed_prekey_id = excluded.signed_prekey_id,
                signed_prekey = excluded.signed_prekey,
                signed_prekey_sig = excluded.signed_prekey_sig,
                updated_at = excluded.updated_at",
            params![
                user_id.to_string(),
                bundle.registration_id,
                bundle.identity_key,
                bundle.signed_pre_key.key_id,
                bundle.signed_pre_key.public_key,
                bundle.signed_pre_key.signature,
                now.to_rfc3339(),
            ],
        )?;

        tx.execute(
            "DELETE FROM one_time_prekeys WHERE user_id = ?1",
            params![user_id.to_string()],
        )?;
        for key in &bundle.one_time_pre_keys {
            tx.execute(
                "INSERT INTO one_time_prekeys (user_id, key_id, public_key, used)
                 VALUES (?1, ?2, ?3, 0)",
                params![user_id.to_string(), key.key_id, key.public_key],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Identity material and current signed pre-key for a user.
    pub fn key_bundle_header(&self, user_id: UserId) -> Result<(u32, String, SignedPreKey)> {
        self.conn()
            .query_row(
                "SELECT registration_id, identity_key,
                        signed_prekey_id, signed_prekey, signed_prekey_sig
                 FROM prekey_bundles WHERE user_id = ?1",
                params![user_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        row.get::<_, String>(1)?,
                        SignedPreKey {
                            key_id: row.get(2)?,
                            public_key: row.get(3)?,
                            signature: row.get(4)?,
                        },
                    ))
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Atomically consume one unused one-time pre-key.
    ///
    /// Select-and-mark happens in a single statement; the guard on `used`
    /// means a key id can be handed out at most once.  Returns `None` when
    /// the pool is exhausted.
    pub fn take_one_time_prekey(&self, user_id: UserId) -> Result<Option<OneTimePreKey>> {
        let taken = self
            .conn()
            .query_row(
                "UPDATE one_time_prekeys SET used = 1
                 WHERE user_id = ?1 AND key_id = (
                     SELECT key_id FROM one_time_prekeys
                     WHERE user_id = ?1 AND used = 0
                     ORDER BY key_id ASC LIMIT 1)
                   AND used = 0
                 RETURNING key_id, public_key",
                params![user_id.to_string()],
                |row| {
                    Ok(OneTimePreKey { key_id: row.get(0)?, public_key: row.get(1)? })
                },
            )
            .optional()?;
        Ok(taken)
    }

    /// Replace the signed pre-key (periodic rotation).  Returns `false`
    /// when the user has no bundle yet.
    pub fn rotate_signed_prekey(
        &self,
        user_id: UserId,
        signed: &SignedPreKey,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE prekey_bundles
             SET signed_prekey_id = ?1, signed_prekey = ?2, signed_prekey_sig = ?3,
                 updated_at = ?4
             WHERE user_id = ?5",
            params![
                signed.key_id,
                signed.public_key,
                signed.signature,
                now.to_rfc3339(),
                user_id.to_string()
            ],
        )?;
        Ok(affected > 0)
    }

    /// Add fresh one-time pre-keys.  Existing key ids are left untouched so
    /// a replayed replenish cannot resurrect a consumed key.
    pub fn add_one_time_prekeys(&self, user_id: UserId, keys: &[OneTimePreKey]) -> Result<u32> {
        let mut added = 0u32;
        for key in keys {
            let affected = self.conn().execute(
                "INSERT OR IGNORE INTO one_time_prekeys (user_id, key_id, public_key, used)
                 VALUES (?1, ?2, ?3, 0)",
                params![user_id.to_string(), key.key_id, key.public_key],
            )?;
            added += affected as u32;
        }
        Ok(added)
    }

    /// Count of still-unused one-time pre-keys.
    pub fn unused_prekey_count(&self, user_id: UserId) -> Result<u32> {
        let count: u32 = self.conn().query_row(
            "SELECT COUNT(*) FROM one_time_prekeys WHERE user_id = ?1 AND used = 0",
            params![user_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle_with_keys(count: u32) -> KeyBundle {
        KeyBundle {
            registration_id: 42,
            identity_key: "idk".to_string(),
            signed_pre_key: SignedPreKey {
                key_id: 1,
                public_key: "spk".to_string(),
                signature: "sig".to_string(),
            },
            one_time_pre_keys: (0..count)
                .map(|i| OneTimePreKey { key_id: i, public_key: format!("otk-{i}") })
                .collect(),
        }
    }

    #[test]
    fn each_prekey_is_handed_out_once() {
        let mut db = Database::open_in_memory(&[0u8; 32]).unwrap();
        let user = UserId::new();
        db.store_key_bundle(user, &bundle_with_keys(5), Utc::now()).unwrap();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..5 {
            let key = db.take_one_time_prekey(user).unwrap().unwrap();
            assert!(seen.insert(key.key_id), "key id {} handed out twice", key.key_id);
        }

        // Pool exhausted: typed absence, never a reused key.
        assert!(db.take_one_time_prekey(user).unwrap().is_none());
        assert_eq!(db.unused_prekey_count(user).unwrap(), 0);
    }

    #[test]
    fn replenish_ignores_existing_ids() {
        let mut db = Database::open_in_memory(&[0u8; 32]).unwrap();
        let user = UserId::new();
        db.store_key_bundle(user, &bundle_with_keys(2), Utc::now()).unwrap();

        // Consume key 0, then try to replay it in a replenish batch.
        let taken = db.take_one_time_prekey(user).unwrap().unwrap();
        assert_eq!(taken.key_id, 0);

        let added = db
            .add_one_time_prekeys(
                user,
                &[
                    OneTimePreKey { key_id: 0, public_key: "replay".to_string() },
                    OneTimePreKey { key_id: 7, public_key: "fresh".to_string() },
                ],
            )
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(db.unused_prekey_count(user).unwrap(), 2);
    }

    #[test]
    fn rotate_updates_signed_prekey() {
        let mut db = Database::open_in_memory(&[0u8; 32]).unwrap();
        let user = UserId::new();
        db.store_key_bundle(user, &bundle_with_keys(1), Utc::now()).unwrap();

        let fresh = SignedPreKey {
            key_id: 2,
            public_key: "spk2".to_string(),
            signature: "sig2".to_string(),
        };
        assert!(db.rotate_signed_prekey(user, &fresh, Utc::now()).unwrap());

        let (reg, idk, spk) = db.key_bundle_header(user).unwrap();
        assert_eq!(reg, 42);
        assert_eq!(idk, "idk");
        assert_eq!(spk, fresh);

        // Rotation for an unknown user is reported, not silently dropped.
        assert!(!db.rotate_signed_prekey(UserId::new(), &fresh, Utc::now()).unwrap());
    }

    #[test]
    fn missing_bundle_is_not_found() {
        let db = Database::open_in_memory(&[0u8; 32]).unwrap();
        assert!(matches!(db.key_bundle_header(UserId::new()), Err(StoreError::NotFound)));
    }
}
