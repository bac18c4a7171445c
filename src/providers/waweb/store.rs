//! Credential store for the WhatsApp-Web client.
//!
//! Backs the `wacore::store` trait family with a single SQLite file under
//! `<config>/credentials/`. The relay pairs exactly one device, so nothing
//! here is keyed by a device id: most trait methods are (namespace, key)
//! lookups over three generic tables, with dedicated tables only where a
//! secondary index is needed (lid↔phone mapping, mutation MACs). The store
//! is single-writer; `wipe` empties it for logout.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use wacore::appstate::hash::HashState;
use wacore::appstate::processor::AppStateMutationMAC;
use wacore::store::error::{db_err, Result, StoreError};
use wacore::store::traits::{
    AppStateSyncKey, AppSyncStore, DeviceListRecord, DeviceStore, LidPnMappingEntry, ProtocolStore,
    SignalStore,
};
use wacore::store::Device;

// Namespaces inside the generic tables. Binary record blobs live in
// `kv_blob`, JSON documents in `kv_json`, plain string sets in
// `member_sets`.
const NS_IDENTITY: &str = "identity";
const NS_SESSION: &str = "session";
const NS_PREKEY: &str = "prekey";
const NS_SIGNED_PREKEY: &str = "signed-prekey";
const NS_SENDER_KEY: &str = "sender-key";
const NS_BASE_KEY: &str = "base-key";
const NS_DEVICE: &str = "device";
const NS_APP_STATE_KEY: &str = "app-state-key";
const NS_APP_STATE_VERSION: &str = "app-state-version";
const NS_DEVICE_LIST: &str = "device-list";
const NS_SKDM: &str = "skdm";
const NS_FORGET: &str = "forget";

/// Composite keys join their parts with the ASCII unit separator, which
/// cannot appear in JIDs or message ids.
const KEY_SEP: char = '\u{1f}';

/// The schema revision this build writes. Stored in `PRAGMA user_version`;
/// an older database is migrated forward on open.
const SCHEMA_VERSION: i32 = 1;

/// The single paired device. The store never holds more than one.
const DEVICE_ROW: &str = "self";
const DEVICE_ID: i32 = 1;

#[derive(Clone)]
pub struct WaStore {
    pool: SqlitePool,
}

impl WaStore {
    /// Open (or create) the store at the given path, migrating the schema
    /// forward if it predates this build.
    pub async fn open(path: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn schema_version(&self) -> Result<i32> {
        let row = sqlx::query("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.get::<i32, _>(0))
    }

    async fn migrate(&self) -> Result<()> {
        let current = self.schema_version().await?;
        if current >= SCHEMA_VERSION {
            return Ok(());
        }

        if current < 1 {
            for stmt in [
                "CREATE TABLE IF NOT EXISTS kv_blob (
                    ns    TEXT NOT NULL,
                    key   TEXT NOT NULL,
                    value BLOB NOT NULL,
                    flag  INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (ns, key)
                )",
                "CREATE TABLE IF NOT EXISTS kv_json (
                    ns    TEXT NOT NULL,
                    key   TEXT NOT NULL,
                    value TEXT NOT NULL,
                    PRIMARY KEY (ns, key)
                )",
                "CREATE TABLE IF NOT EXISTS member_sets (
                    ns     TEXT NOT NULL,
                    owner  TEXT NOT NULL,
                    member TEXT NOT NULL,
                    PRIMARY KEY (ns, owner, member)
                )",
                "CREATE TABLE IF NOT EXISTS lid_pn (
                    lid             TEXT PRIMARY KEY,
                    phone_number    TEXT NOT NULL,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL,
                    learning_source TEXT NOT NULL DEFAULT ''
                )",
                "CREATE INDEX IF NOT EXISTS idx_lid_pn_phone ON lid_pn (phone_number)",
                "CREATE TABLE IF NOT EXISTS mutation_macs (
                    name      TEXT NOT NULL,
                    version   INTEGER NOT NULL,
                    index_mac BLOB NOT NULL,
                    value_mac BLOB NOT NULL
                )",
                "CREATE INDEX IF NOT EXISTS idx_mutation_macs
                    ON mutation_macs (name, index_mac)",
            ] {
                sqlx::query(stmt).execute(&self.pool).await.map_err(db_err)?;
            }
        }

        sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Whether a paired device record exists with parseable data.
    pub async fn device_exists(&self) -> Result<bool> {
        match self.get_blob(NS_DEVICE, DEVICE_ROW).await? {
            Some(data) => Ok(rmp_serde::from_slice::<Device>(&data).is_ok()),
            None => Ok(false),
        }
    }

    /// Drop all credential state. Used by logout.
    pub async fn wipe(&self) -> Result<()> {
        for table in ["kv_blob", "kv_json", "member_sets", "lid_pn", "mutation_macs"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    // ─── Generic table access ─────────────────────────────────────────────

    async fn put_blob(&self, ns: &str, key: &str, value: &[u8], flag: bool) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv_blob (ns, key, value, flag) VALUES (?, ?, ?, ?)
             ON CONFLICT(ns, key) DO UPDATE SET value = excluded.value, flag = excluded.flag",
        )
        .bind(ns)
        .bind(key)
        .bind(value)
        .bind(flag)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_blob(&self, ns: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM kv_blob WHERE ns = ? AND key = ?")
            .bind(ns)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| r.get("value")))
    }

    async fn list_blobs(&self, ns: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let rows = sqlx::query("SELECT key, value FROM kv_blob WHERE ns = ?")
            .bind(ns)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get("key"), r.get("value")))
            .collect())
    }

    async fn delete_blob(&self, ns: &str, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_blob WHERE ns = ? AND key = ?")
            .bind(ns)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn put_json<T: serde::Serialize>(&self, ns: &str, key: &str, value: &T) -> Result<()> {
        let json =
            serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            "INSERT INTO kv_json (ns, key, value) VALUES (?, ?, ?)
             ON CONFLICT(ns, key) DO UPDATE SET value = excluded.value",
        )
        .bind(ns)
        .bind(key)
        .bind(&json)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        ns: &str,
        key: &str,
    ) -> Result<Option<T>> {
        let row = sqlx::query("SELECT value FROM kv_json WHERE ns = ? AND key = ?")
            .bind(ns)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| {
            let json: String = r.get("value");
            serde_json::from_str(&json).map_err(|e| StoreError::Serialization(e.to_string()))
        })
        .transpose()
    }

    async fn add_members(&self, ns: &str, owner: &str, members: &[String]) -> Result<()> {
        for member in members {
            sqlx::query(
                "INSERT OR IGNORE INTO member_sets (ns, owner, member) VALUES (?, ?, ?)",
            )
            .bind(ns)
            .bind(owner)
            .bind(member)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    async fn list_members(&self, ns: &str, owner: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT member FROM member_sets WHERE ns = ? AND owner = ?")
            .bind(ns)
            .bind(owner)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(|r| r.get("member")).collect())
    }

    async fn clear_members(&self, ns: &str, owner: &str) -> Result<()> {
        sqlx::query("DELETE FROM member_sets WHERE ns = ? AND owner = ?")
            .bind(ns)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

fn composite_key(a: &str, b: &str) -> String {
    format!("{a}{KEY_SEP}{b}")
}

fn hex_key(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn lid_row_to_entry(r: sqlx::sqlite::SqliteRow) -> LidPnMappingEntry {
    LidPnMappingEntry {
        lid: r.get("lid"),
        phone_number: r.get("phone_number"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
        learning_source: r.get("learning_source"),
    }
}

#[async_trait]
impl SignalStore for WaStore {
    async fn put_identity(&self, address: &str, key: [u8; 32]) -> Result<()> {
        self.put_blob(NS_IDENTITY, address, key.as_slice(), false).await
    }

    async fn load_identity(&self, address: &str) -> Result<Option<Vec<u8>>> {
        self.get_blob(NS_IDENTITY, address).await
    }

    async fn delete_identity(&self, address: &str) -> Result<()> {
        self.delete_blob(NS_IDENTITY, address).await
    }

    async fn get_session(&self, address: &str) -> Result<Option<Vec<u8>>> {
        self.get_blob(NS_SESSION, address).await
    }

    async fn put_session(&self, address: &str, session: &[u8]) -> Result<()> {
        self.put_blob(NS_SESSION, address, session, false).await
    }

    async fn delete_session(&self, address: &str) -> Result<()> {
        self.delete_blob(NS_SESSION, address).await
    }

    async fn store_prekey(&self, id: u32, record: &[u8], uploaded: bool) -> Result<()> {
        self.put_blob(NS_PREKEY, &id.to_string(), record, uploaded).await
    }

    async fn load_prekey(&self, id: u32) -> Result<Option<Vec<u8>>> {
        self.get_blob(NS_PREKEY, &id.to_string()).await
    }

    async fn remove_prekey(&self, id: u32) -> Result<()> {
        self.delete_blob(NS_PREKEY, &id.to_string()).await
    }

    async fn store_signed_prekey(&self, id: u32, record: &[u8]) -> Result<()> {
        self.put_blob(NS_SIGNED_PREKEY, &id.to_string(), record, false).await
    }

    async fn load_signed_prekey(&self, id: u32) -> Result<Option<Vec<u8>>> {
        self.get_blob(NS_SIGNED_PREKEY, &id.to_string()).await
    }

    async fn load_all_signed_prekeys(&self) -> Result<Vec<(u32, Vec<u8>)>> {
        Ok(self
            .list_blobs(NS_SIGNED_PREKEY)
            .await?
            .into_iter()
            .filter_map(|(key, value)| key.parse::<u32>().ok().map(|id| (id, value)))
            .collect())
    }

    async fn remove_signed_prekey(&self, id: u32) -> Result<()> {
        self.delete_blob(NS_SIGNED_PREKEY, &id.to_string()).await
    }

    async fn put_sender_key(&self, address: &str, record: &[u8]) -> Result<()> {
        self.put_blob(NS_SENDER_KEY, address, record, false).await
    }

    async fn get_sender_key(&self, address: &str) -> Result<Option<Vec<u8>>> {
        self.get_blob(NS_SENDER_KEY, address).await
    }

    async fn delete_sender_key(&self, address: &str) -> Result<()> {
        self.delete_blob(NS_SENDER_KEY, address).await
    }
}

#[async_trait]
impl AppSyncStore for WaStore {
    async fn get_sync_key(&self, key_id: &[u8]) -> Result<Option<AppStateSyncKey>> {
        self.get_json(NS_APP_STATE_KEY, &hex_key(key_id)).await
    }

    async fn set_sync_key(&self, key_id: &[u8], key: AppStateSyncKey) -> Result<()> {
        self.put_json(NS_APP_STATE_KEY, &hex_key(key_id), &key).await
    }

    async fn get_version(&self, name: &str) -> Result<HashState> {
        Ok(self
            .get_json(NS_APP_STATE_VERSION, name)
            .await?
            .unwrap_or_default())
    }

    async fn set_version(&self, name: &str, state: HashState) -> Result<()> {
        self.put_json(NS_APP_STATE_VERSION, name, &state).await
    }

    async fn put_mutation_macs(
        &self,
        name: &str,
        version: u64,
        mutations: &[AppStateMutationMAC],
    ) -> Result<()> {
        for m in mutations {
            sqlx::query(
                "INSERT INTO mutation_macs (name, version, index_mac, value_mac)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(name)
            .bind(version as i64)
            .bind(&m.index_mac)
            .bind(&m.value_mac)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    async fn get_mutation_mac(&self, name: &str, index_mac: &[u8]) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query(
            "SELECT value_mac FROM mutation_macs WHERE name = ? AND index_mac = ?",
        )
        .bind(name)
        .bind(index_mac)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(|r| r.get("value_mac")))
    }

    async fn delete_mutation_macs(&self, name: &str, index_macs: &[Vec<u8>]) -> Result<()> {
        for mac in index_macs {
            sqlx::query("DELETE FROM mutation_macs WHERE name = ? AND index_mac = ?")
                .bind(name)
                .bind(mac.as_slice())
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolStore for WaStore {
    async fn get_skdm_recipients(&self, group_jid: &str) -> Result<Vec<String>> {
        self.list_members(NS_SKDM, group_jid).await
    }

    async fn add_skdm_recipients(&self, group_jid: &str, device_jids: &[String]) -> Result<()> {
        self.add_members(NS_SKDM, group_jid, device_jids).await
    }

    async fn clear_skdm_recipients(&self, group_jid: &str) -> Result<()> {
        self.clear_members(NS_SKDM, group_jid).await
    }

    async fn get_lid_mapping(&self, lid: &str) -> Result<Option<LidPnMappingEntry>> {
        let row = sqlx::query(
            "SELECT lid, phone_number, created_at, updated_at, learning_source
             FROM lid_pn WHERE lid = ?",
        )
        .bind(lid)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(lid_row_to_entry))
    }

    async fn get_pn_mapping(&self, phone: &str) -> Result<Option<LidPnMappingEntry>> {
        let row = sqlx::query(
            "SELECT lid, phone_number, created_at, updated_at, learning_source
             FROM lid_pn WHERE phone_number = ?",
        )
        .bind(phone)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(lid_row_to_entry))
    }

    async fn put_lid_mapping(&self, entry: &LidPnMappingEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO lid_pn (lid, phone_number, created_at, updated_at, learning_source)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(lid) DO UPDATE SET
                 phone_number = excluded.phone_number,
                 updated_at = excluded.updated_at,
                 learning_source = excluded.learning_source",
        )
        .bind(&entry.lid)
        .bind(&entry.phone_number)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .bind(&entry.learning_source)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_all_lid_mappings(&self) -> Result<Vec<LidPnMappingEntry>> {
        let rows = sqlx::query(
            "SELECT lid, phone_number, created_at, updated_at, learning_source FROM lid_pn",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(lid_row_to_entry).collect())
    }

    async fn save_base_key(&self, address: &str, message_id: &str, base_key: &[u8]) -> Result<()> {
        self.put_blob(NS_BASE_KEY, &composite_key(address, message_id), base_key, false)
            .await
    }

    async fn has_same_base_key(
        &self,
        address: &str,
        message_id: &str,
        current_base_key: &[u8],
    ) -> Result<bool> {
        Ok(self
            .get_blob(NS_BASE_KEY, &composite_key(address, message_id))
            .await?
            .is_some_and(|stored| stored == current_base_key))
    }

    async fn delete_base_key(&self, address: &str, message_id: &str) -> Result<()> {
        self.delete_blob(NS_BASE_KEY, &composite_key(address, message_id))
            .await
    }

    async fn update_device_list(&self, record: DeviceListRecord) -> Result<()> {
        let user = record.user.clone();
        self.put_json(NS_DEVICE_LIST, &user, &record).await
    }

    async fn get_devices(&self, user: &str) -> Result<Option<DeviceListRecord>> {
        self.get_json(NS_DEVICE_LIST, user).await
    }

    async fn mark_forget_sender_key(&self, group_jid: &str, participant: &str) -> Result<()> {
        self.add_members(NS_FORGET, group_jid, &[participant.to_string()])
            .await
    }

    async fn consume_forget_marks(&self, group_jid: &str) -> Result<Vec<String>> {
        let marks = self.list_members(NS_FORGET, group_jid).await?;
        if !marks.is_empty() {
            self.clear_members(NS_FORGET, group_jid).await?;
        }
        Ok(marks)
    }
}

#[async_trait]
impl DeviceStore for WaStore {
    async fn save(&self, device: &Device) -> Result<()> {
        let bytes =
            rmp_serde::to_vec(device).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.put_blob(NS_DEVICE, DEVICE_ROW, &bytes, false).await
    }

    async fn load(&self) -> Result<Option<Device>> {
        let Some(data) = self.get_blob(NS_DEVICE, DEVICE_ROW).await? else {
            return Ok(None);
        };
        match rmp_serde::from_slice(&data) {
            Ok(device) => Ok(Some(device)),
            Err(_) => {
                // An unreadable record can never authenticate again; drop it
                // so the next run pairs fresh instead of crash-looping.
                tracing::warn!("stored WhatsApp device record is unreadable, clearing it");
                self.delete_blob(NS_DEVICE, DEVICE_ROW).await?;
                Ok(None)
            }
        }
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.get_blob(NS_DEVICE, DEVICE_ROW).await?.is_some())
    }

    async fn create(&self) -> Result<i32> {
        // Single-device store: there is only ever one slot.
        Ok(DEVICE_ID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> WaStore {
        WaStore::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_open_stamps_schema_version() {
        let s = memory_store().await;
        assert_eq!(s.schema_version().await.unwrap(), SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_reopen_preserves_state() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("creds.db").to_string_lossy().to_string();

        let s = WaStore::open(&path).await.unwrap();
        s.put_identity("peer@s.whatsapp.net", [9u8; 32]).await.unwrap();
        drop(s);

        let reopened = WaStore::open(&path).await.unwrap();
        assert_eq!(
            reopened.load_identity("peer@s.whatsapp.net").await.unwrap(),
            Some(vec![9u8; 32])
        );
    }

    #[tokio::test]
    async fn test_put_blob_overwrites_in_place() {
        let s = memory_store().await;
        s.put_session("addr", b"first").await.unwrap();
        s.put_session("addr", b"second").await.unwrap();
        assert_eq!(s.get_session("addr").await.unwrap(), Some(b"second".to_vec()));
    }

    #[tokio::test]
    async fn test_namespaces_do_not_bleed() {
        // The same key in two namespaces stays two records.
        let s = memory_store().await;
        s.put_identity("shared-key", [1u8; 32]).await.unwrap();
        s.put_session("shared-key", b"sess").await.unwrap();
        s.delete_identity("shared-key").await.unwrap();
        assert!(s.load_identity("shared-key").await.unwrap().is_none());
        assert_eq!(s.get_session("shared-key").await.unwrap(), Some(b"sess".to_vec()));
    }

    #[tokio::test]
    async fn test_prekey_uploaded_flag_roundtrip() {
        let s = memory_store().await;
        s.store_prekey(7, b"rec", true).await.unwrap();
        let row = sqlx::query("SELECT flag FROM kv_blob WHERE ns = ? AND key = ?")
            .bind(NS_PREKEY)
            .bind("7")
            .fetch_one(&s.pool)
            .await
            .unwrap();
        assert_eq!(row.get::<i64, _>("flag"), 1);
        // Re-storing as not-uploaded flips the flag, it does not duplicate.
        s.store_prekey(7, b"rec", false).await.unwrap();
        let all: Vec<(String, Vec<u8>)> = s.list_blobs(NS_PREKEY).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_signed_prekeys_listed_by_numeric_id() {
        let s = memory_store().await;
        s.store_signed_prekey(12, b"a").await.unwrap();
        s.store_signed_prekey(3, b"b").await.unwrap();
        let mut all = s.load_all_signed_prekeys().await.unwrap();
        all.sort_by_key(|(id, _)| *id);
        assert_eq!(all, vec![(3, b"b".to_vec()), (12, b"a".to_vec())]);
    }

    #[tokio::test]
    async fn test_base_key_pairs_are_distinct() {
        let s = memory_store().await;
        s.save_base_key("addr", "m1", b"k1").await.unwrap();
        s.save_base_key("addr", "m2", b"k2").await.unwrap();
        assert!(s.has_same_base_key("addr", "m1", b"k1").await.unwrap());
        assert!(s.has_same_base_key("addr", "m2", b"k2").await.unwrap());
        assert!(!s.has_same_base_key("addr", "m1", b"k2").await.unwrap());
        s.delete_base_key("addr", "m1").await.unwrap();
        assert!(!s.has_same_base_key("addr", "m1", b"k1").await.unwrap());
        assert!(s.has_same_base_key("addr", "m2", b"k2").await.unwrap());
    }

    #[tokio::test]
    async fn test_lid_mapping_remap_replaces_phone() {
        let s = memory_store().await;
        let mut entry = LidPnMappingEntry {
            lid: "5544".into(),
            phone_number: "+4910001".into(),
            created_at: 10,
            updated_at: 10,
            learning_source: "usync".into(),
        };
        s.put_lid_mapping(&entry).await.unwrap();

        // The lid learns a new number: the old phone lookup must go stale.
        entry.phone_number = "+4910002".into();
        entry.updated_at = 20;
        s.put_lid_mapping(&entry).await.unwrap();

        assert!(s.get_pn_mapping("+4910001").await.unwrap().is_none());
        assert_eq!(s.get_pn_mapping("+4910002").await.unwrap().unwrap().lid, "5544");
        assert_eq!(s.get_all_lid_mappings().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_member_sets_namespaced_per_group() {
        let s = memory_store().await;
        s.add_skdm_recipients("g1", &["d1".into(), "d2".into()]).await.unwrap();
        s.mark_forget_sender_key("g1", "d1").await.unwrap();

        // Forget marks and recipients share a table but never mix.
        assert_eq!(s.get_skdm_recipients("g1").await.unwrap().len(), 2);
        assert_eq!(s.consume_forget_marks("g1").await.unwrap(), vec!["d1".to_string()]);
        assert!(s.consume_forget_marks("g1").await.unwrap().is_empty());
        assert_eq!(s.get_skdm_recipients("g1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_app_state_version_defaults_when_absent() {
        let s = memory_store().await;
        let state = s.get_version("regular").await.unwrap();
        assert_eq!(state.version, 0);
    }

    #[tokio::test]
    async fn test_sync_key_binary_id() {
        let s = memory_store().await;
        let key = AppStateSyncKey {
            key_data: vec![1, 2, 3],
            fingerprint: vec![4],
            timestamp: 99,
        };
        // Binary key ids (including zero bytes) must survive the key encoding.
        s.set_sync_key(&[0x00, 0xff, 0x1f], key).await.unwrap();
        let loaded = s.get_sync_key(&[0x00, 0xff, 0x1f]).await.unwrap().unwrap();
        assert_eq!(loaded.timestamp, 99);
        assert!(s.get_sync_key(&[0x00, 0xff]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wipe_supports_logout_flow() {
        let s = memory_store().await;
        s.put_identity("peer", [2u8; 32]).await.unwrap();
        s.put_lid_mapping(&LidPnMappingEntry {
            lid: "1".into(),
            phone_number: "+49".into(),
            created_at: 0,
            updated_at: 0,
            learning_source: String::new(),
        })
        .await
        .unwrap();
        s.put_blob(NS_DEVICE, DEVICE_ROW, b"not-a-device", false).await.unwrap();

        s.wipe().await.unwrap();

        assert!(!s.device_exists().await.unwrap());
        assert!(s.load_identity("peer").await.unwrap().is_none());
        assert!(s.get_lid_mapping("1").await.unwrap().is_none());
        // A wiped store pairs again from scratch.
        assert!(s.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unreadable_device_record_is_cleared_on_load() {
        let s = memory_store().await;
        s.put_blob(NS_DEVICE, DEVICE_ROW, b"garbage", false).await.unwrap();
        assert!(s.exists().await.unwrap(), "raw row is present");
        assert!(!s.device_exists().await.unwrap(), "but it does not parse");
        assert!(s.load().await.unwrap().is_none());
        // load() dropped the junk row entirely.
        assert!(!s.exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_composite_key_separator_prevents_collisions() {
        assert_ne!(composite_key("a", "b/c"), composite_key("a/b", "c"));
        assert_eq!(hex_key(&[0x00, 0x1f, 0xff]), "001fff");
    }
}
