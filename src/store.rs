//! Record store (§4.3): one `<uuid>.sdb` file per record, tagged-field wire
//! format (§6), write-to-temp-then-rename for crash atomicity, a single
//! mutex guarding the whole in-memory index. This store must survive a
//! crash mid-write, hence the atomic rename.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::record::{AliveMessage, CommandContent, KeyRecord, PendingCommand};

// Tag values for the on-disk tagged-field format. Unknown tags are ignored
// on read (forward compatibility); every write emits the current tag set.
mod tag {
    pub const UUID: u16 = 1;
    pub const ID: u16 = 2;
    pub const CREATION_TIME: u16 = 3;
    pub const KEY_MATERIAL: u16 = 4;
    pub const EXTERNAL_ID: u16 = 5;
    pub const MOUNT_POINT: u16 = 6;
    pub const MOUNT_OPTIONS: u16 = 7;
    pub const MAX_ACTIVE: u16 = 8;
    pub const ALIVE_INTERVAL_SEC: u16 = 9;
    pub const ALIVE_COUNT: u16 = 10;
    pub const ALIVE_MESSAGE: u16 = 11;
    pub const LAST_RETRIEVAL: u16 = 12;
    pub const PENDING_COMMAND: u16 = 13;
}

fn write_field(out: &mut Vec<u8>, tag: u16, value: &[u8]) {
    out.extend_from_slice(&tag.to_be_bytes());
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value);
}

fn write_str(out: &mut Vec<u8>, tag: u16, s: &str) {
    write_field(out, tag, s.as_bytes());
}

fn write_i64(out: &mut Vec<u8>, tag: u16, v: i64) {
    write_field(out, tag, &v.to_be_bytes());
}

fn write_u32(out: &mut Vec<u8>, tag: u16, v: u32) {
    write_field(out, tag, &v.to_be_bytes());
}

fn encode_alive_message(m: &AliveMessage) -> Vec<u8> {
    let mut b = Vec::new();
    write_str(&mut b, 1, &m.ip.to_string());
    write_i64(&mut b, 2, m.timestamp);
    write_str(&mut b, 3, &m.hostname);
    b
}

fn decode_alive_message(buf: &[u8]) -> Result<AliveMessage> {
    let mut ip = None;
    let mut timestamp = None;
    let mut hostname = None;
    for (t, v) in iter_fields(buf)? {
        match t {
            1 => ip = Some(parse_ip(v)?),
            2 => timestamp = Some(parse_i64(v)?),
            3 => hostname = Some(String::from_utf8_lossy(v).into_owned()),
            _ => {}
        }
    }
    Ok(AliveMessage {
        ip: ip.ok_or_else(|| Error::corruption("<alive_message>", "missing ip"))?,
        timestamp: timestamp.ok_or_else(|| Error::corruption("<alive_message>", "missing timestamp"))?,
        hostname: hostname.unwrap_or_default(),
    })
}

fn encode_pending_command(ip: &IpAddr, c: &PendingCommand) -> Vec<u8> {
    let mut b = Vec::new();
    write_str(&mut b, 1, &ip.to_string());
    write_i64(&mut b, 2, c.valid_from);
    write_i64(&mut b, 3, c.validity_sec);
    write_str(&mut b, 4, match c.content { CommandContent::Mount => "mount", CommandContent::Umount => "umount" });
    write_field(&mut b, 5, &[c.seen_by_client as u8]);
    if let Some(r) = &c.client_result {
        write_str(&mut b, 6, r);
    }
    b
}

fn decode_pending_command(buf: &[u8]) -> Result<(IpAddr, PendingCommand)> {
    let mut ip = None;
    let mut valid_from = None;
    let mut validity_sec = None;
    let mut content = None;
    let mut seen = false;
    let mut result = None;
    for (t, v) in iter_fields(buf)? {
        match t {
            1 => ip = Some(parse_ip(v)?),
            2 => valid_from = Some(parse_i64(v)?),
            3 => validity_sec = Some(parse_i64(v)?),
            4 => {
                content = Some(match v {
                    b"mount" => CommandContent::Mount,
                    b"umount" => CommandContent::Umount,
                    _ => return Err(Error::corruption("<pending_command>", "bad content")),
                })
            }
            5 => seen = v.first().copied().unwrap_or(0) != 0,
            6 => result = Some(String::from_utf8_lossy(v).into_owned()),
            _ => {}
        }
    }
    let ip = ip.ok_or_else(|| Error::corruption("<pending_command>", "missing ip"))?;
    Ok((
        ip,
        PendingCommand {
            valid_from: valid_from.ok_or_else(|| Error::corruption("<pending_command>", "missing valid_from"))?,
            validity_sec: validity_sec.ok_or_else(|| Error::corruption("<pending_command>", "missing validity_sec"))?,
            content: content.ok_or_else(|| Error::corruption("<pending_command>", "missing content"))?,
            seen_by_client: seen,
            client_result: result,
        },
    ))
}

fn parse_ip(v: &[u8]) -> Result<IpAddr> {
    std::str::from_utf8(v)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::corruption("<record>", "bad ip address field"))
}

fn parse_i64(v: &[u8]) -> Result<i64> {
    let arr: [u8; 8] = v.try_into().map_err(|_| Error::corruption("<record>", "bad i64 field"))?;
    Ok(i64::from_be_bytes(arr))
}

fn parse_u32(v: &[u8]) -> Result<u32> {
    let arr: [u8; 4] = v.try_into().map_err(|_| Error::corruption("<record>", "bad u32 field"))?;
    Ok(u32::from_be_bytes(arr))
}

/// Walks a tagged-field buffer, yielding `(tag, value)` pairs.
fn iter_fields(buf: &[u8]) -> Result<Vec<(u16, &[u8])>> {
    let mut out = Vec::new();
    let mut off = 0;
    while off < buf.len() {
        if buf.len() - off < 6 {
            return Err(Error::corruption("<record>", "truncated field header"));
        }
        let tag = u16::from_be_bytes([buf[off], buf[off + 1]]);
        let len = u32::from_be_bytes([buf[off + 2], buf[off + 3], buf[off + 4], buf[off + 5]]) as usize;
        off += 6;
        if buf.len() - off < len {
            return Err(Error::corruption("<record>", "truncated field value"));
        }
        out.push((tag, &buf[off..off + len]));
        off += len;
    }
    Ok(out)
}

/// Serializes a `KeyRecord` to the on-disk tagged-field layout.
pub fn encode_record(rec: &KeyRecord) -> Vec<u8> {
    let mut out = Vec::new();
    write_str(&mut out, tag::UUID, &rec.uuid);
    write_str(&mut out, tag::ID, &rec.id);
    write_i64(&mut out, tag::CREATION_TIME, rec.creation_time);
    if let Some(km) = &rec.key_material {
        write_field(&mut out, tag::KEY_MATERIAL, km);
    }
    if let Some(ext) = &rec.external_id {
        write_str(&mut out, tag::EXTERNAL_ID, ext);
    }
    write_str(&mut out, tag::MOUNT_POINT, &rec.mount_point);
    write_str(&mut out, tag::MOUNT_OPTIONS, &rec.mount_options);
    write_u32(&mut out, tag::MAX_ACTIVE, rec.max_active);
    write_i64(&mut out, tag::ALIVE_INTERVAL_SEC, rec.alive_interval_sec);
    write_u32(&mut out, tag::ALIVE_COUNT, rec.alive_count);
    for msgs in rec.alive_messages.values() {
        for m in msgs {
            write_field(&mut out, tag::ALIVE_MESSAGE, &encode_alive_message(m));
        }
    }
    if let Some(lr) = &rec.last_retrieval {
        write_field(&mut out, tag::LAST_RETRIEVAL, &encode_alive_message(lr));
    }
    for (ip, cmds) in rec.pending_commands.iter() {
        for c in cmds {
            write_field(&mut out, tag::PENDING_COMMAND, &encode_pending_command(ip, c));
        }
    }
    out
}

/// Parses the on-disk tagged-field layout back into a `KeyRecord`.
pub fn decode_record(path: &str, buf: &[u8]) -> Result<KeyRecord> {
    let mut uuid = None;
    let mut id = String::new();
    let mut creation_time = 0i64;
    let mut key_material = None;
    let mut external_id = None;
    let mut mount_point = String::new();
    let mut mount_options = String::new();
    let mut max_active = 0u32;
    let mut alive_interval_sec = 0i64;
    let mut alive_count = 0u32;
    let mut alive_messages: HashMap<IpAddr, Vec<AliveMessage>> = HashMap::new();
    let mut last_retrieval = None;
    let mut pending_commands: HashMap<IpAddr, Vec<PendingCommand>> = HashMap::new();

    for (t, v) in iter_fields(buf).map_err(|_| Error::corruption(path, "malformed field stream"))? {
        match t {
            tag::UUID => uuid = Some(String::from_utf8_lossy(v).into_owned()),
            tag::ID => id = String::from_utf8_lossy(v).into_owned(),
            tag::CREATION_TIME => creation_time = parse_i64(v)?,
            tag::KEY_MATERIAL => key_material = Some(v.to_vec()),
            tag::EXTERNAL_ID => external_id = Some(String::from_utf8_lossy(v).into_owned()),
            tag::MOUNT_POINT => mount_point = String::from_utf8_lossy(v).into_owned(),
            tag::MOUNT_OPTIONS => mount_options = String::from_utf8_lossy(v).into_owned(),
            tag::MAX_ACTIVE => max_active = parse_u32(v)?,
            tag::ALIVE_INTERVAL_SEC => alive_interval_sec = parse_i64(v)?,
            tag::ALIVE_COUNT => alive_count = parse_u32(v)?,
            tag::ALIVE_MESSAGE => {
                let m = decode_alive_message(v)?;
                alive_messages.entry(m.ip).or_default().push(m);
            }
            tag::LAST_RETRIEVAL => last_retrieval = Some(decode_alive_message(v)?),
            tag::PENDING_COMMAND => {
                let (ip, c) = decode_pending_command(v)?;
                pending_commands.entry(ip).or_default().push(c);
            }
            _ => {} // unknown tag: ignored, forward compatibility
        }
    }

    Ok(KeyRecord {
        uuid: uuid.ok_or_else(|| Error::corruption(path, "missing uuid field"))?,
        id,
        creation_time,
        key_material,
        external_id,
        mount_point,
        mount_options,
        max_active,
        alive_interval_sec,
        alive_count,
        alive_messages,
        last_retrieval,
        pending_commands,
    })
}

struct Inner {
    dir: PathBuf,
    records: HashMap<String, KeyRecord>,
}

/// Guards the whole in-memory index with one lock, as specified: "a simple
/// mutex is sufficient — throughput is human-scale" (§4.3).
pub struct RecordStore {
    inner: Mutex<Inner>,
}

impl RecordStore {
    /// `open_all` (§4.3): scans `dir` and loads every `.sdb` file. Duplicate
    /// uuids across files are a `Corruption` error — the server refuses to
    /// start rather than silently drop data.
    pub async fn open_all(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::io(dir.display().to_string(), e))?;

        let mut records = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| Error::io(dir.display().to_string(), e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| Error::io(dir.display().to_string(), e))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sdb") {
                continue;
            }
            let rec = load_file(&path).await?;
            if records.insert(rec.uuid.clone(), rec).is_some() {
                return Err(Error::corruption(path.display().to_string(), "duplicate uuid across record files"));
            }
        }

        Ok(RecordStore { inner: Mutex::new(Inner { dir, records }) })
    }

    /// `open_one` (§4.3): loads a single file without touching any shared
    /// in-memory index — used by the admin CLI to mutate one record
    /// without racing the running daemon's cache.
    pub async fn open_one(dir: impl AsRef<Path>, uuid: &str) -> Result<KeyRecord> {
        load_file(&record_path(dir.as_ref(), uuid)).await
    }

    /// Writes a single record's file without touching any running daemon's
    /// in-memory index — the admin-CLI counterpart to `open_one`, used to
    /// edit a record (e.g. enqueue a pending command) out-of-process. The
    /// daemon only observes the change after a `ReloadRecord` RPC (§4.3).
    pub async fn write_one(dir: impl AsRef<Path>, rec: &KeyRecord) -> Result<()> {
        write_file(dir.as_ref(), rec).await
    }

    pub async fn upsert(&self, rec: KeyRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        write_file(&inner.dir, &rec).await?;
        inner.records.insert(rec.uuid.clone(), rec);
        Ok(())
    }

    pub async fn get_by_uuid(&self, uuid: &str) -> Option<KeyRecord> {
        let inner = self.inner.lock().await;
        inner.records.get(uuid).cloned()
    }

    /// Returns all records sorted by `last_retrieval.timestamp` descending
    /// (records never retrieved sort last).
    pub async fn list(&self) -> Vec<KeyRecord> {
        let inner = self.inner.lock().await;
        let mut v: Vec<KeyRecord> = inner.records.values().cloned().collect();
        v.sort_by_key(|r| std::cmp::Reverse(r.last_retrieval.as_ref().map(|m| m.timestamp).unwrap_or(i64::MIN)));
        v
    }

    pub async fn erase(&self, uuid: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let path = record_path(&inner.dir, uuid);
        if path.exists() {
            tokio::fs::remove_file(&path).await.map_err(|e| Error::io(path.display().to_string(), e))?;
        }
        inner.records.remove(uuid);
        Ok(())
    }

    /// `reload_one` (§4.3): re-reads a single record from disk, replacing
    /// the in-memory copy. Used when the admin CLI has written behind the
    /// server's back.
    pub async fn reload_one(&self, uuid: &str) -> Result<KeyRecord> {
        let mut inner = self.inner.lock().await;
        let rec = load_file(&record_path(&inner.dir, uuid)).await?;
        inner.records.insert(uuid.to_string(), rec.clone());
        Ok(rec)
    }

    /// Runs `f` against the record for `uuid` under the store's single lock,
    /// persisting the (possibly mutated) record before releasing the lock —
    /// this is how `service.rs` gets "all mutations to one record are
    /// totally ordered" (§4.5 Ordering) without a per-record lock.
    pub async fn with_record<T>(
        &self,
        uuid: &str,
        f: impl FnOnce(&mut KeyRecord) -> T,
    ) -> Result<Option<T>> {
        let mut inner = self.inner.lock().await;
        let Some(rec) = inner.records.get_mut(uuid) else { return Ok(None) };
        let result = f(rec);
        let rec = rec.clone();
        write_file(&inner.dir, &rec).await?;
        Ok(Some(result))
    }
}

fn record_path(dir: &Path, uuid: &str) -> PathBuf {
    dir.join(format!("{uuid}.sdb"))
}

async fn load_file(path: &Path) -> Result<KeyRecord> {
    let bytes = tokio::fs::read(path).await.map_err(|e| Error::io(path.display().to_string(), e))?;
    decode_record(&path.display().to_string(), &bytes)
}

/// Write-to-temp-then-rename (§4.3): the rename is atomic on POSIX
/// filesystems, so a crash mid-write never leaves a `<uuid>.sdb` with
/// partial content — `open_all` only ever sees the prior good file or the
/// fully-written new one (§8 scenario 5).
async fn write_file(dir: &Path, rec: &KeyRecord) -> Result<()> {
    let final_path = record_path(dir, &rec.uuid);
    let tmp_path = dir.join(format!("{}.sdb.tmp", rec.uuid));
    let bytes = encode_record(rec);
    tokio::fs::write(&tmp_path, &bytes).await.map_err(|e| Error::io(tmp_path.display().to_string(), e))?;
    tokio::fs::rename(&tmp_path, &final_path)
        .await
        .map_err(|e| Error::io(final_path.display().to_string(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::CommandContent;
    use std::net::Ipv4Addr;

    fn sample_record() -> KeyRecord {
        let mut alive_messages = HashMap::new();
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
        alive_messages.insert(
            ip,
            vec![AliveMessage { timestamp: 100, ip, hostname: "host-a".into() }],
        );
        let mut pending_commands = HashMap::new();
        pending_commands.insert(
            ip,
            vec![PendingCommand {
                valid_from: 50,
                validity_sec: 600,
                content: CommandContent::Umount,
                seen_by_client: true,
                client_result: Some("ok".into()),
            }],
        );
        KeyRecord {
            uuid: KeyRecord::new_uuid(),
            id: "disk0".into(),
            creation_time: 42,
            key_material: Some(vec![0xAA; 32]),
            external_id: None,
            mount_point: "/mnt/data".into(),
            mount_options: "noatime".into(),
            max_active: 3,
            alive_interval_sec: 30,
            alive_count: 4,
            alive_messages,
            last_retrieval: Some(AliveMessage { timestamp: 100, ip, hostname: "host-a".into() }),
            pending_commands,
        }
    }

    #[test]
    fn tagged_field_roundtrip_is_byte_exact_per_field() {
        let rec = sample_record();
        let bytes = encode_record(&rec);
        let decoded = decode_record("test", &bytes).unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn unknown_tags_are_ignored_on_read() {
        let rec = sample_record();
        let mut bytes = encode_record(&rec);
        // Append a bogus unknown-tag field; it must not break decoding.
        write_field(&mut bytes, 9999, b"future-field");
        let decoded = decode_record("test", &bytes).unwrap();
        assert_eq!(decoded.uuid, rec.uuid);
    }

    #[tokio::test]
    async fn open_one_round_trips_after_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open_all(dir.path()).await.unwrap();
        let rec = sample_record();
        store.upsert(rec.clone()).await.unwrap();

        let reloaded = RecordStore::open_one(dir.path(), &rec.uuid).await.unwrap();
        assert_eq!(reloaded, rec);
    }

    #[tokio::test]
    async fn write_one_is_visible_to_a_concurrently_running_daemon_after_reload() {
        // Simulates the admin CLI editing a record out-of-process: a second
        // writer uses `write_one` directly (no `RecordStore` of its own),
        // and the running daemon's store only sees it via `reload_one`.
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open_all(dir.path()).await.unwrap();
        let rec = sample_record();
        store.upsert(rec.clone()).await.unwrap();

        let mut edited = rec.clone();
        edited.mount_options = "ro".into();
        RecordStore::write_one(dir.path(), &edited).await.unwrap();

        // The daemon's in-memory copy is stale until it reloads.
        assert_eq!(store.get_by_uuid(&rec.uuid).await.unwrap().mount_options, rec.mount_options);
        store.reload_one(&rec.uuid).await.unwrap();
        assert_eq!(store.get_by_uuid(&rec.uuid).await.unwrap().mount_options, "ro");
    }

    #[tokio::test]
    async fn open_all_rejects_duplicate_uuids() {
        let dir = tempfile::tempdir().unwrap();
        let rec = sample_record();
        let bytes = encode_record(&rec);
        tokio::fs::write(dir.path().join(format!("{}.sdb", rec.uuid)), &bytes).await.unwrap();
        // Second file, different name, same uuid inside.
        tokio::fs::write(dir.path().join("duplicate-name.sdb"), &bytes).await.unwrap();

        let err = RecordStore::open_all(dir.path()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Corruption);
    }

    #[tokio::test]
    async fn atomic_write_survives_truncated_temp_file() {
        // §8 scenario 5: simulate a crash by leaving a truncated .sdb.tmp
        // behind — open_all must still load the prior good record and must
        // never see a partially-written file under the final name.
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open_all(dir.path()).await.unwrap();
        let rec = sample_record();
        store.upsert(rec.clone()).await.unwrap();

        tokio::fs::write(dir.path().join(format!("{}.sdb.tmp", rec.uuid)), b"short").await.unwrap();

        let reloaded = RecordStore::open_all(dir.path()).await.unwrap();
        let got = reloaded.get_by_uuid(&rec.uuid).await.unwrap();
        assert_eq!(got, rec);
    }

    #[tokio::test]
    async fn erase_removes_file_and_memory_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open_all(dir.path()).await.unwrap();
        let rec = sample_record();
        store.upsert(rec.clone()).await.unwrap();
        store.erase(&rec.uuid).await.unwrap();

        assert!(store.get_by_uuid(&rec.uuid).await.is_none());
        assert!(!record_path(dir.path(), &rec.uuid).exists());
    }

    #[tokio::test]
    async fn list_sorts_by_last_retrieval_descending() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open_all(dir.path()).await.unwrap();

        let mut a = sample_record();
        a.last_retrieval = Some(AliveMessage { timestamp: 10, ip: a.last_retrieval.as_ref().unwrap().ip, hostname: "a".into() });
        let mut b = sample_record();
        b.last_retrieval = Some(AliveMessage { timestamp: 20, ip: b.last_retrieval.as_ref().unwrap().ip, hostname: "b".into() });

        store.upsert(a.clone()).await.unwrap();
        store.upsert(b.clone()).await.unwrap();

        let list = store.list().await;
        assert_eq!(list[0].uuid, b.uuid);
        assert_eq!(list[1].uuid, a.uuid);
    }
}
