//! Hyper-V data exchange (KVP) pool files.
//!
//! The Linux integration daemon keeps one file per pool. Each record is a
//! NUL padded 512-byte key followed by a NUL padded 2048-byte value. Pool 0
//! carries host-to-guest items, pool 1 the items the guest publishes.
//! Access is serialized with POSIX record locks, as the daemon does.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use egs_core::constants::{KVP_MAX_KEY_SIZE, KVP_MAX_VALUE_SIZE};
use egs_core::error::{Error, Result};

/// Size of one pool record.
pub const KVP_RECORD_SIZE: usize = KVP_MAX_KEY_SIZE + KVP_MAX_VALUE_SIZE;

const HOST_TO_GUEST_POOL: &str = ".kvp_pool_0";
const GUEST_TO_HOST_POOL: &str = ".kvp_pool_1";

/// One key/value item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvpRecord {
    pub key: String,
    pub value: String,
}

/// A KVP pool file.
#[derive(Debug, Clone)]
pub struct KvpPool {
    path: PathBuf,
}

impl KvpPool {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Items pushed by the host.
    pub fn host_to_guest(dir: &Path) -> Self {
        Self::new(dir.join(HOST_TO_GUEST_POOL))
    }

    /// Items the guest publishes to the host.
    pub fn guest_to_host(dir: &Path) -> Self {
        Self::new(dir.join(GUEST_TO_HOST_POOL))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every record in the pool. A missing pool file is empty.
    pub fn read_all(&self) -> Result<Vec<KvpRecord>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        lock(&file, false)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(data
            .chunks_exact(KVP_RECORD_SIZE)
            .map(decode_record)
            .filter(|r| !r.key.is_empty())
            .collect())
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .read_all()?
            .into_iter()
            .find(|r| r.key == key)
            .map(|r| r.value))
    }

    /// Insert or replace `key`.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let record = encode_record(key, value)?;
        let mut file = self.open_for_update()?;
        let index = find_record(&mut file, key)?;
        let offset = match index {
            Some(i) => i * KVP_RECORD_SIZE,
            None => file.seek(SeekFrom::End(0))? as usize / KVP_RECORD_SIZE * KVP_RECORD_SIZE,
        };
        file.seek(SeekFrom::Start(offset as u64))?;
        file.write_all(&record)?;
        file.flush()?;
        debug!(pool = %self.path.display(), key, "KVP item written");
        Ok(())
    }

    /// Remove `key`. Returns whether it was present.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let mut file = match self.open_existing_for_update()? {
            Some(file) => file,
            None => return Ok(false),
        };
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let before = data.len() / KVP_RECORD_SIZE;
        let kept: Vec<u8> = data
            .chunks_exact(KVP_RECORD_SIZE)
            .filter(|chunk| decode_record(chunk).key != key)
            .flatten()
            .copied()
            .collect();
        if kept.len() / KVP_RECORD_SIZE == before {
            return Ok(false);
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&kept)?;
        file.flush()?;
        debug!(pool = %self.path.display(), key, "KVP item removed");
        Ok(true)
    }

    fn open_for_update(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        lock(&file, true)?;
        Ok(file)
    }

    fn open_existing_for_update(&self) -> Result<Option<File>> {
        match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(file) => {
                lock(&file, true)?;
                Ok(Some(file))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn find_record(file: &mut File, key: &str) -> Result<Option<usize>> {
    let mut data = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut data)?;
    Ok(data
        .chunks_exact(KVP_RECORD_SIZE)
        .position(|chunk| decode_record(chunk).key == key))
}

/// Encode one NUL padded record. Oversized keys or values are refused.
pub fn encode_record(key: &str, value: &str) -> Result<Vec<u8>> {
    // The daemon keeps a terminating NUL inside each field.
    if key.is_empty() || key.len() >= KVP_MAX_KEY_SIZE {
        return Err(Error::Protocol {
            message: format!("KVP key must be 1..{} bytes", KVP_MAX_KEY_SIZE - 1),
        });
    }
    if value.len() >= KVP_MAX_VALUE_SIZE {
        return Err(Error::Protocol {
            message: format!("KVP value for {} exceeds {} bytes", key, KVP_MAX_VALUE_SIZE - 1),
        });
    }
    let mut record = vec![0u8; KVP_RECORD_SIZE];
    record[..key.len()].copy_from_slice(key.as_bytes());
    record[KVP_MAX_KEY_SIZE..KVP_MAX_KEY_SIZE + value.len()].copy_from_slice(value.as_bytes());
    Ok(record)
}

/// Decode one record, stopping each field at its first NUL.
pub fn decode_record(record: &[u8]) -> KvpRecord {
    fn field(bytes: &[u8]) -> String {
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    }
    let split = KVP_MAX_KEY_SIZE.min(record.len());
    KvpRecord {
        key: field(&record[..split]),
        value: field(&record[split..]),
    }
}

#[cfg(unix)]
fn lock(file: &File, exclusive: bool) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: flock is plain old data; fcntl only reads it.
    let mut request: libc::flock = unsafe { std::mem::zeroed() };
    let kind = if exclusive { libc::F_WRLCK } else { libc::F_RDLCK };
    request.l_type = kind as _;
    request.l_whence = libc::SEEK_SET as _;
    if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLKW, &request) } < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(not(unix))]
fn lock(_file: &File, _exclusive: bool) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout() {
        let record = encode_record("k", "v").unwrap();
        assert_eq!(record.len(), KVP_RECORD_SIZE);
        assert_eq!(record[0], b'k');
        assert_eq!(record[KVP_MAX_KEY_SIZE], b'v');
        assert_eq!(
            decode_record(&record),
            KvpRecord {
                key: "k".into(),
                value: "v".into()
            }
        );
    }

    #[test]
    fn oversized_fields_are_refused() {
        assert!(encode_record(&"k".repeat(KVP_MAX_KEY_SIZE), "v").is_err());
        assert!(encode_record("k", &"v".repeat(KVP_MAX_VALUE_SIZE)).is_err());
        assert!(encode_record("", "v").is_err());
    }

    #[test]
    fn set_replaces_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let pool = KvpPool::guest_to_host(dir.path());
        pool.set("a", "1").unwrap();
        pool.set("b", "2").unwrap();
        pool.set("a", "3").unwrap();

        assert_eq!(pool.get("a").unwrap().as_deref(), Some("3"));
        assert_eq!(pool.read_all().unwrap().len(), 2);
        assert_eq!(
            std::fs::metadata(pool.path()).unwrap().len() as usize,
            2 * KVP_RECORD_SIZE
        );
    }

    #[test]
    fn remove_compacts_pool() {
        let dir = tempfile::tempdir().unwrap();
        let pool = KvpPool::guest_to_host(dir.path());
        pool.set("a", "1").unwrap();
        pool.set("b", "2").unwrap();

        assert!(pool.remove("a").unwrap());
        assert!(!pool.remove("a").unwrap());
        assert_eq!(
            pool.read_all().unwrap(),
            vec![KvpRecord {
                key: "b".into(),
                value: "2".into()
            }]
        );
    }

    #[test]
    fn missing_pool_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let pool = KvpPool::host_to_guest(dir.path());
        assert!(pool.read_all().unwrap().is_empty());
        assert!(pool.get("x").unwrap().is_none());
        assert!(!pool.remove("x").unwrap());
    }
}
