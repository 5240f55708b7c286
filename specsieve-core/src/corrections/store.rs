use super::records::{validate_owner, CorrectionKind, CorrectionRecord, Scope};
use crate::concurrency::FileLock;
use crate::error::CorrectionError;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const SHARED_DIR: &str = "_shared";
const LOCK_DIR: &str = ".locks";

/// Filter for `CorrectionStore::list`; `None` fields match everything
#[derive(Debug, Clone, Default)]
pub struct CorrectionFilter {
    pub device: Option<String>,
    pub kind: Option<CorrectionKind>,
    pub scope: Option<Scope>,
}

impl CorrectionFilter {
    fn matches(&self, record: &CorrectionRecord) -> bool {
        self.kind.map_or(true, |k| record.kind() == k)
            && self.scope.map_or(true, |s| record.scope == s)
    }
}

/// Every record that can affect one device, grouped by scope, each group in
/// append order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorrectionSet {
    pub device: Vec<CorrectionRecord>,
    pub vendor: Vec<CorrectionRecord>,
    pub standard: Vec<CorrectionRecord>,
    pub global: Vec<CorrectionRecord>,
}

impl CorrectionSet {
    pub fn len(&self) -> usize {
        self.device.len() + self.vendor.len() + self.standard.len() + self.global.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &CorrectionRecord> {
        self.device
            .iter()
            .chain(&self.vendor)
            .chain(&self.standard)
            .chain(&self.global)
    }
}

/// Append-only correction files.
///
/// Layout under the root:
/// - `<device_id>/<kind>.jsonl`
/// - `_shared/vendor/<vendor>/<kind>.jsonl`
/// - `_shared/standard/<kind>.jsonl`
/// - `_shared/global/<kind>.jsonl`
///
/// Writers hold a per-device file lock under `.locks/` (shared records use
/// one lock of their own), and snapshots take the same locks. The locks are
/// advisory `flock`s, so separate CLI processes serialize too. A line left
/// truncated by a crashed writer is skipped with a warning.
pub struct CorrectionStore {
    root: PathBuf,
}

impl CorrectionStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, CorrectionError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Block until no other writer or snapshot holds `key`
    pub fn lock(&self, key: &str) -> Result<FileLock, CorrectionError> {
        Ok(FileLock::acquire(&self.root.join(LOCK_DIR).join(format!("{key}.lock")))?)
    }

    fn record_path(&self, record: &CorrectionRecord) -> Result<PathBuf, CorrectionError> {
        let file = format!("{}.jsonl", record.kind().file_stem());
        let owner = || {
            record.owner.as_deref().ok_or_else(|| CorrectionError::MissingOwner {
                scope: record.scope.to_string(),
                what: "an owner".to_string(),
            })
        };
        Ok(match record.scope {
            Scope::Device => self.root.join(owner()?).join(file),
            Scope::Vendor => self
                .root
                .join(SHARED_DIR)
                .join("vendor")
                .join(owner()?)
                .join(file),
            Scope::Standard | Scope::Global => self
                .root
                .join(SHARED_DIR)
                .join(record.scope.as_str())
                .join(file),
        })
    }

    fn lock_key(record: &CorrectionRecord) -> String {
        match (record.scope, &record.owner) {
            (Scope::Device, Some(device)) => device.clone(),
            _ => SHARED_DIR.to_string(),
        }
    }

    /// Validate and append one record. Existing lines are never touched.
    pub fn append(&self, record: &CorrectionRecord) -> Result<PathBuf, CorrectionError> {
        record.validate()?;
        if record.scope == Scope::Device && record.owner.as_deref() == Some(SHARED_DIR) {
            return Err(CorrectionError::MissingDevice(SHARED_DIR.to_string()));
        }
        let path = self.record_path(record)?;
        let _lock = self.lock(&Self::lock_key(record))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).read(true).append(true).open(&path)?;
        // A truncated tail from a crashed writer must not swallow this record
        if ends_mid_line(&mut file)? {
            line.insert(0, '\n');
        }
        file.write_all(line.as_bytes())?;
        file.flush()?;

        debug!(
            kind = %record.kind(),
            scope = %record.scope,
            target = %record.target_key,
            path = %path.display(),
            "Appended correction"
        );
        Ok(path)
    }

    /// Consistent view of everything that applies to `device_id`
    pub fn snapshot(&self, device_id: &str, vendor: Option<&str>) -> Result<CorrectionSet, CorrectionError> {
        if device_id == SHARED_DIR {
            return Err(CorrectionError::MissingDevice(device_id.to_string()));
        }
        validate_owner(device_id)?;
        if let Some(vendor) = vendor {
            validate_owner(vendor)?;
        }
        let _device = self.lock(device_id)?;
        let _shared = self.lock(SHARED_DIR)?;

        let mut set = CorrectionSet {
            device: read_dir_streams(&self.root.join(device_id))?,
            standard: read_dir_streams(&self.root.join(SHARED_DIR).join("standard"))?,
            global: read_dir_streams(&self.root.join(SHARED_DIR).join("global"))?,
            ..Default::default()
        };
        if let Some(vendor) = vendor {
            set.vendor = read_dir_streams(&self.root.join(SHARED_DIR).join("vendor").join(vendor))?;
        }
        Ok(set)
    }

    /// Records matching `filter`, oldest first
    pub fn list(&self, filter: &CorrectionFilter) -> Result<Vec<CorrectionRecord>, CorrectionError> {
        let mut records = Vec::new();

        let devices = match &filter.device {
            Some(device) => {
                validate_owner(device)?;
                vec![device.clone()]
            }
            None => self.device_ids()?,
        };
        for device in &devices {
            records.extend(read_dir_streams(&self.root.join(device))?);
        }

        let shared = self.root.join(SHARED_DIR);
        records.extend(read_dir_streams(&shared.join("standard"))?);
        records.extend(read_dir_streams(&shared.join("global"))?);
        let vendors_dir = shared.join("vendor");
        if vendors_dir.is_dir() {
            let mut vendors: Vec<PathBuf> = fs::read_dir(&vendors_dir)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect();
            vendors.sort();
            for vendor in vendors {
                records.extend(read_dir_streams(&vendor)?);
            }
        }

        records.retain(|r| filter.matches(r));
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Devices that have at least one correction directory
    pub fn device_ids(&self) -> Result<Vec<String>, CorrectionError> {
        let mut ids: Vec<String> = fs::read_dir(&self.root)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|name| name != SHARED_DIR && !name.starts_with('.'))
            .collect();
        ids.sort();
        Ok(ids)
    }
}

fn ends_mid_line(file: &mut fs::File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// All kind streams in a directory, in `CorrectionKind::ALL` order
fn read_dir_streams(dir: &Path) -> Result<Vec<CorrectionRecord>, CorrectionError> {
    let mut records = Vec::new();
    for kind in CorrectionKind::ALL {
        records.extend(read_stream(&dir.join(format!("{}.jsonl", kind.file_stem())))?);
    }
    Ok(records)
}

fn read_stream(path: &Path) -> Result<Vec<CorrectionRecord>, CorrectionError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)?;
    let mut records = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            // A write cut short; everything else in the stream still counts
            Err(e) if e.is_eof() => warn!(
                path = %path.display(),
                line = index + 1,
                error = %e,
                "Skipping truncated correction line"
            ),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corrections::records::CorrectionPayload;
    use tempfile::TempDir;

    fn confirm(device: &str, citation: &str) -> CorrectionRecord {
        CorrectionRecord::new(
            Scope::Device,
            Some(device.to_string()),
            CorrectionPayload::Confirmation {
                citation_id: citation.to_string(),
            },
            "checked",
        )
    }

    #[test]
    fn appends_never_rewrite_earlier_lines() {
        let dir = TempDir::new().unwrap();
        let store = CorrectionStore::new(dir.path()).unwrap();

        let path = store.append(&confirm("dev-1", "p1_txt1")).unwrap();
        let first = fs::read_to_string(&path).unwrap();
        store.append(&confirm("dev-1", "p1_txt2")).unwrap();
        let second = fs::read_to_string(&path).unwrap();

        assert!(second.starts_with(&first));
        assert_eq!(second.lines().count(), 2);
        assert!(path.ends_with("dev-1/confirmations.jsonl"));
    }

    #[test]
    fn snapshot_groups_by_scope() {
        let dir = TempDir::new().unwrap();
        let store = CorrectionStore::new(dir.path()).unwrap();

        store.append(&confirm("dev-1", "p1_txt1")).unwrap();
        store.append(&confirm("dev-2", "p1_txt1")).unwrap();
        store
            .append(&CorrectionRecord::new(
                Scope::Vendor,
                Some("acme".into()),
                CorrectionPayload::CategoryOverride {
                    prefix: "OBS".into(),
                    category: "observation".into(),
                },
                "",
            ))
            .unwrap();

        let set = store.snapshot("dev-1", Some("acme")).unwrap();
        assert_eq!(set.device.len(), 1);
        assert_eq!(set.vendor.len(), 1);
        assert!(set.standard.is_empty());

        let other = store.snapshot("dev-1", Some("globex")).unwrap();
        assert!(other.vendor.is_empty());
    }

    #[test]
    fn truncated_line_is_skipped_and_later_appends_survive() {
        let dir = TempDir::new().unwrap();
        let store = CorrectionStore::new(dir.path()).unwrap();
        let path = store.append(&confirm("dev-1", "p1_txt1")).unwrap();

        // Writer died half way through a line
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"scope":"device","owner":"dev-1","targ"#).unwrap();
        drop(file);

        let set = store.snapshot("dev-1", None).unwrap();
        assert_eq!(set.device.len(), 1);

        store.append(&confirm("dev-1", "p1_txt2")).unwrap();
        let set = store.snapshot("dev-1", None).unwrap();
        let targets: Vec<&str> = set.device.iter().map(|r| r.target_key.as_str()).collect();
        assert_eq!(targets, vec!["p1_txt1", "p1_txt2"]);
    }

    #[test]
    fn corrupt_complete_line_is_still_an_error() {
        let dir = TempDir::new().unwrap();
        let store = CorrectionStore::new(dir.path()).unwrap();
        let path = store.append(&confirm("dev-1", "p1_txt1")).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"scope\":42}\n").unwrap();
        drop(file);

        assert!(matches!(
            store.snapshot("dev-1", None),
            Err(CorrectionError::Serialization(_))
        ));
    }

    #[test]
    fn writers_wait_for_a_held_device_lock() {
        let dir = TempDir::new().unwrap();
        let store = CorrectionStore::new(dir.path()).unwrap();
        let held = store.lock("dev-1").unwrap();
        assert!(held.path().starts_with(dir.path().join(LOCK_DIR)));

        std::thread::scope(|scope| {
            let writer = scope.spawn(|| store.append(&confirm("dev-1", "p1_txt1")));
            std::thread::sleep(std::time::Duration::from_millis(50));
            assert!(!writer.is_finished());
            drop(held);
            writer.join().unwrap().unwrap();
        });
        assert_eq!(store.snapshot("dev-1", None).unwrap().device.len(), 1);
        assert_eq!(store.device_ids().unwrap(), vec!["dev-1"]);
    }

    #[test]
    fn traversal_owners_never_leave_the_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("corrections");
        let store = CorrectionStore::new(&root).unwrap();
        let planted = CorrectionRecord::new(
            Scope::Vendor,
            Some("../../escaped".into()),
            CorrectionPayload::CategoryOverride {
                prefix: "OBS".into(),
                category: "observation".into(),
            },
            "",
        );

        assert!(matches!(
            store.append(&planted),
            Err(CorrectionError::InvalidOwner { .. })
        ));
        assert!(matches!(
            store.append(&confirm("../dev-2", "p1_txt1")),
            Err(CorrectionError::InvalidOwner { .. })
        ));
        assert!(!dir.path().join("escaped").exists());
        assert!(!root.join("escaped").exists());
        assert!(store.device_ids().unwrap().is_empty());
        assert!(matches!(
            store.snapshot("dev-1", Some("../x")),
            Err(CorrectionError::InvalidOwner { .. })
        ));
    }

    #[test]
    fn invalid_records_are_not_written() {
        let dir = TempDir::new().unwrap();
        let store = CorrectionStore::new(dir.path()).unwrap();
        let bad = CorrectionRecord::new(
            Scope::Standard,
            None,
            CorrectionPayload::Confirmation {
                citation_id: "p1_txt1".into(),
            },
            "",
        );
        assert!(store.append(&bad).is_err());
        assert!(store.list(&CorrectionFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn list_filters_by_device_kind_and_scope() {
        let dir = TempDir::new().unwrap();
        let store = CorrectionStore::new(dir.path()).unwrap();
        store.append(&confirm("dev-1", "p1_txt1")).unwrap();
        store.append(&confirm("dev-2", "p2_txt1")).unwrap();
        store
            .append(&CorrectionRecord::new(
                Scope::Global,
                None,
                CorrectionPayload::TextReplacement {
                    citation_id: None,
                    original: "0BS".into(),
                    corrected: "OBS".into(),
                },
                "",
            ))
            .unwrap();

        let all = store.list(&CorrectionFilter::default()).unwrap();
        assert_eq!(all.len(), 3);

        let dev2 = store
            .list(&CorrectionFilter {
                device: Some("dev-2".into()),
                scope: Some(Scope::Device),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(dev2.len(), 1);
        assert_eq!(dev2[0].target_key, "p2_txt1");

        let replacements = store
            .list(&CorrectionFilter {
                kind: Some(CorrectionKind::TextReplacement),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(replacements.len(), 1);
        assert_eq!(store.device_ids().unwrap(), vec!["dev-1", "dev-2"]);
    }
}
