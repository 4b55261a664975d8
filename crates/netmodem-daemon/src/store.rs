//! File-backed collaborators
//!
//! Configuration records are one file each under the data directory. The
//! phonebook is a single JSON file rewritten on every change.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use netmodem_core::ports::{ConfigStore, PhoneBook, PhoneEntry, WebFetcher};
use netmodem_core::protocol::ModemError;

const RECORD_EXTENSION: &str = "rec";
const PHONEBOOK_FILE: &str = "phonebook.json";

/// Records as `<dir>/<name>.rec`
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    dir: PathBuf,
}

impl FileConfigStore {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf() }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name).with_extension(RECORD_EXTENSION)
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self, name: &str) -> Option<String> {
        fs::read_to_string(self.path(name)).ok()
    }

    fn save(&mut self, name: &str, contents: &str) -> Result<(), ModemError> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.path(name), contents)?;
        debug!("saved record {}", name);
        Ok(())
    }

    fn remove(&mut self, name: &str) -> bool {
        fs::remove_file(self.path(name)).is_ok()
    }

    fn format(&mut self) -> bool {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return true;
        };
        let mut ok = true;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == RECORD_EXTENSION) {
                if let Err(e) = fs::remove_file(&path) {
                    warn!("cannot remove {}: {}", path.display(), e);
                    ok = false;
                }
            }
        }
        ok
    }
}

/// Phonebook persisted as `<dir>/phonebook.json`
#[derive(Debug)]
pub struct FilePhoneBook {
    path: PathBuf,
    entries: BTreeMap<u64, PhoneEntry>,
}

impl FilePhoneBook {
    /// Load the phonebook in `dir`; a missing or unreadable file starts empty
    pub fn open(dir: &Path) -> Self {
        let path = dir.join(PHONEBOOK_FILE);
        let entries = fs::read_to_string(&path)
            .ok()
            .and_then(|content| match serde_json::from_str::<Vec<PhoneEntry>>(&content) {
                Ok(list) => Some(list),
                Err(e) => {
                    warn!("ignoring {}: {}", path.display(), e);
                    None
                }
            })
            .unwrap_or_default()
            .into_iter()
            .map(|e| (e.number, e))
            .collect();
        Self { path, entries }
    }

    fn persist(&self) {
        let list: Vec<&PhoneEntry> = self.entries.values().collect();
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&list) {
            Ok(json) => {
                if let Err(e) = fs::write(&self.path, json) {
                    warn!("cannot write {}: {}", self.path.display(), e);
                }
            }
            Err(e) => warn!("cannot encode phonebook: {}", e),
        }
    }
}

impl PhoneBook for FilePhoneBook {
    fn entries(&self) -> Vec<PhoneEntry> {
        self.entries.values().cloned().collect()
    }

    fn find(&self, number: u64) -> Option<PhoneEntry> {
        self.entries.get(&number).cloned()
    }

    fn put(&mut self, entry: PhoneEntry) {
        self.entries.insert(entry.number, entry);
        self.persist();
    }

    fn remove(&mut self, number: u64) -> bool {
        let removed = self.entries.remove(&number).is_some();
        if removed {
            self.persist();
        }
        removed
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.persist();
    }
}

/// Serves `file://` URLs and bare paths from disk
#[derive(Debug, Default)]
pub struct FileFetcher;

impl WebFetcher for FileFetcher {
    fn fetch(&mut self, url: &str) -> Result<Vec<u8>, ModemError> {
        let path = match url.strip_prefix("file://") {
            Some(path) => path,
            None if url.contains("://") => {
                return Err(ModemError::FetchFailed(format!("{}: only file:// is served", url)));
            }
            None => url,
        };
        fs::read(path).map_err(|e| ModemError::FetchFailed(format!("{}: {}", url, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(number: u64, address: &str) -> PhoneEntry {
        PhoneEntry {
            number,
            address: address.to_string(),
            modifiers: String::new(),
            notes: "test".to_string(),
        }
    }

    #[test]
    fn test_records_roundtrip_and_format() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileConfigStore::new(&dir.path().join("data"));
        assert_eq!(store.load("config"), None);
        store.save("config", "a,b,c").unwrap();
        store.save("listeners", "[]").unwrap();
        assert_eq!(store.load("config").as_deref(), Some("a,b,c"));
        assert!(store.remove("listeners"));
        assert!(!store.remove("listeners"));
        assert!(store.format());
        assert_eq!(store.load("config"), None);
    }

    #[test]
    fn test_phonebook_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut book = FilePhoneBook::open(dir.path());
        book.put(entry(5551212, "bbs.example.com:23"));
        book.put(entry(42, "host:6400"));

        let reopened = FilePhoneBook::open(dir.path());
        let numbers: Vec<u64> = reopened.entries().iter().map(|e| e.number).collect();
        assert_eq!(numbers, vec![42, 5551212]);

        book.remove(42);
        assert!(FilePhoneBook::open(dir.path()).find(42).is_none());
    }

    #[test]
    fn test_fetcher_reads_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("help.txt");
        fs::write(&path, "HELP").unwrap();
        let mut fetcher = FileFetcher;
        let url = format!("file://{}", path.display());
        assert_eq!(fetcher.fetch(&url).unwrap(), b"HELP".to_vec());
        assert!(fetcher.fetch("http://example.com/help").is_err());
    }
}
