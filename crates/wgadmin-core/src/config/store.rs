//! Directory of tunnel files, one `<name>.conf` per tunnel.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{parse_file, serialize, validate_tunnel_name, Config};
use crate::error::{Result, TunnelError};

/// Extension of tunnel files.
pub const CONFIG_EXTENSION: &str = "conf";

/// Suffix appended to backups of deleted tunnel files.
pub const BACKUP_SUFFIX: &str = ".bak";

/// Reads and writes tunnel files in one directory.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    /// Creates a store rooted at `dir`. The directory is created on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The store's directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file for `name`, whether or not it exists.
    #[must_use]
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{CONFIG_EXTENSION}"))
    }

    /// True if a tunnel file exists for `name`.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.path(name).is_file()
    }

    /// Names of all tunnel files, sorted. A missing directory has none.
    pub fn list_names(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CONFIG_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Loads and parses the tunnel file for `name`.
    pub fn load(&self, name: &str) -> Result<Config> {
        validate_tunnel_name(name)?;
        let path = self.path(name);
        if !path.is_file() {
            return Err(TunnelError::not_found(name));
        }
        parse_file(&path)
    }

    /// Writes `config` as the tunnel file for `name`.
    ///
    /// The file is written to a temporary sibling and renamed into place,
    /// readable only by its owner.
    pub fn save(&self, name: &str, config: &Config) -> Result<()> {
        validate_tunnel_name(name)?;
        create_private_dir(&self.dir)?;

        let path = self.path(name);
        let tmp = self.dir.join(format!(".{name}.{CONFIG_EXTENSION}.tmp"));
        let written = write_private(&tmp, serialize(config).as_bytes()).and_then(|()| fs::rename(&tmp, &path));
        if let Err(e) = written {
            // The temp file holds key material.
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        info!(tunnel = %name, path = %path.display(), "wrote tunnel file");
        Ok(())
    }

    /// Removes the tunnel file for `name`, optionally copying it to
    /// `<backup_dir>/<name>.conf.bak` first. Returns the backup path.
    pub fn delete(&self, name: &str, backup_dir: Option<&Path>) -> Result<Option<PathBuf>> {
        validate_tunnel_name(name)?;
        let path = self.path(name);
        if !path.is_file() {
            return Err(TunnelError::not_found(name));
        }

        let backup = match backup_dir {
            Some(dir) => {
                create_private_dir(dir)?;
                let target = dir.join(format!("{name}.{CONFIG_EXTENSION}{BACKUP_SUFFIX}"));
                fs::copy(&path, &target)?;
                debug!(tunnel = %name, backup = %target.display(), "backed up tunnel file");
                Some(target)
            }
            None => None,
        };

        fs::remove_file(&path)?;
        info!(tunnel = %name, "deleted tunnel file");
        Ok(backup)
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}

fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = private_file_options().open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

fn private_file_options() -> fs::OpenOptions {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InterfaceConfig, PeerConfig};
    use crate::keys::PrivateKey;

    fn sample() -> Config {
        Config::new(
            InterfaceConfig::new(PrivateKey::generate()).with_address("10.0.0.2/24".parse().expect("cidr")),
        )
        .with_peer(
            PeerConfig::new(PrivateKey::generate().public_key())
                .with_allowed_ip("10.0.0.0/24".parse().expect("cidr")),
        )
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConfigStore::new(dir.path());
        let config = sample();
        store.save("wg0", &config).expect("save");
        assert!(store.exists("wg0"));
        assert_eq!(store.load("wg0").expect("load"), config);
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConfigStore::new(dir.path().join("nested"));
        store.save("wg0", &sample()).expect("save");
        let mode = fs::metadata(store.path("wg0")).expect("meta").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn failed_rename_leaves_no_temp_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConfigStore::new(dir.path());
        // A non-empty directory in the way makes the final rename fail.
        fs::create_dir(store.path("wg0")).expect("mkdir");
        fs::write(store.path("wg0").join("keep"), "x").expect("write");

        assert!(store.save("wg0", &sample()).is_err());
        assert!(!dir.path().join(".wg0.conf.tmp").exists());
        assert!(store.path("wg0").join("keep").is_file());
    }

    #[test]
    fn list_only_conf_files_sorted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConfigStore::new(dir.path());
        store.save("office", &sample()).expect("save");
        store.save("home", &sample()).expect("save");
        fs::write(dir.path().join("notes.txt"), "x").expect("write");
        assert_eq!(store.list_names().expect("list"), ["home", "office"]);
    }

    #[test]
    fn missing_dir_lists_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConfigStore::new(dir.path().join("absent"));
        assert!(store.list_names().expect("list").is_empty());
    }

    #[test]
    fn load_missing_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConfigStore::new(dir.path());
        assert!(matches!(store.load("wg9"), Err(TunnelError::NotFound { .. })));
    }

    #[test]
    fn path_traversal_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConfigStore::new(dir.path());
        assert!(matches!(store.save("../x", &sample()), Err(TunnelError::InvalidName { .. })));
    }

    #[test]
    fn delete_with_backup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConfigStore::new(dir.path().join("conf"));
        let backups = dir.path().join("backups");
        store.save("wg0", &sample()).expect("save");
        let original = fs::read(store.path("wg0")).expect("read");

        let backup = store.delete("wg0", Some(&backups)).expect("delete");
        assert_eq!(backup, Some(backups.join("wg0.conf.bak")));
        assert!(!store.exists("wg0"));
        assert_eq!(fs::read(backups.join("wg0.conf.bak")).expect("read backup"), original);
    }

    #[test]
    fn delete_without_backup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConfigStore::new(dir.path());
        store.save("wg0", &sample()).expect("save");
        assert_eq!(store.delete("wg0", None).expect("delete"), None);
        assert!(!store.exists("wg0"));
    }
}
