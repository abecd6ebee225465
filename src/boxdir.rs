//! Per-run working directories ("boxes").
//!
//! Each box id owns one directory under the configured box root; the
//! untrusted program runs inside its `box/` subdirectory, and every file it
//! leaves there is audited against the file-size quota at teardown.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::quota::Accountant;

pub struct BoxDir {
    root: PathBuf,
}

impl BoxDir {
    /// Create (or recreate, cleared) the box for `id`.
    pub fn create(box_root: impl AsRef<Path>, id: u32) -> io::Result<Self> {
        let root = box_root.as_ref().join(id.to_string());
        if root.exists() {
            fs::remove_dir_all(&root)?;
        }
        fs::create_dir_all(root.join("box"))?;
        Ok(Self { root })
    }

    /// Open an existing box.
    pub fn open(box_root: impl AsRef<Path>, id: u32) -> io::Result<Self> {
        let root = box_root.as_ref().join(id.to_string());
        if !root.join("box").is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("box {id} is not initialized under {:?}", box_root.as_ref()),
            ));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the supervised program runs.
    pub fn work_dir(&self) -> PathBuf {
        self.root.join("box")
    }

    pub fn remove(self) -> io::Result<()> {
        fs::remove_dir_all(&self.root)
    }
}

/// Charge every file under `dir` to the accountant's file table.
///
/// Returns true if any file is over the quota. The write gate makes that
/// impossible for files the tree wrote through it, so a hit here means the
/// enforcement contract was broken and the run must be classified violated
/// after the fact.
pub fn audit_files(dir: &Path, accountant: &Accountant) -> io::Result<bool> {
    let mut over_quota = false;
    visit(dir, dir, accountant, &mut over_quota)?;
    Ok(over_quota)
}

fn visit(root: &Path, dir: &Path, accountant: &Accountant, over_quota: &mut bool) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();
        if file_type.is_dir() {
            visit(root, &path, accountant, over_quota)?;
        } else if file_type.is_file() {
            let len = entry.metadata()?.len();
            let rel = path.strip_prefix(root).unwrap_or(path.as_path());
            if accountant.charge_write(rel, len).is_deny() {
                *over_quota = true;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::Quotas;
    use crate::utils::Memory;
    use uuid::Uuid;

    fn temp_root() -> PathBuf {
        let root = std::env::temp_dir().join(format!("isolator-test-{}", Uuid::new_v4()));
        fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn box_lifecycle() {
        let box_root = temp_root();
        assert!(BoxDir::open(&box_root, 3).is_err());

        let boxdir = BoxDir::create(&box_root, 3).unwrap();
        assert!(boxdir.work_dir().is_dir());
        fs::write(boxdir.work_dir().join("stale.txt"), "x").unwrap();

        // re-creating clears previous contents
        let boxdir = BoxDir::create(&box_root, 3).unwrap();
        assert!(!boxdir.work_dir().join("stale.txt").exists());

        let reopened = BoxDir::open(&box_root, 3).unwrap();
        reopened.remove().unwrap();
        assert!(BoxDir::open(&box_root, 3).is_err());
        fs::remove_dir_all(&box_root).unwrap();
    }

    #[test]
    fn audit_accounts_files_and_flags_overshoot() {
        let root = temp_root();
        fs::write(root.join("file1.txt"), vec![b'a'; 1024]).unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub/file2.txt"), vec![b'a'; 4096]).unwrap();

        let within = Accountant::new(Quotas {
            fsize: Some(Memory::from_kilobytes(4)),
            ..Quotas::default()
        });
        assert!(!audit_files(&root, &within).unwrap());
        let usage = within.file_usage();
        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0].path, PathBuf::from("file1.txt"));
        assert_eq!(usage[0].bytes, 1024);
        assert_eq!(usage[1].path, PathBuf::from("sub/file2.txt"));
        assert_eq!(usage[1].bytes, 4096);

        let tight = Accountant::new(Quotas {
            fsize: Some(Memory::from_kilobytes(1)),
            ..Quotas::default()
        });
        assert!(audit_files(&root, &tight).unwrap());
        fs::remove_dir_all(&root).unwrap();
    }
}
