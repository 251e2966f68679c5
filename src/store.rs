// SPDX-License-Identifier: GPL-2.0-or-later
//
// Copyright (C) 2021 John Arnold
//
// This program is free software; you can redistribute it and/or
// modify it under the terms of the GNU General Public License
// as published by the Free Software Foundation; either version 2
// of the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::sys::stat::utimes;
use nix::sys::time::{TimeVal, TimeValLike};

use crate::config::{BUILD_TREE, INSTALL_TREE, STAGE_TREE};

/// Subdirectories every staged install starts out with.
pub const INSTALL_TREE_DIRS: [&str; 8] =
    ["lib", "bin", "sbin", "man", "doc", "share", "stublibs", "etc"];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Error while creating {}", .0.display())]
    Create(PathBuf, #[source] io::Error),
    #[error("Error while removing {}", .0.display())]
    Remove(PathBuf, #[source] io::Error),
    #[error("Error while writing {}", .0.display())]
    Write(PathBuf, #[source] io::Error),
    #[error("Error while copying {} to {}", .from.display(), .to.display())]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Error while committing {} to {}", .from.display(), .to.display())]
    Commit {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Create the three store subtrees under `root`. Store directories are
/// created on demand and never deleted by the builder.
pub fn ensure_store_layout(root: &Path) -> Result<(), StoreError> {
    for tree in &[BUILD_TREE, STAGE_TREE, INSTALL_TREE] {
        ensure_dir(&root.join(tree))?;
    }
    Ok(())
}

pub fn ensure_dir(path: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(path).map_err(|e| StoreError::Create(path.to_path_buf(), e))
}

pub fn create_install_skeleton(install: &Path) -> Result<(), StoreError> {
    for dir in &INSTALL_TREE_DIRS {
        ensure_dir(&install.join(dir))?;
    }
    Ok(())
}

/// Recursively remove `path`; an absent path is not an error.
pub fn remove_tree(path: &Path) -> Result<(), StoreError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::Remove(path.to_path_buf(), e)),
    }
}

pub fn write_file(path: &Path, contents: &str) -> Result<(), StoreError> {
    fs::write(path, contents).map_err(|e| StoreError::Write(path.to_path_buf(), e))
}

/// The commit point of a build: rename the staged install onto its final
/// location. Same-filesystem by construction, so the rename is atomic.
pub fn commit_install(staging: &Path, dest: &Path) -> Result<(), StoreError> {
    fs::rename(staging, dest).map_err(|e| StoreError::Commit {
        from: staging.to_path_buf(),
        to: dest.to_path_buf(),
        source: e,
    })
}

/// Archive-mode mirror of `src`'s contents into `dst`: permissions,
/// timestamps and symlinks are preserved; the directory itself is not
/// copied, only its contents.
pub fn mirror_tree(src: &Path, dst: &Path) -> Result<(), StoreError> {
    ensure_dir(dst)?;
    let copy_err = |from: &Path, to: &Path, source: io::Error| StoreError::Copy {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };
    let entries = fs::read_dir(src).map_err(|e| copy_err(src, dst, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| copy_err(src, dst, e))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| copy_err(&from, &to, e))?;
        if file_type.is_dir() {
            mirror_tree(&from, &to)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(&from).map_err(|e| copy_err(&from, &to, e))?;
            std::os::unix::fs::symlink(&target, &to).map_err(|e| copy_err(&from, &to, e))?;
        } else {
            fs::copy(&from, &to).map_err(|e| copy_err(&from, &to, e))?;
            copy_times(&from, &to).map_err(|e| copy_err(&from, &to, e))?;
        }
    }
    let src_meta = fs::metadata(src).map_err(|e| copy_err(src, dst, e))?;
    fs::set_permissions(dst, src_meta.permissions()).map_err(|e| copy_err(src, dst, e))?;
    // After the children, so their creation does not disturb the mtime.
    copy_times(src, dst).map_err(|e| copy_err(src, dst, e))?;
    Ok(())
}

fn copy_times(src: &Path, dst: &Path) -> Result<(), io::Error> {
    let meta = fs::metadata(src)?;
    let atime = timeval(meta.accessed()?)?;
    let mtime = timeval(meta.modified()?)?;
    utimes(dst, &atime, &mtime).map_err(|e| {
        if let Some(errno) = e.as_errno() {
            io::Error::from_raw_os_error(errno as i32)
        } else {
            io::Error::from_raw_os_error(0)
        }
    })
}

fn timeval(time: SystemTime) -> Result<TimeVal, io::Error> {
    let since_epoch = time
        .duration_since(UNIX_EPOCH)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    Ok(TimeVal::microseconds(since_epoch.as_micros() as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_ensure_store_layout() {
        let dir = tempfile::tempdir().unwrap();
        ensure_store_layout(dir.path()).unwrap();
        for tree in &["_build", "_insttmp", "_install"] {
            assert!(dir.path().join(tree).is_dir());
        }
        // Creating again over an existing layout is fine.
        ensure_store_layout(dir.path()).unwrap();
    }

    #[test]
    fn test_remove_tree_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        remove_tree(&dir.path().join("nothing-here")).unwrap();
    }

    #[test]
    fn test_commit_install_renames() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("_insttmp").join("ID");
        fs::create_dir_all(staging.join("bin")).unwrap();
        fs::write(staging.join("bin").join("tool"), b"x").unwrap();
        let dest = dir.path().join("_install").join("ID");
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        commit_install(&staging, &dest).unwrap();
        assert!(!staging.exists());
        assert!(dest.join("bin").join("tool").is_file());
    }

    #[test]
    fn test_mirror_tree_preserves_mode_and_links() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("nested").join("script"), b"#!/bin/sh\n").unwrap();
        let mut perms = fs::metadata(src.join("nested").join("script"))
            .unwrap()
            .permissions();
        perms.set_mode(0o755);
        fs::set_permissions(src.join("nested").join("script"), perms).unwrap();
        std::os::unix::fs::symlink("nested/script", src.join("link")).unwrap();

        let dst = dir.path().join("dst");
        mirror_tree(&src, &dst).unwrap();
        let copied = fs::metadata(dst.join("nested").join("script")).unwrap();
        assert_eq!(copied.permissions().mode() & 0o777, 0o755);
        let target = fs::read_link(dst.join("link")).unwrap();
        assert_eq!(target, PathBuf::from("nested/script"));
    }
}
