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

//! Some tools embed absolute paths into the artifacts they install, so a
//! staged install still refers to the staging prefix once it has been
//! renamed into place. This pass walks the staged tree and rewrites every
//! occurrence of the staging prefix to the final one. Files are rewritten
//! whole, through a temporary sibling, because the two prefixes differ in
//! length and an in-place overwrite at the found offset would corrupt the
//! file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;

#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error("Error while scanning {}", .0.display())]
    Walk(PathBuf, #[source] io::Error),
    #[error("Error while rewriting {}", .0.display())]
    Rewrite(PathBuf, #[source] io::Error),
}

/// Rewrite all occurrences of `needle` to `replacement` in every regular
/// file under `dir`, preserving file modes. Directories and symlinks are
/// left untouched. Returns how many files were rewritten.
pub fn rewrite_prefix(dir: &Path, needle: &str, replacement: &str) -> Result<usize, RewriteError> {
    let mut count = 0;
    walk(dir, needle.as_bytes(), replacement.as_bytes(), &mut count)?;
    debug!(
        "rewrote {} file(s) under {} ({} -> {})",
        count,
        dir.display(),
        needle,
        replacement
    );
    Ok(count)
}

fn walk(
    dir: &Path,
    needle: &[u8],
    replacement: &[u8],
    count: &mut usize,
) -> Result<(), RewriteError> {
    let entries = fs::read_dir(dir).map_err(|e| RewriteError::Walk(dir.to_path_buf(), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| RewriteError::Walk(dir.to_path_buf(), e))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|e| RewriteError::Walk(path.clone(), e))?;
        if file_type.is_dir() {
            walk(&path, needle, replacement, count)?;
        } else if file_type.is_file() {
            let rewritten = rewrite_file(&path, needle, replacement)
                .map_err(|e| RewriteError::Rewrite(path.clone(), e))?;
            if rewritten {
                *count += 1;
            }
        }
    }
    Ok(())
}

fn rewrite_file(path: &Path, needle: &[u8], replacement: &[u8]) -> Result<bool, io::Error> {
    let contents = fs::read(path)?;
    let replaced = match replace_all(&contents, needle, replacement) {
        Some(replaced) => replaced,
        None => return Ok(false),
    };
    let permissions = fs::metadata(path)?.permissions();
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".rewrite");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, &replaced)?;
    fs::set_permissions(&tmp, permissions)?;
    fs::rename(&tmp, path)?;
    Ok(true)
}

fn replace_all(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Option<Vec<u8>> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut found = false;
    let mut i = 0;
    while i < haystack.len() {
        if haystack.len() - i >= needle.len() && &haystack[i..i + needle.len()] == needle {
            out.extend_from_slice(replacement);
            i += needle.len();
            found = true;
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    if found {
        Some(out)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_replace_all() {
        assert_eq!(
            replace_all(b"a/_insttmp/x/_insttmp/b", b"/_insttmp/", b"/_install/"),
            Some(b"a/_install/x/_install/b".to_vec())
        );
        assert_eq!(replace_all(b"nothing here", b"/_insttmp/", b"/_install/"), None);
    }

    #[test]
    fn test_rewrite_preserves_other_bytes_and_mode() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("bin").join("tool");
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, b"#!/bin/sh\nprefix=/store/_insttmp/ID\n").unwrap();
        let mut perms = fs::metadata(&file).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&file, perms).unwrap();

        let count =
            rewrite_prefix(dir.path(), "/store/_insttmp/ID", "/store/_install/ID").unwrap();
        assert_eq!(count, 1);
        let contents = fs::read(&file).unwrap();
        assert_eq!(&contents[..], b"#!/bin/sh\nprefix=/store/_install/ID\n");
        let mode = fs::metadata(&file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_untouched_files_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data");
        fs::write(&file, b"plain contents").unwrap();
        let count = rewrite_prefix(dir.path(), "/store/_insttmp/ID", "/store/_install/ID").unwrap();
        assert_eq!(count, 0);
        assert_eq!(fs::read(&file).unwrap(), b"plain contents");
    }
}
