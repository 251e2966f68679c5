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

use std::path::{Path, PathBuf};

use crate::build::Build;

/// Store subtree holding intermediate build artifacts.
pub const BUILD_TREE: &str = "_build";
/// Store subtree where installs are staged before being committed.
pub const STAGE_TREE: &str = "_insttmp";
/// Store subtree of finalized installs; presence of `_install/<id>` is the
/// canonical "already built" signal for persistent builds.
pub const INSTALL_TREE: &str = "_install";
/// Sandbox-relative location of the store used by non-persistent builds.
pub const SANDBOX_STORE: &str = "_esy/store";

pub const EJECT_STORE_PLACEHOLDER: &str = "$ESY_EJECT__STORE";
pub const EJECT_SANDBOX_PLACEHOLDER: &str = "$ESY_EJECT__SANDBOX";
pub const EJECT_ROOT_PLACEHOLDER: &str = "$ESY_EJECT__ROOT";

/// Deterministic mapping from a build to the absolute paths of its five
/// logical trees: source, root (cwd for commands), build, install
/// (staging) and final install.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub store_path: PathBuf,
    pub sandbox_path: PathBuf,
    placeholder: bool,
}

impl BuildConfig {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(store_path: P, sandbox_path: Q) -> Self {
        BuildConfig {
            store_path: store_path.as_ref().to_path_buf(),
            sandbox_path: sandbox_path.as_ref().to_path_buf(),
            placeholder: false,
        }
    }

    /// A config whose roots are the literal placeholder strings resolved
    /// at Make-time by the ejected scripts. The path scheme is otherwise
    /// identical.
    pub fn for_eject() -> Self {
        BuildConfig {
            store_path: PathBuf::from(EJECT_STORE_PLACEHOLDER),
            sandbox_path: PathBuf::from(EJECT_SANDBOX_PLACEHOLDER),
            placeholder: true,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.placeholder
    }

    pub fn sandbox_store_path(&self) -> PathBuf {
        self.sandbox_path.join(SANDBOX_STORE)
    }

    fn base(&self, build: &Build) -> PathBuf {
        if build.should_be_persisted {
            self.store_path.clone()
        } else {
            self.sandbox_store_path()
        }
    }

    pub fn source_path(&self, build: &Build) -> PathBuf {
        self.sandbox_path.join(&build.source_path)
    }

    /// Working directory for the build's commands: the build tree when the
    /// build mutates its sources, the source tree otherwise.
    pub fn root_path(&self, build: &Build) -> PathBuf {
        if build.mutates_source_path {
            self.build_path(build)
        } else {
            self.source_path(build)
        }
    }

    pub fn build_path(&self, build: &Build) -> PathBuf {
        self.base(build).join(BUILD_TREE).join(&build.id)
    }

    pub fn install_path(&self, build: &Build) -> PathBuf {
        self.base(build).join(STAGE_TREE).join(&build.id)
    }

    pub fn final_install_path(&self, build: &Build) -> PathBuf {
        self.base(build).join(INSTALL_TREE).join(&build.id)
    }
}
