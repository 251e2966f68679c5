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

use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::process::{Command, ExitStatus};

use log::{debug, info};

use crate::build::{self, Build, BuildSandbox, ManifestError};
use crate::config::BuildConfig;
use crate::env::{self, EnvError};
use crate::graph::{self, GraphError};
use crate::rewrite::{self, RewriteError};
use crate::store::{self, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Rewrite(#[from] RewriteError),
    #[error("Unable to execute build command for {id}")]
    CommandSpawn {
        id: String,
        #[source]
        source: io::Error,
    },
    #[error("Build command {index} for {id} exited with {status}:\n{stderr_tail}")]
    CommandFailed {
        id: String,
        index: usize,
        status: ExitStatus,
        stderr_tail: String,
    },
    #[error("Build {id} skipped because dependency {dependency} failed")]
    DependencyFailed { id: String, dependency: String },
}

/// The failure of a whole sandbox build: the first error encountered in
/// post-order, with every subsequent error attached.
#[derive(Debug, thiserror::Error)]
#[error("{first}")]
pub struct SandboxError {
    pub first: BuildError,
    pub rest: Vec<BuildError>,
}

impl From<BuildError> for SandboxError {
    fn from(first: BuildError) -> Self {
        SandboxError {
            first,
            rest: Vec::new(),
        }
    }
}

/// Executes every build of a sandbox, sequentially in dependency
/// post-order, against a concrete store.
pub struct Builder<'a> {
    sandbox: &'a BuildSandbox,
    config: &'a BuildConfig,
}

impl<'a> Builder<'a> {
    pub fn new(sandbox: &'a BuildSandbox, config: &'a BuildConfig) -> Self {
        Builder { sandbox, config }
    }

    /// Build the whole graph. A failed build fails every build that
    /// transitively depends on it (those are skipped, not retried), but
    /// independent subtrees keep building; the store keeps every install
    /// committed before the failure.
    pub fn build_all(&self) -> Result<(), SandboxError> {
        let order = self.prepare().map_err(SandboxError::from)?;
        let mut failed: HashSet<&str> = HashSet::new();
        let mut errors: Vec<BuildError> = Vec::new();
        for build in order {
            if let Some(dep) = build
                .dependencies
                .iter()
                .find(|dep| failed.contains(dep.as_str()))
            {
                failed.insert(build.id.as_str());
                errors.push(BuildError::DependencyFailed {
                    id: build.id.clone(),
                    dependency: dep.clone(),
                });
                continue;
            }
            if let Err(e) = self.perform_build(build) {
                failed.insert(build.id.as_str());
                errors.push(e);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            let first = errors.remove(0);
            Err(SandboxError { first, rest: errors })
        }
    }

    fn prepare(&self) -> Result<Vec<&'a Build>, BuildError> {
        let reachable = graph::bfs(self.sandbox)?;
        if let Some(err) = build::manifest_errors(reachable.into_iter()) {
            return Err(err.into());
        }
        store::ensure_store_layout(&self.config.store_path)?;
        store::ensure_store_layout(&self.config.sandbox_store_path())?;
        Ok(graph::post_order_dfs(self.sandbox)?)
    }

    fn perform_build(&self, build: &Build) -> Result<(), BuildError> {
        let final_install = self.config.final_install_path(build);
        if build.should_be_persisted && final_install.is_dir() {
            info!("{} {} is already in the store", build.name, build.version);
            return Ok(());
        }
        info!("building {} {}", build.name, build.version);

        let build_dir = self.config.build_path(build);
        let staging = self.config.install_path(build);
        store::remove_tree(&final_install)?;
        store::remove_tree(&staging)?;
        store::remove_tree(&build_dir)?;
        store::ensure_dir(&build_dir.join("_esy"))?;
        store::create_install_skeleton(&staging)?;
        if build.mutates_source_path {
            debug!("{}: staging sources into the build tree", build.name);
            store::mirror_tree(&self.config.source_path(build), &build_dir)?;
        }

        let env = env::compose(self.config, self.sandbox, build)?;
        let env_file = build_dir.join("_esy").join("env");
        store::write_file(&env_file, &env.render())?;
        let findlib = env::findlib_conf(self.config, self.sandbox, build)?;
        store::write_file(&build_dir.join("_esy").join("findlib.conf"), &findlib)?;

        self.run_commands(build, &env_file)?;

        let needle = staging.display().to_string();
        let replacement = final_install.display().to_string();
        rewrite::rewrite_prefix(&staging, &needle, &replacement)?;
        store::commit_install(&staging, &final_install)?;
        info!("{} {} installed", build.name, build.version);
        Ok(())
    }

    /// Run the build's commands in sequence, each in a shell whose working
    /// directory is the build root and which sources the materialized env
    /// first. The composed values are applied over the inherited process
    /// environment by the sourcing itself, which also gives `$cur__*` and
    /// `$PATH` references their shell expansion semantics.
    fn run_commands(&self, build: &Build, env_file: &Path) -> Result<(), BuildError> {
        let cwd = self.config.root_path(build);
        for (index, cmd) in build.command.iter().enumerate() {
            debug!("{}: running `{}`", build.name, cmd);
            let script = format!("source \"{}\" && {}", env_file.display(), cmd);
            let output = Command::new("/bin/bash")
                .arg("-c")
                .arg(&script)
                .current_dir(&cwd)
                .output()
                .map_err(|e| BuildError::CommandSpawn {
                    id: build.id.clone(),
                    source: e,
                })?;
            if !output.stdout.is_empty() {
                debug!("{}: {}", build.name, String::from_utf8_lossy(&output.stdout));
            }
            if !output.status.success() {
                return Err(BuildError::CommandFailed {
                    id: build.id.clone(),
                    index,
                    status: output.status,
                    stderr_tail: stderr_tail(&output.stderr),
                });
            }
        }
        Ok(())
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(8);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let long: Vec<String> = (0..20).map(|i| format!("line {}", i)).collect();
        let tail = stderr_tail(long.join("\n").as_bytes());
        assert!(tail.starts_with("line 12"));
        assert!(tail.ends_with("line 19"));
    }

    #[test]
    fn test_sandbox_error_from_single() {
        let err = SandboxError::from(BuildError::DependencyFailed {
            id: "a".to_string(),
            dependency: "b".to_string(),
        });
        assert!(err.rest.is_empty());
        assert!(err.to_string().contains("dependency b"));
    }
}
