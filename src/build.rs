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

use std::collections::HashMap;
use std::path::PathBuf;

use blake2::Blake2s;
use data_encoding::BASE32_NOPAD;
use digest::Digest;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Visibility of an exported environment variable: `Local` exports are
/// seen only by the build itself, `Global` exports also by its consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Scope {
    Local,
    Global,
}

impl Default for Scope {
    fn default() -> Self {
        Scope::Local
    }
}

/// A single environment export declared by a build.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ExportedVar {
    pub name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub value: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub scope: Scope,
    /// Only one build may export this name in a given scope.
    #[cfg_attr(feature = "serde", serde(default))]
    pub exclusive: bool,
    /// Owned by the builder itself; user packages may not set such names.
    #[cfg_attr(feature = "serde", serde(default))]
    pub builtin: bool,
}

impl ExportedVar {
    pub fn local(name: &str, value: &str) -> Self {
        ExportedVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            scope: Scope::Local,
            exclusive: false,
            builtin: false,
        }
    }

    pub fn global(name: &str, value: &str) -> Self {
        ExportedVar {
            scope: Scope::Global,
            ..ExportedVar::local(name, value)
        }
    }
}

/// A plain name/value pair. A `None` value means the variable is defined
/// but carries nothing and is omitted when the environment is rendered.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EnvVar {
    pub name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub value: Option<String>,
}

impl EnvVar {
    pub fn new(name: &str, value: &str) -> Self {
        EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
        }
    }
}

/// A node in the build graph: one package's recipe for producing its
/// installed artifacts. Builds are created by the manifest front-end and
/// immutable afterwards; they reference their dependencies by id.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct Build {
    /// Stable content hash naming the build's directory in the store.
    /// Manifests leave this empty per entry; the enclosing `builds` map
    /// key is authoritative and is copied in by
    /// [BuildSandbox::reconcile_ids].
    #[cfg_attr(feature = "serde", serde(default))]
    pub id: String,
    pub name: String,
    pub version: String,
    /// Shell command strings run in sequence; empty still produces an
    /// (empty) install.
    #[cfg_attr(feature = "serde", serde(default))]
    pub command: Vec<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub exported_env: Vec<ExportedVar>,
    /// Source tree, relative to the sandbox root.
    #[cfg_attr(feature = "serde", serde(default))]
    pub source_path: PathBuf,
    /// The build writes into its own source tree; sources must be staged
    /// into the build tree before any command runs.
    #[cfg_attr(feature = "serde", serde(default))]
    pub mutates_source_path: bool,
    /// Released/immutable artifacts go to the shared store, dev sources
    /// to the sandbox-local one.
    #[cfg_attr(feature = "serde", serde(default))]
    pub should_be_persisted: bool,
    #[cfg_attr(feature = "serde", serde(default))]
    pub dependencies: Vec<String>,
    /// Diagnostics attached at parse time; non-empty means the build is
    /// invalid and the whole operation must fail before any command runs.
    #[cfg_attr(feature = "serde", serde(default))]
    pub errors: Vec<String>,
}

impl Build {
    pub fn new(id: &str, name: &str, version: &str) -> Self {
        Build {
            id: id.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            command: Vec::new(),
            exported_env: Vec::new(),
            source_path: PathBuf::new(),
            mutates_source_path: false,
            should_be_persisted: false,
            dependencies: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn add_deps<I>(&mut self, iter: I) -> &mut Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.dependencies.extend(iter.into_iter().map(Into::into));
        self
    }

    pub fn add_commands<I>(&mut self, iter: I) -> &mut Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.command.extend(iter.into_iter().map(Into::into));
        self
    }

    pub fn add_exports<I>(&mut self, iter: I) -> &mut Self
    where
        I: IntoIterator<Item = ExportedVar>,
    {
        self.exported_env.extend(iter);
        self
    }

    /// Derive the canonical content id for a set of build inputs. Equal
    /// inputs give equal ids, which is what the store's uniqueness
    /// guarantee rests on.
    pub fn content_id(
        name: &str,
        version: &str,
        command: &[String],
        exported_env: &[ExportedVar],
        dependencies: &[String],
    ) -> String {
        let mut hasher = Blake2s::new();
        hasher.input(name.as_bytes());
        hasher.input(b"\0");
        hasher.input(version.as_bytes());
        hasher.input(b"\0");
        for cmd in command {
            hasher.input(cmd.as_bytes());
            hasher.input(b"\0");
        }
        for export in exported_env {
            hasher.input(export.name.as_bytes());
            hasher.input(b"=");
            match &export.value {
                Some(value) => hasher.input(value.as_bytes()),
                None => hasher.input(b"\0unset"),
            }
            let scope = match export.scope {
                Scope::Local => b"l",
                Scope::Global => b"g",
            };
            hasher.input(scope);
            hasher.input(&[export.exclusive as u8, export.builtin as u8]);
            hasher.input(b"\0");
        }
        for dep in dependencies {
            hasher.input(dep.as_bytes());
            hasher.input(b"\0");
        }
        let digest = hasher.result();
        BASE32_NOPAD.encode(digest.as_slice())
    }
}

/// The root build together with the global environment applied to every
/// build in the tree. Builds are held in an id-keyed map; graph edges are
/// the per-build dependency id lists.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BuildSandbox {
    #[cfg_attr(feature = "serde", serde(default))]
    pub env: Vec<EnvVar>,
    pub root: String,
    pub builds: HashMap<String, Build>,
}

impl BuildSandbox {
    pub fn new(root: Build) -> Self {
        let root_id = root.id.clone();
        let mut builds = HashMap::new();
        builds.insert(root_id.clone(), root);
        BuildSandbox {
            env: Vec::new(),
            root: root_id,
            builds,
        }
    }

    pub fn add_build(&mut self, build: Build) -> &mut Self {
        self.builds.insert(build.id.clone(), build);
        self
    }

    pub fn add_env<I>(&mut self, iter: I) -> &mut Self
    where
        I: IntoIterator<Item = EnvVar>,
    {
        self.env.extend(iter);
        self
    }

    pub fn get(&self, id: &str) -> Option<&Build> {
        self.builds.get(id)
    }

    pub fn root(&self) -> Option<&Build> {
        self.builds.get(&self.root)
    }

    /// Overwrite every build's `id` with the key it is stored under.
    /// Manifests do not repeat the id inside each build entry, and the
    /// store's uniqueness guarantee needs the two to never diverge, so
    /// the map key wins unconditionally. Front-ends call this right
    /// after deserializing.
    pub fn reconcile_ids(&mut self) -> &mut Self {
        for (id, build) in self.builds.iter_mut() {
            build.id = id.clone();
        }
        self
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{}", describe_invalid(.builds))]
pub struct ManifestError {
    /// Offending build names with their parse-time diagnostics.
    pub builds: Vec<(String, Vec<String>)>,
}

fn describe_invalid(builds: &[(String, Vec<String>)]) -> String {
    let mut out = String::from("One or more builds have manifest errors:");
    for (name, errors) in builds {
        out.push_str(&format!(" {}: {};", name, errors.join(", ")));
    }
    out
}

/// Aggregate the parse-time diagnostics of every reachable build, if any.
pub fn manifest_errors<'a, I>(builds: I) -> Option<ManifestError>
where
    I: IntoIterator<Item = &'a Build>,
{
    let invalid: Vec<_> = builds
        .into_iter()
        .filter(|b| !b.errors.is_empty())
        .map(|b| (b.name.clone(), b.errors.clone()))
        .collect();
    if invalid.is_empty() {
        None
    } else {
        Some(ManifestError { builds: invalid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_id_is_stable() {
        let deps = vec!["dep-id".to_string()];
        let cmds = vec!["make".to_string()];
        let a = Build::content_id("pkg", "1.0.0", &cmds, &[], &deps);
        let b = Build::content_id("pkg", "1.0.0", &cmds, &[], &deps);
        assert_eq!(a, b);
    }

    #[test]
    fn test_content_id_tracks_inputs() {
        let base = Build::content_id("pkg", "1.0.0", &[], &[], &[]);
        let other_version = Build::content_id("pkg", "1.0.1", &[], &[], &[]);
        let other_cmd =
            Build::content_id("pkg", "1.0.0", &["make".to_string()], &[], &[]);
        let exported = vec![ExportedVar::global("X", "1")];
        let other_env = Build::content_id("pkg", "1.0.0", &[], &exported, &[]);
        assert_ne!(base, other_version);
        assert_ne!(base, other_cmd);
        assert_ne!(base, other_env);
    }

    #[test]
    fn test_content_id_is_store_safe() {
        let id = Build::content_id("pkg", "1.0.0", &[], &[], &[]);
        assert!(!id.is_empty());
        assert!(id
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_manifest_builds_are_keyed_by_id() {
        let manifest = r#"{
            "env": [{"name": "SHELL", "value": "/bin/bash"}],
            "root": "RID",
            "builds": {
                "RID": {
                    "name": "root",
                    "version": "1.0.0",
                    "shouldBePersisted": true,
                    "dependencies": ["LID"]
                },
                "LID": {
                    "name": "leaf",
                    "version": "0.1.0",
                    "sourcePath": "node_modules/leaf"
                }
            }
        }"#;
        let mut sandbox: BuildSandbox = serde_json::from_str(manifest).unwrap();
        sandbox.reconcile_ids();
        assert_eq!(sandbox.root().unwrap().id, "RID");
        assert!(sandbox.root().unwrap().should_be_persisted);
        let leaf = sandbox.get("LID").unwrap();
        assert_eq!(leaf.id, "LID");
        assert_eq!(leaf.name, "leaf");
        assert_eq!(leaf.source_path, PathBuf::from("node_modules/leaf"));
    }

    #[test]
    fn test_reconcile_ids_makes_the_map_key_win() {
        let mut sandbox = BuildSandbox::new(Build::new("stale", "root", "1.0.0"));
        sandbox.builds.insert("fresh".to_string(), Build::new("stale", "root", "1.0.0"));
        sandbox.reconcile_ids();
        assert_eq!(sandbox.get("fresh").unwrap().id, "fresh");
    }

    #[test]
    fn test_manifest_errors_aggregates() {
        let ok = Build::new("a", "ok", "1");
        let mut bad = Build::new("b", "bad", "1");
        bad.errors.push("missing field".to_string());
        assert!(manifest_errors(vec![&ok]).is_none());
        let err = manifest_errors(vec![&ok, &bad]).unwrap();
        assert_eq!(err.builds.len(), 1);
        assert_eq!(err.builds[0].0, "bad");
    }
}
