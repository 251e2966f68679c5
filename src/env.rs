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

use crate::build::{Build, BuildSandbox, EnvVar, ExportedVar, Scope};
use crate::config::{
    BuildConfig, EJECT_ROOT_PLACEHOLDER, EJECT_SANDBOX_PLACEHOLDER, EJECT_STORE_PLACEHOLDER,
};
use crate::graph::{self, GraphError};

/// Variable names owned by the builder; user packages may not export
/// them unless the export is marked builtin.
const BUILTIN_GLOBALS: [&str; 5] = [
    "CI",
    "TMPDIR",
    "ESY_EJECT__STORE",
    "ESY_EJECT__SANDBOX",
    "ESY_EJECT__ROOT",
];

#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("Variable {name} is exported exclusively by both {first} and {second}")]
    ExportConflict {
        name: String,
        first: String,
        second: String,
    },
    #[error("Variable {name} is owned by the builder and cannot be exported by {origin}")]
    BuiltinOverride { name: String, origin: String },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// One ordered group of variables, tagged with the build (or built-in
/// source) that contributed it.
#[derive(Debug, Clone)]
pub struct EnvGroup {
    pub origin: String,
    pub vars: Vec<EnvVar>,
}

/// The composed environment of a build: ordered groups whose provenance
/// backs the exclusive/scope rules and the PATH-like ordering guarantees.
#[derive(Debug, Clone)]
pub struct Environment {
    groups: Vec<EnvGroup>,
}

impl Environment {
    pub fn groups(&self) -> &[EnvGroup] {
        &self.groups
    }

    pub fn vars(&self) -> impl Iterator<Item = &EnvVar> {
        self.groups.iter().flat_map(|g| g.vars.iter())
    }

    /// POSIX-shell-source-able rendering: one `export NAME="VALUE";` per
    /// non-null variable, in composition order. Values are wrapped in
    /// double quotes without further escaping so that `$`-references
    /// expand when the file is sourced.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for var in self.vars() {
            if let Some(value) = &var.value {
                out.push_str("export ");
                out.push_str(&var.name);
                out.push_str("=\"");
                out.push_str(value);
                out.push_str("\";\n");
            }
        }
        out
    }
}

struct SeenExport {
    origin: String,
    exclusive: bool,
    scope: Scope,
}

/// Compose the environment of `build`: built-in globals, the sandbox
/// global env, the global exports of every transitive dependency in DFS
/// post-order, and finally the build's own local exports together with
/// its `cur__*` built-ins.
pub fn compose(
    config: &BuildConfig,
    sandbox: &BuildSandbox,
    build: &Build,
) -> Result<Environment, EnvError> {
    let mut groups = Vec::new();
    groups.push(builtin_globals(config));
    groups.push(EnvGroup {
        origin: "sandbox".to_string(),
        vars: sandbox.env.clone(),
    });

    let mut seen: HashMap<String, SeenExport> = HashMap::new();
    let order = graph::post_order_dfs_from(sandbox, build)?;
    // The build itself is the last entry of its own post-order.
    let deps = &order[..order.len().saturating_sub(1)];
    for dep in deps {
        let subst = cur_vars(config, sandbox, dep, false);
        let mut vars = Vec::new();
        for export in dep.exported_env.iter().filter(|e| e.scope == Scope::Global) {
            check_export(&mut seen, export, &dep.name)?;
            vars.push(EnvVar {
                name: export.name.clone(),
                value: export.value.as_ref().map(|v| substitute(v, &subst)),
            });
        }
        groups.push(EnvGroup {
            origin: dep.name.clone(),
            vars,
        });
    }

    let mut vars: Vec<EnvVar> = cur_vars(config, sandbox, build, true)
        .into_iter()
        .map(|(name, value)| EnvVar {
            name,
            value: Some(value),
        })
        .collect();
    for export in build.exported_env.iter().filter(|e| e.scope == Scope::Local) {
        check_export(&mut seen, export, &build.name)?;
        vars.push(EnvVar {
            name: export.name.clone(),
            value: export.value.clone(),
        });
    }
    groups.push(EnvGroup {
        origin: build.name.clone(),
        vars,
    });

    Ok(Environment { groups })
}

/// Render the findlib configuration for `build`: the `lib` directories of
/// its transitive dependencies in DFS post-order, with the build's own
/// staged `lib` appended last so that self-queries during the build
/// succeed.
pub fn findlib_conf(
    config: &BuildConfig,
    sandbox: &BuildSandbox,
    build: &Build,
) -> Result<String, GraphError> {
    let order = graph::post_order_dfs_from(sandbox, build)?;
    let deps = &order[..order.len().saturating_sub(1)];
    let self_lib = config.install_path(build).join("lib").display().to_string();
    let mut entries: Vec<String> = deps
        .iter()
        .map(|d| config.final_install_path(d).join("lib").display().to_string())
        .collect();
    entries.push(self_lib.clone());

    let mut out = String::new();
    out.push_str(&format!("path = \"{}\"\n", entries.join(":")));
    out.push_str(&format!("destdir = \"{}\"\n", self_lib));
    out.push_str("ldconf = \"ignore\"\n");
    for tool in &["ocamlc", "ocamldep", "ocamldoc", "ocamllex", "ocamlopt"] {
        out.push_str(&format!("{} = \"{}.opt\"\n", tool, tool));
    }
    Ok(out)
}

fn is_builtin_name(name: &str) -> bool {
    name.starts_with("cur__") || BUILTIN_GLOBALS.contains(&name)
}

fn check_export(
    seen: &mut HashMap<String, SeenExport>,
    export: &ExportedVar,
    origin: &str,
) -> Result<(), EnvError> {
    if !export.builtin && is_builtin_name(&export.name) {
        return Err(EnvError::BuiltinOverride {
            name: export.name.clone(),
            origin: origin.to_string(),
        });
    }
    if let Some(prev) = seen.get(&export.name) {
        if prev.scope == export.scope && (prev.exclusive || export.exclusive) {
            return Err(EnvError::ExportConflict {
                name: export.name.clone(),
                first: prev.origin.clone(),
                second: origin.to_string(),
            });
        }
    } else {
        seen.insert(
            export.name.clone(),
            SeenExport {
                origin: origin.to_string(),
                exclusive: export.exclusive,
                scope: export.scope,
            },
        );
    }
    Ok(())
}

fn builtin_globals(config: &BuildConfig) -> EnvGroup {
    let vars = if config.is_placeholder() {
        // CI is forwarded by the ejected Makefile on the target host, so
        // the rendering stays byte-stable across ejecting hosts.
        vec![
            var("CI", None),
            var("TMPDIR", Some("$TMPDIR".to_string())),
            var("ESY_EJECT__STORE", Some(EJECT_STORE_PLACEHOLDER.to_string())),
            var("ESY_EJECT__SANDBOX", Some(EJECT_SANDBOX_PLACEHOLDER.to_string())),
            var("ESY_EJECT__ROOT", Some(EJECT_ROOT_PLACEHOLDER.to_string())),
        ]
    } else {
        let display = |p: &PathBuf| p.display().to_string();
        vec![
            var("CI", std::env::var("CI").ok()),
            var("TMPDIR", std::env::var("TMPDIR").ok()),
            var("ESY_EJECT__STORE", Some(display(&config.store_path))),
            var("ESY_EJECT__SANDBOX", Some(display(&config.sandbox_path))),
            var("ESY_EJECT__ROOT", Some(display(&config.sandbox_path))),
        ]
    };
    EnvGroup {
        origin: "builtin".to_string(),
        vars,
    }
}

fn var(name: &str, value: Option<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value,
    }
}

/// The `cur__*` family for one build. For the build's own group `install`
/// is the staging tree the commands write into; when substituting inside
/// a dependency's exports it is the dependency's finalized install.
fn cur_vars(
    config: &BuildConfig,
    sandbox: &BuildSandbox,
    build: &Build,
    for_self: bool,
) -> Vec<(String, String)> {
    let install = if for_self {
        config.install_path(build)
    } else {
        config.final_install_path(build)
    };
    let p = |path: PathBuf| path.display().to_string();
    let sub = |dir: &str| p(install.join(dir));
    let dep_names: Vec<&str> = build
        .dependencies
        .iter()
        .map(|id| sandbox.get(id).map(|d| d.name.as_str()).unwrap_or(id.as_str()))
        .collect();
    vec![
        ("cur__name".to_string(), build.name.clone()),
        ("cur__version".to_string(), build.version.clone()),
        ("cur__depends".to_string(), dep_names.join(" ")),
        ("cur__root".to_string(), p(config.root_path(build))),
        (
            "cur__original_root".to_string(),
            p(config.source_path(build)),
        ),
        ("cur__target_dir".to_string(), p(config.build_path(build))),
        ("cur__install".to_string(), p(install.clone())),
        ("cur__bin".to_string(), sub("bin")),
        ("cur__sbin".to_string(), sub("sbin")),
        ("cur__lib".to_string(), sub("lib")),
        ("cur__man".to_string(), sub("man")),
        ("cur__doc".to_string(), sub("doc")),
        ("cur__stublibs".to_string(), sub("stublibs")),
        (
            "cur__toplevel".to_string(),
            p(install.join("lib").join("toplevel")),
        ),
        ("cur__share".to_string(), sub("share")),
        ("cur__etc".to_string(), sub("etc")),
    ]
}

/// Replace `$cur__*` references in an exported value with the exporting
/// build's own paths. Longest names first so that a shorter name never
/// clips a longer one.
fn substitute(value: &str, vars: &[(String, String)]) -> String {
    let mut by_len: Vec<&(String, String)> = vars.iter().collect();
    by_len.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    let mut out = value.to_string();
    for (name, replacement) in by_len {
        if out.contains('$') {
            out = out.replace(&format!("${}", name), replacement);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_names() {
        assert!(is_builtin_name("TMPDIR"));
        assert!(is_builtin_name("cur__install"));
        assert!(!is_builtin_name("OCAMLPATH"));
    }

    #[test]
    fn test_substitute_prefers_longer_names() {
        let vars = vec![
            ("cur__root".to_string(), "/r".to_string()),
            ("cur__original_root".to_string(), "/o".to_string()),
        ];
        assert_eq!(substitute("$cur__original_root:$cur__root", &vars), "/o:/r");
    }

    #[test]
    fn test_render_omits_null_values() {
        let env = Environment {
            groups: vec![EnvGroup {
                origin: "builtin".to_string(),
                vars: vec![var("CI", None), var("TMPDIR", Some("/tmp".to_string()))],
            }],
        };
        assert_eq!(env.render(), "export TMPDIR=\"/tmp\";\n");
    }

    #[test]
    fn test_exclusive_clash_names_both_contributors() {
        let mut seen = HashMap::new();
        let first = ExportedVar::global("TOOLCHAIN", "a");
        let mut second = ExportedVar::global("TOOLCHAIN", "b");
        second.exclusive = true;
        check_export(&mut seen, &first, "alpha").unwrap();
        match check_export(&mut seen, &second, "beta") {
            Err(EnvError::ExportConflict { name, first, second }) => {
                assert_eq!(name, "TOOLCHAIN");
                assert_eq!(first, "alpha");
                assert_eq!(second, "beta");
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_same_name_in_different_scopes_is_allowed() {
        let mut seen = HashMap::new();
        let mut global = ExportedVar::global("FLAGS", "a");
        global.exclusive = true;
        let local = ExportedVar::local("FLAGS", "b");
        check_export(&mut seen, &global, "alpha").unwrap();
        check_export(&mut seen, &local, "beta").unwrap();
    }

    #[test]
    fn test_builtin_override_is_rejected() {
        let mut seen = HashMap::new();
        let export = ExportedVar::global("TMPDIR", "/elsewhere");
        match check_export(&mut seen, &export, "alpha") {
            Err(EnvError::BuiltinOverride { name, origin }) => {
                assert_eq!(name, "TMPDIR");
                assert_eq!(origin, "alpha");
            }
            other => panic!("expected builtin override, got {:?}", other),
        }
    }
}
