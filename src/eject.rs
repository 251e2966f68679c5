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

//! The ejecting back-end: re-express the build protocol as a portable
//! script bundle. `make build` on the emitted tree reproduces what the
//! in-process builder does, against a store selected at Make-time via
//! `ESY_EJECT__STORE`/`ESY_EJECT__SANDBOX`.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use log::{debug, info};

use crate::build::{self, Build, BuildSandbox, ManifestError};
use crate::config::BuildConfig;
use crate::env::{compose, findlib_conf, EnvError};
use crate::graph::{self, GraphError};
use crate::makefile::{self, DefineSegment, MakeDefine, MakeItem, MakeRule};
use crate::store::{self, StoreError};

const RUNTIME_SH: &str = include_str!("../runtime/runtime.sh");
const RENDER_ENV: &str = include_str!("../runtime/render-env");
const REPLACE_STRING: &str = include_str!("../runtime/replace-string");
const REALPATH_C: &str = include_str!("../runtime/realpath.c");

#[derive(Debug, thiserror::Error)]
pub enum EjectError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Emit the script bundle for `sandbox` into `output_path`: a Makefile
/// driving per-build targets, per-build env/findlib/sandbox-profile files
/// under each build's source path, and the bundled `bin/` helpers.
pub fn eject(sandbox: &BuildSandbox, output_path: &Path) -> Result<(), EjectError> {
    let config = BuildConfig::for_eject();
    let builds = graph::bfs(sandbox)?;
    if let Some(err) = build::manifest_errors(builds.iter().copied()) {
        return Err(err.into());
    }
    info!(
        "ejecting {} build(s) into {}",
        builds.len(),
        output_path.display()
    );

    for build in &builds {
        let build_dir = output_path.join(&build.source_path);
        store::ensure_dir(&build_dir)?;
        debug!("writing eject files for {}", build.name);
        let env = compose(&config, sandbox, build)?;
        store::write_file(&build_dir.join("eject-env"), &env.render())?;
        store::write_file(
            &build_dir.join("findlib.conf.in"),
            &findlib_conf(&config, sandbox, build)?,
        )?;
        store::write_file(
            &build_dir.join("sandbox.sb.in"),
            &sandbox_profile(&config, build),
        )?;
    }

    let bin_dir = output_path.join("bin");
    store::ensure_dir(&bin_dir)?;
    write_helper(&bin_dir.join("runtime.sh"), RUNTIME_SH, true)?;
    write_helper(&bin_dir.join("render-env"), RENDER_ENV, true)?;
    write_helper(&bin_dir.join("replace-string"), REPLACE_STRING, true)?;
    write_helper(&bin_dir.join("realpath.c"), REALPATH_C, false)?;

    let items = makefile_items(&config, sandbox, &builds)?;
    store::write_file(&output_path.join("Makefile"), &makefile::render(&items))?;
    Ok(())
}

/// Turn a package name into a Make identifier: lower-case, strip `@`,
/// double every run of `_`, then map `/` to `__slash__`, `.` to
/// `__dot__` and `-` to `_`.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '@' => {}
            '_' => out.push_str("__"),
            '/' => out.push_str("__slash__"),
            '.' => out.push_str("__dot__"),
            '-' => out.push('_'),
            c => out.extend(c.to_lowercase()),
        }
    }
    out
}

fn write_helper(path: &Path, contents: &str, executable: bool) -> Result<(), StoreError> {
    store::write_file(path, contents)?;
    if executable {
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))
            .map_err(|e| StoreError::Write(path.to_path_buf(), e))?;
    }
    Ok(())
}

fn makefile_items(
    config: &BuildConfig,
    sandbox: &BuildSandbox,
    builds: &[&Build],
) -> Result<Vec<MakeItem>, EjectError> {
    // BFS starts at the root.
    let root = builds[0];
    let mut items = vec![
        MakeItem::Raw("SHELL := env -i /bin/bash --norc --noprofile".to_string()),
        MakeItem::Raw(String::new()),
        MakeItem::Raw(
            "ESY_EJECT__ROOT := $(patsubst %/,%,$(dir $(realpath $(firstword $(MAKEFILE_LIST)))))"
                .to_string(),
        ),
        MakeItem::Raw("ESY_EJECT__STORE ?= $(HOME)/.esy".to_string()),
        MakeItem::Raw("ESY_EJECT__SANDBOX ?= $(CURDIR)".to_string()),
    ];

    items.push(phony_rule("build", vec![format!("{}.build", root.name)], None));
    items.push(phony_rule(
        "build-shell",
        vec![format!("{}.shell", root.name)],
        None,
    ));
    items.push(phony_rule("clean", vec![format!("{}.clean", root.name)], None));
    items.push(phony_rule(
        "esy-store",
        vec![],
        Some(
            "@mkdir -p \
             $(ESY_EJECT__STORE)/_build \
             $(ESY_EJECT__STORE)/_insttmp \
             $(ESY_EJECT__STORE)/_install \
             $(ESY_EJECT__SANDBOX)/_esy/store/_build \
             $(ESY_EJECT__SANDBOX)/_esy/store/_insttmp \
             $(ESY_EJECT__SANDBOX)/_esy/store/_install"
                .to_string(),
        ),
    ));
    items.push(phony_rule(
        "esy-root",
        vec![],
        Some(
            "@test -x \"$(ESY_EJECT__ROOT)/bin/realpath\" || \
             cc -o \"$(ESY_EJECT__ROOT)/bin/realpath\" \"$(ESY_EJECT__ROOT)/bin/realpath.c\""
                .to_string(),
        ),
    ));

    for build in builds {
        let norm = normalize_name(&build.name);
        items.push(MakeItem::Define(shell_env_define(config, build, &norm)));

        let mut dep_names = Vec::new();
        for dep_id in &build.dependencies {
            let dep = sandbox
                .get(dep_id)
                .ok_or_else(|| GraphError::UnresolvedDependency(dep_id.clone()))?;
            dep_names.push(dep.name.clone());
        }

        let mut build_deps = vec!["esy-store".to_string(), "esy-root".to_string()];
        build_deps.extend(dep_names.iter().map(|n| format!("{}.build", n)));
        items.push(phony_rule(
            &format!("{}.build", build.name),
            build_deps.clone(),
            Some(runtime_command(&norm, "esy-build")),
        ));
        items.push(phony_rule(
            &format!("{}.shell", build.name),
            build_deps,
            Some(runtime_command(&norm, "esy-shell")),
        ));
        let clean_deps = dep_names
            .iter()
            .map(|n| format!("{}.clean", n))
            .collect();
        items.push(phony_rule(
            &format!("{}.clean", build.name),
            clean_deps,
            Some(runtime_command(&norm, "esy-clean")),
        ));
    }

    Ok(items)
}

fn phony_rule(target: &str, dependencies: Vec<String>, command: Option<String>) -> MakeItem {
    MakeItem::Rule(MakeRule {
        target: target.to_string(),
        dependencies,
        command,
        phony: true,
    })
}

/// The define expands inside a single recipe line, its body lines joined
/// by `; \` continuations, so the exports and the runtime invocation that
/// follows them run in one shell.
fn runtime_command(norm: &str, runtime_cmd: &str) -> String {
    format!(
        "@$(shell_env_for__{}) source \"$(ESY_EJECT__ROOT)/bin/runtime.sh\" {}",
        norm, runtime_cmd
    )
}

fn shell_env_define(config: &BuildConfig, build: &Build, norm: &str) -> MakeDefine {
    let eject_dir = format!("$(ESY_EJECT__ROOT)/{}", build.source_path.display());
    let build_type = if build.mutates_source_path {
        "in-source"
    } else {
        "out-of-source"
    };
    let persisted = if build.should_be_persisted {
        "true"
    } else {
        "false"
    };
    let command = if build.command.is_empty() {
        "true".to_string()
    } else {
        build.command.join(" && ")
    };
    MakeDefine {
        name: format!("shell_env_for__{}", norm),
        body: vec![
            DefineSegment::Exports(vec![
                (
                    "ESY_EJECT__STORE".to_string(),
                    Some("$(ESY_EJECT__STORE)".to_string()),
                ),
                (
                    "ESY_EJECT__SANDBOX".to_string(),
                    Some("$(ESY_EJECT__SANDBOX)".to_string()),
                ),
                (
                    "ESY_EJECT__ROOT".to_string(),
                    Some("$(ESY_EJECT__ROOT)".to_string()),
                ),
                ("CI".to_string(), Some("$(CI)".to_string())),
                ("TMPDIR".to_string(), Some("$(TMPDIR)".to_string())),
                ("TMPDIR_GLOBAL".to_string(), Some("$(TMPDIR)".to_string())),
            ]),
            DefineSegment::Line(format!("source \"{}/eject-env\"", eject_dir)),
            DefineSegment::Exports(vec![
                ("esy_build__eject".to_string(), Some(eject_dir)),
                ("esy_build__type".to_string(), Some(build_type.to_string())),
                (
                    "esy_build__persisted".to_string(),
                    Some(persisted.to_string()),
                ),
                ("esy_build__key".to_string(), Some(build.id.clone())),
                ("esy_build__command".to_string(), Some(command)),
                (
                    "esy_build__source_root".to_string(),
                    Some(make_escape(&config.source_path(build).display().to_string())),
                ),
                (
                    "esy_build__install".to_string(),
                    Some(make_escape(
                        &config.final_install_path(build).display().to_string(),
                    )),
                ),
            ]),
        ],
    }
}

/// Placeholder paths are shell-form (`$ESY_EJECT__STORE/…`); inside a
/// Make define they have to be Make references or Make would eat the
/// dollar.
fn make_escape(value: &str) -> String {
    value
        .replace("$ESY_EJECT__STORE", "$(ESY_EJECT__STORE)")
        .replace("$ESY_EJECT__SANDBOX", "$(ESY_EJECT__SANDBOX)")
        .replace("$ESY_EJECT__ROOT", "$(ESY_EJECT__ROOT)")
}

/// A sandbox-exec profile denying every file write except the build's own
/// trees, the temp dirs and /dev/null. Writes under the root's
/// node_modules are re-denied so an in-source build cannot scribble over
/// its vendored dependencies.
fn sandbox_profile(config: &BuildConfig, build: &Build) -> String {
    let root = config.root_path(build).display().to_string();
    format!(
        "(version 1)\n\
         (allow default)\n\
         \n\
         (deny file-write*\n\
         \x20 (subpath \"/\"))\n\
         \n\
         (allow file-write*\n\
         \x20 (literal \"/dev/null\")\n\
         \x20 (subpath \"$TMPDIR\")\n\
         \x20 (subpath \"$TMPDIR_GLOBAL\")\n\
         \x20 (subpath \"{root}\")\n\
         \x20 (subpath \"{build}\")\n\
         \x20 (subpath \"{install}\"))\n\
         \n\
         (deny file-write*\n\
         \x20 (subpath \"{root}/node_modules\"))\n",
        root = root,
        build = config.build_path(build).display(),
        install = config.install_path(build).display(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("@opam/foo.bar-baz"), "opam__slash__foo__dot__bar_baz");
        assert_eq!(normalize_name("snake_case"), "snake__case");
        assert_eq!(normalize_name("Mixed-Case"), "mixed_case");
    }

    #[test]
    fn test_normalize_name_is_injective_on_tricky_pairs() {
        let pairs = [
            ("a_b", "a-b"),
            ("a__slash__b", "a/b"),
            ("a.b", "a__dot__b"),
            ("x__b", "x_b"),
        ];
        for (left, right) in &pairs {
            assert_ne!(normalize_name(left), normalize_name(right));
        }
    }

    #[test]
    fn test_make_escape_rewrites_placeholders() {
        assert_eq!(
            make_escape("$ESY_EJECT__STORE/_install/ID"),
            "$(ESY_EJECT__STORE)/_install/ID"
        );
    }

    #[test]
    fn test_sandbox_profile_denies_node_modules() {
        let config = BuildConfig::for_eject();
        let mut build = Build::new("ID", "pkg", "1.0.0");
        build.source_path = std::path::PathBuf::from("node_modules/pkg");
        build.should_be_persisted = true;
        let profile = sandbox_profile(&config, &build);
        assert!(profile.contains("(deny file-write*\n  (subpath \"/\"))"));
        assert!(profile
            .contains("(subpath \"$ESY_EJECT__SANDBOX/node_modules/pkg/node_modules\")"));
        assert!(profile.contains("(subpath \"$ESY_EJECT__STORE/_insttmp/ID\")"));
    }
}
