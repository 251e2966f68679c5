use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use esyb::{eject, Build, BuildSandbox, ExportedVar};

// root -> {left, right} -> leaf, laid out the way a node_modules sandbox is.
fn diamond() -> BuildSandbox {
    let mut root = Build::new("RID", "root", "1.0.0");
    root.should_be_persisted = true;
    root.source_path = ".".into();
    root.add_deps(vec!["AID", "BID"]);
    root.add_commands(vec!["make install"]);

    let mut left = Build::new("AID", "left", "1.0.0");
    left.should_be_persisted = true;
    left.source_path = "node_modules/left".into();
    left.add_deps(vec!["LID"]);

    let mut right = Build::new("BID", "right", "1.0.0");
    right.should_be_persisted = true;
    right.source_path = "node_modules/right".into();
    right.add_deps(vec!["LID"]);
    right.mutates_source_path = true;

    let mut leaf = Build::new("LID", "@scope/leaf.core", "1.0.0");
    leaf.should_be_persisted = true;
    leaf.source_path = "node_modules/@scope/leaf.core".into();
    leaf.add_exports(vec![ExportedVar::global("LEAF_TOKEN", "leafy")]);

    let mut sandbox = BuildSandbox::new(root);
    sandbox.add_build(left).add_build(right).add_build(leaf);
    sandbox
}

fn eject_to(dir: &Path) {
    let sandbox = diamond();
    eject(&sandbox, dir).unwrap();
}

#[test]
fn eject_emits_the_full_script_bundle() {
    let out = tempfile::tempdir().unwrap();
    eject_to(out.path());

    assert!(out.path().join("Makefile").is_file());
    for helper in &["runtime.sh", "render-env", "replace-string", "realpath.c"] {
        assert!(out.path().join("bin").join(helper).is_file());
    }
    for build_dir in &[
        ".",
        "node_modules/left",
        "node_modules/right",
        "node_modules/@scope/leaf.core",
    ] {
        for file in &["eject-env", "findlib.conf.in", "sandbox.sb.in"] {
            let path = out.path().join(build_dir).join(file);
            assert!(path.is_file(), "{} missing", path.display());
        }
    }
}

#[test]
fn emitted_scripts_are_executable() {
    let out = tempfile::tempdir().unwrap();
    eject_to(out.path());
    for helper in &["runtime.sh", "render-env", "replace-string"] {
        let mode = fs::metadata(out.path().join("bin").join(helper))
            .unwrap()
            .permissions()
            .mode();
        assert_ne!(mode & 0o111, 0, "{} not executable", helper);
    }
}

#[test]
fn makefile_wires_targets_through_the_dependency_graph() {
    let out = tempfile::tempdir().unwrap();
    eject_to(out.path());
    let makefile = fs::read_to_string(out.path().join("Makefile")).unwrap();

    assert!(makefile.contains("SHELL := env -i /bin/bash --norc --noprofile"));
    assert!(makefile.contains("ESY_EJECT__STORE ?= $(HOME)/.esy"));
    assert!(makefile.contains("ESY_EJECT__SANDBOX ?= $(CURDIR)"));
    assert!(makefile.contains("\nbuild: root.build\n"));
    assert!(makefile.contains("\nbuild-shell: root.shell\n"));
    assert!(makefile.contains("\nclean: root.clean\n"));
    assert!(makefile.contains("\nroot.build: esy-store esy-root left.build right.build\n"));
    assert!(makefile.contains("\nleft.build: esy-store esy-root @scope/leaf.core.build\n"));
    assert!(makefile
        .contains("@$(shell_env_for__root) source \"$(ESY_EJECT__ROOT)/bin/runtime.sh\" esy-build"));
    assert!(makefile.contains("define shell_env_for__scope__slash__leaf__dot__core\n"));
    // Host-conditional globals are forwarded as Make references, never
    // baked in at eject time.
    assert!(makefile.contains("export CI=\"$(CI)\"; \\"));
    assert!(makefile.contains("export TMPDIR=\"$(TMPDIR)\"; \\"));
    assert!(makefile.contains("export esy_build__key=\"RID\"; \\"));
    assert!(makefile.contains("export esy_build__command=\"make install\"; \\"));
    assert!(makefile.contains("export esy_build__type=\"in-source\"; \\"));
    assert!(makefile.contains("export esy_build__persisted=\"true\"; \\"));
    let phony = makefile
        .lines()
        .find(|line| line.starts_with(".PHONY:"))
        .unwrap();
    for target in &["build", "build-shell", "clean", "esy-store", "esy-root", "root.build"] {
        assert!(phony.contains(target), ".PHONY missing {}", target);
    }
}

#[test]
fn eject_env_uses_placeholder_paths() {
    let out = tempfile::tempdir().unwrap();
    eject_to(out.path());

    let left_env =
        fs::read_to_string(out.path().join("node_modules/left").join("eject-env")).unwrap();
    // The leaf's global export, substituted against its placeholder-form
    // final install.
    assert!(left_env.contains("export LEAF_TOKEN=\"leafy\";"));
    assert!(left_env.contains("export cur__install=\"$ESY_EJECT__STORE/_insttmp/AID\";"));
    assert!(left_env.contains("export ESY_EJECT__STORE=\"$ESY_EJECT__STORE\";"));
    // Host values must never be baked into the portable bundle.
    assert!(!left_env.contains("/tmp"));

    let findlib = fs::read_to_string(
        out.path()
            .join("node_modules/left")
            .join("findlib.conf.in"),
    )
    .unwrap();
    assert!(findlib.contains(
        "path = \"$ESY_EJECT__STORE/_install/LID/lib:$ESY_EJECT__STORE/_insttmp/AID/lib\""
    ));
}

#[test]
fn sandbox_profile_confines_writes_to_the_builds_trees() {
    let out = tempfile::tempdir().unwrap();
    eject_to(out.path());
    let profile = fs::read_to_string(
        out.path()
            .join("node_modules/right")
            .join("sandbox.sb.in"),
    )
    .unwrap();
    // right is an in-source build, so its writable root is the build tree.
    assert!(profile.contains("(subpath \"$ESY_EJECT__STORE/_build/BID\")"));
    assert!(profile.contains("(subpath \"$ESY_EJECT__STORE/_insttmp/BID\")"));
    assert!(profile.contains("(subpath \"$TMPDIR\")"));
    assert!(profile.contains("(deny file-write*\n  (subpath \"$ESY_EJECT__STORE/_build/BID/node_modules\"))"));
}

#[test]
fn eject_is_byte_stable() {
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    eject_to(first.path());
    eject_to(second.path());
    for file in &[
        "Makefile",
        "node_modules/left/eject-env",
        "node_modules/left/findlib.conf.in",
        "node_modules/right/sandbox.sb.in",
    ] {
        let a = fs::read(first.path().join(file)).unwrap();
        let b = fs::read(second.path().join(file)).unwrap();
        assert_eq!(a, b, "{} differs between ejections", file);
    }
}
