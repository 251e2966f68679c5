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

//! This is a library for orchestrating package builds inside a sandbox.
//! Given a root [Build] and its transitive dependency graph it produces
//! installed artifacts in a content-addressed store, each build running
//! in a deterministic environment derived from its dependencies. Two
//! back-ends share the same model: [Builder] executes builds in-process,
//! while [eject] emits a self-contained Make-based script bundle that
//! replays the same protocol on another machine.

mod build;
mod builder;
mod config;
mod eject;
mod env;
mod graph;
pub mod makefile;
mod rewrite;
mod store;

pub use build::{
    manifest_errors, Build, BuildSandbox, EnvVar, ExportedVar, ManifestError, Scope,
};
pub use builder::{BuildError, Builder, SandboxError};
pub use config::BuildConfig;
pub use eject::{eject, normalize_name, EjectError};
pub use env::{compose, findlib_conf, EnvError, EnvGroup, Environment};
pub use graph::{bfs, collect_transitive_dependencies, post_order_dfs, GraphError};
pub use rewrite::RewriteError;
pub use store::StoreError;
