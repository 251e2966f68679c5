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

use std::collections::{HashSet, VecDeque};

use crate::build::{Build, BuildSandbox};

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Dependency cycle through build {0}")]
    Cycle(String),
    #[error("Unresolved reference to build {0}")]
    UnresolvedDependency(String),
}

/// Breadth-first visitation from the sandbox root, each id at most once.
/// Used where ordering is not load-bearing, e.g. per-build file emission.
pub fn bfs<'a>(sandbox: &'a BuildSandbox) -> Result<Vec<&'a Build>, GraphError> {
    let root = sandbox
        .root()
        .ok_or_else(|| GraphError::UnresolvedDependency(sandbox.root.clone()))?;
    bfs_from(sandbox, root)
}

pub fn bfs_from<'a>(
    sandbox: &'a BuildSandbox,
    start: &'a Build,
) -> Result<Vec<&'a Build>, GraphError> {
    let mut order = Vec::new();
    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue = VecDeque::new();
    visited.insert(start.id.as_str());
    queue.push_back(start);
    while let Some(build) = queue.pop_front() {
        order.push(build);
        for dep_id in &build.dependencies {
            let dep = sandbox
                .get(dep_id)
                .ok_or_else(|| GraphError::UnresolvedDependency(dep_id.clone()))?;
            if visited.insert(dep.id.as_str()) {
                queue.push_back(dep);
            }
        }
    }
    Ok(order)
}

/// Depth-first post-order from the sandbox root: every dependency of a
/// node precedes the node, deepest first, deduplicated by id. Drives
/// build execution and dependency env-group ordering.
pub fn post_order_dfs<'a>(sandbox: &'a BuildSandbox) -> Result<Vec<&'a Build>, GraphError> {
    let root = sandbox
        .root()
        .ok_or_else(|| GraphError::UnresolvedDependency(sandbox.root.clone()))?;
    post_order_dfs_from(sandbox, root)
}

pub fn post_order_dfs_from<'a>(
    sandbox: &'a BuildSandbox,
    start: &'a Build,
) -> Result<Vec<&'a Build>, GraphError> {
    let mut order = Vec::new();
    let mut visited: HashSet<&str> = HashSet::new();
    let mut on_stack: HashSet<&str> = HashSet::new();
    visit(sandbox, start, &mut visited, &mut on_stack, &mut order)?;
    Ok(order)
}

fn visit<'a>(
    sandbox: &'a BuildSandbox,
    build: &'a Build,
    visited: &mut HashSet<&'a str>,
    on_stack: &mut HashSet<&'a str>,
    order: &mut Vec<&'a Build>,
) -> Result<(), GraphError> {
    if visited.contains(build.id.as_str()) {
        return Ok(());
    }
    if !on_stack.insert(build.id.as_str()) {
        return Err(GraphError::Cycle(build.id.clone()));
    }
    for dep_id in &build.dependencies {
        let dep = sandbox
            .get(dep_id)
            .ok_or_else(|| GraphError::UnresolvedDependency(dep_id.clone()))?;
        visit(sandbox, dep, visited, on_stack, order)?;
    }
    on_stack.remove(build.id.as_str());
    visited.insert(build.id.as_str());
    order.push(build);
    Ok(())
}

/// All builds reachable from `start` excluding `start` itself, in BFS
/// order.
pub fn collect_transitive_dependencies<'a>(
    sandbox: &'a BuildSandbox,
    start: &'a Build,
) -> Result<Vec<&'a Build>, GraphError> {
    Ok(bfs_from(sandbox, start)?.into_iter().skip(1).collect())
}
