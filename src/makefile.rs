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

//! Rendering of an ordered item list as Makefile text. Only the small
//! subset of Make the ejected driver needs: verbatim lines, rules with an
//! optional `.PHONY` marking, and multi-line `define` blocks used as
//! canned shell preambles.

/// One item of a Makefile, emitted in sequence.
#[derive(Debug, Clone)]
pub enum MakeItem {
    /// Emitted verbatim on its own line.
    Raw(String),
    Rule(MakeRule),
    Define(MakeDefine),
}

#[derive(Debug, Clone)]
pub struct MakeRule {
    pub target: String,
    pub dependencies: Vec<String>,
    pub command: Option<String>,
    /// Phony targets are collected into one `.PHONY` line at the end.
    pub phony: bool,
}

/// A `define NAME … endef` block holding a canned shell preamble. Body
/// lines are joined with `; \` continuations and the last line ends with a
/// bare `;`, so the expanded body plus whatever follows it on the recipe
/// line runs as one shell command.
#[derive(Debug, Clone)]
pub struct MakeDefine {
    pub name: String,
    pub body: Vec<DefineSegment>,
}

#[derive(Debug, Clone)]
pub enum DefineSegment {
    /// One shell command, without any trailing separator.
    Line(String),
    /// `export KEY="value"` lines; a `None` value omits the line
    /// entirely, so host-conditional variables survive absence cleanly.
    Exports(Vec<(String, Option<String>)>),
}

pub fn render(items: &[MakeItem]) -> String {
    let mut out = String::new();
    let mut phony: Vec<String> = Vec::new();
    for item in items {
        match item {
            MakeItem::Raw(line) => {
                out.push_str(line);
                out.push('\n');
            }
            MakeItem::Rule(rule) => {
                if rule.phony {
                    phony.push(rule.target.clone());
                }
                out.push('\n');
                out.push_str(&rule.target);
                out.push(':');
                for dep in &rule.dependencies {
                    out.push(' ');
                    out.push_str(dep);
                }
                out.push('\n');
                if let Some(command) = &rule.command {
                    out.push('\t');
                    out.push_str(command);
                    out.push('\n');
                }
            }
            MakeItem::Define(define) => {
                out.push('\n');
                out.push_str("define ");
                out.push_str(&define.name);
                out.push('\n');
                let mut lines: Vec<String> = Vec::new();
                for segment in &define.body {
                    match segment {
                        DefineSegment::Line(line) => lines.push(line.clone()),
                        DefineSegment::Exports(pairs) => {
                            for (key, value) in pairs {
                                if let Some(value) = value {
                                    lines.push(format!("export {}=\"{}\"", key, value));
                                }
                            }
                        }
                    }
                }
                for (i, line) in lines.iter().enumerate() {
                    out.push_str(line);
                    if i + 1 == lines.len() {
                        out.push_str(";\n");
                    } else {
                        out.push_str("; \\\n");
                    }
                }
                out.push_str("endef\n");
            }
        }
    }
    if !phony.is_empty() {
        out.push_str(&format!("\n.PHONY: {}\n", phony.join(" ")));
    }
    out
}
