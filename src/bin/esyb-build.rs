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

use std::error::Error;
use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::io::{BufReader, Read};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use esyb::{BuildConfig, BuildSandbox, Builder, SandboxError};

#[cfg(feature = "serde_json")]
use serde_json;
#[cfg(feature = "toml")]
use toml;

const USAGE: &str =
    "Usage: esyb-build [-hv] [-S|--store-path=<dir>] [-B|--sandbox-path=<dir>] [--toml|--json] <file>";

enum FileType {
    JSON,
    TOML,
    Unknown,
}

struct Args {
    ft: FileType,
    file_str: Option<OsString>,
    store_dir: Option<OsString>,
    sandbox_dir: Option<OsString>,
    verbosity: u8,
}

fn parse_args() -> Result<Args, lexopt::Error> {
    use lexopt::prelude::*;
    let mut args = Args {
        ft: FileType::Unknown,
        file_str: None,
        store_dir: None,
        sandbox_dir: None,
        verbosity: 0,
    };

    let mut parser = lexopt::Parser::from_env();
    while let Some(arg) = parser.next()? {
        match arg {
            Long("json") => {
                args.ft = FileType::JSON;
            }
            Long("toml") => {
                args.ft = FileType::TOML;
            }
            Short('v') => {
                args.verbosity += 1;
            }
            Short('S') | Long("store-path") => {
                args.store_dir = Some(parser.value()?);
            }
            Short('B') | Long("sandbox-path") => {
                args.sandbox_dir = Some(parser.value()?);
            }
            Short('h') | Long("help") => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            Value(val) => {
                args.file_str = Some(val);
            }
            _ => return Err(arg.unexpected()),
        }
    }
    Ok(args)
}

#[cfg(feature = "env_logger")]
fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

#[cfg(not(feature = "env_logger"))]
fn init_logging(_verbosity: u8) {}

fn read_path_to_string<P: AsRef<Path>>(file_name: P) -> Result<String, io::Error> {
    let fd = File::open(&file_name)?;
    let mut buf_reader = BufReader::new(fd);
    let mut contents = String::new();
    buf_reader.read_to_string(&mut contents)?;
    Ok(contents)
}

fn get_config_format(ft: FileType, file_path: &Path) -> FileType {
    match ft {
        FileType::JSON => FileType::JSON,
        FileType::TOML => FileType::TOML,
        FileType::Unknown => match file_path.extension().map(|s| s.as_bytes()) {
            Some(b"json") => FileType::JSON,
            Some(b"toml") => FileType::TOML,
            _ => FileType::Unknown,
        },
    }
}

fn parse_sandbox(ft: FileType, file_path: &Path, contents: &str) -> BuildSandbox {
    match get_config_format(ft, file_path) {
        #[cfg(feature = "serde_json")]
        FileType::JSON => serde_json::from_str(contents).unwrap_or_else(|e| {
            eprintln!("Error parsing JSON: {}", e);
            std::process::exit(1);
        }),
        #[cfg(feature = "toml")]
        FileType::TOML => toml::from_str(contents).unwrap_or_else(|e| {
            eprintln!("Error parsing TOML: {}", e);
            std::process::exit(1);
        }),
        _ => {
            eprint!("Unable to recognize config encoding. ");
            eprintln!("Try specifying --toml or --json");
            std::process::exit(1);
        }
    }
}

fn print_error_chain(top_err: &dyn Error) {
    let mut depth = 1;
    eprintln!("{:>5}. {}", depth, top_err);
    let mut source_err_opt = top_err.source();
    while let Some(err) = source_err_opt {
        depth += 1;
        eprintln!("{:>5}. {}", depth, err);
        source_err_opt = err.source();
    }
}

fn print_failure(err: &SandboxError) {
    eprintln!("Build failed:");
    print_error_chain(&err.first);
    for later in &err.rest {
        eprintln!();
        eprintln!("Additionally:");
        print_error_chain(later);
    }
}

fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Command line parsing error: {}", e);
            eprintln!("{}", USAGE);
            std::process::exit(1);
        }
    };
    let file_str = match args.file_str {
        Some(ref file_str) => file_str,
        None => {
            eprintln!("Missing command line argument: <file>");
            eprintln!("{}", USAGE);
            std::process::exit(1);
        }
    };
    init_logging(args.verbosity);

    let file_path = Path::new(file_str);
    let contents = match read_path_to_string(file_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error reading {}: {}", file_path.display(), e);
            std::process::exit(1);
        }
    };
    let mut sandbox = parse_sandbox(args.ft, file_path, &contents);
    // Manifests key builds by id without repeating it per entry.
    sandbox.reconcile_ids();

    let sandbox_path = match args.sandbox_dir {
        Some(dir) => PathBuf::from(dir),
        None => {
            let canonical = file_path.canonicalize().unwrap_or_else(|e| {
                eprintln!(
                    "Unable to determine canonical directory of {}: {}",
                    file_path.display(),
                    e
                );
                std::process::exit(1);
            });
            canonical
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        }
    };
    let store_path = match args.store_dir {
        Some(dir) => PathBuf::from(dir),
        None => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".esy"),
            None => {
                eprintln!("No --store-path given and HOME is unset");
                std::process::exit(1);
            }
        },
    };

    let config = BuildConfig::new(store_path, sandbox_path);
    let builder = Builder::new(&sandbox, &config);
    if let Err(err) = builder.build_all() {
        print_failure(&err);
        std::process::exit(1);
    }
}
