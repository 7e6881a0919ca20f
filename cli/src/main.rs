// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dskview_fs::{Result as FsResult, VolumeCallback};

#[derive(Parser)]
#[command(name = "dskview", about = "Browse and modify filesystems inside disk-image files")]
struct Cli {
    /// Disk image to operate on.
    image: PathBuf,

    /// Directory to change into before running the command, one component
    /// per occurrence.
    #[arg(short = 'C', long = "directory")]
    directories: Vec<String>,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the current directory.
    Ls,
    /// Write a file from the image to stdout or a local file.
    Cat {
        name: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Prepend the .BIN load-address header where the volume has one.
        #[arg(long)]
        bin_header: bool,
    },
    /// Copy a local file into the image.
    Put {
        file: PathBuf,
        /// Name inside the image; defaults to the local file name.
        #[arg(long = "as")]
        name: Option<String>,
    },
    /// Remove a file or an empty directory.
    Rm { name: String },
    /// Create a directory.
    Mkdir { name: String },
    /// Defragment (RT-11 squeeze).
    Squeeze,
    /// Show volume information.
    Info,
}

/// Answers every volume question with a fixed reply instead of prompting.
struct FixedAnswer(bool);

impl VolumeCallback for FixedAnswer {
    fn interactive(&self) -> bool {
        true
    }

    fn confirm(&mut self, _prompt: &str) -> FsResult<bool> {
        Ok(self.0)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => simplelog::LevelFilter::Warn,
        1 => simplelog::LevelFilter::Info,
        _ => simplelog::LevelFilter::Debug,
    };
    simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let mut volume = dskview::mount(&cli.image)
        .with_context(|| format!("cannot mount {}", cli.image.display()))?;
    for directory in &cli.directories {
        volume
            .change_directory(directory)
            .with_context(|| format!("cannot change into {directory}"))?;
    }

    match cli.command {
        Command::Ls => {
            for entry in volume.files() {
                let kind = if entry.is_directory { 'd' } else { '-' };
                let protection = if entry.read_only { 'r' } else { 'w' };
                let timestamp = entry
                    .created
                    .map(|created| created.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default();
                println!("{kind}{protection} {:>10} {timestamp:>19} {}", entry.length, entry.name);
            }
        }
        Command::Cat {
            name,
            output,
            bin_header,
        } => {
            let mut callback = FixedAnswer(bin_header);
            match output {
                Some(path) => {
                    let mut file = File::create(&path)
                        .with_context(|| format!("cannot create {}", path.display()))?;
                    volume.copy_file_to(&name, &mut file, &mut callback)?;
                }
                None => {
                    let stdout = io::stdout();
                    volume.copy_file_to(&name, &mut stdout.lock(), &mut callback)?;
                }
            }
        }
        Command::Put { file, name } => {
            let name = match name {
                Some(name) => name,
                None => file
                    .file_name()
                    .context("input path has no file name")?
                    .to_string_lossy()
                    .into_owned(),
            };
            let mut input = File::open(&file)
                .with_context(|| format!("cannot open {}", file.display()))?;
            let length = input.metadata()?.len();
            let mut buffered: Vec<u8> = Vec::with_capacity(length as usize);
            input.read_to_end(&mut buffered)?;
            volume.add_file(&name, length, &mut &buffered[..], None)?;
            volume.flush()?;
        }
        Command::Rm { name } => {
            volume.remove_file(&name)?;
            volume.flush()?;
        }
        Command::Mkdir { name } => {
            volume.make_directory(&name)?;
            volume.flush()?;
        }
        Command::Squeeze => {
            volume.defragment()?;
            volume.flush()?;
        }
        Command::Info => {
            println!("current directory: {}", volume.current_dir_name());
            println!("entries:           {}", volume.files().len());
            println!("max name length:   {}", volume.max_name_length());
            match volume.free_space() {
                Ok(free) => println!("free space:        {free} bytes"),
                Err(_) => println!("free space:        unavailable"),
            }
        }
    }
    io::stdout().flush()?;
    Ok(())
}
