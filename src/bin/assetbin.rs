//! assetbin command-line tool
//!
//! Create, inspect and unpack asset containers

use anyhow::{bail, Context};
use assetbin_rs::{AssetBundle, BundleBuilder, Container, Digest, OpenOptions};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "assetbin")]
#[command(about = "Pack a directory into an asset container and read it back")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store every file under a directory into a container
    Create {
        /// Directory to pack
        source: PathBuf,

        /// Container file to write
        output: PathBuf,

        /// Append to the output (e.g. an executable) instead of replacing it
        #[arg(short, long)]
        append: bool,

        /// Write <output>.gz instead of <output>
        #[arg(short = 'z', long)]
        gzip: bool,
    },

    /// List the assets in a container
    Ls {
        #[command(flatten)]
        target: Target,

        /// Show size, mode, modification time and digest
        #[arg(short, long)]
        long: bool,

        /// Print headers as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write asset contents to stdout
    Cat {
        #[command(flatten)]
        target: Target,

        /// Logical paths to print
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Restore a file or directory from a container
    Extract {
        #[command(flatten)]
        target: Target,

        /// Destination directory
        dest: PathBuf,

        /// Logical path to extract (default: everything)
        #[arg(default_value = "")]
        path: String,
    },

    /// Re-hash every payload and check the container hash
    Verify {
        #[command(flatten)]
        target: Target,
    },
}

#[derive(Args, Debug)]
struct Target {
    /// Container file (or the file it is appended to)
    container: PathBuf,

    /// The container is appended to the file
    #[arg(short = 'e', long)]
    ended: bool,

    /// Keep <container>.gz after decompressing it
    #[arg(long)]
    keep_gz: bool,
}

impl Target {
    fn options(&self) -> OpenOptions {
        OpenOptions {
            ended: self.ended,
            end_position: None,
            keep_compressed: self.keep_gz.then_some(true),
        }
    }

    fn open(&self) -> anyhow::Result<Container> {
        Container::open_file(&self.container, &self.options())
            .with_context(|| format!("opening {}", self.container.display()))
    }

    fn bundle(&self) -> anyhow::Result<AssetBundle> {
        AssetBundle::open_with(&self.container, &self.options())
            .with_context(|| format!("opening {}", self.container.display()))
    }
}

#[derive(Serialize)]
struct Listing<'a> {
    content_hash: Digest,
    build_time: String,
    headers_size: u64,
    assets: &'a [assetbin_rs::Header],
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Create {
            source,
            output,
            append,
            gzip,
        } => {
            if !source.is_dir() {
                bail!("{} is not a directory", source.display());
            }
            let summary = BundleBuilder::new()
                .source_dir(&source)
                .append(append)
                .gzip(gzip)
                .write(&output)
                .with_context(|| format!("writing {}", output.display()))?;
            println!(
                "{}: {} assets, {} bytes, hash {}",
                summary.path.display(),
                summary.assets,
                summary.container_len,
                summary.content_hash
            );
        }

        Command::Ls { target, long, json } => {
            let container = target.open()?;
            let mut out = io::stdout().lock();
            if json {
                let listing = Listing {
                    content_hash: container.content_hash(),
                    build_time: container.build_time().to_rfc3339(),
                    headers_size: container.headers_size(),
                    assets: container.headers(),
                };
                serde_json::to_writer_pretty(&mut out, &listing)?;
                writeln!(out)?;
            } else {
                for (header, offset) in container.segments() {
                    if long {
                        writeln!(
                            out,
                            "{:o}\t{:>10}\t{}\t{}\t@{}\t{}",
                            header.mode(),
                            header.size(),
                            header.mod_time().format("%Y-%m-%d %H:%M:%S"),
                            header.digest().map(|d| d.to_hex()).unwrap_or_default(),
                            offset,
                            header.path()
                        )?;
                    } else {
                        writeln!(out, "{}", header.path())?;
                    }
                }
            }
        }

        Command::Cat { target, paths } => {
            let bundle = target.bundle()?;
            let mut out = io::stdout().lock();
            for path in &paths {
                let mut reader = bundle.asset(path)?.open()?;
                io::copy(&mut reader, &mut out).with_context(|| format!("reading {}", path))?;
            }
            out.flush()?;
        }

        Command::Extract { target, dest, path } => {
            let bundle = target.bundle()?;
            let count = bundle.restore(&path, &dest)?;
            info!("Extracted {} files into {}", count, dest.display());
        }

        Command::Verify { target } => {
            let container = target.open()?;
            container.verify()?;
            println!(
                "OK: {} assets, hash {}, built {}",
                container.len(),
                container.content_hash(),
                container.build_time().to_rfc3339()
            );
        }
    }

    Ok(())
}
