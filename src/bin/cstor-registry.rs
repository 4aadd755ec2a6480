use std::{path::PathBuf, time::Duration};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::io::{copy, stdout, AsyncWriteExt};

use cstor_registry::{
    config::{open_driver, DriverConfig},
    Context, StorageDriver, WalkControl,
};

/// Browse containers-storage as a registry storage tree
#[derive(Debug, Parser)]
#[clap(name = "cstor-registry", version)]
pub struct App {
    /// containers-storage root to serve
    #[clap(long)]
    root: Option<PathBuf>,
    /// storage.conf to read the root from
    #[clap(long)]
    storage_conf: Option<PathBuf>,
    /// give up after this many seconds
    #[clap(long)]
    timeout: Option<u64>,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Lists a directory
    Ls { path: String },
    /// Prints a path's kind and size
    Stat { path: String },
    /// Writes a file's content to stdout
    Cat {
        path: String,
        #[clap(long, default_value_t = 0)]
        offset: u64,
    },
    /// Prints every path below a directory
    Walk {
        #[clap(default_value = "/")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();

    let config = DriverConfig {
        root: args.root,
        storage_conf: args.storage_conf,
    };
    let driver = open_driver(&config)?;
    let ctx = match args.timeout {
        Some(secs) => Context::with_timeout(Duration::from_secs(secs)),
        None => Context::new(),
    };

    match args.cmd {
        Command::Ls { path } => {
            for child in driver.list(&ctx, &path).await? {
                println!("{child}");
            }
        }
        Command::Stat { path } => {
            let info = driver.stat(&ctx, &path).await?;
            let kind = if info.is_dir { "directory" } else { "file" };
            println!("{} {kind} {}", info.path, info.size);
        }
        Command::Cat { path, offset } => {
            let mut reader = driver.reader(&ctx, &path, offset).await?;
            let mut out = stdout();
            copy(&mut reader, &mut out).await?;
            out.flush().await?;
        }
        Command::Walk { path } => {
            driver
                .walk(&ctx, &path, |info| {
                    println!("{}", info.path);
                    Ok(WalkControl::Continue)
                })
                .await?;
        }
    }
    Ok(())
}
