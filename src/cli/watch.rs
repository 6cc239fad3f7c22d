use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    thread,
};

use anyhow::Context;
use clap::Parser;
use parking_lot::Mutex;
use termcolor::{Color, ColorSpec, StandardStream, WriteColor};
use thiserror::Error;

use crate::{
    Config, DeliveryRestriction, DispatchKey, RestrictionError, RootOptions, Subscriber,
    VirtualRoot,
};

use super::{resolve_path, GlobalOptions};

/// Watch directories and print every change as it is dispatched.
#[derive(Debug, Parser)]
pub struct WatchCommand {
    /// Directory to watch, given as KEY=PATH. Can be specified multiple times.
    #[clap(long("root"), short, required = true)]
    pub roots: Vec<RootArg>,

    /// TOML file to read engine settings from.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Glob over paths relative to each root that are never reported. Can be
    /// specified multiple times.
    #[clap(long("ignore"))]
    pub ignore: Vec<String>,

    /// Only print keys whose relative path matches one of these globs.
    #[clap(long("only"))]
    pub only: Vec<String>,
}

impl WatchCommand {
    pub fn run(self, global: GlobalOptions) -> anyhow::Result<()> {
        let config = match &self.config {
            Some(path) => {
                let path = resolve_path(path);
                Config::load(&path)
                    .with_context(|| format!("Could not load config from {}", path.display()))?
            }
            None => Config::default(),
        };

        let engine = VirtualRoot::new(config).context("Could not start the watch engine")?;

        let printer = Printer {
            stdout: Mutex::new(StandardStream::stdout(global.color.into())),
            only: self.only.clone(),
        };
        engine.add_subscriber(Arc::new(printer))?;

        for root in &self.roots {
            let path = resolve_path(&root.path);
            let options = RootOptions {
                blacklist: self.ignore.clone(),
            };
            let watched = engine
                .register_root_with(root.key.as_str(), &path, options)
                .with_context(|| format!("Could not watch {}", path.display()))?;

            log::info!("Watching {} as {}", watched.path().display(), watched.key());
        }

        loop {
            thread::park();
        }
    }
}

/// A `KEY=PATH` pair naming one root.
#[derive(Debug, Clone)]
pub struct RootArg {
    pub key: String,
    pub path: PathBuf,
}

impl FromStr for RootArg {
    type Err = RootArgParseError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        match source.split_once('=') {
            Some((key, path)) if !key.is_empty() && !path.is_empty() => Ok(RootArg {
                key: key.to_owned(),
                path: PathBuf::from(path),
            }),
            _ => Err(RootArgParseError {
                attempted: source.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Error)]
#[error("Invalid root '{attempted}'. Expected KEY=PATH")]
pub struct RootArgParseError {
    attempted: String,
}

struct Printer {
    stdout: Mutex<StandardStream>,
    only: Vec<String>,
}

impl Printer {
    fn print(&self, color: Color, label: &str, key: &DispatchKey, detail: &str) -> io::Result<()> {
        let mut stdout = self.stdout.lock();

        stdout.set_color(ColorSpec::new().set_fg(Some(color)).set_bold(true))?;
        write!(stdout, "{label:>10}")?;
        stdout.reset()?;
        writeln!(stdout, " {key}{detail}")?;
        stdout.flush()
    }
}

impl Subscriber for Printer {
    fn restrict(&self, restriction: &mut DeliveryRestriction) -> Result<(), RestrictionError> {
        if !self.only.is_empty() {
            let patterns: Vec<&str> = self.only.iter().map(String::as_str).collect();
            restriction.add_glob(&patterns)?;
        }
        Ok(())
    }

    fn modified(&self, key: &DispatchKey, file: &Path) -> anyhow::Result<()> {
        let size = fs_err::metadata(file)?.len();
        self.print(Color::Green, "modified", key, &format!(" ({size} bytes)"))?;
        Ok(())
    }

    fn discard(&self, key: &DispatchKey) {
        if let Err(err) = self.print(Color::Red, "discarded", key, "") {
            log::warn!("Could not print discard of {}: {}", key, err);
        }
    }

    fn supplement(&self, known: &DispatchKey, additional: &DispatchKey) {
        if let Err(err) = self.print(Color::Cyan, "also", additional, &format!(" = {known}")) {
            log::warn!("Could not print supplement of {}: {}", additional, err);
        }
    }
}
