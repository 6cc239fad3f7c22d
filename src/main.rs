use std::{env, panic, process};

use backtrace::Backtrace;
use clap::Parser;

use libtreewatch::cli::{resolve_path, Options};
use libtreewatch::logging;

fn main() {
    panic::set_hook(Box::new(|panic_info| {
        let message = match panic_info.payload().downcast_ref::<&str>() {
            Some(&message) => message.to_string(),
            None => match panic_info.payload().downcast_ref::<String>() {
                Some(message) => message.clone(),
                None => "<no message>".to_string(),
            },
        };

        let thread = std::thread::current();
        log::error!(
            "Thread '{}' panicked in treewatch {}: {}",
            thread.name().unwrap_or("<unnamed>"),
            env!("CARGO_PKG_VERSION"),
            message
        );

        if let Some(location) = panic_info.location() {
            log::error!("in file {} on line {}", location.file(), location.line());
        }

        let should_backtrace = env::var("RUST_BACKTRACE")
            .map(|var| var == "1")
            .unwrap_or(false);

        if should_backtrace {
            eprintln!("{:?}", Backtrace::new());
        } else {
            eprintln!(
                "note: run with `RUST_BACKTRACE=1` environment variable to display a backtrace."
            );
        }
    }));

    let options = Options::parse();

    let log_dir = options
        .global
        .log_dir
        .as_deref()
        .map(|dir| resolve_path(dir).into_owned());

    let _log_guard = logging::init_logging(
        options.global.verbosity,
        options.global.color,
        log_dir.as_deref(),
    );

    log::debug!("Running {}", options.subcommand.command_name());

    if let Err(err) = options.run() {
        log::error!("{:?}", err);
        process::exit(1);
    }
}
