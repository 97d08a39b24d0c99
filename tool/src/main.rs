extern crate anyhow;
extern crate clap;
extern crate env_logger;
extern crate ext2extract;
extern crate log;

use std::fs;
use std::io;
use std::io::Write;
use std::process;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Error;
use clap::{App, Arg};
use ext2extract::{ErrorCategory, Options, StateCheck, SuperBlock};
use log::info;

/// Bad arguments exit with the invalid inode status.
const USAGE_EXIT: i32 = 4;

struct Config {
    image: String,
    inode: u32,
    stat: bool,
    options: Options,
}

fn extract(config: &Config) -> Result<u64, Error> {
    let image = fs::File::open(&config.image)
        .with_context(|| anyhow!("opening image '{}'", config.image))?;
    let fs = SuperBlock::new_with_options(image, &config.options)?;
    info!(
        "{:?}: {} byte blocks, {} inodes in {} groups",
        fs.volume_name(),
        fs.block_size(),
        fs.inodes_count(),
        fs.group_count()
    );

    let inode = fs.load_inode(config.inode)?;
    if config.stat {
        eprintln!("<{}> {:?} {:?}", inode.number, inode.flags, inode.stat);
    }

    let stdout = io::stdout();
    let mut out = io::BufWriter::new(stdout.lock());
    let written = fs.extract(&inode, &mut out)?;
    out.flush().with_context(|| anyhow!("flushing output"))?;

    info!("wrote {} bytes of inode <{}>", written, config.inode);
    Ok(written)
}

fn parse_args() -> Config {
    let matches = App::new("ext2extract")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Writes the content of one inode of an ext2 image to stdout")
        .arg(Arg::with_name("image").required(true))
        .arg(
            Arg::with_name("inode").required(true).validator(|s| {
                s.parse::<u32>()
                    .map(|_| ())
                    .map_err(|e| format!("invalid inode number '{}': {}", s, e))
            }),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .multiple(true)
                .help("log more to stderr; repeat for more"),
        )
        .arg(
            Arg::with_name("require-clean")
                .long("require-clean")
                .help("refuse filesystems which weren't cleanly unmounted"),
        )
        .arg(
            Arg::with_name("stat")
                .long("stat")
                .help("print the inode's metadata to stderr first"),
        )
        .get_matches_safe();

    let matches = match matches {
        Ok(matches) => matches,
        Err(e) => match e.kind {
            clap::ErrorKind::HelpDisplayed | clap::ErrorKind::VersionDisplayed => e.exit(),
            _ => {
                eprintln!("{}", e.message);
                process::exit(USAGE_EXIT);
            }
        },
    };

    let level = match matches.occurrences_of("verbose") {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    Config {
        image: matches.value_of("image").unwrap().to_string(),
        // checked by the validator
        inode: matches.value_of("inode").unwrap().parse::<u32>().unwrap(),
        stat: matches.is_present("stat"),
        options: Options {
            state_check: if matches.is_present("require-clean") {
                StateCheck::Require
            } else {
                StateCheck::Warn
            },
        },
    }
}

fn main() {
    let config = parse_args();

    if let Err(e) = extract(&config) {
        let category = ErrorCategory::of(&e);
        eprintln!("ERROR: {:?}", e);
        process::exit(category.exit_code());
    }
}
