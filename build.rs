// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn flag(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name).long(name).action(ArgAction::SetTrue).help(help)
}

fn build_cli() -> Command {
    Command::new("mosaic")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Package metadata fetcher and image planner")
        .subcommand_required(false)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .global(true)
                .help("Configuration file (default: <config dir>/mosaic/config.toml)"),
        )
        .arg(flag("force-refresh", "Ignore cached fetch results").global(true))
        .subcommand(Command::new("fetch").about("Run every fetcher once and report the index size"))
        .subcommand(
            Command::new("search")
                .about("Search the package index")
                .arg(Arg::new("query").required(true).help("Query as distribution/name"))
                .arg(
                    Arg::new("limit")
                        .short('l')
                        .long("limit")
                        .default_value("50")
                        .help("Maximum number of results"),
                ),
        )
        .subcommand(
            Command::new("plan")
                .about("Resolve packages into an installation plan")
                .arg(
                    Arg::new("packages")
                        .required(true)
                        .num_args(1..)
                        .help("Packages as distribution/name"),
                )
                .arg(flag("dockerfile", "Emit a Dockerfile instead of the package list"))
                .arg(flag("graph", "Emit the dependency graph as DOT"))
                .arg(Arg::new("base-image").long("base-image").help("Base image for the Dockerfile"))
                .arg(flag("fetch-contents", "Download the contents of every planned package")),
        )
        .subcommand(Command::new("status").about("Show the status of every fetcher"))
        .subcommand(Command::new("test-all").about("Try to plan every indexed package on its own"))
        .subcommand(Command::new("refresh").about("Keep the index current until interrupted"))
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let manifest_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(e) => {
            println!("cargo:warning=CARGO_MANIFEST_DIR not set: {}", e);
            return;
        }
    };
    let man_dir = manifest_dir.join("man");

    if let Err(e) = fs::create_dir_all(&man_dir) {
        println!("cargo:warning=Failed to create man directory: {}", e);
        return;
    }

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();

    if let Err(e) = man.render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }

    let man_path = man_dir.join("mosaic.1");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}
