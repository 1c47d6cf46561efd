use aspect_weaver::weave::{CopyBack, Settings};
use aspect_weaver::*;

use clap::{Arg, ArgAction, Command};
use std::fs;
use std::io;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Assembly(#[from] il::Error),

    #[error("{0}")]
    Weave(#[from] weave::Error),
}

fn main() -> Result<(), CliError> {
    env_logger::init();

    let matches = Command::new("Aspect weaver")
        .version(clap::crate_version!())
        .about("Weave lifecycle hooks into the methods of an assembly listing")
        .arg(
            Arg::new("output")
                .long("output")
                .short('o')
                .value_name("FILE")
                .help("Write the woven listing here instead of to standard output"),
        )
        .arg(
            Arg::new("no-widen")
                .long("no-widen")
                .action(ArgAction::SetTrue)
                .help("Leave short branches alone, even if they end up out of range"),
        )
        .arg(
            Arg::new("modified-only")
                .long("modified-only")
                .action(ArgAction::SetTrue)
                .conflicts_with("copy-all")
                .help("Only copy back arguments that an entry hook overwrote (default)"),
        )
        .arg(
            Arg::new("copy-all")
                .long("copy-all")
                .action(ArgAction::SetTrue)
                .help("Copy every argument back after the entry hook"),
        )
        .arg(
            Arg::new("INPUT")
                .help("Sets the input assembly listing to use")
                .required(true)
                .index(1),
        )
        .get_matches();

    let mut settings = Settings::new();
    settings.widen_short_branches = !matches.get_flag("no-widen");
    if matches.get_flag("copy-all") {
        settings.copy_back = CopyBack::All;
    }

    let input = matches
        .get_one::<String>("INPUT")
        .expect("INPUT is a required argument");
    log::info!("Reading and weaving '{}'", input);
    let source = fs::read_to_string(input)?;
    let mut module = il::parse_module(&source)?;
    let woven = weave::weave_module(&mut module, &settings)?;
    log::info!("Wove {} method(s)", woven);

    match matches.get_one::<String>("output") {
        Some(output) => {
            log::info!("Writing '{}'", output);
            fs::write(output, module.to_string())?;
        }
        None => print!("{}", module),
    }

    Ok(())
}
