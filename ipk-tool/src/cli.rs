// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    clap::{Arg, ArgMatches, Command},
    ipk_packaging::{check_inputs, inspect::analyze, IpkError, PackageBuilder, PackageRequest},
    log::LevelFilter,
    std::{
        path::PathBuf,
        time::{Duration, SystemTime},
    },
    thiserror::Error,
};

const PACKAGE_ABOUT: &str = "\
Build an .ipk package.

Each input is a directory holding an application (with appinfo.json), a
package (with packageinfo.json) or one or more services (with services.json,
searched up to 3 levels deep). At most one application can be packaged.

Package metadata is taken from --pkginfofile, from a packageinfo.json found
in the inputs or synthesized from the application's appinfo.json. A package
holding only services needs --pkgid or --pkginfofile.

The package is written to the output directory as
<package id>_<version>_<architecture>.ipk.
";

const INFO_ABOUT: &str = "\
Print information about an .ipk package.

By default selected fields of the control file and of each appinfo.json,
packageinfo.json, services.json and package.json in the package are shown.
With --detail the full content of those files is printed.
";

#[derive(Debug, Error)]
pub enum CliError {
    #[error("argument parsing error: {0}")]
    Clap(#[from] clap::Error),

    #[error("{0}")]
    Ipk(#[from] IpkError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid sub-command: {0}")]
    InvalidSubCommand(String),
}

pub type Result<T> = std::result::Result<T, CliError>;

fn add_input_args(command: Command<'static>) -> Command<'static> {
    command
        .arg(
            Arg::new("input")
                .required(true)
                .multiple_occurrences(true)
                .allow_invalid_utf8(true)
                .help("Application, package or service directories"),
        )
        .arg(
            Arg::new("force")
                .long("force")
                .short('f')
                .help("Package the first application if several are found"),
        )
        .arg(
            Arg::new("pkgid")
                .long("pkgid")
                .takes_value(true)
                .help("Package id to use instead of the application id"),
        )
        .arg(
            Arg::new("pkgversion")
                .long("pkgversion")
                .takes_value(true)
                .help("Package version to use instead of the application version"),
        )
        .arg(
            Arg::new("pkginfofile")
                .long("pkginfofile")
                .takes_value(true)
                .allow_invalid_utf8(true)
                .conflicts_with("pkgid")
                .help("packageinfo.json file to use"),
        )
}

fn request_from_args(args: &ArgMatches, outdir: PathBuf) -> Result<PackageRequest> {
    let inputs = args
        .values_of_os("input")
        .expect("input argument is required")
        .map(PathBuf::from)
        .collect::<Vec<_>>();

    Ok(PackageRequest::new(inputs, outdir)
        .set_force(args.is_present("force"))
        .set_pkgid(args.value_of("pkgid").map(String::from))
        .set_pkgversion(args.value_of("pkgversion").map(String::from))
        .set_pkginfofile(args.value_of_os("pkginfofile").map(PathBuf::from)))
}

fn command_package(args: &ArgMatches) -> Result<()> {
    let outdir = args
        .value_of_os("outdir")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut request = request_from_args(args, outdir)?
        .set_minify(!args.is_present("no-minify"))
        .set_rom(args.is_present("rom"))
        .set_encrypt(args.is_present("encrypt"))
        .set_encrypt_key(args.value_of_os("encrypt-key").map(PathBuf::from))
        .set_signing(
            args.value_of_os("sign").map(PathBuf::from),
            args.value_of_os("certificate").map(PathBuf::from),
        )
        .set_no_clean(args.is_present("no-clean"));

    if let Some(patterns) = args.values_of("exclude") {
        for pattern in patterns {
            request = request.add_exclude(pattern);
        }
    }

    if args.is_present("mtime") {
        let seconds = args.value_of_t::<u64>("mtime")?;
        request = request.set_mtime(Some(SystemTime::UNIX_EPOCH + Duration::from_secs(seconds)));
    }

    let output = PackageBuilder::new(request).build()?;

    println!("created {}", output.path.display());
    if let Some(dir) = output.staging_dir {
        println!("staging directory kept at {}", dir.display());
    }

    Ok(())
}

fn command_check(args: &ArgMatches) -> Result<()> {
    let request = request_from_args(args, PathBuf::from("."))?;

    let summary = check_inputs(&request)?;

    if args.is_present("json") {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        if let Some(app) = &summary.app_id {
            println!("application: {}", app);
        }
        println!("package: {} {}", summary.package_id, summary.package_version);
        for service in &summary.services {
            println!("service: {}", service);
        }
    }

    Ok(())
}

fn command_info(args: &ArgMatches) -> Result<()> {
    let path = PathBuf::from(
        args.value_of_os("package")
            .expect("package argument is required"),
    );

    print!("{}", analyze(&path, args.is_present("detail"))?);

    Ok(())
}

pub fn run_cli() -> Result<()> {
    let app = Command::new("ipk-tool")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Build and inspect .ipk application packages")
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times."),
        );

    let app = app.subcommand(add_input_args(
        Command::new("package")
            .about("Build an .ipk package")
            .long_about(PACKAGE_ABOUT)
            .arg(
                Arg::new("outdir")
                    .long("outdir")
                    .short('o')
                    .takes_value(true)
                    .allow_invalid_utf8(true)
                    .help("Directory to write the package to (default: current directory)"),
            )
            .arg(
                Arg::new("no-minify")
                    .long("no-minify")
                    .short('n')
                    .help("Do not minify JavaScript sources"),
            )
            .arg(
                Arg::new("rom")
                    .long("rom")
                    .short('r')
                    .help("Write the staged directory tree instead of an archive"),
            )
            .arg(
                Arg::new("encrypt")
                    .long("encrypt")
                    .short('e')
                    .help("Encrypt the package"),
            )
            .arg(
                Arg::new("encrypt-key")
                    .long("encrypt-key")
                    .takes_value(true)
                    .allow_invalid_utf8(true)
                    .requires("encrypt")
                    .help("PEM public key wrapping the encryption key (default: bundled key)"),
            )
            .arg(
                Arg::new("sign")
                    .long("sign")
                    .takes_value(true)
                    .allow_invalid_utf8(true)
                    .help("PEM private key to sign the package with"),
            )
            .arg(
                Arg::new("certificate")
                    .long("certificate")
                    .takes_value(true)
                    .allow_invalid_utf8(true)
                    .help("PEM certificate matching the signing key"),
            )
            .arg(
                Arg::new("exclude")
                    .long("exclude")
                    .short('x')
                    .takes_value(true)
                    .multiple_occurrences(true)
                    .help("Glob pattern of files to leave out of the package"),
            )
            .arg(
                Arg::new("no-clean")
                    .long("no-clean")
                    .help("Keep the staging directory for debugging"),
            )
            .arg(
                Arg::new("mtime")
                    .long("mtime")
                    .takes_value(true)
                    .help("Modification time of archive members, in seconds since the UNIX epoch"),
            ),
    ));

    let app = app.subcommand(add_input_args(
        Command::new("check")
            .about("Validate package inputs without building")
            .arg(
                Arg::new("json")
                    .long("json")
                    .help("Print the result as JSON"),
            ),
    ));

    let app = app.subcommand(
        Command::new("info")
            .about("Print information about an .ipk package")
            .long_about(INFO_ABOUT)
            .arg(
                Arg::new("package")
                    .required(true)
                    .allow_invalid_utf8(true)
                    .help("Path to the .ipk file"),
            )
            .arg(
                Arg::new("detail")
                    .long("detail")
                    .short('d')
                    .help("Print the full content of metadata files"),
            ),
    );

    let matches = app.get_matches();

    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    // Disable log context except at higher log levels.
    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    builder.init();

    match matches.subcommand() {
        Some(("package", args)) => command_package(args),
        Some(("check", args)) => command_check(args),
        Some(("info", args)) => command_info(args),
        Some((command, _)) => Err(CliError::InvalidSubCommand(command.to_string())),
        None => Ok(()),
    }
}
