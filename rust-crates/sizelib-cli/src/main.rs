// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! `supersize`: attribute build output bytes to symbols and compare builds.

mod status;

use argh::FromArgs;
use sizelib::archive::{self, ApkSideFiles, ContainerSpec};
use sizelib::models::keys;
use sizelib::{describe, diff, sizefile, toolchain};
use status::{Error, ExitStatus};
use std::collections::BTreeMap;
use std::error::Error as _;
use std::io::{self, Write};
use std::path::PathBuf;

/// Binary size analysis.
#[derive(FromArgs, Debug)]
struct Args {
    /// log at debug level unless RUST_LOG says otherwise
    #[argh(switch, short = 'v')]
    verbose: bool,

    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Command {
    Archive(ArchiveArgs),
    Diff(DiffArgs),
    Describe(DescribeArgs),
}

/// Create a .size file from build outputs.
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "archive")]
struct ArchiveArgs {
    /// path of the .size file to create
    #[argh(positional)]
    output: PathBuf,

    /// native executable, shared library or static archive (repeatable)
    #[argh(option)]
    elf_file: Vec<PathBuf>,

    /// an APK or AAB to analyze
    #[argh(option)]
    apk_file: Option<PathBuf>,

    /// loose .pak file (repeatable)
    #[argh(option)]
    pak_file: Vec<PathBuf>,

    /// a .pak.info file describing pak resources (repeatable)
    #[argh(option)]
    pak_info_file: Vec<PathBuf>,

    /// a .jar.info file mapping Java classes to sources (repeatable)
    #[argh(option)]
    jar_info_file: Vec<PathBuf>,

    /// resource path map of the APK (`original -> obfuscated` lines)
    #[argh(option)]
    resources_pathmap_file: Option<PathBuf>,

    /// tab separated resource info of the APK
    #[argh(option)]
    res_info_file: Option<PathBuf>,

    /// toolchain prefix, overriding $BINARY_SIZE_TOOL_PREFIX
    #[argh(option)]
    tool_prefix: Option<PathBuf>,

    /// resolve source paths through an external dwarfdump
    #[argh(switch)]
    dwarfdump: bool,

    /// fail if the result violates any data quality check
    #[argh(switch)]
    check_data_quality: bool,

    /// build directory; input paths are recorded relative to it
    #[argh(option)]
    output_directory: Option<PathBuf>,

    /// commit the inputs were built from
    #[argh(option)]
    source_commit: Option<String>,

    /// title stored in the build config
    #[argh(option)]
    title: Option<String>,

    /// a URL stored in the build config
    #[argh(option)]
    url: Option<String>,
}

/// Print the differences between two .size files.
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "diff")]
struct DiffArgs {
    /// the older .size file
    #[argh(positional)]
    before: PathBuf,

    /// the newer .size file
    #[argh(positional)]
    after: PathBuf,

    /// maximum number of symbols to list
    #[argh(option, default = "50")]
    limit: usize,
}

/// Print the sections and coverage of a .size file.
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "describe")]
struct DescribeArgs {
    /// the .size file to describe
    #[argh(positional)]
    input: PathBuf,
}

fn main() {
    let args: Args = argh::from_env();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let result = match args.command {
        Command::Archive(args) => run_archive(args),
        Command::Diff(args) => run_diff(args),
        Command::Describe(args) => run_describe(args),
    };

    let status = ExitStatus::from(&result);
    if let Err(e) = result {
        print_error(&e);
    }
    std::process::exit(status.code());
}

fn print_error(e: &Error) {
    eprintln!("error: {e}");
    let mut source = e.source();
    while let Some(cause) = source {
        eprintln!("  caused by: {cause}");
        source = cause.source();
    }
}

fn print_lines(lines: &[String]) -> Result<(), Error> {
    let mut out = io::stdout().lock();
    for line in lines {
        writeln!(out, "{line}").map_err(Error::Report)?;
    }
    out.flush().map_err(Error::Report)
}

fn archive_options(args: &ArchiveArgs, resolver: &toolchain::Resolver) -> archive::Options {
    let mut containers = Vec::new();
    if let Some(path) = &args.apk_file {
        containers.push(ContainerSpec::Apk {
            path: path.clone(),
            side: ApkSideFiles {
                pathmap: args.resources_pathmap_file.clone(),
                res_info: args.res_info_file.clone(),
                jar_info: args.jar_info_file.clone(),
                pak_info: args.pak_info_file.clone(),
            },
        });
    }
    for path in &args.elf_file {
        containers.push(ContainerSpec::Native { path: path.clone() });
    }
    if !args.pak_file.is_empty() {
        containers.push(ContainerSpec::Pak {
            paths: args.pak_file.clone(),
            pak_info: args.pak_info_file.clone(),
        });
    }

    let mut build_config = BTreeMap::new();
    let entries = [
        (keys::BUILD_CONFIG_GIT_REVISION, args.source_commit.clone()),
        (keys::BUILD_CONFIG_TITLE, args.title.clone()),
        (keys::BUILD_CONFIG_URL, args.url.clone()),
        (
            keys::BUILD_CONFIG_OUT_DIRECTORY,
            args.output_directory
                .as_ref()
                .map(|x| x.to_string_lossy().into_owned()),
        ),
    ];
    for (key, value) in entries {
        if let Some(value) = value {
            build_config.insert(key.to_owned(), value);
        }
    }

    archive::Options {
        containers,
        use_dwarfdump: args.dwarfdump || resolver.prefix().is_some(),
        check_data_quality: args.check_data_quality,
        source_commit: args.source_commit.clone(),
        build_config,
        output_directory: args.output_directory.clone(),
    }
}

fn run_archive(args: ArchiveArgs) -> Result<(), Error> {
    let resolver = toolchain::Resolver::new(args.tool_prefix.clone());
    if let Some(prefix) = resolver.prefix() {
        log::debug!("using tool prefix {}", prefix.display());
    }

    let opts = archive_options(&args, &resolver);
    let info = archive::create_size_info(&opts, &resolver)?;
    sizefile::write_path(&info, &args.output)?;
    log::info!("wrote {}", args.output.display());
    Ok(())
}

fn run_diff(args: DiffArgs) -> Result<(), Error> {
    let before = sizefile::read_path(&args.before)?;
    let after = sizefile::read_path(&args.after)?;
    let delta = diff::diff(before, after);
    print_lines(&describe::describe_delta(&delta, args.limit))
}

fn run_describe(args: DescribeArgs) -> Result<(), Error> {
    let info = sizefile::read_path(&args.input)?;
    print_lines(&describe::describe_size_info(&info))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::from_args(&["supersize"], args).unwrap()
    }

    #[test]
    fn archive_help() {
        let exit = Args::from_args(&["supersize"], &["archive", "--help"]).unwrap_err();
        assert!(exit.status.is_ok());
        for text in [
            "an APK or AAB to analyze",
            "a .pak.info file describing pak resources",
            "a .jar.info file mapping Java classes to sources",
        ] {
            assert!(exit.output.contains(text), "{text} missing from {}", exit.output);
        }
    }

    #[test]
    fn archive_container_order() {
        let args = parse(&[
            "archive",
            "out.size",
            "--elf-file",
            "out/libmonochrome.so",
            "--apk-file",
            "out/Monochrome.apk",
            "--elf-file",
            "out/libother.so",
            "--pak-file",
            "out/resources.pak",
            "--pak-info-file",
            "out/resources.pak.info",
            "--source-commit",
            "abc123",
        ]);
        let Command::Archive(args) = args.command else {
            panic!("expected archive command");
        };

        let resolver = toolchain::Resolver::with_search_path(None, "");
        let opts = archive_options(&args, &resolver);
        assert_eq!(opts.containers.len(), 4);
        assert!(matches!(
            &opts.containers[0],
            ContainerSpec::Apk { side, .. } if side.pak_info.len() == 1
        ));
        assert!(matches!(
            &opts.containers[1],
            ContainerSpec::Native { path } if path.ends_with("libmonochrome.so")
        ));
        assert!(matches!(
            &opts.containers[3],
            ContainerSpec::Pak { paths, .. } if paths.len() == 1
        ));
        assert!(!opts.use_dwarfdump);
        assert_eq!(opts.build_config[keys::BUILD_CONFIG_GIT_REVISION], "abc123");
    }

    #[test]
    fn tool_prefix_selects_dwarfdump() {
        let args = parse(&["archive", "out.size", "--tool-prefix", "/opt/llvm/bin/"]);
        let Command::Archive(args) = args.command else {
            panic!("expected archive command");
        };
        let resolver = toolchain::Resolver::new(args.tool_prefix.clone());
        assert!(archive_options(&args, &resolver).use_dwarfdump);
    }

    #[test]
    fn diff_limit() {
        let Command::Diff(args) = parse(&["diff", "a.size", "b.size"]).command else {
            panic!("expected diff command");
        };
        assert_eq!(args.limit, 50);

        let Command::Diff(args) = parse(&["diff", "a.size", "b.size", "--limit", "5"]).command else {
            panic!("expected diff command");
        };
        assert_eq!(args.limit, 5);
    }

    #[test]
    fn failures_map_to_user_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("empty.size");
        let err = run_archive(ArchiveArgs {
            output: out.clone(),
            elf_file: vec![],
            apk_file: None,
            pak_file: vec![],
            pak_info_file: vec![],
            jar_info_file: vec![],
            resources_pathmap_file: None,
            res_info_file: None,
            tool_prefix: None,
            dwarfdump: false,
            check_data_quality: false,
            output_directory: None,
            source_commit: None,
            title: None,
            url: None,
        })
        .unwrap_err();
        assert_eq!(ExitStatus::from(&err), ExitStatus::UserError);
        assert!(!out.exists());

        let missing = run_describe(DescribeArgs {
            input: dir.path().join("missing.size"),
        })
        .unwrap_err();
        assert_eq!(ExitStatus::from(&missing), ExitStatus::UserError);
    }
}
