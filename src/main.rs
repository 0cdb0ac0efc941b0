use std::process::ExitCode;

use anyhow::{Context as _, Result};
use camino::Utf8PathBuf;
use clap::{crate_version, Arg, ArgAction, ArgMatches, ValueHint};
use tracing_subscriber::EnvFilter;

use git_repo_cache::{
    CacheConfig, CacheError, CloneRequestBuilder, GitCache, StrategyArg,
};

fn clap() -> clap::Command {
    use clap::Command;
    Command::new("git-cache")
        .version(crate_version!())
        .about("A caching layer for remote git repositories")
        .infer_subcommands(true)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("cache_dir")
                .long("cache-dir")
                .help("cache root (bare mirrors live here)")
                .value_parser(clap::value_parser!(Utf8PathBuf))
                .value_hint(ValueHint::DirPath)
                .env("GIT_CACHE")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("checkout_dir")
                .long("checkout-dir")
                .help("checkout root (working trees live here)")
                .value_parser(clap::value_parser!(Utf8PathBuf))
                .value_hint(ValueHint::DirPath)
                .env("GIT_CHECKOUT_ROOT")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .global(true)
                .help("enable verbose output"),
        )
        .subcommand(clap_clone_command())
        .subcommand(Command::new("status").about("show configuration and cached repositories"))
        .subcommand(
            Command::new("clean")
                .about("remove cached repositories and their checkouts")
                .arg(
                    Arg::new("force")
                        .short('f')
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("actually delete; without this, only report"),
                ),
        )
        .subcommand(Command::new("sync").about("fetch all mirrors, then repair stale checkouts"))
        .subcommand(Command::new("list").about("list cached repositories"))
        .subcommand(
            Command::new("verify")
                .about("validate cached repositories, repairing corruption")
                .arg(
                    Arg::new("url")
                        .help("verify only this repository")
                        .required(false),
                ),
        )
        .subcommand(Command::new("repair").about("repair outdated checkouts system-wide"))
}

fn clap_clone_command() -> clap::Command {
    clap::Command::new("clone")
        .about("clone a repository through the cache")
        .arg(Arg::new("url").help("repository to clone").required(true))
        .arg(
            Arg::new("strategy")
                .long("strategy")
                .value_name("STRATEGY")
                .value_parser(clap::value_parser!(StrategyArg))
                .help("clone strategy: full, shallow, treeless, blobless or auto"),
        )
        .arg(
            Arg::new("depth")
                .long("depth")
                .value_name("N")
                .value_parser(clap::value_parser!(u32).range(1..))
                .help("depth for shallow checkouts"),
        )
        .arg(
            Arg::new("org")
                .long("org")
                .value_name("NAME")
                .help("organization to fork into"),
        )
        .arg(
            Arg::new("private")
                .long("private")
                .action(ArgAction::SetTrue)
                .help("make the fork private"),
        )
        .arg(
            Arg::new("recursive")
                .long("recursive")
                .action(ArgAction::SetTrue)
                .overrides_with("no-recursive")
                .help("cache and initialize submodules recursively"),
        )
        .arg(
            Arg::new("no-recursive")
                .long("no-recursive")
                .action(ArgAction::SetTrue)
                .overrides_with("recursive")
                .help("skip submodules"),
        )
        .arg(
            Arg::new("force")
                .short('f')
                .long("force")
                .action(ArgAction::SetTrue)
                .help("recreate checkouts even when they look fine"),
        )
}

fn main() -> ExitCode {
    let matches = clap().get_matches();

    let default_filter = if matches.get_flag("verbose") {
        "git_repo_cache=debug"
    } else {
        "git_repo_cache=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    match run(&matches) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("git-cache: error: {err:#}");
            let code = err
                .downcast_ref::<CacheError>()
                .map(CacheError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

fn run(matches: &ArgMatches) -> Result<()> {
    let mut cfg = CacheConfig::load().context("loading configuration")?;
    if let Some(dir) = matches.get_one::<Utf8PathBuf>("cache_dir") {
        cfg.cache_root = Utf8PathBuf::from(shellexpand::tilde(dir.as_str()).into_owned());
    }
    if let Some(dir) = matches.get_one::<Utf8PathBuf>("checkout_dir") {
        cfg.checkout_root = Utf8PathBuf::from(shellexpand::tilde(dir.as_str()).into_owned());
    }
    cfg.verbose = matches.get_flag("verbose");

    match matches.subcommand() {
        Some(("clone", sub)) => {
            let mut builder = CloneRequestBuilder::default();
            builder.url(sub.get_one::<String>("url").unwrap().clone());
            if let Some(strategy) = sub.get_one::<StrategyArg>("strategy") {
                builder.strategy(*strategy);
            }
            if let Some(depth) = sub.get_one::<u32>("depth") {
                builder.depth(*depth);
            }
            builder.organization(sub.get_one::<String>("org").cloned());
            builder.make_private(sub.get_flag("private"));
            if sub.get_flag("recursive") {
                builder.recursive(Some(true));
            } else if sub.get_flag("no-recursive") {
                builder.recursive(Some(false));
            }
            let request = builder.build().expect("clone request builder is complete");

            cfg.force = sub.get_flag("force");
            let cache = GitCache::new(cfg)?;
            cache.clone_repository(&request)?;
        }
        Some(("status", _)) => GitCache::new(cfg)?.status()?,
        Some(("clean", sub)) => GitCache::new(cfg)?.clean(sub.get_flag("force"))?,
        Some(("sync", _)) => GitCache::new(cfg)?.sync_all()?,
        Some(("list", _)) => GitCache::new(cfg)?.list()?,
        Some(("verify", sub)) => {
            GitCache::new(cfg)?.verify(sub.get_one::<String>("url").map(String::as_str))?
        }
        Some(("repair", _)) => GitCache::new(cfg)?.repair_outdated()?,
        _ => unreachable!("subcommand is required"),
    }
    Ok(())
}
