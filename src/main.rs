//! hypeman - copy files to and from instances, run commands inside them
//!
//! `cp` resolves the destination first (remote stat or local stat), then
//! hands off to the transfer client or, for `-`, to the tar adapter. `exec`
//! and `build-logs` stream until the server reports completion.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hypeman::api::ApiClient;
use hypeman::build_events;
use hypeman::cli::{BuildLogsArgs, Cli, Command, CpArgs, ExecArgs};
use hypeman::config::Config;
use hypeman::error::is_broken_pipe;
use hypeman::exec;
use hypeman::logger::{self, Logger, NoopLogger, TeeLogger, TextLogger};
use hypeman::path_spec::parse_copy_pair;
use hypeman::progress::ConsoleProgress;
use hypeman::resolve::{
    resolve_pull_destination, resolve_push_destination, split_contents_only, EndpointStat,
};
use hypeman::tar_stream::{pull_to_writer, push_from_reader};
use hypeman::terminal::detect_tty;
use hypeman::transfer::{pull_path, push_path, TransferOptions};
use hypeman::transport::WsDialer;

/// Choose loggers once: optional console progress plus an optional log file.
fn transfer_logger(log_file: Option<&Path>, console: Option<ConsoleProgress>) -> Arc<dyn Logger> {
    let mut loggers: Vec<Arc<dyn Logger>> = Vec::new();
    if let Some(console) = console {
        loggers.push(Arc::new(console));
    }
    if let Some(path) = log_file {
        match TextLogger::new(path) {
            Ok(l) => loggers.push(Arc::new(l)),
            Err(e) => eprintln!("Warning: cannot open log file {}: {}", path.display(), e),
        }
    }
    match loggers.len() {
        0 => Arc::new(NoopLogger),
        1 => loggers.remove(0),
        _ => Arc::new(TeeLogger::new(loggers)),
    }
}

async fn run_cp(config: Config, args: CpArgs, log_file: Option<PathBuf>) -> Result<i32> {
    let (src, dst) = parse_copy_pair(&args.src, &args.dst)?;
    let remote = if src.is_remote() { &src } else { &dst };
    let ident = remote.instance.as_deref().unwrap_or_default();

    let api = ApiClient::new(config.clone())?;
    let instance_id = api.resolve_instance(ident).await?;
    let dialer = WsDialer::new(&config, &instance_id, "cp")?;
    let opts = TransferOptions {
        archive: args.archive,
        follow_links: args.follow_links,
    };
    let log_file = log_file.as_deref();

    if src.is_remote() {
        if dst.is_stdio() {
            let logger = transfer_logger(log_file, None);
            pull_to_writer(&dialer, &src.path, opts, std::io::stdout(), logger.as_ref()).await?;
            return Ok(0);
        }

        let (src_root, _) = split_contents_only(&src.path, false);
        let info = api
            .stat_source(&instance_id, src_root, args.follow_links)
            .await?;
        let dst_path = PathBuf::from(&dst.path);
        let dst_stat = EndpointStat::of_local(&dst_path)
            .with_context(|| format!("cannot stat destination {}", dst_path.display()))?;
        let resolved = resolve_pull_destination(&src.path, info.is_dir, &dst_path, dst_stat)?;

        let console = (!args.quiet).then(|| ConsoleProgress::new(false));
        let logger = transfer_logger(log_file, console);
        pull_path(&dialer, src_root, resolved, info.is_dir, opts, logger.as_ref()).await?;
        return Ok(0);
    }

    let console = (!args.quiet).then(|| ConsoleProgress::new(true));
    let logger = transfer_logger(log_file, console);

    if src.is_stdio() {
        push_from_reader(&dialer, std::io::stdin(), &dst.path, args.archive, logger.as_ref())
            .await?;
        return Ok(0);
    }

    let (src_root, contents_only) = split_contents_only(&src.path, true);
    let md = std::fs::metadata(src_root)
        .with_context(|| format!("cannot stat source {}", src_root))?;
    let dst_stat = api.stat_path(&instance_id, &dst.path, true).await?.endpoint();
    let resolved = resolve_push_destination(&src.path, md.is_dir(), &dst.path, dst_stat)?;

    push_path(
        &dialer,
        Path::new(src_root),
        &resolved,
        contents_only,
        dst_stat.exists,
        opts,
        logger.as_ref(),
    )
    .await?;
    Ok(0)
}

async fn run_exec(config: Config, args: ExecArgs) -> Result<i32> {
    let api = ApiClient::new(config.clone())?;
    let instance_id = api.resolve_instance(&args.instance).await?;

    let tty = detect_tty(args.it, args.no_tty);
    let request = exec::build_request(args.command, tty, &args.env, args.cwd, args.timeout);
    let dialer = WsDialer::new(&config, &instance_id, "exec")?;

    let outcome = exec::run(&dialer, &request).await?;
    if let Some(err) = outcome.error {
        eprintln!("Error: {:#}", err);
    }
    Ok(outcome.exit_code)
}

async fn run_build_logs(config: Config, args: BuildLogsArgs) -> Result<i32> {
    let api = ApiClient::new(config)?;
    let events = api.build_events(&args.build_id).await?;
    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    build_events::follow(Box::pin(events), &mut stdout, &mut stderr).await?;
    Ok(0)
}

async fn run(cli: Cli) -> Result<i32> {
    let config = Config::load(cli.base_url.as_deref())?;
    match cli.command {
        Command::Cp(args) => run_cp(config, args, cli.log_file).await,
        Command::Exec(args) => run_exec(config, args).await,
        Command::BuildLogs(args) => run_build_logs(config, args).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logger::set_debug(cli.debug);

    // reqwest and tungstenite both link rustls; pin the process-wide provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    // Exec forwards Ctrl-C to its own session handling
    if !matches!(cli.command, Command::Exec(_)) {
        if let Err(e) = ctrlc::set_handler(move || {
            eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
            // Exit immediately with 130 (128 + SIGINT)
            std::process::exit(130);
        }) {
            eprintln!("Warning: cannot install Ctrl-C handler: {}", e);
        }
    }

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) if is_broken_pipe(&e) => 0,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };
    // Exit explicitly: a pending blocking stdin read would otherwise keep the
    // runtime alive after an exec session ends.
    std::process::exit(code);
}
