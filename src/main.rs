//! Command line front end: validate a file of proxy links through an external engine.

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::stream::{self, Stream, StreamExt};
use log::{error, info, warn};
use proxy_link_validator::dialer::engine::locate_engine;
use proxy_link_validator::scheduler::was_cancelled;
use proxy_link_validator::{
    utils, Delivery, EngineConfig, EngineDialer, FileSink, HttpProbe, RetryPolicy, RunSummary,
    Scheduler, ValidatorConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Debug, Parser)]
#[command(
    name = "link-validator",
    version,
    about = "Validate vmess/vless/trojan links through a real tunnel"
)]
struct Cli {
    /// File with one link per line.
    #[arg(long, short, default_value = "test.txt")]
    input: PathBuf,

    /// File receiving the working links. Truncated at start.
    #[arg(long, short, default_value = "valid_configs.txt")]
    output: PathBuf,

    /// Links validated at the same time.
    #[arg(long, short, default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..))]
    concurrency: u32,

    /// Budget per link for dialing and probing, in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,

    /// Links at or above this latency are rejected, in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    max_latency_ms: u64,

    /// URL fetched through each tunnel.
    #[arg(long, default_value = "http://www.bing.com")]
    probe_url: Url,

    /// V2Ray/Xray executable. Defaults to $V2RAY_EXEC or xray/v2ray on PATH.
    #[arg(long)]
    engine: Option<PathBuf>,

    /// Engine argument, repeatable. `{config}` is replaced by the config path.
    #[arg(long = "engine-arg", allow_hyphen_values = true)]
    engine_args: Vec<String>,

    /// How long to wait for the engine's local port, in milliseconds.
    #[arg(long, default_value_t = 5_000)]
    readiness_timeout_ms: u64,

    /// Write results in input order instead of completion order.
    #[arg(long, action)]
    ordered: bool,

    /// Stop the whole run after this many seconds.
    #[arg(long)]
    run_timeout_secs: Option<u64>,

    /// Limit on engine launches per second.
    #[arg(long)]
    max_dials_per_second: Option<f64>,

    /// Check plain TCP reachability before spawning the engine.
    #[arg(long, action)]
    preflight: bool,

    /// Print every verdict as JSON on stdout.
    #[arg(long, action)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let links = utils::read_link_file(&cli.input)?;
    info!("Loaded {} links from {}", links.len(), cli.input.display());

    let executable = match cli.engine.clone().or_else(locate_engine) {
        Some(path) => path,
        None => bail!("no engine executable found; pass --engine or set V2RAY_EXEC"),
    };
    info!("Using engine {}", executable.display());

    let mut builder = ValidatorConfig::builder()
        .concurrency(cli.concurrency as usize)
        .task_timeout(Duration::from_millis(cli.timeout_ms))
        .max_latency(Duration::from_millis(cli.max_latency_ms))
        .probe_url(cli.probe_url.as_str())
        .readiness(RetryPolicy::new(
            Duration::from_millis(500),
            Duration::from_millis(cli.readiness_timeout_ms),
        ))
        .delivery(if cli.ordered { Delivery::Input } else { Delivery::Completion });
    if let Some(secs) = cli.run_timeout_secs {
        builder = builder.run_timeout(Duration::from_secs(secs));
    }
    if let Some(rate) = cli.max_dials_per_second {
        builder = builder.max_dials_per_second(rate);
    }
    let config = builder.build();

    let mut engine = EngineConfig::new(executable);
    if !cli.engine_args.is_empty() {
        engine.args = cli.engine_args.clone();
    }
    engine.readiness = config.readiness;
    engine.preflight = cli.preflight;

    let sink = FileSink::create(&cli.output)?;
    let probe = HttpProbe::from_config(&config).context("invalid probe URL")?;
    let scheduler = Scheduler::new(config, Arc::new(EngineDialer::new(engine)), Arc::new(probe));

    let cancel = scheduler.cancel_token();
    let interrupts = stream::unfold((), |()| async {
        tokio::signal::ctrl_c().await.ok().map(|()| ((), ()))
    });
    tokio::spawn(handle_interrupts(Box::pin(interrupts), cancel, || {
        std::process::exit(130);
    }));

    let records = scheduler
        .run(&links, &sink)
        .await
        .with_context(|| format!("run aborted while writing {}", cli.output.display()))?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    }

    let summary = RunSummary::from_records(&records, 10);
    let cancelled = records.iter().filter(|r| was_cancelled(r)).count();
    println!("checked: {}", summary.total);
    println!("usable:  {}", summary.succeeded);
    println!("failed:  {}", summary.failed);
    for (reason, count) in &summary.failures {
        println!("  {:<22} {}", reason, count);
    }
    for (i, (link, latency)) in summary.fastest.iter().enumerate() {
        println!("{:2}. {:>6.0}ms {}", i + 1, latency, link);
    }
    if cancelled > 0 {
        println!("{} links were not checked because the run was cancelled", cancelled);
    }
    println!("saved to {}", sink.path().display());
    Ok(())
}

/// The first interrupt cancels the run. A second one calls `force_quit`.
async fn handle_interrupts<S, F>(mut interrupts: S, cancel: CancellationToken, force_quit: F)
where
    S: Stream<Item = ()> + Unpin,
    F: FnOnce(),
{
    if interrupts.next().await.is_none() {
        return;
    }
    warn!("Interrupted, cancelling in-flight checks (press Ctrl-C again to quit now)");
    cancel.cancel();
    if interrupts.next().await.is_some() {
        error!("Interrupted twice, exiting without waiting for tunnels to close");
        force_quit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test]
    async fn first_interrupt_cancels_second_forces_quit() {
        let cancel = CancellationToken::new();
        let quit = Cell::new(false);
        handle_interrupts(stream::iter([()]), cancel.clone(), || quit.set(true)).await;
        assert!(cancel.is_cancelled());
        assert!(!quit.get());

        let cancel = CancellationToken::new();
        handle_interrupts(stream::iter([(), ()]), cancel.clone(), || quit.set(true)).await;
        assert!(cancel.is_cancelled());
        assert!(quit.get());
    }

    #[tokio::test]
    async fn closed_signal_stream_leaves_the_run_alone() {
        let cancel = CancellationToken::new();
        handle_interrupts(stream::empty::<()>(), cancel.clone(), || {
            panic!("must not quit");
        })
        .await;
        assert!(!cancel.is_cancelled());
    }
}
