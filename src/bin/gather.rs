//! gather CLI: exercise a gatherer under load or against a scenario file.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use fifo_gatherer::config::{Config, SpawnMode};
use fifo_gatherer::scenario::Scenario;
use fifo_gatherer::scenario::stress::{self, StressOptions};
use fifo_gatherer::telemetry::{TelemetryConfig, init_telemetry};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "gather", about = "Multi-producer FIFO gatherer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Many producers enqueue concurrently; verify delivery properties
    Stress {
        /// Number of producer threads
        #[arg(long, default_value_t = 4)]
        producers: usize,
        /// Items enqueued by each producer
        #[arg(long, default_value_t = 10_000)]
        items: usize,
        /// Busy-work per callback, in microseconds
        #[arg(long, default_value_t = 0)]
        work_us: u64,
        /// Panic in the callback for every k-th item of each producer
        #[arg(long)]
        panic_every: Option<usize>,
        /// Where workers run: thread or tokio (defaults to GATHER_SPAWN)
        #[arg(long)]
        spawn: Option<SpawnMode>,
        /// Seconds to wait for the drain
        #[arg(long, default_value_t = 30)]
        timeout: u64,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run a TOML scenario of named producers and their items
    Scenario {
        /// Scenario file
        file: PathBuf,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "gather".to_string(),
        default_filter: config.log_level.clone(),
    })?;

    let clean = match cli.command {
        Command::Stress {
            producers,
            items,
            work_us,
            panic_every,
            spawn,
            timeout,
            json,
        } => {
            let options = StressOptions {
                producers,
                items_per_producer: items,
                work: Duration::from_micros(work_us),
                panic_every,
                spawn: spawn.unwrap_or(config.gatherer.spawn),
                drain_timeout: Duration::from_secs(timeout),
            };
            cmd_stress(options, json).await?
        }
        Command::Scenario { file, json } => cmd_scenario(file, json).await?,
    };

    guard.force_flush();
    drop(guard);

    if !clean {
        anyhow::bail!("delivery properties violated");
    }
    Ok(())
}

async fn cmd_stress(options: StressOptions, json: bool) -> anyhow::Result<bool> {
    if options.panic_every.is_some() {
        // Injected panics are reported by the observer; keep stderr readable.
        std::panic::set_hook(Box::new(|_| {}));
    }

    let run_options = options.clone();
    let report = tokio::task::spawn_blocking(move || stress::run(&run_options))
        .await
        .context("stress run aborted")??;
    let clean = report.is_clean(&options);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let v = &report.verdict;
        let s = &report.stats;
        println!("Spawn:        {}", report.spawn);
        println!("Producers:    {}", report.producers);
        println!("Items:        {} per producer", report.items_per_producer);
        println!("Delivered:    {}/{}", v.delivered, v.expected);
        println!("Duplicates:   {}", v.duplicates);
        println!("Missing:      {}", v.missing);
        println!("Reordered:    {}", v.order_violations);
        println!("Overlaps:     {}", v.overlaps);
        println!("Failed:       {} (observed {})", s.failed, report.observed_failures);
        println!("Workers:      {} (+{} inline)", s.workers_spawned, s.inline_drains);
        println!("Elapsed:      {}ms", report.elapsed_ms);
        println!("Result:       {}", if clean { "ok" } else { "VIOLATED" });
    }

    info!(clean, elapsed_ms = report.elapsed_ms, "stress run finished");
    Ok(clean)
}

async fn cmd_scenario(file: PathBuf, json: bool) -> anyhow::Result<bool> {
    let scenario = Scenario::load(&file)?;
    info!(
        scenario = %scenario.name,
        producers = scenario.producers.len(),
        items = scenario.total_items(),
        "running scenario"
    );

    let report = tokio::task::spawn_blocking(move || scenario.run())
        .await
        .context("scenario run aborted")??;
    let clean = report.verdict.is_clean();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Scenario:   {}", report.name);
        println!("Delivered:  {}", report.delivered.join(" "));
        println!(
            "Count:      {}/{}",
            report.verdict.delivered, report.verdict.expected
        );
        println!("Workers:    {}", report.stats.workers_spawned);
        println!("Result:     {}", if clean { "ok" } else { "VIOLATED" });
    }

    Ok(clean)
}
