use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use rfgrid::cache::{ResourceCache, UploadCache};
use rfgrid::collector::{DomCollector, DomSnapshot};
use rfgrid::http::{HttpRenderingService, HttpResourceFetcher};
use rfgrid::render::{CheckSettings, RenderJobBuilder, RenderJobDriver, RenderStatusResults, RenderTarget};
use rfgrid::GridConfig;

#[derive(Parser)]
#[command(name = "rfgrid", version, about = "Render a captured DOM snapshot on a remote rendering grid")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Collect a snapshot, render it on every target and print the outcomes
    Render {
        #[arg(long)]
        snapshot: PathBuf,
        /// Base URL of the rendering service
        #[arg(long)]
        service: String,
        #[arg(long, env = "RFGRID_API_KEY")]
        api_key: Option<String>,
        /// browser:WIDTHxHEIGHT, repeatable
        #[arg(long = "target", required = true)]
        targets: Vec<RenderTarget>,
        /// JSON check settings
        #[arg(long)]
        settings: Option<PathBuf>,
        #[arg(long)]
        force_put: bool,
    },
    /// Collect a snapshot and list the resolved resources
    Inspect {
        #[arg(long)]
        snapshot: PathBuf,
    },
}

#[derive(Serialize)]
struct OutcomeLine<'a> {
    step: &'a str,
    target: String,
    render_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a RenderStatusResults>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

async fn render(
    config: GridConfig,
    snapshot: &Path,
    service: &str,
    api_key: Option<String>,
    targets: Vec<RenderTarget>,
    settings: Option<PathBuf>,
) -> Result<()> {
    let snapshot: DomSnapshot = read_json(snapshot)?;
    let settings: CheckSettings = match settings {
        Some(path) => read_json(&path)?,
        None => CheckSettings::default(),
    };

    let resources = ResourceCache::new();
    let fetcher = Arc::new(HttpResourceFetcher::new(&config)?);
    let collector = DomCollector::new(fetcher, resources.clone())
        .max_frame_depth(config.max_frame_depth)
        .fetch_concurrency(config.fetch_concurrency);
    let dom = Arc::new(collector.collect(&snapshot).await?);
    log::info!("collected {} with {} resources", dom.url(), dom.resources().len());

    let builder = RenderJobBuilder::new(&dom, &settings)
        .agent_id(config.agent_id.clone())
        .results_url(config.results_url.clone())
        .stitching_service_url(config.stitching_service_url.clone());
    let jobs: Vec<_> = targets
        .iter()
        .enumerate()
        .map(|(i, target)| builder.build_one(&format!("step-{}", i + 1), "cli", target))
        .collect();

    let service = Arc::new(HttpRenderingService::new(service, api_key)?);
    let driver = RenderJobDriver::new(service, resources, UploadCache::new())
        .policy(config.retry)
        .force_put(config.force_put);
    let outcomes = driver.drive(jobs).await?;

    for (outcome, target) in outcomes.iter().zip(&targets) {
        let line = OutcomeLine {
            step: &outcome.step_id,
            target: format!("{}:{}x{}", target.browser, target.viewport.width, target.viewport.height),
            render_id: outcome.render_id.as_deref(),
            result: outcome.result.as_ref().ok(),
            error: outcome.result.as_ref().err().map(|e| e.to_string()),
        };
        println!("{}", serde_json::to_string(&line)?);
    }
    Ok(())
}

async fn inspect(config: GridConfig, snapshot: &Path) -> Result<()> {
    let snapshot: DomSnapshot = read_json(snapshot)?;
    let fetcher = Arc::new(HttpResourceFetcher::new(&config)?);
    let collector = DomCollector::new(fetcher, ResourceCache::new())
        .max_frame_depth(config.max_frame_depth)
        .fetch_concurrency(config.fetch_concurrency);
    let dom = collector.collect(&snapshot).await?;

    println!("{}", dom.url());
    for (url, resource) in dom.resources() {
        println!("  {}  {}  {} bytes  {}", resource.sha256(), resource.content_type(), resource.content().len(), url);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = GridConfig::from_env()?;

    match cli.command {
        Command::Render {
            snapshot,
            service,
            api_key,
            targets,
            settings,
            force_put,
        } => {
            config.force_put |= force_put;
            render(config, &snapshot, &service, api_key, targets, settings).await
        }
        Command::Inspect { snapshot } => inspect(config, &snapshot).await,
    }
}
