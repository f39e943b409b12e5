// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use anyhow::{anyhow, Context, Result};
use clap::Args;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::HarvesterConfig;
use crate::crawler::{ContentStore, HarvestMode, Harvester, HttpFetcher, Prefilter, ProgressCallback};
use crate::placement::{Chapter, ImagePlacer, UsedImages};
use crate::vector::{EmbeddingClient, HttpEmbeddingProvider, IndexRegistry, IndexScope};
use crate::vision::{HttpRehoster, VlmDescriber};

/// Options shared by every subcommand
#[derive(Args, Debug)]
pub struct CommonArgs {
    /// TOML config file; environment variables are used when omitted
    #[arg(long, env = "HARVEST_CONFIG")]
    pub config: Option<PathBuf>,

    /// User owning the index scope
    #[arg(long)]
    pub user: Option<String>,

    /// Article owning the index scope
    #[arg(long)]
    pub article: Option<String>,
}

impl CommonArgs {
    fn scope(&self) -> IndexScope {
        IndexScope::from_parts(self.user.as_deref(), self.article.as_deref())
    }
}

/// Arguments for the harvest command
#[derive(Args, Debug)]
pub struct HarvestArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// File with one page URL per line (`#` starts a comment)
    #[arg(long)]
    pub urls_file: PathBuf,

    /// Theme the images should illustrate
    #[arg(long)]
    pub theme: String,

    /// multimodal, direct-embedding or none
    #[arg(long, default_value = "multimodal")]
    pub mode: HarvestMode,

    /// Render pages with headless Chromium
    #[cfg(feature = "headless")]
    #[arg(long)]
    pub headless: bool,

    /// Hide the progress bar
    #[arg(long)]
    pub quiet: bool,
}

/// Arguments for the index-info command
#[derive(Args, Debug)]
pub struct IndexInfoArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}

/// Arguments for the place command
#[derive(Args, Debug)]
pub struct PlaceArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// JSON array of chapters: `[{"heading": ..., "paragraphs": [...]}]`
    #[arg(long)]
    pub chapters_file: PathBuf,

    /// Override the similarity threshold
    #[arg(long)]
    pub threshold: Option<f32>,

    /// Print JSON instead of markdown
    #[arg(long)]
    pub json: bool,
}

fn load_config(path: Option<&Path>) -> Result<HarvesterConfig> {
    dotenv::dotenv().ok();
    let config = match path {
        Some(path) => HarvesterConfig::from_toml_file(path)?,
        None => HarvesterConfig::from_env(),
    };
    config.validate()?;
    Ok(config)
}

fn build_embeddings(config: &HarvesterConfig) -> Result<Arc<EmbeddingClient>> {
    let provider = HttpEmbeddingProvider::new(config.embedding.clone())?;
    Ok(Arc::new(
        EmbeddingClient::new(Arc::new(provider)).with_batch_size(config.embedding.batch_size),
    ))
}

fn build_registry(config: &HarvesterConfig) -> Arc<IndexRegistry> {
    Arc::new(IndexRegistry::new(config.index_root.clone(), config.index.clone()))
}

#[cfg(feature = "headless")]
async fn build_fetcher(config: &HarvesterConfig, args: &HarvestArgs) -> Result<HttpFetcher> {
    let fetcher = HttpFetcher::new(config.fetch.clone())?;
    if !args.headless {
        return Ok(fetcher);
    }
    let renderer = crate::crawler::ChromiumRenderer::launch(&config.fetch).await?;
    Ok(fetcher.with_renderer(Arc::new(renderer)))
}

#[cfg(not(feature = "headless"))]
async fn build_fetcher(config: &HarvesterConfig, _args: &HarvestArgs) -> Result<HttpFetcher> {
    Ok(HttpFetcher::new(config.fetch.clone())?)
}

fn load_store(path: Option<&Path>) -> Result<ContentStore> {
    match path {
        Some(path) if path.exists() => {
            let store = ContentStore::load(path)
                .with_context(|| format!("loading content store from {}", path.display()))?;
            info!("Loaded content store with {} URLs", store.url_count());
            Ok(store)
        }
        _ => Ok(ContentStore::new()),
    }
}

fn read_urls(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading URL list {}", path.display()))?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn make_progress_bar(total: usize) -> ProgressBar {
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} [{elapsed_precise}] {pos}/{len} pages ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb.set_draw_target(ProgressDrawTarget::stderr_with_hz(12));
    pb
}

pub async fn harvest(args: HarvestArgs) -> Result<()> {
    let config = load_config(args.common.config.as_deref())?;
    let urls = read_urls(&args.urls_file)?;

    let fetcher = Arc::new(build_fetcher(&config, &args).await?);
    info!("Using {} page renderer", fetcher.renderer_name());

    let outcome = run_harvest(&args, &config, &urls, Arc::clone(&fetcher)).await;
    if let Err(e) = fetcher.shutdown().await {
        warn!("Failed to shut down {} renderer: {}", fetcher.renderer_name(), e);
    }
    outcome
}

async fn run_harvest(
    args: &HarvestArgs,
    config: &HarvesterConfig,
    urls: &[String],
    fetcher: Arc<HttpFetcher>,
) -> Result<()> {
    let scope = args.common.scope();
    let store = Arc::new(load_store(config.store_snapshot.as_deref())?);
    let mut harvester = Harvester::new(
        config.fetch.clone(),
        fetcher,
        build_embeddings(config)?,
        build_registry(config),
    )
    .with_store(Arc::clone(&store))
    .with_prefilter(Prefilter::new(config.prefilter.clone()));

    if let Some(quality) = &config.quality {
        harvester = harvester.with_quality(quality.clone());
    }
    if args.mode == HarvestMode::Multimodal {
        harvester = harvester.with_describer(Arc::new(VlmDescriber::new(config.vlm.clone())?));
    }
    if let Some(endpoint) = &config.rehost.endpoint {
        harvester = harvester.with_rehoster(Arc::new(HttpRehoster::new(endpoint.clone())?));
    }
    let harvester = Arc::new(harvester);

    let pb = (!args.quiet).then(|| make_progress_bar(urls.len()));
    let progress: Option<ProgressCallback> = pb.clone().map(|pb| {
        Arc::new(move |completed: usize, total: usize| {
            pb.set_length(total as u64);
            pb.set_position(completed as u64);
        }) as ProgressCallback
    });

    let report = harvester
        .harvest(urls, &args.theme, args.mode, &scope, progress)
        .await?;
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }

    if args.mode == HarvestMode::DirectEmbedding {
        let deferred = harvester.index_deferred(&scope, &report.pages).await?;
        info!(
            "Indexed {} of {} deferred images ({} failed)",
            deferred.indexed, deferred.requested, deferred.failed
        );
    }

    if let Some(path) = &config.store_snapshot {
        if let Err(e) = store.save(path) {
            warn!("Failed to save content store to {}: {}", path.display(), e);
        }
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

pub async fn index_info(args: IndexInfoArgs) -> Result<()> {
    let config = load_config(args.common.config.as_deref())?;
    let scope = args.common.scope();
    let registry = build_registry(&config);

    match registry.open_existing(&scope).await {
        Some((resolved, handle)) => {
            let index = handle.read().await;
            println!("Scope:     {}", scope);
            println!("Resolved:  {}", resolved);
            println!("Directory: {}", registry.scope_dir(&resolved).display());
            println!("Vectors:   {}", index.size());
            match index.dimension() {
                Some(dim) => println!("Dimension: {}", dim),
                None => println!("Dimension: unset"),
            }
        }
        None => println!("No index found for {} or its fallbacks", scope),
    }
    Ok(())
}

pub async fn place(args: PlaceArgs) -> Result<()> {
    let mut config = load_config(args.common.config.as_deref())?;
    if let Some(threshold) = args.threshold {
        config.placement.similarity_threshold = threshold;
        config.placement.validate().map_err(|e| anyhow!(e))?;
    }

    let contents = std::fs::read_to_string(&args.chapters_file)
        .with_context(|| format!("reading chapters from {}", args.chapters_file.display()))?;
    let chapters: Vec<Chapter> = serde_json::from_str(&contents).context("parsing chapters JSON")?;

    let placer = ImagePlacer::new(build_registry(&config), build_embeddings(&config)?, config.placement.clone());
    let mut used = UsedImages::new();
    let placed = placer.place(&args.common.scope(), &chapters, &mut used).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&placed)?);
    } else {
        let rendered: Vec<String> = placed.iter().map(|c| c.to_markdown()).collect();
        println!("{}", rendered.join("\n\n"));
    }
    Ok(())
}
