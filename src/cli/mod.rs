// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// Article image harvester CLI
#[derive(Parser, Debug)]
#[command(name = "harvester")]
#[command(version)]
#[command(about = "Harvest pages and images, index them, and place images into chapters", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Harvest a list of page URLs and index their images
    Harvest(commands::HarvestArgs),

    /// Show the index a (user, article) scope resolves to
    IndexInfo(commands::IndexInfoArgs),

    /// Place indexed images into a JSON list of chapters
    Place(commands::PlaceArgs),
}

/// Execute CLI command
pub async fn execute(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Harvest(args) => commands::harvest(args).await,
        Commands::IndexInfo(args) => commands::index_info(args).await,
        Commands::Place(args) => commands::place(args).await,
    }
}
