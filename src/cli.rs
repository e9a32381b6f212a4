use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::media::MediaType;

#[derive(Debug, Clone, Parser)]
#[command(name = "stupamap", about = "StupaMap media cache and prayer tally tools")]
pub struct Cli {
    /// Path to the configuration file (defaults to ./stupamap.toml if present).
    #[arg(long, env = "STUPAMAP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Overrides the log format from the configuration file.
    #[arg(long, value_enum)]
    pub log: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Download media into the cache and print the local paths.
    Fetch {
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Report the size of the cache.
    Usage,
    /// Run one eviction pass now.
    Evict,
    /// Remove all cached media of one owner.
    Clear {
        #[arg(long)]
        owner: String,
    },
    /// Upload a local file as media of an owner and print its URL.
    Upload {
        #[arg(long)]
        owner: String,
        #[arg(long, value_enum)]
        media_type: Option<MediaTypeArg>,
        file: PathBuf,
    },
    /// Keep running scheduled eviction and the metrics endpoint until Ctrl-C.
    Run,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum MediaTypeArg {
    Photo,
    Video,
    Other,
}

impl From<MediaTypeArg> for MediaType {
    fn from(arg: MediaTypeArg) -> Self {
        match arg {
            MediaTypeArg::Photo => MediaType::Photo,
            MediaTypeArg::Video => MediaType::Video,
            MediaTypeArg::Other => MediaType::Other,
        }
    }
}
