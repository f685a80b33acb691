use crate::core::{models::*, Bundler, FileWatcher, HmrNotifier};
use crate::infrastructure::{BroadcastHmr, HmrMessage, NotifyWatcher};
use crate::utils::{ConfigLoader, KilnError, Logger, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "kiln - incremental module bundler")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// One-shot production build
    Build {
        /// Entry file
        entry: PathBuf,
        #[command(flatten)]
        common: CommonArgs,
        /// Disable minification
        #[arg(long)]
        no_minify: bool,
    },
    /// Build, then rebuild on every change
    Watch {
        /// Entry file
        entry: PathBuf,
        #[command(flatten)]
        common: CommonArgs,
        /// Disable hot module replacement notifications
        #[arg(long)]
        no_hmr: bool,
    },
}

#[derive(Args, Clone, Default)]
pub struct CommonArgs {
    /// Output directory
    #[arg(short = 'd', long)]
    pub out_dir: Option<PathBuf>,
    /// URL prefix bundles are served from
    #[arg(long)]
    pub public_url: Option<String>,
    /// Disable the persistent cache
    #[arg(long)]
    pub no_cache: bool,
    /// Cache directory
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
    /// 0 = silent, 1 = errors, 2 = warnings, 3 = info, 4 = debug
    #[arg(long)]
    pub log_level: Option<u8>,
}

impl CommonArgs {
    fn into_options(self) -> BundlerOptions {
        BundlerOptions {
            out_dir: self.out_dir,
            public_url: self.public_url,
            cache: self.no_cache.then_some(false),
            cache_dir: self.cache_dir,
            log_level: self.log_level,
            ..Default::default()
        }
    }
}

pub struct CliHandler;

impl CliHandler {
    pub fn new() -> Self {
        Self
    }

    pub async fn run(&self) -> Result<()> {
        let cli = Cli::parse();

        match cli.command {
            Commands::Build {
                entry,
                common,
                no_minify,
            } => {
                let flags = BundlerOptions {
                    production: Some(true),
                    watch: Some(false),
                    minify: no_minify.then_some(false),
                    ..common.into_options()
                };
                self.handle_build_command(&entry, flags).await
            }
            Commands::Watch {
                entry,
                common,
                no_hmr,
            } => {
                let flags = BundlerOptions {
                    watch: Some(true),
                    hmr: no_hmr.then_some(false),
                    ..common.into_options()
                };
                self.handle_watch_command(&entry, flags).await
            }
        }
    }

    /// CLI flags win over `kiln.config.json`
    fn resolve_options(entry: &Path, flags: BundlerOptions) -> Result<BundlerOptions> {
        let from_file = ConfigLoader::load_for_entry(entry)?.unwrap_or_default();
        Ok(flags.or(from_file))
    }

    async fn handle_build_command(&self, entry: &Path, flags: BundlerOptions) -> Result<()> {
        let options = Self::resolve_options(entry, flags)?;
        Logger::init(options.log_level.unwrap_or(3));

        let bundler = Bundler::new(entry, options);
        let report = bundler.bundle().await?;

        for bundle in report.bundles.iter().filter(|b| !b.assets.is_empty()) {
            Logger::info(&format!("{} ({} assets)", bundle.name.display(), bundle.assets.len()));
        }
        Ok(())
    }

    async fn handle_watch_command(&self, entry: &Path, flags: BundlerOptions) -> Result<()> {
        let options = Self::resolve_options(entry, flags)?;
        Logger::init(options.log_level.unwrap_or(3));

        let (watcher, changes) = NotifyWatcher::new()?;
        let watcher: Arc<dyn FileWatcher> = Arc::new(watcher);

        let mut bundler = Bundler::new(entry, options).with_watcher(watcher);
        if bundler.options().hmr {
            let hmr = Arc::new(BroadcastHmr::new());
            spawn_hmr_logger(&hmr);
            bundler = bundler.with_hmr(hmr as Arc<dyn HmrNotifier>);
        }
        let bundler = Arc::new(bundler);

        // The first pass may fail; keep watching so a fix triggers a rebuild
        if let Err(e) = bundler.bundle().await {
            Logger::debug(&format!("Initial build failed: {}", e));
        }

        tokio::spawn(bundler.clone().watch_changes(changes));
        Logger::info("Watching for changes. Press Ctrl+C to stop.");

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| KilnError::build(format!("Failed to listen for Ctrl+C: {}", e)))?;
        bundler.stop();
        Ok(())
    }
}

impl Default for CliHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_hmr_logger(hmr: &BroadcastHmr) {
    let mut messages = hmr.subscribe();
    tokio::spawn(async move {
        while let Ok(message) = messages.recv().await {
            match message {
                HmrMessage::Update { assets } => {
                    Logger::debug(&format!("HMR update: {} assets", assets.len()));
                }
                HmrMessage::Error { message, .. } => {
                    Logger::debug(&format!("HMR error: {}", message));
                }
            }
        }
    });
}
