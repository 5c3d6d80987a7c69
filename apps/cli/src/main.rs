//! Downpour CLI - multi-connection downloader
//!
//! A thin driver over the engine: probe links, download them with
//! segmented connections, watch progress on the terminal.

mod progress;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use downpour_core::{DownloadItem, Engine};
use downpour_types::{CollisionPolicy, ProxyConfig, Settings, Status, SubType};
use std::path::PathBuf;

/// Downpour - Multi-connection download manager
#[derive(Parser)]
#[command(name = "downpour")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a URL
    Get {
        /// URL to download
        url: String,

        /// Destination folder
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// File name (derived from the server or URL when omitted)
        #[arg(short, long)]
        name: Option<String>,

        /// Maximum concurrent connections
        #[arg(short, long)]
        connections: Option<usize>,

        /// Speed limit in bytes/sec (0 = unlimited)
        #[arg(short = 'l', long)]
        limit: Option<u64>,

        /// Treat the URL as an HLS media playlist
        #[arg(long)]
        hls: bool,

        /// Proxy URL (http, https, socks4, socks4a, socks5, socks5h)
        #[arg(long)]
        proxy: Option<String>,

        /// Referer header to send
        #[arg(long)]
        referer: Option<String>,

        /// Skip TLS certificate validation
        #[arg(long)]
        insecure: bool,

        /// Compute MD5 and SHA-256 of the finished file
        #[arg(long)]
        checksum: bool,

        /// Keep the temp folder after completion
        #[arg(long)]
        keep_temp: bool,

        /// What to do when the target file exists
        #[arg(long, value_enum, default_value_t = CollisionArg::Rename)]
        collision: CollisionArg,
    },

    /// Probe URLs for name, size, and resumability
    Probe {
        /// URLs to probe
        urls: Vec<String>,

        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum CollisionArg {
    Overwrite,
    Rename,
    Cancel,
}

impl From<CollisionArg> for CollisionPolicy {
    fn from(arg: CollisionArg) -> Self {
        match arg {
            CollisionArg::Overwrite => CollisionPolicy::Overwrite,
            CollisionArg::Rename => CollisionPolicy::Rename,
            CollisionArg::Cancel => CollisionPolicy::Cancel,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "downpour=debug" } else { "downpour=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    match cli.command {
        Commands::Get {
            url,
            output,
            name,
            connections,
            limit,
            hls,
            proxy,
            referer,
            insecure,
            checksum,
            keep_temp,
            collision,
        } => {
            let mut settings = Settings::default();
            if let Some(connections) = connections {
                settings.max_connections = connections.max(1);
            }
            if let Some(limit) = limit {
                settings.speed_limit = limit;
            }
            settings.verify_ssl = !insecure;
            settings.checksum = checksum;
            settings.keep_temp = keep_temp;
            settings.proxy = proxy.map(|url| ProxyConfig { url });
            settings.http.referer = referer;
            let folder = output.unwrap_or_else(|| settings.download_dir.clone());

            let engine = Engine::new(settings).context("cannot start the engine")?;

            let item = if hls {
                let file_name = name.unwrap_or_else(|| "stream.mp4".to_string());
                let mut item = DownloadItem::new(url.clone(), &file_name, &folder);
                item.kind = downpour_types::MediaKind::Video;
                item.manifest_url = Some(url);
                item.set_subtypes(vec![SubType::Hls]);
                item
            } else {
                let info = engine.probe(&url).await.context("probe failed")?;
                let file_name = name.unwrap_or(info.name);
                let mut item = DownloadItem::new(url, &file_name, &folder);
                *item.eff_url.get_mut() = info.eff_url;
                item.size
                    .store(info.size, std::sync::atomic::Ordering::Release);
                item.resumable = info.resumable;
                *item.last_modified.get_mut() = info.last_modified;
                item
            };

            println!(
                "{} {} -> {}",
                style("downloading").green().bold(),
                item.name,
                item.folder.display()
            );

            let events = engine.subscribe();
            let item = engine.add(item, collision.into())?;
            let status = progress::watch(events, item.clone()).await;

            match status {
                Status::Completed => {
                    println!(
                        "{} {}",
                        style("completed").green().bold(),
                        item.target_file().display()
                    );
                    if let Some(md5) = item.md5.lock().clone() {
                        println!("  md5:    {md5}");
                    }
                    if let Some(sha256) = item.sha256.lock().clone() {
                        println!("  sha256: {sha256}");
                    }
                    Ok(())
                }
                status => {
                    let reason = item
                        .last_error
                        .lock()
                        .clone()
                        .unwrap_or_else(|| status.to_string());
                    bail!("download {status}: {reason}");
                }
            }
        }

        Commands::Probe { urls, json } => {
            if urls.is_empty() {
                bail!("no urls given");
            }
            let engine = Engine::new(Settings::default())?;
            for url in urls {
                match engine.probe(&url).await {
                    Ok(info) => {
                        if json {
                            println!("{}", serde_json::to_string_pretty(&info)?);
                        } else {
                            println!("{}", style(&info.name).bold());
                            println!("  url:       {}", info.eff_url);
                            println!("  size:      {}", progress::human_bytes(info.size));
                            println!("  type:      {}", info.content_type.as_deref().unwrap_or("-"));
                            println!("  resumable: {}", info.resumable);
                        }
                    }
                    Err(e) => eprintln!("{} {url}: {e}", style("error").red().bold()),
                }
            }
            Ok(())
        }
    }
}
