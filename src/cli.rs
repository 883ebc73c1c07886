//! Command-line front-end
//!
//! Thin dispatch over the core: `distro` commands drive the catalog and
//! downloader, `image` commands drive the image manager, `profiles` inspects
//! the projection. Errors map to the documented exit codes (0 success,
//! 1 validation, 2 not-found, 3 source unavailable, 4 integrity, 5 host
//! subsystem missing, 6 transient, 7 cancelled).

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::cancel::CancelToken;
use crate::catalog::Catalog;
use crate::distro::DistroDownloader;
use crate::download::{DownloadOptions, DownloadProgress, ProgressObserver};
use crate::error::{Error, Result};
use crate::images::{CreateImageOptions, ImageManager, UpdateProperties};
use crate::index::Scope;
use crate::store::Store;
use crate::validation::sanitize_for_display;
use crate::wsl::executor::RealWslExecutor;

#[derive(Parser)]
#[command(
    name = "wsl-manager",
    version,
    about = "Manage WSL distro templates and provenance-tracked images"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Distro templates: the immutable, verified side of the store
    #[command(subcommand)]
    Distro(DistroCommand),
    /// Images: working WSL instances derived from distros or other images
    #[command(subcommand)]
    Image(ImageCommand),
    /// Terminal launch profiles projected from enabled images
    #[command(subcommand)]
    Profiles(ProfilesCommand),
    /// WSL host version and store summary
    Status,
}

#[derive(Subcommand)]
enum DistroCommand {
    /// List catalog entries and their local availability
    List,
    /// Refresh the catalog from the upstream registry
    Refresh {
        /// Ignore the 24h cache TTL
        #[arg(long)]
        force: bool,
    },
    /// Download a distro and materialize its canonical template
    Download {
        name: String,
        /// Retries for transient network failures
        #[arg(long, default_value_t = 3)]
        max_retries: u32,
        /// Per-attempt timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Remove a materialized template
    Remove { name: String },
    /// Show distributions offered by `wsl --list --online`
    Online,
}

#[derive(Args, Clone)]
struct ImageCreateArgs {
    /// Friendly name shown in terminal profiles
    #[arg(long)]
    display_name: Option<String>,
    #[arg(long)]
    description: Option<String>,
    /// Do not project a terminal profile for this image
    #[arg(long)]
    no_terminal: bool,
    /// Restrict the profile to one workspace path
    #[arg(long)]
    workspace: Option<String>,
    /// WSL version to import as (1 or 2)
    #[arg(long)]
    wsl_version: Option<u8>,
    /// One-shot provisioning command run as root after import
    #[arg(long)]
    post_install: Option<String>,
}

impl ImageCreateArgs {
    fn into_options(self) -> CreateImageOptions {
        CreateImageOptions {
            display_name: self.display_name,
            description: self.description,
            enable_terminal: !self.no_terminal,
            scope: match self.workspace {
                Some(workspace_path) => Scope::Workspace { workspace_path },
                None => Scope::Global,
            },
            wsl_version: self.wsl_version,
            post_install: self.post_install,
            cancel: CancelToken::new(),
        }
    }
}

#[derive(Subcommand)]
enum ImageCommand {
    /// List images, reconciling the index against live registrations
    List,
    /// Create an image from an available distro template
    Create {
        distro: String,
        name: String,
        #[command(flatten)]
        args: ImageCreateArgs,
    },
    /// Clone an existing image
    Clone {
        source: String,
        name: String,
        #[command(flatten)]
        args: ImageCreateArgs,
    },
    /// Import an image from a tar archive
    Import {
        tar: String,
        name: String,
        #[command(flatten)]
        args: ImageCreateArgs,
    },
    /// Export an image to a tar archive
    Export { name: String, out: String },
    /// Unregister an image and delete its install directory
    Delete { name: String },
    /// Show an image with facts probed from inside it
    Info { name: String },
    /// Enable terminal-profile projection for an image
    Enable { name: String },
    /// Disable terminal-profile projection for an image
    Disable { name: String },
    /// Update display name, description, or tags
    Set {
        name: String,
        #[arg(long)]
        display_name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Comma-separated tag list (replaces existing tags)
        #[arg(long, value_delimiter = ',')]
        tags: Option<Vec<String>>,
    },
}

#[derive(Subcommand)]
enum ProfilesCommand {
    /// Show the currently published profiles
    List,
    /// Force a re-projection from the index
    Sync,
}

/// Prints download progress to stderr on one updating line.
struct ConsoleProgress;

impl ProgressObserver for ConsoleProgress {
    fn on_progress(&self, progress: DownloadProgress) {
        match progress.percent {
            Some(percent) => eprint!(
                "\rdownloading... {percent:5.1}% ({} / {} bytes)",
                progress.downloaded,
                progress.total.unwrap_or(0)
            ),
            None => eprint!("\rdownloading... {} bytes", progress.downloaded),
        }
        if progress.percent == Some(100.0) {
            eprintln!();
        }
    }
}

/// Parse argv, run, and map the outcome to an exit code.
pub async fn run() -> i32 {
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {}", sanitize_for_display(&e.to_string()));
            e.exit_code()
        }
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let store = Store::from_env()?;
    let catalog = Catalog::new(store.clone());

    match cli.command {
        Command::Distro(cmd) => run_distro(cmd, store, catalog).await,
        Command::Image(cmd) => {
            let manager = ImageManager::new(store, catalog, Arc::new(RealWslExecutor::new()));
            run_image(cmd, manager)
        }
        Command::Profiles(cmd) => {
            let manager = ImageManager::new(store, catalog, Arc::new(RealWslExecutor::new()));
            run_profiles(cmd, manager)
        }
        Command::Status => {
            let distros = catalog.list()?;
            let available = distros.iter().filter(|d| d.available).count();
            let manager = ImageManager::new(store, catalog, Arc::new(RealWslExecutor::new()));
            println!(
                "wsl:     {}",
                manager.host_version().unwrap_or_else(|| "not detected".to_string())
            );
            println!("distros: {available} available of {} known", distros.len());
            println!("images:  {}", manager.list()?.len());
            Ok(())
        }
    }
}

async fn run_distro(cmd: DistroCommand, store: Store, catalog: Catalog) -> Result<()> {
    match cmd {
        DistroCommand::List => {
            let distros = catalog.refresh(false).await?;
            println!("{:<16} {:<28} {:<9} {}", "NAME", "DISPLAY NAME", "ARCH", "AVAILABLE");
            for d in distros {
                println!(
                    "{:<16} {:<28} {:<9} {}",
                    d.name,
                    d.display_name,
                    format!("{:?}", d.architecture).to_lowercase(),
                    if d.available { "yes" } else { "no" }
                );
            }
            Ok(())
        }
        DistroCommand::Refresh { force } => {
            let distros = catalog.refresh(force).await?;
            println!("catalog refreshed: {} distributions", distros.len());
            Ok(())
        }
        DistroCommand::Download {
            name,
            max_retries,
            timeout,
        } => {
            let opts = DownloadOptions {
                max_retries,
                timeout: timeout.map(Duration::from_secs),
                cancel: cancel_on_ctrl_c(),
            };
            // Best-effort sizing; a failed probe never blocks the download.
            if let Some(distro) = catalog.get(&name)? {
                if let Some(size) = crate::download::head_size(&distro.source_url).await {
                    eprintln!("expected size: {size} bytes");
                }
            }
            let downloader = DistroDownloader::new(store, catalog);
            let distro = downloader
                .download_distro(&name, &ConsoleProgress, &opts)
                .await?;
            println!(
                "{} ready at {}",
                distro.name,
                distro
                    .local_path
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            );
            if let Some(digest) = distro.expected_digest {
                println!("sha256: {digest}");
            }
            Ok(())
        }
        DistroCommand::Remove { name } => {
            DistroDownloader::new(store, catalog).remove_distro(&name)?;
            println!("{name} removed");
            Ok(())
        }
        DistroCommand::Online => {
            let manager = ImageManager::new(store, catalog, Arc::new(RealWslExecutor::new()));
            for name in manager.list_online_distributions()? {
                println!("{name}");
            }
            Ok(())
        }
    }
}

fn run_image(cmd: ImageCommand, manager: ImageManager) -> Result<()> {
    match cmd {
        ImageCommand::List => {
            let images = manager.list()?;
            println!(
                "{:<20} {:<24} {:<8} {:<9} {}",
                "NAME", "DISPLAY NAME", "VERSION", "ENABLED", "SOURCE"
            );
            for image in images {
                println!(
                    "{:<20} {:<24} {:<8} {:<9} {}",
                    image.name,
                    image.display_name,
                    image.wsl_version,
                    if image.enabled { "yes" } else { "no" },
                    source_summary(&image.source)
                );
            }
            Ok(())
        }
        ImageCommand::Create { distro, name, args } => {
            let image = manager.create_from_distro(&distro, &name, &args.into_options())?;
            println!("image {} created from {distro}", image.name);
            Ok(())
        }
        ImageCommand::Clone { source, name, args } => {
            let image = manager.clone_image(&source, &name, &args.into_options())?;
            println!("image {} cloned from {source}", image.name);
            Ok(())
        }
        ImageCommand::Import { tar, name, args } => {
            let image = manager.import_tar(&tar, &name, &args.into_options())?;
            println!("image {} imported", image.name);
            Ok(())
        }
        ImageCommand::Export { name, out } => {
            manager.export_image(&name, &out, &cancel_on_ctrl_c())?;
            println!("{name} exported to {out}");
            Ok(())
        }
        ImageCommand::Delete { name } => {
            manager.delete_image(&name)?;
            println!("{name} deleted");
            Ok(())
        }
        ImageCommand::Info { name } => {
            let info = manager.get_info(&name)?;
            let image = info.image;
            println!("name:          {}", image.name);
            println!("display name:  {}", image.display_name);
            if let Some(description) = &image.description {
                println!("description:   {description}");
            }
            println!("source:        {}", source_summary(&image.source));
            println!("created:       {}", image.created_at);
            println!("wsl version:   {}", image.wsl_version);
            if let Some(path) = &image.install_path {
                println!("install path:  {}", path.display());
            }
            println!("enabled:       {}", image.enabled);
            if !image.tags.is_empty() {
                println!("tags:          {}", image.tags.join(", "));
            }
            println!("os:            {}", info.os.as_deref().unwrap_or("unknown"));
            println!("kernel:        {}", info.kernel.as_deref().unwrap_or("unknown"));
            println!("memory:        {}", info.memory.as_deref().unwrap_or("unknown"));
            Ok(())
        }
        ImageCommand::Enable { name } => {
            manager.update_properties(
                &name,
                &UpdateProperties {
                    enabled: Some(true),
                    ..Default::default()
                },
            )?;
            println!("{name} enabled");
            Ok(())
        }
        ImageCommand::Disable { name } => {
            manager.update_properties(
                &name,
                &UpdateProperties {
                    enabled: Some(false),
                    ..Default::default()
                },
            )?;
            println!("{name} disabled");
            Ok(())
        }
        ImageCommand::Set {
            name,
            display_name,
            description,
            tags,
        } => {
            if display_name.is_none() && description.is_none() && tags.is_none() {
                return Err(Error::Validation(
                    "nothing to update: pass --display-name, --description, or --tags".into(),
                ));
            }
            manager.update_properties(
                &name,
                &UpdateProperties {
                    display_name,
                    description,
                    enabled: None,
                    tags,
                },
            )?;
            println!("{name} updated");
            Ok(())
        }
    }
}

fn run_profiles(cmd: ProfilesCommand, manager: ImageManager) -> Result<()> {
    match cmd {
        ProfilesCommand::List => {
            for profile in manager.published_profiles()? {
                println!("{:<28} {:?}", profile.id, profile.argv);
            }
            Ok(())
        }
        ProfilesCommand::Sync => {
            manager.list()?;
            manager.sync_profiles()?;
            println!("profiles synchronized");
            Ok(())
        }
    }
}

fn source_summary(source: &crate::index::ImageSource) -> String {
    match source {
        crate::index::ImageSource::Distro { name, .. } => format!("distro:{name}"),
        crate::index::ImageSource::Image { name, .. } => format!("image:{name}"),
        crate::index::ImageSource::ImportedTar { path, .. } => format!("tar:{path}"),
        crate::index::ImageSource::Legacy => "legacy".to_string(),
    }
}

/// A token tripped by Ctrl+C, so long operations unwind through their
/// cleanup paths and the process exits with the cancelled code.
fn cancel_on_ctrl_c() -> CancelToken {
    let token = CancelToken::new();
    let handle = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });
    token
}
