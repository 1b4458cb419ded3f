//! filesh: end-to-end encrypted file sharing CLI
//!
//! Commands:
//!   send <file>...          - encrypt, upload and print a share link
//!   resume <batch>          - continue a paused or failed upload
//!   receive <link> [<dir>]  - download and decrypt a shared batch
//!   status [<batch>]        - show local upload state
//!   link <batch>            - print the share link of an upload again
//!   cancel <batch>          - forget an upload and its spooled ciphertext
//!   cleanup                 - purge local records past the retention window
//!   config show             - display current configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use filesh_core::config::FileshConfig;
use filesh_storage::{ObjectStore, RetryPolicy};
use filesh_transfer::{
    BatchApi, ChunkStatus, DownloadManager, HttpApi, ProgressFn, Spool, StorageApi, TransferError,
    TransferResult, TransferStore, UploadManager, UploadSource, UploadSummary,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "filesh",
    version,
    about = "End-to-end encrypted file sharing",
    long_about = "filesh: files are encrypted locally, uploaded in chunks and shared by link; \
                  the key travels only in the link fragment"
)]
struct Cli {
    /// Path to filesh.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "FILESH_CONFIG",
        default_value = "~/.config/filesh/config.toml"
    )]
    config: PathBuf,

    /// Path to the transfer state JSON file (overrides client.state_path)
    #[arg(long, global = true, env = "FILESH_STATE_PATH")]
    state: Option<PathBuf>,

    /// Talk to object storage directly instead of a filesh server
    ///
    /// Uses storage.* from the config and FILESH_ACCESS_KEY_ID /
    /// FILESH_SECRET_ACCESS_KEY (or the AWS_* names) for credentials.
    #[arg(long, global = true)]
    direct: bool,

    /// Log level for diagnostics on stderr
    #[arg(long, global = true, env = "FILESH_LOG", default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt and upload files as one batch, then print its share link
    Send {
        /// Files to send
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Base URL for the share link (overrides client.share_base_url)
        #[arg(long)]
        share_url: Option<String>,
    },

    /// Continue an interrupted, paused or failed upload
    Resume {
        batch_id: String,
        #[arg(long)]
        share_url: Option<String>,
    },

    /// Download and decrypt every file of a shared batch
    Receive {
        /// Share link (`...?batch={batchId}&key={key}&meta={meta}`)
        link: String,
        /// Destination directory (default: current directory)
        #[arg(default_value = ".")]
        dest: PathBuf,
        /// Try to repair streams that fail authentication
        #[arg(long)]
        recover: bool,
    },

    /// Show local upload state
    Status {
        /// Batch to inspect (default: list all)
        batch_id: Option<String>,
        /// Also ask the server what it holds for the batch
        #[arg(long)]
        remote: bool,
    },

    /// Print the share link of a local upload
    Link {
        batch_id: String,
        #[arg(long)]
        share_url: Option<String>,
    },

    /// Stop tracking an upload and delete its spooled ciphertext
    Cancel { batch_id: String },

    /// Purge local records and spool files older than transfer.retention_days
    Cleanup,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log);

    let config_path = expand_tilde(&cli.config);
    let config = FileshConfig::load(&config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;

    let state = cli.state.clone();
    let open = || Session::open(config.clone(), state.as_deref(), cli.direct);

    match cli.command {
        Commands::Send { files, share_url } => cmd_send(&open()?, files, share_url).await,
        Commands::Resume {
            batch_id,
            share_url,
        } => cmd_resume(&open()?, &batch_id, share_url).await,
        Commands::Receive {
            link,
            dest,
            recover,
        } => cmd_receive(&open()?, &link, &dest, recover).await,
        Commands::Status { batch_id, remote } => {
            cmd_status(&open()?, batch_id.as_deref(), remote).await
        }
        Commands::Link {
            batch_id,
            share_url,
        } => cmd_link(&open()?, &batch_id, share_url).await,
        Commands::Cancel { batch_id } => cmd_cancel(&open()?, &batch_id).await,
        Commands::Cleanup => cmd_cleanup(&open()?).await,
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path),
    }
}

fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

// ── Shared setup ──────────────────────────────────────────────────────────────

/// Store, spool and API handle shared by the transfer commands
struct Session {
    config: FileshConfig,
    api: Arc<dyn BatchApi>,
    store: TransferStore,
    spool: Spool,
}

impl Session {
    fn open(config: FileshConfig, state_override: Option<&Path>, direct: bool) -> Result<Self> {
        let api = build_api(&config, direct)?;

        let state_path = state_override
            .map(Path::to_path_buf)
            .unwrap_or_else(|| expand_tilde(&config.client.state_path));
        let store = TransferStore::open_json(&state_path)
            .with_context(|| format!("opening transfer state {}", state_path.display()))?;
        let spool = Spool::new(&expand_tilde(&config.client.spool_dir));

        Ok(Self {
            config,
            api,
            store,
            spool,
        })
    }

    fn uploader(&self) -> UploadManager {
        UploadManager::new(
            self.api.clone(),
            self.store.clone(),
            self.spool.clone(),
            self.config.transfer.clone(),
        )
    }

    fn share_base<'a>(&'a self, share_url: Option<&'a str>) -> &'a str {
        share_url.unwrap_or(&self.config.client.share_base_url)
    }
}

fn build_api(config: &FileshConfig, direct: bool) -> Result<Arc<dyn BatchApi>> {
    if direct {
        let (access_key, secret_key) = filesh_storage::operator::credentials_from_env().context(
            "S3 credentials not set\n\
             Set FILESH_ACCESS_KEY_ID and FILESH_SECRET_ACCESS_KEY environment variables.",
        )?;
        let op = filesh_storage::build_from_core_config(&config.storage, &access_key, &secret_key)
            .context("building storage operator")?;
        let store = ObjectStore::new(op, RetryPolicy::from_config(&config.storage));
        return Ok(Arc::new(StorageApi::new(store)));
    }

    let api = HttpApi::new(&config.client.api_url)
        .with_context(|| format!("API endpoint {}", config.client.api_url))?;
    Ok(Arc::new(api))
}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

fn make_progress_bar(prefix: &str, template: &str) -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(style(template));
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn progress_fn(pb: &ProgressBar) -> ProgressFn {
    let pb = pb.clone();
    Arc::new(move |done: u64, total: u64, msg: &str| {
        pb.set_length(total);
        pb.set_position(done);
        pb.set_message(msg.to_string());
    })
}

/// Run a transfer; Ctrl-C calls `on_interrupt` and waits for the transfer
/// to wind down and persist its state.
async fn until_interrupted<T>(
    transfer: impl Future<Output = TransferResult<T>>,
    on_interrupt: impl FnOnce(),
) -> TransferResult<T> {
    tokio::pin!(transfer);
    tokio::select! {
        result = &mut transfer => result,
        _ = tokio::signal::ctrl_c() => {
            on_interrupt();
            transfer.await
        }
    }
}

// ── `filesh send` / `filesh resume` ───────────────────────────────────────────

async fn cmd_send(ctx: &Session, files: Vec<PathBuf>, share_url: Option<String>) -> Result<()> {
    for path in &files {
        if !path.is_file() {
            anyhow::bail!("not a file: {}", path.display());
        }
    }

    let pb = make_progress_bar("send", "{prefix:.bold} {spinner} {msg}");
    pb.set_message(format!("encrypting {} file(s)...", files.len()));

    let manager = ctx.uploader().with_progress(progress_fn(&pb));
    let sources = files.into_iter().map(UploadSource::Path).collect();
    let upload = manager.prepare(sources).await.context("preparing upload")?;

    pb.set_style(style(
        "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
    ));
    let batch_id = upload.batch_id.clone();
    let result = until_interrupted(manager.run(&batch_id), || {
        manager.pause(&batch_id);
    })
    .await;

    finish_upload(ctx, &manager, &pb, &batch_id, result, share_url.as_deref()).await
}

async fn cmd_resume(ctx: &Session, batch_id: &str, share_url: Option<String>) -> Result<()> {
    let pb = make_progress_bar(
        "resume",
        "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
    );
    let manager = ctx.uploader().with_progress(progress_fn(&pb));

    let result = until_interrupted(manager.resume(batch_id), || {
        manager.pause(batch_id);
    })
    .await;

    finish_upload(ctx, &manager, &pb, batch_id, result, share_url.as_deref()).await
}

async fn finish_upload(
    ctx: &Session,
    manager: &UploadManager,
    pb: &ProgressBar,
    batch_id: &str,
    result: TransferResult<UploadSummary>,
    share_url: Option<&str>,
) -> Result<()> {
    match result {
        Ok(summary) => {
            pb.finish_with_message("done");
            let link = manager
                .share_link(batch_id, ctx.share_base(share_url))
                .await
                .context("building share link")?;

            println!();
            println!("Upload complete:");
            println!("  batch:   {}", summary.batch_id);
            println!("  files:   {}", summary.files);
            println!("  chunks:  {} ({} sent now)", summary.chunks, summary.transferred);
            println!("  bytes:   {}", fmt_bytes(summary.bytes));
            println!();
            println!("{link}");
            Ok(())
        }
        Err(TransferError::Paused(_)) => {
            pb.abandon_with_message("paused");
            println!("Upload paused. Continue with: filesh resume {batch_id}");
            Ok(())
        }
        Err(e) => {
            pb.abandon_with_message("failed");
            Err(e).context("upload failed")
        }
    }
}

// ── `filesh receive` ──────────────────────────────────────────────────────────

async fn cmd_receive(ctx: &Session, link: &str, dest: &Path, recover: bool) -> Result<()> {
    let pb = make_progress_bar(
        "receive",
        "{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}",
    );
    let manager = DownloadManager::new(ctx.api.clone(), ctx.config.transfer.clone())
        .with_store(ctx.store.clone())
        .with_recovery(recover)
        .with_progress(progress_fn(&pb));

    tokio::fs::create_dir_all(dest)
        .await
        .with_context(|| format!("creating {}", dest.display()))?;

    let result = until_interrupted(manager.download(link, dest), || {
        manager.registry().cancel_all();
    })
    .await;

    let summary = match result {
        Ok(summary) => {
            pb.finish_with_message("done");
            summary
        }
        Err(e) => {
            pb.abandon_with_message("failed");
            return Err(e).context("download failed");
        }
    };

    println!();
    println!("Received batch {}:", summary.batch_id);
    for file in &summary.files {
        println!("  {}", file.path.display());
        println!("    size:   {}", fmt_bytes(file.bytes));
        println!("    sha256: {}", file.sha256);
        if let Some(strategy) = file.recovered {
            println!("    note:   stream repaired ({strategy})");
        }
    }
    Ok(())
}

// ── `filesh status` ───────────────────────────────────────────────────────────

async fn cmd_status(ctx: &Session, batch_id: Option<&str>, remote: bool) -> Result<()> {
    let Some(batch_id) = batch_id else {
        let uploads = ctx.store.list_uploads().await;
        if uploads.is_empty() {
            println!("No uploads recorded.");
            return Ok(());
        }
        println!(
            "{:<36}  {:<10}  {:>5}  {:>21}  updated",
            "batch", "status", "files", "uploaded"
        );
        for upload in uploads {
            println!(
                "{:<36}  {:<10}  {:>5}  {:>21}  {}",
                upload.batch_id,
                format!("{:?}", upload.status).to_lowercase(),
                upload.file_ids.len(),
                format!(
                    "{}/{}",
                    fmt_bytes(upload.uploaded_size),
                    fmt_bytes(upload.total_size)
                ),
                upload.updated_at.format("%Y-%m-%d %H:%M:%S"),
            );
        }
        return Ok(());
    };

    let upload = ctx
        .store
        .get_upload(batch_id)
        .await
        .with_context(|| format!("no local upload state for batch {batch_id}"))?;
    let chunks = ctx.store.chunks_for(batch_id).await;
    let count = |status: ChunkStatus| chunks.iter().filter(|c| c.status == status).count();

    println!("Batch {}", upload.batch_id);
    println!("  status:    {:?}", upload.status);
    println!(
        "  uploaded:  {} / {}",
        fmt_bytes(upload.uploaded_size),
        fmt_bytes(upload.total_size)
    );
    println!(
        "  chunks:    {} completed, {} pending, {} failed (of {})",
        count(ChunkStatus::Completed),
        count(ChunkStatus::Pending) + count(ChunkStatus::Uploading),
        count(ChunkStatus::Error),
        chunks.len()
    );
    println!("  created:   {}", upload.created_at.to_rfc3339());
    println!("  updated:   {}", upload.updated_at.to_rfc3339());
    if let Some(err) = &upload.last_error {
        println!("  error:     {err}");
    }
    println!("  files:");
    for meta in &upload.metadata {
        println!("    {} ({}, {})", meta.name, fmt_bytes(meta.size), meta.mime_type);
    }

    if remote {
        match ctx.api.batch_info(batch_id).await {
            Ok(info) => {
                println!("  server:");
                println!("    chunks:  {}", info.chunks_count);
                println!("    bytes:   {}", fmt_bytes(info.total_size));
                println!("    expires: {}", info.expires_at.to_rfc3339());
            }
            Err(TransferError::NotFound(_)) => println!("  server:    no chunks stored"),
            Err(e) => return Err(e).context("querying server"),
        }
    }
    Ok(())
}

// ── `filesh link` / `filesh cancel` / `filesh cleanup` ────────────────────────

async fn cmd_link(ctx: &Session, batch_id: &str, share_url: Option<String>) -> Result<()> {
    let link = ctx
        .uploader()
        .share_link(batch_id, ctx.share_base(share_url.as_deref()))
        .await?;
    println!("{link}");
    Ok(())
}

async fn cmd_cancel(ctx: &Session, batch_id: &str) -> Result<()> {
    if ctx.uploader().cancel(batch_id).await? {
        println!("Cancelled {batch_id}");
    } else {
        println!("No local upload state for {batch_id}");
    }
    Ok(())
}

async fn cmd_cleanup(ctx: &Session) -> Result<()> {
    let purged = ctx.uploader().cleanup().await.context("cleanup")?;
    println!(
        "Purged {} batch(es) older than {} days",
        purged.len(),
        ctx.config.transfer.retention_days
    );
    for batch_id in purged {
        println!("  {batch_id}");
    }
    Ok(())
}

// ── `filesh config show` ──────────────────────────────────────────────────────

fn cmd_config_show(config: &FileshConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!(
            "# Configuration: defaults (no file at {})",
            config_path.display()
        );
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
