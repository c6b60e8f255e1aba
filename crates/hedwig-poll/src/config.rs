use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use hedwig_core::{AttachmentKind, AttachmentState};
use hedwig_db::DbConfig;

/// Upper bound for `reset-stuck --older-than-minutes`, one hundred years.
pub const MAX_STUCK_MINUTES: i64 = 100 * 365 * 24 * 60;

#[derive(Debug, Parser)]
#[command(name = "hedwig-poll", about = "Hedwig attachment processing poll")]
pub struct Cli {
    #[command(flatten)]
    pub storage: StorageArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Args)]
pub struct StorageArgs {
    /// Postgres connection URL. SQLite is used when unset.
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// SQLite database file
    #[arg(long, env = "HEDWIG_DB_PATH", global = true)]
    pub db_path: Option<PathBuf>,

    /// Directory holding uploaded content and derived products
    #[arg(long, env = "HEDWIG_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,
}

impl StorageArgs {
    pub fn db_config(&self) -> DbConfig {
        DbConfig {
            database_url: self.database_url.clone(),
            sqlite_path: self
                .db_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        }
    }

    /// Object store root, `<data_dir>/store` by default.
    pub fn store_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(hedwig_db::data_dir)
            .join("store")
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Process new attachments
    Poll(PollArgs),
    /// Register a local file as a new attachment
    Enqueue(EnqueueArgs),
    /// Move an attachment in error (or stuck processing) back to new
    Reset {
        id: i64,
    },
    /// Reset every attachment processing for longer than the threshold
    ResetStuck {
        #[arg(
            long,
            default_value = "60",
            value_parser = clap::value_parser!(i64).range(0..=MAX_STUCK_MINUTES)
        )]
        older_than_minutes: i64,
    },
    /// Show attachment counts per kind and state
    Status,
    /// List attachments
    List {
        #[arg(long, value_parser = parse_state)]
        state: Option<AttachmentState>,
        #[arg(long, value_parser = parse_kind)]
        task: Option<AttachmentKind>,
        #[arg(long, default_value = "50")]
        limit: i64,
    },
}

#[derive(Debug, Clone, Args)]
pub struct PollArgs {
    /// Attachment kind to process. Repeat for several; defaults to all.
    #[arg(long = "task", value_parser = parse_kind)]
    pub tasks: Vec<AttachmentKind>,

    /// Seconds to sleep between cycles. Without it a single cycle runs.
    #[arg(long)]
    pub pause: Option<u64>,

    /// Select and process but record nothing
    #[arg(long)]
    pub dry_run: bool,

    /// PID file guarding against concurrent poll processes
    #[arg(long, env = "HEDWIG_PIDFILE")]
    pub pidfile: Option<PathBuf>,

    /// Serve /health on this port while polling
    #[arg(long, env = "HEDWIG_HEALTH_PORT")]
    pub health_port: Option<u16>,

    #[command(flatten)]
    pub tools: ToolConfig,
}

impl PollArgs {
    /// Enabled kinds, in processing order.
    pub fn kinds(&self) -> Vec<AttachmentKind> {
        if self.tasks.is_empty() {
            return AttachmentKind::ALL.to_vec();
        }
        let mut kinds = self.tasks.clone();
        kinds.sort();
        kinds.dedup();
        kinds
    }

    pub fn pause(&self) -> Option<Duration> {
        self.pause.map(Duration::from_secs)
    }

    pub fn pidfile(&self, storage: &StorageArgs) -> PathBuf {
        self.pidfile.clone().unwrap_or_else(|| {
            storage
                .data_dir
                .clone()
                .unwrap_or_else(hedwig_db::data_dir)
                .join("hedwig-poll.pid")
        })
    }
}

#[derive(Debug, Clone, Args)]
pub struct EnqueueArgs {
    #[arg(long, value_parser = parse_kind)]
    pub task: AttachmentKind,

    /// Owning proposal id
    #[arg(long, conflicts_with = "review", required_unless_present = "review")]
    pub proposal: Option<i64>,

    /// Owning review id
    #[arg(long)]
    pub review: Option<i64>,

    pub file: PathBuf,
}

/// External tool settings shared by the processors.
#[derive(Debug, Clone, Args)]
pub struct ToolConfig {
    /// Ghostscript binary
    #[arg(long, env = "HEDWIG_GS", default_value = "gs")]
    pub gs: String,

    /// ImageMagick convert binary
    #[arg(long, env = "HEDWIG_CONVERT", default_value = "convert")]
    pub convert: String,

    /// Per-invocation tool timeout (seconds)
    #[arg(long, env = "HEDWIG_TOOL_TIMEOUT", default_value = "120")]
    pub tool_timeout: u64,

    /// Grace period after SIGTERM before SIGKILL (seconds)
    #[arg(long, env = "HEDWIG_KILL_GRACE", default_value = "5")]
    pub kill_grace_period: u64,

    /// Resolution of rendered PDF pages and rasterised vector figures (dpi)
    #[arg(long, default_value = "100")]
    pub resolution: u32,

    /// Reject PDFs with more pages than this
    #[arg(long, env = "HEDWIG_PDF_MAX_PAGES", default_value = "100")]
    pub pdf_max_pages: u32,

    /// Render previews for at most this many pages
    #[arg(long, default_value = "20")]
    pub pdf_preview_pages: u32,

    /// Bounding box of figure thumbnails (pixels)
    #[arg(long, default_value = "200")]
    pub thumbnail_size: u32,

    /// Bounding box of figure previews (pixels)
    #[arg(long, default_value = "1000")]
    pub preview_size: u32,
}

impl ToolConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_period)
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            gs: "gs".into(),
            convert: "convert".into(),
            tool_timeout: 120,
            kill_grace_period: 5,
            resolution: 100,
            pdf_max_pages: 100,
            pdf_preview_pages: 20,
            thumbnail_size: 200,
            preview_size: 1000,
        }
    }
}

fn parse_kind(s: &str) -> Result<AttachmentKind, String> {
    AttachmentKind::parse_str(s).ok_or_else(|| {
        let known: Vec<&str> = AttachmentKind::ALL.iter().map(|k| k.as_str()).collect();
        format!("unknown task '{s}' (expected one of: {})", known.join(", "))
    })
}

fn parse_state(s: &str) -> Result<AttachmentState, String> {
    AttachmentState::parse_str(s).ok_or_else(|| format!("unknown state '{s}'"))
}
