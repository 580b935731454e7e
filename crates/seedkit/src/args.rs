use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use seedkit_lib::builder::SelectionMode;

#[derive(Parser, Debug)]
#[command(version)]
pub struct Arguments {
    /// Configuration file, `./seedkit.toml` is used when it exists
    #[arg(short, long, value_name = "CONFIG_FILE", global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show the piece size chosen for some amount of content
    Plan {
        /// Content size in bytes
        #[arg(value_name = "BYTES")]
        size: u64,
        /// Largest allowed piece size in MiB
        #[arg(long)]
        max_mib: Option<u64>,
        /// Trackers the content is headed to
        #[arg(short, long = "tracker")]
        trackers: Vec<String>,
    },
    /// Hash content into a new descriptor
    Create {
        #[arg(value_name = "CONTENT")]
        path: PathBuf,
        /// Output stem inside the work directory
        #[arg(long, default_value = "BASE")]
        name: String,
        #[arg(long, value_enum, default_value_t = Mode::Auto)]
        mode: Mode,
        /// Files to hash in `keep-folder` and `pack` modes
        #[arg(long = "file")]
        files: Vec<PathBuf>,
        #[arg(long)]
        keep_nfo: bool,
        /// Announce URL to embed
        #[arg(long)]
        tracker_url: Option<String>,
        #[arg(short, long = "tracker")]
        trackers: Vec<String>,
        /// Make the info-hash unique
        #[arg(long)]
        entropy: bool,
        #[arg(long)]
        max_mib: Option<u64>,
    },
    /// Reuse a descriptor from a client when one matches, otherwise hash the content
    Reuse {
        #[arg(value_name = "CONTENT")]
        path: PathBuf,
        /// Release name to search for, defaults to the content's file name
        #[arg(long)]
        release: Option<String>,
        /// Info-hashes to try before searching
        #[arg(long = "hash")]
        hashes: Vec<String>,
        #[arg(long)]
        max_mib: Option<u64>,
    },
    /// Reduce a descriptor to BASE form and optionally derive tracker copies from it
    Canonicalize {
        #[arg(value_name = "TORRENT_FILE")]
        torrent: PathBuf,
        /// Check every declared file against this content first
        #[arg(long)]
        content: Option<PathBuf>,
        /// Write `[TRACKER].torrent` for each
        #[arg(short, long = "tracker")]
        trackers: Vec<String>,
        /// Also write this many randomized copies
        #[arg(long, default_value_t = 0)]
        randomize: u32,
    },
    /// Link content below a client's per-tracker directory
    Link {
        #[arg(value_name = "CONTENT")]
        path: PathBuf,
        #[arg(long)]
        client: String,
        #[arg(short, long)]
        tracker: String,
        /// Lay the content out to match this descriptor
        #[arg(long, value_name = "TORRENT_FILE")]
        cross: Option<PathBuf>,
    },
    /// Add libtorrent fast-resume data to a descriptor
    Resume {
        #[arg(value_name = "TORRENT_FILE")]
        torrent: PathBuf,
        #[arg(value_name = "CONTENT")]
        path: PathBuf,
    },
    /// Hand a descriptor to a client and start seeding
    Inject {
        #[arg(value_name = "TORRENT_FILE")]
        torrent: PathBuf,
        #[arg(value_name = "CONTENT")]
        path: PathBuf,
        #[arg(long)]
        client: String,
        #[arg(short, long)]
        tracker: String,
        /// Add paused and laid out like the descriptor
        #[arg(long)]
        cross: bool,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        tag: Option<String>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum Mode {
    Auto,
    Disc,
    KeepFolder,
    Pack,
}

impl From<Mode> for SelectionMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Auto => SelectionMode::Auto,
            Mode::Disc => SelectionMode::Disc,
            Mode::KeepFolder => SelectionMode::KeepFolder,
            Mode::Pack => SelectionMode::Pack,
        }
    }
}
