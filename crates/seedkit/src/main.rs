mod args;
mod logging;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use args::{Arguments, Command};
use clap::Parser;
use seedkit_lib::builder::{BuildRequest, TorrentBuilder};
use seedkit_lib::canonical::{Canonicalizer, TrackerVariant};
use seedkit_lib::client::{self, TorrentClient};
use seedkit_lib::config::Config;
use seedkit_lib::descriptor::TorrentDescriptor;
use seedkit_lib::guard::{HashingGuard, SessionRegistry};
use seedkit_lib::inject::{InjectRequest, Injector};
use seedkit_lib::link::{LinkEngine, LinkRequest};
use seedkit_lib::piece_size::{self, PieceSizeRequest};
use seedkit_lib::resume::write_resume_file;
use seedkit_lib::search::{Backend, SearchEngine, SearchRequest};

const DEFAULT_CONFIG: &str = "seedkit.toml";

#[tokio::main]
#[tracing::instrument(err)]
async fn main() -> anyhow::Result<()> {
    logging::setup_logger();

    let args = Arguments::parse();
    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Plan {
            size,
            max_mib,
            trackers,
        } => {
            let plan = piece_size::plan(&PieceSizeRequest {
                total_size: size,
                user_max_mib: max_mib.or(config.hashing.max_piece_size_mib),
                trackers: &trackers,
                capped_trackers: &config.hashing.capped_trackers,
            })?;
            println!(
                "{} bytes per piece, {} pieces ({:?})",
                plan.piece_size,
                plan.piece_count(),
                plan.constraint
            );
        }
        Command::Create {
            path,
            name,
            mode,
            files,
            keep_nfo,
            tracker_url,
            trackers,
            entropy,
            max_mib,
        } => {
            let request = BuildRequest {
                output_name: name,
                mode: mode.into(),
                listed_files: files,
                keep_nfo,
                trackers,
                tracker_url,
                entropy,
                user_max_mib: max_mib,
                ..BuildRequest::base(path)
            };
            let outcome = builder(&config)
                .build(&request)
                .await
                .context("failed to build a descriptor")?;
            println!("{} ({})", outcome.path.display(), outcome.descriptor.info_hash_hex()?);
        }
        Command::Reuse {
            path,
            release,
            hashes,
            max_mib,
        } => {
            let release = match release {
                Some(release) => release,
                None => file_name(&path)?,
            };
            let mut search = SearchRequest::new(release, &path);
            if path.is_file() {
                search.file_name = Some(file_name(&path)?);
            }
            search.known_hashes = hashes;
            search.user_max_mib = max_mib;
            let build = BuildRequest {
                user_max_mib: max_mib,
                ..BuildRequest::base(&path)
            };

            let engine = SearchEngine::new(config.search.clone(), canonicalizer(&config), backends(&config)?);
            let prepared = engine
                .reuse_or_build(&builder(&config), &search, &build)
                .await
                .context("failed to prepare a BASE descriptor")?;
            println!("{} ({:?})", prepared.path.display(), prepared.origin);
        }
        Command::Canonicalize {
            torrent,
            content,
            trackers,
            randomize,
        } => {
            let descriptor = TorrentDescriptor::load(&torrent)
                .await
                .with_context(|| format!("failed to read {}", torrent.display()))?;
            let canonicalizer = canonicalizer(&config);
            let base = canonicalizer
                .write_base(&descriptor, content.as_deref(), config.search.skip_nfo)
                .await
                .context("failed to canonicalize")?;
            println!("{}", canonicalizer.base_path().display());

            for tracker in &trackers {
                let variant = TrackerVariant {
                    announce: config.trackers.get(tracker).and_then(|t| t.announce_url.clone()),
                    source: tracker.clone(),
                    ..TrackerVariant::default()
                };
                let (path, _) = canonicalizer
                    .derive_for_tracker(&base, tracker, &variant)
                    .await
                    .with_context(|| format!("failed to derive a descriptor for {tracker}"))?;
                println!("{}", path.display());
            }
            if randomize > 0 {
                for path in canonicalizer.randomize(&base, randomize, base.name()).await? {
                    println!("{}", path.display());
                }
            }
        }
        Command::Link {
            path,
            client,
            tracker,
            cross,
        } => {
            let client_config = config.client(&client)?;
            let cross_seed = match cross {
                Some(torrent) => Some(TorrentDescriptor::load(&torrent).await?),
                None => None,
            };
            let result = LinkEngine::for_client(client_config)
                .link(&LinkRequest {
                    content_path: path,
                    link_dir_name: config.link_dir_name(&tracker).to_owned(),
                    cross_seed,
                })
                .await
                .context("failed to link content")?;
            println!("{}", result.content_path.display());
        }
        Command::Resume { torrent, path } => {
            let resume = write_resume_file(&torrent, &path)
                .await
                .context("failed to add fast-resume data")?;
            println!("{}", resume.display());
        }
        Command::Inject {
            torrent,
            path,
            client,
            tracker,
            cross,
            category,
            tag,
        } => {
            let client_config = config.client(&client)?;
            let backend = client::connect(&client, client_config, Arc::new(SessionRegistry::new()))?;
            let mut request = InjectRequest::new(&config, torrent, path, &tracker);
            request.cross_seed = cross;
            request.category = category;
            request.tag = tag;
            let outcome = Injector::new(backend, client_config)?
                .inject(&request)
                .await
                .context("failed to add the torrent")?;
            println!("{} -> {}", outcome.hash, outcome.save_path.path);
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load(path).with_context(|| format!("failed to load {}", path.display())),
        None if Path::new(DEFAULT_CONFIG).is_file() => {
            Config::load(Path::new(DEFAULT_CONFIG)).context("failed to load the default config")
        }
        None => Ok(Config::default()),
    }
}

fn file_name(path: &Path) -> anyhow::Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", path.display()))
}

fn builder(config: &Config) -> TorrentBuilder {
    TorrentBuilder::new(config.hashing.clone(), &config.work_dir, HashingGuard::new())
}

fn canonicalizer(config: &Config) -> Canonicalizer {
    Canonicalizer::new(&config.work_dir, config.hashing.source.clone())
}

/// Clients to search, in the configured order.
fn backends(config: &Config) -> anyhow::Result<Vec<Backend>> {
    let sessions = Arc::new(SessionRegistry::new());
    let names: Vec<String> = if config.search.client_order.is_empty() {
        config
            .clients
            .iter()
            .filter(|(_, client)| client.enable_search)
            .map(|(name, _)| name.clone())
            .collect()
    } else {
        config.search.client_order.clone()
    };

    names
        .iter()
        .map(|name| {
            let client_config = config.client(name)?;
            let client: Arc<dyn TorrentClient> = client::connect(name, client_config, sessions.clone())?;
            Ok(Backend {
                client,
                storage_dir: client_config.torrent_storage_dir.clone(),
            })
        })
        .collect()
}

