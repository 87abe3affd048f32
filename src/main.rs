use clap::{Parser, Subcommand};
use folder_vault::backup::archive::list_archives;
use folder_vault::backup::backup_config::BackupConfig;
use folder_vault::backup::redacted::RedactedString;
use folder_vault::backup::restore::list_entries;
use folder_vault::backup::result_error::error::Error;
use folder_vault::backup::result_error::result::Result;
use folder_vault::backup::service::BackupService;
use std::path::PathBuf;
use std::process::exit;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Incremental encrypted folder backups, triggered by changes
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of config file (.json, .yml or .yaml)
    #[arg(short, long, default_value = "backup_config.json")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up configured source directories now (all of them when none is given)
    Backup { sources: Vec<PathBuf> },
    /// Extract one archive
    Restore {
        archive: PathBuf,
        destination: PathBuf,
        /// Defaults to the password configured for the archive's destination directory
        #[arg(short, long)]
        password: Option<String>,
    },
    /// Rebuild the latest backed-up state of a source from its whole archive history
    RestoreSnapshot {
        source: PathBuf,
        destination: PathBuf,
        #[arg(short, long)]
        password: Option<String>,
    },
    /// Show the recorded backups of configured sources
    History { source: Option<PathBuf> },
    /// List archives in a destination directory, or the members of one archive
    List { path: PathBuf },
    /// Watch directories and back them up once they go quiet; press Enter to stop
    Watch { directories: Vec<PathBuf> },
    /// Edit the list of watched directories
    Monitor {
        #[command(subcommand)]
        action: MonitorAction,
    },
}

#[derive(Subcommand, Debug)]
enum MonitorAction {
    Add { directory: PathBuf },
    Remove { directory: PathBuf },
    List,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    if let Err(e) = run(args) {
        error!(category = %e.category(), "{e}");
        exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    // Listing needs no configuration.
    if let Command::List { path } = &args.command {
        let names: Vec<String> = if path.is_dir() {
            list_archives(path)?
                .into_iter()
                .map(|p| p.display().to_string())
                .collect()
        } else {
            list_entries(path)?
        };
        names.iter().for_each(|name| println!("{name}"));
        return Ok(());
    }

    let service = BackupService::new(BackupConfig::load(&args.config)?)?;
    match args.command {
        Command::Backup { sources } => {
            let sources = if sources.is_empty() {
                service
                    .config()
                    .directories
                    .iter()
                    .map(|pair| pair.source.clone())
                    .collect()
            } else {
                sources
            };
            for source in sources {
                let record = service.backup_configured(&source)?;
                info!(
                    source = ?source,
                    archive = ?record.last_archive_path(),
                    files = record.file_records().len(),
                    "Backup stored"
                );
            }
        }
        Command::Restore {
            archive,
            destination,
            password,
        } => {
            let password = password.map(RedactedString::from);
            let password = password
                .as_ref()
                .or_else(|| service.configured_password_for(&archive));
            let restored = service.restore_backup(&archive, &destination, password)?;
            info!(archive = ?archive, "Restored {restored} entries into {:?}", destination);
        }
        Command::RestoreSnapshot {
            source,
            destination,
            password,
        } => {
            let password = password.map(RedactedString::from);
            let password = password.as_ref().or_else(|| {
                service
                    .config()
                    .pair_for(&source)
                    .and_then(|pair| pair.password.as_ref())
            });
            let restored = service.restore_snapshot(&source, &destination, password)?;
            info!(source = ?source, "Restored {restored} entries into {:?}", destination);
        }
        Command::History { source } => {
            let sources = match source {
                Some(source) => vec![source],
                None => service
                    .config()
                    .directories
                    .iter()
                    .map(|pair| pair.source.clone())
                    .collect(),
            };
            for source in sources {
                match service.history(&source)? {
                    None => println!("{}: never backed up", source.display()),
                    Some(record) => {
                        println!(
                            "{}: {} files, last run {}, last archive {} bytes",
                            source.display(),
                            record.file_records().len(),
                            record.last_run_timestamp(),
                            record.archive_size_bytes()
                        );
                        for archive in record.archives_newest_first() {
                            println!("  {}", archive.display());
                        }
                    }
                }
            }
        }
        Command::Watch { directories } => {
            let directories = if directories.is_empty() {
                service.default_watch_directories()?
            } else {
                directories
            };
            let handle = service.start_watch(&directories)?;
            info!("Watching {} directories, press Enter to stop", directories.len());
            let mut line = String::new();
            if let Err(e) = std::io::stdin().read_line(&mut line) {
                error!("Reading stdin failed, stopping: {e}");
            }
            service.stop_watch(handle);
        }
        Command::Monitor { action } => {
            let mut watch_set = service.watch_set()?;
            match action {
                MonitorAction::Add { directory } => {
                    if service.config().pair_for(&directory).is_none() {
                        return Err(Error::Configuration(format!(
                            "{:?} is not a configured source directory",
                            directory
                        )));
                    }
                    if !watch_set.add(directory.clone())? {
                        info!("{:?} is already watched", directory);
                    }
                }
                MonitorAction::Remove { directory } => {
                    if !watch_set.remove(&directory)? {
                        info!("{:?} was not watched", directory);
                    }
                }
                MonitorAction::List => watch_set
                    .directories()
                    .iter()
                    .for_each(|dir| println!("{}", dir.display())),
            }
        }
        Command::List { .. } => {}
    }
    Ok(())
}
