use anyhow::{Context, Result};
use cipherblob::{
    blob_ops::BlobOps,
    config,
    dir_blob::DirEntry,
    file_storage::FileBlobStorage,
    Capability,
};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::task;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const FILE_MIME_TYPE: &str = "application/octet-stream";

/// cipherblob - Convergently encrypted, content-addressed blob storage
#[derive(Parser)]
#[command(name = "cipherblob")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.json")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize cipherblob (write config and create the storage directory)
    Init {
        /// Storage directory path
        #[arg(short, long, default_value = "./blobs")]
        storage_dir: String,

        /// Split file block size in bytes
        #[arg(short, long)]
        block_size: Option<usize>,
    },

    /// Store a file, or a directory recursively, and print its capability
    Put {
        /// File or directory to store
        input: PathBuf,
    },

    /// Restore a file, or a directory when an output path is given
    Get {
        /// Capability printed by `put`
        capability: String,

        /// Output path (files default to stdout, directories are listed)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List the entries of a stored directory
    Ls {
        /// Directory capability
        capability: String,
    },

    /// Show storage status and statistics
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured logging
    // Use RUST_LOG environment variable to control log level (e.g., RUST_LOG=info,cipherblob=debug)
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();
    info!(command = ?cli.command, "cipherblob starting");

    match cli.command {
        Commands::Init {
            storage_dir,
            block_size,
        } => cmd_init(&cli.config, &storage_dir, block_size).await,

        Commands::Put { input } => cmd_put(&cli.config, input).await,

        Commands::Get { capability, output } => cmd_get(&cli.config, &capability, output).await,

        Commands::Ls { capability } => cmd_ls(&cli.config, &capability).await,

        Commands::Status => cmd_status(&cli.config).await,
    }
}

/// Create a styled progress bar for file operations
fn create_progress_bar(total: u64, message: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({percent}%) {msg}")?
            .progress_chars("#>-"),
    );
    pb.set_message(message.to_string());
    Ok(pb)
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    Ok(pb)
}

fn open_ops(config_path: &str) -> Result<(config::Config, BlobOps)> {
    let cfg = config::Config::load_with_env(Some(config_path))?;
    let ops = BlobOps::open(&cfg)
        .with_context(|| format!("opening blob storage at '{}'", cfg.storage_dir))?;
    Ok((cfg, ops))
}

fn parse_capability(text: &str) -> Result<Capability> {
    text.parse()
        .with_context(|| format!("'{}' is not a capability", text))
}

/// Initialize cipherblob configuration and storage
async fn cmd_init(config_path: &str, storage_dir: &str, block_size: Option<usize>) -> Result<()> {
    println!("Initializing cipherblob...");

    let mut cfg = config::Config::new(storage_dir);
    if let Some(block_size) = block_size {
        cfg.block_size = block_size;
    }
    cfg.validate()?;

    if fs::try_exists(config_path).await.unwrap_or(false) {
        anyhow::bail!(
            "Configuration file '{}' already exists. Remove it first or use a different path.",
            config_path
        );
    }

    fs::create_dir_all(storage_dir)
        .await
        .with_context(|| format!("creating storage directory '{}'", storage_dir))?;

    let config_json = serde_json::to_string_pretty(&cfg)?;
    fs::write(config_path, config_json)
        .await
        .with_context(|| format!("writing config to '{}'", config_path))?;

    println!("Initialization complete!");
    println!("Config:     {}", config_path);
    println!("Storage:    {}", storage_dir);
    println!("Block size: {} bytes", cfg.block_size);
    println!();
    println!("IMPORTANT: Capabilities printed by `put` are the only way to read");
    println!("your data back. Anyone holding one can read what it points to.");

    Ok(())
}

/// Store a directory tree bottom-up, returning the root capability
fn put_dir(ops: &BlobOps, path: &Path, spinner: &ProgressBar) -> Result<(Capability, u64)> {
    let mut entries = Vec::new();
    let mut files = 0;

    for item in std::fs::read_dir(path).with_context(|| format!("reading {:?}", path))? {
        let item = item?;
        let name = item
            .file_name()
            .into_string()
            .map_err(|n| anyhow::anyhow!("file name {:?} is not valid UTF-8", n))?;
        let file_type = item.file_type()?;
        let child = item.path();

        if file_type.is_dir() {
            let (capability, count) = put_dir(ops, &child, spinner)?;
            entries.push(DirEntry::directory(name, capability));
            files += count;
        } else if file_type.is_file() {
            spinner.set_message(format!("Storing {}", child.display()));
            let mut reader =
                BufReader::new(File::open(&child).with_context(|| format!("opening {:?}", child))?);
            let (capability, _) = ops.write_file_stream(&mut reader)?;
            entries.push(DirEntry::new(name, FILE_MIME_TYPE, capability));
            files += 1;
        } else {
            warn!(path = %child.display(), "skipping entry that is neither file nor directory");
        }
    }

    Ok((ops.write_dir(entries)?, files))
}

/// Store a file or directory
async fn cmd_put(config_path: &str, input: PathBuf) -> Result<()> {
    let (_, ops) = open_ops(config_path)?;

    let meta = fs::metadata(&input)
        .await
        .with_context(|| format!("reading metadata for {:?}", input))?;

    let capability = if meta.is_dir() {
        let spinner = create_spinner(&format!("Storing {}...", input.display()))?;
        let pb = spinner.clone();
        let path = input.clone();
        let (capability, files) =
            task::spawn_blocking(move || put_dir(&ops, &path, &pb)).await??;
        spinner.finish_with_message(format!("Stored {} files", files));
        capability
    } else {
        let pb = create_progress_bar(meta.len(), "Storing")?;
        let reader_pb = pb.clone();
        let path = input.clone();
        let (capability, bytes) = task::spawn_blocking(move || -> Result<_> {
            let file = File::open(&path).with_context(|| format!("opening {:?}", path))?;
            let mut reader = reader_pb.wrap_read(BufReader::new(file));
            Ok(ops.write_file_stream(&mut reader)?)
        })
        .await??;
        pb.finish_with_message(format!("Stored {} bytes", bytes));
        capability
    };

    println!("{}", capability);
    Ok(())
}

/// Reject entry names that would escape the output directory
fn safe_component(name: &str) -> Result<&str> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(name),
        _ => anyhow::bail!("refusing to restore unsafe entry name {:?}", name),
    }
}

/// Restore a directory tree, returning the number of files written
fn restore_dir(ops: &BlobOps, capability: &Capability, dest: &Path, pb: &ProgressBar) -> Result<u64> {
    std::fs::create_dir_all(dest).with_context(|| format!("creating {:?}", dest))?;
    let mut files = 0;

    for entry in ops.read_dir(capability)? {
        let target = dest.join(safe_component(&entry.name)?);
        if entry.is_dir() {
            files += restore_dir(ops, &entry.capability, &target, pb)?;
        } else {
            pb.set_message(format!("Restoring {}", target.display()));
            let file = File::create(&target).with_context(|| format!("creating {:?}", target))?;
            let mut writer = BufWriter::new(file);
            ops.read_file_stream(&entry.capability, &mut writer)?;
            writer.flush()?;
            files += 1;
        }
    }

    Ok(files)
}

fn print_entries(entries: &[DirEntry]) {
    println!("{:<32} {:<30} CAPABILITY", "NAME", "TYPE");
    println!("{}", "-".repeat(72));
    for entry in entries {
        let name = if entry.is_dir() {
            format!("{}/", entry.name)
        } else {
            entry.name.clone()
        };
        println!("{:<32} {:<30} {}", name, entry.mime_type, entry.capability);
    }
}

/// Restore a file or directory
async fn cmd_get(config_path: &str, capability: &str, output: Option<PathBuf>) -> Result<()> {
    let (_, ops) = open_ops(config_path)?;
    let capability = parse_capability(capability)?;

    let spinner = create_spinner(&format!("Reading {}...", capability.bid))?;
    let probe = ops.clone();
    let cap = capability.clone();
    let blob_type = task::spawn_blocking(move || probe.blob_type(&cap)).await??;

    match (blob_type, output) {
        (t, Some(output)) if t.is_dir() => {
            let pb = spinner.clone();
            let dest = output.clone();
            let files =
                task::spawn_blocking(move || restore_dir(&ops, &capability, &dest, &pb)).await??;
            spinner.finish_with_message(format!("Restored {} files -> {:?}", files, output));
        }
        (t, None) if t.is_dir() => {
            spinner.finish_and_clear();
            let entries = task::spawn_blocking(move || ops.read_dir(&capability)).await??;
            print_entries(&entries);
        }
        (_, Some(output)) => {
            let dest = output.clone();
            let bytes = task::spawn_blocking(move || -> Result<u64> {
                let file = File::create(&dest).with_context(|| format!("creating {:?}", dest))?;
                let mut writer = BufWriter::new(file);
                let bytes = ops.read_file_stream(&capability, &mut writer)?;
                writer.flush()?;
                Ok(bytes)
            })
            .await??;
            spinner.finish_with_message(format!("Restored {} bytes -> {:?}", bytes, output));
        }
        (_, None) => {
            spinner.finish_and_clear();
            let bytes = task::spawn_blocking(move || -> Result<u64> {
                let stdout = io::stdout();
                let mut writer = stdout.lock();
                let bytes = ops.read_file_stream(&capability, &mut writer)?;
                writer.flush()?;
                Ok(bytes)
            })
            .await??;
            eprintln!("Restored {} bytes to stdout", bytes);
        }
    }

    Ok(())
}

/// List a stored directory
async fn cmd_ls(config_path: &str, capability: &str) -> Result<()> {
    let (_, ops) = open_ops(config_path)?;
    let capability = parse_capability(capability)?;

    let entries = task::spawn_blocking(move || ops.read_dir(&capability)).await??;

    if entries.is_empty() {
        println!("Directory is empty");
        return Ok(());
    }

    println!("Entries ({} total):", entries.len());
    println!();
    print_entries(&entries);
    Ok(())
}

/// Show storage status and statistics
async fn cmd_status(config_path: &str) -> Result<()> {
    let cfg = config::Config::load_with_env(Some(config_path))?;

    println!("cipherblob Status");
    println!();

    println!("Configuration:");
    println!("  Config file:       {}", config_path);
    println!("  Storage dir:       {}", cfg.storage_dir);
    println!("  Block size:        {} bytes", cfg.block_size);
    println!("  Max dir entries:   {}", cfg.max_simple_dir_entries);
    println!();

    if !fs::try_exists(&cfg.storage_dir).await.unwrap_or(false) {
        println!("Storage directory is missing, run `cipherblob init`");
        return Ok(());
    }

    let storage_dir = cfg.storage_dir.clone();
    let blobs = task::spawn_blocking(move || FileBlobStorage::open(storage_dir)?.list_blobs())
        .await??;

    let total_blobs = blobs.len();
    let total_size: u64 = blobs.iter().map(|(_, size)| size).sum();

    println!("Storage Statistics:");
    println!("  Total blobs:       {}", total_blobs);
    println!(
        "  Total size:        {} bytes ({:.2} MB)",
        total_size,
        total_size as f64 / 1_048_576.0
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_component() {
        assert!(safe_component("notes.txt").is_ok());
        assert!(safe_component(".hidden").is_ok());
        for name in ["", ".", "..", "a/b", "/etc", "../x"] {
            assert!(safe_component(name).is_err(), "{:?} accepted", name);
        }
    }
}
