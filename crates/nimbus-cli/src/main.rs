//! # nimbus CLI
//!
//! Command-line front end for a local Nimbus drive: a per-account virtual
//! filesystem over a shared, deduplicated blob store.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nimbus_cas::Fingerprint;
use nimbus_config::{log_cli_debug, log_cli_info, Config, ConflictPolicy};
use nimbus_vfs::{path, AccountId, Drive, Node, VfsError};

pub mod gc;

use gc::format_bytes;

/// Nimbus - personal cloud drive with deduplicated storage
#[derive(Parser)]
#[command(name = "nimbus")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Account to operate on
    #[arg(long, global = true, env = "NIMBUS_ACCOUNT", default_value_t = 1)]
    account: AccountId,

    /// Data directory holding the database and blobs
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Drive(DriveCommands),

    /// Inspect or create configuration files
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Commands that operate on an opened drive.
#[derive(Subcommand)]
enum DriveCommands {
    /// Create the data directory and the account root
    Init,

    /// Create a folder
    Mkdir {
        path: String,

        /// Create missing parent folders too
        #[arg(short, long)]
        parents: bool,
    },

    /// Upload a local file
    Put {
        #[arg(value_name = "LOCAL")]
        local: PathBuf,

        /// Destination path; an existing folder receives the file by name
        #[arg(value_name = "REMOTE")]
        remote: String,

        /// strict, rename or replace
        #[arg(long)]
        conflict: Option<ConflictPolicy>,
    },

    /// Reference already-stored content by fingerprint, without uploading
    Add {
        fingerprint: String,
        size: u64,
        remote: String,

        #[arg(long)]
        conflict: Option<ConflictPolicy>,
    },

    /// List a folder
    Ls {
        #[arg(default_value = "/")]
        path: String,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        #[arg(long, default_value_t = 100)]
        limit: usize,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show one node
    Stat {
        path: String,

        #[arg(long)]
        json: bool,
    },

    /// Write a file's content to stdout or a local file
    Cat {
        path: String,

        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Delete a file or folder recursively
    Rm { path: String },

    /// Move into another folder
    Mv { path: String, target: String },

    /// Rename in place
    Rename { path: String, new_name: String },

    /// Copy into another folder
    Cp { path: String, target: String },

    /// Show space used against the quota
    Du,

    /// Sweep blobs no longer referenced
    Gc(gc::GcArgs),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Print config file locations
    Path,
    /// Write a default config file
    Init {
        /// Write ~/.nimbus/config.toml instead of .nimbus/config.toml
        #[arg(long)]
        global: bool,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    nimbus_config::reload().context("Failed to load configuration")?;
    let mut config = nimbus_config::config().clone();
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.clone();
    }
    nimbus_config::init_logging(config.logging.level);
    log_cli_debug!("starting", account = cli.account);

    match cli.command {
        Commands::Config { command } => cmd_config(&config, command),
        Commands::Drive(command) => {
            let drive = open_drive(&config)?;
            run(&drive, cli.account, command)
        }
    }
}

fn open_drive(config: &Config) -> Result<Drive> {
    Drive::open(config).with_context(|| {
        format!(
            "Failed to open drive at {}",
            config.storage.data_dir.display()
        )
    })
}

fn run(drive: &Drive, account: AccountId, command: DriveCommands) -> Result<()> {
    match command {
        DriveCommands::Init => cmd_init(drive, account),
        DriveCommands::Mkdir { path, parents } => cmd_mkdir(drive, account, &path, parents),
        DriveCommands::Put {
            local,
            remote,
            conflict,
        } => cmd_put(drive, account, &local, &remote, conflict),
        DriveCommands::Add {
            fingerprint,
            size,
            remote,
            conflict,
        } => {
            let fingerprint: Fingerprint = fingerprint
                .parse()
                .with_context(|| format!("Invalid fingerprint {:?}", fingerprint))?;
            let node = drive.add_file(account, &remote, &fingerprint, size, conflict)?;
            println!("  🔗 {} ({})", node.path, format_bytes(node.size));
            Ok(())
        }
        DriveCommands::Ls {
            path,
            offset,
            limit,
            json,
        } => cmd_ls(drive, account, &path, offset, limit, json),
        DriveCommands::Stat { path, json } => cmd_stat(drive, account, &path, json),
        DriveCommands::Cat { path, output } => cmd_cat(drive, account, &path, output.as_deref()),
        DriveCommands::Rm { path } => {
            let report = drive.delete(account, &path)?;
            if report.nodes_removed == 0 {
                println!("  Nothing at {}", path::normalize(&path));
            } else {
                println!(
                    "  🗑️  Removed {} node(s), reclaimed {} blob(s)",
                    report.nodes_removed, report.blobs_reclaimed
                );
            }
            Ok(())
        }
        DriveCommands::Mv { path, target } => {
            let node = drive.move_to(account, &path, &target)?;
            println!("  {} → {}", path::normalize(&path), node.path);
            Ok(())
        }
        DriveCommands::Rename { path, new_name } => {
            let node = drive.rename(account, &path, &new_name)?;
            println!("  {} → {}", path::normalize(&path), node.path);
            Ok(())
        }
        DriveCommands::Cp { path, target } => {
            let node = drive.copy_to(account, &path, &target)?;
            println!("  {} ⇒ {}", path::normalize(&path), node.path);
            Ok(())
        }
        DriveCommands::Du => cmd_du(drive, account),
        DriveCommands::Gc(args) => gc::run(drive, args),
    }
}

fn cmd_init(drive: &Drive, account: AccountId) -> Result<()> {
    // Touching the account creates its root folder.
    drive.get(account, "/")?;
    log_cli_info!("initialized", account = account);

    println!();
    println!("  ✅ Nimbus drive ready");
    println!("     Database: {}", drive.database().path().display());
    println!("     Blobs:    {}", drive.blobs().root().display());
    println!("     Account:  {}", account);
    println!("     Quota:    {}", format_bytes(drive.options().quota));
    Ok(())
}

fn cmd_mkdir(drive: &Drive, account: AccountId, target: &str, parents: bool) -> Result<()> {
    let target = path::normalize(target);
    if !parents {
        let node = drive.create_folder(account, &target)?;
        println!("  📁 {}", node.path);
        return Ok(());
    }

    let mut current = String::from(path::ROOT);
    for segment in target.split('/').filter(|s| !s.is_empty()) {
        current = path::join(&current, segment);
        match drive.get(account, &current)? {
            Some(node) if node.is_folder() => continue,
            Some(_) => bail!("{} exists and is not a folder", current),
            None => {
                drive.create_folder(account, &current)?;
                println!("  📁 {}", current);
            }
        }
    }
    Ok(())
}

fn cmd_put(
    drive: &Drive,
    account: AccountId,
    local: &Path,
    remote: &str,
    conflict: Option<ConflictPolicy>,
) -> Result<()> {
    if !local.is_file() {
        bail!("{} is not a readable file", local.display());
    }

    // Uploading onto a folder drops the file inside it.
    let mut remote = path::normalize(remote);
    if let Some(node) = drive.get(account, &remote)? {
        if node.is_folder() {
            let name = local
                .file_name()
                .and_then(|n| n.to_str())
                .with_context(|| format!("{} has no usable file name", local.display()))?;
            remote = path::join(&remote, name);
        }
    }

    let node = drive
        .upload_file(account, &remote, local, conflict)
        .with_context(|| format!("Failed to upload {}", local.display()))?;
    println!(
        "  ⬆️  {} → {} ({})",
        local.display(),
        node.path,
        format_bytes(node.size)
    );
    Ok(())
}

fn cmd_ls(
    drive: &Drive,
    account: AccountId,
    folder: &str,
    offset: usize,
    limit: usize,
    json: bool,
) -> Result<()> {
    let nodes = drive.list_children(account, folder, offset, limit)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&nodes)?);
        return Ok(());
    }

    for node in &nodes {
        let marker = if node.is_folder() { "d" } else { "-" };
        let size = if node.is_folder() {
            String::from("-")
        } else {
            format_bytes(node.size)
        };
        let suffix = if node.is_folder() { "/" } else { "" };
        println!(
            "{} {:>12}  {}  {}{}",
            marker,
            size,
            format_time(node.modified_at),
            node.name,
            suffix
        );
    }
    Ok(())
}

fn cmd_stat(drive: &Drive, account: AccountId, target: &str, json: bool) -> Result<()> {
    let node = drive
        .get(account, target)?
        .ok_or_else(|| VfsError::NotFound(path::normalize(target)))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&node)?);
        return Ok(());
    }

    print_node(&node);
    if node.is_folder() {
        let counts = drive.count_children(account, &node.path)?;
        println!("  Folders:     {}", counts.folders);
        println!("  Files:       {}", counts.files);
    }
    Ok(())
}

fn print_node(node: &Node) {
    println!("  Path:        {}", node.path);
    println!("  Kind:        {}", node.kind.as_str());
    println!("  Id:          {}", node.id);
    if let Some(fingerprint) = &node.fingerprint {
        println!("  Size:        {} ({} bytes)", format_bytes(node.size), node.size);
        println!("  Fingerprint: {}", fingerprint);
    }
    if let Some(scan) = node.virus_scan() {
        println!("  Virus scan:  {:?}", scan);
    }
    println!("  Modified:    {}", format_time(node.modified_at));
    println!("  Revision:    {} (global {})", node.rev, node.global_rev);
}

fn cmd_cat(drive: &Drive, account: AccountId, target: &str, output: Option<&Path>) -> Result<()> {
    let (node, mut file) = drive.open_file(account, target)?;
    let copied = match output {
        Some(out) => {
            let mut dest =
                File::create(out).with_context(|| format!("Failed to create {}", out.display()))?;
            io::copy(&mut file, &mut dest)?
        }
        None => {
            let stdout = io::stdout();
            let mut lock = stdout.lock();
            let n = io::copy(&mut file, &mut lock)?;
            lock.flush()?;
            n
        }
    };
    if copied != node.size {
        bail!(
            "{}: expected {} bytes, read {}",
            node.path,
            node.size,
            copied
        );
    }
    Ok(())
}

fn cmd_du(drive: &Drive, account: AccountId) -> Result<()> {
    let space = drive.space(account)?;
    let pct = if space.total > 0 {
        space.used as f64 / space.total as f64 * 100.0
    } else {
        0.0
    };

    println!();
    println!("  Account {}", account);
    println!(
        "    💾 Used:  {} of {} ({:.1}%)",
        format_bytes(space.used),
        format_bytes(space.total),
        pct
    );
    if space.over_quota {
        println!("    ⚠️  Over quota");
    }

    let stats = drive.blobs().stats()?;
    println!(
        "    📦 Store: {} blobs, {} on disk (all accounts)",
        gc::format_number(stats.blob_count),
        format_bytes(stats.total_bytes)
    );
    println!();
    Ok(())
}

fn cmd_config(config: &Config, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            print!("{}", toml::to_string_pretty(config)?);
        }
        ConfigCommands::Path => {
            match Config::global_config_path() {
                Some(p) => println!("Global:  {}", p.display()),
                None => println!("Global:  (no home directory)"),
            }
            println!("Project: {}", project_config_path().display());
        }
        ConfigCommands::Init { global, force } => {
            let target = if global {
                Config::global_config_path().context("No home directory for global config")?
            } else {
                project_config_path()
            };
            if target.exists() && !force {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    target.display()
                );
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, Config::default_toml())
                .with_context(|| format!("Failed to write {}", target.display()))?;
            println!("  ✅ Wrote {}", target.display());
        }
    }
    Ok(())
}

fn project_config_path() -> PathBuf {
    PathBuf::from(".nimbus/config.toml")
}

fn format_time(unix_secs: i64) -> String {
    chrono::DateTime::from_timestamp(unix_secs, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| String::from("-"))
}
