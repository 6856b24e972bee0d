//! cellvault - package installer and patch manager
//!
//! Command line front end for the content manager.

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use cv_core::cancel::CancellationToken;
use cv_core::config::Config;
use cv_core::error::InstallError;
use cv_core::title::{Category, InstalledTitle, Serial, TitleKey, TitleVersion};
use cv_integration::ContentManager;
use cv_loader::{PackageBuilder, PackageHandle};
use cv_patch::MappedImage;
use cv_vfs::{InstallOptions, InstallOutcome};
use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "cellvault")]
#[command(about = "Install console packages and manage runtime patches", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install one or more packages
    Install {
        /// Package files
        #[arg(required = true)]
        packages: Vec<PathBuf>,
        /// Replace installed content even if it is newer
        #[arg(long)]
        force: bool,
        /// Replace installed content of the same version without asking
        #[arg(long)]
        overwrite: bool,
    },
    /// List installed content
    List,
    /// Remove installed content
    Uninstall {
        serial: Serial,
        /// base, update, dlc or savedata
        category: Category,
        /// DLC sub-identifier
        #[arg(long)]
        dlc: Option<String>,
    },
    /// Show a package's header and entries
    Info { package: PathBuf },
    /// Build a debug package from a directory
    Pack(PackArgs),
    /// Patch repository and selection commands
    #[command(subcommand)]
    Patches(PatchCommands),
}

#[derive(Args)]
struct PackArgs {
    /// Directory to pack
    dir: PathBuf,
    #[arg(long)]
    serial: String,
    #[arg(long)]
    version: String,
    #[arg(long)]
    category: Category,
    /// DLC sub-identifier
    #[arg(long)]
    dlc: Option<String>,
    /// Compress file entries
    #[arg(long)]
    compress: bool,
    /// Output package file
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Subcommand)]
enum PatchCommands {
    /// Download patch definitions for a title
    Fetch {
        serial: Serial,
        /// Repository URL or directory (defaults to every configured repository)
        #[arg(long)]
        repo: Option<String>,
    },
    /// List known patches and whether they are enabled
    List { serial: Serial },
    /// Enable a patch
    Enable { serial: Serial, id: String },
    /// Disable a patch
    Disable { serial: Serial, id: String },
    /// Apply enabled patches to an image file
    Apply {
        serial: Serial,
        /// Title version (defaults to the installed version)
        #[arg(long)]
        version: Option<TitleVersion>,
        /// Input image
        #[arg(long)]
        image: PathBuf,
        /// Patched output
        #[arg(long)]
        output: PathBuf,
        /// Load address of the image
        #[arg(long, value_parser = parse_address, default_value = "0")]
        base: u64,
    },
}

fn parse_address(text: &str) -> Result<u64, String> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid address {:?}: {}", text, e))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;
    cv_core::logging::init(&config.debug)?;

    tracing::debug!("Starting cellvault {}", env!("CARGO_PKG_VERSION"));

    // Packing needs no content store
    if let Commands::Pack(args) = &cli.command {
        return pack(args);
    }

    let manager = ContentManager::open(config).context("failed to open content store")?;

    match &cli.command {
        Commands::Install {
            packages,
            force,
            overwrite,
        } => install(&manager, packages, *force, *overwrite)?,
        Commands::List => list(&manager),
        Commands::Uninstall {
            serial,
            category,
            dlc,
        } => {
            let key = TitleKey::new(serial.clone(), *category, dlc.clone());
            let removed = manager.uninstall(&key)?;
            println!("Removed {} {}", key, removed.version);
        }
        Commands::Info { package } => info(package)?,
        Commands::Pack(_) => {}
        Commands::Patches(cmd) => patches(&manager, cmd)?,
    }

    Ok(())
}

fn describe(title: &InstalledTitle) -> String {
    format!("{} {}", title.key(), title.version)
}

fn confirm(question: &str) -> bool {
    if !std::io::stdin().is_terminal() {
        return false;
    }
    print!("{} [y/N] ", question);
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes")
}

fn install(
    manager: &ContentManager,
    packages: &[PathBuf],
    force: bool,
    overwrite: bool,
) -> anyhow::Result<()> {
    let options = InstallOptions {
        force_overwrite: force,
        overwrite_same_version: overwrite,
        ..manager.install_options()
    };

    if let [package] = packages {
        return install_one(manager, package, options);
    }

    let report = manager.install_packages(packages, &options);
    for item in &report.items {
        match &item.outcome {
            InstallOutcome::Installed(title) => {
                println!("installed  {}  {}", describe(title), item.source.display())
            }
            InstallOutcome::AlreadyInstalled(title) => println!(
                "skipped    {}  already installed ({})",
                describe(title),
                item.source.display()
            ),
            InstallOutcome::Failed(err) => {
                println!("failed     {}  {}", item.source.display(), err)
            }
        }
    }

    if !report.all_succeeded() {
        bail!("{} of {} packages failed", report.failures().count(), report.items.len());
    }
    Ok(())
}

fn install_one(
    manager: &ContentManager,
    package: &Path,
    options: InstallOptions,
) -> anyhow::Result<()> {
    let task = manager.spawn_install(package, options.clone());
    let result = task.wait_with(|p| {
        eprint!(
            "\r{:>3}% ({}/{} entries, {} bytes)",
            (p.fraction() * 100.0) as u32,
            p.entries_completed,
            p.entries_total,
            p.bytes_transferred
        );
    });
    eprintln!();

    let title = match result {
        Ok(title) => title,
        Err(InstallError::AlreadyInstalled { existing }) => {
            let ask = manager.config().general.confirm_overwrite;
            if !ask || !confirm(&format!("{} is already installed. Overwrite?", describe(&existing)))
            {
                println!("{} is already installed", describe(&existing));
                return Ok(());
            }
            let options = InstallOptions {
                overwrite_same_version: true,
                ..options
            };
            manager.install_package(package, &options)?
        }
        Err(e) => return Err(e.into()),
    };

    println!("Installed {} to {}", describe(&title), title.install_path.display());
    Ok(())
}

fn list(manager: &ContentManager) {
    let titles = manager.list_installed();
    if titles.is_empty() {
        println!("Nothing installed");
        return;
    }
    for title in titles {
        println!(
            "{:<9}  {:<8}  {:<10}  {:<10}  {}",
            title.serial,
            title.category,
            title.version,
            title.dlc_id.as_deref().unwrap_or("-"),
            title.install_path.display()
        );
    }
}

fn info(package: &Path) -> anyhow::Result<()> {
    let handle = PackageHandle::open_file(package)
        .with_context(|| format!("failed to open {}", package.display()))?;
    let header = handle.header();

    println!("Serial:    {}", header.serial);
    println!("Version:   {}", header.version);
    println!("Category:  {}", header.category);
    if let Some(dlc) = &header.dlc_id {
        println!("DLC id:    {}", dlc);
    }
    println!("Type:      {:?}", header.magic);
    println!("Size:      {} bytes", header.total_size);
    println!("Entries:   {}", header.entry_count);

    for entry in handle.entries() {
        let entry = entry?;
        let mut flags = String::new();
        flags.push(if entry.is_dir() { 'd' } else { '-' });
        flags.push(if entry.is_encrypted() { 'e' } else { '-' });
        flags.push(if entry.is_compressed() { 'z' } else { '-' });
        println!("  {}  {:>10}  {}", flags, entry.size, entry.path);
    }
    Ok(())
}

fn pack(args: &PackArgs) -> anyhow::Result<()> {
    let mut builder = PackageBuilder::new(&args.serial, &args.version, args.category)?
        .compress(args.compress);
    if let Some(dlc) = &args.dlc {
        builder = builder.dlc_id(dlc.clone());
    }
    let builder = builder
        .add_tree(&args.dir)
        .with_context(|| format!("failed to read {}", args.dir.display()))?;

    let file = std::fs::File::create(&args.output)
        .with_context(|| format!("failed to create {}", args.output.display()))?;
    let mut writer = std::io::BufWriter::new(file);
    let size = builder.write_to(&mut writer)?;
    writer.flush()?;

    println!("Wrote {} ({} bytes)", args.output.display(), size);
    Ok(())
}

fn patches(manager: &ContentManager, cmd: &PatchCommands) -> anyhow::Result<()> {
    match cmd {
        PatchCommands::Fetch { serial, repo } => {
            let cancel = CancellationToken::new();
            let results = match repo {
                Some(url) => vec![(
                    url.clone(),
                    manager.fetch_patch_definitions(serial, url, &cancel),
                )],
                None => manager.fetch_all_patch_definitions(serial, &cancel),
            };

            let mut failed = 0;
            for (name, result) in results {
                match result {
                    Ok(outcome) => {
                        println!("{}: {} patches", name, outcome.definitions.len());
                        for warning in &outcome.warnings {
                            println!("  warning: {}", warning);
                        }
                    }
                    Err(e) => {
                        println!("{}: {}", name, e);
                        failed += 1;
                    }
                }
            }
            if failed > 0 {
                bail!("{} repositories failed", failed);
            }
        }
        PatchCommands::List { serial } => {
            let listing = manager.list_patches(serial);
            if listing.is_empty() {
                println!("No patches known for {}", serial);
            }
            for item in listing {
                println!(
                    "[{}] {:<16} {:<32} {:<10} {}",
                    if item.enabled { "x" } else { " " },
                    item.definition.id,
                    item.definition.name,
                    item.definition.version,
                    item.repository
                );
            }
        }
        PatchCommands::Enable { serial, id } => {
            manager.set_patch_enabled(serial, id, true)?;
            println!("Enabled {}", id);
        }
        PatchCommands::Disable { serial, id } => {
            manager.set_patch_enabled(serial, id, false)?;
            println!("Disabled {}", id);
        }
        PatchCommands::Apply {
            serial,
            version,
            image,
            output,
            base,
        } => {
            let version = match version {
                Some(version) => version.clone(),
                None => manager.launch_version(serial)?,
            };
            let bytes = std::fs::read(image)
                .with_context(|| format!("failed to read {}", image.display()))?;
            let mut target = MappedImage::new(*base, bytes);

            let report = manager.apply_patches_for_launch(
                serial,
                &version,
                &mut target,
                &CancellationToken::new(),
            )?;

            for outcome in &report.definitions {
                println!(
                    "{:<16} {:?} ({} ops, {} skip)",
                    outcome.id, outcome.status, outcome.applied_ops, outcome.skip_ops
                );
            }
            for oob in report.out_of_bounds() {
                println!(
                    "  out of bounds: {} op #{} at 0x{:x} ({} bytes)",
                    oob.definition, oob.op_index, oob.address, oob.len
                );
            }

            std::fs::write(output, &target.bytes)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!(
                "Applied {} ops to {} ({} skipped)",
                report.applied_count(),
                output.display(),
                report.skipped_count()
            );
        }
    }
    Ok(())
}
