use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ctrsd::cia::BuildMode;
use ctrsd::importer::{load_preset_config, Config, ContentSpecifier, ContentType, Importer};

#[derive(Parser)]
#[command(about = "Migrates a 3DS SD card installation into an emulator user directory")]
struct Args {
    /// Path to the "Nintendo 3DS/<ID0>/<ID1>" folder
    #[arg(long)]
    sdmc: Option<PathBuf>,
    /// Mount point of the SD card, for config auto-detection
    #[arg(long)]
    mount: Option<PathBuf>,
    /// Target emulator user directory
    #[arg(long)]
    user: PathBuf,
    /// Path to boot9.bin
    #[arg(long)]
    boot9: Option<PathBuf>,
    /// Path to movable.sed
    #[arg(long)]
    movable: Option<PathBuf>,
    /// Path to certs.db (needed for CIA building)
    #[arg(long)]
    certs: Option<PathBuf>,
    /// Path to ticket.db
    #[arg(long)]
    tickets: Option<PathBuf>,
    /// Path to seeddb.bin
    #[arg(long)]
    seeddb: Option<PathBuf>,
    /// Path to encTitleKeys.bin
    #[arg(long)]
    title_keys: Option<PathBuf>,
    /// Path to the dumped NAND title directory
    #[arg(long)]
    nand_titles: Option<PathBuf>,
    /// Path to the dumped NAND data directory
    #[arg(long)]
    nand_data: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum CliBuildMode {
    Standard,
    PirateLegit,
    Legit,
}

impl From<CliBuildMode> for BuildMode {
    fn from(mode: CliBuildMode) -> Self {
        match mode {
            CliBuildMode::Standard => BuildMode::Standard,
            CliBuildMode::PirateLegit => BuildMode::PirateLegit,
            CliBuildMode::Legit => BuildMode::Legit,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// List importable contents
    List,
    /// Import contents by title ID, or everything
    Import {
        /// Title IDs (hex); imports everything when empty
        ids: Vec<String>,
    },
    /// Dump an application's main content to a decrypted CXI
    DumpCxi {
        id: String,
        /// Output file, or directory for an automatic name
        output: PathBuf,
    },
    /// Build an installable CIA from a title
    BuildCia {
        #[arg(value_enum)]
        mode: CliBuildMode,
        id: String,
        /// Output file, or directory for an automatic name
        output: PathBuf,
    },
    /// Verify a title's contents against its TMD hashes
    Check { id: String },
}

fn type_name(content_type: ContentType) -> &'static str {
    match content_type {
        ContentType::Title => "title",
        ContentType::Savegame => "savegame",
        ContentType::NandSavegame => "nand savegame",
        ContentType::Extdata => "extdata",
        ContentType::NandExtdata => "nand extdata",
        ContentType::Sysdata => "sysdata",
        ContentType::NandTitle => "nand title",
    }
}

fn build_config(args: &Args) -> Result<Config> {
    // A mount point gives us everything the dumper left on the card.
    if let Some(mount) = &args.mount {
        let mut configs = load_preset_config(mount, &args.user);
        if configs.is_empty() {
            bail!("no usable configuration found under {}", mount.display());
        }
        if configs.len() > 1 {
            eprintln!("note: multiple ID pairs found, using the first");
        }
        let mut config = configs.swap_remove(0);
        // Explicit flags override detection
        if let Some(sdmc) = &args.sdmc {
            config.sdmc_path = sdmc.clone();
        }
        if let Some(boot9) = &args.boot9 {
            config.bootrom_path = boot9.clone();
        }
        if let Some(movable) = &args.movable {
            config.movable_sed_path = movable.clone();
        }
        return Ok(config);
    }

    Ok(Config {
        sdmc_path: args.sdmc.clone().ok_or_else(|| anyhow!("--sdmc or --mount is required"))?,
        user_path: args.user.clone(),
        bootrom_path: args.boot9.clone().ok_or_else(|| anyhow!("--boot9 is required"))?,
        movable_sed_path: args
            .movable
            .clone()
            .ok_or_else(|| anyhow!("--movable is required"))?,
        certs_db_path: args.certs.clone(),
        ticket_db_path: args.tickets.clone(),
        seed_db_path: args.seeddb.clone(),
        enc_title_keys_bin_path: args.title_keys.clone(),
        system_titles_path: args.nand_titles.clone(),
        nand_data_path: args.nand_data.clone(),
        ..Config::default()
    })
}

fn parse_id(id: &str) -> Result<u64> {
    u64::from_str_radix(id.trim_start_matches("0x"), 16)
        .with_context(|| format!("invalid title id {id}"))
}

fn find_content(importer: &Importer, id: u64) -> Result<ContentSpecifier> {
    importer
        .list_content()
        .into_iter()
        .find(|spec| spec.id == id && spec.content_type.is_title())
        .ok_or_else(|| anyhow!("no title with id {id:016x}"))
}

fn progress_bar() -> impl Fn(u64, u64) + Send + Sync {
    let last_percent = AtomicU64::new(u64::MAX);
    move |current, total| {
        if total == 0 {
            return;
        }
        let percent = current * 100 / total;
        if last_percent.swap(percent, Ordering::Relaxed) != percent {
            eprint!("\r{percent:>3}%");
            let _ = std::io::stderr().flush();
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = build_config(&args)?;
    let mut importer = Importer::new(config).context("failed to initialize importer")?;

    match &args.command {
        Command::List => {
            for spec in importer.list_content() {
                println!(
                    "{:16} {:016x} {:>12} {} {}",
                    type_name(spec.content_type),
                    spec.id,
                    spec.maximum_size,
                    if spec.already_exists { "[imported]" } else { "" },
                    spec.name
                );
            }
        }
        Command::Import { ids } => {
            let contents = importer.list_content();
            let selected: Vec<_> = if ids.is_empty() {
                contents
            } else {
                let wanted: Vec<u64> = ids.iter().map(|id| parse_id(id)).collect::<Result<_>>()?;
                contents
                    .into_iter()
                    .filter(|spec| wanted.contains(&spec.id))
                    .collect()
            };
            if selected.is_empty() {
                bail!("nothing to import");
            }

            let mut failed = Vec::new();
            for spec in &selected {
                eprintln!("importing {} {:016x} {}", type_name(spec.content_type), spec.id, spec.name);
                let callback = progress_bar();
                if let Err(e) = importer.import_content(spec, &callback) {
                    eprintln!("\rfailed: {e}");
                    failed.push(spec.clone());
                } else {
                    eprintln!("\rdone");
                }
            }
            if !failed.is_empty() {
                eprintln!("{} content(s) failed to import:", failed.len());
                for spec in &failed {
                    eprintln!("  {} {:016x}", type_name(spec.content_type), spec.id);
                }
                bail!("import finished with failures");
            }
        }
        Command::DumpCxi { id, output } => {
            let spec = find_content(&importer, parse_id(id)?)?;
            let callback = progress_bar();
            let auto = output.is_dir();
            importer
                .dump_cxi(&spec, output.clone(), &callback, auto)
                .context("CXI dump failed")?;
            eprintln!("\rdone");
        }
        Command::BuildCia { mode, id, output } => {
            let spec = find_content(&importer, parse_id(id)?)?;
            let callback = progress_bar();
            let auto = output.is_dir();
            importer
                .build_cia((*mode).into(), &spec, output.clone(), &callback, auto)
                .context("CIA build failed")?;
            eprintln!("\rdone");
        }
        Command::Check { id } => {
            let spec = find_content(&importer, parse_id(id)?)?;
            let callback = progress_bar();
            importer
                .check_title_contents(&spec, &callback)
                .context("content verification failed")?;
            eprintln!("\rcontents OK");
        }
    }

    Ok(())
}
