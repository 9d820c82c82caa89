//! Text-mode installer pilot
//!
//! Drives a VirtualBox guest through text-mode installers by reading its
//! screen with a trainable glyph recognizer and typing scan codes back.

mod automation;
mod error;
mod glyph;
mod media;
mod paths;
mod vm;

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use automation::config::{load_config, RunConfig};
use automation::driver::{Driver, ThreadPacer};
use automation::script::{InstallScript, Interpreter, RunMode};
use glyph::{ConsoleTrainer, ProfiledReader, ScreenReader};
use media::{normalize_extension, numbered_images, SwapPlan};
use vm::vboxmanage::default_vboxmanage;
use vm::{ScanCode, VBoxManage, VmSession};

/// Text-mode installer pilot for VirtualBox guests
#[derive(Parser)]
#[command(name = "textmode-pilot")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: config.json next to the executable)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to VBoxManage
    #[arg(long)]
    vboxmanage: Option<PathBuf>,

    /// Name of the VirtualBox virtual machine to work with
    vm: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read the guest screen once and print it
    Read {
        /// Recognition profile (default: the configured default profile)
        #[arg(long)]
        profile: Option<String>,
    },

    /// Print the VM state and the medium in the media slot
    State,

    /// Run an installer script
    Run {
        /// Script file (JSON)
        script: PathBuf,

        /// Directory relative media paths are taken from
        #[arg(long)]
        media_dir: Option<PathBuf>,

        /// Skip the steps before this index
        #[arg(long)]
        resume_from: Option<usize>,
    },

    /// Feed numbered disk images to the VM, one per Enter
    SwapDisks {
        /// Directory with the disk images (default: that of the current disk)
        #[arg(long)]
        disk_path: Option<PathBuf>,

        /// Extension of the disk image files
        #[arg(short, long, default_value = ".img")]
        extension: String,

        /// Don't press a key in the VM after switching disk images
        #[arg(long)]
        no_keypress: bool,

        /// Key-down scan code to press after switching disks (default: Enter)
        #[arg(long, default_value = "0x1c", value_parser = parse_scancode)]
        scancode: ScanCode,

        /// Removable media slot to swap
        #[arg(long, default_value = "Floppy-0-0")]
        disk: String,
    },
}

fn parse_scancode(s: &str) -> std::result::Result<ScanCode, String> {
    ScanCode::from_name(s)
        .or_else(|| s.parse::<u8>().ok().and_then(ScanCode::new))
        .ok_or_else(|| format!("{:?} is not a key-down scan code (0x00..0x80)", s))
}

/// Logs a message to both console and log file with timestamp.
pub fn log(msg: &str) {
    let timestamp = Local::now().format("%H:%M:%S%.3f");
    let line = format!("[{}] {}\n", timestamp, msg);
    print!("{}", line);
    let log_path = paths::get_logs_dir().join("textmode_pilot.log");
    if let Ok(mut file) = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        let _ = file.write_all(line.as_bytes());
    }
}

fn main() -> Result<()> {
    // Set up panic hook to log panics
    std::panic::set_hook(Box::new(|panic_info| {
        let msg = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };
        let location = if let Some(loc) = panic_info.location() {
            format!(" at {}:{}:{}", loc.file(), loc.line(), loc.column())
        } else {
            String::new()
        };
        let log_msg = format!("[PANIC]{} {}\n", location, msg);
        eprintln!("{}", log_msg);
        let log_path = paths::get_logs_dir().join("textmode_pilot.log");
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&log_path) {
            let _ = file.write_all(log_msg.as_bytes());
        }
    }));

    let cli = Cli::parse();

    // Ensure output directories exist
    paths::ensure_directories().context("failed to create output directories")?;

    let config_path = cli.config.clone().unwrap_or_else(paths::get_default_config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let program = cli
        .vboxmanage
        .clone()
        .or_else(|| config.vboxmanage.as_ref().map(PathBuf::from))
        .unwrap_or_else(default_vboxmanage);
    if program != default_vboxmanage() {
        log(&format!("Using VBoxManage at {}", program.display()));
    }
    let vbox = VBoxManage::new(program, cli.vm.as_str());

    match cli.command {
        Commands::Read { profile } => read_screen(vbox, &config, profile.as_deref()),
        Commands::State => show_state(vbox, &config),
        Commands::Run {
            script,
            media_dir,
            resume_from,
        } => run_script(vbox, config, &script, media_dir, resume_from),
        Commands::SwapDisks {
            disk_path,
            extension,
            no_keypress,
            scancode,
            disk,
        } => {
            let keypress = (!no_keypress).then_some(scancode);
            swap_disks(vbox, disk_path, &extension, keypress, disk)
        }
    }
}

fn open_reader(config: &RunConfig, profile: &str) -> Result<ProfiledReader> {
    let trainer = ConsoleTrainer::stdio(Some(paths::get_training_dir()));
    ProfiledReader::open(config, profile, Box::new(trainer))
        .context("failed to set up text recognition")
}

/// Reads the guest screen once and prints it.
fn read_screen(mut vbox: VBoxManage, config: &RunConfig, profile: Option<&str>) -> Result<()> {
    let profile = profile.unwrap_or(&config.default_profile);
    let mut reader = open_reader(config, profile)?;

    log(&format!("Reading screen of {} with profile {}", vbox.vm_name(), profile));
    let frame = reader
        .read_frame(&mut vbox)
        .context("failed to read the screen")?;
    for line in frame.lines() {
        println!("{}", line);
    }
    Ok(())
}

fn show_state(mut vbox: VBoxManage, config: &RunConfig) -> Result<()> {
    let state = vbox.state()?;
    println!("{}: {}", vbox.vm_name(), state);
    match vbox.attached_medium(&config.media_slot)? {
        Some(medium) => println!("{}: {}", config.media_slot, medium),
        None => println!("{}: empty", config.media_slot),
    }
    Ok(())
}

fn run_script(
    vbox: VBoxManage,
    config: RunConfig,
    script_path: &Path,
    media_dir: Option<PathBuf>,
    resume_from: Option<usize>,
) -> Result<()> {
    let script = InstallScript::load(script_path)?;
    let media_root = media_dir
        .or_else(|| script.media_root.clone())
        .or_else(|| script_path.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    let mode = resume_from.map_or(RunMode::Fresh, RunMode::ResumeFrom);

    let reader = open_reader(&config, &config.default_profile)?;
    let mut driver = Driver::new(vbox, reader, ThreadPacer, config);

    log(&format!(
        "Running {} ({} steps, media from {})",
        script_path.display(),
        script.steps.len(),
        media_root.display()
    ));
    Interpreter::new(&mut driver, media_root)
        .run(&script, mode)
        .with_context(|| format!("script {} failed", script_path.display()))?;
    Ok(())
}

fn swap_disks(
    mut vbox: VBoxManage,
    disk_path: Option<PathBuf>,
    extension: &str,
    keypress: Option<ScanCode>,
    slot: String,
) -> Result<()> {
    let extension = normalize_extension(extension);

    let current = vbox.attached_medium(&slot)?.map(PathBuf::from);
    match &current {
        Some(path) => log(&format!("Current disk image: {}", path.display())),
        None => log("Current disk image: none"),
    }

    let dir = disk_path
        .or_else(|| current.as_ref().and_then(|p| p.parent()).map(Path::to_path_buf))
        .ok_or_else(|| anyhow!("no disk in {} and no --disk-path given", slot))?;
    if !dir.is_dir() {
        return Err(anyhow!("{} is not a directory", dir.display()));
    }

    let images = numbered_images(&dir, &extension)
        .with_context(|| format!("failed to list disk images in {}", dir.display()))?;
    log(&format!("Found {} numbered disk images in {}", images.len(), dir.display()));

    let plan = SwapPlan {
        dir,
        slot,
        keypress,
    };
    let inserted = plan.run(
        &mut vbox,
        &images,
        current.as_deref(),
        &mut std::io::stdin().lock(),
        &mut std::io::stdout(),
    )?;
    log(&format!("Inserted {} disk images", inserted));
    Ok(())
}
