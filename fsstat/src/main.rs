mod logger;

use std::{error::Error, io::Write, path::PathBuf, process::ExitCode};

use clap::Parser;
use libfsstat::{FileSystem, FsOptions, FsType, Image, SourceSelector, VolumeSystem};

#[derive(Parser, Debug)]
#[command(name = "fsstat", version)]
#[command(about = "Display filesystem metadata of a raw or split disk image", long_about = None)]
struct Cli {
    /// Image segments, in order
    #[arg(conflicts_with = "glob", required_unless_present_any = ["glob", "list_types"])]
    images: Vec<PathBuf>,
    /// Glob pattern matching every segment of a split image
    #[arg(short, long)]
    glob: Option<String>,
    /// Where to look for the filesystem: image, volume or part:N
    #[arg(short, long, default_value = "image")]
    source: String,
    /// Raw filesystem type flag, decimal or 0x hex; 0 auto-detects
    #[arg(long, value_parser = parse_type_flag, conflicts_with = "fs_type")]
    type_flag: Option<u32>,
    /// Filesystem type name, see --list-types
    #[arg(short = 't', long = "type")]
    fs_type: Option<String>,
    /// List supported image and filesystem types, then exit
    #[arg(long)]
    list_types: bool,
    /// Print the partition table before the filesystem report
    #[arg(long)]
    list_parts: bool,
    /// Increase log verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_type_flag(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse::<u32>(),
    };
    return parsed.map_err(|e| e.to_string());
}

fn options(cli: &Cli) -> Result<FsOptions, Box<dyn Error>> {
    if let Some(type_flag) = cli.type_flag {
        return Ok(FsOptions { type_flag });
    }

    match &cli.fs_type {
        Some(name) => {
            let fs_type = FsType::from_short_name(name)
                .ok_or_else(|| format!("Unknown filesystem type \"{name}\", see --list-types"))?;
            return Ok(FsOptions::with_type(fs_type));
        }
        None => return Ok(FsOptions::default()),
    }
}

fn print_parts(out: &mut impl Write, vs: &VolumeSystem) -> std::io::Result<()> {
    let Some(description) = vs.description() else {
        writeln!(out, "No partition table found")?;
        writeln!(out)?;
        return Ok(());
    };

    writeln!(out, "{description}")?;
    writeln!(out, "Units are in {}-byte sectors", vs.block_size().unwrap_or(0))?;
    writeln!(out)?;
    writeln!(out, "      Slot      Start        End          Length       Description")?;

    for part in vs.parts() {
        let slot = part
            .slot()
            .map_or(String::from("-------"), |s| format!("{s:03}"));
        writeln!(
            out,
            "{:03}:  {slot:<8}  {:010}   {:010}   {:010}   {}",
            part.index(),
            part.block_start(),
            (part.block_start() + part.block_len()).saturating_sub(1),
            part.block_len(),
            part.description()
        )?;
    }
    writeln!(out)?;

    return Ok(());
}

fn run(cli: &Cli) -> Result<bool, Box<dyn Error>> {
    let mut out = std::io::stdout().lock();

    if cli.list_types {
        write!(out, "{}", libfsstat::image::type_print())?;
        write!(out, "{}", libfsstat::type_print())?;
        return Ok(true);
    }

    let selector: SourceSelector = cli.source.parse()?;
    let options = options(cli)?;

    let image = match &cli.glob {
        Some(pattern) => Image::open_glob(pattern)?,
        None => Image::open(&cli.images)?,
    };

    log::info!(
        "fsstat - IMAGE: {} segment(s), {} bytes",
        image.segment_count(),
        image.size()
    );

    let volume = if cli.list_parts || selector != SourceSelector::Image {
        Some(VolumeSystem::scan(&image)?)
    } else {
        None
    };

    if cli.list_parts {
        if let Some(vs) = &volume {
            print_parts(&mut out, vs)?;
        }
    }

    let source = selector.resolve(&image, volume.as_ref())?;
    let fs = FileSystem::open(source, options)?;

    fs.write_report(&mut out)?;

    return Ok(fs.is_found());
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    logger::init_logger(cli.verbose);

    match run(&cli) {
        Ok(true) => return ExitCode::SUCCESS,
        Ok(false) => return ExitCode::from(1),
        Err(e) => {
            eprintln!("fsstat: {e}");
            return ExitCode::from(2);
        }
    }
}
