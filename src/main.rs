use clap::{Parser, Subcommand};
use eyre::{ensure, Context, Result};
use rsfs::{device::SECTOR_SIZE, ImageFile, Mode, Volume};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::trace;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new zero-filled disk image
    Mkimage {
        #[arg(index = 1)]
        image: PathBuf,
        #[arg(short = 's', long)]
        sectors: u64,
    },
    /// Erase all files and reset the volume
    Format {
        #[arg(index = 1)]
        image: PathBuf,
    },
    /// List files and their sizes
    Ls {
        #[arg(index = 1)]
        image: PathBuf,
    },
    /// Show free space
    Df {
        #[arg(index = 1)]
        image: PathBuf,
    },
    /// Create an empty file
    Touch {
        #[arg(index = 1)]
        image: PathBuf,
        #[arg(index = 2)]
        name: String,
    },
    /// Remove a file
    Rm {
        #[arg(index = 1)]
        image: PathBuf,
        #[arg(index = 2)]
        name: String,
    },
    /// Copy a host file into the volume
    Put {
        #[arg(index = 1)]
        image: PathBuf,
        #[arg(index = 2)]
        source: PathBuf,
        #[arg(short = 'n', long)]
        name: Option<String>,
    },
    /// Write a file's contents to stdout
    Cat {
        #[arg(index = 1)]
        image: PathBuf,
        #[arg(index = 2)]
        name: String,
    },
}

fn mount(image: &Path) -> Result<Volume<ImageFile>> {
    let device = ImageFile::open(image).wrap_err("Couldn't open disk image")?;
    Volume::init(device).wrap_err("Failed to load volume")
}

fn mount_formatted(image: &Path) -> Result<Volume<ImageFile>> {
    let volume = mount(image)?;
    ensure!(
        volume.is_formatted(),
        "{image:?} is not formatted, run `rsfs format` first"
    );
    Ok(volume)
}

fn unmount(volume: Volume<ImageFile>) -> Result<()> {
    volume
        .into_device()
        .sync()
        .wrap_err("Failed to flush disk image")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();
    trace!("Starting up rsfs cli");
    match cli.command {
        Command::Mkimage { image, sectors } => {
            let mut device =
                ImageFile::create(&image, sectors).wrap_err("Failed to create disk image")?;
            device.sync()?;
            println!(
                "created {image:?}: {sectors} sectors ({} bytes)",
                sectors * SECTOR_SIZE as u64
            );
        }
        Command::Format { image } => {
            let mut volume = mount(&image)?;
            volume.format().wrap_err("Failed to format volume")?;
            println!("{} bytes free", volume.free_space()?);
            unmount(volume)?;
        }
        Command::Ls { image } => {
            let volume = mount_formatted(&image)?;
            print!("{}", volume.list()?);
        }
        Command::Df { image } => {
            let volume = mount_formatted(&image)?;
            println!("{} bytes free", volume.free_space()?);
        }
        Command::Touch { image, name } => {
            let mut volume = mount_formatted(&image)?;
            volume
                .create(&name)
                .wrap_err_with(|| format!("Failed to create {name:?}"))?;
            unmount(volume)?;
        }
        Command::Rm { image, name } => {
            let mut volume = mount_formatted(&image)?;
            volume
                .remove(&name)
                .wrap_err_with(|| format!("Failed to remove {name:?}"))?;
            unmount(volume)?;
        }
        Command::Put {
            image,
            source,
            name,
        } => {
            let data = std::fs::read(&source)
                .wrap_err_with(|| format!("Couldn't read {source:?}"))?;
            let name = match name {
                Some(name) => name,
                None => source
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(str::to_owned)
                    .ok_or_else(|| eyre::eyre!("{source:?} has no usable file name"))?,
            };
            let mut volume = mount_formatted(&image)?;
            let handle = volume.open(&name, Mode::Write)?;
            let written = volume
                .write(handle, &data)
                .wrap_err_with(|| format!("Failed to write {name:?}"))?;
            volume.close(handle)?;
            unmount(volume)?;
            println!("wrote {written} bytes to {name:?}");
        }
        Command::Cat { image, name } => {
            let mut volume = mount_formatted(&image)?;
            let handle = volume.open(&name, Mode::Read)?;
            let mut stdout = std::io::stdout().lock();
            let mut buf = vec![0; 64 * 1024];
            loop {
                let n = volume.read(handle, &mut buf)?;
                if n == 0 {
                    break;
                }
                stdout.write_all(&buf[..n])?;
            }
            stdout.flush()?;
            volume.close(handle)?;
            unmount(volume)?;
        }
    }
    Ok(())
}
