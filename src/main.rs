use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use avrflash::format;
use avrflash::part::PartDb;
use avrflash::programmer::{
    Programmer,
    buspirate::BusPirate,
    ch341a::{self, Ch341a},
    stk500::{Stk500, Variant},
    usbasp::{self, UsbAsp},
};
use avrflash::session::{MemoryImage, Session};
use avrflash::transport::{SerialTransport, UsbDevice};

#[derive(clap::Parser)]
#[command(
    name = "avrflash",
    about = "Command-line in-system programmer for AVR microcontrollers",
    version
)]
struct Cli {
    /// Target part name, id or alias, e.g. m328p
    #[arg(short = 'p', long, global = true)]
    part: Option<String>,

    /// Programmer adapter type
    #[arg(short = 'c', long, global = true, value_enum)]
    programmer: Option<ProgrammerKind>,

    /// Serial port of the programmer
    #[arg(short = 'P', long, global = true)]
    port: Option<String>,

    /// Serial baud rate
    #[arg(short = 'b', long, global = true)]
    baudrate: Option<u32>,

    /// Bit clock period in microseconds
    #[arg(short = 'B', long, global = true)]
    bitclock: Option<f64>,

    /// Carry on despite a device signature mismatch
    #[arg(short = 'F', long, global = true)]
    force: bool,

    /// Extended programmer parameter, key or key=value; repeatable
    #[arg(short = 'x', long = "ext", global = true)]
    extended: Vec<String>,

    /// More output; repeat for wire-level traces
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Warnings and errors only
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// List the parts in the device database
    Parts,
    /// Show part, memory and programmer details
    Info,
    /// Perform a chip erase
    Erase,
    /// Read a memory region into a file, or hexdump it to the terminal
    Read {
        /// Memory name: flash, eeprom, lfuse, hfuse, efuse, lock, ...
        memory: String,
        path: Option<PathBuf>,
    },
    /// Write a firmware file to a memory region
    Write { memory: String, path: PathBuf },
    /// Compare a memory region against a firmware file
    Verify { memory: String, path: PathBuf },
    /// Chip-erase, program flash and verify
    Flash { path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum ProgrammerKind {
    /// Atmel STK500 version 1.x firmware
    Stk500v1,
    /// Target-resident STK500v1 bootloader (optiboot and friends)
    Arduino,
    /// Crossbow MIB510 programming board
    Mib510,
    /// USBasp USB adapter
    Usbasp,
    /// CH341A USB-SPI bridge
    Ch341a,
    /// Bus Pirate universal serial interface
    Buspirate,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.quiet {
        simplelog::LevelFilter::Warn
    } else {
        match cli.verbose {
            0 => simplelog::LevelFilter::Info,
            1 => simplelog::LevelFilter::Debug,
            _ => simplelog::LevelFilter::Trace,
        }
    };
    let _ = simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    if let Command::Parts = cli.command {
        let db = PartDb::load()?;
        for part in db.iter() {
            println!(
                "{:<8} {:<12} signature 0x{}",
                part.id,
                part.name,
                hex::encode(part.signature)
            );
        }
        return Ok(());
    }

    let part_spec = cli
        .part
        .as_deref()
        .context("-p/--part is required; try the `parts` subcommand")?;
    let part = PartDb::find(part_spec)?;

    let pgm = open_programmer(&cli)?;
    let mut session = Session::start(pgm, part, cli.force)?;

    let result = run(&cli.command, &mut session);
    let finish = session.finish();
    result?;
    finish
}

fn open_programmer(cli: &Cli) -> Result<Box<dyn Programmer>> {
    let kind = cli
        .programmer
        .context("-c/--programmer is required, e.g. -c usbasp")?;
    let bitclock = cli.bitclock.map(|us| us * 1e-6);

    let serial = |default_baud: u32| -> Result<SerialTransport> {
        let port = cli
            .port
            .as_deref()
            .context("-P/--port is required for serial programmers")?;
        Ok(SerialTransport::open(
            port,
            cli.baudrate.unwrap_or(default_baud),
        )?)
    };

    match kind {
        ProgrammerKind::Stk500v1 | ProgrammerKind::Arduino | ProgrammerKind::Mib510 => {
            let variant = match kind {
                ProgrammerKind::Arduino => Variant::Bootloader,
                ProgrammerKind::Mib510 => Variant::Mib510,
                _ => Variant::Stk500,
            };
            let mut pgm = Stk500::new(serial(115200)?, variant);
            pgm.parse_extended_params(&cli.extended)?;
            if let Some(period) = bitclock {
                pgm.set_bitclock(period);
            }
            Ok(Box::new(pgm))
        }
        ProgrammerKind::Usbasp => {
            let dev = match UsbDevice::open(
                usbasp::USBASP_SHARED_VID,
                usbasp::USBASP_SHARED_PID,
                Some("www.fischl.de"),
                Some("USBasp"),
            ) {
                Ok(dev) => dev,
                Err(e) => {
                    // Pre-release adapters used an unofficial Atmel id.
                    match UsbDevice::open(
                        usbasp::USBASP_OLD_VID,
                        usbasp::USBASP_OLD_PID,
                        Some("www.fischl.de"),
                        Some("USBasp"),
                    ) {
                        Ok(dev) => {
                            log::warn!(
                                "found USBasp with old VID/PID; please update its firmware"
                            );
                            dev
                        }
                        Err(_) => return Err(e.into()),
                    }
                }
            };
            let mut pgm = UsbAsp::new(dev, bitclock.unwrap_or(0.0));
            pgm.parse_extended_params(&cli.extended)?;
            Ok(Box::new(pgm))
        }
        ProgrammerKind::Ch341a => {
            let dev = UsbDevice::open_bulk(
                ch341a::CH341A_VID,
                ch341a::CH341A_PID,
                ch341a::CH341A_BULK_OUT,
                ch341a::CH341A_BULK_IN,
            )?;
            Ok(Box::new(Ch341a::new(dev)))
        }
        ProgrammerKind::Buspirate => {
            let mut pgm = BusPirate::new(serial(115200)?);
            pgm.parse_extended_params(&cli.extended)?;
            Ok(Box::new(pgm))
        }
    }
}

fn run(command: &Command, session: &mut Session) -> Result<()> {
    match command {
        Command::Parts => unreachable!("handled before a session starts"),
        Command::Info => session.dump_info(),
        Command::Erase => session.chip_erase(),
        Command::Read { memory, path } => {
            let data = session.read_memory(memory)?;
            match path {
                Some(path) => {
                    format::write_image_to_file(path, &data)?;
                    log::info!("wrote {} bytes to {}", data.len(), path.display());
                }
                None => {
                    let stdout = std::io::stdout();
                    let mut out = stdout.lock();
                    hxdmp::hexdump(&data, &mut out)?;
                    writeln!(out)?;
                }
            }
            Ok(())
        }
        Command::Write { memory, path } => {
            let image = load_image(session, memory, path)?;
            session.write_memory(memory, &image)?;
            Ok(())
        }
        Command::Verify { memory, path } => {
            let image = load_image(session, memory, path)?;
            session.verify_memory(memory, &image)?;
            log::info!("verified");
            Ok(())
        }
        Command::Flash { path } => {
            let image = load_image(session, "flash", path)?;
            session.chip_erase()?;
            session.write_memory("flash", &image)?;
            session.verify_memory("flash", &image)?;
            log::info!("flashed and verified");
            Ok(())
        }
    }
}

fn load_image(session: &Session, memory: &str, path: &PathBuf) -> Result<MemoryImage> {
    let size = session
        .part()
        .memory(memory)
        .with_context(|| format!("part {} has no {} memory", session.part().name, memory))?
        .size as usize;
    let bytes = format::read_image_from_file(path)?;
    log::info!("input is {} bytes", bytes.len());
    MemoryImage::from_bytes(&bytes, size)
}
