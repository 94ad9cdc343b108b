use std::fs::{read, File};
use std::io::{self, Write};

use main_error::MainError;
use pico_args::Arguments;

use esp8266_flasher::connection::SerialPortLink;
use esp8266_flasher::flasher::{FlashFrequency, FlashMode, FlashSize, ROM_BAUD_DEFAULT};
use esp8266_flasher::{Bundle, Config, Flasher, ProgressCallbacks, Segment, StubDescriptor};

const DEFAULT_STUB_BAUD: u32 = 921_600;

fn help() -> &'static str {
    "Usage:\n  \
     esp8266-flasher chip-id <port>\n  \
     esp8266-flasher flash-id <port>\n  \
     esp8266-flasher read-flash <port> <addr> <size> --stub <file> [-o <out>]\n  \
     esp8266-flasher write-flash <port> <addr> <file> --stub <file> [--reboot]\n  \
     esp8266-flasher write-bundle <port> <bundle.zip> --stub <file> [--firmware-only] [--reboot]"
}

fn parse_addr(text: &str) -> Result<u32, std::num::ParseIntError> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    }
}

struct CliProgress {
    label: u32,
}

impl ProgressCallbacks for CliProgress {
    fn init(&mut self, addr: u32, total: usize) {
        self.label = addr;
        log::info!("writing {total} bytes at {addr:#010x}");
    }

    fn update(&mut self, current: usize) {
        log::debug!("segment {:#010x}: {current} bytes written", self.label);
    }

    fn finish(&mut self) {
        log::info!("segment {:#010x} verified", self.label);
    }
}

fn load_stub(path: &str) -> Result<StubDescriptor, MainError> {
    let json = std::fs::read_to_string(path)?;
    Ok(StubDescriptor::from_json(&json)?)
}

fn main() -> Result<(), MainError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = Arguments::from_env();
    if args.contains(["-h", "--help"]) {
        println!("{}", help());
        return Ok(());
    }

    let stub_path: Option<String> = args.opt_value_from_str("--stub")?;
    let out_path: Option<String> = args.opt_value_from_str("-o")?;

    let command = args.free_from_str::<String>()?;
    let port: String = args.free_from_str()?;

    let mut config = Config::new(port);
    config.rom_baud = args
        .opt_value_from_str("--baud")?
        .unwrap_or(ROM_BAUD_DEFAULT);
    config.stub_baud = args
        .opt_value_from_str("--stub-baud")?
        .unwrap_or(DEFAULT_STUB_BAUD);
    config.reboot = args.contains("--reboot");
    config.firmware_only = args.contains("--firmware-only");

    let link = SerialPortLink::open(&config.port, config.rom_baud)?;
    let mut flasher = Flasher::new(link);
    flasher.connect()?;

    match command.as_str() {
        "chip-id" => {
            let id = flasher.chip_id()?;
            println!("chip id: {id:#010x}");
        }
        "flash-id" => {
            let id = flasher.flash_id()?;
            println!("flash id: {id:#010x}");
        }
        "read-flash" => {
            let addr = parse_addr(&args.free_from_str::<String>()?)?;
            let size: u32 = args.free_from_str()?;
            let stub = load_stub(&stub_path.expect("--stub is required"))?;
            flasher.load_stub(&stub, config.stub_baud)?;
            let data = flasher.read_flash(addr, size)?;
            match out_path {
                Some(path) => File::create(path)?.write_all(&data)?,
                None => io::stdout().write_all(&data)?,
            }
        }
        "write-flash" => {
            let addr = parse_addr(&args.free_from_str::<String>()?)?;
            let file: String = args.free_from_str()?;
            let stub = load_stub(&stub_path.expect("--stub is required"))?;
            flasher.load_stub(&stub, config.stub_baud)?;

            let mut segment = Segment::new(addr, read(&file)?);
            let mut progress = CliProgress { label: addr };
            flasher.write_segments(
                std::slice::from_mut(&mut segment),
                FlashMode::Dio,
                FlashSize::Flash4M,
                FlashFrequency::Freq40M,
                &mut progress,
            )?;

            if config.reboot {
                flasher.reboot()?;
            }
        }
        "write-bundle" => {
            let bundle_path: String = args.free_from_str()?;
            let stub = load_stub(&stub_path.expect("--stub is required"))?;
            flasher.load_stub(&stub, config.stub_baud)?;

            let file = File::open(&bundle_path)?;
            let mut bundle = Bundle::load(file, config.firmware_only)?;
            log::info!(
                "bundle version {}, {} segment(s)",
                bundle.version.as_deref().unwrap_or("<none>"),
                bundle.segments.len()
            );

            let mut progress = CliProgress { label: 0 };
            flasher.write_segments(
                &mut bundle.segments,
                FlashMode::Dio,
                FlashSize::Flash4M,
                FlashFrequency::Freq40M,
                &mut progress,
            )?;

            if config.reboot {
                flasher.reboot()?;
            }
        }
        other => {
            eprintln!("unknown command {other:?}\n{}", help());
        }
    }

    Ok(())
}
