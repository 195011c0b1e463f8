use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};
use simplelog::{
    ColorChoice, CombinedLogger, Config, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    time::Duration,
};
use trigq::{
    utils::format_bytes, AcquisitionEngine, Conf, DigitizerDriver, EventReader, EventWriter,
    Monitor, MonitorExit, RawEvent, SimulatedBus, WriterSettings,
};

#[derive(Parser)]
#[command(name = "trigq")]
#[command(about = "Triggered waveform acquisition into compressed event files", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Take a run and write its events to disk
    Run {
        /// Configuration file (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Log to the terminal instead of showing the status monitor
        #[arg(long)]
        headless: bool,
    },

    /// Print events from a file or file series
    Dump {
        /// Event file, series prefix, or directory
        path: PathBuf,

        /// Event position in the series, counting from 0
        #[arg(long, conflicts_with_all = ["id", "last"])]
        index: Option<u64>,

        /// Event id
        #[arg(long, conflicts_with = "last")]
        id: Option<u32>,

        /// Only the last event of the series
        #[arg(long)]
        last: bool,

        /// Events to print when reading sequentially
        #[arg(long, default_value = "10")]
        count: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config, headless } => run(&config, headless),
        Commands::Dump {
            path,
            index,
            id,
            last,
            count,
        } => dump(&path, index, id, last, count),
    }
}

fn init_logging(conf: &Conf, headless: bool) -> Result<()> {
    fs::create_dir_all(&conf.run.output_dir)?;
    let base = conf.run.base_name.trim_end_matches(".out");
    let log_path = Path::new(&conf.run.output_dir).join(format!("{}.log", base));
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![WriteLogger::new(
        LevelFilter::Info,
        Config::default(),
        File::create(&log_path)
            .with_context(|| format!("creating log file {}", log_path.display()))?,
    )];
    // the monitor owns the screen otherwise
    if headless {
        loggers.push(TermLogger::new(
            LevelFilter::Info,
            Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ));
    }
    CombinedLogger::init(loggers)?;
    Ok(())
}

fn run(config: &Path, headless: bool) -> Result<()> {
    let conf = Conf::load(config)
        .with_context(|| format!("loading configuration {}", config.display()))?;
    init_logging(&conf, headless)?;
    if conf.boards.is_empty() {
        bail!("no boards configured in {}", config.display());
    }

    let bus = SimulatedBus::with_codes(&vec![conf.simulation.variant_code; conf.boards.len()]);
    bus.set_noise(1.0);
    let triggers = bus.clone();
    let driver = DigitizerDriver::new(bus, &conf);
    let mut engine = AcquisitionEngine::with_capacity(Box::new(driver), conf.run.queue_capacity)?;
    engine.initialize()?;
    if conf.simulation.trigger_interval_ms > 0 {
        triggers.set_trigger_interval(Some(Duration::from_millis(
            conf.simulation.trigger_interval_ms,
        )));
    }

    let mut writer = EventWriter::new(WriterSettings::from_run(&conf.run));
    writer.initialize()?;

    let mut monitor = Monitor::new(&conf);
    let result = if headless {
        monitor.run(&mut engine, &mut writer, None)
    } else {
        let mut terminal = ratatui::init();
        let result = monitor.run(&mut engine, &mut writer, Some(&mut terminal));
        ratatui::restore();
        result
    };

    let snapshot = conf.snapshot()?;
    writer.finalize(Some(&snapshot))?;
    info!(
        "Wrote {} events ({}) to {} files",
        writer.events_written(),
        format_bytes(writer.bytes_written()),
        writer.file_index() + 1
    );

    match result? {
        MonitorExit::Fault(status) => bail!("run {} stopped on {:?}", conf.run.run_id, status),
        _ => Ok(()),
    }
}

fn dump(path: &Path, index: Option<u64>, id: Option<u32>, last: bool, count: usize) -> Result<()> {
    TermLogger::init(
        LevelFilter::Warn,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )?;
    let mut reader = EventReader::open(path)?;
    if let Some(header) = reader.global_header() {
        println!(
            "run {} file {} events {} ids {}..={} version {}",
            header.run_id,
            header.file_index,
            header.nevents,
            header.event_id_min,
            header.event_id_max,
            header.global_header_version
        );
    }

    let single = if last {
        Some(reader.get_last_event()?)
    } else if let Some(id) = id {
        Some(reader.get_event_with_id(id)?)
    } else if let Some(index) = index {
        Some(reader.get_event_with_index(index)?)
    } else {
        None
    };

    match single {
        Some(Some(event)) => print_event(&event),
        Some(None) => bail!("no such event in {}", path.display()),
        None => {
            for _ in 0..count {
                match reader.get_next_event()? {
                    Some(event) => print_event(&event),
                    None => break,
                }
            }
        }
    }
    Ok(())
}

fn print_event(event: &RawEvent) {
    println!(
        "event {:>8}  run {}  time {}  {} blocks  {}",
        event.event_id(),
        event.run_id(),
        event.timestamp(),
        event.block_count(),
        format_bytes(event.data_size())
    );
    for (n, block) in event.blocks().iter().enumerate() {
        println!("  block {} {:?} {} bytes", n, block.block_type(), block.size());
    }
}
