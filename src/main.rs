use std::fs::File;
use std::io::{self, BufReader};
use std::process;

use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{Level, LevelFilter, Metadata, Record};

use c4vm::host::{Host, HostFs};
use c4vm::loader::{self, Image};
use c4vm::memory::{Width, Word, DEFAULT_POOL_SIZE, MAX_MEMORY};
use c4vm::opcode::OpcodeTable;
use c4vm::printf::Printf;
use c4vm::vm::{Dispatch, Vm, VmConfig};

// --- Logging ---

/// Writes every enabled record to stderr.
struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if record.target() == "c4vm::trace" {
            eprintln!("{}", record.args());
        } else {
            eprintln!("[{:<5} {}] {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logging(verbosity: u8, trace: bool) {
    let mut level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    // Trace lines are debug records.
    if trace && level < Level::Debug {
        level = LevelFilter::Debug;
    }
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

// --- Command Line ---

fn setup_cli() -> Command {
    Command::new("c4vm")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Runs compiled C4 program images")
        .arg(
            Arg::new("image")
                .help("The program image to run")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("args")
                .help("Arguments passed to the program's main")
                .index(2)
                .num_args(0..)
                .trailing_var_arg(true)
                .allow_hyphen_values(true),
        )
        .arg(
            Arg::new("verbose")
                .help("Log more (repeat for more detail)")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count),
        )
        .arg(
            Arg::new("trace")
                .help("Print every instruction before it executes")
                .long("trace")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("dispatch")
                .help("Instruction dispatch strategy")
                .long("dispatch")
                .value_parser(["table", "specialized"])
                .default_value("specialized"),
        )
        .arg(
            Arg::new("pool-size")
                .help("Initial memory size in bytes [default: 262144]")
                .long("pool-size")
                .value_parser(clap::value_parser!(usize))
                .value_name("BYTES"),
        )
        .arg(
            Arg::new("max-memory")
                .help("Memory ceiling in bytes [default: 33554432]")
                .long("max-memory")
                .value_parser(clap::value_parser!(usize))
                .value_name("BYTES"),
        )
}

fn config_from(matches: &ArgMatches) -> VmConfig {
    let dispatch = match matches.get_one::<String>("dispatch").map(String::as_str) {
        Some("table") => Dispatch::Table,
        _ => Dispatch::Specialized,
    };
    VmConfig {
        pool_size: matches.get_one::<usize>("pool-size").copied().unwrap_or(DEFAULT_POOL_SIZE),
        max_memory: matches.get_one::<usize>("max-memory").copied().unwrap_or(MAX_MEMORY),
        dispatch,
        trace: matches.get_flag("trace"),
    }
}

// --- Execution ---

fn read_image(path: &str) -> Result<Image, loader::ImageError> {
    let mut reader = BufReader::new(File::open(path)?);
    Image::read_from(&mut reader)
}

/// Loads and runs `image` on a `W`-wide VM, returning the process exit status.
fn execute<W: Word>(image: &Image, args: &[String], config: VmConfig) -> i32 {
    let mut vm = match Vm::<W>::new(OpcodeTable::standard(), config) {
        Ok(vm) => vm,
        Err(e) => {
            eprintln!("VM initialization error: {}", e);
            return 1;
        }
    };
    if let Err(e) = loader::load(&mut vm, image, args) {
        eprintln!("Load error: {}", e);
        return 1;
    }

    let mut fs = HostFs::new();
    let mut printf = Printf::new(W::WIDTH);
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut host = Host::new(&mut fs, &mut printf, &mut out);

    match vm.run(&mut host) {
        Ok(code) => code.to_i64() as i32,
        Err(e) => {
            eprintln!("\n--- VM Runtime Error ---");
            eprintln!("{}", e);
            eprintln!("{}", vm.dump_registers());
            eprint!("{}", vm.dump_stack(20));
            1
        }
    }
}

fn main() {
    let matches = setup_cli().get_matches();
    init_logging(matches.get_count("verbose"), matches.get_flag("trace"));

    let Some(path) = matches.get_one::<String>("image") else {
        eprintln!("No program image given. Use --help for more information.");
        process::exit(1);
    };
    let image = match read_image(path) {
        Ok(image) => image,
        Err(e) => {
            eprintln!("Error reading image '{}': {}", path, e);
            process::exit(1);
        }
    };

    // The program sees its own image path as argv[0].
    let mut args = vec![path.clone()];
    if let Some(rest) = matches.get_many::<String>("args") {
        args.extend(rest.cloned());
    }

    let config = config_from(&matches);
    let status = match image.width {
        Width::W32 => execute::<i32>(&image, &args, config),
        Width::W64 => execute::<i64>(&image, &args, config),
    };
    process::exit(status);
}
