use clap::error::ErrorKind;
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};
use std::io::Write as _;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use vpd_core::export::shell_preamble;
use vpd_core::{
    Container, ExportFormat, Flash, Flashrom, FlashromConfig, LoadOptions, Mode, Pad, Region,
    Session, VpdError,
};

#[derive(Parser, Debug)]
#[command(
    name = "vpd",
    about = "Read and edit VPD key/value pairs stored in a firmware image",
    after_help = "Multiple -s and -d may be given; -s is always applied before -d.\n\
                  -g and -l are mutually exclusive.",
    version
)]
struct Cli {
    /// Image file to load and save; the flash chip is used when omitted
    #[arg(short = 'f', long = "file", value_name = "FILE")]
    file: Option<PathBuf>,
    /// VPD partition name in the flash map (RO_VPD or RW_VPD)
    #[arg(short = 'i', long = "partition", default_value = "RO_VPD", value_parser = parse_region)]
    partition: Region,
    /// Add or change a string value
    #[arg(short = 's', long = "string", value_name = "KEY=VALUE")]
    set: Vec<String>,
    /// Add or change a string value, reading its base64 contents from a file
    #[arg(short = 'S', long = "base64file", value_name = "KEY=FILE")]
    set_file: Vec<String>,
    /// Pad the following -s/-S values to this length with zeros (negative: no padding)
    #[arg(short = 'p', long = "pad", value_parser = parse_int, allow_negative_numbers = true)]
    pad: Vec<i64>,
    /// Delete a key
    #[arg(short = 'd', long = "delete", value_name = "KEY")]
    delete: Vec<String>,
    /// Print the value of one key only
    #[arg(short = 'g', long = "filter", value_name = "KEY")]
    get: Option<String>,
    /// List content
    #[arg(short = 'l', long = "list")]
    list: bool,
    /// With -l: dump content as vpd command parameters
    #[arg(long = "sh")]
    sh: bool,
    /// With -l: dump content as NUL terminated key=value records
    #[arg(short = '0', long = "null-terminated")]
    null_terminated: bool,
    /// With -l: dump content as a JSON object
    #[arg(long)]
    json: bool,
    /// Parse FILE as a bare VPD 2.0 stream (no headers); read only
    #[arg(long)]
    raw: bool,
    /// Overwrite and re-format the VPD partition
    #[arg(short = 'O', long)]
    overwrite: bool,
    /// ROM address of the VPD partition, used for the table offsets
    #[arg(short = 'E', long = "eps-base", value_parser = parse_u32)]
    eps_base: Option<u32>,
    /// flashrom executable
    #[arg(long, default_value = "flashrom")]
    flashrom: PathBuf,
    /// flashrom programmer (-p)
    #[arg(long, default_value = "internal")]
    programmer: String,
    /// Debug logging on stderr
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn parse_region(s: &str) -> Result<Region, String> {
    s.parse::<Region>().map_err(|e| e.to_string())
}

// Accepts decimal, 0x-prefixed hex and 0-prefixed octal, like strtol(.., 0).
fn parse_int(s: &str) -> Result<i64, String> {
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let v = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16)
    } else if digits.len() > 1 && digits.starts_with('0') {
        i64::from_str_radix(&digits[1..], 8)
    } else {
        digits.parse::<i64>()
    }
    .map_err(|_| format!("not a number: {s}"))?;
    Ok(if neg { -v } else { v })
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let v = parse_int(s)?;
    u32::try_from(v).map_err(|_| format!("address out of range: {s}"))
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

// Usage errors share the Syntax exit status; help and version still exit 0.
fn usage_error(e: clap::Error) -> ! {
    match e.kind() {
        ErrorKind::DisplayHelp
        | ErrorKind::DisplayVersion
        | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => e.exit(),
        _ => {
            let _ = e.print();
            std::process::exit(VpdError::Syntax(String::new()).exit_code());
        }
    }
}

fn main() {
    let matches = Cli::command()
        .try_get_matches()
        .unwrap_or_else(|e| usage_error(e));
    let cli = Cli::from_arg_matches(&matches).unwrap_or_else(|e| usage_error(e));
    init_tracing(cli.verbose);
    if let Err(e) = run(&cli, &matches) {
        eprintln!("error: {}", e);
        std::process::exit(e.exit_code());
    }
}

fn export_format(cli: &Cli) -> ExportFormat {
    if cli.sh {
        ExportFormat::ShellParameter
    } else if cli.null_terminated {
        ExportFormat::NullTerminated
    } else if cli.json {
        ExportFormat::Json
    } else {
        ExportFormat::KeyValue
    }
}

fn check_usage(cli: &Cli) -> Result<(), VpdError> {
    if cli.list && cli.get.is_some() {
        return Err(VpdError::Syntax("-l and -g must be mutually exclusive".into()));
    }
    let formats = [cli.sh, cli.null_terminated, cli.json];
    if formats.iter().any(|&f| f) && !cli.list {
        return Err(VpdError::Syntax(
            "--sh/--null-terminated/--json can be set only if -l is set".into(),
        ));
    }
    if formats.iter().filter(|&&f| f).count() > 1 {
        return Err(VpdError::Syntax("choose one output format".into()));
    }
    if cli.raw && cli.file.is_none() {
        return Err(VpdError::Syntax("needs -f FILE for raw input".into()));
    }
    if cli.raw
        && (!cli.set.is_empty() || !cli.set_file.is_empty() || !cli.delete.is_empty() || cli.overwrite)
    {
        return Err(VpdError::Syntax("changing in raw mode is not supported".into()));
    }
    Ok(())
}

fn stdout_write(bytes: &[u8]) -> Result<(), VpdError> {
    let mut out = std::io::stdout().lock();
    out.write_all(bytes)
        .and_then(|_| out.flush())
        .map_err(|e| VpdError::io("writing output", "<stdout>", e))
}

/// Padding for each value of `id`: the last `-p` that precedes it on the
/// command line, or none.
fn pads_for(matches: &ArgMatches, id: &str) -> Vec<(usize, Pad)> {
    let pads: Vec<(usize, i64)> = match (matches.indices_of("pad"), matches.get_many::<i64>("pad")) {
        (Some(at), Some(values)) => at.zip(values.copied()).collect(),
        _ => Vec::new(),
    };
    matches
        .indices_of(id)
        .map(|at| {
            at.map(|i| {
                let pad = pads
                    .iter()
                    .rev()
                    .find(|&&(p, _)| p < i)
                    .map(|&(_, n)| Pad::from_arg(n))
                    .unwrap_or_default();
                (i, pad)
            })
            .collect()
        })
        .unwrap_or_default()
}

fn run(cli: &Cli, matches: &ArgMatches) -> Result<(), VpdError> {
    check_usage(cli)?;

    // -s and -S are applied in command-line order.
    let mut assignments: Vec<(usize, &str, bool, Pad)> = Vec::new();
    for ((at, pad), arg) in pads_for(matches, "set").into_iter().zip(&cli.set) {
        assignments.push((at, arg.as_str(), false, pad));
    }
    for ((at, pad), arg) in pads_for(matches, "set_file").into_iter().zip(&cli.set_file) {
        assignments.push((at, arg.as_str(), true, pad));
    }
    assignments.sort_by_key(|&(at, ..)| at);
    let mut set_args = Container::new();
    for (_, arg, from_file, pad) in assignments {
        vpd_core::args::add_assignment(&mut set_args, arg, from_file, pad)?;
    }
    let mut del_args = Container::new();
    for key in &cli.delete {
        del_args.set(key.as_bytes(), b"", Pad::Len(0));
    }

    debug!(set = set_args.len(), delete = del_args.len(), pads = ?cli.pad, "parsed edits");

    let opts = LoadOptions {
        region: cli.partition,
        mode: if cli.raw { Mode::Raw } else { Mode::Structured },
        overwrite: cli.overwrite,
        eps_base: cli.eps_base,
    };
    let mut flash = Flashrom::new(FlashromConfig {
        program: cli.flashrom.clone(),
        programmer: cli.programmer.clone(),
    });
    let mut session = match &cli.file {
        Some(path) => Session::load_file(path, opts, Some(&mut flash as &mut dyn Flash))?,
        None => Session::load_flash(&mut flash, opts)?,
    };

    let mut modified = cli.overwrite;
    modified |= session.apply_edits(&set_args, &del_args)?;

    if let Some(key) = &cli.get {
        stdout_write(session.value_of(key.as_bytes())?)?;
    }

    if cli.list {
        let format = export_format(cli);
        let mut text = String::new();
        if format == ExportFormat::ShellParameter {
            let program = std::env::args().next().unwrap_or_else(|| "vpd".to_string());
            text.push_str(&shell_preamble(
                &program,
                session.region().as_str(),
                cli.file.as_deref(),
            ));
        }
        text.push_str(&session.export(format));
        stdout_write(text.as_bytes())?;
    }

    if modified {
        debug!(pairs = session.pairs().len(), "saving");
        session.save(Some(&mut flash as &mut dyn Flash))?;
    }
    Ok(())
}
