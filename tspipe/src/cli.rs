//! Command-line parsing: global options, the `-I` / `-P` / `-O` stage
//! chain, and the optional TOML configuration file.
//!
//! The command line has the shape
//! `tspipe [global-opts] [-I name [opts]] [-P name [opts]]... [-O name [opts]]`.
//! The chain markers split the argument vector before clap sees it: the
//! prefix is parsed as [`GlobalArgs`], every block is handed to its stage's
//! own parser by the registry.

use std::path::PathBuf;

use clap::error::ErrorKind;
use clap::{ArgAction, CommandFactory, Parser};

use crate::stages::ListFilter;

/// Stage kind markers recognised in the argument stream.
const MARKERS: [(&str, StageKind); 3] = [
    ("-I", StageKind::Input),
    ("-P", StageKind::Processor),
    ("-O", StageKind::Output),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageKind {
    Input,
    Processor,
    Output,
}

/// MPEG transport stream processor
#[derive(Debug, Parser)]
#[command(
    name = "tspipe",
    version,
    about = "MPEG transport stream processor",
    after_help = "Stages:\n  \
        -I name [options...]   input stage (default: file, standard input)\n  \
        -P name [options...]   packet processor stage, in chain order\n  \
        -O name [options...]   output stage (default: file, standard output)\n\n\
        Each stage accepts its own --help."
)]
pub struct GlobalArgs {
    /// Insert <nullpkt> null packets every <inpkt> input packets
    #[arg(
        short = 'a',
        long,
        value_name = "NULLPKT/INPKT",
        value_parser = parse_stuffing_ratio
    )]
    pub add_input_stuffing: Option<(u64, u64)>,

    /// Prepend this number of null packets before the input
    #[arg(long, value_name = "COUNT", default_value_t = 0)]
    pub add_start_stuffing: u64,

    /// Append this number of null packets after the end of input
    #[arg(long, value_name = "COUNT", default_value_t = 0)]
    pub add_stop_stuffing: u64,

    /// Override the input bitrate, in bits/second
    #[arg(short, long)]
    pub bitrate: Option<u64>,

    /// Bitrate recomputation period in seconds
    #[arg(long, value_name = "SECONDS")]
    pub bitrate_adjust_interval: Option<u64>,

    /// Packet buffer size in mebibytes
    #[arg(long, value_name = "MB")]
    pub buffer_size_mb: Option<usize>,

    /// Configuration file; ./tspipe.toml is auto-detected
    #[arg(short = 'f', long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Debug level
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        num_args = 0..=1,
        default_missing_value = "1"
    )]
    pub debug: Option<u8>,

    /// Disable joint termination
    #[arg(short = 'i', long)]
    pub ignore_joint_termination: bool,

    /// List the available stages and exit
    #[arg(
        short,
        long,
        value_name = "WHICH",
        num_args = 0..=1,
        default_missing_value = "all",
        value_enum
    )]
    pub list_processors: Option<ListFilter>,

    /// Log file; console only by default
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Buffered message count of the asynchronous logger
    #[arg(long, value_name = "COUNT", default_value_t = 512)]
    pub log_message_count: usize,

    /// Maximum packets a processor handles before passing them on
    #[arg(long, value_name = "COUNT")]
    pub max_flushed_packets: Option<usize>,

    /// Maximum packets per input operation
    #[arg(long, value_name = "COUNT")]
    pub max_input_packets: Option<usize>,

    /// Run a background resource monitoring thread
    #[arg(short, long)]
    pub monitor: bool,

    /// Use real-time defaults (yes/no)
    #[arg(
        short,
        long,
        value_name = "FLAG",
        num_args = 0..=1,
        default_missing_value = "yes",
        value_parser = parse_flag
    )]
    pub realtime: Option<bool>,

    /// Never drop log messages
    #[arg(short, long)]
    pub synchronous_log: bool,

    /// Timestamp each log line
    #[arg(short, long)]
    pub timed_log: bool,

    /// Verbose output
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

/// One stage specification from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    /// Registry name.
    pub name: String,
    /// Arguments following the name, up to the next marker.
    pub args: Vec<String>,
}

/// The fully split command line.
#[derive(Debug)]
pub struct CommandLine {
    /// Global options.
    pub global: GlobalArgs,
    /// Input stage; `file` (standard input) when omitted.
    pub input: StageSpec,
    /// Processor chain, in order.
    pub processors: Vec<StageSpec>,
    /// Output stage; `file` (standard output) when omitted.
    pub output: StageSpec,
}

/// Split and parse the argument vector (`argv[0]` included).
pub fn parse_command_line(args: &[String]) -> Result<CommandLine, clap::Error> {
    // The global options end at the first stage marker.
    let first_marker = args
        .iter()
        .position(|a| MARKERS.iter().any(|(m, _)| m == a))
        .unwrap_or(args.len());
    let global = GlobalArgs::try_parse_from(&args[..first_marker])?;

    let mut input = None;
    let mut output = None;
    let mut processors = Vec::new();

    let mut index = first_marker;
    while index < args.len() {
        let kind = MARKERS
            .iter()
            .find(|(m, _)| *m == args[index])
            .map(|(_, k)| *k)
            .ok_or_else(|| usage_error(format!("unexpected argument '{}'", args[index])))?;

        let name = args
            .get(index + 1)
            .filter(|n| !n.starts_with('-'))
            .cloned()
            .ok_or_else(|| usage_error(format!("missing stage name after {}", args[index])))?;

        let mut stage_args = Vec::new();
        index += 2;
        while index < args.len() && !MARKERS.iter().any(|(m, _)| *m == args[index]) {
            stage_args.push(args[index].clone());
            index += 1;
        }
        let spec = StageSpec {
            name,
            args: stage_args,
        };

        match kind {
            StageKind::Input => {
                if input.replace(spec).is_some() {
                    return Err(usage_error("only one input stage (-I) is allowed"));
                }
            }
            StageKind::Output => {
                if output.replace(spec).is_some() {
                    return Err(usage_error("only one output stage (-O) is allowed"));
                }
            }
            StageKind::Processor => processors.push(spec),
        }
    }

    let default_file = StageSpec {
        name: "file".into(),
        args: Vec::new(),
    };
    Ok(CommandLine {
        global,
        input: input.unwrap_or_else(|| default_file.clone()),
        processors,
        output: output.unwrap_or(default_file),
    })
}

fn usage_error(msg: impl std::fmt::Display) -> clap::Error {
    GlobalArgs::command().error(ErrorKind::InvalidValue, msg)
}

fn parse_stuffing_ratio(value: &str) -> Result<(u64, u64), String> {
    let (nullpkt, inpkt) = value
        .split_once('/')
        .ok_or_else(|| "expected <nullpkt>/<inpkt>".to_string())?;
    let nullpkt = nullpkt
        .parse()
        .map_err(|_| format!("invalid packet count '{nullpkt}'"))?;
    let inpkt: u64 = inpkt
        .parse()
        .map_err(|_| format!("invalid packet count '{inpkt}'"))?;
    if inpkt == 0 {
        return Err("the input packet interval must be positive".into());
    }
    Ok((nullpkt, inpkt))
}

fn parse_flag(value: &str) -> Result<bool, String> {
    match value {
        "yes" | "true" | "on" => Ok(true),
        "no" | "false" | "off" => Ok(false),
        _ => Err(format!("invalid flag value '{value}', use yes or no")),
    }
}

/// Configuration file format (`tspipe.toml`). Command-line values take
/// precedence over the file.
#[derive(Debug, serde::Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, serde::Deserialize, Default)]
pub struct EngineSection {
    pub buffer_size_mb: Option<usize>,
    pub bitrate_adjust_interval: Option<u64>,
    pub max_flushed_packets: Option<usize>,
    pub max_input_packets: Option<usize>,
    pub realtime: Option<bool>,
}

#[derive(Debug, serde::Deserialize, Default)]
pub struct LoggingSection {
    pub file: Option<String>,
    pub timed: Option<bool>,
    pub synchronous: Option<bool>,
    pub message_count: Option<usize>,
}

/// Load the configuration file: the explicit `--config` path, or
/// `tspipe.toml` in the working directory when present.
pub fn load_config(explicit: Option<&PathBuf>) -> Result<ConfigFile, String> {
    let path = match explicit {
        Some(path) => path.clone(),
        None => {
            let default_path = PathBuf::from("tspipe.toml");
            if !default_path.exists() {
                return Ok(ConfigFile::default());
            }
            default_path
        }
    };
    let contents = std::fs::read_to_string(&path)
        .map_err(|e| format!("cannot read config file {}: {e}", path.display()))?;
    toml::from_str(&contents).map_err(|e| format!("invalid config file {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(line: &str) -> Vec<String> {
        std::iter::once("tspipe".to_string())
            .chain(line.split_whitespace().map(|s| s.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_without_stages() {
        let cmd = parse_command_line(&argv("")).unwrap();
        assert_eq!(cmd.input.name, "file");
        assert_eq!(cmd.output.name, "file");
        assert!(cmd.processors.is_empty());
        assert!(!cmd.global.ignore_joint_termination);
    }

    #[test]
    fn test_chain_splitting() {
        let cmd = parse_command_line(&argv(
            "-b 5000000 -I null 1000 -P mux side.ts --inter-packet 100 -P pass -O drop",
        ))
        .unwrap();
        assert_eq!(cmd.global.bitrate, Some(5_000_000));
        assert_eq!(cmd.input.name, "null");
        assert_eq!(cmd.input.args, vec!["1000"]);
        assert_eq!(cmd.processors.len(), 2);
        assert_eq!(cmd.processors[0].name, "mux");
        assert_eq!(
            cmd.processors[0].args,
            vec!["side.ts", "--inter-packet", "100"]
        );
        assert_eq!(cmd.processors[1].name, "pass");
        assert_eq!(cmd.output.name, "drop");
        assert!(cmd.output.args.is_empty());
    }

    #[test]
    fn test_stage_options_may_look_like_globals() {
        // Everything after a stage name up to the next marker belongs to
        // that stage, including options spelled like global ones.
        let cmd = parse_command_line(&argv("-I file in.ts --repeat 2 -O file out.ts")).unwrap();
        assert_eq!(cmd.input.args, vec!["in.ts", "--repeat", "2"]);
        assert_eq!(cmd.output.args, vec!["out.ts"]);
    }

    #[test]
    fn test_duplicate_input_rejected() {
        assert!(parse_command_line(&argv("-I null -I file x.ts")).is_err());
    }

    #[test]
    fn test_missing_stage_name_rejected() {
        assert!(parse_command_line(&argv("-I -O drop")).is_err());
    }

    #[test]
    fn test_stuffing_ratio() {
        let cmd = parse_command_line(&argv("-a 2/100")).unwrap();
        assert_eq!(cmd.global.add_input_stuffing, Some((2, 100)));
        assert!(parse_command_line(&argv("-a 2-100")).is_err());
        assert!(parse_command_line(&argv("-a 2/0")).is_err());
    }

    #[test]
    fn test_realtime_flag_values() {
        let cmd = parse_command_line(&argv("--realtime no")).unwrap();
        assert_eq!(cmd.global.realtime, Some(false));
        let cmd = parse_command_line(&argv("-I null")).unwrap();
        assert_eq!(cmd.global.realtime, None);
    }

    #[test]
    fn test_list_processors_default_value() {
        let cmd = parse_command_line(&argv("--list-processors")).unwrap();
        assert_eq!(cmd.global.list_processors, Some(ListFilter::All));
        let cmd = parse_command_line(&argv("-l input")).unwrap();
        assert_eq!(cmd.global.list_processors, Some(ListFilter::Input));
    }

    #[test]
    fn test_config_merge_sections() {
        let config: ConfigFile = toml::from_str(
            "[engine]\nbuffer_size_mb = 32\nrealtime = true\n[logging]\ntimed = true\n",
        )
        .unwrap();
        assert_eq!(config.engine.buffer_size_mb, Some(32));
        assert_eq!(config.engine.realtime, Some(true));
        assert_eq!(config.logging.timed, Some(true));
        assert_eq!(config.logging.file, None);
    }
}
