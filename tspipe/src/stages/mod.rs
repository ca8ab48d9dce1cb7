//! Built-in stages and the name registry the CLI resolves them through.

pub mod crypto_period;
pub mod drop;
pub mod file;
pub mod mux;
pub mod null;
pub mod pass;
pub mod pcrextract;
pub mod scrambler;

use clap::Parser;
use thiserror::Error;

use crate::stage::{InputStage, OutputStage, ProcessorStage};

/// Stage construction failure.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The stage name is not registered for this kind.
    #[error("unknown {kind} stage '{name}', try --list-processors")]
    Unknown {
        /// Stage kind: input, packet or output.
        kind: &'static str,
        /// The requested name.
        name: String,
    },

    /// The stage rejected its options (also carries --help/--version
    /// displays).
    #[error(transparent)]
    Usage(#[from] clap::Error),
}

const INPUTS: &[(&str, &str)] = &[
    ("file", "Read packets from a file"),
    ("null", "Generate null packets"),
];

const PROCESSORS: &[(&str, &str)] = &[
    ("mux", "Insert TS packets from a file in the transport stream"),
    ("pass", "Pass packets through unchanged"),
    ("pcrextract", "Extract PCR, OPCR, PTS, DTS from TS packets"),
    ("scrambler", "Scramble a service or a list of PIDs"),
];

const OUTPUTS: &[(&str, &str)] = &[
    ("drop", "Discard all packets"),
    ("file", "Write packets to a file"),
];

fn parse_stage_args<T: Parser>(name: &str, args: &[String]) -> Result<T, RegistryError> {
    let argv = std::iter::once(name.to_string()).chain(args.iter().cloned());
    Ok(T::try_parse_from(argv)?)
}

/// Construct an input stage by name.
pub fn create_input(name: &str, args: &[String]) -> Result<Box<dyn InputStage>, RegistryError> {
    match name {
        "file" => Ok(Box::new(file::FileInput::new(parse_stage_args(name, args)?))),
        "null" => Ok(Box::new(null::NullInput::new(parse_stage_args(name, args)?))),
        _ => Err(RegistryError::Unknown {
            kind: "input",
            name: name.to_string(),
        }),
    }
}

/// Construct a processor stage by name.
pub fn create_processor(
    name: &str,
    args: &[String],
) -> Result<Box<dyn ProcessorStage>, RegistryError> {
    match name {
        "mux" => Ok(Box::new(mux::Mux::new(parse_stage_args(name, args)?))),
        "pass" => Ok(Box::new(pass::Pass::new(parse_stage_args(name, args)?))),
        "pcrextract" => Ok(Box::new(pcrextract::PcrExtract::new(parse_stage_args(
            name, args,
        )?))),
        "scrambler" => Ok(Box::new(scrambler::Scrambler::new(parse_stage_args(
            name, args,
        )?))),
        _ => Err(RegistryError::Unknown {
            kind: "packet",
            name: name.to_string(),
        }),
    }
}

/// Construct an output stage by name.
pub fn create_output(name: &str, args: &[String]) -> Result<Box<dyn OutputStage>, RegistryError> {
    match name {
        "drop" => Ok(Box::new(drop::DropOutput::new(parse_stage_args(name, args)?))),
        "file" => Ok(Box::new(file::FileOutput::new(parse_stage_args(name, args)?))),
        _ => Err(RegistryError::Unknown {
            kind: "output",
            name: name.to_string(),
        }),
    }
}

/// Listing filter for `--list-processors`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ListFilter {
    /// Every stage kind.
    All,
    /// Input stages only.
    Input,
    /// Output stages only.
    Output,
    /// Packet processor stages only.
    Packet,
}

/// Human-readable stage listing.
pub fn list_stages(filter: ListFilter) -> String {
    let mut out = String::new();
    let mut section = |title: &str, rows: &[(&str, &str)]| {
        out.push_str(title);
        out.push_str(":\n");
        for (name, about) in rows {
            out.push_str(&format!("  {name:<12} {about}\n"));
        }
    };
    if matches!(filter, ListFilter::All | ListFilter::Input) {
        section("Input stages", INPUTS);
    }
    if matches!(filter, ListFilter::All | ListFilter::Packet) {
        section("Packet processor stages", PROCESSORS);
    }
    if matches!(filter, ListFilter::All | ListFilter::Output) {
        section("Output stages", OUTPUTS);
    }
    out
}

/// Parse a PID value, decimal or 0x-prefixed hexadecimal.
pub fn parse_pid(value: &str) -> Result<u16, String> {
    let pid = parse_u16_value(value)?;
    if pid as usize >= crate::ts::PID_MAX {
        return Err(format!("PID 0x{pid:X} out of range (13 bits)"));
    }
    Ok(pid)
}

/// Parse a u16, decimal or 0x-prefixed hexadecimal.
pub fn parse_u16_value(value: &str) -> Result<u16, String> {
    parse_u32_value(value)?
        .try_into()
        .map_err(|_| format!("value {value} out of range"))
}

/// Parse a u32, decimal or 0x-prefixed hexadecimal.
pub fn parse_u32_value(value: &str) -> Result<u32, String> {
    let result = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    result.map_err(|_| format!("invalid numeric value '{value}'"))
}

/// Decode a hexadecimal byte string.
pub fn parse_hex_bytes(value: &str) -> Result<Vec<u8>, String> {
    if value.len() % 2 != 0 {
        return Err("specify an even number of hexadecimal digits".into());
    }
    (0..value.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&value[i..i + 2], 16)
                .map_err(|_| format!("invalid hexadecimal digits '{}'", &value[i..i + 2]))
        })
        .collect()
}
