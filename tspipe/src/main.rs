//! tspipe: streaming MPEG transport stream processor.
//!
//! Reads 188-byte TS packets from an input stage, routes every packet
//! through an ordered chain of processor stages over a shared ring buffer
//! (one thread per stage), and writes the result to an output stage.

use std::process::ExitCode;
use std::time::Duration;

use log::{error, info};

mod bitrate;
mod cli;
mod ecmg;
mod error;
mod logging;
mod pipeline;
mod scramble;
mod service;
mod stage;
mod stages;
mod ts;

use cli::{parse_command_line, CommandLine, ConfigFile};
use pipeline::{run_pipeline, Pipeline, PipelineConfig};
use stage::Plugin;
use stages::RegistryError;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let command = match parse_command_line(&args) {
        Ok(command) => command,
        Err(err) => err.exit(),
    };

    if let Some(filter) = command.global.list_processors {
        print!("{}", stages::list_stages(filter));
        return ExitCode::SUCCESS;
    }

    let config = match cli::load_config(command.global.config.as_ref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("tspipe: {err}");
            return ExitCode::FAILURE;
        }
    };

    let log_options = logging::LogOptions {
        verbose: command.global.verbose,
        debug: command.global.debug,
        timed: command.global.timed_log || config.logging.timed.unwrap_or(false),
        synchronous: command.global.synchronous_log
            || config.logging.synchronous.unwrap_or(false),
        log_file: command
            .global
            .log_file
            .clone()
            .or_else(|| config.logging.file.as_ref().map(Into::into)),
        message_count: config
            .logging
            .message_count
            .unwrap_or(command.global.log_message_count),
    };
    if let Err(err) = logging::init_logging(&log_options) {
        eprintln!("tspipe: {err}");
        return ExitCode::FAILURE;
    }

    match run(command, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Usage(err)) => err.exit(),
        Err(RunError::Failed) => ExitCode::FAILURE,
    }
}

enum RunError {
    /// Bad stage options, or a --help/--version display.
    Usage(clap::Error),
    /// Startup or runtime failure, already logged.
    Failed,
}

impl From<RegistryError> for RunError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Usage(usage) => RunError::Usage(usage),
            RegistryError::Unknown { .. } => {
                error!("{err}");
                RunError::Failed
            }
        }
    }
}

fn run(command: CommandLine, config: ConfigFile) -> Result<(), RunError> {
    let CommandLine {
        global,
        input,
        processors,
        output,
    } = command;

    let realtime = global
        .realtime
        .or(config.engine.realtime)
        .unwrap_or(false);

    let mut pipeline_config = PipelineConfig::defaults_for(realtime);
    if let Some(mb) = global.buffer_size_mb.or(config.engine.buffer_size_mb) {
        pipeline_config.buffer_size_mb = mb;
    }
    if let Some(count) = global
        .max_flushed_packets
        .or(config.engine.max_flushed_packets)
    {
        pipeline_config.max_flush_pkt = count.max(1);
    }
    if let Some(count) = global.max_input_packets.or(config.engine.max_input_packets) {
        pipeline_config.max_input_pkt = count.max(1);
    }
    pipeline_config.ignore_joint_termination = global.ignore_joint_termination;
    pipeline_config.bitrate = global.bitrate;
    pipeline_config.bitrate_adjust_interval = Duration::from_secs(
        global
            .bitrate_adjust_interval
            .or(config.engine.bitrate_adjust_interval)
            .unwrap_or(5),
    );
    if let Some((nullpkt, inpkt)) = global.add_input_stuffing {
        pipeline_config.stuffing.nullpkt = nullpkt;
        pipeline_config.stuffing.inpkt = inpkt;
    }
    pipeline_config.stuffing.start = global.add_start_stuffing;
    pipeline_config.stuffing.stop = global.add_stop_stuffing;

    // Construct the chain in command-line order, then let the pipeline
    // validate its shape.
    let mut chain: Vec<(String, Plugin)> = Vec::with_capacity(processors.len() + 2);
    chain.push((
        input.name.clone(),
        Plugin::Input(stages::create_input(&input.name, &input.args)?),
    ));
    for spec in &processors {
        chain.push((
            spec.name.clone(),
            Plugin::Processor(stages::create_processor(&spec.name, &spec.args)?),
        ));
    }
    chain.push((
        output.name.clone(),
        Plugin::Output(stages::create_output(&output.name, &output.args)?),
    ));
    let pipeline = Pipeline::from_chain(chain).map_err(|err| {
        error!("{err}");
        RunError::Failed
    })?;

    if global.monitor {
        spawn_resource_monitor();
    }

    match run_pipeline(pipeline_config, pipeline) {
        Ok(()) => Ok(()),
        Err(err) => {
            error!("{err}");
            Err(RunError::Failed)
        }
    }
}

/// Background resource monitor (`--monitor`): periodically logs process
/// memory usage, when the platform exposes it.
fn spawn_resource_monitor() {
    std::thread::Builder::new()
        .name("tspipe-mon".into())
        .spawn(|| loop {
            std::thread::sleep(Duration::from_secs(60));
            match std::fs::read_to_string("/proc/self/statm") {
                Ok(statm) => {
                    let pages: u64 = statm
                        .split_whitespace()
                        .nth(1)
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0);
                    info!("resource monitor: resident memory {} KB", pages * 4);
                }
                Err(_) => info!("resource monitor: alive"),
            }
        })
        .ok();
}
