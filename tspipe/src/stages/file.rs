//! `file` input and output stages, plus the packet-file reader shared with
//! the mux stage.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use clap::Parser;
use log::{debug, info};

use crate::error::StageError;
use crate::stage::{InputStage, OutputStage, Stage, StageLink};
use crate::ts::{TsPacket, PKT_SIZE, SYNC_BYTE};

/// Reads 188-byte packet records from a file, with optional start offset
/// and repetition.
pub struct TsFileReader {
    path: PathBuf,
    reader: PacketSource,
    start_offset: u64,
    /// Remaining playouts; `None` means infinite.
    repeats_left: Option<u64>,
}

enum PacketSource {
    File(BufReader<File>),
    Stdin(io::Stdin),
}

impl TsFileReader {
    /// Open `path`. `repeat` of zero means infinite repetition, one means a
    /// single playout. `start_offset` is a byte offset applied at open and
    /// at every repetition.
    pub fn open(path: &Path, repeat: u64, start_offset: u64) -> Result<Self, StageError> {
        let mut file = File::open(path)
            .map_err(|e| StageError::Options(format!("cannot open {}: {e}", path.display())))?;
        if start_offset > 0 {
            file.seek(SeekFrom::Start(start_offset))?;
        }
        debug!(
            "opened {} (repeat: {}, byte offset: {start_offset})",
            path.display(),
            if repeat == 0 { "infinite".to_string() } else { repeat.to_string() },
        );
        Ok(TsFileReader {
            path: path.to_path_buf(),
            reader: PacketSource::File(BufReader::new(file)),
            start_offset,
            repeats_left: if repeat == 0 { None } else { Some(repeat - 1) },
        })
    }

    /// Read from standard input (single playout, no offset).
    pub fn stdin() -> Self {
        TsFileReader {
            path: PathBuf::from("-"),
            reader: PacketSource::Stdin(io::stdin()),
            start_offset: 0,
            repeats_left: Some(0),
        }
    }

    /// Displayable source name.
    pub fn name(&self) -> String {
        self.path.display().to_string()
    }

    /// Read up to `buf.len()` packets. Returns the number read; zero means
    /// the file (and all repetitions) is exhausted.
    pub fn read(&mut self, buf: &mut [TsPacket]) -> Result<usize, StageError> {
        let mut n = 0;
        while n < buf.len() {
            match self.read_one(buf[n].bytes_mut())? {
                true => n += 1,
                false => {
                    if !self.rewind()? {
                        break;
                    }
                }
            }
        }
        Ok(n)
    }

    // Fill one 188-byte record. False at end of the current playout.
    fn read_one(&mut self, record: &mut [u8; PKT_SIZE]) -> Result<bool, StageError> {
        let mut got = 0;
        while got < PKT_SIZE {
            let n = match &mut self.reader {
                PacketSource::File(r) => r.read(&mut record[got..])?,
                PacketSource::Stdin(r) => r.read(&mut record[got..])?,
            };
            if n == 0 {
                if got == 0 {
                    return Ok(false);
                }
                return Err(StageError::Runtime(format!(
                    "{}: file size is not a multiple of {PKT_SIZE} bytes",
                    self.name()
                )));
            }
            got += n;
        }
        if record[0] != SYNC_BYTE {
            return Err(StageError::Runtime(format!(
                "{}: synchronization lost, invalid sync byte 0x{:02X}",
                self.name(),
                record[0]
            )));
        }
        Ok(true)
    }

    // Seek back for the next playout. False when no repetition remains.
    fn rewind(&mut self) -> Result<bool, StageError> {
        match self.repeats_left {
            Some(0) => return Ok(false),
            Some(ref mut left) => *left -= 1,
            None => {}
        }
        match &mut self.reader {
            PacketSource::File(r) => {
                r.seek(SeekFrom::Start(self.start_offset))?;
                Ok(true)
            }
            PacketSource::Stdin(_) => Ok(false),
        }
    }
}

/// Read packets from a file
#[derive(Debug, Parser)]
#[command(name = "file", version, about = "Read packets from a file")]
pub struct FileInputArgs {
    /// Input file of 188-byte packets; standard input when omitted
    #[arg(value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// Start reading at this byte offset
    #[arg(long, default_value_t = 0, conflicts_with = "packet_offset")]
    pub byte_offset: u64,

    /// Start reading at this packet index
    #[arg(long, default_value_t = 0)]
    pub packet_offset: u64,

    /// Repeat the file this number of times; 0 means endlessly
    #[arg(short, long)]
    pub repeat: Option<u64>,
}

/// The `file` input stage.
pub struct FileInput {
    args: FileInputArgs,
    reader: Option<TsFileReader>,
}

impl FileInput {
    /// Build the stage from parsed options.
    pub fn new(args: FileInputArgs) -> Self {
        FileInput { args, reader: None }
    }
}

impl Stage for FileInput {
    fn start(&mut self, _link: &StageLink) -> Result<(), StageError> {
        let reader = match &self.args.file {
            Some(path) => {
                let offset = if self.args.byte_offset > 0 {
                    self.args.byte_offset
                } else {
                    self.args.packet_offset * PKT_SIZE as u64
                };
                TsFileReader::open(path, self.args.repeat.unwrap_or(1), offset)?
            }
            None => {
                if self.args.repeat.is_some()
                    || self.args.byte_offset > 0
                    || self.args.packet_offset > 0
                {
                    return Err(StageError::Options(
                        "--repeat and offsets require a regular input file".into(),
                    ));
                }
                TsFileReader::stdin()
            }
        };
        self.reader = Some(reader);
        Ok(())
    }
}

impl InputStage for FileInput {
    fn receive(&mut self, buf: &mut [TsPacket]) -> Result<usize, StageError> {
        match self.reader.as_mut() {
            Some(reader) => reader.read(buf),
            None => Ok(0),
        }
    }
}

/// Write packets to a file
#[derive(Debug, Parser)]
#[command(name = "file", version, about = "Write packets to a file")]
pub struct FileOutputArgs {
    /// Output file; standard output when omitted
    #[arg(value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// Append to the output file instead of truncating it
    #[arg(short, long)]
    pub append: bool,
}

enum PacketSink {
    File(BufWriter<File>),
    Stdout(io::Stdout),
}

/// The `file` output stage.
pub struct FileOutput {
    args: FileOutputArgs,
    sink: Option<PacketSink>,
    written: u64,
}

impl FileOutput {
    /// Build the stage from parsed options.
    pub fn new(args: FileOutputArgs) -> Self {
        FileOutput {
            args,
            sink: None,
            written: 0,
        }
    }
}

impl Stage for FileOutput {
    fn start(&mut self, _link: &StageLink) -> Result<(), StageError> {
        self.written = 0;
        self.sink = Some(match &self.args.file {
            Some(path) => {
                let file = File::options()
                    .write(true)
                    .create(true)
                    .append(self.args.append)
                    .truncate(!self.args.append)
                    .open(path)
                    .map_err(|e| {
                        StageError::Options(format!("cannot create {}: {e}", path.display()))
                    })?;
                PacketSink::File(BufWriter::new(file))
            }
            None => PacketSink::Stdout(io::stdout()),
        });
        Ok(())
    }

    fn stop(&mut self) -> Result<(), StageError> {
        if let Some(sink) = self.sink.as_mut() {
            match sink {
                PacketSink::File(w) => w.flush()?,
                PacketSink::Stdout(w) => w.flush()?,
            }
        }
        info!("wrote {} packets", self.written);
        Ok(())
    }
}

impl OutputStage for FileOutput {
    fn send(&mut self, pkts: &[TsPacket]) -> Result<(), StageError> {
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| StageError::Runtime("output not started".into()))?;
        for pkt in pkts {
            match sink {
                PacketSink::File(w) => w.write_all(pkt.bytes())?,
                PacketSink::Stdout(w) => w.write_all(pkt.bytes())?,
            }
        }
        self.written += pkts.len() as u64;
        Ok(())
    }
}
