//! Pipeline construction and execution.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use super::handoff::Handoff;
use super::ring::PacketRing;
use super::worker::{InputWorker, OutputWorker, ProcessorWorker, StuffingConfig};
use super::PipelineShared;
use crate::bitrate::BitrateMonitor;
use crate::error::{PipelineError, StageError};
use crate::stage::{InputStage, OutputStage, Plugin, ProcessorStage, Stage, StageLink};

/// Resolved engine options for one run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Ring capacity in mebibytes.
    pub buffer_size_mb: usize,
    /// Maximum packets a processor handles before passing downstream.
    pub max_flush_pkt: usize,
    /// Maximum packets per input operation.
    pub max_input_pkt: usize,
    /// Real-time mode.
    pub realtime: bool,
    /// Disable joint termination.
    pub ignore_joint_termination: bool,
    /// Fixed input bitrate override.
    pub bitrate: Option<u64>,
    /// Bitrate recomputation period.
    pub bitrate_adjust_interval: Duration,
    /// Input stuffing options.
    pub stuffing: StuffingConfig,
}

impl PipelineConfig {
    /// Defaults for the given mode: offline favours throughput with large
    /// batches, real time bounds them to keep latency low.
    pub fn defaults_for(realtime: bool) -> Self {
        PipelineConfig {
            buffer_size_mb: 16,
            max_flush_pkt: if realtime { 1_000 } else { 10_000 },
            max_input_pkt: if realtime { 1_000 } else { usize::MAX },
            realtime,
            ignore_joint_termination: false,
            bitrate: None,
            bitrate_adjust_interval: Duration::from_secs(5),
            stuffing: StuffingConfig::default(),
        }
    }
}

/// A fully constructed processing chain: one input, any number of
/// processors, one output. Each stage carries its registry name for
/// diagnostics.
pub struct Pipeline {
    pub input: (String, Box<dyn InputStage>),
    pub processors: Vec<(String, Box<dyn ProcessorStage>)>,
    pub output: (String, Box<dyn OutputStage>),
}

impl Pipeline {
    /// Assemble a pipeline from an ordered chain of constructed stages:
    /// exactly one input first, then processors, then exactly one output.
    pub fn from_chain(chain: Vec<(String, Plugin)>) -> Result<Self, PipelineError> {
        let shape = |msg: &str| PipelineError::new("pipeline", StageError::Options(msg.into()));

        let mut input: Option<(String, Box<dyn InputStage>)> = None;
        let mut output: Option<(String, Box<dyn OutputStage>)> = None;
        let mut processors = Vec::new();

        for (name, plugin) in chain {
            debug!("chain: {} stage '{name}'", plugin.kind());
            match plugin {
                Plugin::Input(stage) => {
                    if input.is_some() {
                        return Err(shape("only one input stage is allowed"));
                    }
                    if !processors.is_empty() || output.is_some() {
                        return Err(shape("the input stage must come first"));
                    }
                    input = Some((name, stage));
                }
                Plugin::Processor(stage) => {
                    if output.is_some() {
                        return Err(shape("processor stages must precede the output stage"));
                    }
                    processors.push((name, stage));
                }
                Plugin::Output(stage) => {
                    if output.is_some() {
                        return Err(shape("only one output stage is allowed"));
                    }
                    output = Some((name, stage));
                }
            }
        }

        Ok(Pipeline {
            input: input.ok_or_else(|| shape("an input stage is required"))?,
            processors,
            output: output.ok_or_else(|| shape("an output stage is required"))?,
        })
    }
}

/// Run a pipeline to completion.
///
/// Starts every stage in chain order (failing fast before any packet
/// flows), spawns one worker thread per stage, and joins them. Returns the
/// first error any stage recorded.
pub fn run_pipeline(config: PipelineConfig, pipeline: Pipeline) -> Result<(), PipelineError> {
    let shared = PipelineShared::new(config.ignore_joint_termination);
    let capacity = PacketRing::capacity_for_mb(config.buffer_size_mb);
    let ring = Arc::new(PacketRing::new(capacity));

    let Pipeline {
        input: (input_name, mut input),
        processors,
        output: (output_name, mut output),
    } = pipeline;

    info!(
        "starting pipeline: {} -> [{}] -> {} ({} packets buffered, {})",
        input_name,
        processors
            .iter()
            .map(|(n, _)| n.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        output_name,
        capacity,
        if config.realtime { "real-time" } else { "offline" },
    );

    // One boundary per stage: handoffs[0] feeds free slots to the input
    // stage, handoffs[i] links stage i-1 to stage i. The chain is circular.
    let n_stages = processors.len() + 2;
    let handoffs: Vec<Arc<Handoff>> = (0..n_stages)
        .map(|i| Arc::new(Handoff::new(capacity, if i == 0 { capacity } else { 0 })))
        .collect();
    for handoff in &handoffs {
        shared.register_handoff(Arc::clone(handoff));
    }

    // Start stages in chain order, failing fast on the first error.
    let mut processors = processors;
    let mut failure: Option<PipelineError> = None;
    let mut started_procs = 0;
    let mut input_started = false;

    let link = StageLink::new(Arc::clone(&shared), &input_name, config.realtime);
    match input.start(&link) {
        Ok(()) => input_started = true,
        Err(e) => failure = Some(PipelineError::new(&input_name, e)),
    }
    if failure.is_none() {
        for (name, stage) in &mut processors {
            let link = StageLink::new(Arc::clone(&shared), name, config.realtime);
            match stage.start(&link) {
                Ok(()) => started_procs += 1,
                Err(e) => {
                    failure = Some(PipelineError::new(name.as_str(), e));
                    break;
                }
            }
        }
    }
    if failure.is_none() {
        let link = StageLink::new(Arc::clone(&shared), &output_name, config.realtime);
        if let Err(e) = output.start(&link) {
            failure = Some(PipelineError::new(&output_name, e));
        }
    }
    if let Some(err) = failure {
        // Unwind the stages already started, in reverse order.
        for (name, stage) in processors[..started_procs].iter_mut().rev() {
            if let Err(e) = stage.stop() {
                warn!("{name}: error while stopping: {e}");
            }
        }
        if input_started {
            if let Err(e) = input.stop() {
                warn!("{input_name}: error while stopping: {e}");
            }
        }
        return Err(err);
    }

    let mut threads = Vec::with_capacity(n_stages);

    let worker = InputWorker {
        shared: Arc::clone(&shared),
        ring: Arc::clone(&ring),
        free: Arc::clone(&handoffs[0]),
        downstream: Arc::clone(&handoffs[1]),
        stage: input,
        name: input_name.clone(),
        monitor: BitrateMonitor::new(config.bitrate, config.bitrate_adjust_interval),
        max_input_pkt: config.max_input_pkt,
        stuffing: config.stuffing,
    };
    threads.push(spawn_worker("tspipe-in", &input_name, &shared, move || {
        worker.run()
    })?);

    for (i, (name, stage)) in processors.into_iter().enumerate() {
        let worker = ProcessorWorker {
            shared: Arc::clone(&shared),
            ring: Arc::clone(&ring),
            upstream: Arc::clone(&handoffs[i + 1]),
            downstream: Arc::clone(&handoffs[i + 2]),
            stage,
            name: name.clone(),
            max_flush_pkt: config.max_flush_pkt,
        };
        let label = format!("tspipe-p{}", i + 1);
        threads.push(spawn_worker(&label, &name, &shared, move || worker.run())?);
    }

    let worker = OutputWorker {
        shared: Arc::clone(&shared),
        ring: Arc::clone(&ring),
        upstream: Arc::clone(&handoffs[n_stages - 1]),
        free: Arc::clone(&handoffs[0]),
        stage: output,
        name: output_name.clone(),
        max_flush_pkt: config.max_flush_pkt,
    };
    threads.push(spawn_worker("tspipe-out", &output_name, &shared, move || {
        worker.run()
    })?);

    for handle in threads {
        if handle.join().is_err() {
            shared.record_error(
                "pipeline",
                StageError::Runtime("worker thread panicked".into()),
            );
        }
    }
    debug!("pipeline drained");

    match shared.take_error() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn spawn_worker(
    label: &str,
    stage: &str,
    shared: &Arc<PipelineShared>,
    body: impl FnOnce() + Send + 'static,
) -> Result<thread::JoinHandle<()>, PipelineError> {
    thread::Builder::new()
        .name(label.to_string())
        .spawn(body)
        .map_err(|e| {
            shared.request_stop();
            PipelineError::new(stage, StageError::Io(e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{PacketContext, Status};
    use crate::ts::test_support::data_packet;
    use crate::ts::TsPacket;
    use parking_lot::Mutex;

    /// Produces `total` data packets carrying their sequence number in the
    /// payload, on a cycle of PIDs.
    struct SeqInput {
        total: u64,
        produced: u64,
    }

    impl Stage for SeqInput {
        fn start(&mut self, _link: &StageLink) -> Result<(), StageError> {
            Ok(())
        }
    }

    impl InputStage for SeqInput {
        fn receive(&mut self, buf: &mut [TsPacket]) -> Result<usize, StageError> {
            let mut n = 0;
            while n < buf.len() && self.produced < self.total {
                let pid = [0x100u16, 0x101, 0x1FFF][(self.produced % 3) as usize];
                let mut pkt = data_packet(pid, (self.produced % 16) as u8);
                pkt.bytes_mut()[4..12].copy_from_slice(&self.produced.to_be_bytes());
                buf[n] = pkt;
                n += 1;
                self.produced += 1;
            }
            Ok(n)
        }
    }

    /// Endless null source, for joint-termination tests.
    struct EndlessInput;

    impl Stage for EndlessInput {
        fn start(&mut self, _link: &StageLink) -> Result<(), StageError> {
            Ok(())
        }
    }

    impl InputStage for EndlessInput {
        fn receive(&mut self, buf: &mut [TsPacket]) -> Result<usize, StageError> {
            for slot in buf.iter_mut() {
                *slot = TsPacket::null();
            }
            Ok(buf.len())
        }
    }

    /// Pass-through processor.
    struct PassThrough;

    impl Stage for PassThrough {
        fn start(&mut self, _link: &StageLink) -> Result<(), StageError> {
            Ok(())
        }
    }

    impl ProcessorStage for PassThrough {
        fn process(&mut self, _pkt: &mut TsPacket, _ctx: &mut PacketContext) -> Status {
            Status::Ok
        }
    }

    /// Returns End after `limit` packets.
    struct EndAfter {
        limit: u64,
        seen: u64,
    }

    impl Stage for EndAfter {
        fn start(&mut self, _link: &StageLink) -> Result<(), StageError> {
            Ok(())
        }
    }

    impl ProcessorStage for EndAfter {
        fn process(&mut self, _pkt: &mut TsPacket, _ctx: &mut PacketContext) -> Status {
            self.seen += 1;
            if self.seen >= self.limit {
                Status::End
            } else {
                Status::Ok
            }
        }
    }

    /// Declares joint termination done after `limit` packets, then becomes
    /// transparent.
    struct JointAfter {
        limit: u64,
        seen: u64,
        handle: Option<crate::pipeline::JointHandle>,
    }

    impl Stage for JointAfter {
        fn start(&mut self, link: &StageLink) -> Result<(), StageError> {
            self.handle = Some(link.opt_in_joint_termination());
            Ok(())
        }
    }

    impl ProcessorStage for JointAfter {
        fn process(&mut self, _pkt: &mut TsPacket, _ctx: &mut PacketContext) -> Status {
            self.seen += 1;
            if self.seen == self.limit {
                if let Some(handle) = self.handle.as_mut() {
                    handle.terminate();
                }
            }
            Status::Ok
        }
    }

    /// Collects the sequence numbers of everything it receives.
    #[derive(Clone)]
    struct CollectOutput {
        seqs: Arc<Mutex<Vec<u64>>>,
        count: Arc<Mutex<u64>>,
        fail_at: Option<u64>,
    }

    impl CollectOutput {
        fn new(fail_at: Option<u64>) -> Self {
            CollectOutput {
                seqs: Arc::new(Mutex::new(Vec::new())),
                count: Arc::new(Mutex::new(0)),
                fail_at,
            }
        }
    }

    impl Stage for CollectOutput {
        fn start(&mut self, _link: &StageLink) -> Result<(), StageError> {
            Ok(())
        }
    }

    impl OutputStage for CollectOutput {
        fn send(&mut self, pkts: &[TsPacket]) -> Result<(), StageError> {
            let mut count = self.count.lock();
            for pkt in pkts {
                *count += 1;
                if let Some(fail_at) = self.fail_at {
                    if *count >= fail_at {
                        return Err(StageError::Runtime("sink full".into()));
                    }
                }
                if !pkt.is_null() {
                    let mut seq = [0u8; 8];
                    seq.copy_from_slice(&pkt.bytes()[4..12]);
                    self.seqs.lock().push(u64::from_be_bytes(seq));
                }
            }
            Ok(())
        }
    }

    fn small_config() -> PipelineConfig {
        let mut config = PipelineConfig::defaults_for(false);
        // A tiny ring forces wraps and exercises the region protocol.
        config.buffer_size_mb = 1;
        config
    }

    fn run(
        config: PipelineConfig,
        input: Box<dyn InputStage>,
        procs: Vec<Box<dyn ProcessorStage>>,
        output: Box<dyn OutputStage>,
    ) -> Result<(), PipelineError> {
        run_pipeline(
            config,
            Pipeline {
                input: ("test-in".into(), input),
                processors: procs
                    .into_iter()
                    .enumerate()
                    .map(|(i, p)| (format!("test-p{i}"), p))
                    .collect(),
                output: ("test-out".into(), output),
            },
        )
    }

    #[test]
    fn test_from_chain_validates_shape() {
        let chain = vec![
            (
                "in".to_string(),
                Plugin::Input(Box::new(SeqInput {
                    total: 1,
                    produced: 0,
                })),
            ),
            ("p".to_string(), Plugin::Processor(Box::new(PassThrough))),
            (
                "out".to_string(),
                Plugin::Output(Box::new(CollectOutput::new(None))),
            ),
        ];
        assert!(Pipeline::from_chain(chain).is_ok());

        // No input stage.
        let chain = vec![("p".to_string(), Plugin::Processor(Box::new(PassThrough)))];
        assert!(Pipeline::from_chain(chain).is_err());

        // Input after output.
        let chain = vec![
            (
                "out".to_string(),
                Plugin::Output(Box::new(CollectOutput::new(None))),
            ),
            (
                "in".to_string(),
                Plugin::Input(Box::new(SeqInput {
                    total: 1,
                    produced: 0,
                })),
            ),
        ];
        assert!(Pipeline::from_chain(chain).is_err());
    }

    #[test]
    fn test_pass_through_preserves_order() {
        let output = CollectOutput::new(None);
        let seqs = Arc::clone(&output.seqs);
        let count = Arc::clone(&output.count);

        run(
            small_config(),
            Box::new(SeqInput {
                total: 10_000,
                produced: 0,
            }),
            vec![Box::new(PassThrough), Box::new(PassThrough)],
            Box::new(output),
        )
        .unwrap();

        assert_eq!(*count.lock(), 10_000);
        let seqs = seqs.lock();
        // Sequence numbers of non-null packets are strictly increasing:
        // no reorder across the whole chain.
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(seqs.len(), 10_000 - 10_000 / 3);
    }

    #[test]
    fn test_single_slot_ring_makes_progress() {
        let output = CollectOutput::new(None);
        let count = Arc::clone(&output.count);

        // buffer_size_mb 0 degenerates to a one-slot ring.
        let mut config = PipelineConfig::defaults_for(false);
        config.buffer_size_mb = 0;
        config.max_flush_pkt = 1;

        run(
            config,
            Box::new(SeqInput {
                total: 100,
                produced: 0,
            }),
            vec![Box::new(PassThrough)],
            Box::new(output),
        )
        .unwrap();

        assert_eq!(*count.lock(), 100);
    }

    #[test]
    fn test_end_status_terminates_cleanly() {
        let output = CollectOutput::new(None);
        let count = Arc::clone(&output.count);

        run(
            small_config(),
            Box::new(EndlessInput),
            vec![Box::new(EndAfter { limit: 500, seen: 0 })],
            Box::new(output),
        )
        .unwrap();

        // Everything up to and including the End packet reaches the output.
        assert!(*count.lock() >= 500);
    }

    #[test]
    fn test_output_error_propagates() {
        let output = CollectOutput::new(Some(50));

        let err = run(
            small_config(),
            Box::new(EndlessInput),
            vec![Box::new(PassThrough)],
            Box::new(output),
        )
        .unwrap_err();

        assert_eq!(err.stage, "test-out");
    }

    #[test]
    fn test_joint_termination_ends_pipeline() {
        let output = CollectOutput::new(None);
        let count = Arc::clone(&output.count);

        let mut config = small_config();
        config.max_input_pkt = 64;

        run(
            config,
            Box::new(EndlessInput),
            vec![Box::new(JointAfter {
                limit: 100,
                seen: 0,
                handle: None,
            })],
            Box::new(output),
        )
        .unwrap();

        assert!(*count.lock() >= 100);
    }

    #[test]
    fn test_input_stuffing() {
        let output = CollectOutput::new(None);
        let count = Arc::clone(&output.count);
        let seqs = Arc::clone(&output.seqs);

        let mut config = small_config();
        config.stuffing = StuffingConfig {
            nullpkt: 2,
            inpkt: 10,
            start: 5,
            stop: 3,
        };

        // 100 real packets on a non-null PID only.
        struct RealInput {
            inner: SeqInput,
        }
        impl Stage for RealInput {
            fn start(&mut self, _link: &StageLink) -> Result<(), StageError> {
                Ok(())
            }
        }
        impl InputStage for RealInput {
            fn receive(&mut self, buf: &mut [TsPacket]) -> Result<usize, StageError> {
                let n = self.inner.receive(buf)?;
                for pkt in buf[..n].iter_mut() {
                    pkt.set_pid(0x0200);
                }
                Ok(n)
            }
        }

        run(
            config,
            Box::new(RealInput {
                inner: SeqInput {
                    total: 100,
                    produced: 0,
                },
            }),
            vec![],
            Box::new(output),
        )
        .unwrap();

        // 100 real + 5 start + 3 stop + 2 per 10 real packets.
        assert_eq!(*count.lock(), 100 + 5 + 3 + 20);
        assert_eq!(seqs.lock().len(), 100);
    }
}
