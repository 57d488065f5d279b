//! Shared fixtures for engine tests: canned topologies, test modules, and
//! synchronous command driving.

use cadenza_engine::buffers::StreamData;
use cadenza_engine::modules::{Passthrough, SignalEndpoint};
use cadenza_engine::{
    AudioModule, CmdAck, Command, ConnDef, Container, ContainerConfig, ContainerHandle, EventCtx,
    ExtInDecl, ExtOutDecl, GraphOpenPayload, MediaFmtDecl, ModuleDef, ModuleFlags, PortRef,
    ThresholdDecl, TriggerKind,
};
use cadenza_protocol::{
    ChannelDesc, DataBuf, DataMsg, InPortMsg, MediaFormat, ModuleIid, OutPortMsg, PortId,
    SubgraphId,
};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const SG: SubgraphId = SubgraphId::new(1);
pub const SRC_IID: ModuleIid = ModuleIid::new(0x1001);
pub const MID_IID: ModuleIid = ModuleIid::new(0x1002);
pub const IN_PORT: PortId = PortId::new(2);
pub const OUT_PORT: PortId = PortId::new(1);

/// Consumes everything offered and counts it.
pub struct CountingSink {
    pub consumed: Arc<AtomicUsize>,
}

impl AudioModule for CountingSink {
    fn process(
        &mut self,
        _ctx: &mut EventCtx,
        inputs: &mut [StreamData],
        _outputs: &mut [StreamData],
    ) -> cadenza_engine::Result<()> {
        for input in inputs {
            self.consumed.fetch_add(input.bufs.actual_len_total(), Ordering::Relaxed);
            // consume all offered bytes
        }
        Ok(())
    }
}

/// A data-trigger-policy module: holds data while closed, passes it through
/// while open.
pub struct GateModule {
    pub open: Arc<AtomicBool>,
}

pub const PARAM_ID_GATE_OPEN: u32 = 0x0800_2001;

impl AudioModule for GateModule {
    fn process(
        &mut self,
        _ctx: &mut EventCtx,
        inputs: &mut [StreamData],
        outputs: &mut [StreamData],
    ) -> cadenza_engine::Result<()> {
        if !self.open.load(Ordering::Relaxed) {
            for input in inputs {
                for b in &mut input.bufs.bufs {
                    b.actual_len = 0; // consume nothing
                }
            }
            return Ok(());
        }
        if let (Some(input), Some(output)) = (inputs.first_mut(), outputs.first_mut()) {
            let (consumed, _) = cadenza_engine::modules::copy_streams(input, output);
            for b in &mut input.bufs.bufs {
                b.actual_len = consumed.min(b.actual_len);
            }
        }
        Ok(())
    }

    fn set_param(
        &mut self,
        ctx: &mut EventCtx,
        param_id: u32,
        payload: &[u8],
    ) -> cadenza_engine::Result<()> {
        if param_id == PARAM_ID_GATE_OPEN {
            self.open.store(payload.first().copied().unwrap_or(0) != 0, Ordering::Relaxed);
            ctx.raise_trigger_policy_change();
            Ok(())
        } else {
            Err(cadenza_engine::EngineError::Unsupported("gate param".into()))
        }
    }

    fn is_trigger_satisfied(
        &self,
        kind: TriggerKind,
        _inputs: &[StreamData],
        _outputs: &[StreamData],
    ) -> bool {
        kind == TriggerKind::Data && self.open.load(Ordering::Relaxed)
    }
}

/// Endpoints of a two-module SISO container fixture.
pub struct SisoFixture {
    pub container: Container,
    pub handle: ContainerHandle,
    pub in_tx: Sender<InPortMsg>,
    pub out_rx: Receiver<OutPortMsg>,
    pub ret_tx: Sender<DataMsg>,
    pub timer_tx: Sender<Instant>,
    pub mf: MediaFormat,
}

pub struct SisoOptions {
    pub cfg: ContainerConfig,
    pub mf: MediaFormat,
    /// First module is signal-triggered with this threshold when set.
    pub endpoint_thresh_bytes: Option<u64>,
    /// Middle module raises its own threshold when set.
    pub mid_thresh_bytes: Option<u64>,
    /// Replace the middle module's processor.
    pub mid_processor: Option<Box<dyn AudioModule>>,
    pub mid_flags: ModuleFlags,
}

impl Default for SisoOptions {
    fn default() -> Self {
        Self {
            cfg: ContainerConfig::default(),
            mf: MediaFormat::pcm(2, 48_000, 16),
            endpoint_thresh_bytes: None,
            mid_thresh_bytes: None,
            mid_processor: None,
            mid_flags: ModuleFlags::empty(),
        }
    }
}

/// Build (but do not open) a container with an ext-in → endpoint → mid →
/// ext-out chain and submit the open command.
pub fn build_siso(opts: SisoOptions) -> SisoFixture {
    let mut container = Container::new(opts.cfg);
    let handle = container.handle();

    let (timer_tx, timer_rx) = bounded::<Instant>(64);
    container.attach_timer(timer_rx);

    let (in_tx, in_rx) = bounded::<InPortMsg>(16);
    let (out_tx, out_rx) = bounded::<OutPortMsg>(16);
    let (ret_tx, ret_rx) = bounded::<DataMsg>(16);

    let mut src_flags = ModuleFlags::NEEDS_THRESHOLD_CFG;
    let mut thresholds = Vec::new();
    if let Some(bytes) = opts.endpoint_thresh_bytes {
        src_flags |= ModuleFlags::NEEDS_SIGNAL_TRIGGER;
        thresholds.push(ThresholdDecl {
            port: PortRef { id: IN_PORT, is_input: true },
            bytes,
        });
    }

    let open = GraphOpenPayload {
        subgraphs: vec![SG],
        modules: vec![
            ModuleDef {
                iid: SRC_IID,
                sg: SG,
                flags: src_flags,
                inplace: false,
                headroom_bytes_per_ch: 0,
                in_ports: vec![IN_PORT],
                out_ports: vec![OUT_PORT],
                thresholds,
                media_fmts: vec![MediaFmtDecl {
                    port: PortRef { id: IN_PORT, is_input: true },
                    mf: opts.mf.clone(),
                }],
                processor: Box::new(SignalEndpoint::default()),
            },
            ModuleDef {
                iid: MID_IID,
                sg: SG,
                flags: opts.mid_flags,
                inplace: false,
                headroom_bytes_per_ch: 0,
                in_ports: vec![IN_PORT],
                out_ports: vec![OUT_PORT],
                thresholds: opts
                    .mid_thresh_bytes
                    .map(|bytes| {
                        vec![ThresholdDecl {
                            port: PortRef { id: IN_PORT, is_input: true },
                            bytes,
                        }]
                    })
                    .unwrap_or_default(),
                media_fmts: opts
                    .mid_thresh_bytes
                    .map(|_| {
                        vec![MediaFmtDecl {
                            port: PortRef { id: IN_PORT, is_input: true },
                            mf: opts.mf.clone(),
                        }]
                    })
                    .unwrap_or_default(),
                processor: opts.mid_processor.unwrap_or_else(|| Box::new(Passthrough)),
            },
        ],
        connections: vec![ConnDef { from: (SRC_IID, OUT_PORT), to: (MID_IID, IN_PORT) }],
        ext_ins: vec![ExtInDecl { module: SRC_IID, port: IN_PORT, rx: in_rx }],
        ext_outs: vec![ExtOutDecl { module: MID_IID, port: OUT_PORT, tx: out_tx, buf_rx: ret_rx }],
    };

    let ack = exec(&mut container, &handle, Command::GraphOpen(open));
    assert!(ack.code.is_ok(), "graph open failed: {:?}", ack.code);

    SisoFixture { container, handle, in_tx, out_rx, ret_tx, timer_tx, mf: opts.mf }
}

/// Submit a command and drive the container until the ack arrives.
pub fn exec(container: &mut Container, handle: &ContainerHandle, cmd: Command) -> CmdAck {
    let ack_rx = handle.send(cmd);
    for _ in 0..100 {
        if let Ok(ack) = ack_rx.try_recv() {
            return ack;
        }
        container.poll_once(Some(Duration::from_millis(10)));
    }
    panic!("command not acknowledged");
}

/// A filled v1 data message.
pub fn frame_v1(bytes: usize, fill: u8) -> DataMsg {
    let mut msg = DataMsg::empty_v1(bytes);
    if let DataBuf::V1 { data, actual_len } = &mut msg.buf {
        data.fill(fill);
        *actual_len = bytes;
    }
    msg
}

/// A filled v2 data message with equal per-channel segments.
pub fn frame_v2(num_ch: usize, bytes_per_ch: usize, fill: u8) -> DataMsg {
    let mut msg = DataMsg::empty_v2(num_ch, bytes_per_ch);
    if let DataBuf::V2 { data, channels } = &mut msg.buf {
        data.fill(fill);
        for c in channels.iter_mut() {
            c.actual_len = bytes_per_ch as u32;
        }
    }
    msg
}

/// Total valid bytes of an outgoing data message.
pub fn msg_len(msg: &OutPortMsg) -> usize {
    match msg {
        OutPortMsg::Data(d) => d.actual_len_total(),
        _ => 0,
    }
}

/// Collect the per-channel descriptors of a v2 message.
pub fn v2_descs(msg: &DataMsg) -> Vec<ChannelDesc> {
    match &msg.buf {
        DataBuf::V2 { channels, .. } => channels.clone(),
        _ => Vec::new(),
    }
}
