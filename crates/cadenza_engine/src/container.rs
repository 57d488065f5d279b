//! The container: a single-threaded cooperative engine owning the module
//! graph, the external port queues, and the multi-signal trigger channel.
//!
//! One worker thread per container waits on three categories of signals:
//! the command queue, the periodic/STM timer, and per-port data or buffer
//! readiness. Exactly one source is serviced per wake; higher mask bits win
//! when several are ready.

use crate::buffers::IcbResult;
use crate::command::{ClientEvent, CommandMsg};
use crate::config::ContainerConfig;
use crate::error::{EngineError, Result};
use crate::events::{EventCtx, FwkEventFlags};
use crate::graph::module::{InPortId, ModuleId, OutPortId, TriggerKind};
use crate::graph::Graph;
use crate::metadata::MetadataList;
use crate::power::PowerState;
use crate::threshold::LcmUnit;
use cadenza_protocol::{
    DataMsg, FrameLenUpdate, InPortMsg, MediaFormat, OutPortMsg, CMD_BIT_MASK, MAX_CMD_Q_ELEMENTS,
    TIMER_BIT_MASK,
};
use crossbeam_channel::{bounded, Receiver, Select, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Continue/wait outcome of the trigger selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerVerdict {
    ContinueProcessing,
    WaitForTrigger,
}

#[derive(Debug, Default)]
pub struct ExtInFlags {
    pub eof: bool,
    /// Set when buffered data was dropped at a format boundary or a flush.
    pub input_discontinuity: bool,
    /// Data is staged and preprocessing need not run again this iteration.
    pub ready_to_go: bool,
    /// First data has been processed; underruns after this point erase.
    pub processing_began: bool,
}

/// External input port: an internal input port plus its bounded queue and
/// channel bit.
pub struct ExtInPort {
    pub in_port: InPortId,
    pub bit_mask: u32,
    pub rx: Receiver<InPortMsg>,
    /// Peeked front of the queue; kept here until fully consumed.
    pub held: Option<InPortMsg>,
    /// Media format waiting for in-flight metadata to drain (data-triggered
    /// discipline only).
    pub pending_mf: Option<MediaFormat>,
    pub flags: ExtInFlags,
    pub upstream_frame_len: Option<FrameLenUpdate>,
    pub upstream_stopped: bool,
    pub upstream_real_time: bool,
    /// Control-plane state the upstream peer informed; downgrades the
    /// internal port state.
    pub peer_state: crate::graph::port::PortState,
    /// Count of flushing EOSes that entered and have not left yet.
    pub flush_eos_cnt: u32,
    pub underrun_err_count: u32,
}

#[derive(Debug, Default)]
pub struct ExtOutFlags {
    pub media_fmt_pending: bool,
    pub prebuffers_sent: bool,
}

/// External output port: an internal output port plus the downstream
/// delivery channel and the returned-empty-buffer queue the container waits
/// on.
pub struct ExtOutPort {
    pub out_port: OutPortId,
    pub bit_mask: u32,
    pub tx: Sender<OutPortMsg>,
    pub buf_rx: Receiver<DataMsg>,
    /// Empty buffer popped from `buf_rx`, bound to the port until written.
    pub held_buf: Option<DataMsg>,
    /// Metadata accumulated for the frame currently being assembled.
    pub md_list: MetadataList,
    pub flags: ExtOutFlags,
    pub icb: Option<IcbResult>,
    pub icb_dirty: bool,
    pub downstream_frame: Option<FrameLenUpdate>,
    pub downstream_real_time: bool,
    pub last_sent_mf: Option<MediaFormat>,
    /// Downstream-informed downgraded state.
    pub ds_state: crate::graph::port::PortState,
    pub overrun_err_count: u32,
    pub overrun_prepare_buf_err_count: u32,
}

/// Signal-triggered module bookkeeping.
#[derive(Debug, Default)]
pub struct StmState {
    pub module: Option<ModuleId>,
    pub active: bool,
    /// Timer ticks observed on the channel.
    pub raised_interrupts: u64,
    /// Ticks fully processed.
    pub processed_interrupts: u64,
    pub signal_miss_count: u32,
}

/// Per-pass process bookkeeping.
#[derive(Debug)]
pub struct ProcessInfo {
    pub anything_changed: bool,
    pub probing_for_tpm_activity: bool,
    pub curr_trigger: TriggerKind,
}

impl Default for ProcessInfo {
    fn default() -> Self {
        Self {
            anything_changed: false,
            probing_for_tpm_activity: false,
            curr_trigger: TriggerKind::Data,
        }
    }
}

/// Thread priority bookkeeping. The engine records and logs the values; the
/// hosting runtime maps them onto real scheduler priorities.
#[derive(Debug)]
pub struct PriorityState {
    pub original: u32,
    pub current: u32,
    pub bumped: bool,
}

impl Default for PriorityState {
    fn default() -> Self {
        Self { original: 1, current: 1, bumped: false }
    }
}

#[derive(Debug, Default)]
pub struct ErrThrottle {
    last_print: Option<Instant>,
}

impl ErrThrottle {
    /// At most one error print per interval.
    pub fn should_print(&mut self) -> bool {
        let now = Instant::now();
        match self.last_print {
            Some(last)
                if now.duration_since(last).as_millis()
                    < crate::config::ERR_PRINT_INTERVAL_MS as u128 =>
            {
                false
            }
            _ => {
                self.last_print = Some(now);
                true
            }
        }
    }
}

/// Current operating frame, produced by the threshold engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub unit: LcmUnit,
}

impl Default for FrameInfo {
    fn default() -> Self {
        Self { unit: LcmUnit::Time { us: 0, samples: 0, sample_rate: 0 } }
    }
}

impl FrameInfo {
    pub fn len_us(&self) -> u64 {
        match self.unit {
            LcmUnit::Time { us, .. } => us,
            LcmUnit::Bytes { .. } => 0,
        }
    }
}

type Continuation = Box<dyn FnOnce(&mut Container) -> Result<()> + Send>;

pub struct Container {
    pub cfg: ContainerConfig,
    pub graph: Graph,
    pub ext_in: Vec<ExtInPort>,
    pub ext_out: Vec<ExtOutPort>,

    pub(crate) cmd_rx: Receiver<CommandMsg>,
    cmd_tx: Sender<CommandMsg>,
    pub(crate) timer_rx: Option<Receiver<Instant>>,

    /// Bits not yet claimed by an external port.
    pub(crate) available_bit_mask: u32,
    /// Bits currently listened on.
    pub(crate) curr_chan_mask: u32,
    pub(crate) wait_mask_arr: Vec<u32>,

    pub frame: FrameInfo,
    pub stm: StmState,
    pub proc: ProcessInfo,
    pub module_events: EventCtx,
    pub fwk_events: FwkEventFlags,
    pub power: PowerState,
    pub priority: PriorityState,
    pub err_throttle: ErrThrottle,

    pub cannot_be_pure_signal_triggered: bool,
    /// EOS synthesized due to an upstream gap awaits a delivery pass.
    pub process_us_gap: bool,
    pub(crate) pending_continuation: Option<Continuation>,
    pub(crate) event_clients: Vec<Sender<ClientEvent>>,
    /// Per-module configuration registered ahead of prepare.
    pub(crate) cached_cfgs: Vec<(cadenza_protocol::ModuleIid, u32, Vec<u8>)>,
    /// Graph critical section: held for structural mutations only.
    pub(crate) critical: Arc<Mutex<()>>,
    pub(crate) terminated: bool,
}

/// Client-side handle: submit commands, receive acks.
#[derive(Clone)]
pub struct ContainerHandle {
    pub cmd_tx: Sender<CommandMsg>,
}

impl Container {
    pub fn new(cfg: ContainerConfig) -> Self {
        let (cmd_tx, cmd_rx) = bounded(MAX_CMD_Q_ELEMENTS);
        Self {
            cfg,
            graph: Graph::new(),
            ext_in: Vec::new(),
            ext_out: Vec::new(),
            cmd_rx,
            cmd_tx,
            timer_rx: None,
            available_bit_mask: cadenza_protocol::AVAILABLE_PORT_MASK,
            // initially listen to commands only
            curr_chan_mask: CMD_BIT_MASK,
            wait_mask_arr: vec![0],
            frame: FrameInfo::default(),
            stm: StmState::default(),
            proc: ProcessInfo::default(),
            module_events: EventCtx::default(),
            fwk_events: FwkEventFlags::default(),
            power: PowerState::default(),
            priority: PriorityState::default(),
            err_throttle: ErrThrottle::default(),
            cannot_be_pure_signal_triggered: false,
            process_us_gap: false,
            pending_continuation: None,
            event_clients: Vec::new(),
            cached_cfgs: Vec::new(),
            critical: Arc::new(Mutex::new(())),
            terminated: false,
        }
    }

    pub fn handle(&self) -> ContainerHandle {
        ContainerHandle { cmd_tx: self.cmd_tx.clone() }
    }

    /// Install the periodic signal source. Ticks arrive as instants; tests
    /// drive this manually, the demo binary uses `crossbeam_channel::tick`.
    pub fn attach_timer(&mut self, rx: Receiver<Instant>) {
        self.timer_rx = Some(rx);
    }

    /// Claim a free channel bit for an external port.
    pub(crate) fn alloc_bit(&mut self) -> Result<u32> {
        if self.available_bit_mask == 0 {
            return Err(EngineError::PortMaskExhausted);
        }
        let bit = 1u32 << (31 - self.available_bit_mask.leading_zeros());
        self.available_bit_mask &= !bit;
        Ok(bit)
    }

    pub(crate) fn free_bit(&mut self, bit: u32) {
        self.available_bit_mask |= bit;
        self.curr_chan_mask &= !bit;
    }

    pub(crate) fn start_listen(&mut self, mask: u32) {
        self.curr_chan_mask |= mask;
    }

    pub(crate) fn stop_listen(&mut self, mask: u32) {
        self.curr_chan_mask &= !mask;
    }

    pub(crate) fn all_ext_in_mask(&self) -> u32 {
        self.ext_in.iter().map(|p| p.bit_mask).fold(0, |a, b| a | b)
    }

    pub(crate) fn all_ext_out_mask(&self) -> u32 {
        self.ext_out.iter().map(|p| p.bit_mask).fold(0, |a, b| a | b)
    }

    pub fn is_started(&self) -> bool {
        self.graph
            .subgraphs
            .iter()
            .any(|sg| sg.state == crate::graph::port::PortState::Started)
    }

    /// Run until destroyed. The worker-thread entry point.
    pub fn run(mut self) -> Result<()> {
        info!("container entering event loop");
        while !self.terminated {
            self.poll_once(None);
        }
        info!("container stopped");
        Ok(())
    }

    /// Wait for one trigger and service it. Returns whether anything was
    /// serviced. `timeout` of `None` blocks indefinitely.
    pub fn poll_once(&mut self, timeout: Option<std::time::Duration>) -> bool {
        // snapshot of listening receivers, highest bit priority first
        let mut select = Select::new();
        let mut entries: Vec<(u32, SourceKind)> = Vec::new();

        // command queue is always watched
        select.recv(&self.cmd_rx);
        entries.push((CMD_BIT_MASK, SourceKind::Command));

        if self.curr_chan_mask & TIMER_BIT_MASK != 0 {
            if let Some(timer) = &self.timer_rx {
                select.recv(timer);
                entries.push((TIMER_BIT_MASK, SourceKind::Timer));
            }
        }
        for (i, p) in self.ext_in.iter().enumerate() {
            if self.curr_chan_mask & p.bit_mask != 0 {
                select.recv(&p.rx);
                entries.push((p.bit_mask, SourceKind::ExtIn(i)));
            }
        }
        for (i, p) in self.ext_out.iter().enumerate() {
            if self.curr_chan_mask & p.bit_mask != 0 {
                select.recv(&p.buf_rx);
                entries.push((p.bit_mask, SourceKind::ExtOut(i)));
            }
        }

        let ready = match timeout {
            Some(t) => match select.ready_timeout(t) {
                Ok(i) => i,
                Err(_) => return false,
            },
            None => select.ready(),
        };
        drop(select);

        // several sources may be ready; service the highest set bit
        let mut chosen = ready;
        for (i, (bit, _)) in entries.iter().enumerate() {
            if i == ready {
                continue;
            }
            let is_ready = match entries[i].1 {
                SourceKind::Command => !self.cmd_rx.is_empty(),
                SourceKind::Timer => {
                    self.timer_rx.as_ref().map(|t| !t.is_empty()).unwrap_or(false)
                }
                SourceKind::ExtIn(p) => !self.ext_in[p].rx.is_empty(),
                SourceKind::ExtOut(p) => !self.ext_out[p].buf_rx.is_empty(),
            };
            if is_ready && *bit > entries[chosen].0 {
                chosen = i;
            }
        }

        match entries[chosen].1 {
            SourceKind::Command => self.service_command(),
            SourceKind::Timer => self.service_signal_trigger(),
            SourceKind::ExtIn(_) | SourceKind::ExtOut(_) => self.service_data_trigger(),
        }
        true
    }

    fn service_command(&mut self) {
        let Ok(msg) = self.cmd_rx.try_recv() else { return };
        self.bump_priority_for_command();
        self.dispatch_command(msg);
        self.restore_priority();
        if let Some(cont) = self.pending_continuation.take() {
            debug!("running deferred continuation");
            if let Err(e) = cont(self) {
                tracing::error!(error = %e, "deferred continuation failed");
            }
        }
        if !self.terminated {
            let needs_pass = self.reconcile_events().unwrap_or(false);
            if needs_pass || self.process_us_gap {
                // the reconciler may trigger a single data-processing pass
                // before the command is considered fully handled
                let _ = self.process_frames(crate::graph::module::TriggerKind::Data);
            }
            self.wait_for_any_trigger(false, false);
        }
    }

    fn service_signal_trigger(&mut self) {
        let Some(timer) = &self.timer_rx else { return };
        let mut ticks = 0u64;
        while timer.try_recv().is_ok() {
            ticks += 1;
        }
        if ticks == 0 {
            return;
        }
        self.stm.raised_interrupts += ticks;
        if ticks > 1 {
            self.stm.signal_miss_count += (ticks - 1) as u32;
            if self.err_throttle.should_print() {
                tracing::error!(
                    misses = self.stm.signal_miss_count,
                    "signal miss: timer ticks coalesced"
                );
            }
        }
        if self.stm.active {
            self.proc.curr_trigger = TriggerKind::Signal;
            if let Err(e) = self.process_frames(TriggerKind::Signal) {
                tracing::error!(error = %e, "signal-triggered processing failed");
            }
            self.stm.processed_interrupts = self.stm.raised_interrupts;
        }
    }

    fn service_data_trigger(&mut self) {
        self.proc.curr_trigger = TriggerKind::Data;
        if let Err(e) = self.process_frames(TriggerKind::Data) {
            tracing::error!(error = %e, "data-triggered processing failed");
        }
    }

    /// Commands run at raised priority when a started signal-triggered
    /// container operates below the duration threshold.
    fn bump_priority_for_command(&mut self) {
        if self.priority.bumped {
            return;
        }
        let frame_us = self.frame.len_us();
        if self.is_started()
            && self.stm.module.is_some()
            && frame_us > 0
            && frame_us <= crate::config::PROC_DUR_THRESH_FOR_PRIO_BUMP_UP_US
        {
            self.priority.original = self.priority.current;
            self.priority.current =
                self.priority.current * crate::config::PROC_DUR_SCALE_FACTOR_FOR_CMD_PROC;
            self.priority.bumped = true;
            debug!(prio = self.priority.current, "bumped thread priority for command");
        }
    }

    fn restore_priority(&mut self) {
        if self.priority.bumped {
            self.priority.current = self.priority.original;
            self.priority.bumped = false;
        }
    }

    pub(crate) fn notify_clients(&self, event: ClientEvent) {
        for client in &self.event_clients {
            let _ = client.try_send(event.clone());
        }
    }
}

#[derive(Clone, Copy)]
enum SourceKind {
    Command,
    Timer,
    ExtIn(usize),
    ExtOut(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_allocation_starts_below_reserved() {
        let mut c = Container::new(ContainerConfig::default());
        let b1 = c.alloc_bit().unwrap();
        let b2 = c.alloc_bit().unwrap();
        assert_eq!(b1, 0x1000_0000);
        assert_eq!(b2, 0x0800_0000);
        assert_eq!(b1 & cadenza_protocol::AVAILABLE_PORT_MASK, b1);
        c.free_bit(b1);
        assert_eq!(c.alloc_bit().unwrap(), b1);
    }

    #[test]
    fn mask_exhaustion_is_reported() {
        let mut c = Container::new(ContainerConfig::default());
        for _ in 0..29 {
            c.alloc_bit().unwrap();
        }
        assert!(matches!(c.alloc_bit(), Err(EngineError::PortMaskExhausted)));
    }

    #[test]
    fn priority_bump_requires_short_frames() {
        let mut c = Container::new(ContainerConfig::default());
        c.bump_priority_for_command();
        assert!(!c.priority.bumped); // not started, no stm
    }
}
