//! Module node: the polymorphic processing element.
//!
//! Module behavior lives behind the [`AudioModule`] trait; framework-internal
//! modules (endpoints, placeholder, attachment) implement the same trait as
//! user modules. Per-node bookkeeping (flags, loop count, trigger policy
//! activity) lives on [`ModuleNode`].

use crate::buffers::StreamData;
use crate::error::{EngineError, Result};
use crate::events::EventCtx;
use bitflags::bitflags;
use cadenza_protocol::ModuleIid;

bitflags! {
    /// Static capability flags a module declares at open time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ModuleFlags: u32 {
        const NEEDS_THRESHOLD_CFG      = 1 << 0;
        const NEEDS_FRAME_DURATION     = 1 << 1;
        const NEEDS_PROC_DURATION      = 1 << 2;
        const NEEDS_SIGNAL_TRIGGER     = 1 << 3;
        const NEEDS_ASYNC_SIGNAL       = 1 << 4;
        const SUPPORTS_PERIOD          = 1 << 5;
        const SUPPORTS_STM_TS          = 1 << 6;
        const REQUIRES_DATA_BUFFER     = 1 << 7;
        /// Source module: no inputs in steady state.
        const IS_SOURCE                = 1 << 8;
        /// Sink module: no outputs in steady state.
        const IS_SINK                  = 1 << 9;
        /// Pseudo threshold source (packetizer/depacketizer); its threshold
        /// is used only when no true threshold module exists.
        const PSEUDO_THRESHOLD         = 1 << 10;
        /// Trigger-policy module under the data-trigger discipline.
        const DATA_TRIGGER_POLICY      = 1 << 11;
        /// Needs data-trigger probing on inputs while signal-triggered.
        const INPUT_DATA_TRIGGER_IN_ST  = 1 << 12;
        /// Needs data-trigger probing on outputs while signal-triggered.
        const OUTPUT_DATA_TRIGGER_IN_ST = 1 << 13;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Data,
    Signal,
}

/// Capability set every module provides. A module is handed its input and
/// output stream data and communicates changes through the event context.
///
/// `process` contract: on entry each input's `actual_len` holds the valid
/// bytes offered; on return the module has set each input's `actual_len` to
/// the bytes it consumed and each output's `actual_len` to the bytes it
/// produced. The framework shifts unconsumed input.
pub trait AudioModule: Send {
    fn process(
        &mut self,
        ctx: &mut EventCtx,
        inputs: &mut [StreamData],
        outputs: &mut [StreamData],
    ) -> Result<()>;

    fn set_param(&mut self, _ctx: &mut EventCtx, param_id: u32, _payload: &[u8]) -> Result<()> {
        Err(EngineError::Unsupported(format!("set_param 0x{param_id:X}")))
    }

    fn get_param(&self, param_id: u32) -> Result<Vec<u8>> {
        Err(EngineError::Unsupported(format!("get_param 0x{param_id:X}")))
    }

    fn set_properties(&mut self, _ctx: &mut EventCtx, _props: &ModuleProperties) -> Result<()> {
        Ok(())
    }

    /// Trigger-policy modules decide whether the current trigger satisfies
    /// them. Non-policy modules are always satisfied.
    fn is_trigger_satisfied(
        &self,
        _kind: TriggerKind,
        _inputs: &[StreamData],
        _outputs: &[StreamData],
    ) -> bool {
        true
    }
}

/// Framework-pushed properties.
#[derive(Debug, Clone, Default)]
pub struct ModuleProperties {
    /// Container operating frame length in microseconds.
    pub frame_duration_us: Option<u64>,
    /// Expected processing duration per frame.
    pub proc_duration_us: Option<u64>,
    /// New per-port threshold in bytes (from LCM reconciliation).
    pub new_threshold_bytes: Option<u64>,
    /// Whether upstream of this module is real-time.
    pub upstream_real_time: Option<bool>,
    /// Whether downstream of this module is real-time.
    pub downstream_real_time: Option<bool>,
}

/// Two-phase destroy status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GraphStatus {
    #[default]
    Active,
    /// Marked inside the critical section; memory is reclaimed outside it.
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InPortId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPortId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SgIdx(pub usize);

/// Per-node bookkeeping. The processing behavior itself lives in the graph's
/// parallel processor table, indexed by the same `ModuleId`.
#[derive(Debug)]
pub struct ModuleNode {
    pub iid: ModuleIid,
    pub sg: SgIdx,
    pub flags: ModuleFlags,
    /// Dynamic: cleared by the threshold engine when `num_proc_loops > 1`.
    pub inplace: bool,
    pub disabled: bool,
    pub num_proc_loops: u32,
    /// Extra per-channel bytes a dynamic-mode module asked for on its nblc
    /// chain buffers.
    pub headroom_bytes_per_ch: usize,
    /// Parallel-path index (weakly connected component).
    pub path_index: usize,
    pub in_ports: Vec<InPortId>,
    pub out_ports: Vec<OutPortId>,
    pub status: GraphStatus,
}

impl ModuleNode {
    pub fn is_siso(&self) -> bool {
        self.in_ports.len() == 1 && self.out_ports.len() == 1
    }

    pub fn is_mimo(&self) -> bool {
        self.in_ports.len() > 1 && self.out_ports.len() > 1
    }

    pub fn is_source(&self) -> bool {
        self.flags.contains(ModuleFlags::IS_SOURCE)
    }

    pub fn is_signal_triggered(&self) -> bool {
        self.flags.contains(ModuleFlags::NEEDS_SIGNAL_TRIGGER)
    }

    /// Threshold propagation only crosses SISO/MISO/SIMO shapes; MIMO
    /// modules must self-declare.
    pub fn can_propagate_threshold(&self) -> bool {
        !self.is_mimo()
    }

    pub fn data_trigger_policy_active(&self) -> bool {
        self.flags.contains(ModuleFlags::DATA_TRIGGER_POLICY) && !self.disabled
    }
}
