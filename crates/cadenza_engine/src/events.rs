//! Event flag words raised by modules and by the framework.
//!
//! Two word-sized flag sets exist: one written by modules during `process` /
//! `set_param` (via [`EventCtx`]), one written by framework code. The
//! reconciler snapshots both after every command and every data-processing
//! step and folds them into framework actions in one sweep.

use bitflags::bitflags;

bitflags! {
    /// Events raised by modules.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ModuleEventFlags: u32 {
        const MEDIA_FMT_CHANGED     = 1 << 0;
        const PORT_THRESH_CHANGED   = 1 << 1;
        const PROCESS_STATE_CHANGED = 1 << 2;
        const INPLACE_CHANGED       = 1 << 3;
        const SCRATCH_REALLOC       = 1 << 4;
        const KPPS_BW_CHANGED       = 1 << 5;
        const RT_PROP_CHANGED       = 1 << 6;
        const TRIGGER_POLICY_CHANGED = 1 << 7;
        const ALGO_DELAY_CHANGED    = 1 << 8;
    }
}

bitflags! {
    /// Events raised by framework code.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FwkEventFlags: u32 {
        const PORT_STATE_CHANGED = 1 << 0;
        const ICB_RECALC         = 1 << 1;
        const FRAME_LEN_CHANGED  = 1 << 2;
        const VOTE_RELEASE       = 1 << 3;
        const PROC_DUR_CHANGED   = 1 << 4;
    }
}

/// Mutable event context handed to modules; the only channel through which a
/// module communicates framework-visible changes.
#[derive(Debug, Default)]
pub struct EventCtx {
    pub flags: ModuleEventFlags,
    /// New threshold in bytes when PORT_THRESH_CHANGED is raised.
    pub new_threshold_bytes: Option<u64>,
    /// New inplace setting when INPLACE_CHANGED is raised.
    pub new_inplace: Option<bool>,
    /// New enabled state when PROCESS_STATE_CHANGED is raised.
    pub new_enabled: Option<bool>,
}

impl EventCtx {
    pub fn raise_threshold_change(&mut self, bytes: u64) {
        self.flags |= ModuleEventFlags::PORT_THRESH_CHANGED;
        self.new_threshold_bytes = Some(bytes);
    }

    pub fn raise_media_fmt_change(&mut self) {
        self.flags |= ModuleEventFlags::MEDIA_FMT_CHANGED;
    }

    pub fn raise_inplace_change(&mut self, inplace: bool) {
        self.flags |= ModuleEventFlags::INPLACE_CHANGED;
        self.new_inplace = Some(inplace);
    }

    pub fn raise_process_state(&mut self, enabled: bool) {
        self.flags |= ModuleEventFlags::PROCESS_STATE_CHANGED;
        self.new_enabled = Some(enabled);
    }

    pub fn raise_kpps_bw_change(&mut self) {
        self.flags |= ModuleEventFlags::KPPS_BW_CHANGED;
    }

    pub fn raise_trigger_policy_change(&mut self) {
        self.flags |= ModuleEventFlags::TRIGGER_POLICY_CHANGED;
    }

    pub fn take(&mut self) -> EventCtx {
        std::mem::take(self)
    }

    pub fn any(&self) -> bool {
        !self.flags.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_clears() {
        let mut ctx = EventCtx::default();
        ctx.raise_threshold_change(960);
        let snap = ctx.take();
        assert!(snap.flags.contains(ModuleEventFlags::PORT_THRESH_CHANGED));
        assert_eq!(snap.new_threshold_bytes, Some(960));
        assert!(!ctx.any());
    }
}
