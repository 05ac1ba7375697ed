use arrayvec::ArrayVec;

use crate::unwinders::dwarf::{RegsState, StackFrame, MAX_RS_STACK_DEPTH};

/// The unwinder cache. This needs to be created upfront before unwinding. During
/// unwinding, the unwinder needs exclusive access to this cache.
///
/// Samples taken concurrently (one per CPU in the sampling driver) each need
/// their own cache. A single cache can be reused for any number of samples.
///
/// The cache holds the scratch state of the DWARF unwinder: the virtual
/// register file of the frame being unwound, the rule tables which the CFA
/// program builds, and the stack used by `DW_CFA_remember_state`.
pub struct Cache {
    pub(crate) sf: StackFrame,
    pub(crate) rs_stack: ArrayVec<RegsState, MAX_RS_STACK_DEPTH>,
}

impl Cache {
    pub fn new() -> Self {
        Self {
            sf: StackFrame::default(),
            rs_stack: ArrayVec::new(),
        }
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}
