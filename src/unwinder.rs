use std::ops::Deref;
use std::sync::Arc;

use super::cache::Cache;
use super::callchain::Callchain;
use super::error::ResultCode;
use super::memory::{AddressSpace, Task};
use super::registry::Registry;
use super::unwinders::{dwarf, ehabi, framepointer};
use super::unwindregs::{Mode, UserRegs};

/// Which unwinding methods may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindMethods {
    /// Frame pointer walk.
    pub fp: bool,
    /// ARM exception tables.
    pub ut: bool,
    /// Check every exception table result against the disassembled prologue.
    pub ut_ce: bool,
    /// DWARF CFI.
    pub dwarf: bool,
}

impl Default for UnwindMethods {
    fn default() -> Self {
        Self {
            fp: true,
            ut: true,
            ut_ce: false,
            dwarf: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindConfig {
    /// The lowest address which is stored in a call chain.
    pub low_addr: u64,
    /// The top of user space for 32-bit tasks.
    pub task_size_32: u64,
    /// The top of user space for 64-bit tasks.
    pub task_size_64: u64,
    /// The shortest prologue window for the disassembler check.
    pub disasm_min: u64,
    /// The longest prologue window for the disassembler check.
    pub disasm_max: u64,
}

impl Default for UnwindConfig {
    fn default() -> Self {
        Self {
            low_addr: 0x8000,
            task_size_32: 0xffff_f000,
            task_size_64: 1 << 48,
            disasm_min: 0x10,
            disasm_max: 0x1000,
        }
    }
}

impl UnwindConfig {
    #[inline]
    pub fn task_size(&self, mode: Mode) -> u64 {
        match mode {
            Mode::Arm32 => self.task_size_32,
            Mode::Arm64 => self.task_size_64,
        }
    }
}

/// Everything one sample is unwound with.
pub(crate) struct UnwindCtx<'a, D: Deref<Target = [u8]>, M: AddressSpace + ?Sized> {
    pub registry: &'a Registry<D>,
    pub mm: &'a M,
    pub regs: &'a UserRegs,
    pub methods: &'a UnwindMethods,
    pub config: &'a UnwindConfig,
    /// The sample comes from the scheduler path.
    pub is_sched: bool,
}

impl<'a, D: Deref<Target = [u8]>, M: AddressSpace + ?Sized> UnwindCtx<'a, D, M> {
    #[inline]
    pub fn task_size(&self) -> u64 {
        self.config.task_size(self.regs.mode())
    }
}

/// Builds user space call chains for samples.
///
/// The exception tables come from the shared [`Registry`], which the profiling
/// session fills while samples are being taken. The unwinder itself holds no
/// mutable state; everything a sample needs to write goes into the
/// [`Callchain`] and the [`Cache`] passed to [`Unwinder::get_user_callchain`].
pub struct Unwinder<D: Deref<Target = [u8]>> {
    registry: Arc<Registry<D>>,
    methods: UnwindMethods,
    config: UnwindConfig,
}

impl<D: Deref<Target = [u8]>> Unwinder<D> {
    pub fn new(registry: Arc<Registry<D>>, methods: UnwindMethods, config: UnwindConfig) -> Self {
        Self {
            registry,
            methods,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<Registry<D>> {
        &self.registry
    }

    pub fn methods(&self) -> &UnwindMethods {
        &self.methods
    }

    pub fn set_methods(&mut self, methods: UnwindMethods) {
        self.methods = methods;
    }

    pub fn config(&self) -> &UnwindConfig {
        &self.config
    }

    /// Unwind the user stack of `task` from the sampled registers into `cc`.
    /// Returns the number of entries.
    ///
    /// The table based methods run first in every round, each continuing
    /// where the chain ends. The frame pointer walk only runs in a round in
    /// which neither of them made progress. Unwinding ends when a round adds
    /// nothing, or when the stack pointer stops growing.
    pub fn get_user_callchain<T: Task>(
        &self,
        regs: &UserRegs,
        task: &T,
        is_sched: bool,
        cc: &mut Callchain,
        cache: &mut Cache,
    ) -> usize {
        let mode = regs.mode();
        cc.reset(
            mode == Mode::Arm64,
            self.config.low_addr,
            self.config.task_size(mode),
        );

        let Some(mm) = task.mm() else {
            cc.urc_fp = ResultCode::Failure;
            cc.urc_ut = ResultCode::Failure;
            cc.urc_dwarf = ResultCode::Failure;
            return 0;
        };

        let ctx = UnwindCtx {
            registry: &self.registry,
            mm,
            regs,
            methods: &self.methods,
            config: &self.config,
            is_sched,
        };
        let nr = get_user_callchain_mixed(&ctx, cc, cache);

        tracing::debug!(
            "callchain: {} entries, fp: {}, ut: {}, dwarf: {}",
            nr,
            cc.urc_fp,
            cc.urc_ut,
            cc.urc_dwarf
        );
        nr
    }
}

fn get_user_callchain_mixed<D: Deref<Target = [u8]>, M: AddressSpace + ?Sized>(
    ctx: &UnwindCtx<D, M>,
    cc: &mut Callchain,
    cache: &mut Cache,
) -> usize {
    let methods = ctx.methods;

    loop {
        let nr_prev = cc.nr();
        let sp_prev = cc.curr.sp;

        if methods.dwarf {
            dwarf::get_user_cc_dwarf(ctx, cc, cache);
        }
        if methods.ut {
            ehabi::get_user_cc_arm32_ehabi(ctx, cc);
        }

        if cc.nr() == nr_prev && methods.fp {
            framepointer::get_user_cc_fp(ctx, cc);
        }

        if cc.nr() == nr_prev || (cc.nr() > 1 && cc.curr.sp <= sp_prev) {
            break;
        }
    }

    cc.nr()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::memory::Vma;

    struct Stack(Vec<u8>);

    const STACK: u64 = 0x7000_0000;

    impl AddressSpace for Stack {
        fn find_vma(&self, addr: u64) -> Option<Vma> {
            [
                Vma::new(0x1_0000, 0x2_0000),
                Vma::new(STACK, STACK + self.0.len() as u64),
            ]
            .into_iter()
            .find(|v| v.contains(addr))
        }

        fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), ()> {
            let off = addr.checked_sub(STACK).ok_or(())? as usize;
            let src = self.0.get(off..off + buf.len()).ok_or(())?;
            buf.copy_from_slice(src);
            Ok(())
        }
    }

    struct Proc(Option<Stack>);

    impl Task for Proc {
        type Mm = Stack;

        fn mm(&self) -> Option<&Stack> {
            self.0.as_ref()
        }
    }

    fn unwinder(methods: UnwindMethods) -> Unwinder<Vec<u8>> {
        Unwinder::new(Arc::new(Registry::new()), methods, UnwindConfig::default())
    }

    #[test]
    fn task_sizes() {
        let config = UnwindConfig::default();
        assert_eq!(config.task_size(Mode::Arm32), 0xffff_f000);
        assert_eq!(config.task_size(Mode::Arm64), 1 << 48);
    }

    #[test]
    fn no_address_space() {
        let regs = UserRegs::new_arm32(0x1_0000, STACK as u32, 0, 0, 0, false);
        let mut cc = Callchain::new();
        let mut cache = Cache::new();
        let nr = unwinder(UnwindMethods::default()).get_user_callchain(
            &regs,
            &Proc(None),
            false,
            &mut cc,
            &mut cache,
        );
        assert_eq!(nr, 0);
        assert_eq!(cc.urc_fp, ResultCode::Failure);
        assert_eq!(cc.urc_ut, ResultCode::Failure);
        assert_eq!(cc.urc_dwarf, ResultCode::Failure);
    }

    #[test]
    fn frame_pointer_fallback() {
        // Two aarch64 frame records and no tables.
        let mut stack = vec![0u8; 0x100];
        let mut put = |off: usize, v: u64| stack[off..off + 8].copy_from_slice(&v.to_le_bytes());
        put(0x10, STACK + 0x30);
        put(0x18, 0x1_1000);
        put(0x30, 0);
        put(0x38, 0x1_2000);
        let task = Proc(Some(Stack(stack)));
        let regs = UserRegs::new_aarch64(0x1_0000, STACK, 0, STACK + 0x10);

        let mut cc = Callchain::new();
        let mut cache = Cache::new();
        let u = unwinder(UnwindMethods::default());
        let nr = u.get_user_callchain(&regs, &task, false, &mut cc, &mut cache);
        assert_eq!(nr, 2);
        assert!(cc.cs_64());
        assert_eq!(cc.ips().collect::<Vec<_>>(), vec![0x1_1000, 0x1_2000]);
        assert_eq!(cc.urc_dwarf, ResultCode::TblNotExist);
        assert_eq!(cc.urc_fp, ResultCode::FpIncorrect);

        // The same sample with the frame pointer walk disabled.
        let u = unwinder(UnwindMethods {
            fp: false,
            ..UnwindMethods::default()
        });
        assert_eq!(
            u.get_user_callchain(&regs, &task, false, &mut cc, &mut cache),
            0
        );
        assert_eq!(cc.urc_fp, ResultCode::None);
    }
}
