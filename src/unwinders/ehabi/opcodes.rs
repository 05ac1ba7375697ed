use fallible_iterator::FallibleIterator;

use crate::error::UnwindError;
use crate::instruction_analysis::DisasmData;
use crate::memory::{read_user_u32, AddressSpace, SectionReader, Vma};

pub(crate) const FP_THUMB: usize = 7;
pub(crate) const FP_ARM: usize = 11;
pub(crate) const SP: usize = 13;
pub(crate) const LR: usize = 14;
pub(crate) const PC: usize = 15;

/// The bytes of an unwind program, most significant byte of each word first.
///
/// The program starts inside its first word (after the personality byte, or
/// the personality byte and the word count) and runs for `entries` words.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Opcodes<'a> {
    section: SectionReader<'a>,
    addr: u64,
    byte: u8,
    entries: u32,
}

impl<'a> Opcodes<'a> {
    pub fn new(section: SectionReader<'a>, addr: u64, byte: u8, entries: u32) -> Self {
        Self {
            section,
            addr,
            byte,
            entries,
        }
    }

    /// Stop after the current opcode.
    pub fn finish(&mut self) {
        self.entries = 0;
    }

    /// The next byte, which must exist because an opcode needs it.
    fn operand(&mut self) -> Result<u8, UnwindError> {
        self.next()?.ok_or(UnwindError::TableIsCorrupt)
    }

    fn uleb128(&mut self) -> Result<u32, UnwindError> {
        let mut result: u32 = 0;
        let mut shift = 0;
        loop {
            let byte = self.operand()?;
            if shift >= 32 {
                return Err(UnwindError::TableIsCorrupt);
            }
            result |= u32::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
    }
}

impl<'a> FallibleIterator for Opcodes<'a> {
    type Item = u8;
    type Error = UnwindError;

    fn next(&mut self) -> Result<Option<u8>, UnwindError> {
        if self.entries == 0 {
            return Ok(None);
        }

        let word = self.section.read_word(self.addr)?;
        let byte = (word >> (u32::from(self.byte) * 8)) as u8;

        if self.byte == 0 {
            self.addr = self.addr.checked_add(4).ok_or(UnwindError::TableIsCorrupt)?;
            self.entries -= 1;
            self.byte = 3;
        } else {
            self.byte -= 1;
        }

        Ok(Some(byte))
    }
}

/// Pop one word. The word must lie inside `stack`.
fn pop<M: AddressSpace + ?Sized>(
    mm: &M,
    stack: &Vma,
    vsp: &mut u32,
) -> Result<u32, UnwindError> {
    let addr = u64::from(*vsp);
    if addr < stack.start || addr + 4 > stack.end {
        return Err(UnwindError::SpIncorrect(addr));
    }
    let value = read_user_u32(mm, addr)?;
    *vsp = vsp.wrapping_add(4);
    Ok(value)
}

/// Execute one unwind instruction on the virtual registers `vrs`, recording
/// in `qd` what it restored. Registers are only popped from `stack`.
pub(crate) fn exec_insn<M: AddressSpace + ?Sized>(
    mm: &M,
    stack: &Vma,
    ops: &mut Opcodes,
    insn: u8,
    vrs: &mut [u32; 16],
    qd: &mut DisasmData,
) -> Result<(), UnwindError> {
    tracing::trace!("ehabi: insn {:#04x}", insn);

    match insn {
        // vsp = vsp + (xxxxxx << 2) + 4
        0x00..=0x3f => {
            let n = (u32::from(insn & 0x3f) << 2) + 4;
            vrs[SP] = vrs[SP].wrapping_add(n);
            qd.unwind_vsp_up(n);
        }
        // vsp = vsp - (xxxxxx << 2) - 4
        0x40..=0x7f => {
            let n = (u32::from(insn & 0x3f) << 2) + 4;
            vrs[SP] = vrs[SP].wrapping_sub(n);
            qd.unwind_vsp_down(n);
        }
        // pop {r4-r15} under mask
        0x80..=0x8f => {
            let mut mask = ((u32::from(insn) << 8) | u32::from(ops.operand()?)) & 0x0fff;
            if mask == 0 {
                return Err(UnwindError::RefuseToUnwind);
            }

            let load_sp = mask & (1 << (SP - 4)) != 0;
            let mut vsp = vrs[SP];
            let mut reg = 4;
            while mask != 0 {
                if mask & 1 != 0 {
                    vrs[reg] = pop(mm, stack, &mut vsp)?;
                    qd.pop_reg(reg as u32);
                }
                mask >>= 1;
                reg += 1;
            }
            if !load_sp {
                vrs[SP] = vsp;
            }
        }
        // vsp = r[nnnn], except r13 and r15
        0x90..=0x9f if insn & 0x0d != 0x0d => {
            let reg = insn & 0x0f;
            vrs[SP] = vrs[usize::from(reg)];
            qd.unwind_vsp_from(reg);
        }
        // pop {r4-r[4+nnn]}, plus r14 if bit 3 is set
        0xa0..=0xaf => {
            let mut vsp = vrs[SP];
            for reg in 4..=4 + usize::from(insn & 0x07) {
                vrs[reg] = pop(mm, stack, &mut vsp)?;
                qd.pop_reg(reg as u32);
            }
            if insn & 0x08 != 0 {
                vrs[LR] = pop(mm, stack, &mut vsp)?;
                qd.pop_reg(LR as u32);
            }
            vrs[SP] = vsp;
        }
        0xb0 => {
            if vrs[PC] == 0 {
                vrs[PC] = vrs[LR];
            }
            ops.finish();
        }
        // pop {r0-r3} under mask
        0xb1 => {
            let mut mask = ops.operand()?;
            if mask == 0 || mask & 0xf0 != 0 {
                return Err(UnwindError::SpareEncoding(mask));
            }

            let mut vsp = vrs[SP];
            let mut reg = 0;
            while mask != 0 {
                if mask & 1 != 0 {
                    vrs[reg] = pop(mm, stack, &mut vsp)?;
                    qd.pop_reg(reg as u32);
                }
                mask >>= 1;
                reg += 1;
            }
            vrs[SP] = vsp;
        }
        // vsp = vsp + 0x204 + (uleb128 << 2)
        0xb2 => {
            let n = 0x204u32.wrapping_add(ops.uleb128()?.wrapping_shl(2));
            vrs[SP] = vrs[SP].wrapping_add(n);
            qd.unwind_vsp_up(n);
        }
        // pop VFP double registers: 0xb3 FSTMFDX d[ssss]-d[ssss+cccc],
        // 0xc8 VPUSH d[16+ssss]-d[16+ssss+cccc], 0xc9 VPUSH d[ssss]-d[ssss+cccc]
        0xb3 | 0xc8 | 0xc9 => {
            let data = ops.operand()?;
            let mut from = u32::from(data >> 4);
            if insn == 0xc8 {
                from += 16;
            }
            let count = u32::from(data & 0x0f) + 1;

            let mut n = count * 8;
            if insn == 0xb3 {
                n += 4;
            }
            vrs[SP] = vrs[SP].wrapping_add(n);
            qd.pop_vfp(from, count);
        }
        // pop d8-d[8+nnn]: 0xb8 FSTMFDX, 0xd0 VPUSH
        0xb8..=0xbf | 0xd0..=0xd7 => {
            let count = u32::from(insn & 0x07) + 1;

            let mut n = count * 8;
            if insn & 0xf8 == 0xb8 {
                n += 4;
            }
            vrs[SP] = vrs[SP].wrapping_add(n);
            qd.pop_vfp(8, count);
        }
        _ => return Err(UnwindError::UnhandledInstruction(insn)),
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use super::*;

    /// 32-bit user space.
    const USER: Vma = Vma {
        start: 0,
        end: 1 << 32,
    };

    struct Words(BTreeMap<u64, u32>);

    impl AddressSpace for Words {
        fn find_vma(&self, _addr: u64) -> Option<Vma> {
            None
        }

        fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), ()> {
            let word = self.0.get(&addr).ok_or(())?;
            buf.copy_from_slice(&word.to_le_bytes()[..buf.len()]);
            Ok(())
        }
    }

    fn stack(base: u64, words: &[u32]) -> Words {
        Words(
            words
                .iter()
                .enumerate()
                .map(|(i, w)| (base + i as u64 * 4, *w))
                .collect(),
        )
    }

    /// Run the inline program in `word` (personality 0) against `mm`.
    fn run(word: u32, mm: &Words, vrs: &mut [u32; 16]) -> Result<(), UnwindError> {
        let bytes = word.to_le_bytes();
        let section = SectionReader::new(&bytes, 0x2000);
        let mut ops = Opcodes::new(section, 0x2000, 2, 1);
        let mut qd = DisasmData::new(0, 0, false);
        while let Some(insn) = ops.next()? {
            exec_insn(mm, &USER, &mut ops, insn, vrs, &mut qd)?;
        }
        Ok(())
    }

    #[test]
    fn byte_order() {
        let data = [0x04, 0x03, 0x02, 0x81, 0x08, 0x07, 0x06, 0x05];
        let section = SectionReader::new(&data, 0x3000);
        let ops = Opcodes::new(section, 0x3000, 2, 2);
        assert_eq!(ops.collect::<Vec<_>>(), Ok(vec![2, 3, 4, 5, 6, 7, 8]));
    }

    #[test]
    fn pop_r4_lr() {
        // vsp += 8; pop {r4, r14}; finish
        let mm = stack(0x7000_0008, &[0x1111, 0x0001_2345]);
        let mut vrs = [0; 16];
        vrs[SP] = 0x7000_0000;
        run(0x8001_a8b0, &mm, &mut vrs).unwrap();
        assert_eq!(vrs[4], 0x1111);
        assert_eq!(vrs[LR], 0x0001_2345);
        assert_eq!(vrs[PC], 0x0001_2345);
        assert_eq!(vrs[SP], 0x7000_0010);
    }

    #[test]
    fn mask_pop_with_sp() {
        // pop {r11, sp, lr}: sp is loaded from the stack and not advanced.
        let mm = stack(0x7000_0000, &[0xb, 0x7100_0000, 0xe]);
        let mut vrs = [0; 16];
        vrs[SP] = 0x7000_0000;
        run(0x8086_80b0, &mm, &mut vrs).unwrap();
        assert_eq!(vrs[FP_ARM], 0xb);
        assert_eq!(vrs[SP], 0x7100_0000);
        assert_eq!(vrs[LR], 0xe);
    }

    #[test]
    fn vsp_from_register_and_vfp() {
        // Personality 1 with one extra word:
        // vsp = r7; pop d8-d9 (VPUSH form); vsp += 0x204 + (1 << 2)
        let mm = stack(0, &[]);
        let mut vrs = [0; 16];
        vrs[FP_THUMB] = 0x7000_0100;
        let data = [0xd1, 0x97, 0x01, 0x81, 0xb0, 0xb0, 0x01, 0xb2];
        let section = SectionReader::new(&data, 0x3000);
        let mut ops = Opcodes::new(section, 0x3000, 1, 2);
        let mut qd = DisasmData::new(0, 0, false);
        qd.d_regset = 0x300;
        while let Some(insn) = ops.next().unwrap() {
            exec_insn(&mm, &USER, &mut ops, insn, &mut vrs, &mut qd).unwrap();
        }
        assert_eq!(vrs[SP], 0x7000_0100 + 16 + 0x208);
        assert_eq!(qd.d_regset, 0);
        assert_eq!(qd.ustackreg, 7);
    }

    #[test]
    fn refused_and_spare() {
        let mm = stack(0, &[]);
        let mut vrs = [0; 16];
        assert_eq!(run(0x8080_00b0, &mm, &mut vrs), Err(UnwindError::RefuseToUnwind));
        assert_eq!(run(0x80b1_00b0, &mm, &mut vrs), Err(UnwindError::SpareEncoding(0)));
        assert_eq!(run(0x80b1_10b0, &mm, &mut vrs), Err(UnwindError::SpareEncoding(0x10)));
        assert_eq!(
            run(0x80c0_b0b0, &mm, &mut vrs),
            Err(UnwindError::UnhandledInstruction(0xc0))
        );
        // vsp = r13 is reserved.
        assert_eq!(
            run(0x809d_b0b0, &mm, &mut vrs),
            Err(UnwindError::UnhandledInstruction(0x9d))
        );
    }

    #[test]
    fn missing_operand_is_corrupt() {
        let mm = stack(0, &[]);
        let mut vrs = [0; 16];
        // 0xb1 is the last byte of the program.
        assert_eq!(run(0x8001_01b1, &mm, &mut vrs), Err(UnwindError::TableIsCorrupt));
    }

    #[test]
    fn failed_pop_is_access_error() {
        let mm = stack(0, &[]);
        let mut vrs = [0; 16];
        vrs[SP] = 0x7000_0000;
        assert_eq!(
            run(0x80a0_b0b0, &mm, &mut vrs),
            Err(UnwindError::Access(0x7000_0000))
        );
    }

    #[test]
    fn pop_stays_on_the_stack() {
        let mm = stack(0x7000_0ff8, &[1, 2]);
        let bounds = Vma::new(0x7000_0000, 0x7000_1000);
        let bytes = 0x80a8_b0b0u32.to_le_bytes();
        let section = SectionReader::new(&bytes, 0x2000);
        let mut ops = Opcodes::new(section, 0x2000, 2, 1);
        let mut qd = DisasmData::new(0, 0, false);
        let mut vrs = [0; 16];
        vrs[SP] = 0x7000_0ff8;

        // pop {r4, lr} fits, pop {r4-r5, lr} does not.
        let insn = ops.next().unwrap().unwrap();
        exec_insn(&mm, &bounds, &mut ops, insn, &mut vrs, &mut qd).unwrap();
        assert_eq!((vrs[4], vrs[LR], vrs[SP]), (1, 2, 0x7000_1000));

        vrs[SP] = 0x7000_0ff8;
        assert_eq!(
            exec_insn(&mm, &bounds, &mut ops, 0xa9, &mut vrs, &mut qd),
            Err(UnwindError::SpIncorrect(0x7000_1000))
        );
    }
}
