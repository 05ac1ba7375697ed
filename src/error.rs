use std::fmt::Display;

/// The status of one unwinding method, as reported to the profiling daemon.
///
/// The discriminants are part of the wire format and must not be reordered.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Success = 0,
    Failure = 1,
    IdxNotFound = 2,
    TblNotExist = 3,
    Eaccess = 4,
    TblIsCorrupt = 5,
    CantUnwind = 6,
    UnhandledInstruction = 7,
    RefuseToUnwind = 8,
    SpIncorrect = 9,
    SpareEncoding = 10,
    UnsupportedPr = 11,
    PcIncorrect = 12,
    LevelTooDeep = 13,
    FpIncorrect = 14,
    None = 15,
    UnwindMismatch = 16,
    TblLinkIncorrect = 17,
}

impl ResultCode {
    #[inline]
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResultCode::Success => "success",
            ResultCode::Failure => "failure",
            ResultCode::IdxNotFound => "index entry not found",
            ResultCode::TblNotExist => "unwind table does not exist",
            ResultCode::Eaccess => "memory access error",
            ResultCode::TblIsCorrupt => "unwind table is corrupted",
            ResultCode::CantUnwind => "can't unwind",
            ResultCode::UnhandledInstruction => "unhandled instruction",
            ResultCode::RefuseToUnwind => "refuse to unwind",
            ResultCode::SpIncorrect => "stack pointer is incorrect",
            ResultCode::SpareEncoding => "spare encoding",
            ResultCode::UnsupportedPr => "unsupported personality routine",
            ResultCode::PcIncorrect => "program counter is incorrect",
            ResultCode::LevelTooDeep => "call chain is too deep",
            ResultCode::FpIncorrect => "frame pointer is incorrect",
            ResultCode::None => "none",
            ResultCode::UnwindMismatch => "unwind mismatch",
            ResultCode::TblLinkIncorrect => "table link is incorrect",
        }
    }
}

impl Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindError {
    #[error("No task or no address space")]
    Failure,

    #[error("Could not read memory at 0x{0:x}")]
    Access(u64),

    #[error("No unwind table entry covers 0x{0:x}")]
    IdxNotFound(u64),

    #[error("No unwind table registered for the mapping at 0x{0:x}")]
    TableNotExist(u64),

    #[error("The unwind table is corrupted")]
    TableIsCorrupt,

    #[error("The unwind table link at 0x{0:x} is incorrect")]
    TableLinkIncorrect(u64),

    #[error("The function is marked as not unwindable")]
    CantUnwind,

    #[error("Unhandled unwind instruction 0x{0:02x}")]
    UnhandledInstruction(u8),

    #[error("Unsupported pointer encoding 0x{0:02x}")]
    UnsupportedEncoding(u8),

    #[error("Unknown CIE augmentation '{}'", char::from(*.0))]
    UnknownAugmentation(u8),

    #[error("64-bit DWARF frame entries are not supported")]
    Dwarf64,

    #[error("Unsupported DWARF expression at 0x{0:x}")]
    UnsupportedExpression(u64),

    #[error("Unwinding was refused by the table")]
    RefuseToUnwind,

    #[error("Spare register mask encoding 0x{0:02x}")]
    SpareEncoding(u8),

    #[error("Unsupported personality routine 0x{0:08x}")]
    UnsupportedPersonality(u32),

    #[error("Stack pointer 0x{0:x} is incorrect")]
    SpIncorrect(u64),

    #[error("Program counter 0x{0:x} is incorrect")]
    PcIncorrect(u64),

    #[error("Frame pointer 0x{0:x} is incorrect")]
    FpIncorrect(u64),

    #[error("The unwind result does not match the disassembled prologue")]
    UnwindMismatch,
}

impl UnwindError {
    pub fn code(&self) -> ResultCode {
        match self {
            UnwindError::Failure => ResultCode::Failure,
            UnwindError::Access(_) => ResultCode::Eaccess,
            UnwindError::IdxNotFound(_) => ResultCode::IdxNotFound,
            UnwindError::TableNotExist(_) => ResultCode::TblNotExist,
            UnwindError::TableIsCorrupt => ResultCode::TblIsCorrupt,
            UnwindError::TableLinkIncorrect(_) => ResultCode::TblLinkIncorrect,
            UnwindError::CantUnwind => ResultCode::CantUnwind,
            UnwindError::UnhandledInstruction(_)
            | UnwindError::UnsupportedEncoding(_)
            | UnwindError::UnknownAugmentation(_)
            | UnwindError::Dwarf64
            | UnwindError::UnsupportedExpression(_) => ResultCode::UnhandledInstruction,
            UnwindError::RefuseToUnwind => ResultCode::RefuseToUnwind,
            UnwindError::SpareEncoding(_) => ResultCode::SpareEncoding,
            UnwindError::UnsupportedPersonality(_) => ResultCode::UnsupportedPr,
            UnwindError::SpIncorrect(_) => ResultCode::SpIncorrect,
            UnwindError::PcIncorrect(_) => ResultCode::PcIncorrect,
            UnwindError::FpIncorrect(_) => ResultCode::FpIncorrect,
            UnwindError::UnwindMismatch => ResultCode::UnwindMismatch,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("A region starting at 0x{0:x} is already registered")]
    AlreadyExists(u64),

    #[error("The region 0x{0:x}-0x{1:x} is empty")]
    EmptyRegion(u64, u64),

    #[error("The section at 0x{0:x} with length 0x{1:x} wraps the address space")]
    SectionOverflow(u64, u64),
}
