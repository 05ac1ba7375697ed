pub(crate) mod dwarf;
pub(crate) mod ehabi;
pub(crate) mod framepointer;
