use crate::bytecode::FieldFlags;
use crate::keys::{ClassId, FieldDescriptorId, Symbol};

/// Resolved field: slot index and byte offset are assigned at the end of
/// resolution and never change afterwards.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: Symbol,
    pub desc: Symbol,
    pub descriptor: FieldDescriptorId,
    pub flags: FieldFlags,
    /// Position in the declaring class's field vector, inherited fields first.
    pub slot: u16,
    /// Byte offset from the object base (instance fields) or from the static
    /// instance base (static fields).
    pub offset: usize,
    pub class_def: ClassId,
}
