use std::fmt;
use std::num::NonZeroU32;

/// Interned name or descriptor.
pub type Symbol = lasso::Spur;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(NonZeroU32);

        impl $name {
            /// Builds an id from a one-based arena length (`vec.push(x); Id::from_usize(vec.len())`).
            pub fn from_usize(one_based: usize) -> Self {
                Self(NonZeroU32::new(one_based as u32).expect("id must be non-zero"))
            }

            pub const fn to_index(self) -> usize {
                (self.0.get() - 1) as usize
            }

            pub const fn raw(self) -> u32 {
                self.0.get()
            }

            pub const fn from_raw(raw: u32) -> Option<Self> {
                match NonZeroU32::new(raw) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0.get())
            }
        }
    };
}

id_type!(ClassId);
id_type!(MethodId);
id_type!(LoaderId);
id_type!(ThreadId);
id_type!(SignatureId);
id_type!(FieldDescriptorId);
id_type!(
    /// Index into the IR module's function arena.
    FunctionId
);
id_type!(
    /// Index into the code table. The word stored in VT slots, IMT slots and
    /// method code slots; `0` means "not materialised yet".
    CodeHandle
);
id_type!(
    /// Index into the inline-cache envelope arena.
    EnvelopeId
);

/// Isolate ids are plain indices into the fixed isolate table; the bootstrap
/// loader always runs as isolate 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IsolateId(pub u32);

impl IsolateId {
    pub const BOOT: IsolateId = IsolateId(0);

    pub fn to_index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodKey {
    pub name: Symbol,
    pub desc: Symbol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldKey {
    pub name: Symbol,
    pub desc: Symbol,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_one_based() {
        let id = ClassId::from_usize(1);
        assert_eq!(id.to_index(), 0);
        assert_eq!(id.raw(), 1);
        assert_eq!(ClassId::from_raw(0), None);
        assert_eq!(ClassId::from_raw(7).unwrap().to_index(), 6);
    }
}
