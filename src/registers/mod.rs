pub mod codec;
pub mod map;

pub use codec::{decode, decode_slice, encode, EncodingKind, REGISTERS_PER_VALUE};
pub use map::{MapEntry, RegisterMap, SharedRegisterMap};
