//! Wire encoding: CDR primitives and length-prefixed framing.

pub mod cdr;
pub mod frame;
