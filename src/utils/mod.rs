/// Flag-set boilerplate shared by the wire types.
#[macro_use]
pub(crate) mod boilerplate;

/// Big-endian cursor helpers for the fixed-layout wire formats.
pub(crate) mod wire;
