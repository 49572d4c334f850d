//! Pavlok device support.
//!
//! Wire encodings, the command path, background loops and the synchronous
//! facade callers use.

pub mod device;
pub mod dispatcher;
pub mod loops;
pub mod protocol;
