//! Bluetooth side of the service.
//!
//! The transport seam and its BlueZ backend, the session owning the single
//! link, and the supervisor that rebuilds it.

pub mod session;
pub mod supervisor;
pub mod transport;
