//! The building blocks of the transfer protocol: the frame codec, the TCP
//! endpoint, the readiness reactor and the per-connection session state.

pub mod convert;
pub mod packet;
pub mod reactor;
pub mod session;
pub mod socket;
pub mod support;
