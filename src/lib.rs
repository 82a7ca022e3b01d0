//! ANSI E1.31 (sACN) data-packet codec and receive/transmit pipeline.
//!
//! This crate owns the wire format (the [`packet::DataPacket`] codec)
//! and the two pieces of logic layered on top of it: a [`receiver`]
//! that arbitrates between competing sources on a universe, and a
//! [`transmitter`] that drives the keep-alive cadence. The [`transport`]
//! module is the one seam onto a real UDP socket; everything else deals
//! only in bytes.

pub mod byte;
pub mod cid;
pub mod error;
pub mod packet;
pub mod receiver;
pub mod source;
pub mod transmitter;
pub mod transport;

pub use cid::Cid;
pub use error::Error;
pub use packet::DataPacket;
pub use receiver::Receiver;
pub use source::SourceTable;
pub use transmitter::{PayloadHandle, Transmitter};
