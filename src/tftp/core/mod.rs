//! TFTP core protocol implementation
//!
//! This module contains the core components of the TFTP protocol:
//! - `packet`: Packet serialization and deserialization
//! - `options`: Protocol options and their negotiation
//! - `request`: Read/write request validation and path confinement
//! - `socket`: Per-transfer sockets and datagram size limits

pub mod options;
mod packet;
mod request;
mod socket;

// Public core types
pub use options::{OptionType, OptionsPrivate, OptionsProtocol, RequestType, TransferOption};
pub use packet::{ErrorCode, MAX_PACKET_SIZE, Opcode, Packet, PacketError};
pub use request::{Direction, Mode, Request, RequestError, normalize_filename};
pub use socket::{Received, Socket, is_message_too_long, probe_max_blksize};
