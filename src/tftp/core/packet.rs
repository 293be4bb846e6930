use std::fmt;

use super::options::{OptionType, TransferOption};

/// Largest datagram a peer may legally send us (blksize upper bound + header)
pub const MAX_PACKET_SIZE: usize = 65468;

/// TFTP opcodes (RFC 1350, RFC 2347)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
    Oack = 6,
}

impl Opcode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Rrq),
            2 => Some(Self::Wrq),
            3 => Some(Self::Data),
            4 => Some(Self::Ack),
            5 => Some(Self::Error),
            6 => Some(Self::Oack),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// TFTP error codes
///
/// Only `NotDefined`, `FileNotFound`, `AccessViolation` and `IllegalOperation`
/// are emitted by the server; the rest are decoded from peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileExists = 6,
    NoSuchUser = 7,
    /// RFC 2347 option refusal
    OptionRefused = 8,
}

impl ErrorCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::NotDefined),
            1 => Some(Self::FileNotFound),
            2 => Some(Self::AccessViolation),
            3 => Some(Self::DiskFull),
            4 => Some(Self::IllegalOperation),
            5 => Some(Self::UnknownTransferId),
            6 => Some(Self::FileExists),
            7 => Some(Self::NoSuchUser),
            8 => Some(Self::OptionRefused),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn default_message(self) -> &'static str {
        match self {
            Self::NotDefined => "Undefined error",
            Self::FileNotFound => "File not found",
            Self::AccessViolation => "Access violation",
            Self::DiskFull => "Disk full or allocation exceeded",
            Self::IllegalOperation => "Illegal TFTP operation",
            Self::UnknownTransferId => "Unknown transfer ID",
            Self::FileExists => "File already exists",
            Self::NoSuchUser => "No such user",
            Self::OptionRefused => "Option negotiation refused",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.as_u16())
    }
}

/// Decoding failure for an incoming datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Fewer bytes than the opcode requires
    TooShort,
    /// Opcode outside 1..=6
    UnknownOpcode(u16),
    /// Known opcode with a broken body
    Malformed(&'static str),
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort => write!(f, "Invalid packet size"),
            Self::UnknownOpcode(op) => write!(f, "Illegal TFTP operation: {}", op),
            Self::Malformed(what) => write!(f, "Malformed packet: {}", what),
        }
    }
}

impl std::error::Error for PacketError {}

/// A decoded TFTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq {
        filename: String,
        mode: String,
        options: Vec<TransferOption>,
    },
    Wrq {
        filename: String,
        mode: String,
        options: Vec<TransferOption>,
    },
    Data {
        block_num: u16,
        data: Vec<u8>,
    },
    Ack(u16),
    Error {
        code: u16,
        msg: String,
    },
    Oack(Vec<TransferOption>),
}

impl Packet {
    /// Build an ERROR packet carrying the code's default message
    pub fn error(code: ErrorCode) -> Self {
        Self::error_msg(code, code.default_message())
    }

    pub fn error_msg(code: ErrorCode, msg: impl Into<String>) -> Self {
        Packet::Error {
            code: code.as_u16(),
            msg: msg.into(),
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::Rrq { .. } => Opcode::Rrq,
            Packet::Wrq { .. } => Opcode::Wrq,
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack(_) => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
            Packet::Oack(_) => Opcode::Oack,
        }
    }

    /// Encode the packet into its wire representation
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&self.opcode().as_u16().to_be_bytes());

        match self {
            Packet::Rrq {
                filename,
                mode,
                options,
            }
            | Packet::Wrq {
                filename,
                mode,
                options,
            } => {
                push_str(&mut buf, filename);
                push_str(&mut buf, mode);
                push_options(&mut buf, options);
            }
            Packet::Data { block_num, data } => {
                buf.extend_from_slice(&block_num.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack(block_num) => buf.extend_from_slice(&block_num.to_be_bytes()),
            Packet::Error { code, msg } => {
                buf.extend_from_slice(&code.to_be_bytes());
                push_str(&mut buf, msg);
            }
            Packet::Oack(options) => push_options(&mut buf, options),
        }

        buf
    }

    /// Decode a datagram
    ///
    /// Request options that are not `blksize`, `timeout` or `tsize`, or whose
    /// value is not a decimal number, are dropped here.
    pub fn deserialize(buf: &[u8]) -> Result<Packet, PacketError> {
        if buf.len() < 2 {
            return Err(PacketError::TooShort);
        }

        let raw = u16::from_be_bytes([buf[0], buf[1]]);
        let opcode = Opcode::from_u16(raw).ok_or(PacketError::UnknownOpcode(raw))?;
        let body = &buf[2..];

        match opcode {
            Opcode::Rrq | Opcode::Wrq => {
                let fields: Vec<&[u8]> = split_fields(body);
                if fields.len() < 2 {
                    return Err(PacketError::Malformed("missing filename or mode"));
                }
                let filename = field_str(fields[0])?;
                if filename.is_empty() {
                    return Err(PacketError::Malformed("empty filename"));
                }
                let mode = field_str(fields[1])?;
                let options = parse_options(&fields[2..]);

                Ok(if opcode == Opcode::Rrq {
                    Packet::Rrq {
                        filename,
                        mode,
                        options,
                    }
                } else {
                    Packet::Wrq {
                        filename,
                        mode,
                        options,
                    }
                })
            }
            Opcode::Data => {
                if body.len() < 2 {
                    return Err(PacketError::TooShort);
                }
                Ok(Packet::Data {
                    block_num: u16::from_be_bytes([body[0], body[1]]),
                    data: body[2..].to_vec(),
                })
            }
            Opcode::Ack => {
                if body.len() < 2 {
                    return Err(PacketError::TooShort);
                }
                Ok(Packet::Ack(u16::from_be_bytes([body[0], body[1]])))
            }
            Opcode::Error => {
                if body.len() < 2 {
                    return Err(PacketError::TooShort);
                }
                let code = u16::from_be_bytes([body[0], body[1]]);
                let msg_bytes = body[2..].split(|b| *b == 0).next().unwrap_or_default();
                Ok(Packet::Error {
                    code,
                    msg: String::from_utf8_lossy(msg_bytes).into_owned(),
                })
            }
            Opcode::Oack => Ok(Packet::Oack(parse_options(&split_fields(body)))),
        }
    }
}

fn push_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

fn push_options(buf: &mut Vec<u8>, options: &[TransferOption]) {
    for opt in options {
        push_str(buf, opt.option.as_str());
        push_str(buf, &opt.value.to_string());
    }
}

/// Split a NUL-separated body, dropping the empty tail after the final NUL
fn split_fields(body: &[u8]) -> Vec<&[u8]> {
    let mut fields: Vec<&[u8]> = body.split(|b| *b == 0).collect();
    if body.last() == Some(&0) || body.is_empty() {
        fields.pop();
    }
    fields
}

fn field_str(field: &[u8]) -> Result<String, PacketError> {
    std::str::from_utf8(field)
        .map(str::to_string)
        .map_err(|_| PacketError::Malformed("field is not valid UTF-8"))
}

fn parse_options(fields: &[&[u8]]) -> Vec<TransferOption> {
    let mut options = Vec::new();

    for pair in fields.chunks_exact(2) {
        let (name, value) = (pair[0], pair[1]);
        if name.is_empty() || value.is_empty() {
            continue;
        }
        let name = String::from_utf8_lossy(name).to_ascii_lowercase();
        let value = String::from_utf8_lossy(value);

        let Some(option) = OptionType::from_name(&name) else {
            log::info!("Ignoring unsupported option: {}={}", name, value);
            continue;
        };
        match value.trim().parse::<u64>() {
            Ok(value) => options.push(TransferOption { option, value }),
            Err(_) => log::warn!("Ignoring option {} with non-numeric value '{}'", name, value),
        }
    }

    options
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rrq_bytes(parts: &[&str]) -> Vec<u8> {
        let mut buf = vec![0, 1];
        for p in parts {
            buf.extend_from_slice(p.as_bytes());
            buf.push(0);
        }
        buf
    }

    #[test]
    fn decodes_read_request_with_options() {
        let buf = rrq_bytes(&["firmware.bin", "octet", "blksize", "1024", "tsize", "0"]);
        let packet = Packet::deserialize(&buf).unwrap();

        assert_eq!(
            packet,
            Packet::Rrq {
                filename: "firmware.bin".to_string(),
                mode: "octet".to_string(),
                options: vec![
                    TransferOption {
                        option: OptionType::BlockSize,
                        value: 1024
                    },
                    TransferOption {
                        option: OptionType::TransferSize,
                        value: 0
                    },
                ],
            }
        );
    }

    #[test]
    fn drops_unknown_and_non_numeric_options() {
        let buf = rrq_bytes(&[
            "a.txt",
            "octet",
            "windowsize",
            "16",
            "BLKSIZE",
            "1428",
            "timeout",
            "soon",
        ]);
        let Packet::Rrq { options, .. } = Packet::deserialize(&buf).unwrap() else {
            panic!("expected RRQ");
        };
        assert_eq!(
            options,
            vec![TransferOption {
                option: OptionType::BlockSize,
                value: 1428
            }]
        );
    }

    #[test]
    fn request_without_mode_is_malformed() {
        let buf = rrq_bytes(&["only-a-name"]);
        assert!(matches!(
            Packet::deserialize(&buf),
            Err(PacketError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_short_and_unknown_packets() {
        assert_eq!(Packet::deserialize(&[0]), Err(PacketError::TooShort));
        assert_eq!(Packet::deserialize(&[0, 4, 0]), Err(PacketError::TooShort));
        assert_eq!(
            Packet::deserialize(&[0, 9, 0, 1]),
            Err(PacketError::UnknownOpcode(9))
        );
    }

    #[test]
    fn encodes_oack_and_error() {
        let oack = Packet::Oack(vec![TransferOption {
            option: OptionType::BlockSize,
            value: 1024,
        }]);
        assert_eq!(oack.serialize(), b"\x00\x06blksize\x001024\x00".to_vec());

        let err = Packet::error(ErrorCode::AccessViolation);
        assert_eq!(err.serialize(), b"\x00\x05\x00\x02Access violation\x00".to_vec());
    }

    #[test]
    fn decodes_error_and_empty_data() {
        let packet = Packet::deserialize(b"\x00\x05\x00\x08bad options\x00").unwrap();
        assert_eq!(
            packet,
            Packet::Error {
                code: 8,
                msg: "bad options".to_string()
            }
        );

        let packet = Packet::deserialize(&[0, 3, 0xff, 0xff]).unwrap();
        assert_eq!(
            packet,
            Packet::Data {
                block_num: 65535,
                data: Vec::new()
            }
        );
    }
}
