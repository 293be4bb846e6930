//! Protocol options (RFC 2347, RFC 2348, RFC 2349)

use std::time::Duration;

/// Block size used when no `blksize` option is negotiated
pub const DEFAULT_BLOCK_SIZE: u16 = 512;
/// Smallest `blksize` a client may request (RFC 2348)
pub const MIN_BLOCK_SIZE: u16 = 8;
/// Largest `blksize` a client may request (RFC 2348)
pub const MAX_BLOCK_SIZE: u16 = 65464;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RETRIES: u32 = 5;

/// Options recognized by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionType {
    BlockSize,
    Timeout,
    TransferSize,
}

impl OptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BlockSize => "blksize",
            Self::Timeout => "timeout",
            Self::TransferSize => "tsize",
        }
    }

    /// Look up an option by its lowercase wire name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "blksize" => Some(Self::BlockSize),
            "timeout" => Some(Self::Timeout),
            "tsize" => Some(Self::TransferSize),
            _ => None,
        }
    }
}

/// A single `name=value` option pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOption {
    pub option: OptionType,
    pub value: u64,
}

/// Direction of the request being negotiated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    /// Read request carrying the size of the file to be sent
    Read(u64),
    Write,
}

/// Server-side knobs, never sent on the wire
#[derive(Debug, Clone)]
pub struct OptionsPrivate {
    /// Transmissions per block (or per OACK) before the transfer fails
    pub retries: u32,
    /// Transmissions of an OACK before the transfer fails
    pub oack_retries: u32,
    /// Per-ACK wait when the client does not negotiate `timeout`
    pub timeout: Duration,
    /// Ceiling applied to negotiated `blksize`; probed at startup when `None`
    pub max_blksize: Option<u16>,
}

impl Default for OptionsPrivate {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            oack_retries: DEFAULT_RETRIES,
            timeout: DEFAULT_TIMEOUT,
            max_blksize: None,
        }
    }
}

/// Parameters in force for one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionsProtocol {
    pub block_size: u16,
    pub timeout: Duration,
    /// File size announced by tsize (read: ours, write: the client's)
    pub transfer_size: Option<u64>,
}

impl OptionsProtocol {
    /// Parameters for a transfer that negotiated nothing
    ///
    /// Plain RFC 1350 transfers always use 512-byte blocks.
    pub fn unnegotiated(local: &OptionsPrivate) -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            timeout: local.timeout,
            transfer_size: None,
        }
    }

    /// Negotiate the requested options
    ///
    /// `options` is rewritten in place into the list to acknowledge in the
    /// OACK: `blksize` clamped to `max_blksize`, `tsize` filled in with the
    /// file size on reads, invalid values removed. An empty list after the
    /// call means no OACK is sent.
    pub fn parse(
        options: &mut Vec<TransferOption>,
        request_type: RequestType,
        local: &OptionsPrivate,
        max_blksize: u16,
    ) -> Self {
        let mut negotiated = Self::unnegotiated(local);
        let mut acknowledged = Vec::with_capacity(options.len());

        for opt in options.iter() {
            match opt.option {
                OptionType::BlockSize => {
                    if opt.value < MIN_BLOCK_SIZE as u64 || opt.value > MAX_BLOCK_SIZE as u64 {
                        log::warn!("Ignoring out-of-range blksize {}", opt.value);
                        continue;
                    }
                    let size = (opt.value as u16).min(max_blksize);
                    if size as u64 != opt.value {
                        log::info!(
                            "Clamping requested blksize {} to safe maximum {}",
                            opt.value,
                            size
                        );
                    }
                    negotiated.block_size = size;
                    acknowledged.push(TransferOption {
                        option: OptionType::BlockSize,
                        value: size as u64,
                    });
                }
                OptionType::Timeout => {
                    if !(1..=255).contains(&opt.value) {
                        log::warn!("Ignoring out-of-range timeout {}", opt.value);
                        continue;
                    }
                    negotiated.timeout = Duration::from_secs(opt.value);
                    acknowledged.push(*opt);
                }
                OptionType::TransferSize => {
                    let size = match request_type {
                        RequestType::Read(file_size) => file_size,
                        RequestType::Write => opt.value,
                    };
                    negotiated.transfer_size = Some(size);
                    acknowledged.push(TransferOption {
                        option: OptionType::TransferSize,
                        value: size,
                    });
                }
            }
        }

        *options = acknowledged;
        negotiated
    }
}
