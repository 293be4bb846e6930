//! Read/write request decoding and root-directory confinement

use std::fmt;
use std::path::{Component, Path, PathBuf};

use super::options::TransferOption;
use super::packet::{ErrorCode, Packet};

/// Transfer mode named in a request
///
/// Data is always moved byte for byte; the mode is kept for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Netascii,
    Octet,
    Mail,
}

impl Mode {
    /// Parse a mode case-insensitively, falling back to octet
    pub fn parse_lenient(mode: &str) -> Self {
        match mode.to_ascii_lowercase().as_str() {
            "netascii" => Self::Netascii,
            "octet" => Self::Octet,
            "mail" => Self::Mail,
            other => {
                log::warn!("Unsupported mode: {}, using octet", other);
                Self::Octet
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Netascii => "netascii",
            Self::Octet => "octet",
            Self::Mail => "mail",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// RRQ: server sends the file
    Download,
    /// WRQ: client sends the file
    Upload,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Upload => "upload",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a request was refused before any transfer state existed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// Not an RRQ/WRQ
    NotARequest,
    /// Requested path leaves the root directory
    PathEscapesRoot(String),
}

impl RequestError {
    pub fn to_error_code(&self) -> ErrorCode {
        match self {
            Self::NotARequest => ErrorCode::IllegalOperation,
            Self::PathEscapesRoot(_) => ErrorCode::AccessViolation,
        }
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotARequest => write!(f, "not a read or write request"),
            Self::PathEscapesRoot(name) => write!(f, "path '{}' escapes the root directory", name),
        }
    }
}

impl std::error::Error for RequestError {}

/// A validated RRQ/WRQ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub direction: Direction,
    /// Normalized name relative to the root directory
    pub filename: String,
    /// Absolute location under the root directory
    pub path: PathBuf,
    pub mode: Mode,
    pub options: Vec<TransferOption>,
}

impl Request {
    /// Turn a decoded RRQ/WRQ into a request confined to `root`
    pub fn from_packet(packet: Packet, root: &Path) -> Result<Self, RequestError> {
        let (direction, filename, mode, options) = match packet {
            Packet::Rrq {
                filename,
                mode,
                options,
            } => (Direction::Download, filename, mode, options),
            Packet::Wrq {
                filename,
                mode,
                options,
            } => (Direction::Upload, filename, mode, options),
            _ => return Err(RequestError::NotARequest),
        };

        let relative = normalize_filename(&filename)
            .ok_or_else(|| RequestError::PathEscapesRoot(filename.clone()))?;

        Ok(Self {
            direction,
            filename: relative.to_string_lossy().replace('\\', "/"),
            path: root.join(&relative),
            mode: Mode::parse_lenient(&mode),
            options,
        })
    }
}

/// Lexically normalize a client filename
///
/// Both `/` and `\` separate components, leading separators are stripped,
/// `.` is dropped and `..` pops a component. Returns `None` when the result
/// would leave the root or names nothing.
pub fn normalize_filename(filename: &str) -> Option<PathBuf> {
    if filename.contains('\0') {
        return None;
    }

    let mut parts: Vec<&str> = Vec::new();
    for part in filename.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            // Drive letters and similar prefixes
            p if p.contains(':') => return None,
            p => parts.push(p),
        }
    }

    if parts.is_empty() {
        return None;
    }

    let path: PathBuf = parts.iter().collect();
    // Guard against anything the platform still treats as non-relative
    if path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rrq(filename: &str, mode: &str) -> Packet {
        Packet::Rrq {
            filename: filename.to_string(),
            mode: mode.to_string(),
            options: Vec::new(),
        }
    }

    #[test]
    fn strips_leading_slashes_and_dots() {
        assert_eq!(
            normalize_filename("/boot/./pxelinux.0"),
            Some(PathBuf::from("boot").join("pxelinux.0"))
        );
        assert_eq!(
            normalize_filename("//configs/sw1/../sw2.cfg"),
            Some(PathBuf::from("configs").join("sw2.cfg"))
        );
        assert_eq!(
            normalize_filename("images\\c2960.bin"),
            Some(PathBuf::from("images").join("c2960.bin"))
        );
    }

    #[test]
    fn rejects_traversal() {
        for name in [
            "../../etc/passwd",
            "/../etc/passwd",
            "a/../../etc/passwd",
            "..\\..\\windows\\win.ini",
            "C:\\boot.ini",
            "..",
            "/",
        ] {
            assert_eq!(normalize_filename(name), None, "{}", name);
        }
    }

    #[test]
    fn request_maps_traversal_to_access_violation() {
        let err = Request::from_packet(rrq("../../etc/passwd", "octet"), Path::new("/srv/tftp"))
            .unwrap_err();
        assert_eq!(err.to_error_code(), ErrorCode::AccessViolation);
    }

    #[test]
    fn request_downgrades_unknown_mode() {
        let request = Request::from_packet(rrq("/firmware.bin", "BINARY"), Path::new("/srv/tftp"))
            .unwrap();
        assert_eq!(request.mode, Mode::Octet);
        assert_eq!(request.filename, "firmware.bin");
        assert_eq!(request.path, Path::new("/srv/tftp").join("firmware.bin"));
        assert_eq!(request.direction, Direction::Download);

        let request =
            Request::from_packet(rrq("notes.txt", "NetASCII"), Path::new("/srv/tftp")).unwrap();
        assert_eq!(request.mode, Mode::Netascii);
    }

    #[test]
    fn data_packet_is_not_a_request() {
        let packet = Packet::Data {
            block_num: 1,
            data: Vec::new(),
        };
        assert_eq!(
            Request::from_packet(packet, Path::new("/srv")),
            Err(RequestError::NotARequest)
        );
    }
}
