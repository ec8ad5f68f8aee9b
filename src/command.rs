use std::fmt::{Debug, Display, Formatter};

use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::ParseError;

/// The 16-bit command discriminator at the start of every datagram.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum Opcode {
    ReadRequest = 1,
    WriteRequest = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
    OptionAck = 6,
}

/// 16-bit sequence counter identifying a Data / Ack pair's position in the transfer.
///
/// NB: The counter wraps modulo 2^16, so block 0 follows after block 65535 in long transfers.
///      Block 0 itself is only ever acknowledged (answering a write request or an
///      Option-Acknowledgment), never carried by a Data command.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct BlockId(u16);

impl Display for BlockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl BlockId {
    pub const ZERO: BlockId = BlockId(0);

    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    pub fn next(&self) -> BlockId {
        BlockId(self.0.wrapping_add(1))
    }

    pub fn prev(&self) -> BlockId {
        BlockId(self.0.wrapping_sub(1))
    }
}

/// The mode string carried by request commands.
///
/// The engine hands payload bytes through unmodified in both modes - line ending translation
///  for `netascii` is the business of the file access layer, not the protocol engine.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TransferMode {
    Netascii,
    Octet,
}

impl TransferMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Netascii => "netascii",
            TransferMode::Octet => "octet",
        }
    }

    /// Mode strings are matched case-insensitively on the wire.
    fn try_from_wire(s: &str) -> Result<TransferMode, ParseError> {
        if s.eq_ignore_ascii_case("netascii") {
            Ok(TransferMode::Netascii)
        }
        else if s.eq_ignore_ascii_case("octet") {
            Ok(TransferMode::Octet)
        }
        else {
            Err(ParseError::UnknownTransferMode(s.to_string()))
        }
    }
}

/// The error code carried by Error commands.
///
/// This is deliberately *not* a closed enum: peers may send implementation-specific codes,
///  and rejecting them would turn a legal peer message into a parse failure. The well-known
///  codes are provided as constants.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct ErrorCode(u16);

impl ErrorCode {
    pub const NOT_DEFINED: ErrorCode = ErrorCode(0);
    pub const FILE_NOT_FOUND: ErrorCode = ErrorCode(1);
    pub const ACCESS_VIOLATION: ErrorCode = ErrorCode(2);
    pub const DISK_FULL: ErrorCode = ErrorCode(3);
    pub const ILLEGAL_OPERATION: ErrorCode = ErrorCode(4);
    pub const UNKNOWN_TRANSFER_ID: ErrorCode = ErrorCode(5);
    pub const FILE_EXISTS: ErrorCode = ErrorCode(6);
    pub const NO_SUCH_USER: ErrorCode = ErrorCode(7);
    pub const OPTION_NEGOTIATION_FAILED: ErrorCode = ErrorCode(8);

    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    fn name(&self) -> &'static str {
        match self.0 {
            0 => "NotDefined",
            1 => "FileNotFound",
            2 => "AccessViolation",
            3 => "DiskFull",
            4 => "IllegalOperation",
            5 => "UnknownTransferId",
            6 => "FileExists",
            7 => "NoSuchUser",
            8 => "OptionNegotiationFailed",
            _ => "Unknown",
        }
    }
}

impl Debug for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

/// A protocol command as a typed value, immutable once constructed.
///
/// The wire codec lives on the type itself: [`Command::ser`] writes the established binary
///  layout, [`Command::deser`] is the sole boundary where untrusted network input is
///  validated before a command reaches the session logic.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Command {
    ReadRequest {
        filename: String,
        mode: TransferMode,
        /// requested option name / value pairs, in wire order
        options: Vec<(String, String)>,
    },
    WriteRequest {
        filename: String,
        mode: TransferMode,
        options: Vec<(String, String)>,
    },
    Data {
        block: BlockId,
        /// at most the negotiated block size - the caller guarantees this before `ser`
        payload: Vec<u8>,
    },
    Ack {
        block: BlockId,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    OptionAck {
        /// negotiated option name / value pairs, in wire order
        options: Vec<(String, String)>,
    },
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::ReadRequest { .. } => Opcode::ReadRequest,
            Command::WriteRequest { .. } => Opcode::WriteRequest,
            Command::Data { .. } => Opcode::Data,
            Command::Ack { .. } => Opcode::Ack,
            Command::Error { .. } => Opcode::Error,
            Command::OptionAck { .. } => Opcode::OptionAck,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(self.opcode().into());
        match self {
            Command::ReadRequest { filename, mode, options }
            | Command::WriteRequest { filename, mode, options } => {
                put_cstr(buf, filename);
                put_cstr(buf, mode.as_str());
                for (name, value) in options {
                    put_cstr(buf, name);
                    put_cstr(buf, value);
                }
            }
            Command::Data { block, payload } => {
                buf.put_u16(block.to_raw());
                buf.put_slice(payload);
            }
            Command::Ack { block } => {
                buf.put_u16(block.to_raw());
            }
            Command::Error { code, message } => {
                buf.put_u16(code.to_raw());
                put_cstr(buf, message);
            }
            Command::OptionAck { options } => {
                for (name, value) in options {
                    put_cstr(buf, name);
                    put_cstr(buf, value);
                }
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> Result<Command, ParseError> {
        let raw = try_get_u16(buf)?;
        let opcode = Opcode::try_from(raw).map_err(|_| ParseError::UnknownOpcode(raw))?;

        match opcode {
            Opcode::ReadRequest => {
                let (filename, mode, options) = Self::deser_request(buf)?;
                Ok(Command::ReadRequest { filename, mode, options })
            }
            Opcode::WriteRequest => {
                let (filename, mode, options) = Self::deser_request(buf)?;
                Ok(Command::WriteRequest { filename, mode, options })
            }
            Opcode::Data => {
                let block = BlockId::from_raw(try_get_u16(buf)?);
                let mut payload = vec![0u8; buf.remaining()];
                buf.copy_to_slice(&mut payload);
                Ok(Command::Data { block, payload })
            }
            Opcode::Ack => {
                // trailing bytes after the block number are tolerated
                let block = BlockId::from_raw(try_get_u16(buf)?);
                Ok(Command::Ack { block })
            }
            Opcode::Error => {
                let code = ErrorCode::from_raw(try_get_u16(buf)?);
                let message = try_get_cstr(buf)?;
                Ok(Command::Error { code, message })
            }
            Opcode::OptionAck => {
                let options = Self::deser_options(buf)?;
                Ok(Command::OptionAck { options })
            }
        }
    }

    fn deser_request(buf: &mut impl Buf) -> Result<(String, TransferMode, Vec<(String, String)>), ParseError> {
        let filename = try_get_cstr(buf)?;
        let mode = TransferMode::try_from_wire(&try_get_cstr(buf)?)?;
        let options = Self::deser_options(buf)?;
        Ok((filename, mode, options))
    }

    fn deser_options(buf: &mut impl Buf) -> Result<Vec<(String, String)>, ParseError> {
        let mut options = Vec::new();
        while buf.has_remaining() {
            let name = try_get_cstr(buf)?;
            if !buf.has_remaining() {
                return Err(ParseError::MissingOptionValue(name));
            }
            let value = try_get_cstr(buf)?;
            options.push((name, value));
        }
        Ok(options)
    }
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn try_get_cstr(buf: &mut impl Buf) -> Result<String, ParseError> {
    let mut raw = Vec::new();
    loop {
        if !buf.has_remaining() {
            return Err(ParseError::UnterminatedString);
        }
        match buf.get_u8() {
            0 => break,
            b => raw.push(b),
        }
    }
    String::from_utf8(raw).map_err(|_| ParseError::InvalidString)
}

fn try_get_u16(buf: &mut impl Buf) -> Result<u16, ParseError> {
    if buf.remaining() < 2 {
        return Err(ParseError::Truncated);
    }
    Ok(buf.get_u16())
}
