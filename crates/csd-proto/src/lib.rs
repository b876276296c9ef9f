#![no_std]

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use core::{convert::TryFrom, fmt};

/// Number of bytes in a read buffer's marker region.
pub const MARKER_LEN: usize = 64;
/// Number of little-endian u64 words in a marker.
pub const MARKER_WORDS: usize = MARKER_LEN / 8;
/// Leading signature of a full-command marker.
pub const COMMAND_MARKER_SIGNATURE: [u8; 8] = *b"CSDMKCMD";
/// Leading signature of a legacy (core buffer id) marker.
pub const LEGACY_MARKER_SIGNATURE: [u8; 8] = *b"CSDMKLGY";
/// Granularity of command transfer lengths.
pub const UNIT_BYTES: u32 = 512;
/// Number of bytes in encoded [`CommandWords`].
pub const COMMAND_WORDS_LEN: usize = 16;

const REPLICATE_BYTE: u64 = 0x0101_0101_0101_0101;

const OPCODE_SHIFT: u32 = 0;
const FLAGS_SHIFT: u32 = 8;
const TOKEN_SHIFT: u32 = 16;
const SEQ_SHIFT: u32 = 32;
const UNITS_SHIFT: u32 = 48;

/// Errors surfaced while encoding or decoding command words.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtoError {
    /// Buffer length did not match the protocol expectation.
    InvalidLength { expected: usize, actual: usize },
    /// Opcode byte is not a known command.
    InvalidOpcode(u8),
    /// Field value failed validation.
    InvalidValue(&'static str),
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoError::InvalidLength { expected, actual } => {
                write!(f, "invalid length {actual}, expected {expected}")
            }
            ProtoError::InvalidOpcode(op) => write!(f, "invalid opcode {op}"),
            ProtoError::InvalidValue(field) => write!(f, "invalid field value: {field}"),
        }
    }
}

/// Result alias for codec operations.
pub type Result<T> = core::result::Result<T, ProtoError>;

/// Hardware command opcodes. Zero is unassigned: a zeroed command slot never decodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Read = 1,
    Write = 2,
    Flush = 3,
    ReleaseReadBuffer = 4,
    Admin = 5,
}

impl Opcode {
    pub fn is_read(self) -> bool {
        matches!(self, Opcode::Read)
    }

    pub fn is_write(self) -> bool {
        matches!(self, Opcode::Write)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Read),
            2 => Ok(Self::Write),
            3 => Ok(Self::Flush),
            4 => Ok(Self::ReleaseReadBuffer),
            5 => Ok(Self::Admin),
            other => Err(ProtoError::InvalidOpcode(other)),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> Self {
        op as u8
    }
}

bitflags! {
    /// Per-command flag byte carried in word 0.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct CommandFlags: u8 {
        /// Alternates on every reissue so a replay is distinguishable from the original.
        const PARITY = 1 << 0;
        /// Command is routed through device firmware instead of the hardware fast path.
        const FIRMWARE = 1 << 1;
        /// Force unit access.
        const FUA = 1 << 2;
    }
}

/// The two key words of a hardware command, as written to the command slot and
/// echoed by the hardware into full-command markers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CommandWords(pub [u64; 2]);

impl CommandWords {
    /// Token id field of word 0. No side table is needed to recover it.
    pub fn token_id(&self) -> u16 {
        (self.0[0] >> TOKEN_SHIFT) as u16
    }

    pub fn opcode_byte(&self) -> u8 {
        (self.0[0] >> OPCODE_SHIFT) as u8
    }

    pub fn flags(&self) -> CommandFlags {
        CommandFlags::from_bits_retain((self.0[0] >> FLAGS_SHIFT) as u8)
    }

    pub fn parity(&self) -> bool {
        self.flags().contains(CommandFlags::PARITY)
    }

    /// Return a copy with the parity flag inverted.
    pub fn toggled_parity(&self) -> Self {
        let mut words = *self;
        words.0[0] ^= (CommandFlags::PARITY.bits() as u64) << FLAGS_SHIFT;
        words
    }

    pub fn to_le_bytes(&self) -> [u8; COMMAND_WORDS_LEN] {
        let mut buf = [0u8; COMMAND_WORDS_LEN];
        LittleEndian::write_u64_into(&self.0, &mut buf);
        buf
    }

    pub fn from_le_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != COMMAND_WORDS_LEN {
            return Err(ProtoError::InvalidLength {
                expected: COMMAND_WORDS_LEN,
                actual: bytes.len(),
            });
        }
        let mut words = [0u64; 2];
        LittleEndian::read_u64_into(bytes, &mut words);
        Ok(Self(words))
    }
}

/// Decoded form of [`CommandWords`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Command {
    pub opcode: Opcode,
    pub flags: CommandFlags,
    pub token_id: u16,
    /// Low 16 bits of the engine sequence number; keeps reused token ids distinct.
    pub seq_tag: u16,
    /// Transfer length in [`UNIT_BYTES`] units.
    pub units: u16,
    /// LBA for data commands, read buffer id for [`Opcode::ReleaseReadBuffer`].
    pub arg: u64,
}

impl Command {
    pub const fn new(opcode: Opcode, token_id: u16, arg: u64) -> Self {
        Self {
            opcode,
            flags: CommandFlags::empty(),
            token_id,
            seq_tag: 0,
            units: 0,
            arg,
        }
    }

    pub fn encode(&self) -> CommandWords {
        let word0 = ((u8::from(self.opcode) as u64) << OPCODE_SHIFT)
            | ((self.flags.bits() as u64) << FLAGS_SHIFT)
            | ((self.token_id as u64) << TOKEN_SHIFT)
            | ((self.seq_tag as u64) << SEQ_SHIFT)
            | ((self.units as u64) << UNITS_SHIFT);
        CommandWords([word0, self.arg])
    }

    pub fn decode(words: CommandWords) -> Result<Self> {
        let opcode = Opcode::try_from(words.opcode_byte())?;
        let flags = CommandFlags::from_bits((words.0[0] >> FLAGS_SHIFT) as u8)
            .ok_or(ProtoError::InvalidValue("flags"))?;
        Ok(Self {
            opcode,
            flags,
            token_id: words.token_id(),
            seq_tag: (words.0[0] >> SEQ_SHIFT) as u16,
            units: (words.0[0] >> UNITS_SHIFT) as u16,
            arg: words.0[1],
        })
    }
}

/// Convert a byte length into transfer units, rounding up.
pub fn units_for_len(bytes: u32) -> Result<u16> {
    let units = bytes.div_ceil(UNIT_BYTES);
    u16::try_from(units).map_err(|_| ProtoError::InvalidValue("transfer length"))
}

/// Fletcher-32 over the little-endian encoding of the command words.
pub fn command_checksum(words: &CommandWords) -> u32 {
    let bytes = words.to_le_bytes();
    let mut sum1: u32 = 0xffff;
    let mut sum2: u32 = 0xffff;
    for chunk in bytes.chunks_exact(2) {
        sum1 = (sum1 + LittleEndian::read_u16(chunk) as u32) % 0xffff;
        sum2 = (sum2 + sum1) % 0xffff;
    }
    (sum2 << 16) | sum1
}

/// Why a marker did not decode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidMarker {
    /// Leading bytes match neither encoding (usually: not written yet).
    UnknownSignature,
    /// The two command copies differ; the marker is torn or corrupt.
    CopyMismatch,
    /// A legacy word is not the id byte replicated across all eight positions.
    LegacyInconsistent,
    /// Legacy encoding found but the caller did not permit it on this attempt.
    LegacyNotAllowed,
}

impl fmt::Display for InvalidMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            InvalidMarker::UnknownSignature => "unknown marker signature",
            InvalidMarker::CopyMismatch => "command copies differ",
            InvalidMarker::LegacyInconsistent => "legacy marker words inconsistent",
            InvalidMarker::LegacyNotAllowed => "legacy marker not permitted",
        };
        f.write_str(text)
    }
}

/// Result of decoding a read buffer marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkerMatch {
    /// Full-command encoding; the words identify the token directly.
    Command(CommandWords),
    /// Legacy encoding; carries the core (transfer) buffer id.
    CoreBuffer(u8),
    Invalid(InvalidMarker),
}

/// Decode a marker region. `allow_legacy` gates the legacy encoding.
pub fn decode_marker(marker: &[u8; MARKER_LEN], allow_legacy: bool) -> MarkerMatch {
    let signature = &marker[0..8];
    if signature == COMMAND_MARKER_SIGNATURE {
        let copy_a = &marker[8..24];
        let copy_b = &marker[24..40];
        if copy_a != copy_b {
            return MarkerMatch::Invalid(InvalidMarker::CopyMismatch);
        }
        let mut words = [0u64; 2];
        LittleEndian::read_u64_into(copy_a, &mut words);
        return MarkerMatch::Command(CommandWords(words));
    }
    if signature == LEGACY_MARKER_SIGNATURE {
        if !allow_legacy {
            return MarkerMatch::Invalid(InvalidMarker::LegacyNotAllowed);
        }
        let mut words = [0u64; MARKER_WORDS];
        LittleEndian::read_u64_into(marker, &mut words);
        let id = marker[8];
        let expected = id as u64 * REPLICATE_BYTE;
        if words[1..].iter().all(|word| *word == expected) {
            return MarkerMatch::CoreBuffer(id);
        }
        return MarkerMatch::Invalid(InvalidMarker::LegacyInconsistent);
    }
    MarkerMatch::Invalid(InvalidMarker::UnknownSignature)
}

/// Build the full-command marker hardware writes after a read transfer.
pub fn encode_command_marker(words: CommandWords) -> [u8; MARKER_LEN] {
    let mut marker = [0u8; MARKER_LEN];
    marker[0..8].copy_from_slice(&COMMAND_MARKER_SIGNATURE);
    let encoded = words.to_le_bytes();
    marker[8..24].copy_from_slice(&encoded);
    marker[24..40].copy_from_slice(&encoded);
    marker
}

/// Build a legacy marker naming the core buffer that carried the data.
pub fn encode_legacy_marker(core_id: u8) -> [u8; MARKER_LEN] {
    let mut marker = [0u8; MARKER_LEN];
    marker[0..8].copy_from_slice(&LEGACY_MARKER_SIGNATURE);
    let words = [core_id as u64 * REPLICATE_BYTE; MARKER_WORDS - 1];
    LittleEndian::write_u64_into(&words, &mut marker[8..]);
    marker
}
