//! On-disk formats for the journal log region.
//!
//! Everything in the log is big-endian. Each log block that the journal
//! itself owns (superblock, descriptor, commit, revoke) starts with a
//! 12-byte header and ends with a CRC32C trailer in the last 4 bytes of the
//! block; the bytes in between are format-specific.
//!
//! ```text
//! Header (12 bytes):
//! +-----------+---------+
//! | magic     | 4 bytes | = 0x4A6F7431 ("Jot1")
//! | block_type| 4 bytes | descriptor / commit / revoke / superblock
//! | sequence  | 4 bytes | transaction id
//! +-----------+---------+
//!
//! Superblock (log block 0):
//! header, then:
//! +------------------+----------+
//! | block_size       | 4 bytes  |
//! | first_log_block  | 4 bytes  | start of the circular data area (>= 1)
//! | sequence         | 4 bytes  | oldest unreplayed transaction id
//! | start            | 4 bytes  | in-use region start; 0 = clean
//! | feature_compat   | 4 bytes  |
//! | feature_ro_compat| 4 bytes  |
//! | feature_incompat | 4 bytes  |
//! | uuid             | 16 bytes |
//! | user_count       | 4 bytes  |
//! | errno            | 4 bytes  | sticky abort errno; 0 = no error
//! +------------------+----------+
//!
//! Descriptor block: header, then tags. Each tag is
//! { blocknr: u32, flags: u32 }; the first tag is followed by the 16-byte
//! journal UUID. Flags: ESCAPE (content collided with the magic and was
//! logged with its first 4 bytes zeroed), SAME_UUID, LAST_TAG.
//!
//! Commit block: header only.
//!
//! Revoke block: header, then { count: u32, blocknr: u32 × count }.
//! ```
//!
//! Metadata blocks written between a descriptor and its commit record carry
//! raw (possibly escaped) filesystem content and no header.

use jot_types::{ParseError, TxId};

/// Magic number identifying journal-owned blocks ("Jot1").
pub const JOT_MAGIC: u32 = 0x4A6F_7431;

/// Size of the common block header.
pub const HEADER_SIZE: usize = 12;

/// Size of the CRC32C trailer at the end of every journal-owned block.
pub const TRAILER_SIZE: usize = 4;

/// Size of one descriptor tag.
pub const TAG_SIZE: usize = 8;

/// Size of the journal UUID embedded after the first tag.
pub const UUID_SIZE: usize = 16;

/// Tag flag: block content collided with [`JOT_MAGIC`] and was escaped.
pub const TAG_FLAG_ESCAPE: u32 = 0x1;
/// Tag flag: UUID omitted, same as the previous tag's.
pub const TAG_FLAG_SAME_UUID: u32 = 0x2;
/// Tag flag: last tag in this descriptor block.
pub const TAG_FLAG_LAST: u32 = 0x8;

/// Journal-owned block types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockType {
    Descriptor = 1,
    Commit = 2,
    SuperblockV1 = 3,
    SuperblockV2 = 4,
    Revoke = 5,
}

impl BlockType {
    fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Descriptor),
            2 => Some(Self::Commit),
            3 => Some(Self::SuperblockV1),
            4 => Some(Self::SuperblockV2),
            5 => Some(Self::Revoke),
            _ => None,
        }
    }
}

/// Decoded common block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub block_type: BlockType,
    pub sequence: TxId,
}

/// Decoded journal superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub block_size: u32,
    pub first: u32,
    pub sequence: TxId,
    pub start: u32,
    pub feature_compat: u32,
    pub feature_ro_compat: u32,
    pub feature_incompat: u32,
    pub uuid: [u8; 16],
    pub user_count: u32,
    pub errno: i32,
}

/// One descriptor tag: a logged block's home location plus flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub blocknr: u32,
    pub escaped: bool,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_be_u32(bytes: &[u8], offset: usize) -> Result<u32, ParseError> {
    let end = offset
        .checked_add(4)
        .ok_or(ParseError::IntegerConversion { field: "offset" })?;
    if end > bytes.len() {
        return Err(ParseError::InsufficientData {
            need: 4,
            offset,
            got: bytes.len().saturating_sub(offset),
        });
    }
    let arr: [u8; 4] = bytes[offset..end]
        .try_into()
        .map_err(|_| ParseError::IntegerConversion { field: "u32" })?;
    Ok(u32::from_be_bytes(arr))
}

fn write_be_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// Compute and store the CRC32C trailer over `block[..len-4]`.
fn seal(block: &mut [u8]) {
    let crc_offset = block.len() - TRAILER_SIZE;
    let crc = crc32c::crc32c(&block[..crc_offset]);
    write_be_u32(block, crc_offset, crc);
}

/// Verify the CRC32C trailer. Returns `false` on mismatch.
#[must_use]
pub fn verify_trailer(block: &[u8]) -> bool {
    if block.len() < HEADER_SIZE + TRAILER_SIZE {
        return false;
    }
    let crc_offset = block.len() - TRAILER_SIZE;
    let Ok(stored) = read_be_u32(block, crc_offset) else {
        return false;
    };
    crc32c::crc32c(&block[..crc_offset]) == stored
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

fn write_header(block: &mut [u8], block_type: BlockType, sequence: TxId) {
    write_be_u32(block, 0, JOT_MAGIC);
    write_be_u32(block, 4, block_type as u32);
    write_be_u32(block, 8, sequence.0);
}

/// Decode the 12-byte header at the start of a journal-owned block.
pub fn decode_header(block: &[u8]) -> Result<BlockHeader, ParseError> {
    let magic = read_be_u32(block, 0)?;
    if magic != JOT_MAGIC {
        return Err(ParseError::InvalidMagic {
            expected: JOT_MAGIC,
            got: magic,
        });
    }
    let raw_type = read_be_u32(block, 4)?;
    let block_type = BlockType::from_u32(raw_type).ok_or(ParseError::InvalidField {
        field: "block_type",
        reason: "unknown journal block type",
    })?;
    let sequence = TxId(read_be_u32(block, 8)?);
    Ok(BlockHeader {
        block_type,
        sequence,
    })
}

/// Whether a block's content collides with the journal magic and must be
/// escaped before being logged.
#[must_use]
pub fn needs_escape(content: &[u8]) -> bool {
    content.len() >= 4 && content[..4] == JOT_MAGIC.to_be_bytes()
}

// ---------------------------------------------------------------------------
// Superblock
// ---------------------------------------------------------------------------

/// Encode a superblock into a zeroed block of `block_len` bytes.
#[must_use]
pub fn encode_superblock(sb: &Superblock, block_len: usize) -> Vec<u8> {
    let mut block = vec![0_u8; block_len];
    write_header(&mut block, BlockType::SuperblockV2, TxId(0));
    write_be_u32(&mut block, 12, sb.block_size);
    write_be_u32(&mut block, 16, sb.first);
    write_be_u32(&mut block, 20, sb.sequence.0);
    write_be_u32(&mut block, 24, sb.start);
    write_be_u32(&mut block, 28, sb.feature_compat);
    write_be_u32(&mut block, 32, sb.feature_ro_compat);
    write_be_u32(&mut block, 36, sb.feature_incompat);
    block[40..56].copy_from_slice(&sb.uuid);
    write_be_u32(&mut block, 56, sb.user_count);
    write_be_u32(&mut block, 60, sb.errno as u32);
    seal(&mut block);
    block
}

/// Decode and validate a superblock. The CRC trailer is checked only when
/// non-zero, so superblocks written by tools that predate the trailer still
/// load.
pub fn decode_superblock(block: &[u8]) -> Result<Superblock, ParseError> {
    let header = decode_header(block)?;
    match header.block_type {
        BlockType::SuperblockV1 | BlockType::SuperblockV2 => {}
        _ => {
            return Err(ParseError::InvalidField {
                field: "block_type",
                reason: "not a journal superblock",
            });
        }
    }
    if block.len() < 64 + TRAILER_SIZE {
        return Err(ParseError::InsufficientData {
            need: 64 + TRAILER_SIZE,
            offset: 0,
            got: block.len(),
        });
    }
    let stored_crc = read_be_u32(block, block.len() - TRAILER_SIZE)?;
    if stored_crc != 0 && !verify_trailer(block) {
        return Err(ParseError::InvalidField {
            field: "checksum",
            reason: "superblock CRC mismatch",
        });
    }

    let mut uuid = [0_u8; 16];
    uuid.copy_from_slice(&block[40..56]);
    Ok(Superblock {
        block_size: read_be_u32(block, 12)?,
        first: read_be_u32(block, 16)?,
        sequence: TxId(read_be_u32(block, 20)?),
        start: read_be_u32(block, 24)?,
        feature_compat: read_be_u32(block, 28)?,
        feature_ro_compat: read_be_u32(block, 32)?,
        feature_incompat: read_be_u32(block, 36)?,
        uuid,
        user_count: read_be_u32(block, 56)?,
        errno: read_be_u32(block, 60)? as i32,
    })
}

// ---------------------------------------------------------------------------
// Descriptor blocks
// ---------------------------------------------------------------------------

/// How many tags fit in one descriptor block.
///
/// The first tag is followed by the 16-byte UUID; the CRC trailer takes the
/// last 4 bytes.
#[must_use]
pub fn tags_per_block(block_len: usize) -> usize {
    (block_len - HEADER_SIZE - TRAILER_SIZE - UUID_SIZE) / TAG_SIZE
}

/// Encode a descriptor block for `tags` (at most [`tags_per_block`]).
///
/// The last tag gets `LAST_TAG`; every tag after the first gets `SAME_UUID`.
#[must_use]
pub fn encode_descriptor(sequence: TxId, tags: &[Tag], uuid: &[u8; 16], block_len: usize) -> Vec<u8> {
    debug_assert!(!tags.is_empty());
    debug_assert!(tags.len() <= tags_per_block(block_len));

    let mut block = vec![0_u8; block_len];
    write_header(&mut block, BlockType::Descriptor, sequence);

    let mut offset = HEADER_SIZE;
    for (i, tag) in tags.iter().enumerate() {
        let mut flags = 0_u32;
        if tag.escaped {
            flags |= TAG_FLAG_ESCAPE;
        }
        if i > 0 {
            flags |= TAG_FLAG_SAME_UUID;
        }
        if i + 1 == tags.len() {
            flags |= TAG_FLAG_LAST;
        }
        write_be_u32(&mut block, offset, tag.blocknr);
        write_be_u32(&mut block, offset + 4, flags);
        offset += TAG_SIZE;
        if i == 0 {
            block[offset..offset + UUID_SIZE].copy_from_slice(uuid);
            offset += UUID_SIZE;
        }
    }
    seal(&mut block);
    block
}

/// Decode the tags of a descriptor block (for recovery-side consumers and
/// tests).
pub fn decode_descriptor(block: &[u8]) -> Result<(TxId, Vec<Tag>), ParseError> {
    let header = decode_header(block)?;
    if header.block_type != BlockType::Descriptor {
        return Err(ParseError::InvalidField {
            field: "block_type",
            reason: "not a descriptor block",
        });
    }
    if !verify_trailer(block) {
        return Err(ParseError::InvalidField {
            field: "checksum",
            reason: "descriptor CRC mismatch",
        });
    }

    let mut tags = Vec::new();
    let mut offset = HEADER_SIZE;
    let limit = block.len() - TRAILER_SIZE;
    loop {
        if offset + TAG_SIZE > limit {
            return Err(ParseError::InvalidField {
                field: "tags",
                reason: "descriptor ran out of space before LAST_TAG",
            });
        }
        let blocknr = read_be_u32(block, offset)?;
        let flags = read_be_u32(block, offset + 4)?;
        offset += TAG_SIZE;
        if flags & TAG_FLAG_SAME_UUID == 0 {
            offset += UUID_SIZE;
        }
        tags.push(Tag {
            blocknr,
            escaped: flags & TAG_FLAG_ESCAPE != 0,
        });
        if flags & TAG_FLAG_LAST != 0 {
            return Ok((header.sequence, tags));
        }
    }
}

// ---------------------------------------------------------------------------
// Commit and revoke blocks
// ---------------------------------------------------------------------------

/// Encode the commit record for `sequence`.
#[must_use]
pub fn encode_commit_block(sequence: TxId, block_len: usize) -> Vec<u8> {
    let mut block = vec![0_u8; block_len];
    write_header(&mut block, BlockType::Commit, sequence);
    seal(&mut block);
    block
}

/// How many revoked block numbers fit in one revoke block.
#[must_use]
pub fn revokes_per_block(block_len: usize) -> usize {
    (block_len - HEADER_SIZE - 4 - TRAILER_SIZE) / 4
}

/// Encode one revoke block for up to [`revokes_per_block`] block numbers.
#[must_use]
pub fn encode_revoke_block(sequence: TxId, blocks: &[u32], block_len: usize) -> Vec<u8> {
    debug_assert!(blocks.len() <= revokes_per_block(block_len));
    let mut block = vec![0_u8; block_len];
    write_header(&mut block, BlockType::Revoke, sequence);
    write_be_u32(&mut block, HEADER_SIZE, blocks.len() as u32);
    let mut offset = HEADER_SIZE + 4;
    for &blocknr in blocks {
        write_be_u32(&mut block, offset, blocknr);
        offset += 4;
    }
    seal(&mut block);
    block
}

/// Decode the revoked block numbers from a revoke block.
pub fn decode_revoke_block(block: &[u8]) -> Result<(TxId, Vec<u32>), ParseError> {
    let header = decode_header(block)?;
    if header.block_type != BlockType::Revoke {
        return Err(ParseError::InvalidField {
            field: "block_type",
            reason: "not a revoke block",
        });
    }
    if !verify_trailer(block) {
        return Err(ParseError::InvalidField {
            field: "checksum",
            reason: "revoke block CRC mismatch",
        });
    }
    let count = read_be_u32(block, HEADER_SIZE)? as usize;
    if count > revokes_per_block(block.len()) {
        return Err(ParseError::InvalidField {
            field: "count",
            reason: "revoke count exceeds block capacity",
        });
    }
    let mut blocks = Vec::with_capacity(count);
    let mut offset = HEADER_SIZE + 4;
    for _ in 0..count {
        blocks.push(read_be_u32(block, offset)?);
        offset += 4;
    }
    Ok((header.sequence, blocks))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BS: usize = 1024;

    fn sample_superblock() -> Superblock {
        Superblock {
            block_size: BS as u32,
            first: 1,
            sequence: TxId(7),
            start: 0,
            feature_compat: 0,
            feature_ro_compat: 0,
            feature_incompat: 0,
            uuid: [0xAB; 16],
            user_count: 1,
            errno: 0,
        }
    }

    #[test]
    fn superblock_round_trip() {
        let sb = sample_superblock();
        let encoded = encode_superblock(&sb, BS);
        let decoded = decode_superblock(&encoded).expect("decode");
        assert_eq!(decoded, sb);
    }

    #[test]
    fn superblock_preserves_negative_errno() {
        let mut sb = sample_superblock();
        sb.errno = -5;
        let encoded = encode_superblock(&sb, BS);
        let decoded = decode_superblock(&encoded).expect("decode");
        assert_eq!(decoded.errno, -5);
    }

    #[test]
    fn superblock_rejects_bad_magic() {
        let mut encoded = encode_superblock(&sample_superblock(), BS);
        encoded[0] ^= 0xFF;
        assert!(matches!(
            decode_superblock(&encoded),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn superblock_rejects_crc_corruption() {
        let mut encoded = encode_superblock(&sample_superblock(), BS);
        encoded[42] ^= 0xFF; // inside the uuid
        assert!(decode_superblock(&encoded).is_err());
    }

    #[test]
    fn header_rejects_unknown_block_type() {
        let mut block = vec![0_u8; BS];
        write_header(&mut block, BlockType::Commit, TxId(1));
        write_be_u32(&mut block, 4, 99);
        assert!(matches!(
            decode_header(&block),
            Err(ParseError::InvalidField { field: "block_type", .. })
        ));
    }

    #[test]
    fn descriptor_round_trip() {
        let tags = vec![
            Tag {
                blocknr: 100,
                escaped: false,
            },
            Tag {
                blocknr: 200,
                escaped: true,
            },
            Tag {
                blocknr: 300,
                escaped: false,
            },
        ];
        let encoded = encode_descriptor(TxId(9), &tags, &[0x11; 16], BS);
        let (tid, decoded) = decode_descriptor(&encoded).expect("decode");
        assert_eq!(tid, TxId(9));
        assert_eq!(decoded, tags);
    }

    #[test]
    fn descriptor_capacity_accounts_for_uuid_and_trailer() {
        let capacity = tags_per_block(BS);
        assert_eq!(capacity, (BS - 12 - 4 - 16) / 8);

        let tags: Vec<Tag> = (0..capacity as u32)
            .map(|i| Tag {
                blocknr: i,
                escaped: false,
            })
            .collect();
        let encoded = encode_descriptor(TxId(1), &tags, &[0; 16], BS);
        let (_, decoded) = decode_descriptor(&encoded).expect("decode full block");
        assert_eq!(decoded.len(), capacity);
    }

    #[test]
    fn descriptor_detects_corruption() {
        let tags = vec![Tag {
            blocknr: 5,
            escaped: false,
        }];
        let mut encoded = encode_descriptor(TxId(2), &tags, &[0; 16], BS);
        encoded[HEADER_SIZE] ^= 0xFF;
        assert!(decode_descriptor(&encoded).is_err());
    }

    #[test]
    fn commit_block_carries_sequence() {
        let encoded = encode_commit_block(TxId(41), BS);
        let header = decode_header(&encoded).expect("header");
        assert_eq!(header.block_type, BlockType::Commit);
        assert_eq!(header.sequence, TxId(41));
        assert!(verify_trailer(&encoded));
    }

    #[test]
    fn revoke_round_trip() {
        let blocks = vec![3, 1, 4, 1, 5, 9];
        let encoded = encode_revoke_block(TxId(6), &blocks, BS);
        let (tid, decoded) = decode_revoke_block(&encoded).expect("decode");
        assert_eq!(tid, TxId(6));
        assert_eq!(decoded, blocks);
    }

    #[test]
    fn revoke_rejects_overlong_count() {
        let mut encoded = encode_revoke_block(TxId(6), &[1, 2], BS);
        write_be_u32(&mut encoded, HEADER_SIZE, u32::MAX);
        seal(&mut encoded);
        assert!(decode_revoke_block(&encoded).is_err());
    }

    #[test]
    fn escape_detection() {
        let mut content = vec![0_u8; BS];
        assert!(!needs_escape(&content));
        content[..4].copy_from_slice(&JOT_MAGIC.to_be_bytes());
        assert!(needs_escape(&content));
    }
}
