//! Self-describing sample buffer views.
//!
//! Every allocated buffer begins with a small binary descriptor naming its
//! channel layout, immediately followed by interleaved sample frames:
//!
//! ```text
//! [u32 num_channels][u32 channel_type]*num_channels [frames...]
//! ```
//!
//! All integers are little-endian. Any consumer reinterpreting a
//! [`BufferView`] must reproduce this layout exactly.

use crate::error::{Error, Result};
use crate::memory::Block;

/// Per-channel sample type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelType {
    /// Unsigned 8-bit samples.
    U8 = 0,
    /// Signed 16-bit samples.
    I16 = 1,
    /// Signed 32-bit samples.
    I32 = 2,
    /// 32-bit float samples.
    F32 = 3,
    /// 64-bit float samples.
    F64 = 4,
}

impl ChannelType {
    /// Size of one sample of this type in bytes.
    #[inline]
    pub fn sample_bytes(&self) -> usize {
        match self {
            ChannelType::U8 => 1,
            ChannelType::I16 => 2,
            ChannelType::I32 => 4,
            ChannelType::F32 => 4,
            ChannelType::F64 => 8,
        }
    }

    fn from_wire(tag: u32) -> Result<Self> {
        match tag {
            0 => Ok(ChannelType::U8),
            1 => Ok(ChannelType::I16),
            2 => Ok(ChannelType::I32),
            3 => Ok(ChannelType::F32),
            4 => Ok(ChannelType::F64),
            other => Err(Error::InvalidDescriptor(format!(
                "unknown channel type tag {other}"
            ))),
        }
    }
}

/// Bytes occupied on the wire by one channel type tag.
const TAG_BYTES: usize = 4;

/// Size in bytes of the descriptor for the given channel layout.
#[inline]
pub fn descriptor_size(channels: &[ChannelType]) -> usize {
    4 + channels.len() * TAG_BYTES
}

/// Bytes per interleaved frame for the given channel layout.
#[inline]
pub fn frame_stride(channels: &[ChannelType]) -> usize {
    channels.iter().map(|c| c.sample_bytes()).sum()
}

/// Encode a channel layout into the head of `bytes`.
///
/// # Panics
///
/// Panics if `bytes` is shorter than [`descriptor_size`].
pub fn write_descriptor(bytes: &mut [u8], channels: &[ChannelType]) {
    let needed = descriptor_size(channels);
    assert!(
        bytes.len() >= needed,
        "descriptor needs {} bytes, buffer has {}",
        needed,
        bytes.len()
    );
    bytes[..4].copy_from_slice(&(channels.len() as u32).to_le_bytes());
    for (i, channel) in channels.iter().enumerate() {
        let at = 4 + i * TAG_BYTES;
        bytes[at..at + TAG_BYTES].copy_from_slice(&(*channel as u32).to_le_bytes());
    }
}

/// A decoded buffer descriptor plus the frame math derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Channel layout, in interleaving order.
    pub channels: Vec<ChannelType>,
}

impl Descriptor {
    /// Byte offset of the first sample frame.
    #[inline]
    pub fn payload_offset(&self) -> usize {
        descriptor_size(&self.channels)
    }

    /// Bytes per interleaved frame.
    #[inline]
    pub fn frame_stride(&self) -> usize {
        frame_stride(&self.channels)
    }

    /// Number of whole frames in a buffer of `len` bytes.
    #[inline]
    pub fn num_frames(&self, len: usize) -> usize {
        let stride = self.frame_stride();
        if stride == 0 {
            return 0;
        }
        len.saturating_sub(self.payload_offset()) / stride
    }
}

/// Decode the descriptor at the head of `bytes`.
///
/// Length-checked: truncated headers and unknown tags are rejected rather
/// than read past.
pub fn read_descriptor(bytes: &[u8]) -> Result<Descriptor> {
    if bytes.len() < 4 {
        return Err(Error::InvalidDescriptor(format!(
            "buffer of {} bytes is too short for a channel count",
            bytes.len()
        )));
    }
    let num_channels = u32::from_le_bytes(bytes[..4].try_into().expect("fixed-width field")) as usize;
    let needed = 4 + num_channels * TAG_BYTES;
    if bytes.len() < needed {
        return Err(Error::InvalidDescriptor(format!(
            "descriptor of {num_channels} channels needs {needed} bytes, buffer has {}",
            bytes.len()
        )));
    }
    let mut channels = Vec::with_capacity(num_channels);
    for i in 0..num_channels {
        let at = 4 + i * TAG_BYTES;
        let tag = u32::from_le_bytes(bytes[at..at + TAG_BYTES].try_into().expect("fixed-width field"));
        channels.push(ChannelType::from_wire(tag)?);
    }
    Ok(Descriptor { channels })
}

/// A logical sample buffer: an allocator block plus its used byte length.
///
/// The length covers the descriptor and the sample payload; the backing
/// block's span may be larger (rounded up to the block's buddy level).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferView {
    /// Handle to the backing allocation.
    pub block: Block,
    /// Used bytes, descriptor included.
    pub len: usize,
}

impl BufferView {
    /// Sentinel for "no buffer"; freeing it is a no-op.
    pub const EMPTY: BufferView = BufferView {
        block: Block::EMPTY,
        len: 0,
    };

    /// Whether this is the empty sentinel.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.block.is_empty()
    }
}
