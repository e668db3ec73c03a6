//! Neighbor table records and the communication buffer arenas.

use bytemuck::{Pod, Zeroable};

use crate::error::{HaloError, Result};

/// Upper bound on the number of points in one stencil.
pub const STENCIL_MAX: usize = 16;

/// Where the neighbor of one (point, site) pair lives.
///
/// `offset` indexes the local field when `is_local` is set and the receive
/// halo otherwise; `byte_offset` is the same position in bytes of the
/// corresponding element type.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct StencilEntry {
    pub offset: u64,
    pub byte_offset: u64,
    pub is_local: u8,
    pub permute: u8,
    pub around_the_world: u8,
    _pad: [u8; 5],
}

impl StencilEntry {
    pub(crate) fn local(offset: usize, permute: bool, wrap: bool) -> Self {
        Self {
            offset: offset as u64,
            is_local: 1,
            permute: permute as u8,
            around_the_world: wrap as u8,
            ..Self::default()
        }
    }

    pub(crate) fn halo(offset: usize, wrap: bool) -> Self {
        Self {
            offset: offset as u64,
            is_local: 0,
            permute: 0,
            around_the_world: wrap as u8,
            ..Self::default()
        }
    }

    pub fn is_local(&self) -> bool {
        self.is_local != 0
    }

    pub fn permute(&self) -> bool {
        self.permute != 0
    }

    pub fn around_the_world(&self) -> bool {
        self.around_the_world != 0
    }

    pub fn offset(&self) -> usize {
        self.offset as usize
    }

    pub fn byte_offset(&self) -> usize {
        self.byte_offset as usize
    }
}

/// The six unified buffers of a stencil.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferId {
    Send,
    SimdSend(u8),
    Recv,
    SimdRecv(u8),
}

impl BufferId {
    fn index(self) -> usize {
        match self {
            BufferId::Send => 0,
            BufferId::SimdSend(l) => 1 + (l as usize & 1),
            BufferId::Recv => 3,
            BufferId::SimdRecv(l) => 4 + (l as usize & 1),
        }
    }

    pub fn is_send_side(self) -> bool {
        matches!(self, BufferId::Send | BufferId::SimdSend(_))
    }
}

/// A byte position inside one of the unified buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    pub buf: BufferId,
    pub byte_offset: usize,
}

impl Location {
    pub fn new(buf: BufferId, byte_offset: usize) -> Self {
        Self { buf, byte_offset }
    }
}

/// Zeroed byte arena with 8-byte alignment, viewed as any `Pod` type.
#[derive(Debug, Clone)]
pub struct CommBuffer {
    words: Vec<u64>,
    len: usize,
}

impl CommBuffer {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(8)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.len]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..self.len]
    }

    fn range(&self, byte_offset: usize, bytes: usize) -> Result<std::ops::Range<usize>> {
        let end = byte_offset + bytes;
        if end > self.len {
            return Err(HaloError::Buffer(format!(
                "byte range {}..{} outside a {} byte buffer",
                byte_offset, end, self.len
            )));
        }
        Ok(byte_offset..end)
    }

    pub fn slice(&self, byte_offset: usize, bytes: usize) -> Result<&[u8]> {
        let r = self.range(byte_offset, bytes)?;
        Ok(&self.bytes()[r])
    }

    pub fn slice_mut(&mut self, byte_offset: usize, bytes: usize) -> Result<&mut [u8]> {
        let r = self.range(byte_offset, bytes)?;
        Ok(&mut self.bytes_mut()[r])
    }

    /// `len` elements of `T` starting at `byte_offset`.
    pub fn typed<T: Pod>(&self, byte_offset: usize, len: usize) -> Result<&[T]> {
        let raw = self.slice(byte_offset, len * std::mem::size_of::<T>())?;
        bytemuck::try_cast_slice(raw).map_err(|e| HaloError::Buffer(e.to_string()))
    }

    pub fn typed_mut<T: Pod>(&mut self, byte_offset: usize, len: usize) -> Result<&mut [T]> {
        let raw = self.slice_mut(byte_offset, len * std::mem::size_of::<T>())?;
        bytemuck::try_cast_slice_mut(raw).map_err(|e| HaloError::Buffer(e.to_string()))
    }
}

/// Send, receive and per-lane SIMD staging buffers, each `capacity` bytes.
#[derive(Debug, Clone)]
pub struct UnifiedBuffers {
    bufs: [CommBuffer; 6],
}

impl UnifiedBuffers {
    pub fn new(capacity: usize) -> Self {
        Self {
            bufs: std::array::from_fn(|_| CommBuffer::new(capacity)),
        }
    }

    pub fn get(&self, id: BufferId) -> &CommBuffer {
        &self.bufs[id.index()]
    }

    pub fn get_mut(&mut self, id: BufferId) -> &mut CommBuffer {
        &mut self.bufs[id.index()]
    }

    /// Both SIMD send lanes at once.
    pub fn simd_send_mut(&mut self) -> (&mut CommBuffer, &mut CommBuffer) {
        let (lo, hi) = self.bufs[1..3].split_at_mut(1);
        (&mut lo[0], &mut hi[0])
    }

    /// Mutable access to `dest` alongside shared access to every other buffer.
    pub fn split_mut(&mut self, dest: BufferId) -> (&mut CommBuffer, OtherBuffers<'_>) {
        let idx = dest.index();
        let (before, rest) = self.bufs.split_at_mut(idx);
        let (target, after) = rest.split_at_mut(1);
        (
            &mut target[0],
            OtherBuffers {
                before,
                after,
                skip: idx,
            },
        )
    }

    /// Send-side buffers shared, receive-side buffers mutable.
    pub fn split_sides(&mut self) -> (&[CommBuffer], &mut [CommBuffer]) {
        let (send, recv) = self.bufs.split_at_mut(3);
        (send, recv)
    }
}

/// Every buffer except the one handed out mutably by `split_mut`.
pub struct OtherBuffers<'a> {
    before: &'a [CommBuffer],
    after: &'a [CommBuffer],
    skip: usize,
}

impl OtherBuffers<'_> {
    pub fn get(&self, id: BufferId) -> Result<&CommBuffer> {
        let idx = id.index();
        match idx.cmp(&self.skip) {
            std::cmp::Ordering::Less => Ok(&self.before[idx]),
            std::cmp::Ordering::Greater => Ok(&self.after[idx - self.skip - 1]),
            std::cmp::Ordering::Equal => Err(HaloError::Buffer(format!(
                "{:?} is both source and destination",
                id
            ))),
        }
    }
}

/// Index of a send-side or receive-side buffer within its half of `split_sides`.
pub(crate) fn side_index(id: BufferId) -> usize {
    id.index() % 3
}
