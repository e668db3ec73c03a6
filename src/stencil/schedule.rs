//! Packet bookkeeping and the communication phase.

use bytemuck::Pod;
use rayon::prelude::*;

use super::entry::{side_index, CommBuffer, Location};
use super::merge::{Decompress, Merge};
use super::CartesianStencil;
use crate::comm::SendRecv;
use crate::config::CommPolicy;
use crate::error::{HaloError, Result};

/// One paired transfer of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub send: Location,
    pub recv: Location,
    pub to_rank: usize,
    pub do_send: bool,
    pub from_rank: usize,
    pub do_recv: bool,
    pub bytes: usize,
}

/// Same-process copy standing in for a duplicate transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyReceiveBuffer {
    pub from: Location,
    pub to: Location,
    pub bytes: usize,
}

/// Identity of a transfer; two equal keys always carry the same payload.
///
/// On SIMD-split axes the payload also depends on which send half the
/// plane was split into, so `half` is part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TransferKey {
    pub direction: usize,
    pub orthog_plane: usize,
    pub dest_proc: usize,
    pub bytes: usize,
    pub lane: usize,
    pub half: usize,
    pub cb: u8,
}

#[derive(Debug, Clone, Copy)]
struct CachedTransfer {
    key: TransferKey,
    recv: Location,
}

/// Everything one exchange schedules after gathering.
#[derive(Debug, Default)]
pub(crate) struct ExchangePlan {
    pub packets: Vec<Packet>,
    pub copies: Vec<CopyReceiveBuffer>,
    cached: Vec<CachedTransfer>,
    pub mergers: Vec<Merge>,
    pub mergers_shm: Vec<Merge>,
    pub decompressions: Vec<Decompress>,
}

impl ExchangePlan {
    pub fn clear(&mut self) {
        self.packets.clear();
        self.copies.clear();
        self.cached.clear();
        self.mergers.clear();
        self.mergers_shm.clear();
        self.decompressions.clear();
    }

    /// Record a transfer; if an identical one is already scheduled, queue a
    /// copy from its receive location instead and return true.
    pub fn check_for_duplicate(&mut self, key: TransferKey, recv: Location) -> bool {
        if let Some(hit) = self.cached.iter().find(|c| c.key == key) {
            tracing::trace!(
                direction = key.direction,
                plane = key.orthog_plane,
                lane = key.lane,
                "duplicate transfer folded into a buffer copy"
            );
            self.copies.push(CopyReceiveBuffer {
                from: hit.recv,
                to: recv,
                bytes: key.bytes,
            });
            return true;
        }
        self.cached.push(CachedTransfer { key, recv });
        false
    }

    pub fn add_packet(&mut self, packet: Packet) {
        self.packets.push(packet);
    }

    /// Merges with no network leg run in the shared-memory family.
    pub fn add_merge(&mut self, merge: Merge) {
        if merge.halves.iter().all(|h| h.buf.is_send_side()) {
            self.mergers_shm.push(merge);
        } else {
            self.mergers.push(merge);
        }
    }
}

impl<V, H> CartesianStencil<V, H>
where
    V: Pod + Send + Sync,
    H: Pod + Send + Sync,
{
    /// Drive every packet of this exchange through the transport.
    pub fn communicate(&mut self) -> Result<()> {
        if self.plan.packets.is_empty() {
            return Ok(());
        }
        match self.params.policy {
            CommPolicy::Concurrent => self.communicate_concurrent(),
            CommPolicy::Sequential => self.communicate_sequential(),
        }
    }

    fn communicate_concurrent(&mut self) -> Result<()> {
        let transport = self.transport.as_ref();
        let packets = &self.plan.packets;
        let (send_side, recv_side) = self.buffers.split_sides();

        let batch = disjoint_recv_slices(recv_side, packets)?
            .into_iter()
            .map(|(tag, recv)| Ok((send_recv(send_side, &packets[tag], tag)?, recv)))
            .collect::<Result<Vec<_>>>()?;
        transport.send_to_recv_from_batch(batch)
    }

    fn communicate_sequential(&mut self) -> Result<()> {
        let transport = self.transport.as_ref();
        let packets = &self.plan.packets;
        let pool = self
            .comm_pool
            .as_ref()
            .ok_or_else(|| HaloError::Transport("sequential policy without a comm pool".into()))?;
        let (send_side, recv_side) = self.buffers.split_sides();

        let jobs = disjoint_recv_slices(recv_side, packets)?;
        pool.install(|| {
            jobs.into_par_iter().try_for_each(|(tag, recv)| {
                let xfer = send_recv(send_side, &packets[tag], tag)?;
                transport.send_to_recv_from(xfer, recv).map(|_| ())
            })
        })
    }

    /// Fill duplicate receive locations from the transfer they shadow.
    pub(crate) fn comms_copy(&mut self) -> Result<()> {
        for c in &self.plan.copies {
            if c.from.buf == c.to.buf {
                let buf = self.buffers.get_mut(c.to.buf);
                copy_within_buffer(buf, c.from.byte_offset, c.to.byte_offset, c.bytes)?;
            } else {
                let (dest, others) = self.buffers.split_mut(c.to.buf);
                let src = others.get(c.from.buf)?.slice(c.from.byte_offset, c.bytes)?;
                let dst = dest.slice_mut(c.to.byte_offset, c.bytes)?;
                dst.par_chunks_mut(COPY_CHUNK)
                    .zip(src.par_chunks(COPY_CHUNK))
                    .for_each(|(d, s)| d.copy_from_slice(s));
            }
        }
        Ok(())
    }
}

const COPY_CHUNK: usize = 4096;

fn send_recv<'a>(send_side: &'a [CommBuffer], p: &Packet, tag: usize) -> Result<SendRecv<'a>> {
    let send: &[u8] = if p.do_send {
        send_side[side_index(p.send.buf)].slice(p.send.byte_offset, p.bytes)?
    } else {
        &[]
    };
    Ok(SendRecv {
        send,
        to_rank: p.to_rank,
        do_send: p.do_send,
        from_rank: p.from_rank,
        do_recv: p.do_recv,
        bytes: p.bytes,
        tag,
    })
}

fn copy_within_buffer(buf: &mut CommBuffer, from: usize, to: usize, bytes: usize) -> Result<()> {
    // bounds check both ranges before touching the buffer
    buf.slice(from, bytes)?;
    buf.slice(to, bytes)?;
    let raw = buf.bytes_mut();
    if from + bytes <= to {
        let (lo, hi) = raw.split_at_mut(to);
        copy_par(&mut hi[..bytes], &lo[from..from + bytes]);
    } else if to + bytes <= from {
        let (lo, hi) = raw.split_at_mut(from);
        copy_par(&mut lo[to..to + bytes], &hi[..bytes]);
    } else {
        raw.copy_within(from..from + bytes, to);
    }
    Ok(())
}

fn copy_par(dst: &mut [u8], src: &[u8]) {
    dst.par_chunks_mut(COPY_CHUNK)
        .zip(src.par_chunks(COPY_CHUNK))
        .for_each(|(d, s)| d.copy_from_slice(s));
}

/// Carve one receive slice per packet out of the receive-side buffers.
///
/// Packets that do not receive get an empty slice. Overlapping receive
/// ranges are an error since the slices are handed to parallel workers.
fn disjoint_recv_slices<'a>(
    recv_side: &'a mut [CommBuffer],
    packets: &[Packet],
) -> Result<Vec<(usize, &'a mut [u8])>> {
    let mut jobs: Vec<(usize, &'a mut [u8])> = Vec::with_capacity(packets.len());
    for (side, buf) in recv_side.iter_mut().enumerate() {
        let mut wanted: Vec<(usize, usize, usize)> = packets
            .iter()
            .enumerate()
            .filter(|(_, p)| p.do_recv && side_index(p.recv.buf) == side && !p.recv.buf.is_send_side())
            .map(|(tag, p)| (tag, p.recv.byte_offset, p.bytes))
            .collect();
        wanted.sort_by_key(|&(_, off, _)| off);

        let len = buf.len();
        let mut rest: &'a mut [u8] = buf.bytes_mut();
        let mut base = 0;
        for (tag, off, bytes) in wanted {
            if off < base || off + bytes > len {
                return Err(HaloError::Buffer(format!(
                    "receive range {}..{} of packet {} overlaps or overruns its buffer",
                    off,
                    off + bytes,
                    tag
                )));
            }
            let (_, tail) = std::mem::take(&mut rest).split_at_mut(off - base);
            let (mine, tail) = tail.split_at_mut(bytes);
            jobs.push((tag, mine));
            rest = tail;
            base = off + bytes;
        }
    }
    for (tag, p) in packets.iter().enumerate() {
        if !p.do_recv {
            let empty: &'a mut [u8] = &mut [];
            jobs.push((tag, empty));
        }
    }
    if jobs.len() != packets.len() {
        return Err(HaloError::Buffer(
            "a packet receives into a send-side buffer".into(),
        ));
    }
    jobs.sort_by_key(|&(tag, _)| tag);
    Ok(jobs)
}
