//! Point-to-point transport used by the halo exchange.
//!
//! Provides the `Transport` trait the stencil drives (paired send/receive,
//! either blocking or begun and completed as a batch), a no-op single-process
//! implementation, an in-process multi-rank implementation and, behind the
//! `distributed` feature, an MPI implementation.

pub mod local;
#[cfg(feature = "distributed")]
pub mod mpi;

pub use local::LocalTransport;
#[cfg(feature = "distributed")]
pub use self::mpi::MpiTransport;

use crate::error::{HaloError, Result};

/// One paired transfer: `send` goes to `to_rank`, `bytes` come back from `from_rank`.
///
/// Either leg may be disabled independently, e.g. at a Dirichlet block boundary.
#[derive(Debug, Clone, Copy)]
pub struct SendRecv<'a> {
    pub send: &'a [u8],
    pub to_rank: usize,
    pub do_send: bool,
    pub from_rank: usize,
    pub do_recv: bool,
    pub bytes: usize,
    pub tag: usize,
}

/// Handle for a begun transfer, finished by `send_to_recv_from_complete`.
#[derive(Debug)]
pub struct CommsRequest {
    pub from_rank: usize,
    pub tag: usize,
    pub bytes: usize,
    pub do_recv: bool,
    /// Payload already received when the transport resolves at begin time.
    pub staged: Option<Vec<u8>>,
}

/// Abstraction over inter-process communication for the halo exchange.
///
/// Implementations: `SingleProcess` (no peers), `LocalTransport` (ranks on
/// threads of one process), `MpiTransport` (via the mpi crate).
pub trait Transport: Send + Sync {
    fn rank(&self) -> usize;

    fn num_ranks(&self) -> usize;

    /// Synchronization barrier over all ranks.
    fn barrier(&self) -> Result<()>;

    /// Barrier among ranks sharing memory. Defaults to a full barrier.
    fn stencil_barrier(&self) -> Result<()> {
        self.barrier()
    }

    /// Blocking paired transfer. Returns the number of bytes received.
    fn send_to_recv_from(&self, xfer: SendRecv<'_>, recv: &mut [u8]) -> Result<usize>;

    /// Post a paired transfer without waiting for the receive.
    fn send_to_recv_from_begin(&self, xfer: SendRecv<'_>) -> Result<CommsRequest>;

    /// Wait for a begun transfer and land its payload in `recv`.
    fn send_to_recv_from_complete(&self, request: CommsRequest, recv: &mut [u8]) -> Result<()>;

    /// Run a batch of paired transfers, overlapping them where the transport can.
    ///
    /// Defaults to beginning every transfer, then completing each in order.
    fn send_to_recv_from_batch(&self, batch: Vec<(SendRecv<'_>, &mut [u8])>) -> Result<()> {
        let mut pending = Vec::with_capacity(batch.len());
        for (xfer, recv) in batch {
            pending.push((self.send_to_recv_from_begin(xfer)?, recv));
        }
        for (request, recv) in pending {
            self.send_to_recv_from_complete(request, recv)?;
        }
        Ok(())
    }
}

/// Transport for a single rank. Any packet is a configuration error.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl SingleProcess {
    fn no_peers(xfer: &SendRecv<'_>) -> HaloError {
        HaloError::Transport(format!(
            "single-process transport asked to exchange {} bytes with ranks {} / {}",
            xfer.bytes, xfer.to_rank, xfer.from_rank
        ))
    }
}

impl Transport for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn num_ranks(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn send_to_recv_from(&self, xfer: SendRecv<'_>, _recv: &mut [u8]) -> Result<usize> {
        Err(Self::no_peers(&xfer))
    }

    fn send_to_recv_from_begin(&self, xfer: SendRecv<'_>) -> Result<CommsRequest> {
        Err(Self::no_peers(&xfer))
    }

    fn send_to_recv_from_complete(&self, request: CommsRequest, _recv: &mut [u8]) -> Result<()> {
        Err(HaloError::Transport(format!(
            "single-process transport has no pending request {}",
            request.tag
        )))
    }
}

/// Copy a staged payload into its receive slice, checking the length.
pub(crate) fn land_staged(request: CommsRequest, recv: &mut [u8]) -> Result<()> {
    if !request.do_recv {
        return Ok(());
    }
    let payload = request.staged.ok_or_else(|| {
        HaloError::Transport(format!("request {} completed without a payload", request.tag))
    })?;
    if payload.len() != request.bytes || recv.len() < request.bytes {
        return Err(HaloError::Transport(format!(
            "request {}: expected {} bytes, got {} into a {} byte slice",
            request.tag,
            request.bytes,
            payload.len(),
            recv.len()
        )));
    }
    recv[..request.bytes].copy_from_slice(&payload);
    Ok(())
}
