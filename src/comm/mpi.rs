//! MPI transport for the halo exchange.
//!
//! Requires the `distributed` feature flag and an MPI installation.
//! The caller must initialize MPI before constructing `MpiTransport`:
//!
//! ```ignore
//! let universe = mpi::initialize().expect("MPI init failed");
//! let transport = MpiTransport::new();
//! ```
//!
//! Single paired transfers use `MPI_Sendrecv`, which cannot deadlock on a
//! ring. A batch posts every `MPI_Irecv` and `MPI_Isend` inside one request
//! scope and then waits on all of them, so the transfers overlap. A lone
//! `send_to_recv_from_begin` has no scope to live in and resolves eagerly.

use ::mpi::point_to_point::send_receive_into_with_tags;
use ::mpi::request;
use ::mpi::topology::SimpleCommunicator;
use ::mpi::traits::*;

use super::{land_staged, CommsRequest, SendRecv, Transport};
use crate::error::{HaloError, Result};

/// MPI world-communicator transport.
pub struct MpiTransport;

impl MpiTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MpiTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn tag_of(tag: usize) -> Result<i32> {
    i32::try_from(tag).map_err(|_| HaloError::Transport(format!("tag {} exceeds MPI range", tag)))
}

fn check_fits(xfer: &SendRecv<'_>, recv: &[u8]) -> Result<()> {
    if (xfer.do_recv && recv.len() < xfer.bytes) || (xfer.do_send && xfer.send.len() < xfer.bytes) {
        return Err(HaloError::Transport(format!(
            "packet {} of {} bytes does not fit its buffers",
            xfer.tag, xfer.bytes
        )));
    }
    Ok(())
}

impl Transport for MpiTransport {
    fn rank(&self) -> usize {
        SimpleCommunicator::world().rank() as usize
    }

    fn num_ranks(&self) -> usize {
        SimpleCommunicator::world().size() as usize
    }

    fn barrier(&self) -> Result<()> {
        SimpleCommunicator::world().barrier();
        Ok(())
    }

    fn send_to_recv_from(&self, xfer: SendRecv<'_>, recv: &mut [u8]) -> Result<usize> {
        let world = SimpleCommunicator::world();
        let tag = tag_of(xfer.tag)?;
        check_fits(&xfer, recv)?;
        let send = &xfer.send[..xfer.bytes.min(xfer.send.len())];
        let recv = &mut recv[..xfer.bytes.min(recv.len())];
        let to = world.process_at_rank(xfer.to_rank as i32);
        let from = world.process_at_rank(xfer.from_rank as i32);

        match (xfer.do_send, xfer.do_recv) {
            (true, true) => {
                send_receive_into_with_tags(send, &to, tag, recv, &from, tag);
                Ok(xfer.bytes)
            }
            (true, false) => {
                to.send_with_tag(send, tag);
                Ok(0)
            }
            (false, true) => {
                from.receive_into_with_tag(recv, tag);
                Ok(xfer.bytes)
            }
            (false, false) => Ok(0),
        }
    }

    fn send_to_recv_from_begin(&self, xfer: SendRecv<'_>) -> Result<CommsRequest> {
        let mut staged = vec![0u8; xfer.bytes];
        self.send_to_recv_from(xfer, &mut staged)?;
        Ok(CommsRequest {
            from_rank: xfer.from_rank,
            tag: xfer.tag,
            bytes: xfer.bytes,
            do_recv: xfer.do_recv,
            staged: Some(staged),
        })
    }

    fn send_to_recv_from_complete(&self, request: CommsRequest, recv: &mut [u8]) -> Result<()> {
        land_staged(request, recv)
    }

    fn send_to_recv_from_batch(&self, batch: Vec<(SendRecv<'_>, &mut [u8])>) -> Result<()> {
        // validate everything first: a request dropped before its wait aborts
        let mut posted = Vec::with_capacity(batch.len());
        for (xfer, recv) in batch {
            check_fits(&xfer, recv)?;
            posted.push((tag_of(xfer.tag)?, xfer, recv));
        }

        let world = SimpleCommunicator::world();
        request::scope(|scope| {
            let mut requests = Vec::with_capacity(2 * posted.len());
            for (tag, xfer, recv) in posted {
                if xfer.do_recv {
                    let from = world.process_at_rank(xfer.from_rank as i32);
                    let recv = &mut recv[..xfer.bytes];
                    requests.push(from.immediate_receive_into_with_tag(scope, recv, tag));
                }
                if xfer.do_send {
                    let to = world.process_at_rank(xfer.to_rank as i32);
                    requests.push(to.immediate_send_with_tag(scope, &xfer.send[..xfer.bytes], tag));
                }
            }
            for r in requests {
                r.wait();
            }
        });
        Ok(())
    }
}
