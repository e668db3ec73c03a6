//! In-process transport: every rank is a thread of the same process.
//!
//! Each `(from, to, tag)` triple owns an unbounded crossbeam channel, created
//! on first use by whichever side gets there first. Sends never block and a
//! receive blocks until its matching send arrives. Channels are FIFO, so a
//! tag reused by the next exchange can never overtake the current one.

use std::collections::HashMap;
use std::sync::{Arc, Barrier, Mutex};

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::{land_staged, CommsRequest, SendRecv, Transport};
use crate::error::{HaloError, Result};

type Mailbox = (Sender<Vec<u8>>, Receiver<Vec<u8>>);

struct Shared {
    size: usize,
    barrier: Barrier,
    mailboxes: Mutex<HashMap<(usize, usize, usize), Mailbox>>,
}

/// Handle for one rank of an in-process universe.
#[derive(Clone)]
pub struct LocalTransport {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalTransport {
    /// Create `size` connected ranks; hand element `r` to the thread playing rank `r`.
    pub fn universe(size: usize) -> Vec<LocalTransport> {
        let shared = Arc::new(Shared {
            size,
            barrier: Barrier::new(size),
            mailboxes: Mutex::new(HashMap::new()),
        });
        (0..size)
            .map(|rank| LocalTransport {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn mailbox(&self, from: usize, to: usize, tag: usize) -> Result<Mailbox> {
        if from >= self.shared.size || to >= self.shared.size {
            return Err(HaloError::Transport(format!(
                "rank pair {} -> {} outside a universe of {}",
                from, to, self.shared.size
            )));
        }
        let mut boxes = self
            .shared
            .mailboxes
            .lock()
            .map_err(|_| HaloError::Transport("mailbox table poisoned".into()))?;
        let (tx, rx) = boxes.entry((from, to, tag)).or_insert_with(unbounded);
        Ok((tx.clone(), rx.clone()))
    }

    fn post(&self, xfer: &SendRecv<'_>) -> Result<()> {
        if !xfer.do_send {
            return Ok(());
        }
        if xfer.send.len() < xfer.bytes {
            return Err(HaloError::Transport(format!(
                "send slice of {} bytes for a {} byte packet",
                xfer.send.len(),
                xfer.bytes
            )));
        }
        let (tx, _) = self.mailbox(self.rank, xfer.to_rank, xfer.tag)?;
        tx.send(xfer.send[..xfer.bytes].to_vec())
            .map_err(|_| HaloError::Transport(format!("rank {} hung up", xfer.to_rank)))
    }

    fn take(&self, from_rank: usize, tag: usize) -> Result<Vec<u8>> {
        let (_, rx) = self.mailbox(from_rank, self.rank, tag)?;
        rx.recv()
            .map_err(|_| HaloError::Transport(format!("rank {} hung up", from_rank)))
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.shared.size
    }

    fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait();
        Ok(())
    }

    fn send_to_recv_from(&self, xfer: SendRecv<'_>, recv: &mut [u8]) -> Result<usize> {
        self.post(&xfer)?;
        if !xfer.do_recv {
            return Ok(0);
        }
        let request = CommsRequest {
            from_rank: xfer.from_rank,
            tag: xfer.tag,
            bytes: xfer.bytes,
            do_recv: true,
            staged: Some(self.take(xfer.from_rank, xfer.tag)?),
        };
        land_staged(request, recv)?;
        Ok(xfer.bytes)
    }

    fn send_to_recv_from_begin(&self, xfer: SendRecv<'_>) -> Result<CommsRequest> {
        self.post(&xfer)?;
        Ok(CommsRequest {
            from_rank: xfer.from_rank,
            tag: xfer.tag,
            bytes: xfer.bytes,
            do_recv: xfer.do_recv,
            staged: None,
        })
    }

    fn send_to_recv_from_complete(&self, mut request: CommsRequest, recv: &mut [u8]) -> Result<()> {
        if request.do_recv && request.staged.is_none() {
            request.staged = Some(self.take(request.from_rank, request.tag)?);
        }
        land_staged(request, recv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_xfer(send: &[u8], rank: usize, size: usize, tag: usize) -> SendRecv<'_> {
        SendRecv {
            send,
            to_rank: (rank + size - 1) % size,
            do_send: true,
            from_rank: (rank + 1) % size,
            do_recv: true,
            bytes: send.len(),
            tag,
        }
    }

    #[test]
    fn blocking_ring_shift() {
        let ranks = LocalTransport::universe(3);
        let got: Vec<Vec<u8>> = std::thread::scope(|s| {
            let handles: Vec<_> = ranks
                .iter()
                .map(|t| {
                    s.spawn(move || {
                        let payload = [t.rank() as u8; 4];
                        let mut recv = [0u8; 4];
                        let n = t
                            .send_to_recv_from(ring_xfer(&payload, t.rank(), 3, 0), &mut recv)
                            .unwrap();
                        assert_eq!(n, 4);
                        recv.to_vec()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(got[0], vec![1; 4]);
        assert_eq!(got[1], vec![2; 4]);
        assert_eq!(got[2], vec![0; 4]);
    }

    #[test]
    fn begin_all_then_complete_all() {
        let ranks = LocalTransport::universe(2);
        std::thread::scope(|s| {
            for t in &ranks {
                s.spawn(move || {
                    let a = [10 + t.rank() as u8; 2];
                    let b = [20 + t.rank() as u8; 2];
                    let r0 = t.send_to_recv_from_begin(ring_xfer(&a, t.rank(), 2, 0)).unwrap();
                    let r1 = t.send_to_recv_from_begin(ring_xfer(&b, t.rank(), 2, 1)).unwrap();
                    let mut x = [0u8; 2];
                    let mut y = [0u8; 2];
                    t.send_to_recv_from_complete(r1, &mut y).unwrap();
                    t.send_to_recv_from_complete(r0, &mut x).unwrap();
                    let peer = 1 - t.rank() as u8;
                    assert_eq!(x, [10 + peer; 2]);
                    assert_eq!(y, [20 + peer; 2]);
                    t.barrier().unwrap();
                });
            }
        });
    }

    #[test]
    fn batch_lands_every_payload() {
        let ranks = LocalTransport::universe(2);
        std::thread::scope(|s| {
            for t in &ranks {
                s.spawn(move || {
                    let a = [30 + t.rank() as u8; 2];
                    let b = [40 + t.rank() as u8; 3];
                    let mut x = [0u8; 2];
                    let mut y = [0u8; 3];
                    let batch = vec![
                        (ring_xfer(&a, t.rank(), 2, 0), &mut x[..]),
                        (ring_xfer(&b, t.rank(), 2, 1), &mut y[..]),
                    ];
                    t.send_to_recv_from_batch(batch).unwrap();
                    let peer = 1 - t.rank() as u8;
                    assert_eq!(x, [30 + peer; 2]);
                    assert_eq!(y, [40 + peer; 3]);
                    t.barrier().unwrap();
                });
            }
        });
    }

    #[test]
    fn disabled_legs_are_skipped() {
        let ranks = LocalTransport::universe(2);
        std::thread::scope(|s| {
            for t in &ranks {
                s.spawn(move || {
                    let payload = [5u8; 3];
                    let mut xfer = ring_xfer(&payload, t.rank(), 2, 7);
                    // rank 0 only sends, rank 1 only receives
                    xfer.do_recv = t.rank() == 1;
                    xfer.do_send = t.rank() == 0;
                    let mut recv = [0u8; 3];
                    let n = t.send_to_recv_from(xfer, &mut recv).unwrap();
                    if t.rank() == 1 {
                        assert_eq!(n, 3);
                        assert_eq!(recv, [5; 3]);
                    } else {
                        assert_eq!(n, 0);
                        assert_eq!(recv, [0; 3]);
                    }
                });
            }
        });
    }

    #[test]
    fn unknown_rank_is_an_error() {
        let ranks = LocalTransport::universe(1);
        let mut xfer = ring_xfer(&[1], 0, 1, 0);
        xfer.to_rank = 4;
        assert!(ranks[0].send_to_recv_from_begin(xfer).is_err());
    }
}
