//! Cartesian halo-exchange stencil.
//!
//! A stencil is built once per (grid, point list, checkerboard). Each call to
//! [`CartesianStencil::halo_exchange`] then runs the fixed pipeline
//!
//! 1. `prepare`: drop last exchange's packets and descriptors;
//! 2. `halo_gather`: compress every off-node face into the send buffers;
//! 3. `communicate`: move the packets through the transport;
//! 4. `comms_merge_shm`: merge faces that never left this process;
//! 5. `comms_merge`: apply duplicate copies, then merge and decompress the rest.
//!
//! after which [`StencilView`] resolves any (site, point) pair to either a
//! field element or a halo element.

pub mod compressor;
pub mod entry;
mod gather;
pub mod merge;
pub mod schedule;
pub mod table;
pub mod view;

use std::marker::PhantomData;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Instant;

use bytemuck::Pod;

pub use compressor::{Compressor, Decompressor, ReducedPrecisionCompressor, SimpleCompressor};
pub use entry::{BufferId, Location, StencilEntry, STENCIL_MAX};
pub use merge::{Decompress, Merge};
pub use schedule::{CopyReceiveBuffer, Packet};
pub use table::StencilPoint;
pub use view::{HaloViewMut, Neighbor, NeighborInfo, Prefetch, Source, StencilView, ViewMode};

use crate::comm::Transport;
use crate::config::{CommPolicy, StencilParams};
use crate::error::{HaloError, Result};
use crate::field::Lattice;
use crate::grid::{GridTopology, Parity};
use crate::stats::ExchangeStats;

use entry::UnifiedBuffers;
use schedule::ExchangePlan;
use table::SiteTable;

/// Face tables computed on the first exchange and reused afterwards.
#[derive(Debug, Default)]
struct FaceTables {
    tables: Vec<Vec<(usize, usize)>>,
    computed: bool,
}

/// Halo-exchange stencil over sites `V`, delivering halo objects `H`.
pub struct CartesianStencil<V, H = V> {
    grid: Arc<dyn GridTopology>,
    transport: Arc<dyn Transport>,
    params: StencilParams,
    checkerboard: Parity,
    points: Vec<StencilPoint>,
    table: SiteTable,
    buffers: UnifiedBuffers,
    faces: FaceTables,
    plan: ExchangePlan,
    comm_offset: usize,
    comm_pool: Option<rayon::ThreadPool>,
    stats: ExchangeStats,
    open_views: AtomicUsize,
    _sites: PhantomData<fn() -> (V, H)>,
}

impl<V, H> CartesianStencil<V, H>
where
    V: Pod + Send + Sync,
    H: Pod + Send + Sync,
{
    /// Build the neighbor table and allocate the unified buffers.
    ///
    /// `checkerboard` is the parity of the fields this stencil gathers from.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        grid: Arc<dyn GridTopology>,
        transport: Arc<dyn Transport>,
        npoints: usize,
        checkerboard: Parity,
        directions: &[usize],
        distances: &[isize],
        params: StencilParams,
    ) -> Result<Self> {
        if directions.len() != npoints || distances.len() != npoints {
            return Err(HaloError::Topology(format!(
                "{} points declared, {} directions and {} distances given",
                npoints,
                directions.len(),
                distances.len()
            )));
        }
        if grid.this_rank() != transport.rank() || grid.num_ranks() != transport.num_ranks() {
            return Err(HaloError::Topology(format!(
                "grid is rank {} of {}, transport is rank {} of {}",
                grid.this_rank(),
                grid.num_ranks(),
                transport.rank(),
                transport.num_ranks()
            )));
        }
        if grid.checker_dim().is_none() && checkerboard != Parity::Even {
            return Err(HaloError::Checkerboard {
                expected: Parity::Even,
                found: checkerboard,
            });
        }
        if std::mem::align_of::<V>() > 8 || std::mem::align_of::<H>() > 8 {
            return Err(HaloError::Topology(
                "site and halo types must not need more than 8-byte alignment".into(),
            ));
        }

        let points: Vec<StencilPoint> = directions
            .iter()
            .zip(distances)
            .map(|(&direction, &displacement)| StencilPoint {
                direction,
                displacement,
            })
            .collect();

        let table = SiteTable::build(
            grid.as_ref(),
            checkerboard,
            &points,
            &params,
            std::mem::size_of::<V>(),
            std::mem::size_of::<H>(),
        )?;
        let buffers = UnifiedBuffers::new(table.unified_buffer_size * std::mem::size_of::<H>());

        let comm_pool = match params.policy {
            CommPolicy::Sequential => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(params.comm_threads.max(1))
                    .thread_name(|i| format!("halo-comm-{}", i))
                    .build()
                    .map_err(|e| HaloError::Transport(e.to_string()))?,
            ),
            CommPolicy::Concurrent => None,
        };

        Ok(Self {
            grid,
            transport,
            params,
            checkerboard,
            points,
            table,
            buffers,
            faces: FaceTables::default(),
            plan: ExchangePlan::default(),
            comm_offset: 0,
            comm_pool,
            stats: ExchangeStats::new(),
            open_views: AtomicUsize::new(0),
            _sites: PhantomData,
        })
    }

    /// Gather, communicate and merge the halo of `source`.
    pub fn halo_exchange<C>(&mut self, source: &Lattice<V>, compress: &mut C) -> Result<()>
    where
        C: Compressor<V> + Decompressor<C::Wire, H>,
    {
        let _span = tracing::debug_span!(
            "halo_exchange",
            rank = self.grid.this_rank(),
            npoints = self.points.len()
        )
        .entered();

        self.prepare();

        let t = Instant::now();
        self.halo_gather(source, compress)?;
        self.stats.gather += t.elapsed();

        let t = Instant::now();
        self.communicate()?;
        self.stats.communicate += t.elapsed();

        let t = Instant::now();
        self.comms_merge_shm::<C::Wire, C>(compress)?;
        self.comms_merge::<C::Wire, C>(compress)?;
        self.stats.merge += t.elapsed();

        let t = Instant::now();
        self.comms_decompress::<C::Wire, C>(compress)?;
        self.stats.decompress += t.elapsed();

        self.record_exchange();
        tracing::debug!(
            packets = self.plan.packets.len(),
            copies = self.plan.copies.len(),
            merges = self.plan.mergers.len() + self.plan.mergers_shm.len(),
            decompressions = self.plan.decompressions.len(),
            "halo exchange complete"
        );
        Ok(())
    }

    /// Forget the previous exchange's packets, copies and descriptors.
    pub fn prepare(&mut self) {
        self.plan.clear();
    }

    fn record_exchange(&mut self) {
        let s = &mut self.stats;
        s.exchanges += 1;
        s.packets += self.plan.packets.len() as u64;
        for p in &self.plan.packets {
            if p.do_send {
                s.bytes_sent += p.bytes as u64;
            }
            if p.do_recv {
                s.bytes_received += p.bytes as u64;
            }
        }
        s.copies += self.plan.copies.len() as u64;
        s.merges_shm += self.plan.mergers_shm.len() as u64;
        s.merges += self.plan.mergers.len() as u64;
        s.decompressions += self.plan.decompressions.len() as u64;
    }

    fn check_source(&self, source: &Lattice<V>) -> Result<()> {
        if !source.on_grid(&self.grid) {
            return Err(HaloError::Conformable(
                "source field lives on a different grid than the stencil".into(),
            ));
        }
        if source.checkerboard() != self.checkerboard {
            return Err(HaloError::Checkerboard {
                expected: self.checkerboard,
                found: source.checkerboard(),
            });
        }
        Ok(())
    }

    /// Read-only view of the neighbor table and the receive halo.
    pub fn view(&self) -> StencilView<'_, V, H> {
        StencilView::open(self, ViewMode::Read)
    }

    /// Writable view of the receive halo.
    pub fn view_mut(&mut self, mode: ViewMode) -> Result<HaloViewMut<'_, V, H>> {
        HaloViewMut::open(self, mode)
    }

    pub fn open_views(&self) -> usize {
        self.open_views.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn grid(&self) -> &Arc<dyn GridTopology> {
        &self.grid
    }

    pub fn params(&self) -> &StencilParams {
        &self.params
    }

    pub fn checkerboard(&self) -> Parity {
        self.checkerboard
    }

    pub fn npoints(&self) -> usize {
        self.points.len()
    }

    pub fn points(&self) -> &[StencilPoint] {
        &self.points
    }

    pub fn entries(&self) -> &[StencilEntry] {
        &self.table.entries
    }

    pub fn unified_buffer_size(&self) -> usize {
        self.table.unified_buffer_size
    }

    /// Sites in one face of `point`, 0 for points that never communicate.
    pub fn comm_buf_size(&self, point: usize) -> usize {
        self.table.comm_buf_size[point]
    }

    pub fn permute_type(&self, point: usize) -> usize {
        self.table.permute_type[point]
    }

    pub fn same_node(&self, point: usize) -> bool {
        self.table.same_node[point]
    }

    pub fn comms_send(&self, point: usize) -> bool {
        self.table.comms_send[point]
    }

    pub fn comms_recv(&self, point: usize) -> bool {
        self.table.comms_recv[point]
    }

    /// Rebuild the surface list for `vol` outer sites, each spanning `ls` table sites.
    pub fn build_surface_list(&mut self, ls: usize, vol: usize) {
        self.table.build_surface_list(ls, vol);
    }

    pub fn surface_list(&self) -> &[usize] {
        &self.table.surface_list
    }

    pub fn packets(&self) -> &[Packet] {
        &self.plan.packets
    }

    pub fn copies(&self) -> &[CopyReceiveBuffer] {
        &self.plan.copies
    }

    pub fn mergers(&self) -> &[Merge] {
        &self.plan.mergers
    }

    pub fn mergers_shm(&self) -> &[Merge] {
        &self.plan.mergers_shm
    }

    pub fn decompressions(&self) -> &[Decompress] {
        &self.plan.decompressions
    }

    pub fn stats(&self) -> &ExchangeStats {
        &self.stats
    }

    /// Print accumulated exchange statistics to stderr.
    pub fn report(&self) {
        self.stats.display(&format!("rank {}", self.grid.this_rank()));
    }

    pub fn zero_counters(&mut self) {
        self.stats.zero();
    }
}
