//! Scoped access to the neighbor table and the receive halo.
//!
//! Views borrow the stencil, so none can be open across an exchange. The
//! stencil counts open views; dropping a view closes it.

use std::sync::atomic::Ordering;

use bytemuck::Pod;

use super::entry::{BufferId, StencilEntry};
use super::CartesianStencil;
use crate::error::{HaloError, Result};
use crate::field::Lattice;
use crate::simd::SimdSite;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewMode {
    Read,
    Write,
    ReadWrite,
}

/// Which storage a table entry points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Field,
    Halo,
}

/// Decoded table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborInfo {
    pub source: Source,
    pub offset: usize,
    pub byte_offset: usize,
    /// Permute type to apply, when the neighbor's lanes are rotated.
    pub permute: Option<usize>,
    pub wrap: bool,
}

/// Address a kernel may prefetch ahead of using an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefetch {
    pub source: Source,
    pub byte_offset: usize,
}

/// Typed reference to the neighbor of a (site, point) pair.
#[derive(Debug, Clone, Copy)]
pub enum Neighbor<'a, V, H> {
    Local {
        value: &'a V,
        permute: Option<usize>,
        wrap: bool,
    },
    Halo {
        value: &'a H,
        wrap: bool,
    },
}

impl<V, H> Neighbor<'_, V, H> {
    pub fn is_local(&self) -> bool {
        matches!(self, Neighbor::Local { .. })
    }

    pub fn wrap(&self) -> bool {
        match *self {
            Neighbor::Local { wrap, .. } | Neighbor::Halo { wrap, .. } => wrap,
        }
    }
}

impl<V: SimdSite> Neighbor<'_, V, V> {
    /// The neighbor site with any lane permute applied.
    pub fn resolve(&self) -> V {
        match *self {
            Neighbor::Local {
                value,
                permute: Some(ptype),
                ..
            } => value.permute(ptype),
            Neighbor::Local { value, .. } => *value,
            Neighbor::Halo { value, .. } => *value,
        }
    }
}

/// Read-only view of a stencil.
pub struct StencilView<'a, V, H> {
    stencil: &'a CartesianStencil<V, H>,
    mode: ViewMode,
}

impl<'a, V, H> StencilView<'a, V, H>
where
    V: Pod + Send + Sync,
    H: Pod + Send + Sync,
{
    pub(crate) fn open(stencil: &'a CartesianStencil<V, H>, mode: ViewMode) -> Self {
        let open = stencil.open_views.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(open, ?mode, "stencil view opened");
        Self { stencil, mode }
    }

    pub fn mode(&self) -> ViewMode {
        self.mode
    }

    pub fn npoints(&self) -> usize {
        self.stencil.table.npoints
    }

    pub fn entry_index(&self, point: usize, site: usize) -> usize {
        self.stencil.table.index(point, site)
    }

    /// Table entry of `(point, site)` with the point's permute type.
    pub fn entry(&self, point: usize, site: usize) -> (&'a StencilEntry, usize) {
        let table = &self.stencil.table;
        (table.entry(point, site), table.permute_type[point])
    }

    pub fn is_local(&self, site: usize, point: usize) -> bool {
        self.stencil.table.entry(point, site).is_local()
    }

    pub fn info(&self, point: usize, ent: usize) -> NeighborInfo {
        let e = &self.stencil.table.entries[ent];
        NeighborInfo {
            source: if e.is_local() { Source::Field } else { Source::Halo },
            offset: e.offset(),
            byte_offset: e.byte_offset(),
            permute: e.permute().then(|| self.stencil.table.permute_type[point]),
            wrap: e.around_the_world(),
        }
    }

    pub fn prefetch(&self, ent: usize) -> Prefetch {
        let e = &self.stencil.table.entries[ent];
        Prefetch {
            source: if e.is_local() { Source::Field } else { Source::Halo },
            byte_offset: e.byte_offset(),
        }
    }

    /// Neighbor of `site` along `point`, read from `field` or the halo.
    pub fn neighbor<'f>(
        &'f self,
        field: &'f Lattice<V>,
        site: usize,
        point: usize,
    ) -> Result<Neighbor<'f, V, H>> {
        self.stencil.check_source(field)?;
        let ent = self.entry_index(point, site);
        let info = self.info(point, ent);
        match info.source {
            Source::Field => Ok(Neighbor::Local {
                value: &field.as_slice()[info.offset],
                permute: info.permute,
                wrap: info.wrap,
            }),
            Source::Halo => {
                let halo = self.halo()?;
                let value = halo.get(info.offset).ok_or_else(|| {
                    HaloError::View(format!(
                        "halo offset {} outside a buffer of {} sites",
                        info.offset,
                        halo.len()
                    ))
                })?;
                Ok(Neighbor::Halo {
                    value,
                    wrap: info.wrap,
                })
            }
        }
    }

    /// Per-dimension SIMD coordinate of a lane.
    pub fn lane_coor(&self, lane: usize) -> Vec<usize> {
        self.stencil.grid.icoor_from_lane(lane)
    }

    /// Every halo site of the last exchange.
    pub fn halo(&self) -> Result<&'a [H]> {
        let s = self.stencil;
        s.buffers
            .get(BufferId::Recv)
            .typed::<H>(0, s.table.unified_buffer_size)
    }
}

impl<V, H> Drop for StencilView<'_, V, H> {
    fn drop(&mut self) {
        let open = self.stencil.open_views.fetch_sub(1, Ordering::AcqRel) - 1;
        tracing::trace!(open, "stencil view closed");
    }
}

/// Writable view of the receive halo.
pub struct HaloViewMut<'a, V, H> {
    stencil: &'a mut CartesianStencil<V, H>,
    mode: ViewMode,
}

impl<'a, V, H> HaloViewMut<'a, V, H>
where
    V: Pod + Send + Sync,
    H: Pod + Send + Sync,
{
    pub(crate) fn open(stencil: &'a mut CartesianStencil<V, H>, mode: ViewMode) -> Result<Self> {
        if mode == ViewMode::Read {
            return Err(HaloError::View(
                "a mutable halo view needs write or read-write mode".into(),
            ));
        }
        let open = stencil.open_views.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(open, ?mode, "halo view opened");
        Ok(Self { stencil, mode })
    }

    pub fn mode(&self) -> ViewMode {
        self.mode
    }

    pub fn halo(&self) -> Result<&[H]> {
        if self.mode != ViewMode::ReadWrite {
            return Err(HaloError::View("halo view is write-only".into()));
        }
        let size = self.stencil.table.unified_buffer_size;
        self.stencil.buffers.get(BufferId::Recv).typed::<H>(0, size)
    }

    pub fn halo_mut(&mut self) -> Result<&mut [H]> {
        let size = self.stencil.table.unified_buffer_size;
        self.stencil
            .buffers
            .get_mut(BufferId::Recv)
            .typed_mut::<H>(0, size)
    }
}

impl<V, H> Drop for HaloViewMut<'_, V, H> {
    fn drop(&mut self) {
        let open = self.stencil.open_views.fetch_sub(1, Ordering::AcqRel) - 1;
        tracing::trace!(open, "halo view closed");
    }
}
