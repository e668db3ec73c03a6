use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use gridhalo::comm::{LocalTransport, Transport};
use gridhalo::config::{CommPolicy, RunConfig};
use gridhalo::grid::index_from_coor;
use gridhalo::simd::VRealD;
use gridhalo::stats::ExchangeStats;
use gridhalo::stencil::{ReducedPrecisionCompressor, SimpleCompressor};
use gridhalo::{CartesianGrid, CartesianStencil, GridTopology, HaloError, Lattice, Parity, Result};

/// Run halo exchanges on an in-process multi-rank lattice and verify every neighbor
#[derive(Parser)]
#[command(name = "gridhalo", version)]
struct Cli {
    /// TOML run configuration; the flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Full lattice extents, e.g. 8,8
    #[arg(long, value_delimiter = ',')]
    dims: Option<Vec<usize>>,

    /// Processes per dimension
    #[arg(long, value_delimiter = ',')]
    procs: Option<Vec<usize>>,

    /// SIMD lanes per dimension (1 or 2 each)
    #[arg(long, value_delimiter = ',')]
    simd: Option<Vec<usize>>,

    /// Dirichlet block size per dimension, 0 for periodic
    #[arg(long, value_delimiter = ',')]
    dirichlet: Option<Vec<usize>>,

    /// Red-black lattice, exchanging the even parity
    #[arg(long)]
    checkerboard: bool,

    #[arg(long, value_enum)]
    policy: Option<CommPolicy>,

    /// Exchanges to run before verifying
    #[arg(long)]
    exchanges: Option<usize>,

    /// Send single-precision faces and widen them on arrival
    #[arg(long)]
    reduced_precision: bool,

    /// Print exchange stats to stderr
    #[arg(long)]
    stats: bool,
}

impl Cli {
    fn apply(&self, cfg: &mut RunConfig) {
        if let Some(dims) = &self.dims {
            cfg.dims = dims.clone();
        }
        if let Some(procs) = &self.procs {
            cfg.processors = procs.clone();
        }
        if let Some(simd) = &self.simd {
            cfg.simd = simd.clone();
        }
        if let Some(blocks) = &self.dirichlet {
            cfg.stencil.dirichlet = blocks.clone();
        }
        if let Some(policy) = self.policy {
            cfg.stencil.policy = policy;
        }
        if let Some(n) = self.exchanges {
            cfg.exchanges = n;
        }
        cfg.checkerboard |= self.checkerboard;
        cfg.reduced_precision |= self.reduced_precision;
    }
}

struct RankReport {
    checked: usize,
    mismatches: usize,
    stats: ExchangeStats,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = match &cli.config {
        Some(path) => RunConfig::load(path).unwrap_or_else(|e| {
            eprintln!("Error reading {}: {}", path.display(), e);
            std::process::exit(1);
        }),
        None => RunConfig::default(),
    };
    cli.apply(&mut cfg);

    let reports = run(&cfg).unwrap_or_else(|e| {
        eprintln!("Exchange error: {}", e);
        std::process::exit(1);
    });

    let checked: usize = reports.iter().map(|r| r.checked).sum();
    let mismatches: usize = reports.iter().map(|r| r.mismatches).sum();

    if cli.stats {
        let mut total = ExchangeStats::new();
        for r in &reports {
            total.accumulate(&r.stats);
        }
        total.display(&format!("{} ranks", reports.len()));
    }

    if mismatches > 0 {
        eprintln!("{} of {} neighbors mismatched", mismatches, checked);
        std::process::exit(1);
    }
    println!(
        "verified {} neighbors on {} ranks after {} exchanges",
        checked,
        reports.len(),
        cfg.exchanges
    );
}

/// One thread per rank over a shared in-process transport.
fn run(cfg: &RunConfig) -> Result<Vec<RankReport>> {
    let transports = LocalTransport::universe(cfg.num_ranks());
    std::thread::scope(|s| {
        let handles: Vec<_> = transports
            .into_iter()
            .map(|t| s.spawn(move || run_rank(cfg, t)))
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .map_err(|_| HaloError::Transport("rank thread panicked".into()))
                    .and_then(|r| r)
            })
            .collect()
    })
}

fn run_rank(cfg: &RunConfig, transport: LocalTransport) -> Result<RankReport> {
    match cfg.simd.iter().product::<usize>() {
        1 => run_rank_lanes::<1>(cfg, transport),
        2 => run_rank_lanes::<2>(cfg, transport),
        4 => run_rank_lanes::<4>(cfg, transport),
        8 => run_rank_lanes::<8>(cfg, transport),
        n => Err(HaloError::Config(format!("{} SIMD lanes per site are not supported", n))),
    }
}

fn run_rank_lanes<const N: usize>(cfg: &RunConfig, transport: LocalTransport) -> Result<RankReport> {
    let rank = transport.rank();
    let grid: Arc<dyn GridTopology> = if cfg.checkerboard {
        Arc::new(CartesianGrid::red_black(&cfg.dims, &cfg.processors, &cfg.simd, rank)?)
    } else {
        Arc::new(CartesianGrid::new(&cfg.dims, &cfg.processors, &cfg.simd, rank)?)
    };
    let points = cfg.resolved_points();
    let directions: Vec<usize> = points.iter().map(|p| p.direction).collect();
    let displacements: Vec<isize> = points.iter().map(|p| p.displacement).collect();
    let transport: Arc<dyn Transport> = Arc::new(transport);

    let parity = Parity::Even;
    let mut stencil = CartesianStencil::<VRealD<N>>::new(
        Arc::clone(&grid),
        transport,
        points.len(),
        parity,
        &directions,
        &displacements,
        cfg.stencil.clone(),
    )?;
    let dims = cfg.dims.clone();
    let field = Lattice::<VRealD<N>>::from_fn(Arc::clone(&grid), parity, |c| {
        index_from_coor(c, &dims) as f64
    })?;

    for _ in 0..cfg.exchanges {
        if cfg.reduced_precision {
            stencil.halo_exchange(&field, &mut ReducedPrecisionCompressor::<VRealD<N>>::new())?;
        } else {
            stencil.halo_exchange(&field, &mut SimpleCompressor)?;
        }
    }

    let mut report = RankReport {
        checked: 0,
        mismatches: 0,
        stats: stencil.stats().clone(),
    };
    let view = stencil.view();
    for site in 0..grid.osites() {
        for (point, p) in points.iter().enumerate() {
            let d = p.direction;
            let out_parity = if cfg.checkerboard && p.displacement % 2 != 0 {
                parity.flip()
            } else {
                parity
            };
            let got = view.neighbor(&field, site, point)?.resolve();
            for lane in 0..N {
                let mut c = grid.global_coor(site, lane, out_parity);
                let target = c[d] as isize + p.displacement;
                if cut_by_dirichlet(cfg.stencil.dirichlet_block(d), cfg.dims[d], c[d], target) {
                    continue;
                }
                c[d] = target.rem_euclid(cfg.dims[d] as isize) as usize;
                let want = index_from_coor(&c, &cfg.dims) as f64;
                report.checked += 1;
                if got.0[lane] != want {
                    report.mismatches += 1;
                    tracing::warn!(rank, site, lane, point, got = got.0[lane], want, "neighbor mismatch");
                }
            }
        }
    }
    drop(view);
    tracing::info!(rank, checked = report.checked, mismatches = report.mismatches, "rank verified");
    Ok(report)
}

/// A leg leaving its Dirichlet block reads no meaningful neighbor.
fn cut_by_dirichlet(block: usize, extent: usize, from: usize, to: isize) -> bool {
    if block == 0 {
        return false;
    }
    if to < 0 || to >= extent as isize {
        return true;
    }
    from / block != to as usize / block
}
