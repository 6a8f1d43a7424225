//! Shared harness: in-process rank groups, decomposition-independent tracer
//! fields, perturbations, and property checks.
#![allow(dead_code)]

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use qlt_parallel::{Parallel, Real, ReduceOp, ThreadComm};
use qlt_tree::implementations::helpers::{self, Decomp, Mesh};
use qlt_tree::implementations::impl_qlt::Qlt;
use qlt_tree::types::problem::{CONSERVE, CONSISTENT, SHAPEPRESERVE};

pub const SEED: u64 = 0x0517_5eed;
pub const EPS: Real = f64::EPSILON;

/// Run `f` on `nranks` in-process ranks; results come back in rank order.
pub fn on_ranks<T, F>(nranks: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(Arc<ThreadComm>) -> T + Send + Sync,
{
    let comms = ThreadComm::split(nranks);
    let f = &f;
    std::thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|c| s.spawn(move || f(Arc::new(c))))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

/// Sum a sparse per-cell vector across ranks; with one writer per cell the
/// sum is an exact gather.
pub fn gather_by_sum<P: Parallel>(p: &P, local: &[Real]) -> Vec<Real> {
    let mut global = vec![0.0; local.len()];
    p.all_reduce(local, &mut global, ReduceOp::Sum).unwrap();
    global
}

/// One tracer of the test matrix.
#[derive(Clone, Copy, Debug)]
pub struct Tracer {
    pub idx: usize,
    pub problem_type: u32,
    pub perturbation: usize,
    pub no_change_should_hold: bool,
    pub local_should_hold: bool,
}

/// The four problem-type variants crossed with the six perturbations.
pub fn test_tracers() -> Vec<Tracer> {
    // One non-canonical mask among them, as a caller would write it.
    let pts = [
        CONSERVE | SHAPEPRESERVE | CONSISTENT,
        SHAPEPRESERVE,
        CONSERVE | CONSISTENT,
        CONSISTENT,
    ];
    let mut tracers = Vec::new();
    for perturbation in 0..6 {
        for &problem_type in &pts {
            let idx = tracers.len();
            tracers.push(Tracer {
                idx,
                problem_type,
                perturbation,
                no_change_should_hold: perturbation == 0,
                local_should_hold: perturbation < 4 && (problem_type & SHAPEPRESERVE != 0),
            });
        }
    }
    tracers
}

/// The full global input field of one tracer. Every rank generates the
/// whole field from per-cell seeds, so fields agree bitwise across any
/// decomposition.
#[derive(Clone, Debug)]
pub struct Field {
    pub rhom: Vec<Real>,
    pub qm_min: Vec<Real>,
    pub qm: Vec<Real>,
    pub qm_max: Vec<Real>,
    pub qm_prev: Vec<Real>,
}

pub fn generate_field(ncells: usize, t: &Tracer) -> Field {
    let mut f = Field {
        rhom: Vec::with_capacity(ncells),
        qm_min: Vec::with_capacity(ncells),
        qm: Vec::with_capacity(ncells),
        qm_max: Vec::with_capacity(ncells),
        qm_prev: Vec::with_capacity(ncells),
    };
    for ci in 0..ncells {
        let v = helpers::tracer_fixture(SEED, ci, t.idx);
        f.rhom.push(v.rhom);
        f.qm_min.push(v.qm_min);
        f.qm.push(v.qm);
        f.qm_max.push(v.qm_max);
        f.qm_prev.push(v.qm_prev);
    }
    perturb(ncells, t, &mut f);
    f
}

/// Reorder the masses between cells; the global mass is untouched but most
/// cells now need reconstruction.
fn permute_qm(t: &Tracer, f: &mut Field) {
    let mut perm: Vec<usize> = (0..f.qm.len()).collect();
    let mut rng = StdRng::seed_from_u64(SEED ^ ((t.idx as u64) << 32));
    perm.shuffle(&mut rng);
    let orig = f.qm.clone();
    for (i, &pi) in perm.iter().enumerate() {
        f.qm[i] = orig[pi];
    }
}

/// Push every cell `alpha` of the way toward the feasibility bound: the
/// per-cell bound sum for the ordinary problem, the global-ratio bound for
/// the safety problem.
fn add_const_to_qm(
    ncells: usize,
    t: &Tracer,
    f: &mut Field,
    alpha: Real,
    conserve_mass: bool,
    safety_problem: bool,
) {
    let rhom_sum: Real = f.rhom.iter().sum();
    let qm_sum: Real = f.qm.iter().sum();
    let qm_max_sum: Real = f.qm_max.iter().sum();
    let mut qm_max_safety = 0.0;
    if safety_problem {
        let mut q_safety = f.qm_max[0] / f.rhom[0];
        for i in 1..ncells {
            q_safety = q_safety.max(f.qm_max[i] / f.rhom[i]);
        }
        qm_max_safety = q_safety * rhom_sum;
    }
    let n = ncells as Real;
    let dqm = if safety_problem {
        ((qm_max_sum - qm_sum) + alpha * (qm_max_safety - qm_max_sum)) / n
    } else {
        alpha * (qm_max_sum - qm_sum) / n
    };
    for v in f.qm.iter_mut() {
        *v += dqm;
    }
    permute_qm(t, f);
    // If the engine is asked to conserve, give the previous masses an
    // independent drift so conservation actually has work to do; otherwise
    // keep the previous masses summing to the new mass.
    let relax = 0.9;
    let dqm_prev = if conserve_mass {
        dqm
    } else if safety_problem {
        ((qm_max_sum - qm_sum) + relax * alpha * (qm_max_safety - qm_max_sum)) / n
    } else {
        relax * alpha * (qm_max_sum - qm_sum) / n
    };
    for v in f.qm_prev.iter_mut() {
        *v += dqm_prev;
    }
}

fn perturb(ncells: usize, t: &Tracer, f: &mut Field) {
    let cm = t.problem_type & CONSERVE == 0;
    // Back away from the exact edge by the FP error a global mass can
    // accumulate, assuming cell masses of order one.
    let edg = 1.0 - ncells as Real * EPS;
    match t.perturbation {
        0 => {}
        1 => permute_qm(t, f),
        2 => add_const_to_qm(ncells, t, f, 0.5, cm, false),
        3 => add_const_to_qm(ncells, t, f, edg, cm, false),
        4 => add_const_to_qm(ncells, t, f, 0.5, cm, true),
        5 => add_const_to_qm(ncells, t, f, edg, cm, true),
        _ => unreachable!(),
    }
}

fn reldif(a: Real, b: Real) -> Real {
    (a - b).abs() / a.abs().max(b.abs())
}

/// Property checks for one tracer over the full pre-run field and the
/// gathered post-run masses. Returns the number of violations.
pub fn check_tracer(ncells: usize, t: &Tracer, f: &Field, qm_post: &[Real]) -> usize {
    let ulp3 = 3.0 * EPS;
    let mut nerr = 0;
    for i in 0..ncells {
        let lv = qm_post[i] < f.qm_min[i] || qm_post[i] > f.qm_max[i];
        if t.local_should_hold && lv {
            eprintln!(
                "tracer {} cell {i}: {} outside [{}, {}]",
                t.idx, qm_post[i], f.qm_min[i], f.qm_max[i]
            );
            nerr += 1;
        }
        if t.no_change_should_hold && qm_post[i] != f.qm_prev[i] {
            eprintln!(
                "tracer {} cell {i}: {} changed from {}",
                t.idx, qm_post[i], f.qm_prev[i]
            );
            nerr += 1;
        }
    }
    if !t.local_should_hold {
        // The safety problem: masses stay within the globally reduced
        // density-ratio bounds.
        let mut q_min = f.qm_min[0] / f.rhom[0];
        let mut q_max = f.qm_max[0] / f.rhom[0];
        for i in 1..ncells {
            q_min = q_min.min(f.qm_min[i] / f.rhom[i]);
            q_max = q_max.max(f.qm_max[i] / f.rhom[i]);
        }
        for i in 0..ncells {
            if qm_post[i] < q_min * f.rhom[i] * (1.0 - ulp3)
                || qm_post[i] > q_max * f.rhom[i] * (1.0 + ulp3)
            {
                eprintln!(
                    "tracer {} cell {i}: {} outside safety [{}, {}]",
                    t.idx,
                    qm_post[i],
                    q_min * f.rhom[i],
                    q_max * f.rhom[i]
                );
                nerr += 1;
            }
        }
    }
    let desired_mass: Real = f.qm_prev.iter().sum();
    let actual_mass: Real = qm_post.iter().sum();
    let tol = 1e3 * EPS;
    if reldif(desired_mass, actual_mass) > tol {
        eprintln!(
            "tracer {}: mass {} drifted from {} (re {})",
            t.idx,
            actual_mass,
            desired_mass,
            reldif(desired_mass, actual_mass)
        );
        nerr += 1;
    }
    nerr
}

/// Build an engine over the meshed tree, run every tracer once, and return
/// the inputs plus the gathered global post-run masses per tracer.
pub fn run_qlt(
    p: Arc<ThreadComm>,
    mesh: &Mesh,
    imbalanced: bool,
    tracers: &[Tracer],
) -> (Vec<Field>, Vec<Vec<Real>>) {
    let ncells = mesh.ncells();
    let tree = helpers::make_tree(mesh, imbalanced);
    let mut qlt = Qlt::new(Arc::clone(&p), ncells, &tree).unwrap();
    for t in tracers {
        qlt.declare_tracer(t.problem_type).unwrap();
    }
    qlt.end_tracer_declarations().unwrap();
    assert_eq!(qlt.get_num_tracers(), tracers.len());
    let gcis = qlt.get_owned_glblcells();
    for (i, &gci) in gcis.iter().enumerate() {
        assert_eq!(qlt.gci2lci(gci).unwrap(), i);
    }
    let fields: Vec<Field> = tracers.iter().map(|t| generate_field(ncells, t)).collect();
    for (lci, &gci) in gcis.iter().enumerate() {
        qlt.set_rhom(lci, fields[0].rhom[gci]);
    }
    for t in tracers {
        let f = &fields[t.idx];
        for (lci, &gci) in gcis.iter().enumerate() {
            qlt.set_qm(lci, t.idx, f.qm[gci], f.qm_min[gci], f.qm_max[gci], f.qm_prev[gci]);
        }
    }
    qlt.run().unwrap();
    let results = tracers
        .iter()
        .map(|t| {
            let mut local = vec![0.0; ncells];
            for (lci, &gci) in gcis.iter().enumerate() {
                local[gci] = qlt.get_qm(lci, t.idx);
            }
            gather_by_sum(&*p, &local)
        })
        .collect();
    (fields, results)
}

/// Decomposition pairs used by the invariance tests.
pub const DECOMPS: [Decomp; 2] = [Decomp::Contiguous, Decomp::Pseudorandom];
