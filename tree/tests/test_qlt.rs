//! End-to-end engine properties: conservation, shape preservation, safety
//! bounds, and idempotence, over the full problem-type × perturbation
//! matrix.

mod common;

use std::sync::Arc;

use common::{check_tracer, on_ranks, run_qlt, test_tracers, DECOMPS};
use qlt_parallel::SerialComm;
use qlt_tree::implementations::helpers::{make_tree, Decomp, Mesh};
use qlt_tree::implementations::impl_qlt::Qlt;
use qlt_tree::traits::{MetricsTotals, TimedOp};
use qlt_tree::types::problem::{ProblemKind, CONSERVE, CONSISTENT, SHAPEPRESERVE};

fn property_suite(nranks: usize, ncells: usize, decomp: Decomp, imbalanced: bool) {
    let tracers = test_tracers();
    let errs = on_ranks(nranks, |p| {
        let mesh = Mesh::new(ncells, nranks, decomp);
        let (fields, results) = run_qlt(p, &mesh, imbalanced, &tracers);
        tracers
            .iter()
            .map(|t| check_tracer(ncells, t, &fields[t.idx], &results[t.idx]))
            .sum::<usize>()
    });
    assert_eq!(
        errs.iter().sum::<usize>(),
        0,
        "nranks {nranks} ncells {ncells} {decomp:?} imbalanced {imbalanced}"
    );
}

#[test]
fn properties_hold_across_sizes() {
    for nranks in [1usize, 2, 3] {
        for mult in [1usize, 2, 3, 7] {
            for decomp in DECOMPS {
                for imbalanced in [false, true] {
                    property_suite(nranks, mult * nranks, decomp, imbalanced);
                }
            }
        }
    }
}

#[test]
fn properties_hold_on_a_large_mesh() {
    // Scenario: 21 cells per rank, plus the classic 42-cell mesh.
    property_suite(4, 84, Decomp::Contiguous, false);
    property_suite(3, 42, Decomp::Contiguous, false);
    property_suite(3, 42, Decomp::Pseudorandom, true);
}

#[test]
fn unperturbed_tracers_come_back_bitwise() {
    // Scenario: every problem-type variant at perturbation 0 returns its
    // input exactly, on balanced and imbalanced trees.
    let tracers: Vec<_> = test_tracers()
        .into_iter()
        .filter(|t| t.perturbation == 0)
        .enumerate()
        .map(|(i, mut t)| {
            t.idx = i;
            t
        })
        .collect();
    for imbalanced in [false, true] {
        let errs = on_ranks(2, |p| {
            let mesh = Mesh::new(42, 2, Decomp::Contiguous);
            let (fields, results) = run_qlt(p, &mesh, imbalanced, &tracers);
            let mut nerr = 0;
            for t in &tracers {
                for ci in 0..42 {
                    if results[t.idx][ci].to_bits() != fields[t.idx].qm_prev[ci].to_bits() {
                        nerr += 1;
                    }
                }
            }
            nerr
        });
        assert_eq!(errs.iter().sum::<usize>(), 0, "imbalanced {imbalanced}");
    }
}

#[test]
fn serial_engine_matches_threaded_single_rank() {
    let tracers = test_tracers();
    let ncells = 11;
    let mesh = Mesh::new(ncells, 1, Decomp::Contiguous);
    let threaded = on_ranks(1, |p| run_qlt(p, &mesh, true, &tracers).1);
    let tree = make_tree(&mesh, true);
    let mut qlt = Qlt::new(Arc::new(SerialComm), ncells, &tree).unwrap();
    for t in &tracers {
        qlt.declare_tracer(t.problem_type).unwrap();
    }
    qlt.end_tracer_declarations().unwrap();
    let gcis = qlt.get_owned_glblcells();
    let fields: Vec<_> = tracers
        .iter()
        .map(|t| common::generate_field(ncells, t))
        .collect();
    for (lci, &gci) in gcis.iter().enumerate() {
        qlt.set_rhom(lci, fields[0].rhom[gci]);
    }
    for t in &tracers {
        let f = &fields[t.idx];
        for (lci, &gci) in gcis.iter().enumerate() {
            qlt.set_qm(lci, t.idx, f.qm[gci], f.qm_min[gci], f.qm_max[gci], f.qm_prev[gci]);
        }
    }
    qlt.run().unwrap();
    for t in &tracers {
        for (lci, &gci) in gcis.iter().enumerate() {
            assert_eq!(
                qlt.get_qm(lci, t.idx).to_bits(),
                threaded[0][t.idx][gci].to_bits()
            );
        }
    }
}

#[test]
fn declaration_lifecycle_is_enforced() {
    let mesh = Mesh::new(4, 1, Decomp::Contiguous);
    let tree = make_tree(&mesh, false);
    let mut qlt = Qlt::new(Arc::new(SerialComm), 4, &tree).unwrap();
    // Unknown masks are rejected up front.
    assert!(qlt.declare_tracer(CONSERVE).is_err());
    assert!(qlt.declare_tracer(0).is_err());
    qlt.declare_tracer(SHAPEPRESERVE).unwrap();
    qlt.declare_tracer(CONSERVE | CONSISTENT).unwrap();
    qlt.end_tracer_declarations().unwrap();
    assert_eq!(qlt.get_num_tracers(), 2);
    assert_eq!(qlt.get_problem_type(0), ProblemKind::Shape);
    assert_eq!(qlt.get_problem_type(1), ProblemKind::ConserveConsistent);
    // Declaring or closing again is fatal to the call.
    assert!(qlt.declare_tracer(SHAPEPRESERVE).is_err());
    assert!(qlt.end_tracer_declarations().is_err());
}

#[test]
fn gci2lci_rejects_unowned_cells() {
    let errs = on_ranks(2, |p| {
        let mesh = Mesh::new(8, 2, Decomp::Contiguous);
        let tree = make_tree(&mesh, false);
        let qlt = Qlt::new(p, 8, &tree).unwrap();
        let gcis = qlt.get_owned_glblcells();
        assert_eq!(gcis.len(), qlt.nlclcells());
        let unowned = (0..8).find(|gci| !gcis.contains(gci)).unwrap();
        usize::from(qlt.gci2lci(unowned).is_ok())
    });
    assert_eq!(errs.iter().sum::<usize>(), 0);
}

#[test]
fn metrics_sink_sees_every_phase() {
    let mesh = Mesh::new(6, 1, Decomp::Contiguous);
    let tree = make_tree(&mesh, false);
    let metrics = Arc::new(MetricsTotals::new());
    let mut qlt = Qlt::with_kernel(
        Arc::new(SerialComm),
        6,
        &tree,
        qlt_tree::implementations::impl_solve::SerialKernel,
        Some(metrics.clone()),
    )
    .unwrap();
    qlt.declare_tracer(SHAPEPRESERVE | CONSISTENT).unwrap();
    qlt.end_tracer_declarations().unwrap();
    let gcis = qlt.get_owned_glblcells();
    for (lci, &gci) in gcis.iter().enumerate() {
        let v = qlt_tree::implementations::helpers::tracer_fixture(3, gci, 0);
        qlt.set_rhom(lci, v.rhom);
        qlt.set_qm(lci, 0, v.qm, v.qm_min, v.qm_max, v.qm_prev);
    }
    qlt.run().unwrap();
    assert_eq!(metrics.get(TimedOp::Analyze).1, 1);
    assert_eq!(metrics.get(TimedOp::L2r).1, 1);
    assert_eq!(metrics.get(TimedOp::R2l).1, 1);
    assert!(metrics.get(TimedOp::NodeProblems).1 > 0);
    assert!(metrics.get(TimedOp::Waitall).1 > 0);
}
