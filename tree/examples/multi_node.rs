// ? mpirun -n {{NPROCESSES}} target/debug/examples/multi_node

//! Drive the analysis invariants and an unperturbed reduction over real MPI
//! ranks. Build with `--features mpi` and launch under `mpirun`; every rank
//! prints its error count, which should be zero.

use std::sync::Arc;

use qlt_parallel::{MpiComm, Parallel};
use qlt_tree::implementations::helpers::{make_tree, tracer_fixture, Decomp, Mesh};
use qlt_tree::implementations::impl_analyze::{analyze, check_comm, check_leaf_nodes};
use qlt_tree::implementations::impl_qlt::Qlt;
use qlt_tree::types::problem::{CONSERVE, CONSISTENT, SHAPEPRESERVE};

fn main() {
    let _universe = mpi::initialize().expect("MPI init failed");
    let p = Arc::new(MpiComm::world());
    let nranks = p.size();
    let mut nerr = 0;

    for decomp in [Decomp::Contiguous, Decomp::Pseudorandom] {
        for imbalanced in [false, true] {
            let mesh = Mesh::new(42.max(3 * nranks), nranks, decomp);
            let tree = make_tree(&mesh, imbalanced);
            let ns = analyze(&*p, mesh.ncells(), &tree).expect("analyze");
            nerr += check_comm(&ns);
            nerr += check_leaf_nodes(&*p, &ns, mesh.ncells());
        }
    }

    // Feasible inputs must come back unchanged, whatever the rank count.
    let pts = [
        CONSERVE | SHAPEPRESERVE | CONSISTENT,
        SHAPEPRESERVE,
        CONSERVE | CONSISTENT,
        CONSISTENT,
    ];
    let mesh = Mesh::new(42.max(3 * nranks), nranks, Decomp::Pseudorandom);
    let tree = make_tree(&mesh, false);
    let mut qlt = Qlt::new(Arc::clone(&p), mesh.ncells(), &tree).expect("setup");
    for &pt in &pts {
        qlt.declare_tracer(pt).expect("declare");
    }
    qlt.end_tracer_declarations().expect("close");
    let gcis = qlt.get_owned_glblcells();
    for (lci, &gci) in gcis.iter().enumerate() {
        qlt.set_rhom(lci, tracer_fixture(7, gci, 0).rhom);
    }
    for ti in 0..pts.len() {
        for (lci, &gci) in gcis.iter().enumerate() {
            let v = tracer_fixture(7, gci, ti);
            qlt.set_qm(lci, ti, v.qm, v.qm_min, v.qm_max, v.qm_prev);
        }
    }
    qlt.run().expect("run");
    for ti in 0..pts.len() {
        for (lci, &gci) in gcis.iter().enumerate() {
            let v = tracer_fixture(7, gci, ti);
            if qlt.get_qm(lci, ti).to_bits() != v.qm.to_bits() {
                nerr += 1;
            }
        }
    }

    println!("rank {} of {}: {} errors", p.rank(), nranks, nerr);
}
