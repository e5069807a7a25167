#![allow(dead_code)]
use dist_assembly::algs::communicator::ThreadComm;
use dist_assembly::data::layout::Layout;
use std::sync::Arc;

/// Run `f` once per rank of a fresh `n`-rank thread world; results by rank.
pub fn run_ranks<R, F>(n: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(ThreadComm) -> R + Sync,
{
    let comms = ThreadComm::world(n);
    std::thread::scope(|s| {
        let f = &f;
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| s.spawn(move || f(comm)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect()
    })
}

/// Balanced layout of `n` entries over `p` ranks.
pub fn split(n: usize, p: usize) -> Arc<Layout> {
    Arc::new(Layout::split(n, p).unwrap())
}

/// Concatenate per-rank owned values into the global array.
pub fn concat(parts: Vec<Vec<f64>>) -> Vec<f64> {
    parts.into_iter().flatten().collect()
}
