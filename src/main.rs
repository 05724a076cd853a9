//! Native demo: records the item ids given on the command line and prints
//! the resulting history, newest first.
//!
//! ```text
//! RUST_LOG=debug view-history /gallery/1 /gallery/2 /gallery/1
//! ```

#[cfg(not(target_arch = "wasm32"))]
fn main() {
    use futures_executor::block_on;
    use view_history::{
        platform, DisabledReporter, HistoryConfig, MemoryViewStore, ViewHistory, ViewMetadata,
    };

    env_logger::init();

    let history = ViewHistory::new(
        MemoryViewStore::new(),
        DisabledReporter,
        HistoryConfig::load(),
        false,
    );
    if !block_on(history.start()) {
        eprintln!("view history store unavailable");
        std::process::exit(1);
    }

    for id in std::env::args().skip(1) {
        history.record_view(id, ViewMetadata::default());
    }
    platform::run_until_stalled();

    for record in block_on(history.get_all_viewed()) {
        let state = if record.synced { "synced" } else { "pending" };
        println!("{}\t{}\t{}", record.timestamp, state, record.id);
    }

    let stats = history.stats();
    println!(
        "{} write(s) in {} batch(es), {:.1} per batch",
        stats.total_writes, stats.batches_processed, stats.average_batch_size
    );
}

// WASM hosts use the library directly - main is not called on wasm32
#[cfg(target_arch = "wasm32")]
fn main() {}
