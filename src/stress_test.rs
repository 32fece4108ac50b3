use async_stream::stream;
use futures::stream::Stream;
use futures::stream::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};
use weft_collab::{
    Annotation, AnnotationExtension, CollabExtension, CollabOptions, ExtensionRegistry,
    MemoryHub, MemoryProvider, Node, Provider, ProviderSource, Transaction,
};
use weft_doc::ClientId;

const FRAGMENT: &str = "prosemirror";

/// Statistics collected during stress testing
#[derive(Clone, Debug)]
pub struct StressTestStats {
    pub num_peers: usize,
    pub edits_per_peer: usize,
    pub total_syncs: usize,
    pub total_time: Duration,
    pub avg_sync_time: Duration,
    pub ops_per_second: f64,
    pub converged: bool,
    pub final_length: usize,
    pub annotations: usize,
}

impl StressTestStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Stress Test Statistics                         ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Number of Peers:           {:>38} ║", self.num_peers);
        println!("║  Edits per Peer:            {:>38} ║", self.edits_per_peer);
        println!("║  Total Sync Operations:     {:>38} ║", self.total_syncs);
        println!("║  Total Time:                {:>39}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("║  Average Sync Time:         {:>36}µs ║", format!("{:.2}", self.avg_sync_time.as_micros()));
        println!("║  Operations/Second:         {:>38.0} ║", self.ops_per_second);
        println!("║  Final Text Length:         {:>38} ║", self.final_length);
        println!("║  Live Annotations:          {:>38} ║", self.annotations);
        println!("║  Converged:                 {:>38} ║", self.converged);
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

/// One simulated editor.
struct StressPeer {
    provider: Arc<MemoryProvider>,
    editor: CollabExtension,
    annotations: Arc<AnnotationExtension>,
    rng: StdRng,
}

impl StressPeer {
    fn new(hub: &MemoryHub, client: u64, seed: u64) -> weft_collab::Result<Self> {
        let provider = MemoryProvider::new(hub, ClientId(client));
        let options = CollabOptions::builder()
            .provider(ProviderSource::instance(provider.clone()))
            .capture_timeout(Duration::ZERO)
            .build();
        let mut editor = CollabExtension::new(options)?;
        editor.create_plugins();

        let annotations = Arc::new(AnnotationExtension::new());
        let mut registry = ExtensionRegistry::new();
        registry.register(annotations.clone());
        editor.on_view(&registry);

        Ok(Self {
            provider,
            editor,
            annotations,
            rng: StdRng::seed_from_u64(seed ^ client),
        })
    }

    /// Drain the inbox and fold it into the editor.
    fn sync(&mut self) -> usize {
        let handled = self.provider.pump();
        self.editor.process();
        handled
    }

    /// Length of the first paragraph, if the peer has one yet.
    fn text_len(&self) -> Option<usize> {
        let state = self.editor.state()?;
        state.doc.children().first().map(Node::content_size)
    }

    /// Apply one random edit: typing, deleting, undoing or annotating.
    fn random_edit(&mut self) -> weft_collab::Result<()> {
        let Some(len) = self.text_len() else {
            return Ok(());
        };
        match self.rng.gen_range(0..10) {
            0..=5 => {
                let pos = 1 + self.rng.gen_range(0..=len);
                let ch = (b'a' + self.rng.gen_range(0..26u8)) as char;
                self.editor
                    .dispatch(Transaction::new().insert_text(pos, ch.to_string()))
            }
            6 | 7 if len > 0 => {
                let from = 1 + self.rng.gen_range(0..len);
                self.editor.dispatch(Transaction::new().delete(from, from + 1))
            }
            8 => {
                let undo = self.editor.y_undo();
                self.editor.run_command(&undo).map(|_| ())
            }
            _ if len >= 2 => {
                let from = 1 + self.rng.gen_range(0..len - 1);
                match self.annotations.store() {
                    Some(store) => store.add_annotation(Annotation::generate(from, from + 2)),
                    None => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }
}

/// Generator that yields peer indices for synchronization patterns
fn peer_sync_generator(num_peers: usize, num_syncs: usize, seed: u64) -> impl Stream<Item = (usize, usize)> {
    stream! {
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..num_syncs {
            let peer_a = rng.gen_range(0..num_peers);
            let peer_b = rng.gen_range(0..num_peers);
            yield (peer_a, peer_b);
        }
    }
}

/// Let two peers catch up with everything queued for them
async fn perform_sync(
    peers: &[Arc<Mutex<StressPeer>>],
    peer_a_idx: usize,
    peer_b_idx: usize,
    sync_times: &mut Vec<Duration>,
    total_syncs: &mut usize,
) {
    if peer_a_idx == peer_b_idx {
        return; // Skip self-sync
    }

    let sync_start = Instant::now();
    let (mut peer_a, mut peer_b) = tokio::join!(peers[peer_a_idx].lock(), peers[peer_b_idx].lock());
    while peer_a.sync() + peer_b.sync() > 0 {}
    drop(peer_a);
    drop(peer_b);

    sync_times.push(sync_start.elapsed());
    *total_syncs += 1;
}

/// Sync every peer until the hub is quiet.
async fn quiesce(peers: &[Arc<Mutex<StressPeer>>]) {
    loop {
        let mut handled = 0;
        for peer in peers {
            handled += peer.lock().await.sync();
        }
        if handled == 0 {
            break;
        }
    }
}

/// Concurrent editing across peers with random pairwise syncs, followed by
/// a convergence check of text and annotations.
pub async fn stress_test_editing(
    num_peers: usize,
    edits_per_peer: usize,
    num_syncs: usize,
    seed: u64,
) -> weft_collab::Result<StressTestStats> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Collaborative Editing Stress Test                   ║");
    println!("║  Peers: {} | Edits/Peer: {} | Syncs: {} ║",
             num_peers, edits_per_peer, num_syncs);
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();
    let hub = MemoryHub::new();

    let mut peers: Vec<Arc<Mutex<StressPeer>>> = Vec::with_capacity(num_peers);
    for idx in 0..num_peers {
        peers.push(Arc::new(Mutex::new(StressPeer::new(&hub, idx as u64 + 1, seed)?)));
    }
    if let Some(first) = peers.first() {
        let seed_doc = Transaction::new()
            .insert_node(0, Node::element("paragraph", vec![Node::text("weft")]))
            .without_history();
        first.lock().await.editor.dispatch(seed_doc)?;
    }
    quiesce(&peers).await;

    println!("\n[Phase 1/2] Editing on every peer...");

    // Phase 1: concurrent edits, no syncing
    let mut handles = vec![];
    for peer in peers.iter() {
        let peer = Arc::clone(peer);
        let handle = tokio::spawn(async move {
            let mut failures = 0usize;
            for i in 0..edits_per_peer {
                let mut peer = peer.lock().await;
                if let Err(err) = peer.random_edit() {
                    warn!(error = %err, "edit rejected");
                    failures += 1;
                }
                drop(peer);

                if i % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            failures
        });
        handles.push(handle);
    }

    let mut rejected = 0;
    for handle in handles {
        rejected += handle.await.unwrap_or(0);
    }

    println!("[Phase 1/2] ✓ Completed ({} edits rejected)", rejected);
    println!("[Phase 2/2] Synchronizing peers...");

    // Phase 2: random pairwise syncs, then a full round
    let mut sync_times = vec![];
    let mut sync_gen = Box::pin(peer_sync_generator(num_peers, num_syncs, seed));
    let mut total_syncs = 0;
    while let Some((peer_a_idx, peer_b_idx)) = sync_gen.next().await {
        perform_sync(&peers, peer_a_idx, peer_b_idx, &mut sync_times, &mut total_syncs).await;
    }
    quiesce(&peers).await;

    let mut snapshots = Vec::with_capacity(num_peers);
    for peer in &peers {
        let peer = peer.lock().await;
        let xml = peer.provider.doc().read().to_xml_string(FRAGMENT);
        let annotations = peer
            .annotations
            .store()
            .map(|store| store.format_annotations())
            .unwrap_or_default();
        snapshots.push((xml, annotations, peer.text_len().unwrap_or(0)));
    }
    let converged = snapshots.windows(2).all(|pair| pair[0].0 == pair[1].0 && pair[0].1 == pair[1].1);
    let (final_length, annotations) = snapshots
        .first()
        .map(|(_, annotations, len)| (*len, annotations.len()))
        .unwrap_or_default();

    let total_time = start.elapsed();

    // Calculate statistics
    let avg_sync_time = if !sync_times.is_empty() {
        sync_times.iter().sum::<Duration>() / sync_times.len() as u32
    } else {
        Duration::ZERO
    };

    let total_operations = (num_peers * edits_per_peer) + total_syncs;
    let ops_per_second = total_operations as f64 / total_time.as_secs_f64();

    println!("[Phase 2/2] ✓ Completed");
    info!(converged, final_length, annotations, "stress run finished");

    for peer in &peers {
        peer.lock().await.editor.on_destroy();
    }

    Ok(StressTestStats {
        num_peers,
        edits_per_peer,
        total_syncs,
        total_time,
        avg_sync_time,
        ops_per_second,
        converged,
        final_length,
        annotations,
    })
}
