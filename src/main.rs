use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use stress_test::stress_test_editing;
use weft_collab::{
    Annotation, AnnotationExtension, CollabExtension, CollabOptions, ExtensionRegistry, MemoryHub,
    MemoryProvider, Node, Provider, ProviderSource, Transaction,
};
use weft_doc::ClientId;
pub mod stress_test;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to start runtime: {}", err);
            std::process::exit(1);
        }
    };
    if let Err(err) = rt.block_on(async_main()) {
        eprintln!("run failed: {}", err);
        std::process::exit(1);
    }
}

struct DemoPeer {
    name: &'static str,
    provider: Arc<MemoryProvider>,
    editor: CollabExtension,
    annotations: Arc<AnnotationExtension>,
}

impl DemoPeer {
    fn new(hub: &MemoryHub, name: &'static str, client: u64) -> weft_collab::Result<Self> {
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
            name,
            provider,
            editor,
            annotations,
        })
    }

    fn print(&self) {
        let xml = self.provider.doc().read().to_xml_string("prosemirror");
        println!("  {:<6} {}", self.name, xml);
        for annotation in self.annotations.redraw_annotations() {
            println!("         [{}..{}] {} {}", annotation.from, annotation.to, annotation.id, json!(annotation.data));
        }
    }
}

fn settle(peers: &mut [&mut DemoPeer]) {
    while peers.iter().map(|peer| peer.provider.pump()).sum::<usize>() > 0 {}
    for peer in peers.iter_mut() {
        peer.editor.process();
    }
}

/// Two peers editing one paragraph, annotating it and undoing their own work.
fn demo_session() -> weft_collab::Result<()> {
    println!("\n── Two-peer session ─────────────────────────────────────────");
    let hub = MemoryHub::new();
    let mut alice = DemoPeer::new(&hub, "alice", 1)?;
    let mut bob = DemoPeer::new(&hub, "bob", 2)?;

    alice.editor.dispatch(
        Transaction::new().insert_node(0, Node::element("paragraph", vec![Node::text("Hello world")])),
    )?;
    settle(&mut [&mut alice, &mut bob]);

    if let Some(store) = alice.annotations.store() {
        store.add_annotation(Annotation::new("greeting", 1, 6).with("class", json!("highlight")))?;
    }
    bob.editor.dispatch(Transaction::new().insert_text(1, "Oh, "))?;
    alice.editor.dispatch(Transaction::new().insert_text(12, "!"))?;
    settle(&mut [&mut alice, &mut bob]);
    println!("after concurrent edits:");
    alice.print();
    bob.print();

    let undo = bob.editor.y_undo();
    let undone = bob.editor.run_command(&undo)?;
    settle(&mut [&mut alice, &mut bob]);
    println!("after bob's undo ({}):", undone);
    alice.print();
    bob.print();

    alice.editor.on_destroy();
    bob.editor.on_destroy();
    Ok(())
}

async fn async_main() -> weft_collab::Result<()> {
    demo_session()?;

    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            COLLABORATIVE EDITING STRESS TESTS               ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Test 1: a few peers, light editing
    let stats = stress_test_editing(3, 50, 100, 1).await?;
    stats.print();

    // Test 2: more peers, heavier editing
    let stats = stress_test_editing(8, 200, 500, 2).await?;
    stats.print();

    if !stats.converged {
        println!("\n✗ Peers diverged");
        std::process::exit(1);
    }
    println!("\n✓ All stress tests completed successfully!");
    Ok(())
}
