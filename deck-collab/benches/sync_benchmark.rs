use criterion::{criterion_group, criterion_main, Criterion};
use deck_collab::coalesce::{CoalesceKey, Coalescer, UpdateKind};
use deck_collab::protocol::{ClientEvent, ServerEvent};
use deck_collab::reconcile;
use deck_collab::store::{PresentationStore, StoreView};
use deck_core::{Presentation, Role, Slide, TextBlock, User};
use std::hint::black_box;
use std::time::Duration;
use tokio::time::Instant;

/// 50 slides × 20 blocks.
fn large_deck() -> Presentation {
    let mut p = Presentation::new("Bench", User::new("alice", Role::Creator));
    p.slides.clear();
    for s in 0..50 {
        let mut slide = Slide::new(format!("Slide {s}"));
        slide.id = format!("s{s}");
        for b in 0..20 {
            let mut block = TextBlock::new(format!("Block {b} on slide {s}"), b as f64, s as f64);
            block.id = format!("s{s}-b{b}");
            slide.blocks.push(block);
        }
        p.slides.push(slide);
    }
    p
}

fn loaded_view() -> StoreView {
    let view = StoreView {
        nickname: "alice".into(),
        ..StoreView::default()
    };
    reconcile::transition(&view, &ServerEvent::PresentationData(large_deck()))
        .unwrap_or(view)
}

fn bench_block_updated_transition(c: &mut Criterion) {
    let view = loaded_view();
    let event = ServerEvent::BlockUpdated {
        slide_id: "s25".into(),
        block: TextBlock {
            id: "s25-b10".into(),
            ..TextBlock::new("edited", 1.0, 1.0)
        },
    };

    c.bench_function("reconcile_block_updated_1000_blocks", |b| {
        b.iter(|| black_box(reconcile::transition(black_box(&view), black_box(&event))))
    });
}

fn bench_duplicate_apply(c: &mut Criterion) {
    let store = PresentationStore::new("alice");
    store.replace(large_deck());
    let block = store.snapshot().and_then(|p| p.block("s3", "s3-b3").cloned());
    let Some(block) = block else {
        return;
    };
    let event = ServerEvent::BlockUpdated {
        slide_id: "s3".into(),
        block,
    };

    c.bench_function("reconcile_apply_duplicate", |b| {
        b.iter(|| black_box(reconcile::apply(&store, black_box(&event))))
    });
}

fn bench_server_event_decode(c: &mut Criterion) {
    let frame = ServerEvent::PresentationData(large_deck()).encode().unwrap();
    c.bench_function("decode_presentation_data_1000_blocks", |b| {
        b.iter(|| black_box(ServerEvent::decode(black_box(&frame)).unwrap()))
    });
}

fn bench_update_encode(c: &mut Criterion) {
    let event = ClientEvent::UpdateBlock {
        presentation_id: "p1".into(),
        slide_id: "s1".into(),
        block: TextBlock::default(),
    };
    c.bench_function("encode_update_block", |b| {
        b.iter(|| black_box(black_box(&event).encode().unwrap()))
    });
}

fn bench_coalesce_burst(c: &mut Criterion) {
    let keys: Vec<CoalesceKey> = (0..100)
        .map(|i| CoalesceKey::new(format!("b{i}"), UpdateKind::Position))
        .collect();

    c.bench_function("coalesce_1000_offers_100_keys", |b| {
        b.iter(|| {
            let t0 = Instant::now();
            let mut coalescer = Coalescer::new(Duration::from_millis(100));
            for i in 0..1000usize {
                coalescer.offer(keys[i % keys.len()].clone(), i, t0);
            }
            black_box(coalescer.take_due(t0 + Duration::from_millis(100)))
        })
    });
}

criterion_group!(
    benches,
    bench_block_updated_transition,
    bench_duplicate_apply,
    bench_server_event_decode,
    bench_update_encode,
    bench_coalesce_burst,
);
criterion_main!(benches);
