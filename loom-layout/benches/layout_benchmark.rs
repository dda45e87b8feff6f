use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use loom_core::{
    Anchor, AutoLayout, ChildSizing, Constraints, Node, NodeKind, ObjectTree, Rect, Size,
    SizingMode,
};
use loom_layout::LayoutEngine;
use std::hint::black_box;
use uuid::Uuid;

fn flow_tree(n: usize) -> (ObjectTree, Uuid) {
    let mut tree = ObjectTree::new();
    let root = tree
        .insert(
            None,
            Node::new(NodeKind::Container)
                .with_bounds(Rect::new(0.0, 0.0, 10_000.0, 100.0))
                .with_auto_layout(AutoLayout::horizontal(4.0)),
        )
        .unwrap();
    for i in 0..n {
        let sizing = if i % 3 == 0 {
            ChildSizing::new(SizingMode::Fill, SizingMode::Fixed)
        } else {
            ChildSizing::default()
        };
        tree.insert(
            Some(root),
            Node::new(NodeKind::Shape)
                .with_bounds(Rect::new(0.0, 0.0, 8.0, 50.0))
                .with_sizing(sizing),
        )
        .unwrap();
    }
    (tree, root)
}

fn constraint_tree(n: usize) -> (ObjectTree, Uuid) {
    let mut tree = ObjectTree::new();
    let root = tree
        .insert(
            None,
            Node::new(NodeKind::Container).with_bounds(Rect::new(0.0, 0.0, 1_000.0, 1_000.0)),
        )
        .unwrap();
    let anchors = [Anchor::Leading, Anchor::Trailing, Anchor::Center, Anchor::Scale];
    for i in 0..n {
        tree.insert(
            Some(root),
            Node::new(NodeKind::Shape)
                .with_bounds(Rect::new(i as f32, i as f32, 10.0, 10.0))
                .with_constraints(Constraints::new(anchors[i % 4], anchors[(i + 1) % 4])),
        )
        .unwrap();
    }
    (tree, root)
}

/// Flow layout for a container with N children
fn bench_flow(c: &mut Criterion) {
    let mut group = c.benchmark_group("auto_layout_flow");
    for count in [100, 1_000] {
        let (tree, root) = flow_tree(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            let mut engine = LayoutEngine::new();
            b.iter(|| black_box(engine.layout(&tree, root).unwrap()));
        });
    }
    group.finish();
}

/// Constraint resolution after a parent resize
fn bench_constraints(c: &mut Criterion) {
    let mut group = c.benchmark_group("constraint_resize");
    for count in [100, 1_000] {
        let (tree, root) = constraint_tree(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            let mut engine = LayoutEngine::new();
            b.iter(|| {
                black_box(engine.resize(&tree, root, Size::new(1_500.0, 800.0)).unwrap())
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_flow, bench_constraints);
criterion_main!(benches);
