use criterion::{criterion_group, criterion_main, Criterion};
use loom_core::{
    keys, ComponentDefinition, ComponentResolver, DocumentState, Node, NodeKind, ObjectTree,
    Parameter, ParameterKind, PropertyEdit, Rect,
};
use std::hint::black_box;
use uuid::Uuid;

fn card_definition() -> (ComponentDefinition, Uuid) {
    let mut template = ObjectTree::new();
    let root = template
        .insert(None, Node::new(NodeKind::ComponentTemplate))
        .unwrap();
    let mut title = Uuid::nil();
    for i in 0..16 {
        let id = template
            .insert(
                Some(root),
                Node::new(NodeKind::Text)
                    .with_bounds(Rect::new(0.0, i as f32 * 20.0, 200.0, 18.0))
                    .with_content("row")
                    .with_binding(keys::CONTENT, "title"),
            )
            .unwrap();
        if i == 0 {
            title = id;
        }
    }
    let mut definition = ComponentDefinition::new("Card", template);
    definition
        .add_parameter(Parameter::new("title", ParameterKind::Text, "Hello".into()))
        .unwrap();
    (definition, title)
}

fn bench_resolve_cached(c: &mut Criterion) {
    let (definition, title) = card_definition();
    let mut resolver = ComponentResolver::new();
    let def = resolver.register_definition(definition);
    let inst = resolver.create_instance(def).unwrap();

    c.bench_function("resolve_value_cached", |b| {
        b.iter(|| {
            black_box(resolver.resolve_value(inst, title, keys::CONTENT).unwrap());
        })
    });
}

fn bench_fan_out_1000(c: &mut Criterion) {
    let (definition, title) = card_definition();
    let mut resolver = ComponentResolver::new();
    let def = resolver.register_definition(definition);
    let instances: Vec<Uuid> = (0..1000).map(|_| resolver.create_instance(def).unwrap()).collect();

    c.bench_function("update_component_property_1000_instances", |b| {
        b.iter(|| {
            black_box(
                resolver
                    .update_component_property(def, "title", "Changed".into())
                    .unwrap(),
            );
            for inst in &instances {
                black_box(resolver.resolve_value(*inst, title, keys::CONTENT).unwrap());
            }
        })
    });
}

fn bench_materialize(c: &mut Criterion) {
    let mut state = DocumentState::new();
    let client = Uuid::new_v4();
    let root = Uuid::new_v4();
    let mut seq = 0u64;
    let mut put = |state: &mut DocumentState, id: Uuid, key: &str, value: loom_core::PropertyValue| {
        seq += 1;
        state.apply_sequenced(&PropertyEdit::local(client, seq, id, key, value).with_sequence(seq));
    };
    put(&mut state, root, keys::KIND, "container".into());
    for i in 0..1000 {
        let id = Uuid::new_v4();
        put(&mut state, id, keys::PARENT, root.into());
        put(&mut state, id, keys::INDEX, f64::from(i).into());
        put(&mut state, id, keys::WIDTH, 10.0f64.into());
    }

    c.bench_function("materialize_1000_nodes", |b| {
        b.iter(|| {
            black_box(ObjectTree::materialize(black_box(&state)));
        })
    });
}

criterion_group!(benches, bench_resolve_cached, bench_fan_out_1000, bench_materialize);
criterion_main!(benches);
