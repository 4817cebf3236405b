use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use embir::compiler::ir::{
    clone_graph, AluOperation, BuiltInType, ControlFlowGraphState, IrTransform, MethodDesc, Node,
    Operator, TransformationContext, TypeDesc, TypeKind, TypeSystemForIr,
};
use embir::compiler::{Optimizer, TargetLayout};

/// A straight-line method of `blocks` blocks with `per_block` additions each
fn build_graph(blocks: usize, per_block: usize) -> (TypeSystemForIr, ControlFlowGraphState) {
    let bridge = TypeSystemForIr::new(TargetLayout::default());
    let owner = bridge
        .register_type(TypeDesc::new("Bench", TypeKind::Reference))
        .unwrap();
    let i4 = bridge.builtin(BuiltInType::I4);
    let method = bridge
        .register_method(
            MethodDesc::new("Sum", owner, true)
                .with_parameters(vec![i4, i4])
                .with_return_type(i4),
        )
        .unwrap();
    let (mut cfg, args, _) = bridge
        .create_control_flow_graph_state(method, None, None)
        .unwrap();
    let ret = cfg.return_value().unwrap();

    let mut block = cfg.create_first_normal_basic_block().unwrap();
    for b in 0..blocks {
        for _ in 0..per_block {
            let t = cfg.allocate_temporary(i4).unwrap();
            cfg.add_operator(
                block,
                Operator::binary(AluOperation::Add, true, false, t, args[1], args[2]),
            )
            .unwrap();
            cfg.add_operator(block, Operator::assignment(ret, t)).unwrap();
        }
        if b + 1 < blocks {
            let ctl = cfg.control_operator(block).unwrap();
            block = cfg.split_at_operator(ctl, true).unwrap();
        }
    }
    (bridge, cfg)
}

struct Identity;

impl IrTransform for Identity {}

fn clone_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("clone_graph");

    for size in [4, 16, 64].iter() {
        let (_, cfg) = build_graph(*size, 8);
        group.bench_with_input(BenchmarkId::from_parameter(size), &cfg, |b, cfg| {
            b.iter(|| black_box(clone_graph(cfg).unwrap()))
        });
    }
    group.finish();
}

fn transform_benchmark(c: &mut Criterion) {
    let (_, mut cfg) = build_graph(16, 8);

    c.bench_function("identity walk 16x8", |b| {
        b.iter(|| {
            TransformationContext::new()
                .apply(black_box(&mut cfg), &mut Identity)
                .unwrap()
        })
    });
}

fn optimizer_benchmark(c: &mut Criterion) {
    let (bridge, cfg) = build_graph(16, 8);
    let optimizer = Optimizer::new(2);

    c.bench_function("optimize 16x8", |b| {
        b.iter(|| {
            let (mut copy, _) = clone_graph(&cfg).unwrap();
            black_box(optimizer.optimize(&bridge, &mut copy).unwrap())
        })
    });
}

criterion_group!(
    benches,
    clone_benchmark,
    transform_benchmark,
    optimizer_benchmark
);
criterion_main!(benches);
