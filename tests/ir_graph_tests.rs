//! End-to-end tests of the IR public API
//!
//! Graphs are built through the type-system bridge, rewritten with
//! transforms, cloned, inlined and finally compiled by the driver.

use embir::compiler::ir::{
    clone_graph, AluOperation, BuiltInType, CloningContext, ConstantValue, ControlFlowGraphState,
    EdgeClass, ExceptionFlag, ExprId, IdentityConverter, IrTransform, MethodDesc, MethodId, Node,
    Operator, OperatorKind, TransformationContext, TypeDesc, TypeId, TypeKind, TypeSystemForIr,
};
use embir::compiler::{dump_ir, CompileOptions, Compiler, FailurePolicy, TargetLayout};
use embir::{Error, ErrorSeverity};

// =============================================================================
// FIXTURES
// =============================================================================

struct Fixture {
    bridge: TypeSystemForIr,
    math: TypeId,
    i4: TypeId,
    add: MethodId,
    twice: MethodId,
}

fn fixture() -> Fixture {
    let bridge = TypeSystemForIr::new(TargetLayout::default());
    let math = bridge
        .register_type(TypeDesc::new("Math", TypeKind::Reference))
        .unwrap();
    let i4 = bridge.builtin(BuiltInType::I4);
    let add = bridge
        .register_method(
            MethodDesc::new("Add", math, true)
                .with_parameters(vec![i4, i4])
                .with_parameter_names(vec!["a", "b"])
                .with_return_type(i4),
        )
        .unwrap();
    let twice = bridge
        .register_method(
            MethodDesc::new("Twice", math, true)
                .with_parameters(vec![i4])
                .with_parameter_names(vec!["x"])
                .with_locals(vec![i4])
                .with_return_type(i4),
        )
        .unwrap();
    Fixture {
        bridge,
        math,
        i4,
        add,
        twice,
    }
}

/// `ReturnValue = a + b`
fn build_add(f: &Fixture) -> ControlFlowGraphState {
    let (mut cfg, args, _) = f.bridge.create_control_flow_graph_state(f.add, None, None).unwrap();
    let body = cfg.create_first_normal_basic_block().unwrap();
    let ret = cfg.return_value().unwrap();
    cfg.add_operator(
        body,
        Operator::binary(AluOperation::Add, true, false, ret, args[1], args[2]),
    )
    .unwrap();
    cfg
}

/// `t = x / 2` inside a catch clause; the handler returns zero.
fn build_guarded_division(f: &Fixture) -> ControlFlowGraphState {
    let (mut cfg, args, locals) = f
        .bridge
        .create_control_flow_graph_state(f.twice, None, Some(&["t"]))
        .unwrap();
    let body = cfg.create_first_normal_basic_block().unwrap();
    let ret = cfg.return_value().unwrap();
    let two = f.bridge.create_constant(&mut cfg, f.i4, ConstantValue::Int(2)).unwrap();
    let zero = f.bridge.create_constant(&mut cfg, f.i4, ConstantValue::Int(0)).unwrap();
    cfg.add_operator(
        body,
        Operator::binary(AluOperation::Div, true, false, locals[0], args[1], two),
    )
    .unwrap();
    cfg.add_operator(body, Operator::assignment(ret, locals[0])).unwrap();

    let object = f.bridge.builtin(BuiltInType::Object);
    let (_, handler) = cfg
        .add_exception_clause(ExceptionFlag::Catch, &[body], Some(object))
        .unwrap();
    cfg.add_operator(handler, Operator::assignment(ret, zero)).unwrap();
    cfg.add_operator(handler, Operator::unconditional(cfg.exit_block()))
        .unwrap();
    cfg
}

// =============================================================================
// CONSTRUCTION
// =============================================================================

#[test]
fn test_bridge_builds_wired_graph() {
    let f = fixture();
    let (cfg, args, locals) = f.bridge.create_control_flow_graph_state(f.twice, None, None).unwrap();

    assert_eq!(args.len(), 2);
    assert_eq!(locals.len(), 1);
    assert_eq!(cfg.method_name(), "Math::Twice");
    assert_eq!(cfg.expression(args[0]).unwrap().ty(), f.math);
    assert_eq!(cfg.variable_debug_info(args[1]).unwrap().name, "x");

    let edges = cfg.successors(cfg.entry_block());
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].to, cfg.exit_block());
    assert!(cfg.successors(cfg.exit_block()).is_empty());
}

#[test]
fn test_control_operator_stays_last() {
    let f = fixture();
    let mut cfg = build_add(&f);
    let body = cfg.successors(cfg.entry_block())[0].to;
    let extra = cfg.allocate_temporary(f.i4).unwrap();
    cfg.add_operator(body, Operator::assignment(extra, cfg.arguments()[1]))
        .unwrap();

    let ops = cfg.block(body).unwrap().operators().to_vec();
    assert_eq!(ops.len(), 3);
    assert_eq!(cfg.control_operator(body), ops.last().copied());

    let second = cfg.add_operator(body, Operator::unconditional(cfg.exit_block()));
    assert!(matches!(second, Err(Error::Structural { .. })));
}

#[test]
fn test_version_increases_with_every_mutation() {
    let f = fixture();
    let mut cfg = build_add(&f);
    let before = cfg.version();
    cfg.allocate_temporary(f.i4).unwrap();
    let after_alloc = cfg.version();
    cfg.create_normal_block().unwrap();
    assert!(after_alloc > before);
    assert!(cfg.version() > after_alloc);
}

#[test]
fn test_exception_edges_follow_throwing_operators() {
    let f = fixture();
    let cfg = build_guarded_division(&f);
    let body = cfg.successors(cfg.entry_block())[0].to;
    let clause = cfg.clauses()[0];
    let handler = cfg.clause(clause).unwrap().handler();

    let edges = cfg.successors(body);
    let exceptional: Vec<_> = edges
        .iter()
        .filter(|e| e.class == EdgeClass::Exception)
        .collect();
    assert_eq!(exceptional.len(), 1);
    assert_eq!(exceptional[0].to, handler);
    assert_eq!(exceptional[0].origins, vec![0]);

    assert!(cfg
        .predecessors(handler)
        .iter()
        .any(|e| e.from == body && e.class == EdgeClass::Exception));
    assert!(cfg.reachable_blocks().contains(&handler));
}

#[test]
fn test_partially_overlapping_clause_rejected() {
    let f = fixture();
    let mut cfg = build_add(&f);
    let first = cfg.successors(cfg.entry_block())[0].to;
    let ctl = cfg.control_operator(first).unwrap();
    let second = cfg.split_at_operator(ctl, true).unwrap();
    let third = cfg.create_normal_block().unwrap();
    cfg.add_operator(third, Operator::unconditional(cfg.exit_block()))
        .unwrap();

    cfg.add_exception_clause(ExceptionFlag::Fault, &[first, second], None)
        .unwrap();
    cfg.add_exception_clause(ExceptionFlag::Finally, &[first], None)
        .unwrap();
    let overlap = cfg.add_exception_clause(ExceptionFlag::Catch, &[second, third], None);
    assert!(matches!(overlap, Err(Error::Structural { .. })));
    assert_eq!(cfg.clauses().len(), 2);
}

// =============================================================================
// FINALIZATION
// =============================================================================

#[test]
fn test_finalize_freezes_graph() {
    let f = fixture();
    let mut cfg = build_guarded_division(&f);
    cfg.finalize().unwrap();
    assert!(cfg.is_finalized());

    let err = cfg.allocate_temporary(f.i4).unwrap_err();
    assert_eq!(err.classify(), ErrorSeverity::RunFatal);

    let text = dump_ir(&cfg, Some(&f.bridge));
    assert!(text.contains("[finalized"));
    assert!(text.contains("t = x div $Const(I4 2)"));
}

#[test]
fn test_finalize_rejects_block_without_control_operator() {
    let f = fixture();
    let mut cfg = build_add(&f);
    let body = cfg.successors(cfg.entry_block())[0].to;
    let ctl = cfg.control_operator(body).unwrap();
    cfg.split_at_operator(ctl, false).unwrap();

    let err = cfg.finalize().unwrap_err();
    assert_eq!(err.classify(), ErrorSeverity::MethodFatal);
    assert!(!cfg.is_finalized());
}

// =============================================================================
// TRANSFORMS
// =============================================================================

struct AddToMul;

impl IrTransform for AddToMul {
    fn transform(
        &mut self,
        _cfg: &ControlFlowGraphState,
        _ctx: &TransformationContext,
        node: Node,
    ) -> embir::Result<Node> {
        Ok(match node {
            Node::Alu(AluOperation::Add) => Node::Alu(AluOperation::Mul),
            other => other,
        })
    }
}

struct Rename {
    from: ExprId,
    to: ExprId,
    seen_inside_operator: usize,
}

impl IrTransform for Rename {
    fn transform(
        &mut self,
        _cfg: &ControlFlowGraphState,
        ctx: &TransformationContext,
        node: Node,
    ) -> embir::Result<Node> {
        if let Node::Expression(e) = node {
            if ctx.parent_operator().is_some() {
                self.seen_inside_operator += 1;
            }
            if e == self.from {
                return Ok(Node::Expression(self.to));
            }
        }
        Ok(node)
    }
}

struct ReplaceBlocks;

impl IrTransform for ReplaceBlocks {
    fn transform(
        &mut self,
        cfg: &ControlFlowGraphState,
        _ctx: &TransformationContext,
        node: Node,
    ) -> embir::Result<Node> {
        Ok(match node {
            Node::Block(_) => Node::Block(cfg.exit_block()),
            other => other,
        })
    }
}

#[test]
fn test_transform_rewrites_operator_kind() {
    let f = fixture();
    let mut cfg = build_add(&f);
    let changed = TransformationContext::new().apply(&mut cfg, &mut AddToMul).unwrap();
    assert_eq!(changed, 1);
    assert!(dump_ir(&cfg, Some(&f.bridge)).contains("ReturnValue = a mul b"));

    // Nothing left to rewrite
    let again = TransformationContext::new().apply(&mut cfg, &mut AddToMul).unwrap();
    assert_eq!(again, 0);
}

#[test]
fn test_transform_substitutes_expressions() {
    let f = fixture();
    let mut cfg = build_add(&f);
    let (a, b) = (cfg.arguments()[1], cfg.arguments()[2]);
    let mut rename = Rename {
        from: b,
        to: a,
        seen_inside_operator: 0,
    };
    let changed = TransformationContext::new().apply(&mut cfg, &mut rename).unwrap();
    assert_eq!(changed, 1);
    assert!(rename.seen_inside_operator > 0);
    assert!(cfg.uses_of(b).is_empty());
    assert_eq!(cfg.uses_of(a).len(), 1);
}

#[test]
fn test_transform_cannot_replace_layout_blocks() {
    let f = fixture();
    let mut cfg = build_add(&f);
    let err = TransformationContext::new()
        .apply(&mut cfg, &mut ReplaceBlocks)
        .unwrap_err();
    assert!(matches!(err, Error::ContractViolation { .. }));
}

#[test]
fn test_read_only_walk_on_finalized_graph() {
    let f = fixture();
    let mut cfg = build_add(&f);
    cfg.finalize().unwrap();
    let version = cfg.version();

    let mut rename = Rename {
        from: cfg.arguments()[0],
        to: cfg.arguments()[0],
        seen_inside_operator: 0,
    };
    let changed = TransformationContext::new().apply(&mut cfg, &mut rename).unwrap();
    assert_eq!(changed, 0);
    assert_eq!(cfg.version(), version);
}

// =============================================================================
// CLONING AND INLINING
// =============================================================================

#[test]
fn test_clone_graph_is_equivalent() {
    let f = fixture();
    let mut source = build_guarded_division(&f);
    source.finalize().unwrap();

    let (clone, map) = clone_graph(&source).unwrap();
    assert!(!clone.is_finalized());
    assert_eq!(map.check_equivalent(&source, &clone), Ok(()));
    assert_eq!(clone.clauses().len(), 1);
    // Only the state in the header differs
    let body = |cfg: &ControlFlowGraphState| {
        dump_ir(cfg, Some(&f.bridge))
            .lines()
            .skip(1)
            .map(str::to_string)
            .collect::<Vec<_>>()
    };
    assert_eq!(body(&clone), body(&source));
}

#[test]
fn test_mutating_clone_leaves_source_alone() {
    let f = fixture();
    let source = build_add(&f);
    let (mut clone, _) = clone_graph(&source).unwrap();
    let text = dump_ir(&source, Some(&f.bridge));

    let block = clone.create_normal_block().unwrap();
    clone
        .add_operator(block, Operator::unconditional(clone.exit_block()))
        .unwrap();
    assert_eq!(dump_ir(&source, Some(&f.bridge)), text);
    assert_eq!(clone.blocks().len(), source.blocks().len() + 1);
}

#[test]
fn test_inline_callee_into_caller() {
    let f = fixture();
    let mut callee = build_add(&f);
    callee.finalize().unwrap();

    let (mut caller, args, locals) = f.bridge.create_control_flow_graph_state(f.twice, None, None).unwrap();
    let body = caller.create_first_normal_basic_block().unwrap();
    let ret = caller.return_value().unwrap();
    let call = f
        .bridge
        .create_direct_call(&mut caller, f.add, &[args[1], args[1]])
        .unwrap();
    let call = caller.add_operator(body, call).unwrap();
    assert!(matches!(
        caller.operator(call).unwrap().kind(),
        OperatorKind::DirectSubroutine { .. }
    ));

    // Replace the call with the callee body
    let call_args = caller.operator(call).unwrap().arguments().to_vec();
    let continuation = caller.split_at_operator(call, false).unwrap();
    caller.remove_operator(call).unwrap();

    let mut identity = IdentityConverter;
    let inlined = CloningContext::new(&mut identity)
        .clone_into(&callee, &mut caller, &call_args)
        .unwrap();
    caller
        .add_operator(body, Operator::unconditional(inlined.entry))
        .unwrap();
    let result = inlined.return_value.unwrap();
    caller
        .add_operator(inlined.exit, Operator::assignment(locals[0], result))
        .unwrap();
    caller
        .add_operator(inlined.exit, Operator::unconditional(continuation))
        .unwrap();
    let ctl = caller.control_operator(continuation).unwrap();
    caller
        .insert_operator_before(ctl, Operator::assignment(ret, locals[0]))
        .unwrap();

    assert!(caller.reachable_blocks().contains(&inlined.exit));
    assert_eq!(inlined.map.blocks.len(), callee.blocks().len());
    caller.finalize().unwrap();
    let text = dump_ir(&caller, Some(&f.bridge));
    // Parameters are bound through fresh temporaries
    assert!(text.contains("a = x"));
    assert!(text.contains("b = x"));
    assert!(text.contains("a add b"));
}

/// `x = x + 1; ReturnValue = x`
fn build_increment(f: &Fixture) -> ControlFlowGraphState {
    let (mut cfg, args, _) = f.bridge.create_control_flow_graph_state(f.twice, None, None).unwrap();
    let body = cfg.create_first_normal_basic_block().unwrap();
    let ret = cfg.return_value().unwrap();
    let one = f.bridge.create_constant(&mut cfg, f.i4, ConstantValue::Int(1)).unwrap();
    cfg.add_operator(
        body,
        Operator::binary(AluOperation::Add, true, false, args[1], args[1], one),
    )
    .unwrap();
    cfg.add_operator(body, Operator::assignment(ret, args[1])).unwrap();
    cfg
}

#[test]
fn test_inlined_parameter_writes_stay_in_callee() {
    let f = fixture();
    let mut callee = build_increment(&f);
    callee.finalize().unwrap();

    let (mut caller, _, locals) = f
        .bridge
        .create_control_flow_graph_state(f.twice, None, Some(&["t"]))
        .unwrap();
    let body = caller.create_first_normal_basic_block().unwrap();
    let five = f.bridge.create_constant(&mut caller, f.i4, ConstantValue::Int(5)).unwrap();
    let type_pointer = f.bridge.create_null_pointer(&mut caller, f.math).unwrap();

    // Inline twice: once over a caller local, once over a constant
    let mut tail = body;
    for bound in [locals[0], five] {
        let ctl = caller.control_operator(tail).unwrap();
        let next = caller.split_at_operator(ctl, false).unwrap();
        let mut identity = IdentityConverter;
        let inlined = CloningContext::new(&mut identity)
            .clone_into(&callee, &mut caller, &[type_pointer, bound])
            .unwrap();
        caller
            .add_operator(tail, Operator::unconditional(inlined.entry))
            .unwrap();
        caller
            .add_operator(inlined.exit, Operator::unconditional(next))
            .unwrap();
        tail = next;
    }

    let writes_to = |target: ExprId| {
        caller
            .live_operators()
            .into_iter()
            .filter(|&op| caller.operator(op).unwrap().results().contains(&target))
            .count()
    };
    assert_eq!(writes_to(locals[0]), 0);
    assert_eq!(writes_to(five), 0);
    caller.finalize().unwrap();
}

#[test]
fn test_inline_rejects_wrong_arity() {
    let f = fixture();
    let callee = build_add(&f);
    let (mut caller, args, _) = f.bridge.create_control_flow_graph_state(f.twice, None, None).unwrap();

    let mut identity = IdentityConverter;
    let err = CloningContext::new(&mut identity)
        .clone_into(&callee, &mut caller, &args)
        .unwrap_err();
    assert!(matches!(err, Error::ContractViolation { .. }));
}

// =============================================================================
// DRIVER
// =============================================================================

#[test]
fn test_compiler_runs_every_method() {
    let f = fixture();
    let graphs = vec![build_add(&f), build_guarded_division(&f), build_add(&f)];
    let options = CompileOptions {
        max_parallelism: Some(2),
        verify_after_each_pass: true,
        ..CompileOptions::default()
    };

    let report = Compiler::new(options).run(&f.bridge, graphs).unwrap();
    assert_eq!(report.compiled_count(), 3);
    assert_eq!(report.skipped_count(), 0);
    assert!(report.outcomes.iter().all(|o| o.is_compiled()));
    assert_eq!(report.outcomes[1].method(), f.twice);
}

#[test]
fn test_compiler_skips_broken_method() {
    let f = fixture();
    let mut broken = build_add(&f);
    let body = broken.successors(broken.entry_block())[0].to;
    let ctl = broken.control_operator(body).unwrap();
    broken.split_at_operator(ctl, false).unwrap();

    let options = CompileOptions {
        opt_level: 0,
        max_parallelism: Some(1),
        ..CompileOptions::default()
    };
    let report = Compiler::new(options.clone())
        .run(&f.bridge, vec![build_add(&f), clone_graph(&broken).unwrap().0])
        .unwrap();
    assert_eq!(report.compiled_count(), 1);
    assert_eq!(report.skipped_count(), 1);

    let abort = CompileOptions {
        failure_policy: FailurePolicy::AbortBuild,
        ..options
    };
    let err = Compiler::new(abort)
        .run(&f.bridge, vec![build_add(&f), broken])
        .unwrap_err();
    assert!(matches!(err, Error::CompilationFailure { .. }));
    assert_eq!(err.classify(), ErrorSeverity::MethodFatal);
}
