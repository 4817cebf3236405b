//! Debug utilities for IR graphs
//!
//! Operators render themselves through [`IntermediateRepresentationDumper`]
//! with `{n}` placeholders; the dumper decides how expressions, blocks and
//! descriptors are named. [`TextDumper`] names them against one graph and,
//! when available, the type-system bridge.

use super::ir::{
    BlockId, ControlFlowGraphState, ExprId, Expression, FieldId, MethodId, TypeId, TypeSystemForIr,
    VariableKind,
};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::collections::HashSet;
use std::fmt::Write;

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\{(\d+)\}").expect("placeholder pattern is valid");
}

/// A positional argument of a format string
#[derive(Debug, Clone, PartialEq)]
pub enum DumpArg {
    Expr(ExprId),
    Block(BlockId),
    Method(MethodId),
    Type(TypeId),
    Field(FieldId),
    Text(String),
}

/// Textual formatting contract used by operator rendering.
pub trait IntermediateRepresentationDumper {
    /// Printable form of one argument
    fn resolve(&self, arg: &DumpArg) -> String;

    /// Substitute `{n}` with `args[n]`. Out-of-range placeholders stay as written.
    fn format_output(&self, fmt: &str, args: &[DumpArg]) -> String {
        PLACEHOLDER
            .replace_all(fmt, |caps: &Captures| {
                caps[1]
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| args.get(i))
                    .map(|arg| self.resolve(arg))
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    fn format_output1(&self, fmt: &str, a0: DumpArg) -> String {
        self.format_output(fmt, &[a0])
    }

    fn format_output2(&self, fmt: &str, a0: DumpArg, a1: DumpArg) -> String {
        self.format_output(fmt, &[a0, a1])
    }

    fn format_output3(&self, fmt: &str, a0: DumpArg, a1: DumpArg, a2: DumpArg) -> String {
        self.format_output(fmt, &[a0, a1, a2])
    }
}

/// Names nodes of one graph
pub struct TextDumper<'a> {
    cfg: &'a ControlFlowGraphState,
    bridge: Option<&'a TypeSystemForIr>,
}

impl<'a> TextDumper<'a> {
    pub fn new(cfg: &'a ControlFlowGraphState) -> Self {
        Self { cfg, bridge: None }
    }

    /// Resolve descriptor names through `bridge`
    pub fn with_bridge(mut self, bridge: &'a TypeSystemForIr) -> Self {
        self.bridge = Some(bridge);
        self
    }

    fn type_name(&self, ty: TypeId) -> String {
        match self.bridge {
            Some(bridge) => bridge.type_name(ty),
            None => format!("type{}", ty),
        }
    }

    fn method_name(&self, method: MethodId) -> String {
        self.bridge
            .and_then(|b| b.method_desc(method).ok().map(|md| md.name.clone()))
            .unwrap_or_else(|| format!("method{}", method))
    }

    fn field_name(&self, field: FieldId) -> String {
        self.bridge
            .and_then(|b| b.field_desc(field).ok().map(|fd| fd.name.clone()))
            .unwrap_or_else(|| format!("field{}", field))
    }

    /// `$Local_3`, the debug name when one is attached, or `$Const(I4 5)`
    pub fn expression_name(&self, expr: ExprId) -> String {
        match self.cfg.expression(expr) {
            None => format!("<dangling {}>", expr),
            Some(Expression::Constant(c)) => {
                format!("$Const({} {})", self.type_name(c.ty()), c.value())
            }
            Some(Expression::Variable(v)) => {
                if let Some(info) = self.cfg.variable_debug_info(expr) {
                    return info.name.clone();
                }
                let prefix = match v.kind() {
                    VariableKind::Argument(_) => "$Arg",
                    VariableKind::Local => "$Local",
                    VariableKind::Temporary => "$Temp",
                    VariableKind::ExceptionObject => "$Exc",
                    VariableKind::Phi(_) => "$Phi",
                };
                match self.cfg.variable_index(expr) {
                    Some(index) => format!("{}_{}", prefix, index),
                    None => format!("{}{}", prefix, expr),
                }
            }
        }
    }

    /// Whole-graph listing: variable table, then blocks with their
    /// operators, protection and edges, then the clause table.
    pub fn dump(&self) -> String {
        let cfg = self.cfg;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "method {} [{}, version {}]",
            cfg.method_name(),
            cfg.state(),
            cfg.version()
        );

        let mut referenced: HashSet<ExprId> = HashSet::new();
        for op in cfg.live_operators() {
            if let Some(operator) = cfg.operator(op) {
                referenced.extend(operator.results());
                referenced.extend(operator.arguments());
            }
        }
        referenced.extend(cfg.return_value());
        for variable in cfg.variables() {
            let ty = cfg
                .expression(variable)
                .map(|e| self.type_name(e.ty()))
                .unwrap_or_default();
            let prefix = if referenced.contains(&variable) {
                "var"
            } else {
                "unused var"
            };
            let _ = writeln!(out, "  {} {} : {}", prefix, self.expression_name(variable), ty);
        }

        for &block in cfg.blocks() {
            let Some(bb) = cfg.block(block) else { continue };
            let _ = writeln!(out);
            let _ = writeln!(out, "{}:", cfg.label(block));
            if !bb.protected_by().is_empty() {
                let handlers: Vec<String> = bb
                    .protected_by()
                    .iter()
                    .filter_map(|c| cfg.clause(*c))
                    .map(|c| cfg.label(c.handler()))
                    .collect();
                let _ = writeln!(out, "  .protected by {}", handlers.join(", "));
            }
            for &op in bb.operators() {
                if let Some(operator) = cfg.operator(op) {
                    let _ = writeln!(out, "  {}", operator.format_output(self));
                }
            }
            for edge in cfg.successors(block) {
                let _ = writeln!(out, "  .edge {} -> {}", edge.class, cfg.label(edge.to));
            }
        }

        for &clause in cfg.clauses() {
            let Some(c) = cfg.clause(clause) else { continue };
            let protected: Vec<String> = c.protected().iter().map(|b| cfg.label(*b)).collect();
            let _ = write!(
                out,
                "\n.clause {} protects {}",
                cfg.label(c.handler()),
                protected.join(", ")
            );
            if let Some(filter) = c.class_filter() {
                let _ = write!(out, " filter {}", self.type_name(filter));
            }
            let _ = writeln!(out);
        }
        out
    }
}

impl IntermediateRepresentationDumper for TextDumper<'_> {
    fn resolve(&self, arg: &DumpArg) -> String {
        match arg {
            DumpArg::Expr(e) => self.expression_name(*e),
            DumpArg::Block(b) => self.cfg.label(*b),
            DumpArg::Method(m) => self.method_name(*m),
            DumpArg::Type(t) => self.type_name(*t),
            DumpArg::Field(f) => self.field_name(*f),
            DumpArg::Text(text) => text.clone(),
        }
    }
}

/// Render `cfg` as text
pub fn dump_ir(cfg: &ControlFlowGraphState, bridge: Option<&TypeSystemForIr>) -> String {
    let dumper = TextDumper::new(cfg);
    match bridge {
        Some(bridge) => dumper.with_bridge(bridge).dump(),
        None => dumper.dump(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::{
        BuiltInType, ExceptionFlag, MethodDesc, Operator, TypeDesc, TypeKind,
    };
    use crate::compiler::TargetLayout;

    struct Plain;

    impl IntermediateRepresentationDumper for Plain {
        fn resolve(&self, arg: &DumpArg) -> String {
            match arg {
                DumpArg::Text(t) => t.clone(),
                other => format!("{:?}", other),
            }
        }
    }

    #[test]
    fn test_placeholders() {
        let text = Plain.format_output2(
            "{0} = {1} {5}",
            DumpArg::Text("a".into()),
            DumpArg::Text("b".into()),
        );
        assert_eq!(text, "a = b {5}");
    }

    fn setup() -> (TypeSystemForIr, ControlFlowGraphState, Vec<ExprId>, MethodId) {
        let ts = TypeSystemForIr::new(TargetLayout::default());
        let foo = ts.register_type(TypeDesc::new("Foo", TypeKind::Reference)).unwrap();
        let i4 = ts.builtin(BuiltInType::I4);
        let bar = ts
            .register_method(
                MethodDesc::new("Bar", foo, true)
                    .with_parameters(vec![i4, i4])
                    .with_parameter_names(vec!["a", "b"]),
            )
            .unwrap();
        let (cfg, args, _) = ts.create_control_flow_graph_state(bar, None, None).unwrap();
        (ts, cfg, args, bar)
    }

    #[test]
    fn test_direct_call_format() {
        let (ts, cfg, args, bar) = setup();
        let call = Operator::direct_subroutine(bar, vec![args[1], args[2]]);
        let dumper = TextDumper::new(&cfg).with_bridge(&ts);
        assert_eq!(call.format_output(&dumper), "directSubCall Bar(a, b)");
    }

    #[test]
    fn test_indirect_call_format() {
        let (ts, mut cfg, args, bar) = setup();
        let p = cfg.allocate_local(ts.builtin(BuiltInType::IntPtr), Some("p")).unwrap();
        let dumper = TextDumper::new(&cfg).with_bridge(&ts);

        let one = Operator::indirect_subroutine(bar, p, vec![args[1]]);
        assert_eq!(one.format_output(&dumper), "indirectSubCall p( a )");

        let none = Operator::indirect_subroutine(bar, p, Vec::new());
        assert_eq!(none.format_output(&dumper), "indirectSubCall p(  )");
    }

    #[test]
    fn test_names_without_debug_info() {
        let (ts, mut cfg, _, _) = setup();
        let i4 = ts.builtin(BuiltInType::I4);
        let t = cfg.allocate_temporary(i4).unwrap();
        let five = ts
            .create_constant(&mut cfg, i4, crate::compiler::ir::ConstantValue::Int(5))
            .unwrap();
        let dumper = TextDumper::new(&cfg).with_bridge(&ts);
        assert_eq!(dumper.expression_name(t), "$Temp_0");
        assert_eq!(dumper.expression_name(five), "$Const(I4 5)");
        assert_eq!(dumper.expression_name(cfg.arguments()[0]), "$Arg_0");
    }

    #[test]
    fn test_dump_lists_blocks_and_clauses() {
        let (ts, mut cfg, args, _) = setup();
        let body = cfg.create_first_normal_basic_block().unwrap();
        cfg.add_operator(body, Operator::assignment(args[1], args[2]))
            .unwrap();
        let (_, handler) = cfg
            .add_exception_clause(ExceptionFlag::Finally, &[body], None)
            .unwrap();
        cfg.add_operator(handler, Operator::unconditional(cfg.exit_block()))
            .unwrap();

        let text = dump_ir(&cfg, Some(&ts));
        assert!(text.starts_with("method Foo::Bar [under construction"));
        assert!(text.contains("Normal_2:\n  .protected by Finally_3\n  a = b\n  goto Exit_1"));
        assert!(text.contains(".edge Normal -> Exit_1"));
        assert!(text.contains(".clause Finally_3 protects Normal_2"));
        assert!(text.contains("unused var $Arg_0 : Foo"));
    }
}
