//! Bridge between the managed type system and the IR
//!
//! [`TypeSystemForIr`] owns the method/type/field descriptor tables shared
//! by every compiling worker. Tables sit behind a `parking_lot::RwLock`
//! and are read-mostly; the qualified-name index is a `DashMap`. Lazy
//! population (managed-pointer types, layout results) takes the write lock
//! at that boundary only.
//!
//! It is also the only place that fabricates constants embedding runtime
//! facts (null pointers, sizes, offsets, type handles) and the only place
//! that knows the calling convention.

use super::arena::Arena;
use super::cfg::ControlFlowGraphState;
use super::expression::{ConstantExpression, ConstantValue, ExprId, RuntimeHandle, VariableKind};
use super::operator::Operator;
use super::types::{
    BuiltInType, FieldDesc, FieldId, MethodDesc, MethodId, TypeDesc, TypeId, TypeKind, TypeLayout,
};
use crate::compiler::TargetLayout;
use crate::error::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use std::collections::HashMap;

/// Name of the reference type type-handle constants are typed as
pub const RUNTIME_TYPE_HANDLE: &str = "RuntimeTypeHandle";

/// Any registered descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorRef {
    Type(TypeId),
    Method(MethodId),
    Field(FieldId),
}

/// Ids of the types every program has
#[derive(Debug, Clone)]
pub struct WellKnownTypes {
    builtins: Vec<TypeId>,
    /// Type of type-handle constants
    pub runtime_type: TypeId,
}

impl WellKnownTypes {
    pub fn builtin(&self, ty: BuiltInType) -> TypeId {
        self.builtins[ty as usize]
    }

    pub fn object(&self) -> TypeId {
        self.builtin(BuiltInType::Object)
    }
}

/// A host-side literal to be turned into an IR constant
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Null,
    Bool(bool),
    Char(u16),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(String),
    Type(TypeId),
    Handle(RuntimeHandle),
    /// Already an expression of the target graph, passed through
    Expression(ExprId),
}

#[derive(Debug, Default)]
struct DescriptorTables {
    types: Arena<TypeDesc>,
    fields: Arena<FieldDesc>,
    methods: Arena<MethodDesc>,
    managed_pointers: HashMap<TypeId, TypeId>,
}

/// The type-system bridge
#[derive(Debug)]
pub struct TypeSystemForIr {
    layout: TargetLayout,
    tables: RwLock<DescriptorTables>,
    names: DashMap<String, DescriptorRef>,
    well_known: WellKnownTypes,
}

impl TypeSystemForIr {
    /// Bridge with the built-in types registered for `layout`.
    pub fn new(layout: TargetLayout) -> Self {
        let mut tables = DescriptorTables::default();
        let names = DashMap::new();

        let mut builtins = Vec::with_capacity(BuiltInType::ALL.len());
        for b in BuiltInType::ALL {
            let mut desc = TypeDesc::new(b.name(), TypeKind::Scalar(b));
            if b != BuiltInType::Void && !b.is_reference() {
                let size = b.size(&layout);
                desc.layout = Some(TypeLayout { size, align: size });
            }
            let id = tables.types.alloc(desc);
            names.insert(b.name().to_string(), DescriptorRef::Type(id));
            builtins.push(id);
        }
        let runtime_type = tables
            .types
            .alloc(TypeDesc::new(RUNTIME_TYPE_HANDLE, TypeKind::Reference));
        names.insert(
            RUNTIME_TYPE_HANDLE.to_string(),
            DescriptorRef::Type(runtime_type),
        );

        Self {
            layout,
            tables: RwLock::new(tables),
            names,
            well_known: WellKnownTypes {
                builtins,
                runtime_type,
            },
        }
    }

    pub fn layout(&self) -> &TargetLayout {
        &self.layout
    }

    pub fn well_known(&self) -> &WellKnownTypes {
        &self.well_known
    }

    pub fn builtin(&self, ty: BuiltInType) -> TypeId {
        self.well_known.builtin(ty)
    }

    // =========================================================================
    // Registration
    // =========================================================================

    pub fn register_type(&self, desc: TypeDesc) -> Result<TypeId> {
        match self.names.entry(desc.name.clone()) {
            Entry::Occupied(_) => Err(Error::DuplicateDescriptor {
                kind: "type".to_string(),
                name: desc.name,
            }),
            Entry::Vacant(slot) => {
                let id = self.tables.write().types.alloc(desc);
                slot.insert(DescriptorRef::Type(id));
                Ok(id)
            }
        }
    }

    pub fn register_field(
        &self,
        owner: TypeId,
        name: &str,
        field_type: TypeId,
        is_static: bool,
    ) -> Result<FieldId> {
        let key = format!("{}::{}", self.type_desc(owner)?.name, name);
        self.type_desc(field_type)?;
        match self.names.entry(key) {
            Entry::Occupied(e) => Err(Error::DuplicateDescriptor {
                kind: "field".to_string(),
                name: e.key().clone(),
            }),
            Entry::Vacant(slot) => {
                let mut tables = self.tables.write();
                let id = tables.fields.alloc(FieldDesc {
                    name: name.to_string(),
                    owner,
                    field_type,
                    is_static,
                    offset: None,
                });
                tables.types[owner].fields.push(id);
                slot.insert(DescriptorRef::Field(id));
                Ok(id)
            }
        }
    }

    /// Register a method. Overloads are not distinguished by name.
    pub fn register_method(&self, desc: MethodDesc) -> Result<MethodId> {
        let key = format!("{}::{}", self.type_desc(desc.owner)?.name, desc.name);
        for &ty in desc.parameters.iter().chain(&desc.locals).chain(&desc.return_type) {
            self.type_desc(ty)?;
        }
        match self.names.entry(key) {
            Entry::Occupied(e) => Err(Error::DuplicateDescriptor {
                kind: "method".to_string(),
                name: e.key().clone(),
            }),
            Entry::Vacant(slot) => {
                let id = self.tables.write().methods.alloc(desc);
                slot.insert(DescriptorRef::Method(id));
                Ok(id)
            }
        }
    }

    /// Record the layout engine's result for a type.
    pub fn set_type_layout(&self, ty: TypeId, layout: TypeLayout) -> Result<()> {
        let mut tables = self.tables.write();
        let desc = tables
            .types
            .get_mut(ty)
            .ok_or_else(|| Error::not_found("type", ty.to_string()))?;
        tracing::trace!(ty = %desc.name, size = layout.size, "type laid out");
        desc.layout = Some(layout);
        Ok(())
    }

    pub fn set_field_offset(&self, field: FieldId, offset: u32) -> Result<()> {
        let mut tables = self.tables.write();
        let desc = tables
            .fields
            .get_mut(field)
            .ok_or_else(|| Error::not_found("field", field.to_string()))?;
        tracing::trace!(field = %desc.name, offset, "field laid out");
        desc.offset = Some(offset);
        Ok(())
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub fn type_desc(&self, ty: TypeId) -> Result<MappedRwLockReadGuard<'_, TypeDesc>> {
        RwLockReadGuard::try_map(self.tables.read(), |t| t.types.get(ty))
            .map_err(|_| Error::not_found("type", ty.to_string()))
    }

    pub fn field_desc(&self, field: FieldId) -> Result<MappedRwLockReadGuard<'_, FieldDesc>> {
        RwLockReadGuard::try_map(self.tables.read(), |t| t.fields.get(field))
            .map_err(|_| Error::not_found("field", field.to_string()))
    }

    pub fn method_desc(&self, method: MethodId) -> Result<MappedRwLockReadGuard<'_, MethodDesc>> {
        RwLockReadGuard::try_map(self.tables.read(), |t| t.methods.get(method))
            .map_err(|_| Error::not_found("method", method.to_string()))
    }

    /// `Owner::name`
    pub fn method_name(&self, method: MethodId) -> Result<String> {
        let tables = self.tables.read();
        let md = tables
            .methods
            .get(method)
            .ok_or_else(|| Error::not_found("method", method.to_string()))?;
        let owner = tables
            .types
            .get(md.owner)
            .map_or("?", |t| t.name.as_str());
        Ok(format!("{}::{}", owner, md.name))
    }

    pub fn type_name(&self, ty: TypeId) -> String {
        self.type_desc(ty)
            .map(|t| t.name.clone())
            .unwrap_or_else(|_| format!("type{}", ty))
    }

    pub fn lookup(&self, qualified_name: &str) -> Option<DescriptorRef> {
        self.names.get(qualified_name).map(|r| *r.value())
    }

    pub fn lookup_type(&self, name: &str) -> Result<TypeId> {
        match self.lookup(name) {
            Some(DescriptorRef::Type(id)) => Ok(id),
            _ => Err(Error::not_found("type", name)),
        }
    }

    pub fn lookup_method(&self, owner: &str, name: &str) -> Result<MethodId> {
        let key = format!("{}::{}", owner, name);
        match self.lookup(&key) {
            Some(DescriptorRef::Method(id)) => Ok(id),
            _ => Err(Error::not_found("method", key)),
        }
    }

    pub fn lookup_field(&self, owner: &str, name: &str) -> Result<FieldId> {
        let key = format!("{}::{}", owner, name);
        match self.lookup(&key) {
            Some(DescriptorRef::Field(id)) => Ok(id),
            _ => Err(Error::not_found("field", key)),
        }
    }

    /// The managed pointer type to `ty`, created on first request.
    pub fn get_managed_pointer_to_type(&self, ty: TypeId) -> Result<TypeId> {
        if let Some(&ptr) = self.tables.read().managed_pointers.get(&ty) {
            return Ok(ptr);
        }

        let mut tables = self.tables.write();
        if let Some(&ptr) = tables.managed_pointers.get(&ty) {
            return Ok(ptr);
        }
        let name = tables
            .types
            .get(ty)
            .map(|t| format!("{}&", t.name))
            .ok_or_else(|| Error::not_found("type", ty.to_string()))?;
        tracing::trace!(pointer = %name, "creating managed pointer type");
        let mut desc = TypeDesc::new(name.clone(), TypeKind::ManagedPointer(ty));
        desc.layout = Some(TypeLayout {
            size: self.layout.pointer_size,
            align: self.layout.pointer_align,
        });
        let ptr = tables.types.alloc(desc);
        tables.managed_pointers.insert(ty, ptr);
        drop(tables);

        self.names.insert(name, DescriptorRef::Type(ptr));
        Ok(ptr)
    }

    /// Type of argument slot 0 for a method declared on `owner`. Value
    /// types travel by managed pointer, as receiver and as type pointer.
    pub fn declaring_slot_type(&self, owner: TypeId) -> Result<TypeId> {
        let is_value = self.type_desc(owner)?.kind.is_value_type();
        if is_value {
            self.get_managed_pointer_to_type(owner)
        } else {
            Ok(owner)
        }
    }

    /// Size on the target, `None` until the type is laid out.
    pub fn size_of(&self, ty: TypeId) -> Result<Option<u32>> {
        let desc = self.type_desc(ty)?;
        Ok(match desc.kind {
            TypeKind::Scalar(b) => Some(b.size(&self.layout)),
            TypeKind::Reference | TypeKind::Pointer(_) | TypeKind::ManagedPointer(_) => {
                Some(self.layout.pointer_size)
            }
            TypeKind::Enum(b) => Some(b.size(&self.layout)),
            TypeKind::ValueType => desc.layout.map(|l| l.size),
        })
    }

    pub fn field_offset(&self, field: FieldId) -> Result<Option<u32>> {
        Ok(self.field_desc(field)?.offset)
    }

    // =========================================================================
    // Graph construction
    // =========================================================================

    /// Build the graph for `method`.
    ///
    /// Materializes one argument per calling-convention slot and one local
    /// per declared local (or per `local_types` when given), wires
    /// entry → exit, and returns the argument and local arrays alongside
    /// the graph. The graph is left `Unbuilt`.
    pub fn create_control_flow_graph_state(
        &self,
        method: MethodId,
        local_types: Option<&[TypeId]>,
        local_names: Option<&[&str]>,
    ) -> Result<(ControlFlowGraphState, Vec<ExprId>, Vec<ExprId>)> {
        let md = self.method_desc(method)?.clone();
        let name = self.method_name(method)?;
        let local_types = local_types.map_or_else(|| md.locals.clone(), <[TypeId]>::to_vec);
        if let Some(names) = local_names {
            if names.len() != local_types.len() {
                return Err(Error::contract(
                    name,
                    format!(
                        "{} local names supplied for {} locals",
                        names.len(),
                        local_types.len()
                    ),
                ));
            }
        }

        let mut cfg = ControlFlowGraphState::new(method, name);

        let mut arguments = Vec::with_capacity(md.parameters.len() + 1);
        for (slot, ty) in md.this_plus_arguments().into_iter().enumerate() {
            let ty = if slot == 0 {
                self.declaring_slot_type(ty)?
            } else {
                ty
            };
            let arg = cfg.raw_push_variable(ty, VariableKind::Argument(slot as u32));
            let debug_name = match slot {
                0 if !md.is_static => Some("this".to_string()),
                0 => None,
                n => md.parameter_names.get(n - 1).cloned(),
            };
            if let Some(debug_name) = debug_name {
                cfg.raw_set_variable_debug_info(arg, debug_name)?;
            }
            arguments.push(arg);
        }

        let mut locals = Vec::with_capacity(local_types.len());
        for (i, &ty) in local_types.iter().enumerate() {
            self.type_desc(ty)?;
            let local = cfg.raw_push_variable(ty, VariableKind::Local);
            if let Some(debug_name) = local_names.and_then(|names| names.get(i)) {
                cfg.raw_set_variable_debug_info(local, *debug_name)?;
            }
            locals.push(local);
        }

        if let Some(ty) = md.return_type {
            let ret = cfg.raw_push_variable(ty, VariableKind::Local);
            cfg.raw_set_variable_debug_info(ret, "ReturnValue")?;
            cfg.return_value = Some(ret);
        }

        let (entry, exit) = (cfg.entry_block(), cfg.exit_block());
        cfg.raw_push_operator(entry, Operator::unconditional(exit));
        let ret = cfg.return_value();
        cfg.raw_push_operator(exit, Operator::return_control(ret));

        Ok((cfg, arguments, locals))
    }

    // =========================================================================
    // Constants
    // =========================================================================

    /// Intern a constant of type `ty`, failing if `value` does not fit it.
    pub fn create_constant(
        &self,
        cfg: &mut ControlFlowGraphState,
        ty: TypeId,
        value: ConstantValue,
    ) -> Result<ExprId> {
        let constant = {
            let desc = self.type_desc(ty)?;
            ConstantExpression::new(ty, &desc, value)?
        };
        cfg.intern_constant(constant)
    }

    /// A null of type `ty`; value types get a managed pointer to them.
    pub fn create_null_pointer(&self, cfg: &mut ControlFlowGraphState, ty: TypeId) -> Result<ExprId> {
        let is_value = self.type_desc(ty)?.kind.is_value_type();
        let pointer = if is_value {
            self.get_managed_pointer_to_type(ty)?
        } else {
            ty
        };
        self.create_constant(cfg, pointer, ConstantValue::Null)
    }

    /// The type handle (virtual table pointer) of `ty`.
    pub fn create_constant_for_type(
        &self,
        cfg: &mut ControlFlowGraphState,
        ty: TypeId,
    ) -> Result<ExprId> {
        self.type_desc(ty)?;
        let runtime_type = self.well_known.runtime_type;
        self.create_constant(cfg, runtime_type, ConstantValue::TypeHandle(ty))
    }

    /// `sizeof(ty)` on the target, or a delayed sentinel before layout.
    pub fn create_constant_for_type_size(
        &self,
        cfg: &mut ControlFlowGraphState,
        ty: TypeId,
    ) -> Result<ExprId> {
        let value = match self.size_of(ty)? {
            Some(size) => ConstantValue::UInt(size as u64),
            None => ConstantValue::TypeSize(ty),
        };
        self.create_constant(cfg, self.builtin(BuiltInType::U4), value)
    }

    /// Byte offset of `field`, or a delayed sentinel before layout.
    pub fn create_constant_for_field_offset(
        &self,
        cfg: &mut ControlFlowGraphState,
        field: FieldId,
    ) -> Result<ExprId> {
        let value = match self.field_offset(field)? {
            Some(offset) => ConstantValue::UInt(offset as u64),
            None => ConstantValue::FieldOffset(field),
        };
        self.create_constant(cfg, self.builtin(BuiltInType::U4), value)
    }

    pub fn create_runtime_handle(
        &self,
        cfg: &mut ControlFlowGraphState,
        handle: RuntimeHandle,
    ) -> Result<ExprId> {
        match handle {
            RuntimeHandle::Type(t) => drop(self.type_desc(t)?),
            RuntimeHandle::Method(m) => drop(self.method_desc(m)?),
            RuntimeHandle::Field(f) => drop(self.field_desc(f)?),
        }
        self.create_constant(
            cfg,
            self.builtin(BuiltInType::IntPtr),
            ConstantValue::RuntimeHandle(handle),
        )
    }

    pub fn create_constant_from_object(
        &self,
        cfg: &mut ControlFlowGraphState,
        value: &HostValue,
    ) -> Result<ExprId> {
        let b = |t: BuiltInType| self.builtin(t);
        match value {
            HostValue::Expression(e) => {
                if cfg.expression(*e).is_none() {
                    return Err(cfg.structural("constant conversion", format!("dangling expression {}", e)));
                }
                Ok(*e)
            }
            HostValue::Null => self.create_null_pointer(cfg, self.well_known.object()),
            HostValue::Bool(v) => self.create_constant(cfg, b(BuiltInType::Boolean), ConstantValue::Bool(*v)),
            HostValue::Char(v) => {
                self.create_constant(cfg, b(BuiltInType::Char), ConstantValue::UInt(*v as u64))
            }
            HostValue::I32(v) => self.create_constant(cfg, b(BuiltInType::I4), ConstantValue::Int(*v as i64)),
            HostValue::I64(v) => self.create_constant(cfg, b(BuiltInType::I8), ConstantValue::Int(*v)),
            HostValue::U32(v) => {
                self.create_constant(cfg, b(BuiltInType::U4), ConstantValue::UInt(*v as u64))
            }
            HostValue::U64(v) => self.create_constant(cfg, b(BuiltInType::U8), ConstantValue::UInt(*v)),
            HostValue::F32(v) => self.create_constant(cfg, b(BuiltInType::R4), ConstantValue::f32(*v)),
            HostValue::F64(v) => self.create_constant(cfg, b(BuiltInType::R8), ConstantValue::f64(*v)),
            HostValue::Str(s) => {
                self.create_constant(cfg, b(BuiltInType::String), ConstantValue::Str(s.clone()))
            }
            HostValue::Type(t) => self.create_constant_for_type(cfg, *t),
            HostValue::Handle(h) => self.create_runtime_handle(cfg, *h),
        }
    }

    /// Convert call arguments given as host literals.
    pub fn create_constants_from_objects(
        &self,
        cfg: &mut ControlFlowGraphState,
        values: &[HostValue],
    ) -> Result<Vec<ExprId>> {
        values
            .iter()
            .map(|v| self.create_constant_from_object(cfg, v))
            .collect()
    }

    // =========================================================================
    // Calling convention
    // =========================================================================

    /// Prepend the declaring-type slot a static method's callers must pass.
    pub fn add_type_pointer_to_arguments_of_static_method(
        &self,
        cfg: &mut ControlFlowGraphState,
        method: MethodId,
        arguments: &[ExprId],
    ) -> Result<Vec<ExprId>> {
        let (is_static, owner, expected) = {
            let md = self.method_desc(method)?;
            (md.is_static, md.owner, md.parameters.len())
        };
        if !is_static {
            return Err(Error::contract(
                self.method_name(method)?,
                "type pointer is only added for static methods",
            ));
        }
        if arguments.len() != expected {
            return Err(Error::contract(
                self.method_name(method)?,
                format!("expects {} arguments, got {}", expected, arguments.len()),
            ));
        }
        let slot_type = self.declaring_slot_type(owner)?;
        let type_pointer = self.create_constant(cfg, slot_type, ConstantValue::Null)?;
        let mut slots = Vec::with_capacity(arguments.len() + 1);
        slots.push(type_pointer);
        slots.extend_from_slice(arguments);
        Ok(slots)
    }

    /// A direct call laid out per the calling convention.
    ///
    /// Instance calls take the receiver as `arguments[0]`; static calls get
    /// the type-pointer slot prepended.
    pub fn create_direct_call(
        &self,
        cfg: &mut ControlFlowGraphState,
        method: MethodId,
        arguments: &[ExprId],
    ) -> Result<Operator> {
        let (is_static, expected) = {
            let md = self.method_desc(method)?;
            (md.is_static, md.parameters.len() + 1)
        };
        let slots = if is_static {
            self.add_type_pointer_to_arguments_of_static_method(cfg, method, arguments)?
        } else if arguments.len() == expected {
            arguments.to_vec()
        } else {
            return Err(Error::contract(
                self.method_name(method)?,
                format!("expects {} arguments including this, got {}", expected, arguments.len()),
            ));
        };
        Ok(Operator::direct_subroutine(method, slots))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::cfg::CfgState;
    use crate::compiler::ir::expression::Expression;

    fn bridge() -> (TypeSystemForIr, TypeId, MethodId) {
        let ts = TypeSystemForIr::new(TargetLayout::default());
        let foo = ts
            .register_type(TypeDesc::new("Foo", TypeKind::Reference))
            .unwrap();
        let i4 = ts.builtin(BuiltInType::I4);
        let md = MethodDesc::new("Bar", foo, false)
            .with_parameters(vec![i4, i4])
            .with_parameter_names(vec!["a", "b"])
            .with_locals(vec![i4])
            .with_return_type(i4);
        let bar = ts.register_method(md).unwrap();
        (ts, foo, bar)
    }

    #[test]
    fn test_create_graph_materializes_arguments_and_locals() {
        let (ts, foo, bar) = bridge();
        let (cfg, args, locals) = ts.create_control_flow_graph_state(bar, None, Some(&["x"])).unwrap();

        assert_eq!(cfg.state(), CfgState::Unbuilt);
        assert_eq!(cfg.method_name(), "Foo::Bar");
        assert_eq!(args.len(), 3);
        assert_eq!(cfg.expression(args[0]).unwrap().ty(), foo);
        assert_eq!(cfg.variable_debug_info(args[0]).unwrap().name, "this");
        assert_eq!(cfg.variable_debug_info(args[2]).unwrap().name, "b");
        assert_eq!(locals.len(), 1);
        assert_eq!(cfg.variable_debug_info(locals[0]).unwrap().name, "x");
        assert!(cfg.return_value().is_some());
        assert_eq!(cfg.blocks().len(), 2);
    }

    #[test]
    fn test_local_name_count_must_match() {
        let (ts, _, bar) = bridge();
        let err = ts
            .create_control_flow_graph_state(bar, None, Some(&["x", "y"]))
            .unwrap_err();
        assert!(matches!(err, Error::ContractViolation { .. }));
    }

    #[test]
    fn test_value_type_receiver_is_managed_pointer() {
        let ts = TypeSystemForIr::new(TargetLayout::default());
        let point = ts
            .register_type(TypeDesc::new("Point", TypeKind::ValueType))
            .unwrap();
        let m = ts.register_method(MethodDesc::new("Len", point, false)).unwrap();
        let (cfg, args, _) = ts.create_control_flow_graph_state(m, None, None).unwrap();
        let this_ty = cfg.expression(args[0]).unwrap().ty();
        assert_eq!(ts.type_desc(this_ty).unwrap().kind, TypeKind::ManagedPointer(point));
        // Created once
        assert_eq!(ts.get_managed_pointer_to_type(point).unwrap(), this_ty);
    }

    #[test]
    fn test_constants_are_interned_and_validated() {
        let (ts, _, bar) = bridge();
        let (mut cfg, _, _) = ts.create_control_flow_graph_state(bar, None, None).unwrap();
        let i4 = ts.builtin(BuiltInType::I4);
        let a = ts.create_constant(&mut cfg, i4, ConstantValue::Int(3)).unwrap();
        let b = ts.create_constant(&mut cfg, i4, ConstantValue::Int(3)).unwrap();
        assert_eq!(a, b);

        let err = ts
            .create_constant(&mut cfg, i4, ConstantValue::Str("3".into()))
            .unwrap_err();
        assert!(matches!(err, Error::ConstantTypeMismatch { .. }));
    }

    #[test]
    fn test_null_pointer_of_value_type() {
        let (ts, _, bar) = bridge();
        let (mut cfg, _, _) = ts.create_control_flow_graph_state(bar, None, None).unwrap();
        let i4 = ts.builtin(BuiltInType::I4);
        let null = ts.create_null_pointer(&mut cfg, i4).unwrap();
        let ty = cfg.expression(null).unwrap().ty();
        assert_eq!(ts.type_desc(ty).unwrap().kind, TypeKind::ManagedPointer(i4));
        assert_eq!(cfg.constant_value(null), Some(&ConstantValue::Null));
    }

    #[test]
    fn test_type_size_is_delayed_until_layout() {
        let (ts, _, bar) = bridge();
        let (mut cfg, _, _) = ts.create_control_flow_graph_state(bar, None, None).unwrap();
        let point = ts
            .register_type(TypeDesc::new("Point", TypeKind::ValueType))
            .unwrap();
        let delayed = ts.create_constant_for_type_size(&mut cfg, point).unwrap();
        assert_eq!(cfg.constant_value(delayed), Some(&ConstantValue::TypeSize(point)));

        ts.set_type_layout(point, TypeLayout { size: 8, align: 4 })
            .unwrap();
        let resolved = ts.create_constant_for_type_size(&mut cfg, point).unwrap();
        assert_eq!(cfg.constant_value(resolved), Some(&ConstantValue::UInt(8)));
    }

    #[test]
    fn test_field_offset_constant() {
        let (ts, foo, bar) = bridge();
        let (mut cfg, _, _) = ts.create_control_flow_graph_state(bar, None, None).unwrap();
        let f = ts
            .register_field(foo, "count", ts.builtin(BuiltInType::I4), false)
            .unwrap();
        let delayed = ts.create_constant_for_field_offset(&mut cfg, f).unwrap();
        assert!(cfg.constant_value(delayed).unwrap().is_delayed());
        ts.set_field_offset(f, 12).unwrap();
        let c = ts.create_constant_for_field_offset(&mut cfg, f).unwrap();
        assert_eq!(cfg.constant_value(c), Some(&ConstantValue::UInt(12)));
        assert_eq!(ts.lookup_field("Foo", "count").unwrap(), f);
    }

    #[test]
    fn test_constants_from_objects() {
        let (ts, foo, bar) = bridge();
        let (mut cfg, args, _) = ts.create_control_flow_graph_state(bar, None, None).unwrap();
        let exprs = ts
            .create_constants_from_objects(
                &mut cfg,
                &[
                    HostValue::Expression(args[1]),
                    HostValue::Null,
                    HostValue::I32(7),
                    HostValue::Type(foo),
                ],
            )
            .unwrap();
        assert_eq!(exprs[0], args[1]);
        assert_eq!(cfg.constant_value(exprs[1]), Some(&ConstantValue::Null));
        assert_eq!(cfg.expression(exprs[1]).unwrap().ty(), ts.well_known().object());
        assert_eq!(cfg.constant_value(exprs[2]), Some(&ConstantValue::Int(7)));
        assert!(matches!(
            cfg.expression(exprs[3]),
            Some(Expression::Constant(c)) if c.value() == &ConstantValue::TypeHandle(foo)
        ));
    }

    #[test]
    fn test_static_type_pointer_convention() {
        let (ts, foo, bar) = bridge();
        let i4 = ts.builtin(BuiltInType::I4);
        let helper = ts
            .register_method(MethodDesc::new("Helper", foo, true).with_parameters(vec![i4]))
            .unwrap();
        let (mut cfg, args, _) = ts.create_control_flow_graph_state(bar, None, None).unwrap();

        let slots = ts
            .add_type_pointer_to_arguments_of_static_method(&mut cfg, helper, &[args[1]])
            .unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(cfg.constant_value(slots[0]), Some(&ConstantValue::Null));
        assert_eq!(cfg.expression(slots[0]).unwrap().ty(), foo);
        assert_eq!(slots[1], args[1]);

        let err = ts
            .add_type_pointer_to_arguments_of_static_method(&mut cfg, bar, &[args[1]])
            .unwrap_err();
        assert!(matches!(err, Error::ContractViolation { .. }));

        let call = ts.create_direct_call(&mut cfg, helper, &[args[1]]).unwrap();
        assert_eq!(call.arguments(), slots.as_slice());
    }

    #[test]
    fn test_static_value_type_slot_matches_callee() {
        let ts = TypeSystemForIr::new(TargetLayout::default());
        let point = ts
            .register_type(TypeDesc::new("Point", TypeKind::ValueType))
            .unwrap();
        let i4 = ts.builtin(BuiltInType::I4);
        let origin = ts
            .register_method(MethodDesc::new("Origin", point, true).with_parameters(vec![i4]))
            .unwrap();

        let (mut callee, callee_args, _) = ts.create_control_flow_graph_state(origin, None, None).unwrap();
        let slot_ty = callee.expression(callee_args[0]).unwrap().ty();
        assert_eq!(ts.type_desc(slot_ty).unwrap().kind, TypeKind::ManagedPointer(point));

        let call = ts
            .create_direct_call(&mut callee, origin, &[callee_args[1]])
            .unwrap();
        let type_pointer = call.arguments()[0];
        assert_eq!(callee.expression(type_pointer).unwrap().ty(), slot_ty);
        assert_eq!(callee.constant_value(type_pointer), Some(&ConstantValue::Null));
    }

    #[test]
    fn test_descriptor_errors_are_recoverable() {
        let (ts, _, _) = bridge();
        let err = ts.lookup_type("Missing").unwrap_err();
        assert_eq!(err.classify(), crate::error::ErrorSeverity::Recoverable);
        let dup = ts
            .register_type(TypeDesc::new("Foo", TypeKind::Reference))
            .unwrap_err();
        assert!(matches!(dup, Error::DuplicateDescriptor { .. }));
    }

    #[test]
    fn test_concurrent_reads() {
        let (ts, foo, _) = bridge();
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..100 {
                        assert_eq!(ts.type_desc(foo).unwrap().name, "Foo");
                        ts.get_managed_pointer_to_type(foo).unwrap();
                    }
                });
            }
        });
        assert_eq!(ts.lookup_type("Foo&").unwrap(), ts.get_managed_pointer_to_type(foo).unwrap());
    }
}
