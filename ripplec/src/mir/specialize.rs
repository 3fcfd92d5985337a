//! Monomorphization and specialization-aware site layouts.
//!
//! Generic functions are instantiated once per distinct list of type
//! arguments reachable from the program's non-generic functions. A site in
//! a generic body gets one environment layout per instance, because field
//! machine types depend on the substituted binding types. Layouts are
//! memoized on `(SiteId, InstanceId)`.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};

use ripple_runtime::artifact::{EnvFieldLayout, EnvLayout, FieldSource, ValType};

use crate::hir::{FnDefId, Program, Type};

use super::body::{Body, MirProgram};
use super::sites::ContinuationSite;
use super::types::{FnRef, SiteId, StatementKind, TerminatorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u32);

impl InstanceId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A function together with the type arguments it is compiled for.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub id: InstanceId,
    pub def: FnDefId,
    pub type_args: Vec<Type>,
    /// Symbol name: the function name, plus `<args>` for generic instances.
    pub name: String,
}

impl Instance {
    pub fn substitute(&self, ty: &Type) -> Type {
        ty.substitute(&self.type_args)
    }
}

pub fn instance_name(name: &str, type_args: &[Type]) -> String {
    if type_args.is_empty() {
        return name.to_string();
    }
    let args: Vec<String> = type_args.iter().map(Type::to_string).collect();
    format!("{}<{}>", name, args.join(","))
}

#[derive(Debug, Clone, Default)]
pub struct Instances {
    list: Vec<Instance>,
    by_key: HashMap<(FnDefId, Vec<Type>), InstanceId>,
}

impl Instances {
    /// Discover every instance reachable from the non-generic functions.
    pub fn collect(program: &Program, mir: &MirProgram) -> Self {
        let mut instances = Instances::default();
        let mut queue = VecDeque::new();
        for (index, decl) in program.functions.iter().enumerate() {
            if decl.type_params == 0 {
                let (id, _) = instances.intern(program, FnDefId(index as u32), Vec::new());
                queue.push_back(id);
            }
        }

        while let Some(id) = queue.pop_front() {
            let instance = instances.list[id.index()].clone();
            for body in mir.bodies_of(instance.def) {
                for callee in callees(body) {
                    let args: Vec<Type> = callee.type_args.iter().map(|t| instance.substitute(t)).collect();
                    if args.iter().any(Type::has_params) {
                        continue;
                    }
                    let (callee_id, fresh) = instances.intern(program, callee.def, args);
                    if fresh {
                        queue.push_back(callee_id);
                    }
                }
            }
        }
        tracing::debug!(instances = instances.len(), "collected function instances");
        instances
    }

    fn intern(&mut self, program: &Program, def: FnDefId, type_args: Vec<Type>) -> (InstanceId, bool) {
        let key = (def, type_args);
        if let Some(id) = self.by_key.get(&key) {
            return (*id, false);
        }
        let id = InstanceId(self.list.len() as u32);
        let name = instance_name(&program.fn_decl(def).name, &key.1);
        self.list.push(Instance {
            id,
            def,
            type_args: key.1.clone(),
            name,
        });
        self.by_key.insert(key, id);
        (id, true)
    }

    pub fn get(&self, def: FnDefId, type_args: &[Type]) -> Option<&Instance> {
        let id = self.by_key.get(&(def, type_args.to_vec()))?;
        self.list.get(id.index())
    }

    /// Instance of a call made from inside `caller`.
    pub fn resolve(&self, caller: &Instance, callee: &FnRef) -> Option<&Instance> {
        let args: Vec<Type> = callee.type_args.iter().map(|t| caller.substitute(t)).collect();
        self.get(callee.def, &args)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instance> {
        self.list.iter()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

fn callees(body: &Body) -> Vec<&FnRef> {
    let mut out = Vec::new();
    for block in &body.blocks {
        for statement in &block.statements {
            if let StatementKind::Call { callee, .. } = &statement.kind {
                out.push(callee);
            }
        }
        if let TerminatorKind::Call { callee, .. } = &block.terminator.kind {
            out.push(callee);
        }
    }
    out
}

/// Machine type of a captured binding.
pub fn val_type(ty: &Type) -> ValType {
    match ty {
        Type::Int => ValType::I64,
        Type::Float => ValType::F64,
        Type::Unit | Type::Bool => ValType::I32,
        _ => ValType::AnyRef,
    }
}

/// Memoized environment layouts per `(site, instance)`.
#[derive(Debug, Default)]
pub struct SiteSpecializer {
    cache: HashMap<(SiteId, InstanceId), EnvLayout>,
    hits: usize,
    misses: usize,
}

impl SiteSpecializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layout(&mut self, site: &ContinuationSite, instance: &Instance) -> &EnvLayout {
        match self.cache.entry((site.id, instance.id)) {
            Entry::Occupied(entry) => {
                self.hits += 1;
                entry.into_mut()
            }
            Entry::Vacant(entry) => {
                self.misses += 1;
                entry.insert(build_layout(site, instance))
            }
        }
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

fn build_layout(site: &ContinuationSite, instance: &Instance) -> EnvLayout {
    let fields = site
        .fields
        .iter()
        .map(|field| EnvFieldLayout {
            name: field.name.clone(),
            source: field.source,
            val_type: match (&field.source, &field.ty) {
                (FieldSource::Site, _) => ValType::I32,
                (FieldSource::Handler, _) => ValType::AnyRef,
                (_, Some(ty)) => val_type(&instance.substitute(ty)),
                (_, None) => ValType::AnyRef,
            },
        })
        .collect();
    EnvLayout {
        name: format!("{}${}", instance.name, site.id),
        fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::intrinsics::resolve_intrinsics;
    use crate::effects::Registry;
    use crate::hir::build::*;
    use crate::hir::{EffectDecl, EffectRow, FnDecl, OpDecl};
    use crate::mir::lowering::lower_program;
    use crate::mir::sites::collect_sites;

    fn generic_program() -> Program {
        // fn keep<T>(v: T) -> T / {Async} { let r = await(0); v }
        Program::new()
            .effect(EffectDecl::new("Async").op(OpDecl::resume("await", vec![Type::Int], Type::Int)))
            .function(
                FnDecl::new("keep", Type::Param(0))
                    .generic(1)
                    .param("v", Type::Param(0))
                    .row(EffectRow::of(&["Async"]))
                    .body(block(vec![
                        let_("r", Type::Int, perform("Async", "await", vec![int(0)])),
                        local("v"),
                    ])),
            )
            .function(
                FnDecl::new("main", Type::Int)
                    .row(EffectRow::of(&["Async"]))
                    .body(block(vec![
                        call_generic("keep", vec![Type::Float], vec![float(1.5)]),
                        call_generic("keep", vec![Type::Int], vec![int(1)]),
                        call_generic("keep", vec![Type::Int], vec![int(2)]),
                    ])),
            )
    }

    fn lower(program: &Program) -> MirProgram {
        let mut diagnostics = Vec::new();
        let registry = Registry::from_program(program, &mut diagnostics);
        let intrinsics = resolve_intrinsics(program, &mut diagnostics);
        let mir = lower_program(program, &registry, &intrinsics, &mut diagnostics);
        assert!(diagnostics.is_empty(), "{:?}", diagnostics);
        mir
    }

    #[test]
    fn test_instances_deduplicate() {
        let program = generic_program();
        let mir = lower(&program);
        let instances = Instances::collect(&program, &mir);
        let names: Vec<_> = instances.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["main", "keep<float>", "keep<int>"]);
        assert!(instances.get(FnDefId(0), &[Type::Int]).is_some());
        assert!(instances.get(FnDefId(0), &[Type::Str]).is_none());
    }

    #[test]
    fn test_layout_memoized_per_instance() {
        let program = generic_program();
        let mir = lower(&program);
        let sites = collect_sites(&mir);
        let instances = Instances::collect(&program, &mir);
        let site = sites.get(SiteId(0)).unwrap();
        let float = instances.get(FnDefId(0), &[Type::Float]).unwrap();
        let int = instances.get(FnDefId(0), &[Type::Int]).unwrap();

        let mut specializer = SiteSpecializer::new();
        let float_layout = specializer.layout(site, float).clone();
        let int_layout = specializer.layout(site, int).clone();
        let again = specializer.layout(site, int).clone();

        assert_eq!(float_layout.fields[2].val_type, ValType::F64);
        assert_eq!(int_layout.fields[2].val_type, ValType::I64);
        assert_eq!(int_layout, again);
        assert_eq!(int_layout.name, "keep<int>$s0");
        assert_eq!((specializer.hits(), specializer.misses()), (1, 2));
    }

    #[test]
    fn test_val_types() {
        assert_eq!(val_type(&Type::Bool), ValType::I32);
        assert_eq!(val_type(&Type::Str), ValType::AnyRef);
        assert_eq!(val_type(&Type::tuple([Type::Int])), ValType::AnyRef);
    }
}
