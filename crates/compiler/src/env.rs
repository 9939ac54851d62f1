//! Lexically nested name → value bindings.
//!
//! Environments form a tree: one global frame created at bootstrap, one child
//! per function body and one per `scope` block. A child only holds the names
//! it declares; lookups walk the parent chain. Frames are shared through
//! `Rc`: compilation is single-threaded and children never outlive their
//! parents.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use inkwell::types::BasicTypeEnum;
use inkwell::values::{FunctionValue, GlobalValue, PointerValue};

use crate::{CompilerError, CompilerResult};

/// What a name can resolve to during lowering.
///
/// Allocas carry their allocated type: with opaque pointers the pointee type
/// cannot be recovered from the value itself, and loads need it.
#[derive(Debug, Clone, Copy)]
pub enum Binding<'ctx> {
    /// Stack slot created in the entry block of the enclosing function.
    Local {
        ptr: PointerValue<'ctx>,
        ty: BasicTypeEnum<'ctx>,
    },
    /// Module-level global with a constant initializer.
    Global(GlobalValue<'ctx>),
    /// User-defined or extern function.
    Function(FunctionValue<'ctx>),
}

pub struct Environment<'ctx> {
    record: RefCell<HashMap<String, Binding<'ctx>>>,
    parent: Option<Rc<Environment<'ctx>>>,
}

impl<'ctx> Environment<'ctx> {
    /// The root frame; globals are installed here at bootstrap.
    pub fn root() -> Rc<Self> {
        Rc::new(Self {
            record: RefCell::new(HashMap::new()),
            parent: None,
        })
    }

    /// A new empty frame whose lookups fall back to `parent`.
    pub fn child(parent: &Rc<Environment<'ctx>>) -> Rc<Self> {
        Rc::new(Self {
            record: RefCell::new(HashMap::new()),
            parent: Some(Rc::clone(parent)),
        })
    }

    /// Adds or overwrites a binding in this frame. Shadows any same-named
    /// binding in a parent for subsequent lookups through this frame.
    pub fn define(&self, name: impl Into<String>, binding: Binding<'ctx>) {
        self.record.borrow_mut().insert(name.into(), binding);
    }

    /// True when this frame itself declares `name` (the parent chain is not
    /// consulted).
    pub fn declares_locally(&self, name: &str) -> bool {
        self.record.borrow().contains_key(name)
    }

    /// Walks the parent chain for `name`.
    pub fn lookup(&self, name: &str) -> CompilerResult<Binding<'ctx>> {
        if let Some(binding) = self.record.borrow().get(name) {
            return Ok(*binding);
        }

        match &self.parent {
            Some(parent) => parent.lookup(name),
            None => Err(CompilerError::UnboundName(name.to_string())),
        }
    }

    /// True when `name` resolves anywhere on the chain.
    pub fn resolves(&self, name: &str) -> bool {
        self.declares_locally(name)
            || self.parent.as_ref().map_or(false, |parent| parent.resolves(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkwell::context::Context;

    #[test]
    fn lookup_walks_parent_chain() {
        let context = Context::create();
        let module = context.create_module("env_test");
        let i64_ty = context.i64_type();
        let fn_value =
            module.add_function("probe", i64_ty.fn_type(&[], false), None);

        let root = Environment::root();
        root.define("probe", Binding::Function(fn_value));

        let inner = Environment::child(&Environment::child(&root));
        assert!(matches!(inner.lookup("probe"), Ok(Binding::Function(_))));
        assert!(inner.resolves("probe"));
        assert!(!inner.declares_locally("probe"));
    }

    #[test]
    fn missing_name_is_unbound() {
        let root = Environment::root();
        match root.lookup("ghost") {
            Err(CompilerError::UnboundName(name)) => assert_eq!(name, "ghost"),
            other => panic!("expected UnboundName, got {other:?}"),
        }
    }

    #[test]
    fn child_shadows_parent() {
        let context = Context::create();
        let module = context.create_module("env_test");
        let i64_ty = context.i64_type();
        let outer_fn = module.add_function("outer", i64_ty.fn_type(&[], false), None);
        let inner_fn = module.add_function("inner", i64_ty.fn_type(&[], false), None);

        let root = Environment::root();
        root.define("name", Binding::Function(outer_fn));

        let child = Environment::child(&root);
        child.define("name", Binding::Function(inner_fn));

        match child.lookup("name") {
            Ok(Binding::Function(f)) => assert_eq!(f, inner_fn),
            other => panic!("expected shadowing binding, got {other:?}"),
        }
        match root.lookup("name") {
            Ok(Binding::Function(f)) => assert_eq!(f, outer_fn),
            other => panic!("expected outer binding, got {other:?}"),
        }
    }
}
