//! A `CallableResolver` that binds every `(module, name)` lookup to a
//! subprocess invocation of a single user-supplied Python module (the
//! `--functions <module>` CLI flag), per spec.md §6's callable resolver
//! contract. One `SubprocessCallable` spawn is built per resolved name; the
//! resolver itself holds no process handles.

use std::sync::Arc;

use wirl_engine::{Callable, CallableResolver, SubprocessCallable};

pub struct SubprocessModuleResolver {
    module: String,
}

impl SubprocessModuleResolver {
    pub fn new(module: String) -> Self {
        Self { module }
    }
}

impl CallableResolver for SubprocessModuleResolver {
    fn resolve(&self, _module: &str, name: &str) -> Option<Arc<dyn Callable>> {
        Some(Arc::new(SubprocessCallable {
            program: "python3".to_string(),
            args: vec!["-m".to_string(), self.module.clone()],
            module: self.module.clone(),
            name: name.to_string(),
        }))
    }
}
