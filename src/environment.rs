use crate::types::{Sexpr, TRUTH};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use thiserror::Error;

// --- Environment Error ---
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnvError {
    #[error("{0} is not bound in any environment")]
    UnboundVariable(String),
    #[error("cannot bind or set {0}")]
    ReservedName(String),
}

// --- Environment Definition ---

#[derive(Debug)]
pub struct Environment {
    // Frames are shared by every closure created in them, and mutated in
    // place by def and set!, hence Rc<RefCell<...>>.
    outer: Option<Rc<RefCell<Environment>>>,
    bindings: HashMap<String, Sexpr>,
}

impl Environment {
    /// Creates a new, top-level (root) environment.
    pub fn new() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Environment {
            outer: None,
            bindings: HashMap::new(),
        }))
    }

    /// Creates a new environment enclosed within an outer one.
    pub fn new_enclosed(outer_env: Rc<RefCell<Environment>>) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Environment {
            outer: Some(outer_env),
            bindings: HashMap::new(),
        }))
    }

    /// Binds `name` in the *current* frame, replacing any existing binding here.
    pub fn bind(&mut self, name: &str, value: Sexpr) -> Result<(), EnvError> {
        if name == TRUTH {
            return Err(EnvError::ReservedName(name.to_string()));
        }
        self.bindings.insert(name.to_string(), value);
        Ok(())
    }

    /// Looks up a variable's value, walking outward through enclosing frames.
    pub fn lookup(&self, name: &str) -> Option<Sexpr> {
        match self.bindings.get(name) {
            Some(value) => Some(value.clone()),
            None => match &self.outer {
                Some(outer_env_ptr) => outer_env_ptr.borrow().lookup(name),
                None => None,
            },
        }
    }

    /// Sets the value of an *existing* variable in the nearest frame that
    /// binds it. Errors if no frame does.
    pub fn update(&mut self, name: &str, value: Sexpr) -> Result<(), EnvError> {
        if name == TRUTH {
            return Err(EnvError::ReservedName(name.to_string()));
        }
        if let Some(value_mut) = self.bindings.get_mut(name) {
            *value_mut = value;
            return Ok(());
        }
        match &self.outer {
            Some(outer_env_ptr) => outer_env_ptr.borrow_mut().update(name, value),
            None => Err(EnvError::UnboundVariable(name.to_string())),
        }
    }

    /// Binds `name` in the root frame of this chain.
    pub fn bind_at_root(&mut self, name: &str, value: Sexpr) -> Result<(), EnvError> {
        match &self.outer {
            Some(outer_env_ptr) => outer_env_ptr.borrow_mut().bind_at_root(name, value),
            None => self.bind(name, value),
        }
    }

    /// Every name visible from this frame, sorted.
    pub fn identifiers(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        self.collect_identifiers(&mut names);
        names.into_iter().collect()
    }

    fn collect_identifiers(&self, names: &mut BTreeSet<String>) {
        names.extend(self.bindings.keys().cloned());
        if let Some(outer_env_ptr) = &self.outer {
            outer_env_ptr.borrow().collect_identifiers(names);
        }
    }
}
