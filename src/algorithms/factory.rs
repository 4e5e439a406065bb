//! Algorithm factory registry.
//!
//! Controllers instantiate algorithms by name through a process-wide registry
//! of constructor functions. Built-in algorithms register on first access;
//! embedders may add their own at any point before streams are built.

use crate::algorithms::{offset::Offset, passthrough::Passthrough, Algorithm};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

/// Constructor for one algorithm kind.
pub type AlgorithmConstructor = Box<dyn Fn() -> Box<dyn Algorithm> + Send + Sync>;

static ALGORITHM_REGISTRY: OnceLock<Mutex<HashMap<String, AlgorithmConstructor>>> =
    OnceLock::new();

fn get_algorithm_registry() -> &'static Mutex<HashMap<String, AlgorithmConstructor>> {
    ALGORITHM_REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn ensure_default_algorithms() {
    static INITIALIZED: OnceLock<()> = OnceLock::new();
    INITIALIZED.get_or_init(|| {
        register_algorithm("Passthrough", Box::new(|| Box::new(Passthrough::new())));
        register_algorithm("Offset", Box::new(|| Box::new(Offset::new())));
        tracing::info!("default algorithms registered");
    });
}

/// Register an algorithm constructor under a stable name. An existing
/// registration with the same name is replaced.
pub fn register_algorithm(name: &str, constructor: AlgorithmConstructor) {
    let mut registry = get_algorithm_registry().lock().expect("algorithm registry");
    registry.insert(name.to_string(), constructor);
}

pub fn algorithm_exists(name: &str) -> bool {
    ensure_default_algorithms();
    get_algorithm_registry()
        .lock()
        .expect("algorithm registry")
        .contains_key(name)
}

pub fn list_algorithms() -> Vec<String> {
    ensure_default_algorithms();
    let registry = get_algorithm_registry().lock().expect("algorithm registry");
    let mut names: Vec<String> = registry.keys().cloned().collect();
    names.sort();
    names
}

/// Instantiate the named algorithm.
pub fn create_algorithm(name: &str) -> Result<Box<dyn Algorithm>> {
    ensure_default_algorithms();
    let registry = get_algorithm_registry().lock().expect("algorithm registry");
    registry
        .get(name)
        .map(|constructor| constructor())
        .ok_or_else(|| anyhow!("algorithm '{}' not found", name))
}
