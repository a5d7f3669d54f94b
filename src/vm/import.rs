// Nova Import Protocol
// The importer itself (file resolution, compilation) lives outside the VM;
// the VM drives it through ModuleLoader and handles binding and the
// run-once module initialization

use std::sync::Arc;

use super::value::{Module, NovaString, Value};
use super::vm::VM;

/// External importer seam. An implementation resolves `name` to source or
/// serialized bytecode, compiles it, registers the module on the VM (see
/// `VM::define_module`) and stores its main function on the module for the
/// first-run step. Returns false when the module cannot be loaded.
pub trait ModuleLoader {
    fn load_module(&mut self, vm: &mut VM, name: &str) -> bool;
}

impl VM {
    /// Create and register a module, seeding its globals with the core
    /// classes so names like `Exception` resolve everywhere.
    pub fn define_module(&mut self, name: &str) -> Arc<Module> {
        let name = self.intern(name);
        let module = Arc::new(Module::new(name.clone()));
        *module.globals.write() = self.core_module.globals.read().clone();
        self.modules.insert(name, module.clone());
        module
    }

    pub fn get_module(&self, name: &str) -> Option<Arc<Module>> {
        self.modules
            .values()
            .find(|m| m.name.as_str() == name)
            .cloned()
    }

    /// Shared load step of the import opcodes. Ensures the module is
    /// registered (consulting the loader on first sight) and leaves its
    /// not-yet-run main function on the stack, or null when there is nothing
    /// left to run.
    pub(crate) fn import_module(&mut self, name: &Arc<NovaString>) -> bool {
        if !self.modules.contains_key(name) {
            let Some(mut loader) = self.loader.take() else {
                return false;
            };
            let loaded = loader.load_module(self, name.as_str());
            self.loader = Some(loader);
            if !loaded || !self.modules.contains_key(name) {
                return false;
            }
        }

        let module = self.modules.get(name).cloned().unwrap();
        match module.main.lock().take() {
            Some(main) => self.push(Value::Function(main)),
            None => self.push(Value::Null),
        }
        true
    }
}
