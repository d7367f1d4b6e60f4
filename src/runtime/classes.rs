//! Classes, functions, modules, and method resolution.
//!
//! All three are plain heap objects; this module gives their fields names
//! and implements definition, lookup, and the cache invalidation that
//! keeps call sites honest when definitions change. The class table is a
//! WeakArray so a class stays alive only while a module or an instance
//! still refers to it; its slot index plus one is the class index stamped
//! into every instance header.

use log::debug;

use crate::memory::header::{
    ARRAY_CLASS, BINARY_DATA_CLASS, BOOLEAN_CLASS, CLASS_CLASS, COMMAND_CLASS, EXTERNAL_REF_CLASS,
    FLOAT_CLASS, FUNCTION_CLASS, INTEGER_CLASS, LAST_BUILTIN_CLASS, LARGE_INTEGER_CLASS, NIL_CLASS,
    REPORTER_CLASS, STRING_CLASS, WEAK_ARRAY_CLASS,
};
use crate::memory::heap::Heap;
use crate::memory::value::{Ref, Value};
use crate::runtime::fault::Fault;
use crate::runtime::node::{self, is_node, node_arg, node_arg_count, node_next, op_matches};
use crate::runtime::vm::VM;

pub const CLASS_NAME: usize = 0;
pub const CLASS_INDEX: usize = 1;
pub const CLASS_FIELD_NAMES: usize = 2;
pub const CLASS_METHODS: usize = 3;
pub const CLASS_COMMENTS: usize = 4;
pub const CLASS_SCRIPTS: usize = 5;
pub const CLASS_MODULE: usize = 6;
pub const CLASS_FIELD_COUNT: usize = 7;

pub const FN_NAME: usize = 0;
pub const FN_CLASS_INDEX: usize = 1;
pub const FN_ARG_NAMES: usize = 2;
pub const FN_LOCAL_NAMES: usize = 3;
pub const FN_BODY: usize = 4;
pub const FN_MODULE: usize = 5;
pub const FN_FIELD_COUNT: usize = 6;

pub const MODULE_NAME: usize = 0;
pub const MODULE_CLASSES: usize = 1;
pub const MODULE_FUNCTIONS: usize = 2;
pub const MODULE_EXPANDERS: usize = 3;
pub const MODULE_VARIABLE_NAMES: usize = 4;
pub const MODULE_VARIABLES: usize = 5;
pub const MODULE_EXPORTS: usize = 6;
pub const MODULE_CODE_HASH: usize = 7;
pub const MODULE_FIELD_COUNT: usize = 8;

/// Names and instance fields of the classes created at startup, in class
/// index order starting at 1.
pub const BOOTSTRAP_CLASSES: &[(&str, &[&str])] = &[
    ("Nil", &[]),
    ("Boolean", &[]),
    ("Integer", &[]),
    ("Float", &[]),
    ("String", &[]),
    ("Array", &[]),
    ("BinaryData", &[]),
    ("ExternalReference", &[]),
    ("List", &["first", "last", "contents"]),
    ("Dictionary", &["tally", "keys", "values"]),
    (
        "Command",
        &["primName", "lineno", "fileName", "cache", "cachedClassID", "nextBlock"],
    ),
    (
        "Reporter",
        &["primName", "lineno", "fileName", "cache", "cachedClassID", "nextBlock"],
    ),
    (
        "Class",
        &["className", "classIndex", "fieldNames", "methods", "comments", "scripts", "module"],
    ),
    (
        "Function",
        &["functionName", "classIndex", "argNames", "localNames", "cmdList", "module"],
    ),
    (
        "Module",
        &[
            "moduleName",
            "classes",
            "functions",
            "expanders",
            "variableNames",
            "variables",
            "exports",
            "codeHash",
        ],
    ),
    (
        "Task",
        &[
            "stack",
            "frames",
            "base",
            "mframe",
            "currentBlock",
            "nextBlock",
            "result",
            "tickLimit",
            "taskToResume",
            "waitReason",
            "wakeMSecs",
            "profileArray",
            "profileIndex",
            "errorReason",
        ],
    ),
    ("WeakArray", &[]),
    ("LargeInteger", &["data", "negative"]),
];

// Classes whose instances are immediates or raw bytes, or need an explicit
// size; `new_instance` refuses all of them.
const UNINSTANTIABLE: &[u32] = &[
    NIL_CLASS,
    BOOLEAN_CLASS,
    INTEGER_CLASS,
    FLOAT_CLASS,
    STRING_CLASS,
    ARRAY_CLASS,
    BINARY_DATA_CLASS,
    EXTERNAL_REF_CLASS,
    WEAK_ARRAY_CLASS,
    LARGE_INTEGER_CLASS,
];

pub fn function_name(heap: &Heap, function: Ref) -> Option<Ref> {
    heap.field(function, FN_NAME).as_ref()
}

pub fn function_class_index(heap: &Heap, function: Ref) -> u32 {
    match heap.field(function, FN_CLASS_INDEX) {
        Value::Int(n) if n > 0 => n as u32,
        _ => 0,
    }
}

pub fn function_arg_names(heap: &Heap, function: Ref) -> Option<Ref> {
    heap.field(function, FN_ARG_NAMES).as_ref()
}

pub fn function_local_names(heap: &Heap, function: Ref) -> Option<Ref> {
    heap.field(function, FN_LOCAL_NAMES).as_ref()
}

pub fn function_body(heap: &Heap, function: Ref) -> Option<Ref> {
    heap.field(function, FN_BODY).as_ref()
}

pub fn function_module(heap: &Heap, function: Ref) -> Option<Ref> {
    heap.field(function, FN_MODULE).as_ref()
}

/// Position of `name` in an array of interned strings.
pub(crate) fn name_position(heap: &Heap, names: Option<Ref>, name: &str) -> Option<usize> {
    let names = names?;
    (0..heap.word_count(names)).find(|i| match heap.field(names, *i) {
        Value::Ref(s) => heap.str_matches(s, name),
        _ => false,
    })
}

/// Scans an array of Function objects for one matching `name`, and for
/// `class_index` too when given (expander lookup).
fn function_position(
    heap: &Heap,
    functions: Ref,
    name: &str,
    class_index: Option<u32>,
) -> Option<usize> {
    (0..heap.word_count(functions)).find(|i| {
        let Some(f) = heap.field(functions, *i).as_ref() else {
            return false;
        };
        if let Some(c) = class_index {
            if function_class_index(heap, f) != c {
                return false;
            }
        }
        match function_name(heap, f) {
            Some(n) => heap.str_matches(n, name),
            None => false,
        }
    })
}

impl VM {
    // ---- class table ---------------------------------------------------

    /// Installs a class object in the weak class table and returns its
    /// assigned index. Slots freed by collected classes are reused; the
    /// bootstrap slots never are.
    fn assign_class_index(&mut self, class: Ref) -> Result<u32, Fault> {
        let table = self.classes;
        let count = self.heap.word_count(table);
        for slot in LAST_BUILTIN_CLASS as usize..count {
            if self.heap.field(table, slot).is_nil() {
                self.heap.set_field(table, slot, Value::Ref(class));
                return Ok(slot as u32 + 1);
            }
        }
        let grown = self.heap.copy_obj(table, count * 2, 1)?;
        self.heap.set_field(grown, count, Value::Ref(class));
        self.classes = grown;
        Ok(count as u32 + 1)
    }

    pub fn class_from_index(&self, class_index: u32) -> Option<Ref> {
        if class_index == 0 {
            return None;
        }
        let slot = class_index as usize - 1;
        if slot >= self.heap.word_count(self.classes) {
            return None;
        }
        self.heap.field(self.classes, slot).as_ref()
    }

    /// The printable name of a class, or a stand-in for a stale index.
    pub fn class_name(&self, class_index: u32) -> String {
        self.class_from_index(class_index)
            .and_then(|c| self.heap.field(c, CLASS_NAME).as_ref())
            .map(|n| self.heap.string_value(n))
            .unwrap_or_else(|| format!("Class{}", class_index))
    }

    /// Every live class object, in index order.
    pub fn all_classes(&self) -> Vec<Ref> {
        (0..self.heap.word_count(self.classes))
            .filter_map(|slot| self.heap.field(self.classes, slot).as_ref())
            .collect()
    }

    /// A class by name in `module` only, without the top-level delegate.
    pub fn class_named_here(&self, module: Ref, name: &str) -> Option<Ref> {
        let classes = self.heap.field(module, MODULE_CLASSES).as_ref()?;
        (0..self.heap.word_count(classes)).find_map(|i| {
            let c = self.heap.field(classes, i).as_ref()?;
            let n = self.heap.field(c, CLASS_NAME).as_ref()?;
            self.heap.str_matches(n, name).then_some(c)
        })
    }

    /// A class by name in `module`, falling back to the top-level module.
    pub fn class_named(&self, module: Ref, name: &str) -> Option<Ref> {
        self.class_named_here(module, name).or_else(|| {
            if module == self.top_module {
                None
            } else {
                self.class_named_here(self.top_module, name)
            }
        })
    }

    // ---- definition ----------------------------------------------------

    /// Creates a class in the current module, or returns the existing one
    /// when the name is already defined.
    pub fn define_class(&mut self, name: &str, field_names: &[&str]) -> Result<Ref, Fault> {
        if let Some(existing) = self.class_named(self.current_module, name) {
            return Ok(existing);
        }
        let name_ref = self.intern(name)?;
        let mut fields = self.empty_array;
        for f in field_names {
            let s = self.intern(f)?;
            fields = self.heap.append(fields, Value::Ref(s))?;
        }
        let class = self.heap.allocate(CLASS_CLASS, CLASS_FIELD_COUNT, Value::Nil)?;
        self.heap.set_field(class, CLASS_NAME, Value::Ref(name_ref));
        self.heap.set_field(class, CLASS_FIELD_NAMES, Value::Ref(fields));
        self.heap.set_field(class, CLASS_METHODS, Value::Ref(self.empty_array));
        self.heap.set_field(class, CLASS_COMMENTS, Value::Ref(self.empty_array));
        self.heap.set_field(class, CLASS_SCRIPTS, Value::Ref(self.empty_array));
        self.heap.set_field(class, CLASS_MODULE, Value::Ref(self.current_module));
        let index = self.assign_class_index(class)?;
        self.heap.set_field(class, CLASS_INDEX, Value::Int(index as i32));
        let module = self.current_module;
        let listed = self.heap.field(module, MODULE_CLASSES).as_ref();
        let grown = match listed {
            Some(array) => self.heap.append(array, Value::Ref(class))?,
            None => self.heap.append(self.empty_array, Value::Ref(class))?,
        };
        self.heap.set_field(module, MODULE_CLASSES, Value::Ref(grown));
        debug!("class {} defined with index {}", name, index);
        Ok(class)
    }

    /// A new instance of the class, every field nil. Classes whose
    /// instances are immediates, raw bytes, or sized collections cannot be
    /// made this way.
    pub fn new_instance(&mut self, class_index: u32) -> Result<Ref, Fault> {
        let Some(class) = self.class_from_index(class_index) else {
            return Err(Fault::bad_call(format!(
                "Unknown class index: {}",
                class_index
            )));
        };
        if UNINSTANTIABLE.contains(&class_index) {
            return Err(Fault::bad_call(format!(
                "Cannot create an instance of {}",
                self.class_name(class_index)
            )));
        }
        let count = match self.heap.field(class, CLASS_FIELD_NAMES).as_ref() {
            Some(names) => self.heap.word_count(names),
            None => 0,
        };
        Ok(self.heap.allocate(class_index, count, Value::Nil)?)
    }

    /// Zero-based position of a named field, from the class of the index.
    pub fn field_index_of(&self, class_index: u32, name: &str) -> Option<usize> {
        let class = self.class_from_index(class_index)?;
        name_position(
            &self.heap,
            self.heap.field(class, CLASS_FIELD_NAMES).as_ref(),
            name,
        )
    }

    /// Appends a field name to a class. Existing instances keep their old
    /// size; reads of the missing field produce nil.
    pub fn add_field(&mut self, class: Ref, name: &str) -> Result<(), Fault> {
        let names = self.heap.field(class, CLASS_FIELD_NAMES).as_ref();
        if name_position(&self.heap, names, name).is_some() {
            return Ok(());
        }
        let s = self.intern(name)?;
        let grown = match names {
            Some(array) => self.heap.append(array, Value::Ref(s))?,
            None => self.heap.append(self.empty_array, Value::Ref(s))?,
        };
        self.heap.set_field(class, CLASS_FIELD_NAMES, Value::Ref(grown));
        // Field bindings cached on nodes may now be stale.
        self.clear_call_site_caches();
        Ok(())
    }

    fn make_function(
        &mut self,
        name: Option<&str>,
        class_index: u32,
        arg_names: &[String],
        local_names: &[String],
        body: Option<Ref>,
        module: Ref,
    ) -> Result<Ref, Fault> {
        let name_val = match name {
            Some(n) => Value::Ref(self.intern(n)?),
            None => Value::Nil,
        };
        let mut args = self.empty_array;
        for n in arg_names {
            let s = self.intern(n)?;
            args = self.heap.append(args, Value::Ref(s))?;
        }
        let mut locals = self.empty_array;
        for n in local_names {
            let s = self.intern(n)?;
            locals = self.heap.append(locals, Value::Ref(s))?;
        }
        let f = self.heap.allocate(FUNCTION_CLASS, FN_FIELD_COUNT, Value::Nil)?;
        self.heap.set_field(f, FN_NAME, name_val);
        self.heap.set_field(f, FN_CLASS_INDEX, Value::Int(class_index as i32));
        self.heap.set_field(f, FN_ARG_NAMES, Value::Ref(args));
        self.heap.set_field(f, FN_LOCAL_NAMES, Value::Ref(locals));
        let body_val = match body {
            Some(b) => Value::Ref(b),
            None => Value::Nil,
        };
        self.heap.set_field(f, FN_BODY, body_val);
        self.heap.set_field(f, FN_MODULE, Value::Ref(module));
        Ok(f)
    }

    fn check_body(&self, body: Option<Ref>) -> Result<(), Fault> {
        if let Some(b) = body {
            if self.heap.class_index(b) != COMMAND_CLASS {
                return Err(Fault::bad_call("Function body must be a command list"));
            }
        }
        Ok(())
    }

    /// Defines or replaces a method on a class. The receiver argument
    /// `this` is implicit and always first; explicit argument names must
    /// not shadow the class's fields.
    pub fn add_method(
        &mut self,
        class: Ref,
        name: &str,
        arg_names: &[&str],
        body: Option<Ref>,
    ) -> Result<Ref, Fault> {
        self.check_body(body)?;
        let class_index = match self.heap.field(class, CLASS_INDEX) {
            Value::Int(n) if n > 0 => n as u32,
            _ => return Err(Fault::bad_call("Bad class in method definition")),
        };
        let mut args: Vec<String> = vec!["this".to_string()];
        for a in arg_names {
            if *a != "this" {
                args.push((*a).to_string());
            }
        }
        let field_names = self.field_name_strings(class);
        for a in &args[1..] {
            if field_names.iter().any(|f| f == a) {
                return Err(Fault::bad_call(format!(
                    "Argument name '{}' shadows a field name",
                    a
                )));
            }
        }
        let mut skip = args.clone();
        skip.extend(field_names);
        let locals = collect_local_names(&self.heap, body, &skip)?;
        let module = self
            .heap
            .field(class, CLASS_MODULE)
            .as_ref()
            .unwrap_or(self.current_module);
        let f = self.make_function(Some(name), class_index, &args, &locals, body, module)?;
        let methods = self.heap.field(class, CLASS_METHODS).as_ref();
        let installed = self.install_function(methods, f, name, Some(class_index))?;
        self.heap.set_field(class, CLASS_METHODS, Value::Ref(installed));
        self.invalidate_for(name)?;
        Ok(f)
    }

    /// Defines or replaces a free function in a module. `this` is reserved
    /// for methods and rejected here.
    pub fn add_function(
        &mut self,
        module: Ref,
        name: &str,
        arg_names: &[&str],
        body: Option<Ref>,
    ) -> Result<Ref, Fault> {
        self.check_body(body)?;
        if arg_names.contains(&"this") {
            return Err(Fault::bad_call("'this' can only be used in methods"));
        }
        let args: Vec<String> = arg_names.iter().map(|a| (*a).to_string()).collect();
        let locals = collect_local_names(&self.heap, body, &args)?;
        let f = self.make_function(Some(name), 0, &args, &locals, body, module)?;
        let functions = self.heap.field(module, MODULE_FUNCTIONS).as_ref();
        let installed = self.install_function(functions, f, name, Some(0))?;
        self.heap.set_field(module, MODULE_FUNCTIONS, Value::Ref(installed));
        self.invalidate_for(name)?;
        Ok(f)
    }

    /// An uninstalled Function for the `function` primitive: no name, no
    /// receiver, usable only through `call`/`callWith`.
    pub fn anonymous_function(
        &mut self,
        arg_names: &[&str],
        body: Option<Ref>,
    ) -> Result<Ref, Fault> {
        self.check_body(body)?;
        if arg_names.contains(&"this") {
            return Err(Fault::bad_call("'this' can only be used in methods"));
        }
        let args: Vec<String> = arg_names.iter().map(|a| (*a).to_string()).collect();
        let locals = collect_local_names(&self.heap, body, &args)?;
        let module = self.current_module;
        self.make_function(None, 0, &args, &locals, body, module)
    }

    fn field_name_strings(&self, class: Ref) -> Vec<String> {
        match self.heap.field(class, CLASS_FIELD_NAMES).as_ref() {
            Some(names) => (0..self.heap.word_count(names))
                .filter_map(|i| {
                    self.heap
                        .field(names, i)
                        .as_ref()
                        .map(|s| self.heap.string_value(s))
                })
                .collect(),
            None => Vec::new(),
        }
    }

    /// Replace-by-name install into a method or function array, matching
    /// the class index so expanders and plain functions stay distinct.
    fn install_function(
        &mut self,
        array: Option<Ref>,
        function: Ref,
        name: &str,
        class_index: Option<u32>,
    ) -> Result<Ref, Fault> {
        let array = array.unwrap_or(self.empty_array);
        match function_position(&self.heap, array, name, class_index) {
            Some(i) => {
                self.heap.set_field(array, i, Value::Ref(function));
                Ok(array)
            }
            None => Ok(self.heap.append(array, Value::Ref(function))?),
        }
    }

    /// Post-definition invalidation: the shared cache entry for the name
    /// always, the call-site caches unless a library load is batching.
    fn invalidate_for(&mut self, name: &str) -> Result<(), Fault> {
        self.method_cache_clear_entry(name)?;
        self.clear_call_site_caches();
        Ok(())
    }

    // ---- module variables ----------------------------------------------

    pub fn module_variable_index(&self, module: Ref, name: &str) -> Option<usize> {
        name_position(
            &self.heap,
            self.heap.field(module, MODULE_VARIABLE_NAMES).as_ref(),
            name,
        )
    }

    pub fn module_variable(&self, module: Ref, index: usize) -> Value {
        match self.heap.field(module, MODULE_VARIABLES).as_ref() {
            Some(vars) if index < self.heap.word_count(vars) => self.heap.field(vars, index),
            _ => Value::Nil,
        }
    }

    pub fn set_module_variable(&mut self, module: Ref, index: usize, v: Value) {
        if let Some(vars) = self.heap.field(module, MODULE_VARIABLES).as_ref() {
            if index < self.heap.word_count(vars) {
                self.heap.set_field(vars, index, v);
            }
        }
    }

    /// Sets a module variable, creating it when the name is new. A new
    /// name can change what cached bindings mean, so call sites are
    /// flushed on creation only.
    pub fn add_module_variable(
        &mut self,
        module: Ref,
        name: &str,
        value: Value,
    ) -> Result<usize, Fault> {
        if let Some(i) = self.module_variable_index(module, name) {
            self.set_module_variable(module, i, value);
            return Ok(i);
        }
        let s = self.intern(name)?;
        let names = self
            .heap
            .field(module, MODULE_VARIABLE_NAMES)
            .as_ref()
            .unwrap_or(self.empty_array);
        let vars = self
            .heap
            .field(module, MODULE_VARIABLES)
            .as_ref()
            .unwrap_or(self.empty_array);
        let index = self.heap.word_count(names);
        let names = self.heap.append(names, Value::Ref(s))?;
        let vars = self.heap.append(vars, value)?;
        self.heap.set_field(module, MODULE_VARIABLE_NAMES, Value::Ref(names));
        self.heap.set_field(module, MODULE_VARIABLES, Value::Ref(vars));
        self.clear_call_site_caches();
        Ok(index)
    }

    // ---- resolution ----------------------------------------------------

    /// Uncached five-step resolution; `find_method` adds the shared cache
    /// in front of this. A call with a receiver that matches no expander
    /// and no method falls through to plain functions, which then see the
    /// receiver as an ordinary first argument.
    pub fn lookup_method(
        &self,
        name: &str,
        receiver_class: Option<u32>,
        module: Ref,
    ) -> Option<Ref> {
        if let Some(c) = receiver_class {
            if let Some(f) = self.expander_in(module, name, c) {
                return Some(f);
            }
            if let Some(f) = self.method_on_class(c, name) {
                return Some(f);
            }
        }
        if let Some(f) = self.function_in(module, name) {
            return Some(f);
        }
        if module != self.top_module {
            if let Some(c) = receiver_class {
                if let Some(f) = self.expander_in(self.top_module, name, c) {
                    return Some(f);
                }
            }
            if let Some(f) = self.function_in(self.top_module, name) {
                return Some(f);
            }
        }
        if self.session_module != module && self.session_module != self.top_module {
            if let Some(c) = receiver_class {
                if let Some(f) = self.expander_in(self.session_module, name, c) {
                    return Some(f);
                }
            }
            if let Some(f) = self.function_in(self.session_module, name) {
                return Some(f);
            }
        }
        None
    }

    fn expander_in(&self, module: Ref, name: &str, class_index: u32) -> Option<Ref> {
        let expanders = self.heap.field(module, MODULE_EXPANDERS).as_ref()?;
        let i = function_position(&self.heap, expanders, name, Some(class_index))?;
        self.heap.field(expanders, i).as_ref()
    }

    fn method_on_class(&self, class_index: u32, name: &str) -> Option<Ref> {
        let class = self.class_from_index(class_index)?;
        let methods = self.heap.field(class, CLASS_METHODS).as_ref()?;
        let i = function_position(&self.heap, methods, name, Some(class_index))?;
        self.heap.field(methods, i).as_ref()
    }

    fn function_in(&self, module: Ref, name: &str) -> Option<Ref> {
        let functions = self.heap.field(module, MODULE_FUNCTIONS).as_ref()?;
        let i = function_position(&self.heap, functions, name, Some(0))?;
        self.heap.field(functions, i).as_ref()
    }

    // ---- bulk load and invalidation ------------------------------------

    /// Starts a library load: call-site flushes are suppressed until
    /// [`VM::end_library_load`] performs one full invalidation.
    pub fn begin_library_load(&mut self) {
        self.reading_library = true;
    }

    pub fn end_library_load(&mut self) -> Result<(), Fault> {
        self.reading_library = false;
        self.method_cache_clear_all()?;
        self.clear_call_site_caches();
        Ok(())
    }

    /// Resets every Command and Reporter call site in the heap: target
    /// word, cached method or binding, and cached receiver class. A no-op
    /// during a library load.
    pub fn clear_call_site_caches(&mut self) {
        if self.reading_library {
            return;
        }
        let mut prev = None;
        let mut cleared = 0usize;
        while let Some(obj) = self.heap.object_after(prev, 0) {
            let class = self.heap.class_index(obj);
            if class == COMMAND_CLASS || class == REPORTER_CLASS {
                node::reset_call_site(&mut self.heap, obj);
                cleared += 1;
            }
            prev = Some(obj);
        }
        debug!("cleared {} call sites", cleared);
    }
}

/// Walks a command list collecting the names this body assigns, which
/// become the function's local slots. Skips names already bound (arguments
/// and fields) and does not descend into nested definitions, whose locals
/// are their own.
fn collect_local_names(heap: &Heap, body: Option<Ref>, skip: &[String]) -> Result<Vec<String>, Fault> {
    let mut locals = Vec::new();
    let mut for_vars = Vec::new();
    if let Some(b) = body {
        walk_for_locals(heap, b, skip, &mut locals, &mut for_vars)?;
    }
    Ok(locals)
}

fn walk_for_locals(
    heap: &Heap,
    first: Ref,
    skip: &[String],
    locals: &mut Vec<String>,
    for_vars: &mut Vec<String>,
) -> Result<(), Fault> {
    let mut cur = Some(first);
    while let Some(n) = cur {
        if op_matches(heap, n, "function")
            || op_matches(heap, n, "to")
            || op_matches(heap, n, "method")
        {
            cur = node_next(heap, n);
            continue;
        }
        if op_matches(heap, n, "for") {
            let var = match node_arg(heap, n, 0).as_ref() {
                Some(s) if heap.class_index(s) == STRING_CLASS => heap.string_value(s),
                _ => {
                    cur = node_next(heap, n);
                    continue;
                }
            };
            if for_vars.contains(&var) {
                return Err(Fault::bad_call(format!(
                    "Variable '{}' is already used by an enclosing 'for'",
                    var
                )));
            }
            if !skip.contains(&var) && !locals.contains(&var) {
                locals.push(var.clone());
            }
            if node_arg_count(heap, n) > 1 {
                if let Value::Ref(count_arg) = node_arg(heap, n, 1) {
                    if is_node(heap, Value::Ref(count_arg)) {
                        walk_for_locals(heap, count_arg, skip, locals, for_vars)?;
                    }
                }
            }
            if node_arg_count(heap, n) > 2 {
                if let Value::Ref(loop_body) = node_arg(heap, n, 2) {
                    if is_node(heap, Value::Ref(loop_body)) {
                        for_vars.push(var);
                        walk_for_locals(heap, loop_body, skip, locals, for_vars)?;
                        for_vars.pop();
                    }
                }
            }
            cur = node_next(heap, n);
            continue;
        }
        if op_matches(heap, n, "=") || op_matches(heap, n, "+=") || op_matches(heap, n, "local") {
            if let Some(s) = node_arg(heap, n, 0).as_ref() {
                if heap.class_index(s) == STRING_CLASS {
                    let var = heap.string_value(s);
                    if !skip.contains(&var) && !locals.contains(&var) {
                        locals.push(var);
                    }
                }
            }
        }
        for i in 0..node_arg_count(heap, n) {
            let arg = node_arg(heap, n, i);
            if let Value::Ref(r) = arg {
                if is_node(heap, arg) {
                    walk_for_locals(heap, r, skip, locals, for_vars)?;
                }
            }
        }
        cur = node_next(heap, n);
    }
    Ok(())
}
