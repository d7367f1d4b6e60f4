//! The shared method cache in front of five-step resolution.
//!
//! A Dictionary keyed by method name; each value is a flat array of
//! (receiver class, calling module, method) triples. The receiver class
//! slot is nil for receiverless calls, so the same name can cache both
//! shapes side by side. Misses that resolve append a triple; nothing is
//! ever evicted. Redefinition empties one name's triple list, a library
//! load replaces the whole dictionary.

use serde::Serialize;

use crate::memory::value::{Ref, Value};
use crate::runtime::dictionary::{dict_at, dict_at_put, dict_count, new_dict};
use crate::runtime::fault::Fault;
use crate::runtime::vm::VM;

pub(crate) const METHOD_CACHE_CAPACITY: usize = 1000;

const TRIPLE_STRIDE: usize = 3;

/// Counter snapshot for the `methodCacheStats` primitive and the stats
/// report.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MethodCacheStats {
    pub selectors: usize,
    pub hits: u64,
    pub misses: u64,
    pub full_clears: u64,
    pub entry_clears: u64,
}

impl VM {
    /// Cached method resolution: the shared cache first, then
    /// [`VM::lookup_method`], appending on success. `Ok(None)` means the
    /// name resolves nowhere; failures are allocation only.
    pub fn find_method(
        &mut self,
        name: &str,
        receiver_class: Option<u32>,
        module: Ref,
    ) -> Result<Option<Ref>, Fault> {
        let key = self.intern(name)?;
        let class_key = match receiver_class {
            Some(c) => Value::Int(c as i32),
            None => Value::Nil,
        };
        let cached = dict_at(&mut self.heap, self.method_cache, Value::Ref(key)).as_ref();
        if let Some(triples) = cached {
            let n = self.heap.word_count(triples);
            let mut i = 0;
            while i + TRIPLE_STRIDE <= n {
                if self.heap.field(triples, i) == class_key
                    && self.heap.field(triples, i + 1) == Value::Ref(module)
                {
                    self.cache_hits += 1;
                    return Ok(self.heap.field(triples, i + 2).as_ref());
                }
                i += TRIPLE_STRIDE;
            }
        }
        self.cache_misses += 1;
        let Some(method) = self.lookup_method(name, receiver_class, module) else {
            return Ok(None);
        };
        let triples = cached.unwrap_or(self.empty_array);
        let n = self.heap.word_count(triples);
        let grown = self.heap.copy_obj(triples, n + TRIPLE_STRIDE, 1)?;
        self.heap.set_field(grown, n, class_key);
        self.heap.set_field(grown, n + 1, Value::Ref(module));
        self.heap.set_field(grown, n + 2, Value::Ref(method));
        dict_at_put(
            &mut self.heap,
            self.method_cache,
            Value::Ref(key),
            Value::Ref(grown),
        )?;
        Ok(Some(method))
    }

    /// Drops every cached resolution by replacing the dictionary.
    pub fn method_cache_clear_all(&mut self) -> Result<(), Fault> {
        self.method_cache = new_dict(&mut self.heap, METHOD_CACHE_CAPACITY)?;
        self.cache_full_clears += 1;
        Ok(())
    }

    /// Empties the triple list for one name, leaving other names warm.
    pub fn method_cache_clear_entry(&mut self, name: &str) -> Result<(), Fault> {
        let key = self.intern(name)?;
        let empty = self.empty_array;
        dict_at_put(
            &mut self.heap,
            self.method_cache,
            Value::Ref(key),
            Value::Ref(empty),
        )?;
        self.cache_entry_clears += 1;
        Ok(())
    }

    pub fn method_cache_stats(&self) -> MethodCacheStats {
        MethodCacheStats {
            selectors: dict_count(&self.heap, self.method_cache),
            hits: self.cache_hits,
            misses: self.cache_misses,
            full_clears: self.cache_full_clears,
            entry_clears: self.cache_entry_clears,
        }
    }
}
