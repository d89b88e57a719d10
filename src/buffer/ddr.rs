//! Persistent buffer pass.
//!
//! Assigns outer-memory offsets to the read-only constants and data buffers
//! of every function in a module. Constants are placed once per module kind
//! and shared by content; data buffers get a per-function region laid out by
//! the [`LifetimeScheduler`]. Scheduling state lives in a [`DdrContext`] that
//! is scoped to one module run.

use crate::buffer::lifetime::{usage, Allocation, LifetimeScheduler, LiveBuffer};
use crate::error::ScheduleResult;
use crate::schedule::{Lifetime, SolvedTree};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

/// Named storage regions in outer memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryLocation {
    /// Read-only constants
    Rdata,
    /// Function-private data
    Data,
}

/// A constant tensor. Equality and hashing are by content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConstTensor {
    pub dtype: String,
    pub shape: Vec<i64>,
    pub bytes: Vec<u8>,
}

impl ConstTensor {
    pub fn new(dtype: &str, shape: Vec<i64>, bytes: Vec<u8>) -> Self {
        Self {
            dtype: dtype.to_string(),
            shape,
            bytes,
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Placement of one constant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RdataPlacement {
    /// Index into the function's constants
    pub index: usize,
    pub range: Range<u64>,
}

/// Scheduling outcome of a function.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedResult {
    /// Constants first placed by this function
    pub rdatas: Vec<RdataPlacement>,
    /// Offsets of the function's data buffers
    pub data: Vec<Allocation>,
    /// Bytes of the data region
    pub data_usage: u64,
    pub is_scheduled: bool,
}

/// A function whose outer-memory buffers need offsets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    /// Functions of the same kind share one rdata space
    pub module_kind: String,
    pub constants: Vec<ConstTensor>,
    pub data_buffers: Vec<LiveBuffer>,
    /// Offset of every constant, including deduplicated ones
    #[serde(default)]
    pub const_ranges: Vec<Range<u64>>,
    #[serde(default)]
    pub sched: SchedResult,
}

impl Function {
    pub fn new(name: &str, module_kind: &str) -> Self {
        Self {
            name: name.to_string(),
            module_kind: module_kind.to_string(),
            constants: Vec::new(),
            data_buffers: Vec::new(),
            const_ranges: Vec::new(),
            sched: SchedResult::default(),
        }
    }

    pub fn constant(mut self, constant: ConstTensor) -> Self {
        self.constants.push(constant);
        self
    }

    pub fn data_buffer(mut self, buffer: LiveBuffer) -> Self {
        self.data_buffers.push(buffer);
        self
    }

    /// Function whose data buffers are the outer-level buffers of solved
    /// trees, run one after another.
    pub fn from_solved(name: &str, module_kind: &str, trees: &[&SolvedTree]) -> Self {
        let mut func = Self::new(name, module_kind);
        let mut base = 0;
        for (i, tree) in trees.iter().enumerate() {
            let buffers = tree.ddr_buffers();
            let span = buffers.iter().map(|b| b.lifetime.end + 1).max().unwrap_or(0);
            for b in buffers {
                func.data_buffers.push(LiveBuffer::new(
                    &format!("t{}_{}", i, b.name),
                    b.size_bytes,
                    Lifetime::new(b.lifetime.start + base, b.lifetime.end + base),
                ));
            }
            base += span;
        }
        func
    }
}

/// A compile module: functions emitted together.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Module {
    pub functions: Vec<Function>,
}

/// Usage counters and constant placements accumulated over one module run.
#[derive(Debug, Default)]
pub struct DdrContext {
    usage: HashMap<String, BTreeMap<MemoryLocation, u64>>,
    rdatas: HashMap<String, HashMap<ConstTensor, Range<u64>>>,
}

impl DdrContext {
    /// Bytes used at `location` by functions of `module_kind`.
    pub fn usage(&self, module_kind: &str, location: MemoryLocation) -> u64 {
        self.usage
            .get(module_kind)
            .and_then(|u| u.get(&location))
            .copied()
            .unwrap_or(0)
    }
}

/// Rewrites one function against a shared context.
struct FunctionScheduler<'a> {
    ctx: &'a mut DdrContext,
    lifetimes: &'a LifetimeScheduler,
    changed: bool,
}

impl<'a> FunctionScheduler<'a> {
    fn place_constants(&mut self, func: &mut Function) {
        let kind = func.module_kind.clone();
        func.const_ranges.clear();
        for (index, constant) in func.constants.iter().enumerate() {
            let placed = self.ctx.rdatas.entry(kind.clone()).or_default();
            let range = match placed.get(constant) {
                Some(range) => range.clone(),
                None => {
                    let used = self
                        .ctx
                        .usage
                        .entry(kind.clone())
                        .or_default()
                        .entry(MemoryLocation::Rdata)
                        .or_insert(0);
                    let range = *used..*used + constant.size_bytes();
                    *used = range.end;
                    placed.insert(constant.clone(), range.clone());
                    func.sched.rdatas.push(RdataPlacement {
                        index,
                        range: range.clone(),
                    });
                    self.changed = true;
                    range
                }
            };
            func.const_ranges.push(range);
        }
    }

    fn place_data(&mut self, func: &mut Function) {
        if func.data_buffers.is_empty() {
            return;
        }
        let allocs = self.lifetimes.schedule(&func.data_buffers);
        func.sched.data_usage = usage(&allocs);
        func.sched.data = allocs;
        self.changed = true;
    }
}

/// Module pass assigning outer-memory offsets.
#[derive(Debug, Clone, Default)]
pub struct DdrBufferScheduler {
    lifetimes: LifetimeScheduler,
}

impl DdrBufferScheduler {
    pub fn new(alignment: u64) -> Self {
        Self {
            lifetimes: LifetimeScheduler::new(alignment),
        }
    }

    /// Schedule every function of `module` not yet scheduled. Returns the
    /// context so callers can inspect module-level usage; it is not reused.
    pub fn run(&self, module: &mut Module) -> ScheduleResult<DdrContext> {
        let mut ctx = DdrContext::default();
        for func in module.functions.iter_mut() {
            if func.sched.is_scheduled {
                continue;
            }
            let mut sched = FunctionScheduler {
                ctx: &mut ctx,
                lifetimes: &self.lifetimes,
                changed: false,
            };
            sched.place_constants(func);
            sched.place_data(func);
            if sched.changed {
                func.sched.is_scheduled = true;
                debug!(
                    "scheduled {}: {} new rdatas, data usage {}B",
                    func.name,
                    func.sched.rdatas.len(),
                    func.sched.data_usage
                );
            }
        }
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights(v: u8) -> ConstTensor {
        ConstTensor::new("f32", vec![4], vec![v; 16])
    }

    #[test]
    fn test_constants_shared_by_content() {
        let mut module = Module {
            functions: vec![
                Function::new("f", "cpu").constant(weights(1)).constant(weights(2)),
                Function::new("g", "cpu").constant(weights(2)).constant(weights(3)),
            ],
        };
        let ctx = DdrBufferScheduler::default().run(&mut module).unwrap();
        let (f, g) = (&module.functions[0], &module.functions[1]);
        assert_eq!(f.const_ranges, vec![0..16, 16..32]);
        assert_eq!(g.const_ranges, vec![16..32, 32..48]);
        assert_eq!(g.sched.rdatas.len(), 1);
        assert_eq!(ctx.usage("cpu", MemoryLocation::Rdata), 48);
        assert!(f.sched.is_scheduled && g.sched.is_scheduled);
    }

    #[test]
    fn test_module_kinds_have_separate_spaces() {
        let mut module = Module {
            functions: vec![
                Function::new("f", "cpu").constant(weights(1)),
                Function::new("g", "npu").constant(weights(1)),
            ],
        };
        DdrBufferScheduler::default().run(&mut module).unwrap();
        assert_eq!(module.functions[1].const_ranges, vec![0..16]);
    }

    #[test]
    fn test_unchanged_function_not_finalized() {
        let mut module = Module {
            functions: vec![
                Function::new("f", "cpu").constant(weights(1)),
                Function::new("g", "cpu").constant(weights(1)),
                Function::new("h", "cpu"),
            ],
        };
        DdrBufferScheduler::default().run(&mut module).unwrap();
        // g only reuses f's constant
        assert!(!module.functions[1].sched.is_scheduled);
        assert_eq!(module.functions[1].const_ranges, vec![0..16]);
        assert!(!module.functions[2].sched.is_scheduled);
    }

    #[test]
    fn test_context_not_carried_across_runs() {
        let mut module = Module {
            functions: vec![Function::new("f", "cpu").constant(weights(1))],
        };
        let scheduler = DdrBufferScheduler::default();
        scheduler.run(&mut module).unwrap();
        let mut other = Module {
            functions: vec![Function::new("g", "cpu").constant(weights(9))],
        };
        let ctx = scheduler.run(&mut other).unwrap();
        assert_eq!(other.functions[0].const_ranges, vec![0..16]);
        assert_eq!(ctx.usage("cpu", MemoryLocation::Rdata), 16);
    }

    #[test]
    fn test_data_buffers_use_lifetimes() {
        let mut module = Module {
            functions: vec![Function::new("f", "cpu")
                .data_buffer(LiveBuffer::new("a", 64, Lifetime::new(0, 1)))
                .data_buffer(LiveBuffer::new("b", 64, Lifetime::new(2, 3)))
                .data_buffer(LiveBuffer::new("c", 64, Lifetime::new(1, 2)))],
        };
        DdrBufferScheduler::new(64).run(&mut module).unwrap();
        let f = &module.functions[0];
        assert_eq!(f.sched.data_usage, 128);
        assert!(f.sched.is_scheduled);
    }
}
