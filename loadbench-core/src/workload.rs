//! Workload Registry
//!
//! A workload is a type implementing [`Workload`], registered under a string id
//! with [`workload!`](crate::workload). The orchestrator only ever names a workload
//! by id; the worker process looks the id up in the same registry, decodes the
//! JSON context and drives the hooks.

use serde::de::DeserializeOwned;

/// Error returned by a workload hook
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a workload hook
pub type HookResult = Result<(), HookError>;

/// User code under measurement
///
/// One instance is created per run with `Default` and lives in the worker
/// process for the whole run, so state written in `setup` is visible to every
/// later hook.
pub trait Workload: 'static {
    /// User-supplied context, decoded once per run and passed to every hook
    type Context: DeserializeOwned;

    /// Called once before warmup
    fn setup(&mut self, _context: &Self::Context) -> HookResult {
        Ok(())
    }

    /// Called before every warmup and measured round, outside the timed window
    fn prerun(&mut self, _context: &Self::Context) -> HookResult {
        Ok(())
    }

    /// The measured call
    fn run(&mut self, context: &Self::Context) -> HookResult;
}

/// A workload bound to its decoded context
pub(crate) trait BoundWorkload {
    fn setup(&mut self) -> HookResult;
    fn prerun(&mut self) -> HookResult;
    fn run(&mut self) -> HookResult;
}

struct Bound<W: Workload> {
    workload: W,
    context: W::Context,
}

impl<W: Workload> BoundWorkload for Bound<W> {
    fn setup(&mut self) -> HookResult {
        self.workload.setup(&self.context)
    }

    fn prerun(&mut self) -> HookResult {
        self.workload.prerun(&self.context)
    }

    fn run(&mut self) -> HookResult {
        self.workload.run(&self.context)
    }
}

fn bind_json<W: Workload + Default>(
    context_json: &str,
) -> Result<Box<dyn BoundWorkload>, serde_json::Error> {
    let context = serde_json::from_str::<W::Context>(context_json)?;
    Ok(Box::new(Bound {
        workload: W::default(),
        context,
    }))
}

/// Workload definition registered via [`workload!`](crate::workload)
#[derive(Clone, Copy)]
pub struct WorkloadDef {
    /// Unique identifier
    pub id: &'static str,
    /// Rust type name of the workload
    pub type_name: &'static str,
    bind: fn(&str) -> Result<Box<dyn BoundWorkload>, serde_json::Error>,
}

impl WorkloadDef {
    /// Definition for workload type `W`
    pub const fn new<W: Workload + Default>(id: &'static str, type_name: &'static str) -> Self {
        Self {
            id,
            type_name,
            bind: bind_json::<W>,
        }
    }

    pub(crate) fn bind(
        &self,
        context_json: &str,
    ) -> Result<Box<dyn BoundWorkload>, serde_json::Error> {
        (self.bind)(context_json)
    }
}

impl std::fmt::Debug for WorkloadDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadDef")
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

inventory::collect!(WorkloadDef);

/// Look up a registered workload by id
pub fn find_workload(id: &str) -> Option<&'static WorkloadDef> {
    inventory::iter::<WorkloadDef>
        .into_iter()
        .find(|def| def.id == id)
}

/// All registered workloads, sorted by id
pub fn registered_workloads() -> Vec<&'static WorkloadDef> {
    let mut defs: Vec<_> = inventory::iter::<WorkloadDef>.into_iter().collect();
    defs.sort_by_key(|def| def.id);
    defs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        setups: u32,
        runs: u32,
    }

    impl Workload for Counter {
        type Context = u32;

        fn setup(&mut self, _limit: &u32) -> HookResult {
            self.setups += 1;
            Ok(())
        }

        fn run(&mut self, limit: &u32) -> HookResult {
            if self.setups != 1 {
                return Err("setup did not run exactly once".into());
            }
            self.runs += 1;
            if self.runs > *limit {
                return Err(format!("ran {} times, limit {limit}", self.runs).into());
            }
            Ok(())
        }
    }

    crate::workload!("core-test-counter", Counter);

    #[test]
    fn test_registered_workload_is_found() {
        let def = find_workload("core-test-counter").unwrap();
        assert_eq!(def.id, "core-test-counter");
        assert!(def.type_name.ends_with("Counter"));
        assert!(find_workload("no-such-workload").is_none());
        assert!(registered_workloads().iter().any(|d| d.id == def.id));
    }

    #[test]
    fn test_bound_workload_keeps_state_between_hooks() {
        let mut bound = find_workload("core-test-counter").unwrap().bind("2").unwrap();
        bound.setup().unwrap();
        bound.prerun().unwrap();
        bound.run().unwrap();
        bound.run().unwrap();
        let err = bound.run().unwrap_err();
        assert_eq!(err.to_string(), "ran 3 times, limit 2");
    }

    #[test]
    fn test_bad_context_is_rejected() {
        let def = find_workload("core-test-counter").unwrap();
        assert!(def.bind("\"not a number\"").is_err());
    }
}
