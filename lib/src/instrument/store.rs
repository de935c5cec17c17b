use super::probe::ProbeDescriptor;
use crate::jvm::BinaryName;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Identity of one loaded version of a trace class
///
/// Reloading a trace bumps its generation, so descriptors from the old version are never mixed
/// up with the new ones even if the class name is reused.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TraceIdentity {
    pub class_name: BinaryName,
    pub generation: u64,
}

/// Cache of validated probe descriptors, keyed by trace identity
///
/// Descriptor lists are immutable once inserted and handed out as shared slices, so concurrent
/// transformations can hold on to them without keeping the cache locked.
#[derive(Default)]
pub struct ProbeStore {
    traces: RwLock<HashMap<TraceIdentity, Arc<[ProbeDescriptor]>>>,
}

impl ProbeStore {
    pub fn new() -> ProbeStore {
        ProbeStore::default()
    }

    pub fn get(&self, trace: &TraceIdentity) -> Option<Arc<[ProbeDescriptor]>> {
        let traces = self.traces.read();
        traces.get(trace).cloned()
    }

    /// Get the descriptors of a trace, building them if they aren't cached yet
    ///
    /// The build runs without the lock held. If two threads race to build the same trace, the
    /// first insertion wins and both get the same descriptors.
    pub fn get_or_insert_with<E>(
        &self,
        trace: &TraceIdentity,
        build: impl FnOnce() -> Result<Vec<ProbeDescriptor>, E>,
    ) -> Result<Arc<[ProbeDescriptor]>, E> {
        if let Some(found) = self.get(trace) {
            return Ok(found);
        }
        let built: Arc<[ProbeDescriptor]> = Arc::from(build()?);
        let mut traces = self.traces.write();
        let stored = traces.entry(trace.clone()).or_insert(built);
        log::debug!(
            "Cached {} probes for {} (generation {})",
            stored.len(),
            trace.class_name.to_java_name(),
            trace.generation
        );
        Ok(stored.clone())
    }

    /// Drop every generation of a trace class
    ///
    /// Returns how many cached entries were removed.
    pub fn invalidate(&self, class_name: &BinaryName) -> usize {
        let mut traces = self.traces.write();
        let before = traces.len();
        traces.retain(|trace, _| &trace.class_name != class_name);
        before - traces.len()
    }

    /// Every cached descriptor, across all traces
    pub fn all(&self) -> Vec<ProbeDescriptor> {
        let traces = self.traces.read();
        traces
            .values()
            .flat_map(|probes| probes.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::instrument::probe::test_probes::{probe, trace_class};
    use crate::instrument::probe::Kind;

    #[test]
    fn builds_once_per_identity() {
        let store = ProbeStore::new();
        let first = TraceIdentity {
            class_name: trace_class(),
            generation: 1,
        };
        let mut builds = 0;
        for _ in 0..3 {
            let probes = store
                .get_or_insert_with::<()>(&first, || {
                    builds += 1;
                    Ok(vec![probe(Kind::Entry, "", "", vec![])])
                })
                .unwrap();
            assert_eq!(probes.len(), 1);
        }
        assert_eq!(builds, 1);

        let second = TraceIdentity {
            generation: 2,
            ..first.clone()
        };
        assert!(store.get(&second).is_none());
        store
            .get_or_insert_with::<()>(&second, || Ok(vec![]))
            .unwrap();
        assert_eq!(store.all().len(), 1);

        assert_eq!(store.invalidate(&trace_class()), 2);
        assert!(store.get(&first).is_none());
    }

    #[test]
    fn failed_builds_are_not_cached() {
        let store = ProbeStore::new();
        let trace = TraceIdentity {
            class_name: trace_class(),
            generation: 0,
        };
        assert_eq!(
            store.get_or_insert_with(&trace, || Err("bad trace")).unwrap_err(),
            "bad trace"
        );
        assert!(store.get(&trace).is_none());
    }
}
