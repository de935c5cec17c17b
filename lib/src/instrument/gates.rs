//! Conditions guarding injected handler calls
//!
//! A probe body only runs when the trace's level allows it and (for sampled probes) when the
//! tracker says this hit should be sampled. Both checks jump to the `join` label ending the
//! injected region, so the original code carries on with the stack it expects either way.
//!
//! Probes needing a duration read a timestamp on entry to the method (or before the call, for
//! calls) and subtract it at the exit. When the entry side is guarded, an unsampled entry leaves
//! the timestamp at `0` and the exit side skips the probe.

use super::emit::Emitter;
use super::level::Level;
use super::probe::{ProbeDescriptor, Sampling};
use crate::jvm::code::{BranchInstruction, Instruction, OrdComparison, SynLabel};
use crate::jvm::{BinaryName, Error, FieldType, MethodDescriptor, UnqualifiedName};

/// Where the current level of a trace is read from
#[derive(Clone, Debug)]
pub struct LevelSource {
    /// Static `int` field on the trace class
    pub field_name: UnqualifiedName,
}

impl LevelSource {
    /// Jump to `skip` unless the trace level satisfies the condition
    ///
    /// Emits `getstatic <trace>.<field>:I; <threshold>; if_icmp<negated op> skip`, or nothing if
    /// the condition always holds.
    pub fn emit_gate(
        &self,
        emitter: &mut Emitter,
        trace_class: &BinaryName,
        level: Option<&Level>,
        skip: SynLabel,
    ) -> Result<(), Error> {
        let level = match level {
            Some(level) if !level.is_trivial() => level,
            _ => return Ok(()),
        };
        emitter.get_static(trace_class, &self.field_name, &FieldType::int())?;
        emitter.const_int(level.threshold)?;
        emitter.push_branch_instruction(BranchInstruction::IfICmp(level.skip_comparison(), skip));
        Ok(())
    }
}

/// Static methods on the tracker class deciding which hits are sampled
#[derive(Clone, Debug)]
pub struct SamplingService {
    pub tracker_class: BinaryName,
}

impl SamplingService {
    fn call(
        &self,
        emitter: &mut Emitter,
        id: i32,
        name: &UnqualifiedName,
        return_type: Option<FieldType<BinaryName>>,
    ) -> Result<(), Error> {
        let descriptor = MethodDescriptor {
            parameters: vec![FieldType::int()],
            return_type,
        };
        emitter.const_int(id)?;
        emitter.invoke_static(&self.tracker_class, name, &descriptor)
    }

    /// `hit(I)Z`
    pub fn hit(&self, emitter: &mut Emitter, id: i32) -> Result<(), Error> {
        self.call(emitter, id, &UnqualifiedName::HIT, Some(FieldType::boolean()))
    }

    /// `hitAdaptive(I)Z`
    pub fn hit_adaptive(&self, emitter: &mut Emitter, id: i32) -> Result<(), Error> {
        self.call(emitter, id, &UnqualifiedName::HITADAPTIVE, Some(FieldType::boolean()))
    }

    /// `hitTimed(I)J`
    pub fn hit_timed(&self, emitter: &mut Emitter, id: i32) -> Result<(), Error> {
        self.call(emitter, id, &UnqualifiedName::HITTIMED, Some(FieldType::long()))
    }

    /// `getEndTs(I)J`
    pub fn get_end_ts(&self, emitter: &mut Emitter, id: i32) -> Result<(), Error> {
        self.call(emitter, id, &UnqualifiedName::GETENDTS, Some(FieldType::long()))
    }

    /// `updateEndTs(I)V`
    pub fn update_end_ts(&self, emitter: &mut Emitter, id: i32) -> Result<(), Error> {
        self.call(emitter, id, &UnqualifiedName::UPDATEENDTS, None)
    }

    /// Jump to `skip` unless this hit is sampled
    pub fn emit_gate(&self, emitter: &mut Emitter, sampling: Sampling, skip: SynLabel) -> Result<(), Error> {
        match sampling {
            Sampling::None => return Ok(()),
            Sampling::Fixed { id, .. } => self.hit(emitter, id)?,
            Sampling::Adaptive { id } => self.hit_adaptive(emitter, id)?,
        }
        emitter.push_branch_instruction(BranchInstruction::If(OrdComparison::EQ, skip));
        Ok(())
    }
}

/// Timers are shared by probes which would start them the same way
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub trace_class: BinaryName,
    pub level: Option<Level>,
    pub sampling: Sampling,
}

impl TimerKey {
    pub fn of(probe: &ProbeDescriptor) -> TimerKey {
        TimerKey {
            trace_class: probe.trace_class.clone(),
            level: probe.level.filter(|level| !level.is_trivial()),
            sampling: probe.sampling,
        }
    }
}

/// Local slot holding the start timestamp of a duration
#[derive(Clone, Debug)]
pub struct Timer {
    pub key: TimerKey,
    pub slot: u16,
}

impl Timer {
    /// Is the start timestamp only taken some of the time?
    pub fn is_guarded(&self) -> bool {
        self.key.level.is_some() || self.key.sampling != Sampling::None
    }

    /// Take the start timestamp
    ///
    /// The slot always ends up initialized (to `0` when the level or the sampler says no).
    pub fn emit_start(
        &self,
        emitter: &mut Emitter,
        level_source: &LevelSource,
        sampling: &SamplingService,
    ) -> Result<(), Error> {
        let long = FieldType::long();
        emitter.push_instruction(Instruction::LConst0);
        emitter.set_local(self.slot, &long);

        let skip = emitter.fresh_label();
        level_source.emit_gate(emitter, &self.key.trace_class, self.key.level.as_ref(), skip)?;
        match self.key.sampling {
            Sampling::None => emitter.nano_time()?,
            Sampling::Fixed { id, .. } => sampling.hit_timed(emitter, id)?,
            Sampling::Adaptive { id } => {
                sampling.hit_adaptive(emitter, id)?;
                emitter.push_branch_instruction(BranchInstruction::If(OrdComparison::EQ, skip));
                sampling.get_end_ts(emitter, id)?;
            }
        }
        emitter.set_local(self.slot, &long);
        emitter.place_label(skip);
        Ok(())
    }

    /// Jump to `skip` if the start timestamp was never taken
    pub fn emit_started_gate(&self, emitter: &mut Emitter, skip: SynLabel) {
        if !self.is_guarded() {
            return;
        }
        emitter.get_local(self.slot, &FieldType::long());
        emitter.push_instruction(Instruction::LConst0);
        emitter.push_instruction(Instruction::LCmp);
        emitter.push_branch_instruction(BranchInstruction::If(OrdComparison::EQ, skip));
    }

    /// Push the nanoseconds elapsed since the start timestamp
    ///
    /// Sampled timers get the end timestamp from the tracker rather than reading the clock.
    pub fn emit_elapsed(&self, emitter: &mut Emitter, sampling: &SamplingService) -> Result<(), Error> {
        match self.key.sampling.id() {
            None => emitter.nano_time()?,
            Some(id) => {
                sampling.update_end_ts(emitter, id)?;
                sampling.get_end_ts(emitter, id)?;
            }
        }
        emitter.get_local(self.slot, &FieldType::long());
        emitter.push_instruction(Instruction::LSub);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::class_file::{ConstantsPool, Version};
    use crate::jvm::code::{InvokeType, Node, SynLabelGenerator};
    use crate::jvm::Name;

    fn trace() -> BinaryName {
        BinaryName::from_string(String::from("traces/Trace")).unwrap()
    }

    fn services() -> (LevelSource, SamplingService) {
        (
            LevelSource {
                field_name: UnqualifiedName::TRACELEVEL,
            },
            SamplingService {
                tracker_class: BinaryName::METHODTRACKER,
            },
        )
    }

    fn called(constants: &ConstantsPool, node: &Node) -> Option<String> {
        match node {
            Node::Insn(Instruction::Invoke(InvokeType::Static, method)) => {
                Some(String::from(constants.method_ref(*method).ok()?.name.as_str()))
            }
            _ => None,
        }
    }

    #[test]
    fn level_gate_shape() {
        let (level_source, _) = services();
        let mut constants = ConstantsPool::new();
        let mut labels = SynLabelGenerator::default();
        let mut emitter = Emitter::new(&mut constants, &mut labels, Version::JAVA8);
        let skip = emitter.fresh_label();

        let trivial: Level = ">=0".parse().unwrap();
        level_source.emit_gate(&mut emitter, &trace(), Some(&trivial), skip).unwrap();
        level_source.emit_gate(&mut emitter, &trace(), None, skip).unwrap();
        let level: Level = ">=3".parse().unwrap();
        level_source.emit_gate(&mut emitter, &trace(), Some(&level), skip).unwrap();
        let nodes = emitter.into_nodes();

        assert_eq!(nodes.len(), 3);
        assert!(matches!(nodes[0], Node::Insn(Instruction::GetStatic(_))));
        assert_eq!(nodes[1], Node::Insn(Instruction::IConst3));
        assert_eq!(
            nodes[2],
            Node::Branch(BranchInstruction::IfICmp(OrdComparison::LT, skip))
        );
    }

    #[test]
    fn sampled_timers() {
        let (level_source, sampling) = services();
        let mut constants = ConstantsPool::new();
        let mut labels = SynLabelGenerator::default();
        let timer = Timer {
            key: TimerKey {
                trace_class: trace(),
                level: None,
                sampling: Sampling::Adaptive { id: 7 },
            },
            slot: 4,
        };
        assert!(timer.is_guarded());

        let mut emitter = Emitter::new(&mut constants, &mut labels, Version::JAVA8);
        timer.emit_start(&mut emitter, &level_source, &sampling).unwrap();
        let skip = emitter.fresh_label();
        timer.emit_started_gate(&mut emitter, skip);
        timer.emit_elapsed(&mut emitter, &sampling).unwrap();
        let nodes = emitter.into_nodes();

        let calls: Vec<String> = nodes.iter().filter_map(|node| called(&constants, node)).collect();
        assert_eq!(calls, vec!["hitAdaptive", "getEndTs", "updateEndTs", "getEndTs"]);
        assert_eq!(nodes[0], Node::Insn(Instruction::LConst0));
        assert_eq!(nodes[1], Node::Insn(Instruction::LStore(4)));
        assert_eq!(nodes.last(), Some(&Node::Insn(Instruction::LSub)));
        assert!(!calls.contains(&String::from("nanoTime")));
    }

    #[test]
    fn unguarded_timer_reads_the_clock() {
        let (level_source, sampling) = services();
        let mut constants = ConstantsPool::new();
        let mut labels = SynLabelGenerator::default();
        let timer = Timer {
            key: TimerKey {
                trace_class: trace(),
                level: None,
                sampling: Sampling::None,
            },
            slot: 2,
        };
        assert!(!timer.is_guarded());

        let mut emitter = Emitter::new(&mut constants, &mut labels, Version::JAVA8);
        let skip = emitter.fresh_label();
        timer.emit_started_gate(&mut emitter, skip);
        assert!(emitter.into_nodes().is_empty());

        let mut emitter = Emitter::new(&mut constants, &mut labels, Version::JAVA8);
        timer.emit_start(&mut emitter, &level_source, &sampling).unwrap();
        timer.emit_elapsed(&mut emitter, &sampling).unwrap();
        let nodes = emitter.into_nodes();
        let calls: Vec<String> = nodes.iter().filter_map(|node| called(&constants, node)).collect();
        assert_eq!(calls, vec!["nanoTime", "nanoTime"]);
    }
}
