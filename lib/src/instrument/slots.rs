use super::errors::MethodError;
use crate::jvm::code::SynLabel;
use crate::jvm::{BinaryName, FieldType};
use crate::util::Width;

/// Largest number of local slots a method may have
const MAX_LOCALS: usize = u16::MAX as usize;

/// Local variable introduced by instrumentation, for the `LocalVariableTable`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntheticLocal {
    pub slot: u16,

    /// `$`-prefixed name
    pub name: String,
    pub field_type: FieldType<BinaryName>,
    pub start: SynLabel,
    pub end: SynLabel,
}

struct Allocation {
    slot: u16,
    name: String,
    field_type: FieldType<BinaryName>,
}

/// Hands out local slots for injected code
///
/// Slots are allocated upwards from the first slot the original method doesn't use, so the
/// original numbering is never disturbed. There are two lifetimes:
///
///   - method slots (timestamps, lock holders) live for the whole method and are never reused
///   - site slots (captured values) live until [`SlotAllocator::release_site_slots`], after
///     which they can be handed out again to a later site needing a slot of the same width
///
/// All sites anchored at the same node are injected as one group and release their slots
/// together, since their regions nest around the same instruction.
pub struct SlotAllocator {
    next: usize,
    free: Vec<(u16, usize)>,
    in_use: Vec<Allocation>,
    method_slots: Vec<Allocation>,
    locals: Vec<SyntheticLocal>,
}

impl SlotAllocator {
    /// Allocator for a method whose own code uses slots below `first_free`
    pub fn new(first_free: usize) -> SlotAllocator {
        SlotAllocator {
            next: first_free,
            free: vec![],
            in_use: vec![],
            method_slots: vec![],
            locals: vec![],
        }
    }

    /// Slot living for the whole method
    pub fn method_slot(&mut self, purpose: &str, field_type: &FieldType<BinaryName>) -> Result<u16, MethodError> {
        let slot = self.fresh(field_type.width())?;
        self.method_slots.push(Allocation {
            slot,
            name: format!("${}", purpose),
            field_type: field_type.clone(),
        });
        Ok(slot)
    }

    /// Slot living until the current group of sites is released
    pub fn site_slot(&mut self, purpose: &str, field_type: &FieldType<BinaryName>) -> Result<u16, MethodError> {
        let width = field_type.width();
        let slot = match self.free.iter().position(|(_, free_width)| *free_width == width) {
            Some(idx) => self.free.remove(idx).0,
            None => self.fresh(width)?,
        };
        self.in_use.push(Allocation {
            slot,
            name: format!("${}", purpose),
            field_type: field_type.clone(),
        });
        Ok(slot)
    }

    /// Are any site slots currently allocated?
    pub fn has_site_slots(&self) -> bool {
        !self.in_use.is_empty()
    }

    /// End the live range of all site slots, which were live between the two labels
    pub fn release_site_slots(&mut self, start: SynLabel, end: SynLabel) {
        for allocation in self.in_use.drain(..) {
            self.free
                .push((allocation.slot, allocation.field_type.width()));
            self.locals.push(SyntheticLocal {
                slot: allocation.slot,
                name: allocation.name,
                field_type: allocation.field_type,
                start,
                end,
            });
        }
    }

    /// Finish allocating, giving every synthetic local (method slots span the two labels)
    pub fn finish(mut self, start: SynLabel, end: SynLabel) -> (usize, Vec<SyntheticLocal>) {
        for allocation in self.method_slots.drain(..) {
            self.locals.push(SyntheticLocal {
                slot: allocation.slot,
                name: allocation.name,
                field_type: allocation.field_type,
                start,
                end,
            });
        }
        (self.next, self.locals)
    }

    fn fresh(&mut self, width: usize) -> Result<u16, MethodError> {
        let slot = self.next;
        if slot + width > MAX_LOCALS {
            return Err(MethodError::SlotOverflow);
        }
        self.next += width;
        Ok(slot as u16)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::code::{LabelGenerator, SynLabelGenerator};

    #[test]
    fn slots_start_above_the_original_locals() {
        let mut labels = SynLabelGenerator::default();
        let (start, end) = (labels.fresh_label(), labels.fresh_label());
        let mut slots = SlotAllocator::new(3);

        assert_eq!(slots.method_slot("ts", &FieldType::long()).unwrap(), 3);
        assert_eq!(slots.site_slot("arg0", &FieldType::int()).unwrap(), 5);
        assert_eq!(slots.site_slot("arg1", &FieldType::double()).unwrap(), 6);
        assert_eq!(slots.next, 8);
        slots.release_site_slots(start, end);

        // Released slots are reused only for values of the same width
        assert_eq!(slots.site_slot("ret", &FieldType::long()).unwrap(), 6);
        assert_eq!(
            slots.site_slot("self", &FieldType::object(BinaryName::OBJECT)).unwrap(),
            5
        );
        assert_eq!(slots.site_slot("other", &FieldType::float()).unwrap(), 8);
        slots.release_site_slots(start, end);

        let (max_locals, locals) = slots.finish(start, end);
        assert_eq!(max_locals, 9);
        assert_eq!(locals.len(), 6);
        assert!(locals.iter().all(|local| local.name.starts_with('$')));
        assert_eq!(locals.last().unwrap().name, "$ts");
    }

    #[test]
    fn overflowing_the_local_limit() {
        let mut slots = SlotAllocator::new(MAX_LOCALS - 1);
        assert!(matches!(
            slots.site_slot("wide", &FieldType::long()),
            Err(MethodError::SlotOverflow)
        ));
        assert_eq!(slots.site_slot("narrow", &FieldType::int()).unwrap(), 65534);
        assert!(matches!(
            slots.method_slot("more", &FieldType::int()),
            Err(MethodError::SlotOverflow)
        ));
    }
}
