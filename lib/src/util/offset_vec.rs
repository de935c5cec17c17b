use std::fmt::{Debug, Error, Formatter};
use std::iter::{DoubleEndedIterator, Enumerate, Extend, FromIterator};
use std::ops::Sub;
use std::result::Result;
use std::slice::Iter;
use std::vec::IntoIter as VecIntoIter;

/// Elements with a width (eg. when used in an `OffsetVec`)
pub trait Width {
    fn width(&self) -> usize;
}

/// Vector whose elements occupy a variable number of "slots", addressed by the slot offset
/// at which they start rather than by their position.
///
/// Parsed class files and the analysis of their methods need this in a few places:
///
///   - the constant pool, where `long` and `double` constants take up two indices
///   - local variables and operand stacks, where category-2 values take up two slots
///   - stack map frames, which are written back with the same compact entries
///
#[derive(Clone)]
pub struct OffsetVec<T: Sized> {
    /// Entries, along with their offset
    entries: Vec<(Offset, T)>,

    /// Offset of the next element to be added
    offset_len: Offset,

    /// Offset for the first element (usually 0, but sometimes 1)
    initial_offset: Offset,
}

/// Offset into an `OffsetVec`
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Offset(pub usize);

impl Sub for Offset {
    type Output = isize;

    fn sub(self, other: Offset) -> isize {
        (self.0 as isize) - (other.0 as isize)
    }
}

impl<T: Sized + Width> OffsetVec<T> {
    /// New empty offset vector
    pub fn new() -> OffsetVec<T> {
        OffsetVec {
            entries: vec![],
            offset_len: Offset(0),
            initial_offset: Offset(0),
        }
    }

    /// New empty offset vector, with a custom starting offset
    pub fn new_starting_at(initial_offset: Offset) -> OffsetVec<T> {
        OffsetVec {
            entries: vec![],
            offset_len: initial_offset,
            initial_offset,
        }
    }

    /// Length of the `OffsetVec` (aka. number of entries)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Current offset size of the `OffsetVec` (aka. offset of the next element
    /// to be added)
    pub fn offset_len(&self) -> Offset {
        self.offset_len
    }

    /// Add an entry to the back
    pub fn push(&mut self, slot: T) -> Offset {
        let offset = self.offset_len;
        self.offset_len.0 += slot.width();
        self.entries.push((offset, slot));

        offset
    }

    /// Remove an entry from the back
    pub fn pop(&mut self) -> Option<(Offset, usize, T)> {
        self.entries.pop().map(|(off, elem)| {
            self.offset_len = off;
            (off, self.entries.len(), elem)
        })
    }

    /// Empty the vector
    pub fn clear(&mut self) {
        self.entries.clear();
        self.offset_len = self.initial_offset;
    }

    /// Get an entry (and its index) by its offset in the vector
    ///
    /// Note: this uses binary search to find the offset
    pub fn get_offset(&self, offset: Offset) -> OffsetResult<T> {
        match self.entries.binary_search_by_key(&offset, |(off, _)| *off) {
            Err(insert_at) if insert_at == self.entries.len() => OffsetResult::TooLarge,
            Err(insert_at) => OffsetResult::InvalidOffset(insert_at),
            Ok(found_idx) => OffsetResult::Ok(found_idx, &self.entries[found_idx].1),
        }
    }

    /// Set an entry by its offset in the vector
    ///
    /// Note: this uses binary search to find the offset
    pub fn set_offset(&mut self, offset: Offset, value: T) -> OffsetResult<'static, ()> {
        if offset == self.offset_len() {
            self.push(value);
            OffsetResult::Ok(self.len() - 1, &())
        } else {
            match self.entries.binary_search_by_key(&offset, |(off, _)| *off) {
                Err(insert_at) if insert_at == self.entries.len() => OffsetResult::TooLarge,
                Err(insert_at) => OffsetResult::InvalidOffset(insert_at),
                Ok(found_idx) => {
                    let replacing = &mut self.entries[found_idx].1;
                    if replacing.width() != value.width() {
                        OffsetResult::IncompatibleWidth(value.width(), replacing.width())
                    } else {
                        let mut value = value;
                        std::mem::swap(replacing, &mut value);
                        OffsetResult::Ok(found_idx, &())
                    }
                }
            }
        }
    }

    /// Get an entry (and its offset) by its position in the vector
    pub fn get_index(&self, index: usize) -> Option<(Offset, &T)> {
        self.entries.get(index).map(|(offset, t)| (*offset, t))
    }

    /// Last entry and its offset
    pub fn last(&self) -> Option<(Offset, &T)> {
        self.entries.last().map(|(offset, t)| (*offset, t))
    }

    /// Find the entry whose slots cover `offset`, even when `offset` is not where it starts
    pub fn covering(&self, offset: Offset) -> Option<(Offset, &T)> {
        let idx = match self.entries.binary_search_by_key(&offset, |(off, _)| *off) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(insert_at) => insert_at - 1,
        };
        let (start, elem) = &self.entries[idx];
        if start.0 + elem.width() > offset.0 {
            Some((*start, elem))
        } else {
            None
        }
    }

    /// Drop entries from the back until at most `len` entries remain
    pub fn truncate(&mut self, len: usize) {
        while self.entries.len() > len {
            self.pop();
        }
    }

    pub fn iter<'a>(&'a self) -> OffsetVecIter<'a, T> {
        self.into_iter()
    }
}

impl<T: Width, const N: usize> From<[T; N]> for OffsetVec<T> {
    fn from(elems: [T; N]) -> Self {
        elems.into_iter().collect()
    }
}

impl<A: PartialEq> PartialEq for OffsetVec<A> {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl<A: Eq> Eq for OffsetVec<A> {}

impl<A: Width> Default for OffsetVec<A> {
    fn default() -> Self {
        OffsetVec::new()
    }
}

pub enum OffsetResult<'a, T> {
    /// Element was accessed
    Ok(usize, &'a T),

    /// Offset was invalid, and falls in the middle of the element at this index
    InvalidOffset(usize),

    /// Width is incompatible (only occurs when trying to set an element)
    IncompatibleWidth(usize, usize),

    /// Offset is too big
    TooLarge,
}

impl<'a, T> OffsetResult<'a, T> {
    /// Convert to an `Option` and keep only the value found
    pub fn ok(&self) -> Option<&'a T> {
        match self {
            OffsetResult::Ok(_, found) => Some(found),
            OffsetResult::InvalidOffset(_)
            | OffsetResult::TooLarge
            | OffsetResult::IncompatibleWidth(_, _) => None,
        }
    }
}

/// Iterator for owned `OffsetVec`
pub struct OffsetVecIntoIter<T>(Enumerate<VecIntoIter<(Offset, T)>>);

impl<T> Iterator for OffsetVecIntoIter<T> {
    type Item = (Offset, usize, T);

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|(idx, (off, elem))| (off, idx, elem))
    }
}

impl<T> DoubleEndedIterator for OffsetVecIntoIter<T> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.0
            .next_back()
            .map(|(idx, (off, elem))| (off, idx, elem))
    }
}

impl<T> IntoIterator for OffsetVec<T> {
    type Item = (Offset, usize, T);
    type IntoIter = OffsetVecIntoIter<T>;

    fn into_iter(self) -> OffsetVecIntoIter<T> {
        OffsetVecIntoIter(self.entries.into_iter().enumerate())
    }
}

/// Iterator for borrowed `OffsetVec`
pub struct OffsetVecIter<'a, T>(Enumerate<Iter<'a, (Offset, T)>>);

impl<'a, T> Iterator for OffsetVecIter<'a, T> {
    type Item = (Offset, usize, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|(idx, (off, elem))| (*off, idx, elem))
    }
}

impl<'a, T> DoubleEndedIterator for OffsetVecIter<'a, T> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.0
            .next_back()
            .map(|(idx, (off, elem))| (*off, idx, elem))
    }
}

impl<'a, T> IntoIterator for &'a OffsetVec<T> {
    type Item = (Offset, usize, &'a T);
    type IntoIter = OffsetVecIter<'a, T>;

    fn into_iter(self) -> OffsetVecIter<'a, T> {
        OffsetVecIter(self.entries.iter().enumerate())
    }
}

impl<T: Width> FromIterator<T> for OffsetVec<T> {
    fn from_iter<A: IntoIterator<Item = T>>(elems: A) -> Self {
        let mut offset_vec = OffsetVec::new();
        for elem in elems {
            offset_vec.push(elem);
        }
        offset_vec
    }
}

impl<T: Width> Extend<T> for OffsetVec<T> {
    fn extend<U: IntoIterator<Item = T>>(&mut self, iter: U) {
        for elem in iter {
            self.push(elem);
        }
    }
}

impl<T: Debug> Debug for OffsetVec<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        let mut list = f.debug_list();
        for (off, elem) in &self.entries {
            list.entry(&format_args!("#{} = {:?}", off.0, elem));
        }
        list.finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Clone, Eq, PartialEq, Debug)]
    enum Local {
        Int,
        Long,
        Reference(&'static str),
    }

    impl Width for Local {
        fn width(&self) -> usize {
            match self {
                Local::Long => 2,
                _ => 1,
            }
        }
    }

    #[test]
    fn locals_offsets_follow_widths() {
        let locals = OffsetVec::from([
            Local::Reference("this"),
            Local::Long,
            Local::Int,
            Local::Long,
        ]);
        assert_eq!(locals.offset_len(), Offset(6));
        assert_eq!(
            locals.into_iter().collect::<Vec<_>>(),
            vec![
                (Offset(0), 0, Local::Reference("this")),
                (Offset(1), 1, Local::Long),
                (Offset(3), 2, Local::Int),
                (Offset(4), 3, Local::Long),
            ]
        );
    }

    #[test]
    fn lookups_inside_wide_entries() {
        let locals = OffsetVec::from([Local::Int, Local::Long, Local::Int]);
        assert_eq!(locals.get_offset(Offset(1)).ok(), Some(&Local::Long));
        assert!(matches!(
            locals.get_offset(Offset(2)),
            OffsetResult::InvalidOffset(2)
        ));
        assert!(matches!(locals.get_offset(Offset(7)), OffsetResult::TooLarge));
        assert_eq!(locals.covering(Offset(2)), Some((Offset(1), &Local::Long)));
        assert_eq!(locals.covering(Offset(3)), Some((Offset(3), &Local::Int)));
        assert_eq!(locals.covering(Offset(4)), None);
    }

    #[test]
    fn set_and_truncate() {
        let mut stack = OffsetVec::from([Local::Int, Local::Long]);
        assert!(matches!(
            stack.set_offset(Offset(1), Local::Int),
            OffsetResult::IncompatibleWidth(1, 2)
        ));
        assert!(matches!(
            stack.set_offset(Offset(0), Local::Reference("x")),
            OffsetResult::Ok(0, _)
        ));
        assert!(matches!(
            stack.set_offset(Offset(3), Local::Int),
            OffsetResult::Ok(2, _)
        ));
        assert_eq!(stack.last(), Some((Offset(3), &Local::Int)));

        stack.truncate(1);
        assert_eq!(stack.offset_len(), Offset(1));
        assert_eq!(stack.pop(), Some((Offset(0), 0, Local::Reference("x"))));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn constant_pool_starting_at_one() {
        let mut pool: OffsetVec<Local> = OffsetVec::new_starting_at(Offset(1));
        assert_eq!(pool.push(Local::Int), Offset(1));
        assert_eq!(pool.push(Local::Long), Offset(2));
        assert_eq!(pool.push(Local::Int), Offset(4));
        pool.clear();
        assert_eq!(pool.offset_len(), Offset(1));
    }
}
