//! Per-domain sets of numeric ranges
//!
//! An ordered, merging set of inclusive integer intervals, used across the
//! hypervisor for I/O port ranges, MMIO regions, IRQs and PFN ranges. Adds
//! merge with overlapping and adjacent neighbours, removes split ranges in
//! place, and an optional per-set limit bounds how many ranges a guest can
//! make the hypervisor track.

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;
use spin::{Mutex, RwLock};

use crate::CoprocError;

bitflags! {
    /// Rendering flags for [`RangeSet`] pretty-printing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RangeSetFlags: u32 {
        const PRETTYPRINT_HEX = 1;
    }
}

const RANGESET_NAME_LEN: usize = 32;

/// An inclusive range `[s, e]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Range {
    s: u64,
    e: u64,
}

/// Range storage plus the allocation headroom counter. Each live range
/// consumes one unit of headroom; `-1` denotes "unlimited" and only ever
/// drifts further negative.
struct Ranges {
    list: Vec<Range>,
    nr_ranges: isize,
}

impl Ranges {
    /// Index of the highest range whose start is `<= s`, if any.
    fn find(&self, s: u64) -> Option<usize> {
        let n = self.list.partition_point(|r| r.s <= s);
        n.checked_sub(1)
    }

    fn alloc_ok(&self) -> bool {
        self.nr_ranges != 0
    }

    fn note_alloc(&mut self) {
        self.nr_ranges -= 1;
    }

    fn note_free(&mut self) {
        self.nr_ranges += 1;
    }
}

/// Ordered, merging set of inclusive integer intervals under a
/// reader/writer lock.
pub struct RangeSet {
    ranges: RwLock<Ranges>,
    name: heapless::String<RANGESET_NAME_LEN>,
    flags: RangeSetFlags,
}

impl RangeSet {
    /// Create a fresh empty set. The caller may thread it onto an owning
    /// [`RangeSetList`]; sets not on a list are simply dropped when the last
    /// handle goes away.
    pub fn new(name: &str, flags: RangeSetFlags) -> Arc<RangeSet> {
        let mut stored: heapless::String<RANGESET_NAME_LEN> = heapless::String::new();
        let name = if name.is_empty() { "(no name)" } else { name };
        for c in name.chars() {
            if stored.push(c).is_err() {
                break;
            }
        }
        Arc::new(RangeSet {
            ranges: RwLock::new(Ranges { list: Vec::new(), nr_ranges: -1 }),
            name: stored,
            flags,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the remaining allocation headroom. Only meaningful on an empty
    /// set.
    pub fn limit(&self, limit: u32) {
        let mut g = self.ranges.write();
        debug_assert!(g.list.is_empty());
        g.nr_ranges = limit as isize;
    }

    /// Union `[s, e]` into the set, merging overlapping and adjacent
    /// ranges. Fails with `OutOfMemory` only when a new range would have to
    /// be tracked and the headroom is exhausted; a pure merge always
    /// succeeds.
    pub fn add_range(&self, s: u64, e: u64) -> Result<(), CoprocError> {
        debug_assert!(s <= e);

        let mut g = self.ranges.write();
        let xi = g.find(s);
        let yi = g.find(e);

        let at = if xi == yi {
            let need_new = match xi {
                None => true,
                Some(i) => g.list[i].e < s && g.list[i].e.wrapping_add(1) != s,
            };
            if need_new {
                if !g.alloc_ok() {
                    return Err(CoprocError::OutOfMemory);
                }
                let at = xi.map_or(0, |i| i + 1);
                g.list.insert(at, Range { s, e });
                g.note_alloc();
                at
            } else {
                let i = xi.unwrap();
                if g.list[i].e < e {
                    g.list[i].e = e;
                }
                i
            }
        } else {
            // yi is Some: at least one range starts at or below e.
            let yi = yi.unwrap();
            let i = match xi {
                None => {
                    g.list[0].s = s;
                    0
                }
                Some(x) => {
                    if g.list[x].e < s && g.list[x].e.wrapping_add(1) != s {
                        g.list[x + 1].s = s;
                        x + 1
                    } else {
                        x
                    }
                }
            };
            let ye = g.list[yi].e;
            g.list[i].e = if ye > e { ye } else { e };
            for _ in g.list.drain(i + 1..=yi) {
                // swallowed by the widened range
            }
            for _ in i + 1..=yi {
                g.note_free();
            }
            i
        };

        // Coalesce with the successor if the two became adjacent.
        if at + 1 < g.list.len() && g.list[at].e.wrapping_add(1) == g.list[at + 1].s {
            g.list[at].e = g.list[at + 1].e;
            g.list.remove(at + 1);
            g.note_free();
        }

        Ok(())
    }

    /// Subtract `[s, e]`. Splitting a range strictly containing `[s, e]`
    /// allocates, and fails with `OutOfMemory` when the headroom is
    /// exhausted.
    pub fn remove_range(&self, s: u64, e: u64) -> Result<(), CoprocError> {
        debug_assert!(s <= e);

        let mut g = self.ranges.write();
        let xi = g.find(s);
        let yi = g.find(e);

        if xi == yi {
            let Some(i) = xi else { return Ok(()) };
            if g.list[i].e < s {
                return Ok(());
            }
            let Range { s: rs, e: re } = g.list[i];

            if rs < s && re > e {
                if !g.alloc_ok() {
                    return Err(CoprocError::OutOfMemory);
                }
                g.list[i].e = s - 1;
                g.list.insert(i + 1, Range { s: e + 1, e: re });
                g.note_alloc();
            } else if rs == s && re <= e {
                g.list.remove(i);
                g.note_free();
            } else if rs == s {
                g.list[i].s = e + 1;
            } else if re <= e {
                g.list[i].e = s - 1;
            }
        } else {
            // yi is Some for the same reason as in add_range.
            let yi = yi.unwrap();
            let i = match xi {
                None => 0,
                Some(x) => {
                    if g.list[x].e < s {
                        // Ends before the removal even starts.
                        x + 1
                    } else if g.list[x].s < s {
                        g.list[x].e = s - 1;
                        x + 1
                    } else {
                        x
                    }
                }
            };
            for _ in g.list.drain(i..yi) {
                // fully covered by [s, e]
            }
            for _ in i..yi {
                g.note_free();
            }
            g.list[i].s = e.wrapping_add(1);
            if g.list[i].s > g.list[i].e {
                g.list.remove(i);
                g.note_free();
            }
        }

        Ok(())
    }

    /// True iff a single existing range covers `[s, e]`.
    pub fn contains_range(&self, s: u64, e: u64) -> bool {
        debug_assert!(s <= e);
        let g = self.ranges.read();
        g.find(s).is_some_and(|i| g.list[i].e >= e)
    }

    /// True iff any range shares at least one point with `[s, e]`.
    pub fn overlaps_range(&self, s: u64, e: u64) -> bool {
        debug_assert!(s <= e);
        let g = self.ranges.read();
        g.find(e).is_some_and(|i| s <= g.list[i].e)
    }

    /// Invoke `cb` for the intersection of every stored range with
    /// `[s, e]`, in ascending order. A non-zero return stops the walk and
    /// is handed back to the caller.
    pub fn report_ranges(&self, s: u64, e: u64, mut cb: impl FnMut(u64, u64) -> i32) -> i32 {
        let g = self.ranges.read();
        let mut rc = 0;

        for x in g.list.iter().take_while(|x| x.s <= e) {
            if x.e >= s {
                rc = cb(x.s.max(s), x.e.min(e));
                if rc != 0 {
                    break;
                }
            }
        }

        rc
    }

    pub fn add_singleton(&self, s: u64) -> Result<(), CoprocError> {
        self.add_range(s, s)
    }

    pub fn remove_singleton(&self, s: u64) -> Result<(), CoprocError> {
        self.remove_range(s, s)
    }

    pub fn contains_singleton(&self, s: u64) -> bool {
        self.contains_range(s, s)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.read().list.is_empty()
    }

    /// Exchange the contents of two sets. Locks are taken in address order
    /// so two concurrent swaps of the same pair cannot deadlock. Names,
    /// flags and headroom counters stay with their set.
    pub fn swap(a: &RangeSet, b: &RangeSet) {
        let pa = a as *const RangeSet as usize;
        let pb = b as *const RangeSet as usize;

        let (mut ga, mut gb) = if pa < pb {
            let ga = a.ranges.write();
            let gb = b.ranges.write();
            (ga, gb)
        } else {
            let gb = b.ranges.write();
            let ga = a.ranges.write();
            (ga, gb)
        };

        core::mem::swap(&mut ga.list, &mut gb.list);
    }

    /// Push the set through the log ring.
    pub fn printk(&self) {
        crate::log!("{}", self);
    }
}

struct Limit(u64, RangeSetFlags);

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.1.contains(RangeSetFlags::PRETTYPRINT_HEX) {
            write!(f, "{:x}", self.0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let g = self.ranges.read();

        write!(f, "{:<10} {{", self.name.as_str())?;
        for (nr, x) in g.list.iter().enumerate() {
            if nr > 0 {
                write!(f, ",")?;
            }
            write!(f, " {}", Limit(x.s, self.flags))?;
            if x.s != x.e {
                write!(f, "-{}", Limit(x.e, self.flags))?;
            }
        }
        write!(f, " }}")
    }
}

/// An owning list a family of rangesets is threaded onto, e.g. one per
/// domain. Destroying the list destroys every set still on it.
pub struct RangeSetList {
    sets: Mutex<Vec<Arc<RangeSet>>>,
}

impl RangeSetList {
    pub const fn new() -> Self {
        RangeSetList { sets: Mutex::new(Vec::new()) }
    }

    pub fn insert(&self, r: Arc<RangeSet>) {
        self.sets.lock().push(r);
    }

    /// Unlink `r`; the set itself is freed once the last handle drops.
    pub fn destroy(&self, r: &Arc<RangeSet>) {
        self.sets.lock().retain(|x| !Arc::ptr_eq(x, r));
    }

    /// Destroy every set threaded on the list.
    pub fn destroy_all(&self) {
        self.sets.lock().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.sets.lock().is_empty()
    }

    /// Log every set on the list, indented one level.
    pub fn printk(&self) {
        for r in self.sets.lock().iter() {
            crate::log!("    {}", r);
        }
    }
}

impl Default for RangeSetList {
    fn default() -> Self {
        RangeSetList::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;
    use alloc::vec::Vec;

    fn collect(r: &RangeSet) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        r.report_ranges(0, u64::MAX, |s, e| {
            out.push((s, e));
            0
        });
        out
    }

    #[test]
    fn adjacent_and_overlapping_adds_merge() {
        let r = RangeSet::new("merge", RangeSetFlags::empty());
        r.add_range(10, 20).unwrap();
        r.add_range(21, 30).unwrap();
        r.add_range(5, 9).unwrap();
        assert_eq!(collect(&r), vec![(5, 30)]);
    }

    #[test]
    fn interior_remove_splits() {
        let r = RangeSet::new("split", RangeSetFlags::empty());
        r.add_range(0, 100).unwrap();
        r.remove_range(40, 50).unwrap();
        assert_eq!(collect(&r), vec![(0, 39), (51, 100)]);
        assert!(r.contains_range(0, 39));
        assert!(!r.contains_range(39, 51));
        assert!(r.overlaps_range(45, 60));
        assert!(!r.overlaps_range(40, 50));
    }

    #[test]
    fn add_spanning_several_ranges_coalesces() {
        let r = RangeSet::new("span", RangeSetFlags::empty());
        r.add_range(0, 1).unwrap();
        r.add_range(10, 11).unwrap();
        r.add_range(20, 21).unwrap();
        r.add_range(1, 20).unwrap();
        assert_eq!(collect(&r), vec![(0, 21)]);
    }

    #[test]
    fn remove_spanning_several_ranges() {
        let r = RangeSet::new("rspan", RangeSetFlags::empty());
        r.add_range(0, 5).unwrap();
        r.add_range(10, 15).unwrap();
        r.add_range(20, 25).unwrap();
        r.remove_range(3, 22).unwrap();
        assert_eq!(collect(&r), vec![(0, 2), (23, 25)]);
    }

    #[test]
    fn limit_blocks_allocation_but_not_merge() {
        let r = RangeSet::new("limit", RangeSetFlags::empty());
        r.limit(1);
        r.add_singleton(0).unwrap();
        assert_eq!(r.add_singleton(2), Err(CoprocError::OutOfMemory));
        // Adjacent singleton merges without allocating.
        r.add_singleton(1).unwrap();
        assert_eq!(collect(&r), vec![(0, 1)]);
    }

    #[test]
    fn split_respects_limit() {
        let r = RangeSet::new("slimit", RangeSetFlags::empty());
        r.limit(1);
        r.add_range(0, 10).unwrap();
        assert_eq!(r.remove_range(4, 6), Err(CoprocError::OutOfMemory));
        // Trimming an end needs no allocation.
        r.remove_range(0, 4).unwrap();
        assert_eq!(collect(&r), vec![(5, 10)]);
    }

    #[test]
    fn report_stops_on_nonzero() {
        let r = RangeSet::new("report", RangeSetFlags::empty());
        r.add_range(0, 1).unwrap();
        r.add_range(5, 6).unwrap();
        r.add_range(10, 11).unwrap();
        let mut seen = 0;
        let rc = r.report_ranges(0, u64::MAX, |_, _| {
            seen += 1;
            if seen == 2 {
                -1
            } else {
                0
            }
        });
        assert_eq!(rc, -1);
        assert_eq!(seen, 2);
    }

    #[test]
    fn swap_exchanges_contents() {
        let a = RangeSet::new("a", RangeSetFlags::empty());
        let b = RangeSet::new("b", RangeSetFlags::empty());
        a.add_range(0, 3).unwrap();
        b.add_range(100, 200).unwrap();
        RangeSet::swap(&a, &b);
        assert_eq!(collect(&a), vec![(100, 200)]);
        assert_eq!(collect(&b), vec![(0, 3)]);
    }

    #[test]
    fn display_honours_hex_flag() {
        let r = RangeSet::new("mmio", RangeSetFlags::PRETTYPRINT_HEX);
        r.add_range(0xe600_0000, 0xe600_0fff).unwrap();
        r.add_singleton(0x10).unwrap();
        assert_eq!(format!("{}", r), "mmio       { 10, e6000000-e6000fff }");
    }

    #[test]
    fn list_destroy_unthreads_sets() {
        let list = RangeSetList::new();
        let r = RangeSet::new("iomem", RangeSetFlags::empty());
        list.insert(r.clone());
        assert!(!list.is_empty());
        list.destroy(&r);
        assert!(list.is_empty());

        list.insert(RangeSet::new("ioport", RangeSetFlags::empty()));
        list.insert(RangeSet::new("irq", RangeSetFlags::empty()));
        list.destroy_all();
        assert!(list.is_empty());
    }
}
