use core::fmt;

use crate::wire::{SeqNumber, SeqRange};

/// A sorted set of disjoint sequence-number ranges.
///
/// Backed by a growable array with binary search; the bounded windows keep
/// the cardinality small, so anything heavier would be overkill. Ranges are
/// kept sorted by start in wrapped order, disjoint and non-adjacent: an
/// insertion that touches or overlaps existing entries merges with them,
/// so the covered set is always stored as the minimum number of ranges.
///
/// Used for the out-of-order segments held by a receiver and for the
/// selectively-acknowledged ranges tracked by a sender.
#[derive(Debug, Clone, Default)]
pub struct RangeSet {
    ranges: Vec<SeqRange>,
}

impl RangeSet {
    pub const fn new() -> RangeSet {
        RangeSet { ranges: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = SeqRange> + '_ {
        self.ranges.iter().copied()
    }

    pub fn first(&self) -> Option<SeqRange> {
        self.ranges.first().copied()
    }

    /// Index of the last range whose start does not exceed `seq`, in
    /// wrapped order. `None` if every range starts after `seq`.
    fn predecessor(&self, seq: SeqNumber) -> Option<usize> {
        let mut low = 0isize;
        let mut high = self.ranges.len() as isize - 1;

        while low <= high {
            let middle = (low + high) / 2;
            let start = self.ranges[middle as usize].start;

            if start == seq {
                return Some(middle as usize);
            }
            if seq < start {
                high = middle - 1;
            } else {
                low = middle + 1;
            }
        }

        if high >= 0 {
            Some(high as usize)
        } else {
            None
        }
    }

    /// Insert `new` into the set, merging with any range it touches.
    ///
    /// Locates the predecessor by binary search, extends it if the new
    /// range adjoins or overlaps it, then walks forward absorbing every
    /// subsequent range up to the first true gap.
    pub fn insert(&mut self, new: SeqRange) {
        if new.size == 0 {
            return;
        }

        let prev = match self.predecessor(new.start) {
            None => {
                self.ranges.insert(0, new);
                0
            }
            Some(index) => {
                let prev_end = self.ranges[index].end();

                if prev_end < new.end() {
                    if prev_end < new.start {
                        // a gap before the new range, it starts its own entry
                        self.ranges.insert(index + 1, new);
                        index + 1
                    } else {
                        // starts within the predecessor, ends after it
                        self.ranges[index].size += new.end() - prev_end;
                        index
                    }
                } else {
                    // the predecessor already covers the new range
                    return;
                }
            }
        };

        // absorb following ranges up to the first gap
        let mut next = prev + 1;
        while next < self.ranges.len() {
            let current = self.ranges[next];
            let prev_end = self.ranges[prev].end();

            if prev_end < current.end() {
                if prev_end < current.start {
                    break;
                }
                self.ranges[prev].size += current.end() - prev_end;
            }

            self.ranges.remove(next);
        }
    }

    /// Remove ranges that lie entirely below the cumulative
    /// acknowledgment `ack`. A range only partially covered is kept.
    pub fn prune(&mut self, ack: SeqNumber) {
        let mut index = 0;
        while index < self.ranges.len() {
            let range = self.ranges[index];

            if ack <= range.start {
                break;
            }

            if ack < range.end() {
                // not fully acknowledged, which should not happen
                index += 1;
            } else {
                self.ranges.remove(index);
            }
        }
    }

    /// Consume the ranges contiguous with `expected` from the head of the
    /// set, returning how many new sequence numbers they contribute.
    /// Stale ranges entirely below `expected` are discarded along the way.
    pub fn take_contiguous(&mut self, expected: SeqNumber) -> u32 {
        let mut added = 0u32;

        while let Some(first) = self.first() {
            let current = expected + added;

            if current < first.start {
                break;
            }
            if current < first.end() {
                added += first.end() - current;
            }

            self.ranges.remove(0);
        }

        added
    }

    /// Locate the first uncovered gap at or after `seq`, bounded by the
    /// covered ranges. Returns `(start, end)` of the hole, or `None` when
    /// the set is empty or `seq` is at or beyond the last covered range.
    pub fn hole_after(&self, seq: SeqNumber) -> Option<(SeqNumber, SeqNumber)> {
        match self.predecessor(seq) {
            None => self.ranges.first().map(|head| (seq, head.start)),
            Some(index) if index + 1 < self.ranges.len() => {
                let start = seq.max(self.ranges[index].end());
                Some((start, self.ranges[index + 1].start))
            }
            Some(_) => None,
        }
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[ ")?;
        for range in &self.ranges {
            write!(f, "{range} ")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ::rand::seq::SliceRandom;
    use ::rand::SeedableRng;

    fn range(start: u32, size: u32) -> SeqRange {
        SeqRange::new(SeqNumber(start), size)
    }

    fn contents(set: &RangeSet) -> Vec<(u32, u32)> {
        set.iter().map(|r| (r.start.0, r.size)).collect()
    }

    #[test]
    fn insert_disjoint_sorted() {
        let mut set = RangeSet::new();
        set.insert(range(300, 50));
        set.insert(range(100, 50));
        set.insert(range(500, 50));
        assert_eq!(contents(&set), [(100, 50), (300, 50), (500, 50)]);
    }

    #[test]
    fn insert_merges_overlap() {
        let mut set = RangeSet::new();
        set.insert(range(100, 100));
        set.insert(range(150, 100));
        assert_eq!(contents(&set), [(100, 150)]);
    }

    #[test]
    fn insert_merges_adjacency() {
        let mut set = RangeSet::new();
        set.insert(range(100, 100));
        set.insert(range(200, 100));
        assert_eq!(contents(&set), [(100, 200)]);
    }

    #[test]
    fn insert_contained_is_noop() {
        let mut set = RangeSet::new();
        set.insert(range(100, 100));
        set.insert(range(120, 10));
        assert_eq!(contents(&set), [(100, 100)]);
    }

    #[test]
    fn insert_bridges_several() {
        let mut set = RangeSet::new();
        set.insert(range(100, 10));
        set.insert(range(120, 10));
        set.insert(range(140, 10));
        set.insert(range(400, 10));
        set.insert(range(105, 40));
        assert_eq!(contents(&set), [(100, 50), (400, 10)]);
    }

    #[test]
    fn insert_before_head_extends() {
        let mut set = RangeSet::new();
        set.insert(range(100, 10));
        set.insert(range(90, 15));
        assert_eq!(contents(&set), [(90, 20)]);
    }

    #[test]
    fn insert_is_permutation_independent() {
        let pieces = [
            range(0, 10),
            range(10, 10),
            range(25, 5),
            range(30, 10),
            range(18, 9),
            range(50, 1),
        ];
        let mut reference = RangeSet::new();
        for piece in pieces {
            reference.insert(piece);
        }

        let mut rng = ::rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..64 {
            let mut shuffled = pieces;
            shuffled.shuffle(&mut rng);
            let mut set = RangeSet::new();
            for piece in shuffled {
                set.insert(piece);
            }
            assert_eq!(contents(&set), contents(&reference));
        }
    }

    #[test]
    fn insert_across_wrap() {
        let mut set = RangeSet::new();
        set.insert(range(u32::MAX - 9, 10));
        set.insert(range(0, 10));
        assert_eq!(contents(&set), [(u32::MAX - 9, 20)]);

        set.insert(range(u32::MAX - 19, 15));
        assert_eq!(contents(&set), [(u32::MAX - 19, 30)]);
    }

    #[test]
    fn prune_drops_acknowledged() {
        let mut set = RangeSet::new();
        set.insert(range(100, 10));
        set.insert(range(120, 10));
        set.insert(range(140, 10));
        set.prune(SeqNumber(130));
        assert_eq!(contents(&set), [(140, 10)]);
    }

    #[test]
    fn prune_keeps_partial() {
        let mut set = RangeSet::new();
        set.insert(range(100, 20));
        set.prune(SeqNumber(110));
        assert_eq!(contents(&set), [(100, 20)]);
    }

    #[test]
    fn take_contiguous_consumes_prefix() {
        let mut set = RangeSet::new();
        set.insert(range(100, 10));
        set.insert(range(110, 5));
        set.insert(range(130, 10));
        assert_eq!(set.take_contiguous(SeqNumber(100)), 15);
        assert_eq!(contents(&set), [(130, 10)]);
    }

    #[test]
    fn take_contiguous_discards_stale() {
        let mut set = RangeSet::new();
        set.insert(range(80, 10));
        set.insert(range(100, 10));
        // everything below `expected` is old news
        assert_eq!(set.take_contiguous(SeqNumber(105)), 5);
        assert!(set.is_empty());
    }

    #[test]
    fn take_contiguous_stops_at_hole() {
        let mut set = RangeSet::new();
        set.insert(range(200, 10));
        assert_eq!(set.take_contiguous(SeqNumber(100)), 0);
        assert_eq!(contents(&set), [(200, 10)]);
    }

    #[test]
    fn take_contiguous_across_wrap() {
        let mut set = RangeSet::new();
        set.insert(range(u32::MAX - 4, 10));
        assert_eq!(set.take_contiguous(SeqNumber(u32::MAX - 4)), 10);
        assert!(set.is_empty());
    }

    #[test]
    fn hole_before_head() {
        let mut set = RangeSet::new();
        set.insert(range(200, 10));
        assert_eq!(
            set.hole_after(SeqNumber(150)),
            Some((SeqNumber(150), SeqNumber(200)))
        );
    }

    #[test]
    fn hole_between_ranges() {
        let mut set = RangeSet::new();
        set.insert(range(100, 10));
        set.insert(range(150, 10));
        // cursor inside the first range skips to its end
        assert_eq!(
            set.hole_after(SeqNumber(105)),
            Some((SeqNumber(110), SeqNumber(150)))
        );
        // cursor inside the gap stays put
        assert_eq!(
            set.hole_after(SeqNumber(120)),
            Some((SeqNumber(120), SeqNumber(150)))
        );
    }

    #[test]
    fn no_hole_past_tail() {
        let mut set = RangeSet::new();
        set.insert(range(100, 10));
        assert_eq!(set.hole_after(SeqNumber(100)), None);
        assert_eq!(set.hole_after(SeqNumber(115)), None);

        let empty = RangeSet::new();
        assert_eq!(empty.hole_after(SeqNumber(0)), None);
    }
}
