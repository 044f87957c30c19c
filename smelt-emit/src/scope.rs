//! Variable scope and location tracking for the debugger's
//! variable-location table.
//!
//! Per variable the tracker keeps at most one open range; closing appends
//! it to the variable's ordered range list. Ranges never overlap and a
//! variable may reopen immediately in a new location (a register move
//! produces two back-to-back ranges).

use crate::code::{VarLocationEntry, VarLocationTable};
use crate::reg::Reg;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct VarId(pub u32);

impl VarId {
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

/// Physical home of a variable over one native-offset range.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum VarLoc {
    Reg(Reg),
    RegPair(Reg, Reg),
    Stack { base: Reg, offset: i32 },
    StackPair { base: Reg, offset: i32 },
    RegStack { reg: Reg, base: Reg, offset: i32 },
    FixedVarArg { offset: i32 },
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct VarRange {
    pub begin: u32,
    pub end: u32,
    pub loc: VarLoc,
}

#[derive(Copy, Clone, Debug)]
struct OpenRange {
    begin: u32,
    loc: VarLoc,
}

/// Lexical-scope table entry, used when optimizations are disabled and
/// scope boundaries must align exactly with source blocks.
#[derive(Copy, Clone, Debug)]
pub struct BlockScopeVar {
    pub var: VarId,
    pub loc: VarLoc,
}

pub struct ScopeTracker {
    open: Vec<Option<OpenRange>>,
    ranges: Vec<Vec<VarRange>>,

    /// Closes of never-opened ranges, tolerated when upstream liveness
    /// over-estimates scope.
    pub missed_closes: u32,
}

impl ScopeTracker {
    pub fn new(var_count: usize) -> ScopeTracker {
        ScopeTracker {
            open: vec![None; var_count],
            ranges: vec![Vec::new(); var_count],
            missed_closes: 0,
        }
    }

    fn grow(&mut self, var: VarId) {
        if var.idx() >= self.open.len() {
            self.open.resize(var.idx() + 1, None);
            self.ranges.resize(var.idx() + 1, Vec::new());
        }
    }

    pub fn has_open_range(&self, var: VarId) -> bool {
        var.idx() < self.open.len() && self.open[var.idx()].is_some()
    }

    pub fn open_location(&self, var: VarId) -> Option<VarLoc> {
        self.open.get(var.idx()).copied().flatten().map(|open| open.loc)
    }

    pub fn start_range(&mut self, var: VarId, loc: VarLoc, native_offset: u32) {
        self.grow(var);
        assert!(
            self.open[var.idx()].is_none(),
            "variable {:?} already has an open range",
            var
        );

        if let Some(last) = self.ranges[var.idx()].last() {
            debug_assert!(native_offset >= last.end);
        }

        self.open[var.idx()] = Some(OpenRange {
            begin: native_offset,
            loc,
        });
    }

    pub fn end_range(&mut self, var: VarId, native_offset: u32) {
        self.grow(var);

        let open = match self.open[var.idx()].take() {
            Some(open) => open,
            None => {
                // Liveness over-estimation; tolerated with a diagnostic.
                self.missed_closes += 1;
                return;
            }
        };

        debug_assert!(native_offset >= open.begin);

        // zero-length ranges carry no information
        if native_offset > open.begin {
            self.ranges[var.idx()].push(VarRange {
                begin: open.begin,
                end: native_offset,
                loc: open.loc,
            });
        }
    }

    /// End + start at the same offset: the variable stays in scope but
    /// changes its home. No-op when the location does not actually change.
    pub fn move_range(&mut self, var: VarId, new_loc: VarLoc, native_offset: u32) {
        if self.open_location(var) == Some(new_loc) {
            return;
        }

        self.end_range(var, native_offset);
        self.start_range(var, new_loc, native_offset);
    }

    /// Opens ranges for all incoming parameters at their initial homes,
    /// before any user code executes.
    pub fn open_param_ranges(&mut self, params: &[(VarId, VarLoc)]) {
        for &(var, loc) in params {
            self.start_range(var, loc, 0);
        }
    }

    /// Debuggable-code mode: block entry opens every variable of the
    /// block's lexical scope table, including zero-reference-count ones.
    pub fn open_scopes_for_block(&mut self, scope_vars: &[BlockScopeVar], native_offset: u32) {
        for entry in scope_vars {
            self.start_range(entry.var, entry.loc, native_offset);
        }
    }

    pub fn close_scopes_for_block(&mut self, vars: &[VarId], native_offset: u32) {
        for &var in vars {
            self.end_range(var, native_offset);
        }
    }

    /// Force-closes everything still open at the final code offset and
    /// produces the ordered location table.
    pub fn finish(mut self, end_offset: u32) -> VarLocationTable {
        for idx in 0..self.open.len() {
            if self.open[idx].is_some() {
                self.end_range(VarId(idx as u32), end_offset);
            }
        }

        let mut table = VarLocationTable::new();

        for (idx, ranges) in self.ranges.iter().enumerate() {
            for range in ranges {
                table.insert(VarLocationEntry {
                    var: VarId(idx as u32),
                    begin: range.begin,
                    end: range.end,
                    loc: range.loc,
                });
            }
        }

        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RBP: Reg = Reg(5);

    #[test]
    fn test_move_produces_two_ranges() {
        let mut tracker = ScopeTracker::new(1);
        tracker.start_range(VarId(0), VarLoc::Reg(Reg(1)), 0);
        tracker.move_range(
            VarId(0),
            VarLoc::Stack {
                base: RBP,
                offset: 8,
            },
            40,
        );

        let table = tracker.finish(100);
        let ranges = table.ranges_for(VarId(0));
        assert_eq!(
            ranges,
            vec![
                VarLocationEntry {
                    var: VarId(0),
                    begin: 0,
                    end: 40,
                    loc: VarLoc::Reg(Reg(1)),
                },
                VarLocationEntry {
                    var: VarId(0),
                    begin: 40,
                    end: 100,
                    loc: VarLoc::Stack {
                        base: RBP,
                        offset: 8,
                    },
                },
            ]
        );
    }

    #[test]
    fn test_move_to_same_location_is_noop() {
        let mut tracker = ScopeTracker::new(1);
        tracker.start_range(VarId(0), VarLoc::Reg(Reg(3)), 0);
        tracker.move_range(VarId(0), VarLoc::Reg(Reg(3)), 20);

        let table = tracker.finish(60);
        assert_eq!(table.ranges_for(VarId(0)).len(), 1);
    }

    #[test]
    #[should_panic]
    fn test_double_open_asserts() {
        let mut tracker = ScopeTracker::new(1);
        tracker.start_range(VarId(0), VarLoc::Reg(Reg(1)), 0);
        tracker.start_range(VarId(0), VarLoc::Reg(Reg(2)), 4);
    }

    #[test]
    fn test_close_without_open_is_diagnosed_noop() {
        let mut tracker = ScopeTracker::new(1);
        tracker.end_range(VarId(0), 12);
        assert_eq!(tracker.missed_closes, 1);

        let table = tracker.finish(20);
        assert!(table.ranges_for(VarId(0)).is_empty());
    }

    #[test]
    fn test_zero_length_range_dropped() {
        let mut tracker = ScopeTracker::new(1);
        tracker.start_range(VarId(0), VarLoc::Reg(Reg(1)), 16);
        tracker.end_range(VarId(0), 16);

        let table = tracker.finish(32);
        assert!(table.ranges_for(VarId(0)).is_empty());
    }

    #[test]
    fn test_param_ranges_open_at_zero() {
        let mut tracker = ScopeTracker::new(2);
        tracker.open_param_ranges(&[
            (VarId(0), VarLoc::Reg(Reg(7))),
            (
                VarId(1),
                VarLoc::Stack {
                    base: RBP,
                    offset: 16,
                },
            ),
        ]);

        let table = tracker.finish(50);
        assert_eq!(table.ranges_for(VarId(0))[0].begin, 0);
        assert_eq!(table.ranges_for(VarId(1))[0].begin, 0);
        assert_eq!(table.ranges_for(VarId(1))[0].end, 50);
    }

    #[test]
    fn test_block_scopes() {
        let mut tracker = ScopeTracker::new(2);
        tracker.open_scopes_for_block(
            &[
                BlockScopeVar {
                    var: VarId(0),
                    loc: VarLoc::Reg(Reg(2)),
                },
                BlockScopeVar {
                    var: VarId(1),
                    loc: VarLoc::Stack {
                        base: RBP,
                        offset: -8,
                    },
                },
            ],
            4,
        );
        tracker.close_scopes_for_block(&[VarId(0), VarId(1)], 28);

        let table = tracker.finish(40);
        assert_eq!(table.ranges_for(VarId(0)), vec![VarLocationEntry {
            var: VarId(0),
            begin: 4,
            end: 28,
            loc: VarLoc::Reg(Reg(2)),
        }]);
        assert_eq!(table.ranges_for(VarId(1)).len(), 1);
    }

    #[test]
    fn test_reopen_after_close() {
        let mut tracker = ScopeTracker::new(1);
        tracker.start_range(VarId(0), VarLoc::Reg(Reg(1)), 0);
        tracker.end_range(VarId(0), 10);
        tracker.start_range(VarId(0), VarLoc::Reg(Reg(4)), 24);

        let table = tracker.finish(30);
        let ranges = table.ranges_for(VarId(0));
        assert_eq!(ranges.len(), 2);
        assert!(ranges[0].end <= ranges[1].begin);
    }
}
