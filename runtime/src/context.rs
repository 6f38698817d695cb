use std::cell::Cell;

thread_local! {
    /// Tail of the last edge seen by this thread.
    static PREV_LOC: Cell<usize> = const { Cell::new(0) };
}

#[inline(always)]
pub fn prev_loc() -> usize {
    PREV_LOC.with(|prev_loc| prev_loc.get())
}

#[inline(always)]
pub fn set_prev_loc(loc: usize) {
    PREV_LOC.with(|prev_loc| prev_loc.set(loc));
}

/// Must be called in every freshly forked child, the forking thread keeps
/// the value it had in the fork server otherwise.
#[inline(always)]
pub fn reset_edge_state() {
    set_prev_loc(0);
}
