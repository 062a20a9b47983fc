use crate::mem::{CoreMap, TranslationEntry, Vpn};

/// Number of lines in the simulated translation cache.
pub const TLB_SIZE: usize = 4;

/// The running thread's view of the hardware translation cache: a tiny,
/// fully associative array of live translations. This is only a cache; the
/// inverted page table stays authoritative.
///
/// Lines accumulate used/dirty bits as the processor touches them; those
/// bits are published back into the core map whenever a line dies (flush,
/// single-line invalidation, or FIFO displacement). Since every swap-in
/// starts with a full flush, the eviction sweep and the dirty write-back
/// always see current bits.
#[derive(Default)]
pub struct TlbManager {
    lines: [Option<TranslationEntry>; TLB_SIZE],
    next_line: usize,
}

impl TlbManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a cached translation. A write against a read-only line misses
    /// on purpose: protection is enforced in the fault path, not here.
    pub fn find(&mut self, vpn: Vpn, is_write: bool) -> Option<TranslationEntry> {
        for line in self.lines.iter_mut().flatten() {
            if line.flags.valid() && line.vpn == vpn {
                if is_write && line.flags.read_only() {
                    return None;
                }
                line.flags = line.flags.with_used(true);
                if is_write {
                    line.flags = line.flags.with_dirty(true);
                }
                return Some(*line);
            }
        }
        None
    }

    /// Index of the valid line caching `vpn`, if any.
    pub fn seek(&self, vpn: Vpn) -> Option<usize> {
        self.lines
            .iter()
            .position(|line| line.is_some_and(|e| e.flags.valid() && e.vpn == vpn))
    }

    /// Cache a translation, replacing the line for the same vpn if present,
    /// otherwise overwriting the oldest slot. The displaced line's bits are
    /// written back first.
    pub fn insert(&mut self, entry: TranslationEntry, core_map: &mut CoreMap) {
        let slot = match self.seek(entry.vpn) {
            Some(i) => i,
            None => {
                let i = self.next_line;
                self.next_line = (self.next_line + 1) % TLB_SIZE;
                i
            }
        };
        self.invalidate_line(slot, core_map);
        let mut entry = entry;
        entry.flags = entry.flags.with_valid(true);
        self.lines[slot] = Some(entry);
    }

    /// Drop one line, publishing its used/dirty bits into the core map.
    pub fn invalidate_line(&mut self, index: usize, core_map: &mut CoreMap) {
        if let Some(old) = self.lines[index].take() {
            write_back(&old, core_map);
        }
    }

    /// Drop every line. Called on address-space switch and before every
    /// swap-in, so no stale mapping can survive a frame reassignment.
    pub fn flush(&mut self, core_map: &mut CoreMap) {
        for index in 0..TLB_SIZE {
            self.invalidate_line(index, core_map);
        }
        self.next_line = 0;
    }
}

/// Merge a dying line's reference/modification bits into the frame it maps.
fn write_back(line: &TranslationEntry, core_map: &mut CoreMap) {
    if let Some(page) = core_map.get_mut(line.ppn) {
        if page.entry.flags.valid() && page.entry.vpn == line.vpn {
            let flags = page.entry.flags;
            page.entry.flags = flags
                .with_used(flags.used() | line.flags.used())
                .with_dirty(flags.dirty() | line.flags.dirty());
        }
    }
}
