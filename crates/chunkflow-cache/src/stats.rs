/// Catalog performance statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogStats {
    pub hits: u64,
    pub misses: u64,
    /// Slots whose latest version is live.
    pub entries: usize,
    /// Versions held across all slots, superseded ones and tombstones included.
    pub versions: usize,
    pub scopes: usize,
}

impl CatalogStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub versions_dropped: usize,
    pub slots_removed: usize,
}
