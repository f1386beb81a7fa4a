//! Configuration options for a pairtable segment table.

/// Configuration options for opening a segment table.
#[derive(Debug, Clone)]
pub struct Options {
    /// Size cap for a segment data file (in bytes). A new append session
    /// rolls over to a fresh segment once the current file reaches it.
    /// Default: 64MB
    pub max_segment_size: u64,

    /// Block window used when binary-searching compressed second terms.
    /// Searches confined to one window run over a borrowed slice; searches
    /// spanning windows fall back to the cursor-checked variant.
    /// Default: 1MB
    pub read_buffer_size: usize,

    /// Number of distinct first terms after which the strategy optimizer
    /// gives up on row/cluster layouts and forces the column layout.
    /// Default: 2048
    pub column_threshold: usize,

    /// Pair count below which the optimizer simulates exact encoded sizes.
    /// At or above it, a fixed column strategy is chosen instead.
    /// Default: 102400
    pub exact_costing_limit: usize,

    /// Open the table read-only. Append sessions are rejected and nothing
    /// is written at close.
    /// Default: false
    pub read_only: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_segment_size: 64 * 1024 * 1024, // 64MB
            read_buffer_size: 1024 * 1024,      // 1MB
            column_threshold: 2048,
            exact_costing_limit: 100 * 1024,
            read_only: false,
        }
    }
}

impl Options {
    /// Creates a new Options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the segment file size cap.
    pub fn max_segment_size(mut self, size: u64) -> Self {
        self.max_segment_size = size;
        self
    }

    /// Sets the block window for compressed binary search.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Sets the distinct-first-term cutoff for the column layout.
    pub fn column_threshold(mut self, threshold: usize) -> Self {
        self.column_threshold = threshold;
        self
    }

    /// Sets the pair count cutoff for exact strategy costing.
    pub fn exact_costing_limit(mut self, limit: usize) -> Self {
        self.exact_costing_limit = limit;
        self
    }

    /// Opens the table read-only.
    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Validates the options and returns an error if any are invalid.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_segment_size == 0 {
            return Err(crate::Error::invalid_argument(
                "max_segment_size must be > 0",
            ));
        }
        if self.read_buffer_size < crate::codec::BLOCK_MIN_SIZE {
            return Err(crate::Error::invalid_argument(format!(
                "read_buffer_size must be >= {}",
                crate::codec::BLOCK_MIN_SIZE
            )));
        }
        if self.column_threshold == 0 {
            return Err(crate::Error::invalid_argument(
                "column_threshold must be > 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = Options::default();
        assert_eq!(opts.max_segment_size, 64 * 1024 * 1024);
        assert_eq!(opts.read_buffer_size, 1024 * 1024);
        assert!(!opts.read_only);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_options_builder() {
        let opts = Options::new()
            .max_segment_size(1024)
            .read_buffer_size(64)
            .read_only(true);

        assert_eq!(opts.max_segment_size, 1024);
        assert_eq!(opts.read_buffer_size, 64);
        assert!(opts.read_only);
    }

    #[test]
    fn test_options_validation() {
        let mut opts = Options::default();
        assert!(opts.validate().is_ok());

        opts.read_buffer_size = 4;
        assert!(opts.validate().is_err());

        opts.read_buffer_size = 1024;
        opts.max_segment_size = 0;
        assert!(opts.validate().is_err());
    }
}
