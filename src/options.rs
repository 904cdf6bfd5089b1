use crate::{
    error::{error_validation, Error},
    prefix::PREFIX_SEGMENT_CAPACITY,
};

/// Options for an [crate::Art] index
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub struct ArtOptions {
    /// Size in bytes of each buffer the node allocators carve slots from.
    ///
    /// Every node shape has its own allocator and each allocator grows one buffer at a time.
    /// Buffers always hold at least one slot, even for node shapes larger than this value.
    /// Smaller buffers make vacuums more granular at the cost of more bookkeeping.
    ///
    /// Default: `256 KB`
    pub buffer_size: usize,
    /// Number of key bytes stored in each prefix segment.
    ///
    /// Longer compressed paths are stored as chains of segments. Must be in `1..=15`.
    ///
    /// Default: `15`
    pub prefix_count: u8,
    /// Share of an allocator's buffers that must be reclaimable before a vacuum relocates
    /// its nodes.
    ///
    /// A buffer is reclaimable if the live nodes of the allocator would fit in fewer buffers.
    /// E.g. with `0.1`, an allocator with 20 buffers is only vacuumed if its nodes could be
    /// packed in 18 buffers or less.
    ///
    /// Default: `0.1`
    pub vacuum_threshold: f64,
    /// Maximum number of buffers each node allocator may hold.
    ///
    /// Operations that would require more buffers fail with [Error::OutOfMemory] and leave the
    /// index untouched.
    ///
    /// Default: `None` (unbounded)
    pub max_buffers_per_allocator: Option<u32>,
}

impl Default for ArtOptions {
    fn default() -> Self {
        Self {
            buffer_size: 256 * 1024,
            prefix_count: PREFIX_SEGMENT_CAPACITY as u8,
            vacuum_threshold: 0.1,
            max_buffers_per_allocator: None,
        }
    }
}

impl ArtOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.buffer_size == 0 {
            return Err(error_validation!("buffer_size must be > 0"));
        }
        if self.prefix_count == 0 || self.prefix_count as usize > PREFIX_SEGMENT_CAPACITY {
            return Err(error_validation!(
                "prefix_count ({}) must be in 1..={PREFIX_SEGMENT_CAPACITY}",
                self.prefix_count
            ));
        }
        if !(0.0..=1.0).contains(&self.vacuum_threshold) {
            return Err(error_validation!(
                "vacuum_threshold ({}) must be in 0.0..=1.0",
                self.vacuum_threshold
            ));
        }
        if self.max_buffers_per_allocator == Some(0) {
            return Err(error_validation!("max_buffers_per_allocator must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(ArtOptions::default().validate().is_ok());
        let mut opts = ArtOptions::default();
        opts.prefix_count = 16;
        assert!(matches!(opts.validate(), Err(Error::Validation(_))));
        let mut opts = ArtOptions::default();
        opts.vacuum_threshold = 1.5;
        assert!(opts.validate().is_err());
        let mut opts = ArtOptions::default();
        opts.buffer_size = 0;
        assert!(opts.validate().is_err());
        let mut opts = ArtOptions::default();
        opts.max_buffers_per_allocator = Some(0);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_serde() {
        let mut opts = ArtOptions::default();
        opts.prefix_count = 4;
        opts.max_buffers_per_allocator = Some(3);
        let json = serde_json::to_string(&opts).unwrap();
        let back: ArtOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(opts, back);
    }
}
