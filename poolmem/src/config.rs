//! Pool geometry: size-class ceiling and block capacity

use std::{alloc::Layout, error::Error, fmt::Display, mem::size_of};

use crate::{block::BLOCK_HEADER_SZ, util::divroundup};

/// Size of one pointer word. Every slice is a whole number of these.
pub const WORD_SIZE: usize = size_of::<usize>();
/// Default exclusive upper bound on request sizes
pub const DEFAULT_MAX_SIZE: usize = 256;
/// Default size in bytes of a block obtained from the provider
pub const DEFAULT_BLOCK_SIZE: usize = 8192;

/// Configuration for [PoolAllocator](crate::PoolAllocator)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Requests must satisfy `0 < size < max_size`.
    ///
    /// The size-class tables are direct-mapped, so each table has
    /// exactly this many entries (entry 0 is never used).
    pub max_size: usize,
    /// Bytes requested from the [BlockProvider](crate::BlockProvider) per block,
    /// including the one-word chain header.
    pub block_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// Why a [PoolConfig] was rejected
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// There must be at least one valid size (1)
    MaxSizeTooSmall { max_size: usize },
    /// Blocks are sliced in whole words
    BlockSizeUnaligned { block_size: usize },
    /// Blocks must be describable by a [Layout]
    BlockTooLarge { block_size: usize },
    /// The largest size class must fit at least once into a block
    BlockTooSmall {
        block_size: usize,
        largest_slice: usize,
    },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MaxSizeTooSmall { max_size } => {
                write!(f, "max_size {} leaves no valid request size", max_size)
            }
            ConfigError::BlockSizeUnaligned { block_size } => write!(
                f,
                "block_size {} is not a multiple of the word size {}",
                block_size, WORD_SIZE
            ),
            ConfigError::BlockTooLarge { block_size } => {
                write!(f, "block_size {} exceeds the largest layout size", block_size)
            }
            ConfigError::BlockTooSmall {
                block_size,
                largest_slice,
            } => write!(
                f,
                "block_size {} cannot hold one {}-byte slice after its header",
                block_size, largest_slice
            ),
        }
    }
}

impl Error for ConfigError {}

impl PoolConfig {
    /// Check that every size class can be served from one block
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size < 2 {
            return Err(ConfigError::MaxSizeTooSmall {
                max_size: self.max_size,
            });
        }
        if self.block_size % WORD_SIZE != 0 {
            return Err(ConfigError::BlockSizeUnaligned {
                block_size: self.block_size,
            });
        }
        if Layout::from_size_align(self.block_size, WORD_SIZE).is_err() {
            return Err(ConfigError::BlockTooLarge {
                block_size: self.block_size,
            });
        }
        // saturates for sizes near usize::MAX, which can never fit anyway
        let largest_slice = Self::slice_words(self.max_size - 1).saturating_mul(WORD_SIZE);
        let usable = self.block_size.checked_sub(BLOCK_HEADER_SZ);
        if usable.map_or(true, |usable| usable < largest_slice) {
            return Err(ConfigError::BlockTooSmall {
                block_size: self.block_size,
                largest_slice,
            });
        }
        Ok(())
    }

    /// Whether `size` is a request this pool can serve
    #[inline]
    pub fn serves(&self, size: usize) -> bool {
        size > 0 && size < self.max_size
    }

    /// Number of words in a slice of the given size class
    ///
    /// Slices are never smaller than one word, because a free slice
    /// has to hold the free-list link.
    #[inline]
    pub const fn slice_words(size: usize) -> usize {
        let words = divroundup(size, WORD_SIZE);
        if words == 0 {
            1
        } else {
            words
        }
    }

    /// Bytes actually occupied by a slice of the given size class
    #[inline]
    pub const fn slice_bytes(size: usize) -> usize {
        Self::slice_words(size) * WORD_SIZE
    }

    /// Bytes of a block available for slicing
    #[inline]
    pub fn usable_block_bytes(&self) -> usize {
        self.block_size - BLOCK_HEADER_SZ
    }

    /// How many slices of the given size class one block is cut into
    #[inline]
    pub fn slices_per_block(&self, size: usize) -> usize {
        self.usable_block_bytes() / Self::slice_bytes(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = PoolConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert!(config.serves(1));
        assert!(config.serves(255));
        assert!(!config.serves(0));
        assert!(!config.serves(256));
    }

    #[test]
    fn slice_geometry() {
        assert_eq!(PoolConfig::slice_words(1), 1);
        assert_eq!(PoolConfig::slice_words(WORD_SIZE), 1);
        assert_eq!(PoolConfig::slice_words(WORD_SIZE + 1), 2);
        assert_eq!(PoolConfig::slice_bytes(3), WORD_SIZE);

        let config = PoolConfig {
            max_size: 17,
            block_size: BLOCK_HEADER_SZ + 4 * 8,
        };
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.slices_per_block(8), 32 / PoolConfig::slice_bytes(8));
        assert_eq!(config.slices_per_block(16), 32 / PoolConfig::slice_bytes(16));
    }

    #[test]
    fn rejects_bad_configs() {
        let config = PoolConfig {
            max_size: 1,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::MaxSizeTooSmall { max_size: 1 })
        );

        let config = PoolConfig {
            block_size: 8193,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::BlockSizeUnaligned { block_size: 8193 })
        );

        let config = PoolConfig {
            max_size: 256,
            block_size: 128,
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::BlockTooSmall {
                block_size: 128,
                largest_slice: 256,
            })
        );
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("cannot hold one 256-byte slice"));
    }

    #[test]
    fn rejects_extreme_geometry() {
        let config = PoolConfig {
            max_size: usize::MAX,
            block_size: 8192,
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::BlockTooSmall {
                block_size: 8192,
                largest_slice: usize::MAX,
            })
        );

        let config = PoolConfig {
            max_size: 2,
            block_size: 0,
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BlockTooSmall { block_size: 0, .. })
        ));

        let block_size = isize::MAX as usize + 1;
        let config = PoolConfig {
            block_size,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::BlockTooLarge { block_size })
        );
    }
}
