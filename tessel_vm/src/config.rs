//! Stack configuration. These settings affect how the interpreter
//! stack reserves and commits memory, not what runs on it.

use std::{convert::TryFrom, str::FromStr};
use thiserror::Error;

use crate::{memory, register::Register};

/// Default capacity of a stack, in slots.
pub const DEFAULT_CAPACITY: usize = 512 * 1024;
/// Memory is committed in multiples of this many bytes.
pub const DEFAULT_COMMIT_GRANULARITY: usize = 16 * 1024;
/// An empty stack holding more than this many committed bytes
/// gives them back to the OS.
pub const DEFAULT_MAX_EXCESS_CAPACITY: usize = 8 * 1024;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("unknown stack option `{0}`")]
    UnknownOption(String),
    #[error("stack option `{0}` needs a value (`{0}=...`)")]
    MissingValue(String),
    #[error("invalid value `{value}` for stack option `{option}`")]
    InvalidValue { option: String, value: String },
    #[error("commit granularity {0} is not a multiple of the slot size")]
    GranularityNotSlotAligned(usize),
    #[error("commit granularity {granularity} is not a multiple of the page size ({page_size})")]
    GranularityNotPageAligned {
        granularity: usize,
        page_size: usize,
    },
    #[error(
        "a stack of {capacity} slots cannot hold two commit chunks of {granularity} bytes"
    )]
    CapacityTooSmall { capacity: usize, granularity: usize },
}

/// Where a stack gets its memory from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemoryBackend {
    /// Reserve address space from the OS and commit pages on demand.
    Os,
    /// Allocate the whole reservation on the heap up front.
    /// Commits are bookkeeping only, so any slot-aligned granularity works.
    Heap,
}

impl FromStr for MemoryBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "os" => Ok(MemoryBackend::Os),
            "heap" => Ok(MemoryBackend::Heap),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StackConfig {
    /// Number of slots to reserve.
    pub capacity: usize,
    /// Size in bytes of each commit.
    pub commit_granularity: usize,
    /// Committed bytes an empty stack may keep before releasing them.
    pub max_excess_capacity: usize,
    pub backend: MemoryBackend,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            commit_granularity: DEFAULT_COMMIT_GRANULARITY,
            max_excess_capacity: DEFAULT_MAX_EXCESS_CAPACITY,
            backend: MemoryBackend::Os,
        }
    }
}

impl StackConfig {
    pub const fn new(
        capacity: usize,
        commit_granularity: usize,
        max_excess_capacity: usize,
        backend: MemoryBackend,
    ) -> Self {
        Self {
            capacity,
            commit_granularity,
            max_excess_capacity,
            backend,
        }
    }

    /// Size of the reservation: the capacity rounded up to whole commit chunks.
    pub fn reservation_size(&self) -> usize {
        round_up(self.capacity * Register::SIZE, self.commit_granularity)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.commit_granularity == 0 || self.commit_granularity % Register::SIZE != 0 {
            return Err(ConfigError::GranularityNotSlotAligned(
                self.commit_granularity,
            ));
        }

        if self.backend == MemoryBackend::Os {
            let page_size = memory::page_size();

            if self.commit_granularity % page_size != 0 {
                return Err(ConfigError::GranularityNotPageAligned {
                    granularity: self.commit_granularity,
                    page_size,
                });
            }
        }

        // One chunk is held back as the error reserve, so anything
        // smaller than two chunks leaves no usable stack at all.
        if self.reservation_size() < 2 * self.commit_granularity {
            return Err(ConfigError::CapacityTooSmall {
                capacity: self.capacity,
                granularity: self.commit_granularity,
            });
        }

        Ok(())
    }
}

/// Goes from a list of `key=value` strings to a `StackConfig`,
/// starting from the defaults. This is useful for command line
/// applications such as the frontend.
impl TryFrom<Vec<String>> for StackConfig {
    type Error = ConfigError;

    fn try_from(options: Vec<String>) -> Result<Self, Self::Error> {
        let mut res = StackConfig::default();

        for option in options {
            let (key, value) = match option.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => return Err(ConfigError::MissingValue(option)),
            };

            let invalid = || ConfigError::InvalidValue {
                option: key.to_owned(),
                value: value.to_owned(),
            };

            match key {
                "capacity" => res.capacity = parse_size(value).ok_or_else(invalid)?,

                "commit-granularity" => {
                    res.commit_granularity = parse_size(value).ok_or_else(invalid)?
                },

                "max-excess-capacity" => {
                    res.max_excess_capacity = parse_size(value).ok_or_else(invalid)?
                },

                "backend" => res.backend = value.parse().map_err(|_| invalid())?,
                _ => return Err(ConfigError::UnknownOption(key.to_owned())),
            }
        }

        Ok(res)
    }
}

/// Parses a plain number with an optional `k`/`K` (×1024) or
/// `m`/`M` (×1024²) suffix.
fn parse_size(value: &str) -> Option<usize> {
    let (digits, multiplier) = match value.chars().last()? {
        'k' | 'K' => (&value[..value.len() - 1], 1024),
        'm' | 'M' => (&value[..value.len() - 1], 1024 * 1024),
        _ => (value, 1),
    };

    digits.parse::<usize>().ok()?.checked_mul(multiplier)
}

pub(crate) const fn round_up(value: usize, granularity: usize) -> usize {
    (value + granularity - 1) / granularity * granularity
}
