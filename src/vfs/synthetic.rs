//! Synthetic paths
//!
//! A handful of well-known paths that exist without any backing store:
//! - `/etc/localtime`: a compiled-in zoneinfo file (US Pacific)
//! - `/dev/urandom`, `/dev/random`: non-cryptographic random devices

use crate::kernel::file::{File, FileKind, FileStat, RandomSource, StaticBuffer};
use crate::lock;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use std::sync::Mutex;

/// TZif data served at /etc/localtime
const LOCALTIME: &[u8] = include_bytes!("data/localtime.tzif");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Synthetic {
    Static(&'static [u8]),
    Random,
}

const ENTRIES: &[(&str, Synthetic)] = &[
    ("/etc/localtime", Synthetic::Static(LOCALTIME)),
    ("/dev/urandom", Synthetic::Random),
    ("/dev/random", Synthetic::Random),
];

fn lookup(path: &str) -> Option<Synthetic> {
    ENTRIES
        .iter()
        .find(|(p, _)| *p == path)
        .map(|(_, kind)| *kind)
}

pub struct SyntheticTable {
    /// Seeds each newly opened random device
    seeds: Mutex<SmallRng>,
}

impl SyntheticTable {
    pub fn new(seed: u64) -> Self {
        Self {
            seeds: Mutex::new(SmallRng::seed_from_u64(seed)),
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        lookup(path).is_some()
    }

    pub fn open(&self, path: &str) -> Option<File> {
        match lookup(path)? {
            Synthetic::Static(bytes) => Some(File::Static(StaticBuffer::new(bytes))),
            Synthetic::Random => {
                let seed = lock(&self.seeds).next_u64();
                Some(File::Random(RandomSource::new(seed)))
            }
        }
    }

    pub fn stat(&self, path: &str) -> Option<FileStat> {
        match lookup(path)? {
            Synthetic::Static(bytes) => Some(FileStat::new(FileKind::Regular, bytes.len() as u64)),
            Synthetic::Random => Some(FileStat::new(FileKind::CharDevice, 0)),
        }
    }
}
