// Copyright 2023, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Ring buffer of recent NCI traffic, for debug dumps.

use bytes::Bytes;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Direction of a recorded packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Host to NFCC
    Tx,
    /// NFCC to host
    Rx,
}

struct Entry {
    direction: Direction,
    at: Duration,
    bytes: Bytes,
}

/// Keeps the last `capacity` packets.
pub struct Snoop {
    capacity: usize,
    started: Instant,
    entries: Mutex<VecDeque<Entry>>,
}

impl Snoop {
    /// Create an empty log.
    pub fn new(capacity: usize) -> Snoop {
        Snoop {
            capacity,
            started: Instant::now(),
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Record a packet, evicting the oldest one when full.
    pub fn record(&self, direction: Direction, bytes: &[u8]) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(Entry {
            direction,
            at: self.started.elapsed(),
            bytes: Bytes::copy_from_slice(bytes),
        });
    }

    /// Number of recorded packets.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write one line per packet, oldest first.
    pub fn dump(&self, out: &mut dyn Write) -> io::Result<()> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(out, "NCI snoop: {} packet(s)", entries.len())?;
        for entry in entries.iter() {
            write!(out, "{:>10.3} {:?}", entry.at.as_secs_f64(), entry.direction)?;
            for b in entry.bytes.iter() {
                write!(out, " {:02x}", b)?;
            }
            writeln!(out)?;
        }
        Ok(())
    }
}
