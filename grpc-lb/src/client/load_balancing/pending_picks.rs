/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

use std::collections::{HashMap, VecDeque};

use tonic::metadata::MetadataMap;

use super::{PickCallback, PickId};

/// A pick waiting for a picker that can answer it.
pub(super) struct QueuedPick {
    pub(super) metadata: MetadataMap,
    pub(super) flags: u32,
    pub(super) on_complete: PickCallback,
}

/// The FIFO queue of pending picks.
///
/// Removal by id is O(1): removed ids are left behind in `order` and skipped
/// when the queue is walked.  The order list is compacted once tombstones
/// outnumber live entries.
#[derive(Default)]
pub(super) struct PendingPicks {
    order: VecDeque<PickId>,
    picks: HashMap<PickId, QueuedPick>,
}

impl PendingPicks {
    pub(super) fn push_back(&mut self, id: PickId, pick: QueuedPick) {
        let prev = self.picks.insert(id, pick);
        debug_assert!(prev.is_none(), "{id} queued twice");
        self.order.push_back(id);
    }

    pub(super) fn remove(&mut self, id: PickId) -> Option<QueuedPick> {
        let pick = self.picks.remove(&id)?;
        if self.order.len() > 2 * self.picks.len() + 16 {
            let picks = &self.picks;
            self.order.retain(|id| picks.contains_key(id));
        }
        Some(pick)
    }

    /// Removes every pick, oldest first.
    pub(super) fn take_all(&mut self) -> Vec<(PickId, QueuedPick)> {
        let mut picks = std::mem::take(&mut self.picks);
        std::mem::take(&mut self.order)
            .into_iter()
            .filter_map(|id| picks.remove(&id).map(|pick| (id, pick)))
            .collect()
    }

    /// Removes the picks whose flags satisfy `matches`, oldest first.  The
    /// remaining picks keep their relative order.
    pub(super) fn remove_matching(
        &mut self,
        mut matches: impl FnMut(u32) -> bool,
    ) -> Vec<(PickId, QueuedPick)> {
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.picks.len());
        for id in std::mem::take(&mut self.order) {
            match self.picks.get(&id) {
                Some(pick) if matches(pick.flags) => {
                    if let Some(pick) = self.picks.remove(&id) {
                        removed.push((id, pick));
                    }
                }
                Some(_) => kept.push_back(id),
                None => {}
            }
        }
        self.order = kept;
        removed
    }

    pub(super) fn contains(&self, id: PickId) -> bool {
        self.picks.contains_key(&id)
    }

    pub(super) fn len(&self) -> usize {
        self.picks.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.picks.is_empty()
    }
}
