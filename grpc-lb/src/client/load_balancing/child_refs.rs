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

use std::sync::Arc;

use arc_swap::ArcSwap;

/// A snapshot of the children of a load balancing policy, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildRefs {
    /// Pool ids of the live subchannels the policy holds, in creation order.
    pub subchannels: Vec<u64>,
    /// Ids of nested channels or policies, as reported by the policy.
    pub channels: Vec<u64>,
}

/// The published copy of a policy's [`ChildRefs`].
///
/// The policy republishes from its serializer whenever its children change;
/// readers on any thread load the latest snapshot without locking.
#[derive(Clone, Default)]
pub struct ChildRefsHandle {
    current: Arc<ArcSwap<ChildRefs>>,
}

impl ChildRefsHandle {
    /// Returns the most recently published snapshot.
    pub fn snapshot(&self) -> Arc<ChildRefs> {
        self.current.load_full()
    }

    pub(super) fn publish(&self, refs: ChildRefs) {
        if **self.current.load() != refs {
            self.current.store(Arc::new(refs));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ChildRefs, ChildRefsHandle};

    #[test]
    fn readers_observe_whole_snapshots() {
        let handle = ChildRefsHandle::default();
        let reader = {
            let handle = handle.clone();
            std::thread::spawn(move || {
                for _ in 0..10_000 {
                    let snapshot = handle.snapshot();
                    // Every published snapshot has as many channels as
                    // subchannels.
                    assert_eq!(snapshot.subchannels.len(), snapshot.channels.len());
                }
            })
        };
        for i in 0..1_000u64 {
            handle.publish(ChildRefs {
                subchannels: (0..i % 7).collect(),
                channels: (0..i % 7).map(|c| c + 100).collect(),
            });
        }
        reader.join().unwrap();
        assert_eq!(handle.snapshot().subchannels, (0..999 % 7).collect::<Vec<_>>());
    }
}
