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

use crate::client::name_resolution::ResolutionRequest;

/// Rate-limits re-resolution requests from a policy to its resolver.
///
/// At most one request can be outstanding.  The throttle is armed with a
/// [`ResolutionRequest`] by the channel; the first request from the policy
/// consumes it and later requests are suppressed until the channel installs a
/// new one.
#[derive(Debug, Default)]
pub(super) struct ReresolutionThrottle {
    request: Option<ResolutionRequest>,
}

impl ReresolutionThrottle {
    /// Arms the throttle.  The previous request must have been consumed.
    pub(super) fn install(&mut self, request: ResolutionRequest) {
        assert!(
            self.request.is_none(),
            "a re-resolution request is already installed"
        );
        self.request = Some(request);
    }

    /// Fires the installed request, if any.  Returns whether the resolver was
    /// signalled.
    pub(super) fn try_request(&mut self) -> bool {
        match self.request.take() {
            Some(request) => {
                tracing::debug!("requesting re-resolution");
                request.fire();
                true
            }
            None => {
                tracing::trace!("re-resolution already requested; suppressing");
                false
            }
        }
    }

    /// Drops the installed request without firing it.
    pub(super) fn clear(&mut self) {
        self.request = None;
    }

    pub(super) fn is_armed(&self) -> bool {
        self.request.is_some()
    }
}
