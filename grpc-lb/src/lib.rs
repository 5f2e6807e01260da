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

//! The load balancing core of a gRPC client channel.
//!
//! A channel hands the addresses produced by its name resolver to a pluggable
//! load balancing policy.  The policy owns connections to those addresses
//! (modeled as pooled subchannels), reports an aggregate connectivity state,
//! and selects a connection for every outgoing call.  This crate provides the
//! framework every such policy plugs into: the pick protocol with queuing and
//! cancellation, connectivity state watchers, re-resolution throttling, the
//! shared subchannel pool and the hand-off of queued picks between policy
//! instances.
//!
//! This version is in progress and not recommended for any production use.
//! All APIs are unstable.  Proceed at your own risk.

pub mod client;
mod rt;
