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

//! The name resolution side of the load balancing contract.
//!
//! Resolvers are external to this crate.  They show up here only as the
//! addresses they produce and as the single-shot [`ResolutionRequest`] a
//! policy uses to ask for fresh addresses.

use std::fmt::{self, Display, Formatter};
use std::hash::{Hash, Hasher};

use super::subchannel::SubchannelArgs;

/// An Address is an identifier that indicates how to connect to a server.
#[non_exhaustive]
#[derive(Debug, Clone, Default, Ord, PartialOrd)]
pub struct Address {
    /// The network type is used to identify what kind of transport to create
    /// when connecting to this address.  Typically TCP_IP_NETWORK_TYPE.
    pub network_type: &'static str,

    /// The address itself is passed to the transport in order to create a
    /// connection to it.
    pub address: String,
}

impl Address {
    /// Creates a TCP/IP address, e.g. `Address::tcp("10.0.0.1:443")`.
    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            network_type: TCP_IP_NETWORK_TYPE,
            address: address.into(),
        }
    }
}

impl Eq for Address {}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.network_type == other.network_type && self.address == other.address
    }
}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.network_type.hash(state);
        self.address.hash(state);
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network_type, self.address)
    }
}

/// Indicates the address is an IPv4 or IPv6 address that should be connected to
/// via TCP/IP.
pub static TCP_IP_NETWORK_TYPE: &str = "tcp";

/// The output of a name resolver as delivered to a load balancing policy.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct ResolverUpdate {
    /// The ordered list of resolved addresses.  An empty list is valid and
    /// means every pick fails until a later update provides addresses.
    pub addresses: Vec<Address>,

    /// Connection arguments that accompany the addresses.  They are part of
    /// the subchannel pool key.
    pub args: SubchannelArgs,

    /// Optional human readable note from the resolver, surfaced in errors
    /// when no address is usable.
    pub resolution_note: Option<String>,
}

impl ResolverUpdate {
    /// Creates an update carrying `addresses` and no connection arguments.
    pub fn new(addresses: Vec<Address>) -> Self {
        Self {
            addresses,
            ..Default::default()
        }
    }

    pub fn with_args(mut self, args: SubchannelArgs) -> Self {
        self.args = args;
        self
    }

    pub fn with_resolution_note(mut self, note: impl Into<String>) -> Self {
        self.resolution_note = Some(note.into());
        self
    }
}

/// A single-shot request for the resolver to re-resolve.
///
/// Installed by the owning channel; consumed the first time the policy fires
/// it.  The channel must install a new one to enable further requests.
pub struct ResolutionRequest {
    callback: Box<dyn FnOnce() + Send>,
}

impl ResolutionRequest {
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }

    /// Signals the resolver.
    pub fn fire(self) {
        (self.callback)()
    }
}

impl fmt::Debug for ResolutionRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolutionRequest").finish_non_exhaustive()
    }
}
