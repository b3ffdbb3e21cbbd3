// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2025 Danmu Console Developers. All rights reserved.
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! Resilient STOMP-over-WebSocket messaging core for the danmu console.
//!
//! The `danmu-network` crate provides the connection layer used by the live
//! chat admin console: a single shared [`client::StompClient`] that speaks
//! STOMP 1.2 over WebSocket, keeps handler registrations alive across
//! transport drops, replays subscriptions after reconnecting, and suppresses
//! duplicate chat messages inside a configurable time window.
//!
//! Key components:
//!
//! - [`client::StompClient`]: connection lifecycle, subscription fan-out,
//!   and automatic reconnection with exponential backoff.
//! - [`registry::SubscriptionRegistry`]: destination-to-handler mapping that
//!   outlives the transport.
//! - [`dedup::DedupCache`]: time-windowed duplicate suppression keyed by
//!   sender and content.
//! - [`stomp::StompFrame`]: the STOMP 1.2 wire codec.

#![warn(rustc::all)]
#![deny(unsafe_code)]
#![deny(nonstandard_style)]
#![deny(missing_debug_implementations)]
#![deny(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod backoff;
pub mod client;
pub mod dedup;
pub mod error;
pub mod message;
pub mod mode;
pub mod registry;
pub mod stomp;

pub use crate::{
    client::{ReconnectPolicy, StompClient, StompConfig, Subscription},
    dedup::DedupCache,
    error::StompError,
    message::{ChatHandler, ChatMessage, channel_chat_handler},
    mode::ConnectionState,
    registry::SubscriptionRegistry,
};
