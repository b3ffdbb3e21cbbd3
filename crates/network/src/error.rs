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

//! Error types produced by the STOMP client implementation.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// A typed error enumeration for the STOMP client.
///
/// Transport-level failures surface only through `connect()`; payload and
/// handler failures are contained locally and never reach the caller.
/// Variants carry rendered messages so the error stays `Clone`-able, which
/// lets a single connect attempt fan its outcome out to every concurrent
/// caller awaiting it.
#[derive(Debug, Clone, Error)]
pub enum StompError {
    /// WebSocket transport error (upgrade, read, or write failure).
    #[error("Transport error: {0}")]
    Transport(String),
    /// The broker rejected the STOMP handshake with an ERROR frame.
    #[error("STOMP handshake failed: {0}")]
    Handshake(String),
    /// The connection attempt did not complete within the configured timeout.
    #[error("Connection attempt timed out after {0} ms")]
    Timeout(u64),
    /// A frame violated the STOMP wire format.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// The client was explicitly disconnected and the operation was abandoned.
    #[error("Client is closed")]
    ClientClosed,
}

impl From<tungstenite::Error> for StompError {
    fn from(error: tungstenite::Error) -> Self {
        Self::Transport(error.to_string())
    }
}
