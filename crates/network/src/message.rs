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

//! Chat message payload and handler types.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// A chat message decoded from a MESSAGE frame body.
///
/// Brokers emitted by older backend builds still use `nickname` for the
/// sender field; both spellings deserialize into [`Self::sender`]. Any
/// additional payload fields are preserved in [`Self::extra`] so handlers
/// can reach room metadata without this crate modeling it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Display name of the message author.
    #[serde(alias = "nickname")]
    pub sender: String,
    /// The message text.
    pub content: String,
    /// Remaining payload fields, passed through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ChatMessage {
    /// Creates a message with no extra fields.
    #[must_use]
    pub fn new<S1: Into<String>, S2: Into<String>>(sender: S1, content: S2) -> Self {
        Self {
            sender: sender.into(),
            content: content.into(),
            extra: serde_json::Map::new(),
        }
    }
}

/// A shareable callback invoked for each delivered [`ChatMessage`].
pub type ChatHandler = Arc<dyn Fn(ChatMessage) + Send + Sync>;

/// Creates a handler which forwards messages into an unbounded channel,
/// returning the handler and the receiving end.
///
/// Convenient for consumers that drain messages from an async task instead
/// of reacting inside the callback.
#[must_use]
pub fn channel_chat_handler() -> (ChatHandler, mpsc::UnboundedReceiver<ChatMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = Arc::new(move |msg: ChatMessage| {
        if let Err(e) = tx.send(msg) {
            tracing::error!("Failed to send message on channel: {e}");
        }
    });
    (handler, rx)
}
