//! The application layer messages exchanged between coordinator and clients.
//!
//! Every datagram carries exactly one JSON encoded [`Message`], tagged by its
//! `type` field. Weights travel as `;`-joined decimal text.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Identifier of a client, `0..num_clients`.
pub type ClientId = u32;

/// Sender id reserved for the coordinator.
pub const COORDINATOR_ID: i32 = -1;

/// The global model broadcast at the start of a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalUpdate {
    pub round_id: u32,
    pub sender_id: i32,
    pub weights: String,
}

impl GlobalUpdate {
    pub fn new(round_id: u32, weights: String) -> Self {
        Self {
            round_id,
            sender_id: COORDINATOR_ID,
            weights,
        }
    }
}

/// A client's locally trained weights for a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalUpdate {
    pub round_id: u32,
    #[serde(rename = "senderId")]
    pub client_id: ClientId,
    pub weights: String,
    pub sample_count: u64,
    /// Zero or negative means the client did not report an accuracy.
    #[serde(default)]
    pub accuracy: f64,
}

impl LocalUpdate {
    /// The accuracy if the client reported one.
    pub fn reported_accuracy(&self) -> Option<f64> {
        (self.accuracy > 0.0).then_some(self.accuracy)
    }
}

/// The protocol message, one variant per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    GlobalUpdate(GlobalUpdate),
    LocalUpdate(LocalUpdate),
}

impl Message {
    /// Encodes the message into a datagram payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a datagram payload.
    ///
    /// # Errors
    /// `Codec` if the payload is not a well formed message, including local
    /// updates whose sender id is negative.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn round_id(&self) -> u32 {
        match self {
            Message::GlobalUpdate(update) => update.round_id,
            Message::LocalUpdate(update) => update.round_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::GlobalUpdate(_) => "global_update",
            Message::LocalUpdate(_) => "local_update",
        }
    }
}

impl From<GlobalUpdate> for Message {
    fn from(value: GlobalUpdate) -> Self {
        Self::GlobalUpdate(value)
    }
}

impl From<LocalUpdate> for Message {
    fn from(value: LocalUpdate) -> Self {
        Self::LocalUpdate(value)
    }
}
