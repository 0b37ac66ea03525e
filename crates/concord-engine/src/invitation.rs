//! Flow invitations carried in message metadata.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use concord_flow::{Flow, FlowError, Participant};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Metadata key holding the invitation.
pub const INVITATION_KEY: &str = "flow_invitation";

/// Payload of a `flow_invitation` metadata entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowInvitation {
  pub flow_name: String,
  pub session_id: String,
  pub participants: Vec<Participant>,
  /// The flow document, as JSON.
  pub flow_spec: serde_json::Value,
}

impl FlowInvitation {
  pub fn parse_flow(&self) -> Result<Flow, FlowError> {
    Flow::from_json_value(self.flow_spec.clone())
  }

  /// SHA-256 over the canonical JSON encoding of the flow document.
  pub fn spec_digest(&self) -> String {
    let encoded = serde_json::to_vec(&self.flow_spec).unwrap_or_default();
    hex::encode(Sha256::digest(&encoded))
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub flow_invitation: Option<FlowInvitation>,
  #[serde(flatten)]
  pub extra: BTreeMap<String, serde_json::Value>,
}

/// A message as delivered by the messaging collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
  #[serde(default)]
  pub id: String,
  pub sender: String,
  #[serde(default)]
  pub subject: String,
  #[serde(default)]
  pub body: String,
  #[serde(default)]
  pub metadata: MessageMetadata,
}

/// A message handed to the messaging collaborator for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
  pub recipients: Vec<String>,
  pub subject: String,
  pub body: String,
  pub metadata: MessageMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvitationState {
  Pending,
  Joined,
  Declined,
}

/// An imported invitation, stored until it is joined or declined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvitationRecord {
  pub invitation: FlowInvitation,
  pub sender: String,
  pub spec_digest: String,
  pub state: InvitationState,
  pub received_at: DateTime<Utc>,
}

/// What the surrounding application shows for an invitation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvitationView {
  pub session_id: String,
  pub flow_name: String,
  pub sender: String,
  pub participants: Vec<Participant>,
  pub state: InvitationState,
  pub joined: bool,
  pub can_join: bool,
  pub can_decline: bool,
}

impl From<&InvitationRecord> for InvitationView {
  fn from(record: &InvitationRecord) -> Self {
    let state = record.state;
    Self {
      session_id: record.invitation.session_id.clone(),
      flow_name: record.invitation.flow_name.clone(),
      sender: record.sender.clone(),
      participants: record.invitation.participants.clone(),
      state,
      joined: state == InvitationState::Joined,
      can_join: state == InvitationState::Pending,
      can_decline: state == InvitationState::Pending,
    }
  }
}
