use serde::{Deserialize, Serialize};
use tessera_signing::SignedJson;

/// Path of the inbound replication endpoint.
pub const PUSH_PATH: &str = "/_matrix/identity/replicate/v1/push";

/// Body of a replication push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationPayload {
    #[serde(rename = "sgAssocs", alias = "signedAssociations")]
    pub sg_assocs: Vec<ReplicatedAssociation>,
}

/// One association in a push, tagged with its sequence on the origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedAssociation {
    #[serde(rename = "originId", alias = "originID")]
    pub origin_id: i64,
    #[serde(rename = "signedAssociation")]
    pub signed_association: SignedJson,
}
