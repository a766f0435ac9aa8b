//! Signing associations and the invites attached to them.

use serde_json::{json, Value};
use tessera_signing::{ServerKey, SignedJson, SigningError};
use tessera_types::{Association, InviteToken};

/// Signs `association` as `server_name`.
pub fn sign_association(
    key: &ServerKey,
    server_name: &str,
    association: &Association,
) -> Result<SignedJson, SigningError> {
    let mut signed = association.to_json_map();
    key.sign(&mut signed, server_name)?;
    Ok(signed)
}

/// Attaches `invites` to a fresh binding under `invites`.
///
/// Each entry carries the invite itself, the bound `mxid`, and a `signed`
/// block `{mxid, token, signatures}` the inviter's homeserver can check.
pub fn attach_invites(
    key: &ServerKey,
    server_name: &str,
    association: &mut Association,
    invites: &[InviteToken],
) -> Result<(), SigningError> {
    if invites.is_empty() {
        return Ok(());
    }
    let mxid = association.mxid.clone().unwrap_or_default();

    let mut attached = Vec::with_capacity(invites.len());
    for invite in invites {
        let mut signed = match json!({"mxid": mxid, "token": invite.token}) {
            Value::Object(map) => map,
            _ => SignedJson::new(),
        };
        key.sign(&mut signed, server_name)?;

        let mut entry = invite.to_json_map();
        entry.insert("mxid".into(), Value::String(mxid.clone()));
        entry.insert("signed".into(), Value::Object(signed));
        attached.push(Value::Object(entry));
    }
    association
        .extra_fields
        .insert("invites".into(), Value::Array(attached));
    Ok(())
}
