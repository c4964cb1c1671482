//! awl Protocol Messages
//!
//! - `AuthPeer`: friend request sent over `/auth`
//! - `AuthPeerResponse`: whether the receiver already knows the sender
//! - `PeerStatusInfo`: both sides of a `/status` exchange

use serde::{Deserialize, Serialize};

/// Friend request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthPeer {
    /// Display name of the requesting node
    pub name: String,
}

/// Reply to a friend request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthPeerResponse {
    /// `true` iff the responder already has the requester as a known peer
    pub confirmed: bool,
}

/// What the sender knows about the receiver
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KnownPeerInfo {
    pub alias: String,
    #[serde(rename = "IPAddr")]
    pub ip_addr: String,
    pub domain_name: String,
    /// The sender's `WeAllowUsingAsExitNode` for the receiver
    pub allowed_using_as_exit_node: bool,
    pub declined: bool,
}

/// Status message, written once by each side of a `/status` stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PeerStatusInfo {
    pub name: String,
    #[serde(default)]
    pub known_peer_info: KnownPeerInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_uses_pascal_case_keys() {
        let status = PeerStatusInfo {
            name: "laptop".to_string(),
            known_peer_info: KnownPeerInfo {
                alias: "desktop".to_string(),
                ip_addr: "10.66.0.2".to_string(),
                domain_name: "desktop".to_string(),
                allowed_using_as_exit_node: true,
                declined: false,
            },
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["Name"], "laptop");
        assert_eq!(json["KnownPeerInfo"]["IPAddr"], "10.66.0.2");
        assert_eq!(json["KnownPeerInfo"]["AllowedUsingAsExitNode"], true);
    }

    #[test]
    fn status_without_peer_info_decodes() {
        let status: PeerStatusInfo = serde_json::from_str(r#"{"Name":"old"}"#).unwrap();
        assert_eq!(status.name, "old");
        assert!(!status.known_peer_info.declined);
    }
}
