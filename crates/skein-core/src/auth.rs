//! Login credentials and authentication tokens

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::NodeName;

/// Name of the login procedure every node serves
pub const LOGIN_PROCEDURE: &str = "login";

/// Reply sent by the login procedure on success
pub const LOGIN_SUCCESS: &str = "Success";

/// One entry of a node's credential list
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Payload of a `login` invocation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(flatten)]
    pub credential: Credential,
    /// Name of the connecting node, used by the remote side for loop prevention
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<NodeName>,
}

/// Token attached to a socket once login succeeds.
///
/// Lives as long as the connection; never renewed or revoked.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub username: String,
    /// Name declared by the connecting node
    #[serde(default)]
    pub client_name: Option<NodeName>,
    /// Name of the node that accepted the login
    #[serde(default)]
    pub server_name: Option<NodeName>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_request_flattens_credential() {
        let req = LoginRequest {
            credential: Credential::new("kyle", "pw"),
            client_name: Some(NodeName::from("alpha")),
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["username"], "kyle");
        assert_eq!(value["password"], "pw");
        assert_eq!(value["client_name"], "alpha");
    }

    #[test]
    fn test_credential_debug_hides_password() {
        let debug = format!("{:?}", Credential::new("kyle", "secret"));
        assert!(!debug.contains("secret"));
    }
}
