//! Login records returned by the secret store

use std::fmt;

use serde::Deserialize;
use zeroize::Zeroizing;

/// A candidate credential for a host
#[derive(Clone)]
pub struct LoginRecord {
    pub id: String,
    pub username: String,
    pub secret: Zeroizing<String>,
    /// URIs attached to the record, in vault order
    pub uris: Vec<String>,
}

impl LoginRecord {
    pub fn new(
        id: impl Into<String>,
        username: impl Into<String>,
        secret: impl Into<String>,
        uris: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            secret: Zeroizing::new(secret.into()),
            uris,
        }
    }
}

impl fmt::Debug for LoginRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRecord")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("uris", &self.uris)
            .finish()
    }
}

// Shape of `bw list items` output
#[derive(Deserialize)]
struct BwItem {
    id: String,
    #[serde(default)]
    login: Option<BwLogin>,
}

#[derive(Deserialize)]
struct BwLogin {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    uris: Option<Vec<BwUri>>,
}

#[derive(Deserialize)]
struct BwUri {
    #[serde(default)]
    uri: Option<String>,
}

/// Decode the JSON array printed by `bw list items`. Items without a login
/// section (notes, cards, identities) are dropped.
pub fn parse_bw_items(json: &[u8]) -> Result<Vec<LoginRecord>, serde_json::Error> {
    let items: Vec<BwItem> = serde_json::from_slice(json)?;

    Ok(items
        .into_iter()
        .filter_map(|item| {
            let login = item.login?;
            Some(LoginRecord {
                id: item.id,
                username: login.username.unwrap_or_default(),
                secret: Zeroizing::new(login.password.unwrap_or_default()),
                uris: login
                    .uris
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|u| u.uri)
                    .collect(),
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bw_items() {
        let json = br#"[
            {
                "id": "1",
                "name": "web01",
                "login": {
                    "username": "alice",
                    "password": "p1",
                    "uris": [{"match": null, "uri": "https://web01"}, {"uri": "ssh://web01:2222"}]
                }
            },
            {"id": "2", "name": "note", "login": null, "notes": "text"},
            {"id": "3", "login": {"username": null, "password": "p3", "uris": null}}
        ]"#;

        let records = parse_bw_items(json).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "1");
        assert_eq!(records[0].username, "alice");
        assert_eq!(records[0].secret.as_str(), "p1");
        assert_eq!(records[0].uris, vec!["https://web01", "ssh://web01:2222"]);
        assert_eq!(records[1].username, "");
        assert!(records[1].uris.is_empty());
    }

    #[test]
    fn test_parse_rejects_non_array() {
        assert!(parse_bw_items(b"{\"id\": \"1\"}").is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let record = LoginRecord::new("1", "alice", "hunter2", vec![]);
        let rendered = format!("{:?}", record);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
