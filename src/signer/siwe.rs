//! Sign-in-with-Ethereum messages carrying ReCap capability resources
//!
//! Both the session authorization and the capacity delegation are proven by a
//! personal signature over an EIP-4361 message. The capabilities being granted
//! are encoded as a `urn:recap:` resource and echoed in the statement so the
//! signer can read what they are approving.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::capability::Scope;
use crate::identity::Address;

pub const DEFAULT_DOMAIN: &str = "localhost";
const RECAP_PREFIX: &str = "urn:recap:";
const RECAP_STATEMENT: &str =
    "I further authorize the stated URI to perform the following actions on my behalf:";

/// ReCap attenuations: resource URI -> "namespace/name" -> caveats
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recap {
    pub att: BTreeMap<String, BTreeMap<String, Vec<Value>>>,
    #[serde(default)]
    pub prf: Vec<String>,
}

impl Recap {
    pub fn add(&mut self, resource: impl Into<String>, namespace: &str, name: &str, caveat: Value) {
        self.att
            .entry(resource.into())
            .or_default()
            .entry(format!("{}/{}", namespace, name))
            .or_default()
            .push(caveat);
    }

    pub fn from_scope(scope: &Scope) -> Self {
        let mut recap = Recap::default();
        for request in scope.iter() {
            let (namespace, name) = request.ability.recap();
            let key = format!("{}/{}", namespace, name);
            let abilities = recap.att.entry(request.resource.uri()).or_default();
            // Same ReCap ability can back several abilities (both signings)
            abilities
                .entry(key)
                .or_insert_with(|| vec![Value::Object(Default::default())]);
        }
        recap
    }

    /// Human-readable statement listing every granted action
    pub fn statement(&self) -> String {
        let mut items = Vec::new();
        for (resource, abilities) in &self.att {
            let mut by_namespace: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
            for key in abilities.keys() {
                let (namespace, name) = key.split_once('/').unwrap_or((key.as_str(), ""));
                by_namespace.entry(namespace).or_default().push(name);
            }
            for (namespace, names) in by_namespace {
                let names: Vec<String> = names.iter().map(|n| format!("'{}'", n)).collect();
                items.push(format!(
                    "'{}': {} for '{}'.",
                    namespace,
                    names.join(", "),
                    resource
                ));
            }
        }

        let numbered: Vec<String> = items
            .iter()
            .enumerate()
            .map(|(i, item)| format!("({}) {}", i + 1, item))
            .collect();
        format!("{} {}", RECAP_STATEMENT, numbered.join(" "))
    }

    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        format!("{}{}", RECAP_PREFIX, URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(resource: &str) -> Option<Self> {
        let encoded = resource.strip_prefix(RECAP_PREFIX)?;
        let json = URL_SAFE_NO_PAD.decode(encoded).ok()?;
        serde_json::from_slice(&json).ok()
    }
}

/// An EIP-4361 message
#[derive(Debug, Clone, PartialEq)]
pub struct SiweMessage {
    pub domain: String,
    pub address: Address,
    pub statement: Option<String>,
    pub uri: String,
    pub chain_id: u64,
    pub nonce: String,
    pub issued_at: DateTime<Utc>,
    pub expiration_time: DateTime<Utc>,
    pub resources: Vec<String>,
}

impl SiweMessage {
    pub fn new(
        address: Address,
        uri: impl Into<String>,
        nonce: impl Into<String>,
        issued_at: DateTime<Utc>,
        expiration_time: DateTime<Utc>,
    ) -> Self {
        Self {
            domain: DEFAULT_DOMAIN.to_string(),
            address,
            statement: None,
            uri: uri.into(),
            chain_id: 1,
            nonce: nonce.into(),
            issued_at,
            expiration_time,
            resources: Vec::new(),
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Attach a recap resource and its statement
    pub fn with_recap(mut self, recap: &Recap) -> Self {
        let statement = recap.statement();
        self.statement = Some(match self.statement.take() {
            Some(existing) => format!("{} {}", existing, statement),
            None => statement,
        });
        self.resources.push(recap.encode());
        self
    }

    /// Message authorizing a session over `scope`
    pub fn with_scope(self, scope: &Scope) -> Self {
        self.with_recap(&Recap::from_scope(scope))
    }

    /// Message delegating a capacity credit to `delegatees`
    pub fn with_capacity_delegation(self, token_id: &str, delegatees: &[Address], uses: u32) -> Self {
        let mut recap = Recap::default();
        let delegate_to: Vec<String> = delegatees.iter().map(|a| a.to_hex_unprefixed()).collect();
        recap.add(
            format!("lit-ratelimitincrease://{}", token_id),
            "Auth",
            "Auth",
            serde_json::json!({
                "nft_id": [token_id],
                "uses": uses.to_string(),
                "delegate_to": delegate_to,
            }),
        );
        self.with_recap(&recap)
    }

    /// Recaps carried in the resources list
    pub fn recaps(&self) -> Vec<Recap> {
        self.resources.iter().filter_map(|r| Recap::decode(r)).collect()
    }

    pub fn render(&self) -> String {
        let mut out = format!(
            "{} wants you to sign in with your Ethereum account:\n{}\n\n",
            self.domain, self.address
        );
        if let Some(statement) = &self.statement {
            out.push_str(statement);
            out.push_str("\n\n");
        }
        out.push_str(&format!("URI: {}\n", self.uri));
        out.push_str("Version: 1\n");
        out.push_str(&format!("Chain ID: {}\n", self.chain_id));
        out.push_str(&format!("Nonce: {}\n", self.nonce));
        out.push_str(&format!(
            "Issued At: {}\n",
            self.issued_at.to_rfc3339_opts(SecondsFormat::Millis, true)
        ));
        out.push_str(&format!(
            "Expiration Time: {}",
            self.expiration_time
                .to_rfc3339_opts(SecondsFormat::Millis, true)
        ));
        if !self.resources.is_empty() {
            out.push_str("\nResources:");
            for resource in &self.resources {
                out.push_str(&format!("\n- {}", resource));
            }
        }
        out
    }

    /// Pull the nonce and recap resources back out of a rendered message
    pub fn parse_fields(message: &str) -> (Option<String>, Vec<Recap>) {
        let nonce = message
            .lines()
            .find_map(|line| line.strip_prefix("Nonce: "))
            .map(str::to_string);
        let recaps = message
            .lines()
            .filter_map(|line| line.strip_prefix("- "))
            .filter_map(Recap::decode)
            .collect();
        (nonce, recaps)
    }
}

impl std::fmt::Display for SiweMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{ResourceAbilityRequest, WILDCARD};
    use chrono::TimeZone;

    fn address() -> Address {
        "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf".parse().unwrap()
    }

    fn times() -> (DateTime<Utc>, DateTime<Utc>) {
        let issued = Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap();
        (issued, issued + chrono::Duration::hours(24))
    }

    #[test]
    fn test_render_layout() {
        let (issued, expires) = times();
        let message = SiweMessage::new(address(), "lit:session:abc", "0xblock", issued, expires)
            .with_scope(&Scope::signing_and_execution())
            .render();

        let lines: Vec<&str> = message.lines().collect();
        assert_eq!(
            lines[0],
            "localhost wants you to sign in with your Ethereum account:"
        );
        assert_eq!(lines[1], "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf");
        assert_eq!(lines[2], "");
        assert!(lines[3].starts_with(RECAP_STATEMENT));
        assert!(message.contains("URI: lit:session:abc\n"));
        assert!(message.contains("Nonce: 0xblock\n"));
        assert!(message.contains("Issued At: 2026-01-10T12:00:00.000Z\n"));
        assert!(message.contains("Expiration Time: 2026-01-11T12:00:00.000Z"));
        assert!(message.contains("\nResources:\n- urn:recap:"));
    }

    #[test]
    fn test_scope_statement_lists_abilities() {
        let recap = Recap::from_scope(&Scope::signing_and_execution());
        let statement = recap.statement();
        assert!(statement.contains("'Threshold': 'Execution' for 'lit-litaction://*'."));
        assert!(statement.contains("'Threshold': 'Signing' for 'lit-pkp://*'."));
        assert!(statement.contains("(1)"));
        assert!(statement.contains("(2)"));
    }

    #[test]
    fn test_recap_encode_decode() {
        let scope: Scope = vec![ResourceAbilityRequest::lit_action_execution(WILDCARD)].into();
        let recap = Recap::from_scope(&scope);
        let decoded = Recap::decode(&recap.encode()).unwrap();
        assert_eq!(decoded, recap);
        assert!(decoded.att.contains_key("lit-litaction://*"));
        assert!(Recap::decode("urn:other:xyz").is_none());
    }

    #[test]
    fn test_capacity_delegation_caveats() {
        let (issued, expires) = times();
        let delegatee = address();
        let message = SiweMessage::new(address(), "lit:capability:delegation", "n", issued, expires)
            .with_capacity_delegation("42", &[delegatee], 1);

        let recaps = message.recaps();
        assert_eq!(recaps.len(), 1);
        let caveats = &recaps[0].att["lit-ratelimitincrease://42"]["Auth/Auth"];
        assert_eq!(caveats[0]["nft_id"][0], "42");
        assert_eq!(caveats[0]["uses"], "1");
        assert_eq!(
            caveats[0]["delegate_to"][0],
            "7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
    }

    #[test]
    fn test_parse_fields_from_rendered() {
        let (issued, expires) = times();
        let message = SiweMessage::new(address(), "lit:session:abc", "0xnonce", issued, expires)
            .with_scope(&Scope::signing_and_execution());

        let (nonce, recaps) = SiweMessage::parse_fields(&message.render());
        assert_eq!(nonce.as_deref(), Some("0xnonce"));
        assert_eq!(recaps, vec![Recap::from_scope(&Scope::signing_and_execution())]);
    }
}
