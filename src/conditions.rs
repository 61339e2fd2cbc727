//! Access control conditions
//!
//! Conditions are evaluated by the network, never locally. They gate two
//! things: a conditional signing action (the action checks them against the
//! delegate's proof before it signs) and decryption of data encrypted under
//! them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::Address;

/// Placeholder the network replaces with the authenticated address
pub const USER_ADDRESS: &str = ":userAddress";
pub const DEFAULT_CHAIN: &str = "ethereum";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConditionError {
    #[error("At least one access control condition is required")]
    Empty,

    #[error("Chain name is empty")]
    MissingChain,
}

/// How a condition's return value is compared
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnValueTest {
    pub comparator: String,
    pub value: String,
}

/// One EVM access control condition, in the network's JSON shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessControlCondition {
    #[serde(default = "default_condition_type")]
    pub condition_type: String,
    #[serde(default)]
    pub contract_address: String,
    #[serde(default)]
    pub standard_contract_type: String,
    pub chain: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub parameters: Vec<String>,
    pub return_value_test: ReturnValueTest,
}

fn default_condition_type() -> String {
    "evmBasic".to_string()
}

impl AccessControlCondition {
    /// The authenticated address holds at least `wei` native tokens
    pub fn min_balance(chain: impl Into<String>, wei: impl Into<String>) -> Self {
        Self {
            condition_type: default_condition_type(),
            contract_address: String::new(),
            standard_contract_type: String::new(),
            chain: chain.into(),
            method: "eth_getBalance".to_string(),
            parameters: vec![USER_ADDRESS.to_string(), "latest".to_string()],
            return_value_test: ReturnValueTest {
                comparator: ">=".to_string(),
                value: wei.into(),
            },
        }
    }

    /// The authenticated address is `address`
    pub fn wallet_address(chain: impl Into<String>, address: Address) -> Self {
        Self {
            condition_type: default_condition_type(),
            contract_address: String::new(),
            standard_contract_type: String::new(),
            chain: chain.into(),
            method: String::new(),
            parameters: vec![USER_ADDRESS.to_string()],
            return_value_test: ReturnValueTest {
                comparator: "=".to_string(),
                value: address.to_string(),
            },
        }
    }

    /// The address this condition pins the caller to, if it is an address check
    pub fn required_address(&self) -> Option<Address> {
        let pinned = self.method.is_empty()
            && self.parameters.len() == 1
            && self.parameters[0] == USER_ADDRESS
            && self.return_value_test.comparator == "=";
        if !pinned {
            return None;
        }
        self.return_value_test.value.parse().ok()
    }
}

/// Conditions plus the chain they are evaluated on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionGate {
    pub conditions: Vec<AccessControlCondition>,
    pub chain: String,
}

impl ConditionGate {
    pub fn new(
        conditions: Vec<AccessControlCondition>,
        chain: impl Into<String>,
    ) -> Result<Self, ConditionError> {
        let chain = chain.into();
        if conditions.is_empty() {
            return Err(ConditionError::Empty);
        }
        if chain.trim().is_empty() {
            return Err(ConditionError::MissingChain);
        }
        Ok(Self { conditions, chain })
    }

    /// Only `address` may pass
    pub fn for_address(address: Address) -> Self {
        Self {
            conditions: vec![AccessControlCondition::wallet_address(DEFAULT_CHAIN, address)],
            chain: DEFAULT_CHAIN.to_string(),
        }
    }
}

/// Ciphertext plus everything needed to ask for its decryption
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedData {
    /// Base64 ciphertext
    pub ciphertext: String,
    /// Hex hash of the plaintext; also names the decryption resource
    pub data_to_encrypt_hash: String,
    pub access_control_conditions: Vec<AccessControlCondition>,
    pub chain: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> Address {
        "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf".parse().unwrap()
    }

    #[test]
    fn test_min_balance_wire_shape() {
        let json = serde_json::to_value(AccessControlCondition::min_balance("ethereum", "1")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "conditionType": "evmBasic",
                "contractAddress": "",
                "standardContractType": "",
                "chain": "ethereum",
                "method": "eth_getBalance",
                "parameters": [":userAddress", "latest"],
                "returnValueTest": { "comparator": ">=", "value": "1" }
            })
        );
    }

    #[test]
    fn test_condition_defaults_when_parsing() {
        let condition: AccessControlCondition = serde_json::from_value(serde_json::json!({
            "chain": "ethereum",
            "returnValueTest": { "comparator": "=", "value": "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf" },
            "parameters": [":userAddress"]
        }))
        .unwrap();
        assert_eq!(condition.condition_type, "evmBasic");
        assert_eq!(condition.required_address(), Some(address()));
    }

    #[test]
    fn test_required_address_only_for_address_checks() {
        let pinned = AccessControlCondition::wallet_address("ethereum", address());
        assert_eq!(pinned.required_address(), Some(address()));
        assert_eq!(
            AccessControlCondition::min_balance("ethereum", "1").required_address(),
            None
        );
    }

    #[test]
    fn test_gate_rejects_empty_input() {
        assert_eq!(
            ConditionGate::new(Vec::new(), "ethereum"),
            Err(ConditionError::Empty)
        );
        assert_eq!(
            ConditionGate::new(
                vec![AccessControlCondition::min_balance("ethereum", "1")],
                " "
            ),
            Err(ConditionError::MissingChain)
        );

        let gate = ConditionGate::for_address(address());
        assert_eq!(gate.chain, DEFAULT_CHAIN);
        assert_eq!(gate.conditions[0].required_address(), Some(address()));
    }
}
