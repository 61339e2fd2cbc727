//! Signers whose key lives with an out-of-process custodian
//!
//! A browser extension or hardware wallet cannot be called directly from the
//! orchestrator. Instead the [`CustodySigner`] forwards each message over a
//! channel as a [`SignRequest`] and waits for the custodian to answer.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::{RecoverableSignature, Signer, SignerError, SignerKind};
use crate::identity::Address;

/// A message waiting for the custodian's signature
#[derive(Debug)]
pub struct SignRequest {
    address: Address,
    message: Vec<u8>,
    respond_to: oneshot::Sender<Result<RecoverableSignature, SignerError>>,
}

impl SignRequest {
    /// Address the custodian is asked to sign for
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn message(&self) -> &[u8] {
        &self.message
    }

    /// Answer the request. Returns false if the requester has gone away.
    pub fn respond(self, result: Result<RecoverableSignature, SignerError>) -> bool {
        self.respond_to.send(result).is_ok()
    }
}

/// Signer that relays requests to a custodian over a channel
#[derive(Debug, Clone)]
pub struct CustodySigner {
    kind: SignerKind,
    address: Address,
    requests: mpsc::Sender<SignRequest>,
}

impl CustodySigner {
    pub fn new(
        kind: SignerKind,
        address: Address,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<SignRequest>) {
        let (requests, rx) = mpsc::channel(capacity);
        (
            Self {
                kind,
                address,
                requests,
            },
            rx,
        )
    }

    pub fn browser_extension(address: Address) -> (Self, mpsc::Receiver<SignRequest>) {
        Self::new(SignerKind::BrowserExtension, address, 8)
    }

    pub fn hardware_wallet(address: Address) -> (Self, mpsc::Receiver<SignRequest>) {
        // One prompt on the device at a time
        Self::new(SignerKind::HardwareWallet, address, 1)
    }
}

#[async_trait]
impl Signer for CustodySigner {
    fn address(&self) -> Address {
        self.address
    }

    fn kind(&self) -> SignerKind {
        self.kind
    }

    async fn sign_message(&self, message: &[u8]) -> Result<RecoverableSignature, SignerError> {
        let (respond_to, response) = oneshot::channel();
        let request = SignRequest {
            address: self.address,
            message: message.to_vec(),
            respond_to,
        };

        tracing::debug!(
            "Forwarding {} byte message to {} custodian",
            message.len(),
            self.kind.as_str()
        );

        self.requests.send(request).await.map_err(|_| {
            SignerError::Unavailable(format!("{} custodian is not listening", self.kind.as_str()))
        })?;

        response.await.map_err(|_| {
            SignerError::Unavailable(format!(
                "{} custodian dropped the request",
                self.kind.as_str()
            ))
        })?
    }
}
