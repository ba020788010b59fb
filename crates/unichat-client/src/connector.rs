//! Hub transport capability.
//!
//! A [`HubConnector`] opens one transport to the hub and hands back a
//! [`HubLink`]: a pair of channels carrying text records. All protocol logic
//! stays in the core state machines; a link only moves text.

use std::future::Future;

use tokio::{sync::mpsc, task::AbortHandle};
use unichat_core::{Credential, TransportFailure};

/// Default capacity of link channels.
pub const DEFAULT_LINK_CAPACITY: usize = 64;

/// Opens hub transports.
pub trait HubConnector: Send + Sync + 'static {
    /// Open a transport to `url` presenting `credential`.
    ///
    /// # Errors
    ///
    /// - `TransportFailure::Unauthorized` if the hub refused the credential
    /// - `TransportFailure::Network` for anything else
    fn connect(
        &self,
        url: &str,
        credential: &Credential,
    ) -> impl Future<Output = Result<HubLink, TransportFailure>> + Send;
}

/// Channels of one open transport.
///
/// Dropping the link stops the task behind it.
#[derive(Debug)]
pub struct HubLink {
    /// Text to send to the hub.
    pub outgoing: mpsc::Sender<String>,
    /// Text received from the hub; an `Err` ends the transport.
    pub incoming: mpsc::Receiver<Result<String, TransportFailure>>,
    abort_handle: Option<AbortHandle>,
}

impl HubLink {
    /// Link over existing channels.
    pub fn new(
        outgoing: mpsc::Sender<String>,
        incoming: mpsc::Receiver<Result<String, TransportFailure>>,
    ) -> Self {
        Self { outgoing, incoming, abort_handle: None }
    }

    /// Abort `handle` when the link is dropped.
    #[must_use]
    pub fn with_abort(mut self, handle: AbortHandle) -> Self {
        self.abort_handle = Some(handle);
        self
    }

    /// Stop the transport task.
    pub fn stop(&self) {
        if let Some(handle) = &self.abort_handle {
            handle.abort();
        }
    }
}

impl Drop for HubLink {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Hub URL with the credential as the `access_token` query parameter.
pub fn hub_url(url: &str, credential: &Credential) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}access_token={}", encode_query_value(credential.access_token()))
}

fn encode_query_value(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}
