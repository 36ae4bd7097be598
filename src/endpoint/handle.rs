//! Owned kernel message handle.
//!
//! A [`KernelHandle`] is created when an exec message is retained and is
//! consumed by exactly one [`KernelHandle::respond`] call, which answers the
//! message and releases it. A handle dropped without a response is denied and
//! released on drop so the originating process never stalls.

use std::fmt;
use std::sync::Arc;

use tracing::{error, warn};

use super::{EndpointError, EndpointSecurityApi, MessageToken};

/// A retained kernel message awaiting its single auth response.
pub struct KernelHandle {
    api: Arc<dyn EndpointSecurityApi>,
    token: MessageToken,
    released: bool,
}

impl KernelHandle {
    /// Take ownership of a retained message.
    pub fn new(api: Arc<dyn EndpointSecurityApi>, token: MessageToken) -> Self {
        Self {
            api,
            token,
            released: false,
        }
    }

    /// Provider token of the retained message.
    pub fn token(&self) -> MessageToken {
        self.token
    }

    /// Answer the message and release it.
    ///
    /// The message is released even when the provider rejects the answer.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::Respond`] if the provider rejects the answer.
    pub fn respond(mut self, allow: bool, cache: bool) -> Result<(), EndpointError> {
        self.released = true;
        let result = self.api.respond_auth_result(self.token, allow, cache);
        self.api.free_message(self.token);
        result
    }
}

impl Drop for KernelHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(token = self.token.0, "kernel handle dropped unanswered, denying");
        if let Err(e) = self.api.respond_auth_result(self.token, false, false) {
            error!(token = self.token.0, error = %e, "failed to deny dropped kernel handle");
        }
        self.api.free_message(self.token);
    }
}

// Manual Debug impl because the provider trait object doesn't implement Debug.
impl fmt::Debug for KernelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelHandle")
            .field("token", &self.token)
            .field("released", &self.released)
            .finish()
    }
}
